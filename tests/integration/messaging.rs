use tandem_core::{FlowId, MessageStatus};
use tandem_services::{BlobStore, ChatState, Dht, CHUNK_CAPACITY};

use crate::*;

/// Both peers online: the message is delivered directly and mirrored into
/// the receiver's flow.
#[tokio::test]
async fn test_online_peers_get_delivered() -> Result<()> {
    let net = MemoryNetwork::new();
    let a = spawn_node(&net).await?;
    let b = spawn_node(&net).await?;
    a.dht.connect_to(b.id, b.addr).await;
    let mut events = b.directory.subscribe();

    let chat_id = UniqId::random();
    let chat = a.directory.open_chat(chat_id, b.id)?;
    chat.synchronize().await?;

    let message = Message::text(a.id, "hello from A");
    assert_eq!(chat.send_message(message.clone()).await?, MessageStatus::Delivered);

    let (chat_seen, from, received) = next_message(&mut events, Duration::from_secs(2)).await?;
    assert_eq!((chat_seen, from), (chat_id, a.id));
    assert_eq!(received, message);

    let on_b = b.directory.chat(&chat_id).context("chat not opened on B")?;
    assert_eq!(on_b.state().await, ChatState::Ready);
    let own = on_b.own_flow().await.context("B has no own flow")?;
    assert_eq!(own.last_messages(10).await, vec![message]);

    // The sender's flow was persisted as well.
    assert!(a.store.contains(&FlowId::new(chat_id, b.id).key()));
    Ok(())
}

/// The conversation works in both directions over the same chat.
#[tokio::test]
async fn test_reply_uses_the_same_chat() -> Result<()> {
    let net = MemoryNetwork::new();
    let a = spawn_node(&net).await?;
    let b = spawn_node(&net).await?;
    a.dht.connect_to(b.id, b.addr).await;
    let mut a_events = a.directory.subscribe();
    let mut b_events = b.directory.subscribe();

    let chat_id = UniqId::random();
    let chat_a = a.directory.open_chat(chat_id, b.id)?;
    chat_a.synchronize().await?;
    chat_a.send_message(Message::text(a.id, "ping")).await?;
    next_message(&mut b_events, Duration::from_secs(2)).await?;

    let chat_b = b.directory.chat(&chat_id).context("chat not opened on B")?;
    let reply = Message::text(b.id, "pong");
    assert_eq!(chat_b.send_message(reply.clone()).await?, MessageStatus::Delivered);

    let (_, from, received) = next_message(&mut a_events, Duration::from_secs(2)).await?;
    assert_eq!(from, b.id);
    assert_eq!(received, reply);
    assert_eq!(a.directory.chats().len(), 1);
    Ok(())
}

/// Receiver offline: the message is parked in the DHT (SENT) and picked up
/// by the receiver's first synchronize.
#[tokio::test]
async fn test_offline_peer_picks_up_after_synchronize() -> Result<()> {
    let net = MemoryNetwork::new();
    let relay = spawn_node(&net).await?;
    let a = spawn_node(&net).await?;
    a.dht.connect_to(relay.id, relay.addr).await;

    let b_id = UniqId::random();
    let chat_id = UniqId::random();
    let chat = a.directory.open_chat(chat_id, b_id)?;
    chat.synchronize().await?;

    let total = CHUNK_CAPACITY + 5;
    let mut sent = Vec::new();
    for i in 0..total {
        let message = Message::text(a.id, format!("offline {i}"));
        assert_eq!(chat.send_message(message.clone()).await?, MessageStatus::Sent);
        sent.push(message);
    }

    // B comes online later, knowing only the relay.
    let b = spawn_node_on(net.transport(), None, b_id).await?;
    b.dht.connect_to(relay.id, relay.addr).await;
    let chat_b = b.directory.open_chat(chat_id, a.id)?;
    chat_b.synchronize().await?;

    let own = chat_b.own_flow().await.context("B has no own flow")?;
    assert_eq!(own.len().await, total);
    assert_eq!(own.last_messages(total).await, sent);
    Ok(())
}

/// Nobody reachable and no DHT peers: ERROR, but the message is kept.
#[tokio::test]
async fn test_isolated_node_reports_error() -> Result<()> {
    let net = MemoryNetwork::new();
    let a = spawn_node(&net).await?;
    let chat = a.directory.open_chat(UniqId::random(), UniqId::random())?;
    chat.synchronize().await?;

    let message = Message::text(a.id, "into the void");
    assert_eq!(chat.send_message(message.clone()).await?, MessageStatus::Error);
    let other = chat.other_flow().await.context("no other flow")?;
    assert_eq!(other.tail().await, vec![message]);
    Ok(())
}

/// Peer known but gone: direct send fails and the relay still takes it.
#[tokio::test]
async fn test_stopped_peer_falls_back_to_relay() -> Result<()> {
    let net = MemoryNetwork::new();
    let relay = spawn_node(&net).await?;
    let a = spawn_node(&net).await?;
    let b = spawn_node(&net).await?;
    a.dht.connect_to(relay.id, relay.addr).await;
    a.dht.connect_to(b.id, b.addr).await;
    b.stop().await;

    let chat = a.directory.open_chat(UniqId::random(), b.id)?;
    chat.synchronize().await?;
    assert_eq!(
        chat.send_message(Message::text(a.id, "later")).await?,
        MessageStatus::Sent
    );
    Ok(())
}

/// Sending before synchronize is refused.
#[tokio::test]
async fn test_send_requires_synchronize() -> Result<()> {
    let net = MemoryNetwork::new();
    let a = spawn_node(&net).await?;
    let chat = a.directory.open_chat(UniqId::random(), UniqId::random())?;
    assert!(chat.send_message(Message::text(a.id, "early")).await.is_err());
    assert!(chat.other_flow().await.is_none());
    Ok(())
}
