use tandem_core::invite::{decode_invite, encode_invite};
use tandem_core::MessageStatus;
use tandem_services::{Dht, TcpTransport};

use crate::*;

async fn tcp_node() -> Result<Node> {
    let transport = Arc::new(TcpTransport::new(None));
    spawn_node_on(transport, Some("127.0.0.1:0".parse()?), UniqId::random()).await
}

fn invite_of(node: &Node) -> Result<String> {
    match node.addr {
        SocketAddr::V4(v4) => Ok(encode_invite(v4)),
        SocketAddr::V6(_) => bail!("tcp node advertised an IPv6 address"),
    }
}

/// Two nodes on loopback TCP, introduced by invite code, exchange a message.
#[tokio::test]
async fn test_chat_over_loopback_tcp() -> Result<()> {
    let a = tcp_node().await?;
    let b = tcp_node().await?;
    let mut events = b.directory.subscribe();

    let b_addr = decode_invite(&invite_of(&b)?)?;
    a.dht.connect_to(b.id, SocketAddr::V4(b_addr)).await;
    assert_eq!(b.dht.find(a.id).await, Some(a.addr));

    let chat = a.directory.open_chat(UniqId::random(), b.id)?;
    chat.synchronize().await?;
    let message = Message::text(a.id, "over tcp");
    assert_eq!(chat.send_message(message.clone()).await?, MessageStatus::Delivered);

    let (_, from, received) = next_message(&mut events, Duration::from_secs(2)).await?;
    assert_eq!(from, a.id);
    assert_eq!(received, message);

    a.stop().await;
    b.stop().await;
    Ok(())
}

/// A stopped TCP node is not reachable and requests fail fast.
#[tokio::test]
async fn test_stopped_tcp_node_is_unreachable() -> Result<()> {
    let a = tcp_node().await?;
    let b = tcp_node().await?;
    let b_addr = b.addr;
    b.stop().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = tokio::time::Instant::now();
    assert!(!a.network.send_post(b_addr, "Chat", "x", Some(Duration::from_secs(3))).await);
    assert!(started.elapsed() < Duration::from_secs(3));
    Ok(())
}
