use tandem_services::Dht;

use crate::*;

/// Addresses propagate through an intermediate node.
#[tokio::test]
async fn test_find_through_relay() -> Result<()> {
    let net = MemoryNetwork::new();
    let relay = spawn_node(&net).await?;
    let a = spawn_node(&net).await?;
    let b = spawn_node(&net).await?;

    a.dht.connect_to(relay.id, relay.addr).await;
    b.dht.connect_to(relay.id, relay.addr).await;

    assert_eq!(a.dht.find(b.id).await, Some(b.addr));
    assert_eq!(b.dht.find(a.id).await, Some(a.addr));
    assert_eq!(a.dht.find(UniqId::random()).await, None);
    Ok(())
}

/// Data stored while a node is unknown can be fetched once it joins.
#[tokio::test]
async fn test_store_then_late_retrieve() -> Result<()> {
    let net = MemoryNetwork::new();
    let relay = spawn_node(&net).await?;
    let a = spawn_node(&net).await?;
    a.dht.connect_to(relay.id, relay.addr).await;

    assert!(a.dht.store("flow-key", b"record".to_vec()).await);
    a.stop().await;

    let late = spawn_node(&net).await?;
    late.dht.connect_to(relay.id, relay.addr).await;
    assert_eq!(late.dht.retrieve("flow-key").await, Some(b"record".to_vec()));
    assert_eq!(late.dht.retrieve("other-key").await, None);
    Ok(())
}

/// A newer value stored by a peer wins over a stale local replica.
#[tokio::test]
async fn test_retrieve_prefers_peers() -> Result<()> {
    let net = MemoryNetwork::new();
    let a = spawn_node(&net).await?;
    let b = spawn_node(&net).await?;
    a.dht.connect_to(b.id, b.addr).await;

    assert!(a.dht.store("k", b"v1".to_vec()).await);
    assert!(b.dht.store("k", b"v2".to_vec()).await);
    assert_eq!(a.dht.retrieve("k").await, Some(b"v2".to_vec()));
    Ok(())
}
