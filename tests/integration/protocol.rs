use std::sync::atomic::{AtomicUsize, Ordering};

use tandem_core::Envelope;
use tandem_services::Replier;

use crate::*;

async fn engine(net: &Arc<MemoryNetwork>) -> Result<(Arc<NetworkService>, SocketAddr)> {
    let network = NetworkService::new(net.transport(), REQUEST_TIMEOUT);
    let addr = network.start(None).await?;
    Ok((network, addr))
}

/// POST resolves true once the receiver approves, false when nobody listens.
#[tokio::test]
async fn test_post_approved_iff_peer_online() -> Result<()> {
    let net = MemoryNetwork::new();
    let (a, _) = engine(&net).await?;
    let (b, b_addr) = engine(&net).await?;

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    b.register_handler(
        "Chat",
        Arc::new(move |_: &Envelope, _: &Replier| {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    );

    assert!(a.send_post(b_addr, "Chat", "hi", None).await);
    assert_eq!(seen.load(Ordering::SeqCst), 1);

    // Unhandled tags are still approved.
    assert!(a.send_post(b_addr, "Unknown", "hi", None).await);

    b.stop().await;
    assert!(!a.send_post(b_addr, "Chat", "hi", None).await);
    assert_eq!(a.pending_waiters(), 0);
    Ok(())
}

/// Many concurrent GETs against an echo handler each get their own answer.
#[tokio::test]
async fn test_concurrent_gets_are_correlated() -> Result<()> {
    let net = MemoryNetwork::new();
    let (a, _) = engine(&net).await?;
    let (b, b_addr) = engine(&net).await?;
    b.register_handler(
        "Echo",
        Arc::new(|e: &Envelope, r: &Replier| r.respond(e, format!("re:{}", e.data))),
    );

    let requests = (0..50).map(|i| {
        let a = a.clone();
        tokio::spawn(async move { (i, a.send_get(b_addr, "Echo", i.to_string(), None).await) })
    });
    for handle in requests.collect::<Vec<_>>() {
        let (i, answer) = handle.await?;
        assert_eq!(answer, Some(format!("re:{i}")));
    }
    assert_eq!(a.pending_waiters(), 0);
    Ok(())
}

/// A GET nobody answers times out and leaves no waiter behind.
#[tokio::test]
async fn test_unanswered_get_times_out() -> Result<()> {
    let net = MemoryNetwork::new();
    let (a, _) = engine(&net).await?;
    let (_b, b_addr) = engine(&net).await?;

    let started = tokio::time::Instant::now();
    let answer = a
        .send_get(b_addr, "Silent", "", Some(Duration::from_millis(100)))
        .await;
    assert!(answer.is_none());
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(a.pending_waiters(), 0);
    Ok(())
}

/// Several handlers on one tag all run and the POST is approved once.
#[tokio::test]
async fn test_every_handler_sees_the_request() -> Result<()> {
    let net = MemoryNetwork::new();
    let (a, _) = engine(&net).await?;
    let (b, b_addr) = engine(&net).await?;

    let seen = Arc::new(AtomicUsize::new(0));
    for _ in 0..3 {
        let counter = seen.clone();
        b.register_handler(
            "Chat",
            Arc::new(move |_: &Envelope, _: &Replier| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
    }
    let before = net.delivered();
    assert!(a.send_post(b_addr, "Chat", "x", None).await);
    assert_eq!(seen.load(Ordering::SeqCst), 3);

    // One POST and one APPROVE crossed the network.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(net.delivered() - before, 2);
    Ok(())
}
