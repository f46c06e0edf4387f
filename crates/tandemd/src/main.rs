//! tandemd — tandem peer-to-peer messenger daemon.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};

use tandem_core::config::{StorageBackend, TandemConfig};
use tandem_core::invite::{decode_invite, encode_invite};
use tandem_core::UniqId;
use tandem_services::{
    BlobStore, ChatDirectory, ChatEvent, DhtChatManager, Dht, DiskStore, MemoryStore,
    NetworkService, PeerDht, TcpTransport,
};

mod console;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = TandemConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = TandemConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        TandemConfig::default()
    });

    let own_id = if config.identity.user_id.is_empty() {
        let id = UniqId::random();
        tracing::warn!(user_id = %id, "no identity configured, generated a fresh one");
        id
    } else {
        config
            .identity
            .user_id
            .parse()
            .context("invalid identity.user_id")?
    };

    // Storage
    let store: Arc<dyn BlobStore> = match config.storage.backend {
        StorageBackend::Memory => Arc::new(MemoryStore::new()),
        StorageBackend::Disk => {
            let disk = DiskStore::new(&config.storage.path)?;
            tracing::info!(blobs = disk.count(), bytes = disk.size(), "disk store opened");
            Arc::new(disk)
        }
    };
    tracing::info!(
        backend = ?config.storage.backend,
        path = %config.storage.path.display(),
        "storage ready"
    );

    // Network
    let transport = Arc::new(TcpTransport::new(config.network.advertise_address));
    let network = NetworkService::new(transport, config.network.request_timeout());
    let bind = SocketAddr::new(config.network.bind_address, config.network.port);
    let addr = network
        .start(Some(bind))
        .await
        .with_context(|| format!("failed to start network on {bind}"))?;
    let invite = match addr {
        SocketAddr::V4(v4) => encode_invite(v4),
        SocketAddr::V6(_) => anyhow::bail!("advertised address must be IPv4, got {addr}"),
    };
    tracing::info!(user_id = %own_id, %addr, invite = %invite, "tandemd ready");

    let dht = PeerDht::new(own_id, network.clone());
    let manager = DhtChatManager::new(own_id, dht.clone(), store, network.clone());
    let directory = ChatDirectory::new(manager, network.clone());

    // Bootstrap peers
    for peer in &config.peers {
        let id: UniqId = match peer.user_id.parse() {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(user_id = %peer.user_id, error = %e, "skipping peer with bad id");
                continue;
            }
        };
        match decode_invite(&peer.invite) {
            Ok(peer_addr) => dht.connect_to(id, SocketAddr::V4(peer_addr)).await,
            Err(e) => tracing::warn!(peer = %id.short(), error = %e, "skipping peer with bad invite"),
        }
    }

    // Chats
    for chat in &config.chats {
        let (id, peer) = match (chat.id.parse::<UniqId>(), chat.peer.parse::<UniqId>()) {
            (Ok(id), Ok(peer)) => (id, peer),
            _ => {
                tracing::warn!(chat = %chat.id, "skipping chat with bad ids");
                continue;
            }
        };
        directory.open_chat(id, peer)?;
    }
    for (chat, e) in directory.synchronize().await {
        tracing::warn!(chat = %chat.short(), error = %e, "initial synchronize failed");
    }
    tracing::info!(chats = directory.chats().len(), peers = dht.known_peers(), "startup complete");

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let event_task = {
        let mut events = directory.subscribe();
        tokio::spawn(async move {
            use tokio::sync::broadcast::error::RecvError;
            loop {
                match events.recv().await {
                    Ok(ChatEvent::MessageReceived {
                        chat,
                        from,
                        message,
                    }) => tracing::info!(
                        chat = %chat.short(),
                        from = %from.short(),
                        text = %message.text,
                        "message received"
                    ),
                    Err(RecvError::Lagged(n)) => tracing::warn!(skipped = n, "event stream lagged"),
                    Err(RecvError::Closed) => break,
                }
            }
        })
    };

    let console_task = tokio::spawn(console::run(directory.clone(), own_id));

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv() => tracing::info!("shutting down"),
        r = event_task         => tracing::error!("event task exited: {:?}", r),
        r = console_task       => tracing::info!("console closed: {:?}", r),
    }

    directory.close();
    dht.close();
    network.stop().await;
    Ok(())
}
