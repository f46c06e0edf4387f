//! Line-oriented console: `<chat-id-prefix> <text>` sends a message.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};

use tandem_core::{Message, UniqId};
use tandem_services::ChatDirectory;

/// Split a console line into chat prefix and message text.
pub fn parse_line(line: &str) -> Option<(&str, &str)> {
    let (prefix, text) = line.trim().split_once(char::is_whitespace)?;
    let text = text.trim();
    if prefix.is_empty() || text.is_empty() || !prefix.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some((prefix, text))
}

/// Read stdin until EOF, sending every well-formed line.
pub async fn run(directory: Arc<ChatDirectory>, own_id: UniqId) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let Some((prefix, text)) = parse_line(&line) else {
            tracing::warn!("expected `<chat-id-prefix> <text>`");
            continue;
        };
        let Some(chat) = directory.chat_by_prefix(prefix) else {
            tracing::warn!(prefix, "no single chat matches");
            continue;
        };
        match chat.send_message(Message::text(own_id, text)).await {
            Ok(status) => tracing::info!(chat = %chat.id().short(), ?status, "sent"),
            Err(e) => tracing::warn!(chat = %chat.id().short(), error = %e, "send failed"),
        }
    }
    Ok(())
}
