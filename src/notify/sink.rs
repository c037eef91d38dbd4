use async_trait::async_trait;
use thiserror::Error;

use crate::bot::telegram::{TelegramApi, TelegramError};
use crate::subscription::SubscriberId;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("chat transport rejected the message: {0}")]
    Rejected(String),
    #[error("chat transport unavailable: {0}")]
    Transport(String),
}

impl From<TelegramError> for DeliveryError {
    fn from(error: TelegramError) -> Self {
        match error {
            TelegramError::Api { .. } => Self::Rejected(error.to_string()),
            other => Self::Transport(other.to_string()),
        }
    }
}

/// Outbound side of the chat transport. Callers log and drop failures.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_notification(
        &self,
        subscriber_id: SubscriberId,
        text: &str,
    ) -> Result<(), DeliveryError>;
}

pub struct StdoutNotifier;

#[async_trait]
impl Notifier for StdoutNotifier {
    async fn send_notification(
        &self,
        subscriber_id: SubscriberId,
        text: &str,
    ) -> Result<(), DeliveryError> {
        println!("[{subscriber_id}] {text}");
        Ok(())
    }
}

// sendMessage rejects texts over 4096 characters; stay under it with room for
// characters that count double in UTF-16.
const MESSAGE_CHAR_LIMIT: usize = 4000;

pub struct TelegramNotifier {
    api: TelegramApi,
}

impl TelegramNotifier {
    pub fn new(api: TelegramApi) -> Self {
        Self { api }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send_notification(
        &self,
        subscriber_id: SubscriberId,
        text: &str,
    ) -> Result<(), DeliveryError> {
        for chunk in split_message(text, MESSAGE_CHAR_LIMIT) {
            self.api.send_message(subscriber_id.0, &chunk).await?;
        }
        Ok(())
    }
}

/// Splits `text` into chunks of at most `limit` characters, breaking between
/// lines where possible and inside a line only when it alone exceeds `limit`.
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;
    let mut started = false;

    for line in text.split('\n') {
        for piece in line_pieces(line, limit) {
            let piece_len = piece.chars().count();
            if started && current_len + 1 + piece_len > limit {
                chunks.push(std::mem::take(&mut current));
                current_len = 0;
                started = false;
            }
            if started {
                current.push('\n');
                current_len += 1;
            }
            current.push_str(piece);
            current_len += piece_len;
            started = true;
        }
    }
    if started {
        chunks.push(current);
    }
    chunks
}

fn line_pieces(line: &str, limit: usize) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut start = 0;
    for (count, (idx, _)) in line.char_indices().enumerate() {
        if count > 0 && count % limit == 0 {
            pieces.push(&line[start..idx]);
            start = idx;
        }
    }
    pieces.push(&line[start..]);
    pieces
}
