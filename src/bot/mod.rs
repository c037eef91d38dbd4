pub mod commands;
pub mod polling;
pub mod telegram;

use tracing::warn;

use crate::subscription::SubscriberId;
use crate::watch::WatchScheduler;

pub use commands::{handle_message, parse_command, BotCommand, CommandParseError};
pub use polling::run_polling;
pub use telegram::{TelegramApi, TelegramError, Update};

/// Dispatches one inbound update and sends the reply back to the same chat.
/// Updates without a text message are ignored.
pub async fn handle_update(api: &TelegramApi, scheduler: &WatchScheduler, update: &Update) {
    let Some((chat_id, text)) = update.text_message() else {
        return;
    };
    let reply = handle_message(scheduler, SubscriberId(chat_id), text);
    if let Err(err) = api.send_message(chat_id, &reply).await {
        warn!(chat = chat_id, update = update.update_id, "failed sending reply: {err}");
    }
}
