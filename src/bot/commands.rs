use thiserror::Error;
use tracing::{info, warn};

use crate::snapshot::Field;
use crate::subscription::{Secret, SubscriberId, WatchState};
use crate::watch::WatchScheduler;

pub const WELCOME_TEXT: &str = "Welcome! I watch your student portal dashboard and message you \
when something changes.\n\
Send /subscribe <username> <password> to start monitoring.\n\
Send /unsubscribe to stop, /status to see what I'm doing.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotCommand {
    Start,
    Subscribe { username: String, secret: Secret },
    Unsubscribe,
    Status,
}

impl BotCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::Status => "status",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandParseError {
    #[error("send your portal username and password separated by a space")]
    MissingCredentials,
    #[error("unknown command /{0}")]
    Unknown(String),
}

/// Parses a chat message. A plain `username password` line is treated as a
/// subscribe request.
pub fn parse_command(text: &str) -> Result<BotCommand, CommandParseError> {
    let text = text.trim();
    let Some(command) = text.strip_prefix('/') else {
        return parse_credentials(text);
    };

    let (head, rest) = command
        .split_once(char::is_whitespace)
        .unwrap_or((command, ""));
    // Group chats address commands as /subscribe@some_bot.
    let name = head.split('@').next().unwrap_or(head).to_ascii_lowercase();

    match name.as_str() {
        "start" | "help" => Ok(BotCommand::Start),
        "subscribe" => parse_credentials(rest.trim()),
        "unsubscribe" | "stop" => Ok(BotCommand::Unsubscribe),
        "status" => Ok(BotCommand::Status),
        _ => Err(CommandParseError::Unknown(name)),
    }
}

fn parse_credentials(text: &str) -> Result<BotCommand, CommandParseError> {
    let (username, secret) = text
        .split_once(char::is_whitespace)
        .ok_or(CommandParseError::MissingCredentials)?;
    let secret = secret.trim();
    if username.is_empty() || secret.is_empty() {
        return Err(CommandParseError::MissingCredentials);
    }
    Ok(BotCommand::Subscribe {
        username: username.to_string(),
        secret: Secret::new(secret),
    })
}

/// Applies one chat message to the scheduler and returns the reply. Must run
/// inside a tokio runtime since subscribing spawns the watch task.
pub fn handle_message(scheduler: &WatchScheduler, chat_id: SubscriberId, text: &str) -> String {
    let command = match parse_command(text) {
        Ok(command) => command,
        Err(err) => {
            info!(chat = %chat_id, "unparseable message: {err}");
            return format!("Sorry, {err}.\n\n{WELCOME_TEXT}");
        }
    };
    info!(chat = %chat_id, command = command.name(), "bot command");

    match command {
        BotCommand::Start => WELCOME_TEXT.to_string(),
        BotCommand::Subscribe { username, secret } => {
            match scheduler.on_subscribe(chat_id, &username, secret.expose()) {
                Ok(()) => "Credentials saved. Monitoring started.".to_string(),
                Err(err) => {
                    warn!(chat = %chat_id, "rejected credentials: {err}");
                    format!("Those credentials look wrong: {err}.")
                }
            }
        }
        BotCommand::Unsubscribe => {
            if scheduler.on_unsubscribe(chat_id) {
                "Unsubscribed from portal updates.".to_string()
            } else {
                "You are not subscribed.".to_string()
            }
        }
        BotCommand::Status => status_text(scheduler, chat_id),
    }
}

fn status_text(scheduler: &WatchScheduler, chat_id: SubscriberId) -> String {
    let store = scheduler.store();
    let Some(state) = store.watch_state(chat_id) else {
        return "You are not subscribed.".to_string();
    };
    let activity = match state {
        WatchState::Idle => "waiting for the next check",
        WatchState::Fetching => "checking the portal",
        WatchState::Comparing => "comparing results",
        WatchState::Notifying => "sending an update",
        WatchState::Cancelled => "stopping",
    };
    let last = match store.get_last_snapshot(chat_id) {
        Some(snapshot) => format!(
            "Last successful check: {} UTC ({} of {} sections readable).",
            snapshot.fetched_at().format("%Y-%m-%d %H:%M"),
            snapshot.available_count(),
            Field::ALL.len()
        ),
        None => "No successful check yet.".to_string(),
    };
    format!("Monitoring is active, currently {activity}.\n{last}")
}
