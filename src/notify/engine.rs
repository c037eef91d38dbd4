use serde::{Deserialize, Serialize};

use crate::portal::FetchError;
use crate::snapshot::{DiffResult, Snapshot};
use crate::subscription::SubscriberId;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    InitialSnapshot,
    FieldsChanged,
    FetchFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub subscriber_id: SubscriberId,
    pub kind: NotificationKind,
    pub text: String,
}

/// `Unchanged` yields nothing.
pub fn notification_for_diff(
    subscriber_id: SubscriberId,
    diff: &DiffResult,
    current: &Snapshot,
) -> Option<Notification> {
    match diff {
        DiffResult::Unchanged => None,
        DiffResult::Initial => {
            let mut text = String::from("Initial data fetched.");
            for (field, value) in current.iter() {
                text.push_str(&format!("\n{field}: {value}"));
            }
            Some(Notification {
                subscriber_id,
                kind: NotificationKind::InitialSnapshot,
                text,
            })
        }
        DiffResult::Changed(changes) => {
            let mut text = String::from("Changes detected:");
            for change in changes {
                text.push_str(&format!("\n{}: {}", change.field, change.new_value));
            }
            Some(Notification {
                subscriber_id,
                kind: NotificationKind::FieldsChanged,
                text,
            })
        }
    }
}

pub fn notification_for_failure(subscriber_id: SubscriberId, error: &FetchError) -> Notification {
    let text = match error {
        FetchError::AuthFailed => "Portal login failed. Check your username and password, \
             then send them again with /subscribe."
            .to_string(),
        FetchError::ParseFailed(_) => {
            "The portal dashboard could not be read. Monitoring continues.".to_string()
        }
        FetchError::Unreachable(_) => {
            "The portal is unreachable right now. Monitoring continues.".to_string()
        }
    };
    Notification {
        subscriber_id,
        kind: NotificationKind::FetchFailed,
        text,
    }
}
