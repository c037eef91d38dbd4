pub mod engine;
pub mod sink;

pub use engine::{notification_for_diff, notification_for_failure, Notification, NotificationKind};
pub use sink::{DeliveryError, Notifier, StdoutNotifier, TelegramNotifier};
