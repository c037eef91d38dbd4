use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::WatchConfig;
use crate::notify::engine::{notification_for_diff, notification_for_failure, Notification};
use crate::notify::sink::Notifier;
use crate::portal::{FetchError, PortalClient};
use crate::snapshot::diff;
use crate::subscription::{
    Credential, CredentialError, SubscriberId, SubscriptionStore, WatchLease, WatchState,
};
use crate::watch::policy::FailureStreak;

/// The watch was cancelled or superseded; the task must stop without touching
/// the store or the notifier again.
#[derive(Debug)]
struct Cancelled;

type Step = Result<(), Cancelled>;

/// Runs one watch task per subscriber and exposes the entry points the chat
/// transport drives.
#[derive(Clone)]
pub struct WatchScheduler {
    store: Arc<SubscriptionStore>,
    portal: Arc<dyn PortalClient>,
    notifier: Arc<dyn Notifier>,
    config: WatchConfig,
}

impl WatchScheduler {
    pub fn new(
        store: Arc<SubscriptionStore>,
        portal: Arc<dyn PortalClient>,
        notifier: Arc<dyn Notifier>,
        config: WatchConfig,
    ) -> Self {
        Self {
            store,
            portal,
            notifier,
            config,
        }
    }

    pub fn store(&self) -> &Arc<SubscriptionStore> {
        &self.store
    }

    /// Validates the credential and (re)starts the subscriber's watch. Must be
    /// called from within a tokio runtime.
    pub fn on_subscribe(
        &self,
        subscriber_id: SubscriberId,
        username: &str,
        secret: &str,
    ) -> Result<(), CredentialError> {
        let credential = Credential::new(subscriber_id, username, secret)?;
        let worker = WatchWorker {
            store: Arc::clone(&self.store),
            portal: Arc::clone(&self.portal),
            notifier: Arc::clone(&self.notifier),
            config: self.config.clone(),
        };
        let lease = self.store.register(subscriber_id, credential, |lease| {
            tokio::spawn(worker.run(lease))
        });
        info!(
            subscriber = %subscriber_id,
            generation = lease.generation(),
            interval_secs = self.config.interval().as_secs(),
            "watch started"
        );
        Ok(())
    }

    pub fn on_unsubscribe(&self, subscriber_id: SubscriberId) -> bool {
        let removed = self.store.unregister(subscriber_id);
        if removed {
            info!(subscriber = %subscriber_id, "watch cancelled");
        }
        removed
    }

    /// Cancels every watch and waits for the tasks to stop.
    pub async fn shutdown(&self) {
        let handles = self.store.cancel_all();
        info!(watches = handles.len(), "stopping watches");
        for handle in handles {
            if let Err(err) = handle.await {
                warn!("watch task ended abnormally: {err}");
            }
        }
    }
}

struct WatchWorker {
    store: Arc<SubscriptionStore>,
    portal: Arc<dyn PortalClient>,
    notifier: Arc<dyn Notifier>,
    config: WatchConfig,
}

impl WatchWorker {
    async fn run(self, lease: WatchLease) {
        let mut streak = FailureStreak::default();
        let _ = self.watch(&lease, &mut streak).await;
        self.store.set_watch_state(&lease, WatchState::Cancelled);
        debug!(
            subscriber = %lease.subscriber_id(),
            generation = lease.generation(),
            "watch task finished"
        );
    }

    async fn watch(&self, lease: &WatchLease, streak: &mut FailureStreak) -> Step {
        pause(lease, self.config.initial_delay()).await?;
        loop {
            self.cycle(lease, streak).await?;
            pause(lease, self.config.interval()).await?;
        }
    }

    /// One fetch → compare → notify pass.
    async fn cycle(&self, lease: &WatchLease, streak: &mut FailureStreak) -> Step {
        let subscriber_id = lease.subscriber_id();
        let credential = self.store.credential(lease).ok_or(Cancelled)?;

        self.transition(lease, WatchState::Fetching)?;
        let fetched = tokio::select! {
            biased;
            _ = lease.token().cancelled() => return Err(Cancelled),
            result = tokio::time::timeout(
                self.config.fetch_timeout(),
                self.portal.fetch(&credential),
            ) => result.unwrap_or_else(|_| {
                Err(FetchError::Unreachable("fetch timed out".to_string()))
            }),
        };

        let snapshot = match fetched {
            Ok(snapshot) => snapshot,
            Err(error) => return self.on_fetch_failed(lease, streak, error).await,
        };
        let recovered_after = streak.reset();
        if recovered_after > 0 {
            info!(subscriber = %subscriber_id, failures = recovered_after, "fetch recovered");
        }

        self.transition(lease, WatchState::Comparing)?;
        let previous = self.store.get_last_snapshot(subscriber_id);
        let outcome = diff(previous.as_ref(), &snapshot);
        let notification = notification_for_diff(subscriber_id, &outcome, &snapshot);

        // Update before notify: a lost notification is acceptable, a repeated one is not.
        if !self.store.commit_snapshot(lease, snapshot) {
            return Err(Cancelled);
        }

        match notification {
            Some(notification) => {
                debug!(subscriber = %subscriber_id, kind = ?notification.kind, "dashboard changed");
                self.deliver(lease, &notification).await?;
            }
            None => debug!(subscriber = %subscriber_id, "dashboard unchanged"),
        }
        self.transition(lease, WatchState::Idle)
    }

    async fn on_fetch_failed(
        &self,
        lease: &WatchLease,
        streak: &mut FailureStreak,
        error: FetchError,
    ) -> Step {
        let subscriber_id = lease.subscriber_id();
        let first_of_streak = streak.record(&error);
        if first_of_streak || error.is_transient() {
            warn!(subscriber = %subscriber_id, "fetch failed: {error}");
        } else {
            debug!(
                subscriber = %subscriber_id,
                consecutive = streak.consecutive(),
                "fetch still failing: {error}"
            );
        }

        if first_of_streak && self.config.notify_on_failure {
            self.deliver(lease, &notification_for_failure(subscriber_id, &error))
                .await?;
        }
        self.transition(lease, WatchState::Idle)
    }

    async fn deliver(&self, lease: &WatchLease, notification: &Notification) -> Step {
        self.transition(lease, WatchState::Notifying)?;
        let subscriber_id = lease.subscriber_id();
        let result = tokio::select! {
            biased;
            _ = lease.token().cancelled() => return Err(Cancelled),
            result = self.notifier.send_notification(subscriber_id, &notification.text) => result,
        };
        if let Err(err) = result {
            warn!(subscriber = %subscriber_id, kind = ?notification.kind, "notification dropped: {err}");
        }
        Ok(())
    }

    fn transition(&self, lease: &WatchLease, state: WatchState) -> Step {
        if self.store.set_watch_state(lease, state) {
            debug!(subscriber = %lease.subscriber_id(), state = ?state, "watch state");
            Ok(())
        } else {
            Err(Cancelled)
        }
    }
}

/// Interruptible sleep: returns as soon as the lease is cancelled.
async fn pause(lease: &WatchLease, duration: Duration) -> Step {
    if lease.is_cancelled() {
        return Err(Cancelled);
    }
    if duration.is_zero() {
        return Ok(());
    }
    tokio::select! {
        biased;
        _ = lease.token().cancelled() => Err(Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, VecDeque};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Notify;
    use tokio::time::Instant;

    use crate::config::WatchConfig;
    use crate::notify::sink::{DeliveryError, Notifier};
    use crate::portal::{FetchError, PortalClient};
    use crate::snapshot::{Field, FieldValue, Snapshot};
    use crate::subscription::{Credential, SubscriberId, SubscriptionStore, WatchState};
    use crate::watch::scheduler::WatchScheduler;

    const INTERVAL: u64 = 300;

    fn snapshot(attendance: &str) -> Snapshot {
        Snapshot::from_fields(Field::ALL.into_iter().map(|field| {
            let value = if field == Field::Attendance {
                attendance.to_string()
            } else {
                format!("{} notice", field.as_slug())
            };
            (field, FieldValue::Text(value))
        }))
    }

    fn config(notify_on_failure: bool) -> WatchConfig {
        WatchConfig {
            interval_secs: INTERVAL,
            initial_delay_secs: 0,
            fetch_timeout_secs: 60,
            notify_on_failure,
        }
    }

    /// Replays a per-username script of fetch results; exhausted scripts report
    /// the portal as unreachable.
    #[derive(Default)]
    struct ScriptedPortal {
        scripts: Mutex<HashMap<String, VecDeque<Result<Snapshot, FetchError>>>>,
        calls: Mutex<HashMap<String, Vec<Duration>>>,
        started: Option<Instant>,
    }

    impl ScriptedPortal {
        fn new() -> Self {
            Self {
                started: Some(Instant::now()),
                ..Self::default()
            }
        }

        fn script(self, username: &str, results: Vec<Result<Snapshot, FetchError>>) -> Self {
            self.scripts
                .lock()
                .unwrap()
                .insert(username.to_string(), results.into());
            self
        }

        fn call_offsets(&self, username: &str) -> Vec<u64> {
            self.calls
                .lock()
                .unwrap()
                .get(username)
                .map(|calls| calls.iter().map(Duration::as_secs).collect())
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl PortalClient for ScriptedPortal {
        async fn fetch(&self, credential: &Credential) -> Result<Snapshot, FetchError> {
            let elapsed = self.started.map(|s| s.elapsed()).unwrap_or_default();
            self.calls
                .lock()
                .unwrap()
                .entry(credential.username.clone())
                .or_default()
                .push(elapsed);
            self.scripts
                .lock()
                .unwrap()
                .get_mut(&credential.username)
                .and_then(VecDeque::pop_front)
                .unwrap_or_else(|| Err(FetchError::Unreachable("script exhausted".into())))
        }
    }

    /// Holds every fetch until released.
    struct GatedPortal {
        started: Notify,
        release: Notify,
        result: Snapshot,
    }

    #[async_trait]
    impl PortalClient for GatedPortal {
        async fn fetch(&self, _credential: &Credential) -> Result<Snapshot, FetchError> {
            self.started.notify_one();
            self.release.notified().await;
            Ok(self.result.clone())
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<(SubscriberId, String)>>,
        fail: bool,
    }

    impl RecordingNotifier {
        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        fn texts_for(&self, id: SubscriberId) -> Vec<String> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(to, _)| *to == id)
                .map(|(_, text)| text.clone())
                .collect()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send_notification(
            &self,
            subscriber_id: SubscriberId,
            text: &str,
        ) -> Result<(), DeliveryError> {
            self.sent
                .lock()
                .unwrap()
                .push((subscriber_id, text.to_string()));
            if self.fail {
                return Err(DeliveryError::Transport("offline".to_string()));
            }
            Ok(())
        }
    }

    fn scheduler(
        portal: Arc<dyn PortalClient>,
        notifier: Arc<RecordingNotifier>,
        config: WatchConfig,
    ) -> WatchScheduler {
        WatchScheduler::new(Arc::new(SubscriptionStore::new()), portal, notifier, config)
    }

    async fn advance(secs: u64) {
        tokio::time::sleep(Duration::from_secs(secs)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn initial_unchanged_then_changed() {
        let portal = Arc::new(ScriptedPortal::new().script(
            "alice",
            vec![Ok(snapshot("80%")), Ok(snapshot("80%")), Ok(snapshot("95%"))],
        ));
        let notifier = Arc::new(RecordingNotifier::default());
        let scheduler = scheduler(portal.clone(), notifier.clone(), config(false));
        let alice = SubscriberId(1);

        scheduler.on_subscribe(alice, "alice", "pw").expect("valid");
        advance(10).await;
        let texts = notifier.texts_for(alice);
        assert_eq!(texts.len(), 1);
        assert!(texts[0].starts_with("Initial data fetched."));
        assert_eq!(scheduler.store().get_last_snapshot(alice), Some(snapshot("80%")));
        assert_eq!(scheduler.store().watch_state(alice), Some(WatchState::Idle));

        advance(INTERVAL).await;
        assert_eq!(notifier.texts_for(alice).len(), 1, "unchanged must stay silent");

        advance(INTERVAL).await;
        let texts = notifier.texts_for(alice);
        assert_eq!(texts.len(), 2);
        assert_eq!(texts[1], "Changes detected:\nAttendance: 95%");
        assert_eq!(scheduler.store().get_last_snapshot(alice), Some(snapshot("95%")));
        assert_eq!(portal.call_offsets("alice"), vec![0, INTERVAL, 2 * INTERVAL]);
    }

    #[tokio::test(start_paused = true)]
    async fn auth_failure_leaves_snapshot_and_keeps_schedule() {
        let portal = Arc::new(ScriptedPortal::new().script(
            "alice",
            vec![Ok(snapshot("80%")), Err(FetchError::AuthFailed), Ok(snapshot("80%"))],
        ));
        let notifier = Arc::new(RecordingNotifier::default());
        let scheduler = scheduler(portal.clone(), notifier.clone(), config(false));
        let alice = SubscriberId(1);

        scheduler.on_subscribe(alice, "alice", "pw").expect("valid");
        advance(INTERVAL + 10).await;
        assert_eq!(scheduler.store().get_last_snapshot(alice), Some(snapshot("80%")));
        assert_eq!(notifier.texts_for(alice).len(), 1);

        advance(INTERVAL).await;
        assert_eq!(portal.call_offsets("alice"), vec![0, INTERVAL, 2 * INTERVAL]);
        assert_eq!(notifier.texts_for(alice).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn first_fetch_failing_stores_nothing() {
        let portal = Arc::new(
            ScriptedPortal::new().script("alice", vec![Err(FetchError::AuthFailed)]),
        );
        let notifier = Arc::new(RecordingNotifier::default());
        let scheduler = scheduler(portal.clone(), notifier.clone(), config(false));
        let alice = SubscriberId(1);

        scheduler.on_subscribe(alice, "alice", "pw").expect("valid");
        advance(INTERVAL + 10).await;
        assert!(scheduler.store().get_last_snapshot(alice).is_none());
        assert!(notifier.texts_for(alice).is_empty());
        assert_eq!(portal.call_offsets("alice").len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_auth_failure_notifies_once_when_enabled() {
        let portal = Arc::new(ScriptedPortal::new().script(
            "alice",
            vec![
                Err(FetchError::AuthFailed),
                Err(FetchError::AuthFailed),
                Err(FetchError::Unreachable("down".into())),
                Err(FetchError::AuthFailed),
            ],
        ));
        let notifier = Arc::new(RecordingNotifier::default());
        let scheduler = scheduler(portal.clone(), notifier.clone(), config(true));
        let alice = SubscriberId(1);

        scheduler.on_subscribe(alice, "alice", "pw").expect("valid");
        advance(3 * INTERVAL + 10).await;
        let texts = notifier.texts_for(alice);
        assert_eq!(texts.len(), 1);
        assert!(texts[0].starts_with("Portal login failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn failing_subscriber_does_not_affect_another() {
        let portal = Arc::new(
            ScriptedPortal::new()
                .script(
                    "alice",
                    vec![
                        Err(FetchError::AuthFailed),
                        Err(FetchError::Unreachable("down".into())),
                        Err(FetchError::ParseFailed("garbage".into())),
                    ],
                )
                .script(
                    "bob",
                    vec![Ok(snapshot("80%")), Ok(snapshot("80%")), Ok(snapshot("95%"))],
                ),
        );
        let notifier = Arc::new(RecordingNotifier::default());
        let scheduler = scheduler(portal.clone(), notifier.clone(), config(true));
        let (alice, bob) = (SubscriberId(1), SubscriberId(2));

        scheduler.on_subscribe(alice, "alice", "pw").expect("valid");
        scheduler.on_subscribe(bob, "bob", "pw").expect("valid");
        advance(2 * INTERVAL + 10).await;

        assert_eq!(portal.call_offsets("bob"), vec![0, INTERVAL, 2 * INTERVAL]);
        let bob_texts = notifier.texts_for(bob);
        assert_eq!(bob_texts.len(), 2);
        assert_eq!(bob_texts[1], "Changes detected:\nAttendance: 95%");
        assert_eq!(scheduler.store().get_last_snapshot(bob), Some(snapshot("95%")));

        assert_eq!(portal.call_offsets("alice"), vec![0, INTERVAL, 2 * INTERVAL]);
        assert!(scheduler.store().get_last_snapshot(alice).is_none());
        assert_eq!(notifier.texts_for(alice).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn registering_twice_keeps_a_single_watch() {
        let portal = Arc::new(ScriptedPortal::new().script(
            "alice",
            vec![Ok(snapshot("80%")), Ok(snapshot("80%")), Ok(snapshot("80%"))],
        ));
        let notifier = Arc::new(RecordingNotifier::default());
        let scheduler = scheduler(portal.clone(), notifier.clone(), config(false));
        let alice = SubscriberId(1);

        scheduler.on_subscribe(alice, "alice", "pw").expect("valid");
        scheduler.on_subscribe(alice, "alice", "pw").expect("valid");
        advance(2 * INTERVAL + 10).await;

        assert_eq!(scheduler.store().len(), 1);
        assert_eq!(portal.call_offsets("alice"), vec![0, INTERVAL, 2 * INTERVAL]);
        assert_eq!(notifier.texts_for(alice).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribe_during_fetch_prevents_write_and_notification() {
        let portal = Arc::new(GatedPortal {
            started: Notify::new(),
            release: Notify::new(),
            result: snapshot("80%"),
        });
        let notifier = Arc::new(RecordingNotifier::default());
        let scheduler = scheduler(portal.clone(), notifier.clone(), config(false));
        let alice = SubscriberId(1);

        scheduler.on_subscribe(alice, "alice", "pw").expect("valid");
        portal.started.notified().await;
        assert_eq!(scheduler.store().watch_state(alice), Some(WatchState::Fetching));

        assert!(scheduler.on_unsubscribe(alice));
        portal.release.notify_waiters();
        advance(3 * INTERVAL).await;

        assert!(notifier.sent.lock().unwrap().is_empty());
        assert!(scheduler.store().get_last_snapshot(alice).is_none());
        assert!(!scheduler.on_unsubscribe(alice));
    }

    #[tokio::test(start_paused = true)]
    async fn resubscribing_during_fetch_discards_the_stale_result() {
        let portal = Arc::new(GatedPortal {
            started: Notify::new(),
            release: Notify::new(),
            result: snapshot("80%"),
        });
        let notifier = Arc::new(RecordingNotifier::default());
        let scheduler = scheduler(portal.clone(), notifier.clone(), config(false));
        let alice = SubscriberId(1);

        scheduler.on_subscribe(alice, "alice", "old-pw").expect("valid");
        portal.started.notified().await;
        scheduler.on_subscribe(alice, "alice", "new-pw").expect("valid");
        portal.started.notified().await;

        portal.release.notify_waiters();
        advance(10).await;

        // Only the replacement watch reports.
        assert_eq!(notifier.texts_for(alice).len(), 1);
        assert_eq!(scheduler.store().get_last_snapshot(alice), Some(snapshot("80%")));
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribe_during_sleep_stops_further_fetches() {
        let portal = Arc::new(ScriptedPortal::new().script("alice", vec![Ok(snapshot("80%"))]));
        let notifier = Arc::new(RecordingNotifier::default());
        let scheduler = scheduler(portal.clone(), notifier.clone(), config(false));
        let alice = SubscriberId(1);

        scheduler.on_subscribe(alice, "alice", "pw").expect("valid");
        advance(10).await;
        assert!(scheduler.on_unsubscribe(alice));
        advance(5 * INTERVAL).await;

        assert_eq!(portal.call_offsets("alice"), vec![0]);
        assert_eq!(notifier.texts_for(alice).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_delivery_does_not_resend() {
        let portal = Arc::new(ScriptedPortal::new().script(
            "alice",
            vec![Ok(snapshot("80%")), Ok(snapshot("80%"))],
        ));
        let notifier = Arc::new(RecordingNotifier::failing());
        let scheduler = scheduler(portal.clone(), notifier.clone(), config(false));
        let alice = SubscriberId(1);

        scheduler.on_subscribe(alice, "alice", "pw").expect("valid");
        advance(INTERVAL + 10).await;

        assert_eq!(notifier.texts_for(alice).len(), 1);
        assert_eq!(scheduler.store().get_last_snapshot(alice), Some(snapshot("80%")));
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_credentials_do_not_start_a_watch() {
        let portal = Arc::new(ScriptedPortal::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let scheduler = scheduler(portal.clone(), notifier.clone(), config(false));

        assert!(scheduler.on_subscribe(SubscriberId(1), "", "pw").is_err());
        assert!(scheduler.store().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_every_watch() {
        let portal = Arc::new(ScriptedPortal::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let scheduler = scheduler(portal.clone(), notifier.clone(), config(false));

        scheduler.on_subscribe(SubscriberId(1), "alice", "pw").expect("valid");
        scheduler.on_subscribe(SubscriberId(2), "bob", "pw").expect("valid");
        advance(10).await;
        scheduler.shutdown().await;

        assert!(scheduler.store().is_empty());
        advance(2 * INTERVAL).await;
        assert_eq!(portal.call_offsets("alice").len(), 1);
        assert_eq!(portal.call_offsets("bob").len(), 1);
    }
}
