//! Background reloader keeping the settings snapshot in sync with the store.
//!
//! The reloader owns the only writable reference to the current snapshot.
//! Readers get `Arc<Settings>` clones through [`Reloader::settings`], which
//! waits for the first successful load and never blocks afterwards.
//!
//! # Loop
//! ```text
//! get(key, last_index, wait_time)
//!     error / key missing   → warn, sleep fallback, retry
//!     index == last         → long-poll timed out, poll again
//!     index <  last         → stale store, error, keep snapshot, sleep fallback
//!     index >  last         → decode
//!         decode error      → warn, sleep fallback, index not advanced
//!         ok                → swap snapshot, advance index, open ready gate
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use keel_core::{ConfigStore, IndexChange, ModifyIndex, Settings, StoreError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Upper bound a single long-poll waits for a change.
pub const DEFAULT_WAIT_TIME: Duration = Duration::from_secs(60);
/// Fixed delay before retrying after any failed poll.
pub const DEFAULT_FALLBACK: Duration = Duration::from_secs(1);

/// Reloader parameters.
#[derive(Debug, Clone)]
pub struct ReloaderConfig {
    /// Store key holding the JSON settings document.
    pub key: String,
    /// Long-poll wait passed to the store.
    pub wait_time: Duration,
    /// Backoff between failed polls.
    pub fallback: Duration,
}

impl ReloaderConfig {
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            wait_time: DEFAULT_WAIT_TIME,
            fallback: DEFAULT_FALLBACK,
        }
    }
}

/// Errors from publishing settings.
#[derive(Debug, thiserror::Error)]
pub enum ReloadError {
    #[error("failed to encode settings: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("reloader stopped before the first settings load")]
    Stopped,
}

/// Result of one poll, telling the loop what to do next.
enum PollStep {
    Applied(ModifyIndex),
    Unchanged,
    Retry,
}

/// Keeps an always-fresh settings snapshot sourced from a [`ConfigStore`].
pub struct Reloader {
    store: Arc<dyn ConfigStore>,
    config: ReloaderConfig,
    current: ArcSwapOption<Settings>,
    last_index: AtomicU64,
    retrograde: AtomicU64,
    ready: watch::Sender<bool>,
}

impl Reloader {
    /// Creates an empty reloader. Nothing is loaded until [`Reloader::run`].
    #[must_use]
    pub fn new(store: Arc<dyn ConfigStore>, config: ReloaderConfig) -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            store,
            config,
            current: ArcSwapOption::empty(),
            last_index: AtomicU64::new(0),
            retrograde: AtomicU64::new(0),
            ready,
        }
    }

    /// Creates a reloader, spawns its loop and waits for the first snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`ReloadError::Stopped`] if `stop` fires before the first
    /// snapshot is loaded.
    pub async fn start(
        store: Arc<dyn ConfigStore>,
        config: ReloaderConfig,
        stop: watch::Receiver<bool>,
    ) -> Result<(Arc<Self>, JoinHandle<()>), ReloadError> {
        let reloader = Arc::new(Self::new(store, config));
        let mut stop_wait = stop.clone();
        let handle = reloader.spawn(stop);

        info!(key = %reloader.config.key, "Waiting for settings from the config store...");
        tokio::select! {
            biased;
            _ = reloader.settings() => {}
            () = stopped(&mut stop_wait) => {
                warn!(key = %reloader.config.key, "Stopped before the first settings load.");
                return Err(ReloadError::Stopped);
            }
        }
        info!(
            modify_index = reloader.last_index().get(),
            "Connected and got settings."
        );

        Ok((reloader, handle))
    }

    /// Spawns [`Reloader::run`] on the current runtime.
    pub fn spawn(self: &Arc<Self>, stop: watch::Receiver<bool>) -> JoinHandle<()> {
        let reloader = Arc::clone(self);
        tokio::spawn(async move { reloader.run(stop).await })
    }

    /// Runs the refresh loop until `stop` turns `true` or its sender is
    /// dropped. Errors never escape: every failure is logged and retried.
    pub async fn run(&self, mut stop: watch::Receiver<bool>) {
        let mut wait_index = self.last_index();

        loop {
            let step = tokio::select! {
                biased;
                () = stopped(&mut stop) => break,
                step = self.poll_once(wait_index) => step,
            };

            match step {
                PollStep::Applied(index) => wait_index = index,
                PollStep::Unchanged => {}
                PollStep::Retry => {
                    tokio::select! {
                        biased;
                        () = stopped(&mut stop) => break,
                        () = tokio::time::sleep(self.config.fallback) => {}
                    }
                }
            }
        }

        info!(key = %self.config.key, "Settings reloader exiting.");
    }

    /// Returns the current snapshot, waiting for the first load if needed.
    pub async fn settings(&self) -> Arc<Settings> {
        let mut ready = self.ready.subscribe();
        loop {
            if let Some(settings) = self.current.load_full() {
                return settings;
            }
            // The sender lives in `self`, so the channel stays open here.
            let _ = ready.wait_for(|ready| *ready).await;
        }
    }

    /// Returns the current snapshot without waiting.
    #[must_use]
    pub fn try_settings(&self) -> Option<Arc<Settings>> {
        self.current.load_full()
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Modify-index of the snapshot currently published.
    #[must_use]
    pub fn last_index(&self) -> ModifyIndex {
        ModifyIndex::new(self.last_index.load(Ordering::Acquire))
    }

    /// Number of retrograde indices observed and skipped.
    #[must_use]
    pub fn retrograde_count(&self) -> u64 {
        self.retrograde.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn config(&self) -> &ReloaderConfig {
        &self.config
    }

    /// Stores `settings` under the configuration key.
    ///
    /// The local snapshot is not touched: the loop picks the write up on its
    /// next poll.
    ///
    /// # Errors
    ///
    /// Returns [`ReloadError`] if encoding or the store write fails.
    pub async fn put_settings(&self, settings: &Settings) -> Result<(), ReloadError> {
        let body = settings.to_json()?;
        self.store.put(&self.config.key, body).await?;
        Ok(())
    }

    async fn poll_once(&self, wait_index: ModifyIndex) -> PollStep {
        let key = self.config.key.as_str();
        let pair = match self.store.get(key, wait_index, self.config.wait_time).await {
            Ok(Some(pair)) => pair,
            Ok(None) => {
                warn!(key, "Failed to get settings - key not found.");
                metrics::counter!("keel_settings_errors_total", "kind" => "not_found").increment(1);
                return PollStep::Retry;
            }
            Err(err) => {
                warn!(key, error = %err, "Failed to get settings.");
                metrics::counter!("keel_settings_errors_total", "kind" => "store").increment(1);
                return PollStep::Retry;
            }
        };

        let observed = pair.modify_index;
        match wait_index.classify(observed) {
            IndexChange::Unchanged => {
                debug!(
                    modify_index = observed.get(),
                    wait_index = wait_index.get(),
                    "Settings not changed."
                );
                PollStep::Unchanged
            }
            IndexChange::Retrograde => {
                self.retrograde.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("keel_settings_errors_total", "kind" => "retrograde")
                    .increment(1);
                error!(
                    modify_index = observed.get(),
                    wait_index = wait_index.get(),
                    "Stale settings! Modify index went backwards, keeping current snapshot."
                );
                PollStep::Retry
            }
            IndexChange::Advanced => match Settings::from_json(&pair.value) {
                Ok(settings) => {
                    info!(modify_index = observed.get(), "Applying new settings.");
                    self.apply(observed, settings);
                    PollStep::Applied(observed)
                }
                Err(err) => {
                    warn!(
                        modify_index = observed.get(),
                        error = %err,
                        settings = %String::from_utf8_lossy(&pair.value),
                        "Failed to unmarshal settings."
                    );
                    metrics::counter!("keel_settings_errors_total", "kind" => "decode")
                        .increment(1);
                    PollStep::Retry
                }
            },
        }
    }

    fn apply(&self, index: ModifyIndex, settings: Settings) {
        self.current.store(Some(Arc::new(settings)));
        self.last_index.store(index.get(), Ordering::Release);
        metrics::counter!("keel_settings_reloads_total").increment(1);

        if !*self.ready.borrow() {
            self.ready.send_replace(true);
            info!(modify_index = index.get(), "Settings ready.");
        }
    }

    /// Reloader that already holds `settings`, for tests of its consumers.
    #[cfg(test)]
    pub(crate) fn preloaded(settings: Settings) -> Arc<Self> {
        let reloader = Self::new(
            Arc::new(super::MemoryStore::new()),
            ReloaderConfig::new("test/settings"),
        );
        reloader.apply(ModifyIndex::new(1), settings);
        Arc::new(reloader)
    }
}

/// Resolves once a stop is requested. A dropped sender counts as one.
async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use async_trait::async_trait;
    use keel_core::KvPair;
    use parking_lot::Mutex;
    use tokio::sync::Notify;
    use tokio::time::Instant;
    use tracing::Level;

    use super::*;
    use crate::settings::MemoryStore;
    use crate::test_support::LogCapture;

    const KEY: &str = "app/settings";

    type Reply = Result<Option<KvPair>, StoreError>;

    /// Store that answers polls from a script and blocks when it runs dry.
    #[derive(Default)]
    struct ScriptedStore {
        script: Mutex<VecDeque<Reply>>,
        pushed: Notify,
        requested: Mutex<Vec<ModifyIndex>>,
    }

    impl ScriptedStore {
        fn with_script(replies: impl IntoIterator<Item = Reply>) -> Arc<Self> {
            let store = Arc::new(Self::default());
            store.script.lock().extend(replies);
            store
        }

        fn push(&self, reply: Reply) {
            self.script.lock().push_back(reply);
            self.pushed.notify_one();
        }

        fn requested(&self) -> Vec<ModifyIndex> {
            self.requested.lock().clone()
        }

        async fn wait_for_requests(&self, count: usize) {
            while self.requested.lock().len() < count {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }
    }

    #[async_trait]
    impl ConfigStore for ScriptedStore {
        async fn get(&self, _key: &str, wait_index: ModifyIndex, _wait: Duration) -> Reply {
            self.requested.lock().push(wait_index);
            loop {
                if let Some(reply) = self.script.lock().pop_front() {
                    return reply;
                }
                self.pushed.notified().await;
            }
        }

        async fn put(&self, _key: &str, _value: Vec<u8>) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn settings_for(marker: &str) -> Settings {
        let mut settings = Settings::default();
        settings.api.rest_listen_address = marker.to_string();
        settings
    }

    fn pair(index: u64, marker: &str) -> Reply {
        Ok(Some(KvPair {
            key: KEY.to_string(),
            value: settings_for(marker).to_json().unwrap(),
            modify_index: ModifyIndex::new(index),
        }))
    }

    fn raw_pair(index: u64, value: &[u8]) -> Reply {
        Ok(Some(KvPair {
            key: KEY.to_string(),
            value: value.to_vec(),
            modify_index: ModifyIndex::new(index),
        }))
    }

    fn marker(reloader: &Reloader) -> String {
        reloader.try_settings().unwrap().api.rest_listen_address.clone()
    }

    fn spawn_reloader(store: Arc<dyn ConfigStore>) -> (Arc<Reloader>, watch::Sender<bool>, JoinHandle<()>) {
        let (stop_tx, stop_rx) = watch::channel(false);
        let reloader = Arc::new(Reloader::new(store, ReloaderConfig::new(KEY)));
        let handle = reloader.spawn(stop_rx);
        (reloader, stop_tx, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn retrograde_index_is_rejected_and_logged() {
        let (logs, _guard) = LogCapture::install();
        let store = ScriptedStore::with_script([
            pair(5, "v5"),
            pair(5, "v5-again"),
            pair(7, "v7"),
            pair(6, "v6"),
        ]);
        let (reloader, _stop, _handle) = spawn_reloader(store.clone());

        // Fifth poll is parked on the empty script: index 6 has been handled.
        store.wait_for_requests(5).await;
        assert_eq!(marker(&reloader), "v7");
        assert_eq!(reloader.last_index(), ModifyIndex::new(7));
        assert_eq!(reloader.retrograde_count(), 1);
        assert_eq!(
            logs.count(|e| e.level == Level::ERROR && e.message.contains("Stale settings")),
            1
        );

        store.push(pair(9, "v9"));
        store.wait_for_requests(6).await;
        assert_eq!(marker(&reloader), "v9");

        let requested: Vec<u64> = store.requested().iter().map(|i| i.get()).collect();
        assert_eq!(requested, vec![0, 5, 5, 7, 7, 9]);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_readers_unblock_on_first_load_with_same_snapshot() {
        let store = ScriptedStore::with_script([]);
        let (reloader, _stop, _handle) = spawn_reloader(store.clone());

        let readers: Vec<_> = (0..8)
            .map(|_| {
                let reloader = Arc::clone(&reloader);
                tokio::spawn(async move { reloader.settings().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(readers.iter().all(|r| !r.is_finished()));
        assert!(!reloader.is_ready());

        store.push(pair(3, "first"));

        let mut snapshots = Vec::new();
        for reader in readers {
            snapshots.push(reader.await.unwrap());
        }
        assert!(reloader.is_ready());
        assert!(snapshots.iter().all(|s| Arc::ptr_eq(s, &snapshots[0])));
        assert_eq!(snapshots[0].api.rest_listen_address, "first");
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried_after_fixed_backoff() {
        let (logs, _guard) = LogCapture::install();
        let store = ScriptedStore::with_script([
            Err(StoreError::Transport("connection refused".into())),
            Ok(None),
            Err(StoreError::Status {
                status: 500,
                body: "leader election".into(),
            }),
            pair(2, "ok"),
        ]);

        let started = Instant::now();
        let (reloader, _stop, _handle) = spawn_reloader(store.clone());
        let settings = reloader.settings().await;

        assert_eq!(settings.api.rest_listen_address, "ok");
        assert!(started.elapsed() >= DEFAULT_FALLBACK * 3);
        assert!(started.elapsed() < DEFAULT_FALLBACK * 4);
        assert_eq!(
            logs.count(|e| e.level == Level::WARN && e.message.starts_with("Failed to get settings")),
            3
        );
        assert!(store.requested().iter().take(4).all(|i| *i == ModifyIndex::ZERO));
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_payload_does_not_advance_index() {
        let (logs, _guard) = LogCapture::install();
        let store = ScriptedStore::with_script([
            pair(7, "v7"),
            raw_pair(8, b"{\"api\": broken"),
            pair(8, "v8"),
        ]);
        let (reloader, _stop, _handle) = spawn_reloader(store.clone());

        store.wait_for_requests(4).await;
        assert_eq!(marker(&reloader), "v8");
        assert_eq!(reloader.last_index(), ModifyIndex::new(8));

        let requested: Vec<u64> = store.requested().iter().map(|i| i.get()).collect();
        assert_eq!(requested, vec![0, 7, 7, 8]);
        assert_eq!(
            logs.count(|e| e.level == Level::WARN && e.message.contains("unmarshal")),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stops_promptly_mid_poll() {
        let store = ScriptedStore::with_script([]);
        let (_reloader, stop, handle) = spawn_reloader(store.clone());
        store.wait_for_requests(1).await;

        stop.send_replace(true);
        tokio::time::timeout(Duration::from_millis(10), handle)
            .await
            .expect("reloader should stop mid-poll")
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stops_promptly_mid_backoff() {
        let store = ScriptedStore::with_script([Err(StoreError::Transport("down".into()))]);
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut config = ReloaderConfig::new(KEY);
        config.fallback = Duration::from_secs(3600);
        let reloader = Arc::new(Reloader::new(store.clone(), config));
        let handle = reloader.spawn(stop_rx);

        store.wait_for_requests(1).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        stop_tx.send_replace(true);

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("reloader should stop mid-backoff")
            .unwrap();
        assert_eq!(store.requested().len(), 1);
    }

    #[tokio::test]
    async fn put_settings_writes_store_without_touching_cache() {
        let store = Arc::new(MemoryStore::new());
        let reloader = Reloader::new(store.clone(), ReloaderConfig::new(KEY));

        reloader.put_settings(&settings_for("published")).await.unwrap();

        assert!(reloader.try_settings().is_none());
        let stored = store
            .get(KEY, ModifyIndex::ZERO, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            Settings::from_json(&stored.value).unwrap(),
            settings_for("published")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn observes_its_own_publish_on_next_poll() {
        let store = Arc::new(MemoryStore::new());
        store
            .put(KEY, settings_for("initial").to_json().unwrap())
            .await
            .unwrap();

        let (stop_tx, stop_rx) = watch::channel(false);
        let (reloader, handle) =
            Reloader::start(store.clone(), ReloaderConfig::new(KEY), stop_rx)
                .await
                .unwrap();
        assert_eq!(marker(&reloader), "initial");

        reloader.put_settings(&settings_for("updated")).await.unwrap();
        while marker(&reloader) != "updated" {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(reloader.last_index(), ModifyIndex::new(2));

        stop_tx.send_replace(true);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn start_returns_when_stopped_before_first_load() {
        let store = ScriptedStore::with_script([]);
        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            stop_tx.send_replace(true);
        });

        let started = tokio::time::timeout(
            Duration::from_secs(1),
            Reloader::start(store.clone(), ReloaderConfig::new(KEY), stop_rx),
        )
        .await
        .expect("start should give up once stopped");

        assert!(matches!(started, Err(ReloadError::Stopped)));
        assert_eq!(store.requested().len(), 1);
    }
}
