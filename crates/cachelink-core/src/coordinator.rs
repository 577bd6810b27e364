//! Fleet-wide scheduling of deferred clears.
//!
//! Every instance ticks on the same interval and tries to create a lease key
//! that expires just before the next tick. The one instance that creates it
//! moves the clear-later set into the clear-now set, tells every instance to
//! drain over pub/sub, and starts draining itself.
//!
//! Ticks and pub/sub triggers are forwarded as events into one control loop.
//! Each process runs at most one drain at a time; a trigger that arrives
//! while a drain is running joins it.

use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::CacheEngine;
use crate::error::{CacheError, CacheResult};
use crate::metrics;

/// Payload published to start a drain on every instance.
pub const START_CLEAR_MESSAGE: &str = "startClear";

/// Keys cleared per drain batch, shared by everyone awaiting the drain.
pub type DrainOutcome = Result<Arc<Vec<Vec<String>>>, Arc<CacheError>>;

/// A drain in flight. Cloning it joins the same drain.
pub type Drain = Shared<BoxFuture<'static, DrainOutcome>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorSettings {
    pub interval: Duration,
    /// Lease key, prefixed like every other cache key.
    pub sync_key: String,
    /// Pub/sub channel the drain trigger is published on.
    pub channel: String,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            sync_key: "___clear_later_sync".to_string(),
            channel: "___cron_channel".to_string(),
        }
    }
}

impl CoordinatorSettings {
    /// The lease outlives all but the last moments of an interval so the
    /// next tick on any instance finds it expired.
    pub fn lease_ttl(&self) -> Duration {
        let interval = self.interval.as_millis() as u64;
        let margin = (interval / 10).min(500);
        Duration::from_millis(interval.saturating_sub(margin).max(1))
    }
}

#[derive(Debug, Clone, Copy)]
enum Event {
    Tick,
    Trigger,
}

struct Inner {
    engine: Arc<CacheEngine>,
    settings: CoordinatorSettings,
    sync_key: String,
    drain: Mutex<Option<Drain>>,
    control: Mutex<Option<mpsc::UnboundedSender<Event>>>,
    cron: Mutex<Option<CancellationToken>>,
    listening: Mutex<bool>,
    shutdown: CancellationToken,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Lease-based scheduler for draining the deferred-clear queue.
#[derive(Clone)]
pub struct ClearCoordinator {
    inner: Arc<Inner>,
}

impl ClearCoordinator {
    pub fn new(engine: Arc<CacheEngine>, settings: CoordinatorSettings) -> Self {
        let sync_key = format!("{}{}", engine.settings().prefix, settings.sync_key);
        Self {
            inner: Arc::new(Inner {
                engine,
                settings,
                sync_key,
                drain: Mutex::new(None),
                control: Mutex::new(None),
                cron: Mutex::new(None),
                listening: Mutex::new(false),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn engine(&self) -> &Arc<CacheEngine> {
        &self.inner.engine
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.inner.settings
    }

    /// Starts ticking every interval. Does nothing if already ticking.
    pub fn start_cron(&self) {
        let mut cron = self.inner.cron.lock();
        if cron.is_some() {
            return;
        }
        let events = self.events();
        let token = self.inner.shutdown.child_token();
        let period = self.inner.settings.interval;
        tokio::spawn(run_ticker(period, events, token.clone()));
        *cron = Some(token);
        info!(interval_ms = period.as_millis() as u64, "cron: started");
    }

    /// Stops ticking. Does nothing if not ticking.
    pub fn stop_cron(&self) {
        if let Some(token) = self.inner.cron.lock().take() {
            token.cancel();
            info!("cron: stopped");
        }
    }

    pub fn is_cron_running(&self) -> bool {
        self.inner.cron.lock().is_some()
    }

    /// Subscribes to the trigger channel once; later calls do nothing.
    pub async fn listen_for_messages(&self) -> CacheResult<()> {
        {
            let mut listening = self.inner.listening.lock();
            if *listening {
                return Ok(());
            }
            *listening = true;
        }

        let channel = self.inner.settings.channel.clone();
        let messages = match self.inner.engine.storage().subscribe(&channel).await {
            Ok(messages) => messages,
            Err(e) => {
                *self.inner.listening.lock() = false;
                return Err(e.into());
            }
        };
        tokio::spawn(run_listener(
            messages,
            self.events(),
            self.inner.shutdown.child_token(),
        ));
        info!(channel = %channel, "cron: listening for clear messages");
        Ok(())
    }

    /// Tries to take this interval's lease; the winner starts the clear process.
    ///
    /// Returns whether the lease was taken.
    pub async fn check_sync_key(&self) -> CacheResult<bool> {
        debug!("cron: checking clear cron sync key");
        let settings = &self.inner.settings;
        let interval_ms = settings.interval.as_millis() as u64;
        let won = self
            .inner
            .engine
            .storage()
            .set(
                &self.inner.sync_key,
                &interval_ms.to_string(),
                Some(settings.lease_ttl().as_millis() as u64),
                true,
            )
            .await?;

        if won {
            metrics::record_lease_won();
            info!("cron: needs clear, starting clear process");
            if let Err(e) = self.start_clear_now_process().await {
                error!(error = %e, "cron: clear process failed to start");
            }
        }
        Ok(won)
    }

    /// Moves the clear-later set into the clear-now set. When anything moved,
    /// starts a local drain without waiting for it and publishes the trigger.
    ///
    /// A failed publish is logged; the moved keys are still drained here.
    ///
    /// Returns the number of keys moved.
    pub async fn start_clear_now_process(&self) -> CacheResult<i64> {
        let engine = &self.inner.engine;
        let moved = engine
            .storage()
            .smoveall(engine.clear_later_key(), engine.clear_now_key())
            .await?;
        metrics::record_keys_migrated(moved);

        if moved == 0 {
            debug!("cron: nothing queued to clear");
            return Ok(0);
        }

        drop(self.clear_now());
        info!(moved, "cron: broadcasting clear start message");
        if let Err(e) = engine
            .storage()
            .publish(&self.inner.settings.channel, START_CLEAR_MESSAGE)
            .await
        {
            error!(error = %e, "cron: failed to publish clear start message");
        }
        Ok(moved)
    }

    /// Starts draining the clear-now set, or joins the drain already running.
    ///
    /// The drain runs on its own task; dropping the returned future does not
    /// cancel it.
    pub fn clear_now(&self) -> Drain {
        let mut slot = self.inner.drain.lock();
        if let Some(drain) = slot.as_ref() {
            debug!("cron: clear already in progress");
            return drain.clone();
        }

        info!("cron: clearing started");
        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            let result = inner.engine.clear_now().await;
            *inner.drain.lock() = None;
            match &result {
                Ok(batches) => {
                    metrics::record_drain("ok");
                    info!(batches = batches.len(), "cron: clearing complete");
                }
                Err(e) => {
                    metrics::record_drain("error");
                    error!(error = %e, "cron: clearing failed");
                }
            }
            result
        });

        let drain = async move {
            match task.await {
                Ok(result) => result.map(Arc::new).map_err(Arc::new),
                Err(e) => Err(Arc::new(CacheError::Drain(e.to_string()))),
            }
        }
        .boxed()
        .shared();
        *slot = Some(drain.clone());
        drain
    }

    pub fn is_draining(&self) -> bool {
        self.inner.drain.lock().is_some()
    }

    /// Stops the ticker, the listener and the control loop.
    pub fn shutdown(&self) {
        self.stop_cron();
        self.inner.shutdown.cancel();
        self.inner.control.lock().take();
        *self.inner.listening.lock() = false;
        self.inner.engine.storage().unsubscribe_all();
        info!("cron: shut down");
    }

    fn events(&self) -> mpsc::UnboundedSender<Event> {
        let mut control = self.inner.control.lock();
        if let Some(tx) = control.as_ref().filter(|tx| !tx.is_closed()) {
            return tx.clone();
        }
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_control_loop(
            Arc::downgrade(&self.inner),
            rx,
            self.inner.shutdown.clone(),
        ));
        *control = Some(tx.clone());
        tx
    }
}

async fn run_ticker(
    period: Duration,
    events: mpsc::UnboundedSender<Event>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if events.send(Event::Tick).is_err() {
                    break;
                }
            }
        }
    }
    debug!("cron: ticker stopped");
}

async fn run_listener(
    mut messages: mpsc::UnboundedReceiver<Value>,
    events: mpsc::UnboundedSender<Event>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = messages.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        if message.as_str() != Some(START_CLEAR_MESSAGE) {
            warn!(message = %message, "cron: ignoring unknown message");
            continue;
        }
        if events.send(Event::Trigger).is_err() {
            break;
        }
    }
    debug!("cron: listener stopped");
}

async fn run_control_loop(
    inner: Weak<Inner>,
    mut events: mpsc::UnboundedReceiver<Event>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let Some(inner) = inner.upgrade() else { break };
        let coordinator = ClearCoordinator { inner };
        match event {
            Event::Tick => {
                if let Err(e) = coordinator.check_sync_key().await {
                    error!(error = %e, "cron: sync key check failed");
                }
            }
            Event::Trigger => {
                info!("cron: got message to clear");
                drop(coordinator.clear_now());
            }
        }
    }
    debug!("cron: control loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::CacheSettings;
    use cachelink_storage::{LocalStore, StorageAdapter};

    fn coordinator(interval: Duration) -> ClearCoordinator {
        let storage = Arc::new(StorageAdapter::new(Arc::new(LocalStore::new())).unwrap());
        let engine = Arc::new(CacheEngine::new(storage, CacheSettings::default()));
        ClearCoordinator::new(
            engine,
            CoordinatorSettings {
                interval,
                ..CoordinatorSettings::default()
            },
        )
    }

    #[test]
    fn test_lease_ttl_margin() {
        let settings = |secs| CoordinatorSettings {
            interval: Duration::from_secs(secs),
            ..CoordinatorSettings::default()
        };
        assert_eq!(settings(60).lease_ttl(), Duration::from_millis(59_500));
        assert_eq!(settings(1).lease_ttl(), Duration::from_millis(900));
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_first_sync_key_check_wins() {
        let a = coordinator(Duration::from_secs(60));
        let b = ClearCoordinator::new(a.engine().clone(), a.settings().clone());

        assert!(a.check_sync_key().await.unwrap());
        assert!(!b.check_sync_key().await.unwrap());

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(b.check_sync_key().await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_clear_now_joins_one_drain() {
        let c = coordinator(Duration::from_secs(60));
        let first = c.clear_now();
        let second = c.clear_now();
        assert!(c.is_draining());

        let (a, b) = tokio::join!(first, second);
        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
        assert!(!c.is_draining());
    }

    #[tokio::test]
    async fn test_start_cron_is_idempotent() {
        let c = coordinator(Duration::from_secs(60));
        c.start_cron();
        c.start_cron();
        assert!(c.is_cron_running());
        c.stop_cron();
        c.stop_cron();
        assert!(!c.is_cron_running());
    }
}
