use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use futures_util::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::SubscriptionMgrConfig;
use crate::errors::{NotifyError, Result};
use crate::persistence::SubscriptionStore;
use crate::services::notifier::{MetricsSnapshot, Notifier};
use crate::state::subscription::{
    Mode, PeriodicCounter, Subscription, SubscriptionConfig, SubscriptionRecord,
    SubscriptionState,
};
use crate::websocket::TunnelConfig;

pub type SubscriptionCb =
    Arc<dyn Fn(SubscriptionMgr, Subscription) -> BoxFuture<'static, ()> + Send + Sync>;
pub type TestNotificationCb =
    Arc<dyn Fn(SubscriptionMgr, Subscription) -> BoxFuture<'static, Result<()>> + Send + Sync>;
pub type NewTunnelCb = Arc<dyn Fn(&Subscription) -> Result<String> + Send + Sync>;

/// Hooks supplied by the owning service.
#[derive(Clone, Default)]
pub struct SubscriptionCallbacks {
    expired: Option<SubscriptionCb>,
    periodic: Option<SubscriptionCb>,
    test_notif: Option<TestNotificationCb>,
    new_tunnel: Option<NewTunnelCb>,
}

impl SubscriptionCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called once a subscription's expiry time has passed. The subscription
    /// is removed on the following tick.
    pub fn on_expired<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(SubscriptionMgr, Subscription) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.expired = Some(Arc::new(move |mgr: SubscriptionMgr, sub: Subscription| {
            f(mgr, sub).boxed()
        }));
        self
    }

    /// Called each time a periodic interval elapses on a ready subscription.
    /// The countdown restarts once `SubscriptionMgr::send_notification` succeeds.
    pub fn on_periodic<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(SubscriptionMgr, Subscription) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.periodic = Some(Arc::new(move |mgr: SubscriptionMgr, sub: Subscription| {
            f(mgr, sub).boxed()
        }));
        self
    }

    /// Must send the test notification and resolve with its outcome.
    pub fn on_test_notification<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(SubscriptionMgr, Subscription) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.test_notif = Some(Arc::new(move |mgr: SubscriptionMgr, sub: Subscription| {
            f(mgr, sub).boxed()
        }));
        self
    }

    /// Must expose the subscription's websocket upgrade handler on a route and
    /// return the route's external URI. Runs under the manager lock, so it must
    /// not call back into the manager.
    pub fn on_new_tunnel<F>(mut self, f: F) -> Self
    where
        F: Fn(&Subscription) -> Result<String> + Send + Sync + 'static,
    {
        self.new_tunnel = Some(Arc::new(f));
        self
    }
}

struct Shared {
    cfg: SubscriptionMgrConfig,
    tunnel_cfg: TunnelConfig,
    base_key: String,
    store: Arc<dyn SubscriptionStore>,
    callbacks: SubscriptionCallbacks,
    notifier: Notifier,
    subscriptions: Mutex<HashMap<String, Subscription>>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

/// Owns every subscription, keeps the store in sync and runs the scheduler.
///
/// Cloning yields another handle to the same manager. All cache reads and
/// writes, including the scheduler tick, are serialized by one lock;
/// notification sends happen outside it.
#[derive(Clone)]
pub struct SubscriptionMgr {
    shared: Arc<Shared>,
}

impl SubscriptionMgr {
    /// Create a manager and load the subscriptions found in `store`.
    /// Must be called from within a tokio runtime. The scheduler is started
    /// separately with `start`.
    pub fn new(
        cfg: SubscriptionMgrConfig,
        store: Arc<dyn SubscriptionStore>,
        callbacks: SubscriptionCallbacks,
    ) -> Result<Self> {
        info!("Creating new Subscription Manager");
        let notifier = Notifier::new(
            cfg.http_timeout(),
            cfg.sandbox.clone(),
            cfg.service.clone(),
            cfg.metrics_enabled,
        )?;

        let mgr = Self {
            shared: Arc::new(Shared {
                tunnel_cfg: cfg.tunnel(),
                base_key: cfg.base_key(),
                cfg,
                store,
                callbacks,
                notifier,
                subscriptions: Mutex::new(HashMap::new()),
                scheduler: Mutex::new(None),
            }),
        };
        mgr.restore()?;

        info!(
            count = mgr.shared.subscriptions.lock().len(),
            "Created Subscription Manager"
        );
        Ok(mgr)
    }

    pub fn config(&self) -> &SubscriptionMgrConfig {
        &self.shared.cfg
    }

    pub fn base_key(&self) -> &str {
        &self.shared.base_key
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.notifier.metrics()
    }

    /// Start the scheduler loop. Does nothing if it is already running.
    pub fn start(&self) {
        let mut scheduler = self.shared.scheduler.lock();
        if scheduler.is_some() {
            return;
        }

        let period = self.shared.cfg.tick();
        let shared = Arc::downgrade(&self.shared);
        *scheduler = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                SubscriptionMgr { shared }.tick();
            }
        }));
    }

    pub fn shutdown(&self) {
        if let Some(handle) = self.shared.scheduler.lock().take() {
            handle.abort();
            info!("Subscription Manager scheduler stopped");
        }
    }

    pub fn generate_subscription_id(&self) -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }

    pub fn create_subscription(
        &self,
        mut cfg: SubscriptionConfig,
        raw_json: impl Into<String>,
    ) -> Result<Subscription> {
        cfg.validate()?;
        if cfg.id.is_empty() {
            cfg.id = self.generate_subscription_id();
        }
        if self.shared.subscriptions.lock().contains_key(&cfg.id) {
            return Err(NotifyError::AlreadyExists(cfg.id));
        }

        let mut sub = Subscription::new(cfg, raw_json);
        sub.refresh_state(&self.shared.tunnel_cfg)?;
        let handshake = match self.process_subscription(&mut sub) {
            Ok(handshake) => handshake,
            Err(e) => {
                sub.close_tunnel();
                return Err(e);
            }
        };

        {
            let mut subs = self.shared.subscriptions.lock();
            if subs.contains_key(sub.id()) {
                sub.close_tunnel();
                return Err(NotifyError::AlreadyExists(sub.cfg.id.clone()));
            }
            if let Err(e) = self.persist(&sub) {
                sub.close_tunnel();
                return Err(e);
            }
            subs.insert(sub.cfg.id.clone(), sub.clone());
        }

        if handshake {
            self.spawn_test_notification(sub.clone());
        }
        info!(id = %sub.cfg.id, mode = sub.mode().as_str(), "Created subscription");
        Ok(sub)
    }

    /// Apply `sub.cfg` and `sub.raw_json` to the cached subscription with the same id.
    ///
    /// If processing fails after the state was re-derived, the new state is
    /// still persisted and the processing error is returned.
    pub fn update_subscription(&self, sub: &Subscription) -> Result<Subscription> {
        sub.cfg.validate()?;

        let (snapshot, processed) = {
            let mut subs = self.shared.subscriptions.lock();
            let cached = subs
                .get_mut(sub.id())
                .ok_or_else(|| NotifyError::NotFound(sub.cfg.id.clone()))?;

            // The cache entry is only replaced once the store holds the new state.
            let mut next = cached.clone();
            next.cfg = sub.cfg.clone();
            next.raw_json = sub.raw_json.clone();
            next.refresh_state(&self.shared.tunnel_cfg)?;
            let processed = self.process_subscription(&mut next);

            let old_key = self.store_key(&cached.cfg);
            let new_key = self.store_key(&next.cfg);
            self.persist(&next)?;
            if new_key != old_key {
                if let Err(e) = self.shared.store.delete(&old_key) {
                    let _ = self.shared.store.delete(&new_key);
                    return Err(e);
                }
            }
            *cached = next;
            (cached.clone(), processed)
        };

        if processed? {
            self.spawn_test_notification(snapshot.clone());
        }
        Ok(snapshot)
    }

    pub fn delete_subscription(&self, id: &str) -> Result<()> {
        let mut subs = self.shared.subscriptions.lock();
        if !subs.contains_key(id) {
            return Err(NotifyError::NotFound(id.to_string()));
        }
        self.del_subscription(&mut subs, id)
    }

    pub fn delete_all_subscriptions(&self) -> Result<()> {
        self.delete_filtered_subscriptions("", "")
    }

    /// Delete every subscription matching both filters; an empty filter matches all.
    /// Returns the first failure after attempting every deletion.
    pub fn delete_filtered_subscriptions(&self, app_id: &str, sub_type: &str) -> Result<()> {
        let mut subs = self.shared.subscriptions.lock();
        let ids: Vec<String> = subs
            .values()
            .filter(|s| matches_filter(&s.cfg, app_id, sub_type))
            .map(|s| s.cfg.id.clone())
            .collect();

        let mut first_err = None;
        for id in ids {
            if let Err(e) = self.del_subscription(&mut subs, &id) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    pub fn get_subscription(&self, id: &str) -> Result<Subscription> {
        self.shared
            .subscriptions
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| NotifyError::NotFound(id.to_string()))
    }

    pub fn get_all_subscriptions(&self) -> Vec<Subscription> {
        self.get_filtered_subscriptions("", "")
    }

    /// Subscriptions matching both filters, ordered by id.
    pub fn get_filtered_subscriptions(&self, app_id: &str, sub_type: &str) -> Vec<Subscription> {
        let mut list: Vec<Subscription> = self
            .shared
            .subscriptions
            .lock()
            .values()
            .filter(|s| matches_filter(&s.cfg, app_id, sub_type))
            .cloned()
            .collect();
        list.sort_by(|a, b| a.cfg.id.cmp(&b.cfg.id));
        list
    }

    pub fn ready_to_send(&self, sub: &Subscription) -> bool {
        let subs = self.shared.subscriptions.lock();
        let current = subs.get(sub.id()).unwrap_or(sub);
        if !current.is_ready() {
            return false;
        }
        !(current.cfg.periodic_interval > 0 && current.periodic() == PeriodicCounter::Outstanding)
    }

    /// Send `payload` to the subscription's registrant.
    ///
    /// Uses the cached entry when there is one, otherwise the given snapshot
    /// (final flush of a subscription removed after expiry). A successful send
    /// restarts an outstanding periodic countdown.
    pub async fn send_notification(&self, sub: &Subscription, payload: &[u8]) -> Result<()> {
        let target = self
            .shared
            .subscriptions
            .lock()
            .get(sub.id())
            .cloned()
            .unwrap_or_else(|| sub.clone());

        target
            .send_notification(&self.shared.notifier, payload)
            .await?;

        let mut subs = self.shared.subscriptions.lock();
        if let Some(cached) = subs.get_mut(sub.id()) {
            if cached.periodic() == PeriodicCounter::Outstanding {
                *cached.periodic_mut() = PeriodicCounter::restart(cached.cfg.periodic_interval);
            }
        }
        Ok(())
    }

    /// One scheduler pass: expiry sweep, then periodic sweep.
    pub fn tick(&self) {
        let callbacks = &self.shared.callbacks;
        let mut subs = self.shared.subscriptions.lock();
        let now = Utc::now();

        let mut expired = Vec::new();
        for sub in subs.values_mut() {
            if sub.state() == SubscriptionState::Expired {
                expired.push(sub.cfg.id.clone());
            } else if sub.cfg.expiry_time.is_some_and(|t| now > t) {
                sub.set_state(SubscriptionState::Expired);
                if let Some(cb) = &callbacks.expired {
                    debug!(id = %sub.cfg.id, "Invoking expiry callback");
                    tokio::spawn(cb(self.clone(), sub.clone()));
                }
            }
        }
        for id in expired {
            if let Err(e) = self.del_subscription(&mut subs, &id) {
                error!(id = %id, "Failed to remove expired subscription: {e}");
            }
        }

        let Some(cb) = &callbacks.periodic else {
            return;
        };
        for sub in subs.values_mut() {
            if sub.cfg.periodic_interval == 0 {
                continue;
            }
            sub.periodic_mut().tick();
            if sub.periodic() == PeriodicCounter::Idle && sub.is_ready() {
                *sub.periodic_mut() = PeriodicCounter::Outstanding;
                debug!(id = %sub.cfg.id, "Invoking periodic callback");
                tokio::spawn(cb(self.clone(), sub.clone()));
            }
        }
    }

    /// Side effects needing the owning service. Returns whether a test
    /// notification handshake must be dispatched.
    fn process_subscription(&self, sub: &mut Subscription) -> Result<bool> {
        match sub.mode() {
            Mode::Tunnel => {
                if !sub.tunnel_provisioned() {
                    self.provision_tunnel(sub)?;
                }
                Ok(false)
            }
            Mode::Direct => {
                if sub.state() == SubscriptionState::TestNotif
                    && !sub.test_notif_sent()
                    && sub.cfg.request_test_notif
                {
                    sub.set_test_notif_sent(true);
                    return Ok(true);
                }
                Ok(false)
            }
        }
    }

    fn provision_tunnel(&self, sub: &mut Subscription) -> Result<()> {
        let cb = self.shared.callbacks.new_tunnel.as_ref().ok_or_else(|| {
            NotifyError::Callback("no new tunnel callback configured".into())
        })?;
        let uri = cb(&*sub)
            .inspect_err(|e| error!(id = %sub.cfg.id, "New tunnel callback failed: {e}"))?;

        if let Some(conn) = sub.connection() {
            conn.set_uri(uri);
        }
        sub.set_tunnel_provisioned(true);
        Ok(())
    }

    /// Route registrations do not survive a restart.
    fn reprovision_tunnel(&self, sub: &mut Subscription) -> Result<()> {
        sub.refresh_state(&self.shared.tunnel_cfg)?;
        self.provision_tunnel(sub)?;
        self.persist(sub)
    }

    fn spawn_test_notification(&self, sub: Subscription) {
        let mgr = self.clone();
        let delay = self.shared.cfg.test_notif_delay();
        tokio::spawn(async move {
            sleep(delay).await;

            let result = match mgr.shared.callbacks.test_notif.clone() {
                Some(cb) => {
                    debug!(id = %sub.cfg.id, "Invoking test notification callback");
                    cb(mgr.clone(), sub.clone()).await
                }
                None => Err(NotifyError::Callback(
                    "no test notification callback configured".into(),
                )),
            };
            mgr.complete_test_notification(sub.id(), result);
        });
    }

    fn complete_test_notification(&self, id: &str, result: Result<()>) {
        let mut subs = self.shared.subscriptions.lock();
        let Some(sub) = subs.get_mut(id) else {
            return;
        };
        if sub.mode() != Mode::Direct || sub.state() != SubscriptionState::TestNotif {
            return;
        }

        match result {
            Ok(()) => {
                info!(id = %id, "Test notification succeeded");
                sub.set_state(SubscriptionState::Ready);
            }
            Err(e) => {
                warn!(id = %id, "Test notification failed: {e}");
                sub.set_test_notif_sent(false);
            }
        }
        if let Err(e) = self.persist(sub) {
            error!(id = %id, "Failed to store subscription: {e}");
        }
    }

    fn del_subscription(&self, subs: &mut HashMap<String, Subscription>, id: &str) -> Result<()> {
        let Some(sub) = subs.get(id) else {
            return Ok(());
        };
        sub.close_tunnel();
        self.shared.store.delete(&self.store_key(&sub.cfg))?;
        subs.remove(id);
        info!(id = %id, "Deleted subscription");
        Ok(())
    }

    fn store_key(&self, cfg: &SubscriptionConfig) -> String {
        format!(
            "{}app:{}:sub:{}:{}",
            self.shared.base_key, cfg.app_id, cfg.sub_type, cfg.id
        )
    }

    fn persist(&self, sub: &Subscription) -> Result<()> {
        let value = serde_json::to_value(sub.to_record())?;
        self.shared.store.set(&self.store_key(&sub.cfg), value)
    }

    fn restore(&self) -> Result<()> {
        let prefix = format!("{}app:", self.shared.base_key);
        let mut restored = HashMap::new();

        for (key, value) in self.shared.store.get_all(&prefix)? {
            let record: SubscriptionRecord = match serde_json::from_value(value) {
                Ok(record) => record,
                Err(e) => {
                    warn!(key = %key, "Skipping unreadable subscription record: {e}");
                    continue;
                }
            };

            let mut sub = Subscription::from_record(record);
            if sub.cfg.request_tunnel_uri {
                if let Err(e) = self.reprovision_tunnel(&mut sub) {
                    warn!(key = %key, "Skipping tunnel subscription: {e}");
                    sub.close_tunnel();
                    continue;
                }
            }
            debug!(id = %sub.cfg.id, "Restored subscription");
            restored.insert(sub.cfg.id.clone(), sub);
        }

        // Handshakes interrupted by the restart are dispatched again.
        let mut handshakes = Vec::new();
        for sub in restored.values_mut() {
            if matches!(self.process_subscription(sub), Ok(true)) {
                handshakes.push(sub.clone());
            }
        }
        *self.shared.subscriptions.lock() = restored;

        for sub in handshakes {
            self.spawn_test_notification(sub);
        }
        Ok(())
    }
}

fn matches_filter(cfg: &SubscriptionConfig, app_id: &str, sub_type: &str) -> bool {
    (app_id.is_empty() || cfg.app_id == app_id) && (sub_type.is_empty() || cfg.sub_type == sub_type)
}
