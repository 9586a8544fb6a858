//! Orchestrates the lifecycle of every known proxy: admission, periodic
//! re-checking, promotion/demotion between the active and backup tiers,
//! and eventual forgetting.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{info, warn};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::priority_index::PriorityIndex;
use crate::ranked_tier::RankedTier;
use crate::record::ProxyRecord;
use crate::utils::shutdown::register_for_shutdown;
use crate::validator::Validator;

const EXPIRY_POLL_INTERVAL: Duration = Duration::from_secs(5);
const SUPERVISOR_INTERVAL: Duration = Duration::from_secs(600);

fn now() -> i64 {
    Utc::now().timestamp()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tier {
    Active,
    Backup,
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub queue_size: usize,
    pub backup_size: usize,
    pub block_time: i64,
    pub max_fail_times: u32,
    pub check_interval: i64,
    pub checker_clients: usize,
    pub min_anonymity: u8,
    pub wait_queue_capacity: usize,
    pub label_queue_capacity: usize,
}

struct Inner {
    seen: Mutex<HashMap<String, ProxyRecord>>,
    location: Mutex<HashMap<String, Tier>>,
    active: Mutex<RankedTier<String, ()>>,
    backup: Mutex<RankedTier<String, ()>>,
    time_line: Mutex<PriorityIndex<String, (), i64>>,
    tasks: Mutex<Vec<(String, JoinHandle<()>)>>,
}

pub struct Manager {
    inner: Arc<Inner>,
    config: ManagerConfig,
    validator: Arc<dyn Validator>,
    origin_ip: String,
    wait_tx: mpsc::Sender<String>,
    wait_rx: Mutex<Option<mpsc::Receiver<String>>>,
    label_tx: mpsc::Sender<String>,
    label_rx: Mutex<Option<mpsc::Receiver<String>>>,
}

/// A filtered, ordered snapshot of one record, matching the `/proxies`
/// wire contract — `timestamp` reported is the *last check time*.
#[derive(Debug, Clone)]
pub struct ProxyDetail {
    pub address: String,
    pub success: u32,
    pub fail: u32,
    pub timestamp: i64,
    pub anonymity: u8,
    pub https: bool,
    pub post: bool,
    pub rate: f64,
}

impl Manager {
    pub fn new(config: ManagerConfig, validator: Arc<dyn Validator>, origin_ip: String) -> Self {
        let (wait_tx, wait_rx) = mpsc::channel(config.wait_queue_capacity);
        let (label_tx, label_rx) = mpsc::channel(config.label_queue_capacity);
        let active = RankedTier::new(config.queue_size);
        let backup = RankedTier::new(config.backup_size);
        Self {
            inner: Arc::new(Inner {
                seen: Mutex::new(HashMap::new()),
                location: Mutex::new(HashMap::new()),
                active: Mutex::new(active),
                backup: Mutex::new(backup),
                time_line: Mutex::new(PriorityIndex::new(config.queue_size + config.backup_size)),
                tasks: Mutex::new(Vec::new()),
            }),
            config,
            validator,
            origin_ip,
            wait_tx,
            wait_rx: Mutex::new(Some(wait_rx)),
            label_tx,
            label_rx: Mutex::new(Some(label_rx)),
        }
    }

    /// Admit a freshly scraped address. Known addresses inside the block
    /// window are dropped silently — this makes repeated admission of the
    /// same address within `block_time` a no-op.
    pub async fn add_proxy(&self, addr: String) {
        let n = now();
        let mut seen = self.inner.seen.lock().await;
        if let Some(existing) = seen.get(&addr) {
            if n - existing.first_seen <= self.config.block_time {
                return;
            }
        }
        let record = ProxyRecord::new(addr.clone(), n);
        seen.insert(addr.clone(), record);
        drop(seen);

        // time_line only ever tracks records placed in active/backup
        // (pushed by feedback()'s success/failure paths); a freshly
        // admitted, not-yet-checked record has no expiry entry.
        if self.wait_tx.try_send(addr).is_err() {
            // wait_queue full: drop rather than block the admitting caller
            // (spec's documented backpressure choice).
        }
    }

    /// Spawn every long-running task. Returns once all tasks are spawned;
    /// the tasks themselves run until shutdown.
    pub async fn run(self: Arc<Self>) {
        let wait_rx = self.wait_rx.lock().await.take().expect("run() called once");
        let label_rx = self.label_rx.lock().await.take().expect("run() called once");

        self.spawn_named("expiry", self.clone().expiry_loop()).await;
        self.spawn_named("block-list-gc", self.clone().gc_loop()).await;
        self.spawn_named("supervisor", self.clone().supervisor_loop()).await;

        let wait_rx = Arc::new(Mutex::new(wait_rx));
        for i in 0..self.config.checker_clients {
            let this = self.clone();
            let rx = wait_rx.clone();
            self.spawn_named(&format!("check-worker-{}", i), async move {
                this.check_worker(rx).await
            })
            .await;
        }

        let label_rx = Arc::new(Mutex::new(label_rx));
        for i in 0..self.config.checker_clients {
            let this = self.clone();
            let rx = label_rx.clone();
            self.spawn_named(&format!("label-worker-{}", i), async move {
                this.label_worker(rx).await
            })
            .await;
        }
    }

    async fn spawn_named<F>(&self, name: &str, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(fut);
        self.inner.tasks.lock().await.push((name.to_string(), handle));
    }

    async fn expiry_loop(self: Arc<Self>) {
        let mut shutdown_rx = register_for_shutdown("manager:expiry").await;
        loop {
            let n = now();
            let expired = {
                let mut tl = self.inner.time_line.lock().await;
                tl.top().map(|(k, _, p)| (k.clone(), -*p)).filter(|(_, ts)| *ts < n)
            };
            match expired {
                Some((addr, _)) => {
                    self.inner.time_line.lock().await.delete(&addr);
                    let mut location = self.inner.location.lock().await;
                    if let Some(tier) = location.remove(&addr) {
                        match tier {
                            Tier::Active => {
                                self.inner.active.lock().await.remove(&addr);
                            }
                            Tier::Backup => {
                                self.inner.backup.lock().await.remove(&addr);
                            }
                        }
                    }
                    drop(location);
                    let _ = self.wait_tx.try_send(addr);
                }
                None => {
                    tokio::select! {
                        _ = shutdown_rx.recv() => return,
                        _ = tokio::time::sleep(EXPIRY_POLL_INTERVAL) => {}
                    }
                }
            }
        }
    }

    async fn check_worker(self: Arc<Self>, rx: Arc<Mutex<mpsc::Receiver<String>>>) {
        let mut shutdown_rx = register_for_shutdown("manager:check-worker").await;
        loop {
            let addr = {
                let mut guard = rx.lock().await;
                tokio::select! {
                    _ = shutdown_rx.recv() => return,
                    addr = guard.recv() => addr,
                }
            };
            let Some(addr) = addr else { return };

            let outcome = self.validator.check(&addr, false, &self.origin_ip).await;
            let n = now();
            self.feedback(&addr, outcome.ok, outcome.anonymity, n).await;
            if outcome.ok {
                let _ = self.label_tx.try_send(addr);
            }
        }
    }

    async fn feedback(&self, addr: &str, ok: bool, anonymity: u8, n: i64) {
        let mut seen = self.inner.seen.lock().await;
        let Some(record) = seen.get_mut(addr) else { return };
        let new_timestamp = n + self.config.check_interval;

        if ok && anonymity >= self.config.min_anonymity {
            record.record_success(n);
            record.anonymity = anonymity;
            let rate = record.rate();
            drop(seen);

            self.inner.time_line.lock().await.push(addr.to_string(), (), -new_timestamp);
            let mut active = self.inner.active.lock().await;
            if active.insert(addr.to_string(), (), rate, new_timestamp) {
                self.inner.location.lock().await.insert(addr.to_string(), Tier::Active);
                return;
            }
            // active full: displace the worst member if this one beats it.
            if let Some((worst_addr, _, worst_rate)) = active.worst() {
                if rate > worst_rate {
                    active.remove(&worst_addr);
                    active.insert(addr.to_string(), (), rate, new_timestamp);
                    self.inner.location.lock().await.insert(addr.to_string(), Tier::Active);
                    drop(active);

                    // Displaced record falls through to backup.
                    let mut backup = self.inner.backup.lock().await;
                    let worst_backup_rate =
                        if backup.is_full() { backup.worst().map(|(_, _, r)| r) } else { None };
                    let fits = !backup.is_full()
                        || worst_backup_rate.map(|wr| worst_rate > wr).unwrap_or(false);
                    if fits {
                        if backup.is_full() {
                            if let Some((wa, _, _)) = backup.worst() {
                                backup.remove(&wa);
                                self.inner.location.lock().await.remove(&wa);
                            }
                        }
                        backup.insert(worst_addr.clone(), (), worst_rate, new_timestamp);
                        self.inner.location.lock().await.insert(worst_addr, Tier::Backup);
                    } else {
                        self.inner.location.lock().await.remove(&worst_addr);
                        self.inner.time_line.lock().await.delete(&worst_addr);
                    }
                    return;
                }
            }
            drop(active);
            // Didn't beat active's worst: try backup directly, same as a
            // failing record would.
            let mut backup = self.inner.backup.lock().await;
            if backup.insert(addr.to_string(), (), rate, new_timestamp) {
                self.inner.location.lock().await.insert(addr.to_string(), Tier::Backup);
                return;
            }
            if let Some((worst_addr, _, worst_rate)) = backup.worst() {
                if rate > worst_rate {
                    backup.remove(&worst_addr);
                    backup.insert(addr.to_string(), (), rate, new_timestamp);
                    self.inner.location.lock().await.insert(addr.to_string(), Tier::Backup);
                    self.inner.location.lock().await.remove(&worst_addr);
                    self.inner.time_line.lock().await.delete(&worst_addr);
                    return;
                }
            }
            self.inner.time_line.lock().await.delete(addr);
            return;
        }

        record.record_failure(n);
        let fail = record.fail;
        let rate = record.rate();
        drop(seen);

        if fail > self.config.max_fail_times {
            self.discard(addr).await;
            return;
        }

        self.inner.time_line.lock().await.push(addr.to_string(), (), -new_timestamp);
        let mut backup = self.inner.backup.lock().await;
        if backup.insert(addr.to_string(), (), rate, new_timestamp) {
            self.inner.location.lock().await.insert(addr.to_string(), Tier::Backup);
            return;
        }
        if let Some((worst_addr, _, worst_rate)) = backup.worst() {
            if rate > worst_rate {
                backup.remove(&worst_addr);
                backup.insert(addr.to_string(), (), rate, new_timestamp);
                self.inner.location.lock().await.insert(addr.to_string(), Tier::Backup);
                self.inner.location.lock().await.remove(&worst_addr);
                self.inner.time_line.lock().await.delete(&worst_addr);
                return;
            }
        }
        // Doesn't fit anywhere: stays only in `seen` until block_time GC.
        self.inner.time_line.lock().await.delete(addr);
    }

    async fn discard(&self, addr: &str) {
        let mut location = self.inner.location.lock().await;
        if let Some(tier) = location.remove(addr) {
            match tier {
                Tier::Active => {
                    self.inner.active.lock().await.remove(addr);
                }
                Tier::Backup => {
                    self.inner.backup.lock().await.remove(addr);
                }
            }
        }
        drop(location);
        self.inner.time_line.lock().await.delete(addr);
        // Stays in `seen` (marking it effectively discarded) until the
        // block-list GC forgets it after block_time.
    }

    async fn label_worker(self: Arc<Self>, rx: Arc<Mutex<mpsc::Receiver<String>>>) {
        let mut shutdown_rx = register_for_shutdown("manager:label-worker").await;
        loop {
            let addr = {
                let mut guard = rx.lock().await;
                tokio::select! {
                    _ = shutdown_rx.recv() => return,
                    addr = guard.recv() => addr,
                }
            };
            let Some(addr) = addr else { return };

            let n = now();
            let stale = {
                let seen = self.inner.seen.lock().await;
                match seen.get(&addr) {
                    Some(record) => record.last_checked < n && record.last_checked + self.config.check_interval < n,
                    None => true,
                }
            };
            if stale {
                continue;
            }

            let outcome = self.validator.check(&addr, true, &self.origin_ip).await;
            let supports_https = outcome.ok && outcome.anonymity > 0;
            let supports_post = self.validator.verify_post(&addr).await;

            let mut seen = self.inner.seen.lock().await;
            if let Some(record) = seen.get_mut(&addr) {
                record.supports_https = supports_https;
                record.supports_post = supports_post;
            }
        }
    }

    async fn gc_loop(self: Arc<Self>) {
        let mut shutdown_rx = register_for_shutdown("manager:gc").await;
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => return,
                _ = tokio::time::sleep(Duration::from_secs(self.config.block_time.max(1) as u64)) => {}
            }
            let n = now();
            let location = self.inner.location.lock().await;
            let mut seen = self.inner.seen.lock().await;
            // Only forget records that are neither active nor backup (i.e.
            // discarded, or never placed anywhere) and have aged past
            // block_time; records still in a tier stay in `seen` regardless
            // of age.
            seen.retain(|addr, record| {
                location.contains_key(addr) || n - record.last_checked <= self.config.block_time
            });
        }
    }

    async fn supervisor_loop(self: Arc<Self>) {
        let mut shutdown_rx = register_for_shutdown("manager:supervisor").await;
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => return,
                _ = tokio::time::sleep(SUPERVISOR_INTERVAL) => {}
            }
            // Snapshot the task list before inspecting it, rather than
            // iterating while another task could still be pushing into it.
            let snapshot: Vec<(String, bool)> = {
                let tasks = self.inner.tasks.lock().await;
                tasks.iter().map(|(name, h)| (name.clone(), h.is_finished())).collect()
            };
            for (name, finished) in snapshot {
                if finished {
                    warn!("worker task '{}' has ended and will not be restarted", name);
                } else {
                    info!("worker task '{}' is healthy", name);
                }
            }
        }
    }

    /// Snapshot of active ∪ backup records matching the given filters, for
    /// the HTTP API.
    pub async fn list_proxies(
        &self,
        min_anonymity: u8,
        require_https: bool,
        require_post: bool,
    ) -> Vec<ProxyDetail> {
        let location = self.inner.location.lock().await;
        let seen = self.inner.seen.lock().await;
        location
            .keys()
            .filter_map(|addr| seen.get(addr))
            .filter(|r| r.anonymity >= min_anonymity)
            .filter(|r| !require_https || r.supports_https)
            .filter(|r| !require_post || r.supports_post)
            .map(|r| ProxyDetail {
                address: r.address.clone(),
                success: r.good,
                fail: r.bad,
                timestamp: r.last_checked,
                anonymity: r.anonymity,
                https: r.supports_https,
                post: r.supports_post,
                rate: r.rate(),
            })
            .collect()
    }

    /// Test-only seam: place a fully-formed record directly into `seen`
    /// and the active tier's `location` map, bypassing the check/label
    /// pipeline, for tests that only care about `list_proxies` filtering
    /// and ranking (e.g. the API handler's own tests).
    #[cfg(test)]
    pub async fn seed_test_record(
        &self,
        addr: &str,
        good: u32,
        bad: u32,
        anonymity: u8,
        https: bool,
        post: bool,
    ) {
        let mut record = ProxyRecord::new(addr.to_string(), now());
        record.good = good;
        record.bad = bad;
        record.anonymity = anonymity;
        record.supports_https = https;
        record.supports_post = post;
        self.inner.seen.lock().await.insert(addr.to_string(), record);
        self.inner.location.lock().await.insert(addr.to_string(), Tier::Active);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validator::CheckOutcome;
    use async_trait::async_trait;

    struct AlwaysOk;

    #[async_trait]
    impl Validator for AlwaysOk {
        async fn check(&self, _address: &str, _https: bool, _origin_ip: &str) -> CheckOutcome {
            CheckOutcome {
                ok: true,
                anonymity: 2,
                supports_https: true,
            }
        }
        async fn verify_post(&self, _address: &str) -> bool {
            true
        }
    }

    fn test_config() -> ManagerConfig {
        ManagerConfig {
            queue_size: 3,
            backup_size: 30,
            block_time: 7200,
            max_fail_times: 2,
            check_interval: 300,
            checker_clients: 1,
            min_anonymity: 0,
            wait_queue_capacity: 64,
            label_queue_capacity: 64,
        }
    }

    #[tokio::test]
    async fn admission_is_idempotent_within_block_time() {
        let manager = Manager::new(test_config(), Arc::new(AlwaysOk), "1.1.1.1".to_string());
        manager.add_proxy("1.2.3.4:8080".to_string()).await;
        manager.add_proxy("1.2.3.4:8080".to_string()).await;
        assert_eq!(manager.inner.seen.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn successful_feedback_resets_fail_and_grows_good() {
        let manager = Manager::new(test_config(), Arc::new(AlwaysOk), "1.1.1.1".to_string());
        manager.add_proxy("1.2.3.4:8080".to_string()).await;
        manager.feedback("1.2.3.4:8080", true, 2, now()).await;
        let seen = manager.inner.seen.lock().await;
        let record = seen.get("1.2.3.4:8080").unwrap();
        assert_eq!(record.fail, 0);
        assert_eq!(record.good, 1);
    }

    #[tokio::test]
    async fn exceeding_max_fail_times_discards_record() {
        let manager = Manager::new(test_config(), Arc::new(AlwaysOk), "1.1.1.1".to_string());
        manager.add_proxy("1.2.3.4:8080".to_string()).await;
        manager.feedback("1.2.3.4:8080", false, 0, now()).await;
        manager.feedback("1.2.3.4:8080", false, 0, now()).await;
        manager.feedback("1.2.3.4:8080", false, 0, now()).await;
        assert!(!manager.inner.location.lock().await.contains_key("1.2.3.4:8080"));
        assert!(manager.inner.seen.lock().await.contains_key("1.2.3.4:8080"));
    }

    #[tokio::test]
    async fn active_displacement_falls_through_to_backup() {
        let manager = Manager::new(test_config(), Arc::new(AlwaysOk), "1.1.1.1".to_string());
        for i in 0..3 {
            let addr = format!("10.0.0.{}:8080", i);
            manager.add_proxy(addr.clone()).await;
            manager.feedback(&addr, true, 2, now()).await;
        }
        assert_eq!(manager.inner.active.lock().await.len(), 3);

        manager.add_proxy("10.0.0.9:8080".to_string()).await;
        {
            let mut seen = manager.inner.seen.lock().await;
            let r = seen.get_mut("10.0.0.9:8080").unwrap();
            r.good = 100;
        }
        manager.feedback("10.0.0.9:8080", true, 2, now()).await;

        assert_eq!(manager.inner.active.lock().await.len(), 3);
        assert!(manager.inner.active.lock().await.contains("10.0.0.9:8080"));
    }

    /// Mirrors spec.md §8 scenario 6: filter to `anonymity==2 && https`,
    /// then rank by rate and keep the top 3.
    #[tokio::test]
    async fn list_proxies_filters_and_ranks_like_scenario_six() {
        let manager = Manager::new(test_config(), Arc::new(AlwaysOk), "1.1.1.1".to_string());
        let specs: [(&str, u32, u32, u8, bool); 6] = [
            ("10.0.0.1:8080", 90, 10, 2, true),  // qualifies, rate ~0.891
            ("10.0.0.2:8080", 80, 20, 2, true),  // qualifies, rate ~0.792
            ("10.0.0.3:8080", 70, 30, 2, true),  // qualifies, rate ~0.693
            ("10.0.0.4:8080", 60, 40, 2, true),  // qualifies but lowest -> dropped by count=3
            ("10.0.0.5:8080", 95, 5, 1, true),   // anonymity too low
            ("10.0.0.6:8080", 99, 1, 2, false),  // no https
        ];
        {
            let mut seen = manager.inner.seen.lock().await;
            let mut location = manager.inner.location.lock().await;
            for (addr, good, bad, anonymity, https) in specs {
                let mut record = ProxyRecord::new(addr.to_string(), now());
                record.good = good;
                record.bad = bad;
                record.anonymity = anonymity;
                record.supports_https = https;
                seen.insert(addr.to_string(), record);
                location.insert(addr.to_string(), Tier::Active);
            }
        }

        let mut records = manager.list_proxies(2, true, false).await;
        records.sort_by(|a, b| b.rate.partial_cmp(&a.rate).unwrap());
        records.truncate(3);

        let addrs: Vec<&str> = records.iter().map(|r| r.address.as_str()).collect();
        assert_eq!(addrs, vec!["10.0.0.1:8080", "10.0.0.2:8080", "10.0.0.3:8080"]);
    }
}
