//! Consumer-side proxy pools. `ClientPool` keeps its own ranked view of
//! a server's `/proxies?detail` feed with local feedback; `SimpleClientPool`
//! is a flat, periodically-refreshed filtered list.

use std::collections::HashMap;
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::ranked_tier::RankedTier;
use crate::record::ClientProxyRecord;
use crate::utils::error::{ProxyError, ProxyResult};

const POOL_RATIO: f64 = 0.8;

#[derive(Debug, Clone)]
pub struct ApiProxyEntry {
    pub address: String,
    pub success: u32,
    pub fail: u32,
}

#[derive(Debug, Clone)]
pub struct ClientPoolConfig {
    pub pool_size: usize,
    pub block_time: i64,
    pub max_fail_times: u32,
    pub update_interval: Duration,
}

struct TrashEntry {
    record: ClientProxyRecord,
    blocked_at: i64,
}

struct State {
    pool: RankedTier<String, ()>,
    backup: RankedTier<String, ()>,
    records: HashMap<String, ClientProxyRecord>,
    trash: HashMap<String, TrashEntry>,
    last_refresh: Option<Instant>,
}

/// The adaptive two-tier pool described in §4.5: `pool` is sampled most of
/// the time (`POOL_RATIO`), `backup` the rest; failures beyond
/// `max_fail_times` send a record to `trash` until `block_time` elapses.
pub struct ClientPool {
    config: ClientPoolConfig,
    state: Mutex<State>,
}

impl ClientPool {
    pub fn new(config: ClientPoolConfig) -> Self {
        let backup_size = config.pool_size * 5;
        let pool_size = config.pool_size;
        Self {
            config,
            state: Mutex::new(State {
                pool: RankedTier::new(pool_size),
                backup: RankedTier::new(backup_size),
                records: HashMap::new(),
                trash: HashMap::new(),
                last_refresh: None,
            }),
        }
    }

    /// Whether a refresh is due, given the configured throttle.
    pub async fn should_refresh(&self) -> bool {
        let state = self.state.lock().await;
        match state.last_refresh {
            None => true,
            Some(at) => at.elapsed() >= self.config.update_interval,
        }
    }

    /// Fold a fresh `/proxies?detail` response into the tiered structure.
    /// Known addresses keep their local state; new ones enter `pool` if
    /// there's room, else `backup` if they beat its worst member, else
    /// `trash`. A trashed address re-enters only once `block_time` has
    /// elapsed and `retain` has dropped it from `trash`.
    pub async fn update_proxy_list(&self, entries: Vec<ApiProxyEntry>, now: i64) {
        let mut state = self.state.lock().await;
        state.last_refresh = Some(Instant::now());

        let block_time = self.config.block_time;
        state.trash.retain(|_, e| now - e.blocked_at <= block_time);

        for entry in entries {
            if state.records.contains_key(&entry.address) {
                continue;
            }
            if let Some(trashed) = state.trash.get(&entry.address) {
                // Resurrect only if it's not still deep in its failure
                // streak; mirrors feed_back's own trash-resurrection gate.
                if trashed.record.fail <= self.config.max_fail_times {
                    let TrashEntry { record, .. } = state.trash.remove(&entry.address).unwrap();
                    Self::admit(&mut state, entry.address, record, now);
                }
                continue;
            }
            let record = ClientProxyRecord::from_detail(entry.address.clone(), entry.success, entry.fail);
            Self::admit(&mut state, entry.address, record, now);
        }
    }

    /// Admit a record that just succeeded (or is newly seen): try `pool`
    /// first, then `backup`, evicting backup's worst member if this one
    /// beats it. Never used for a record that just failed — see `demote`.
    fn admit(state: &mut State, addr: String, record: ClientProxyRecord, now: i64) {
        let rate = record.rate();
        state.records.insert(addr.clone(), record);
        if state.pool.insert(addr.clone(), (), rate, now) {
            return;
        }
        if state.backup.insert(addr.clone(), (), rate, now) {
            return;
        }
        if let Some((worst_addr, _, worst_rate)) = state.backup.worst() {
            if rate > worst_rate {
                state.backup.remove(&worst_addr);
                state.backup.insert(addr, (), rate, now);
                state.records.remove(&worst_addr);
                return;
            }
        }
        state.records.remove(&addr);
    }

    /// Admit a record that just failed (but stayed under `max_fail_times`):
    /// goes straight to `backup`, never back into `pool`. If it vacated a
    /// `pool` slot, backfill that slot from `backup`'s current best member,
    /// mirroring `manager.rs`'s active/backup displacement pattern in
    /// reverse.
    fn demote(state: &mut State, addr: String, record: ClientProxyRecord, now: i64, was_in_pool: bool) {
        let rate = record.rate();
        state.records.insert(addr.clone(), record);
        let placed = if state.backup.insert(addr.clone(), (), rate, now) {
            true
        } else if let Some((worst_addr, _, worst_rate)) = state.backup.worst() {
            if rate > worst_rate {
                state.backup.remove(&worst_addr);
                state.backup.insert(addr.clone(), (), rate, now);
                state.records.remove(&worst_addr);
                true
            } else {
                false
            }
        } else {
            false
        };
        if !placed {
            state.records.remove(&addr);
        }

        if was_in_pool {
            if let Some((best_addr, _, best_rate)) = state.backup.best() {
                if best_addr != addr {
                    state.backup.remove(&best_addr);
                    state.pool.insert(best_addr, (), best_rate, now);
                }
            }
        }
    }

    /// Sample an address, favoring `pool` with probability `POOL_RATIO`.
    /// The chosen tier's top member is moved to the back of its own rank
    /// by re-pushing it with a refreshed timestamp, approximating
    /// round-robin among equally-good entries.
    pub async fn get_proxy(&self, now: i64) -> ProxyResult<String> {
        let mut state = self.state.lock().await;
        let use_pool = rand::random::<f64>() < POOL_RATIO;

        let picked = if use_pool {
            state.pool.best().or_else(|| state.backup.best())
        } else {
            state.backup.best().or_else(|| state.pool.best())
        };

        let (addr, _, rate) = picked.ok_or(ProxyError::NoProxyAvailable)?;
        if state.pool.contains(&addr) {
            state.pool.insert(addr.clone(), (), rate, now);
        } else {
            state.backup.insert(addr.clone(), (), rate, now);
        }
        Ok(addr)
    }

    pub async fn feed_back(&self, addr: &str, ok: bool, now: i64) {
        let mut state = self.state.lock().await;

        // A request can still be in flight when its address gets trashed;
        // late feedback updates the trashed record's counters rather than
        // being dropped, and a sufficiently-successful streak resurrects it
        // straight back into the tiered structure ahead of block_time.
        if let Some(entry) = state.trash.get_mut(addr) {
            if entry.record.fail <= self.config.max_fail_times {
                if ok {
                    entry.record.record_success();
                } else {
                    entry.record.record_failure();
                }
                if entry.record.fail == 0 {
                    let TrashEntry { record, .. } = state.trash.remove(addr).unwrap();
                    Self::admit(&mut state, addr.to_string(), record, now);
                }
            }
            return;
        }

        let in_pool = state.pool.contains(&addr.to_string());
        let in_backup = state.backup.contains(&addr.to_string());
        if !in_pool && !in_backup {
            return;
        }

        let Some(mut record) = state.records.remove(addr) else { return };
        if ok {
            record.record_success();
        } else {
            record.record_failure();
        }

        if in_pool {
            state.pool.remove(&addr.to_string());
        } else {
            state.backup.remove(&addr.to_string());
        }

        if record.fail > self.config.max_fail_times {
            state.trash.insert(
                addr.to_string(),
                TrashEntry {
                    record,
                    blocked_at: now,
                },
            );
            return;
        }

        if ok {
            Self::admit(&mut state, addr.to_string(), record, now);
        } else {
            Self::demote(&mut state, addr.to_string(), record, now, in_pool);
        }
    }

    pub async fn pool_len(&self) -> usize {
        self.state.lock().await.pool.len()
    }

    pub async fn backup_len(&self) -> usize {
        self.state.lock().await.backup.len()
    }

    pub async fn trash_len(&self) -> usize {
        self.state.lock().await.trash.len()
    }
}

/// Degenerate flat variant: filters the API response by a floor success
/// rate and a minimum sample count, and samples uniformly at random.
pub struct SimpleClientPool {
    addresses: Mutex<Vec<String>>,
    min_success_rate: Option<f64>,
    min_count: u32,
}

impl SimpleClientPool {
    pub fn new(min_success_rate: Option<f64>, min_count: u32) -> Self {
        Self {
            addresses: Mutex::new(Vec::new()),
            min_success_rate,
            min_count,
        }
    }

    pub async fn update_proxy_list(&self, entries: Vec<ApiProxyEntry>) {
        let filtered = entries
            .into_iter()
            .filter(|e| e.success + e.fail >= self.min_count)
            .filter(|e| {
                self.min_success_rate
                    .map(|floor| {
                        let rate = f64::from(e.success) / f64::from(e.success + e.fail).max(1.0);
                        rate >= floor
                    })
                    .unwrap_or(true)
            })
            .map(|e| e.address)
            .collect();
        *self.addresses.lock().await = filtered;
    }

    pub async fn get_proxy(&self) -> ProxyResult<String> {
        let addresses = self.addresses.lock().await;
        addresses
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or(ProxyError::NoProxyAvailable)
    }

    pub async fn len(&self) -> usize {
        self.addresses.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.addresses.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(n: u32) -> Vec<ApiProxyEntry> {
        (0..n)
            .map(|i| ApiProxyEntry {
                address: format!("10.0.0.{}:8080", i),
                success: 10 - i,
                fail: i,
            })
            .collect()
    }

    #[tokio::test]
    async fn simple_pool_filters_by_min_success_rate() {
        let pool = SimpleClientPool::new(Some(0.8), 0);
        pool.update_proxy_list(entries(10)).await;
        // success=10..1, fail=0..9 -> rate = success/(success+fail)
        // item i: success=10-i, fail=i, rate=(10-i)/10
        // rate >= 0.8 means 10-i >= 8 means i <= 2 -> indices 0,1,2 (3 items)
        assert_eq!(pool.len().await, 3);
    }

    /// spec.md §8 scenario 4, literal numbers: 10 items with
    /// `success=10..1, fail=1` (constant), `minSuccessRate=0.8` qualifies
    /// exactly the first 7.
    #[tokio::test]
    async fn simple_pool_scenario_four_constant_fail_qualifies_seven() {
        let pool = SimpleClientPool::new(Some(0.8), 0);
        let scenario: Vec<ApiProxyEntry> = (0..10)
            .map(|i| ApiProxyEntry {
                address: format!("10.0.0.{}:8080", i),
                success: 10 - i,
                fail: 1,
            })
            .collect();
        pool.update_proxy_list(scenario).await;
        assert_eq!(pool.len().await, 7);
    }

    #[tokio::test]
    async fn client_pool_demotes_on_feedback_failure_and_promotes_backup() {
        let config = ClientPoolConfig {
            pool_size: 2,
            block_time: 7200,
            max_fail_times: 2,
            update_interval: Duration::from_secs(60),
        };
        let pool = ClientPool::new(config);
        pool.update_proxy_list(entries(12), 0).await;

        assert_eq!(pool.pool_len().await, 2);
        assert!(pool.backup_len().await > 0);

        let top_addr = {
            let mut state = pool.state.lock().await;
            let (addr, _, _) = state.pool.best().unwrap();
            addr
        };

        pool.feed_back(&top_addr, false, 1).await;
        // one failure within max_fail_times: demoted to backup (never back
        // into pool), and backup's best member backfills the vacated slot.
        assert_eq!(pool.trash_len().await, 0);
        {
            let mut state = pool.state.lock().await;
            assert!(!state.pool.contains(&top_addr));
            assert!(state.backup.contains(&top_addr));
            assert_eq!(state.pool.len(), 2);
        }

        pool.feed_back(&top_addr, false, 2).await;
        pool.feed_back(&top_addr, false, 3).await;
        assert_eq!(pool.trash_len().await, 1);
        assert!(!pool.state.lock().await.backup.contains(&top_addr));
    }
}
