//! `ProxyRecord`: a single candidate's state as it moves through
//! NEW -> WAIT -> IN_ACTIVE / IN_BACKUP -> DISCARDED.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    New,
    Wait,
    InActive,
    InBackup,
    Discarded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyRecord {
    pub address: String,
    pub first_seen: i64,
    pub last_checked: i64,
    pub good: u32,
    pub bad: u32,
    pub fail: u32,
    pub anonymity: u8,
    pub supports_https: bool,
    pub supports_post: bool,
    pub status: Status,
}

impl ProxyRecord {
    pub fn new(address: String, now: i64) -> Self {
        Self {
            address,
            first_seen: now,
            last_checked: now,
            good: 0,
            bad: 0,
            fail: 0,
            anonymity: 0,
            supports_https: false,
            supports_post: false,
            status: Status::New,
        }
    }

    /// Server-side rate: `good / (good + bad + 1)`.
    pub fn rate(&self) -> f64 {
        f64::from(self.good) / f64::from(self.good + self.bad + 1)
    }

    pub fn record_success(&mut self, now: i64) {
        self.good += 1;
        self.fail = 0;
        self.last_checked = now;
    }

    pub fn record_failure(&mut self, now: i64) {
        self.bad += 1;
        self.fail += 1;
        self.last_checked = now;
    }
}

/// Client-side view of a proxy, carrying the server-seeded `base_rate`
/// used to warm up the smoothed rate before enough local samples exist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientProxyRecord {
    pub address: String,
    pub good: u32,
    pub bad: u32,
    pub fail: u32,
    pub base_rate: f64,
}

impl ClientProxyRecord {
    pub fn from_detail(address: String, server_good: u32, server_bad: u32) -> Self {
        let base_rate = 0.8 * f64::from(server_good) / f64::from(server_good + server_bad + 1);
        Self {
            address,
            good: 0,
            bad: 0,
            fail: 0,
            base_rate,
        }
    }

    /// Smoothed client-side rate: blends the server-seeded `base_rate`
    /// with locally observed good/bad counts, weighted by a warm-up
    /// factor `rho` that grows from 0 toward 1 as samples accumulate.
    /// Past 10 total samples the base rate is dropped entirely.
    pub fn rate(&self) -> f64 {
        let t = f64::from(self.good + self.bad);
        if t >= 10.0 {
            return f64::from(self.good) / (t + 1.0);
        }
        let rho = 2.0 * (1.0 / (1.0 + 2f64.powf(-t)) - 0.5);
        rho * f64::from(self.good) / (t + 1.0) + (1.0 - rho) * self.base_rate
    }

    pub fn record_success(&mut self) {
        self.good += 1;
        self.fail = 0;
    }

    pub fn record_failure(&mut self) {
        self.bad += 1;
        self.fail += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_rate_is_good_over_good_plus_bad_plus_one() {
        let mut r = ProxyRecord::new("1.2.3.4:8080".to_string(), 0);
        r.record_success(1);
        r.record_success(2);
        r.record_failure(3);
        assert_eq!(r.rate(), 2.0 / 4.0);
    }

    #[test]
    fn client_rate_warms_up_from_base_rate_toward_observed() {
        let c = ClientProxyRecord::from_detail("1.2.3.4:8080".to_string(), 8, 2);
        // at t=0, rho=0, so rate should equal base_rate exactly
        assert!((c.rate() - c.base_rate).abs() < 1e-9);
    }

    #[test]
    fn client_fail_streak_resets_on_success_but_bad_stays_cumulative() {
        let mut c = ClientProxyRecord::from_detail("1.2.3.4:8080".to_string(), 8, 2);
        c.record_failure();
        c.record_failure();
        assert_eq!(c.fail, 2);
        assert_eq!(c.bad, 2);
        c.record_success();
        assert_eq!(c.fail, 0);
        assert_eq!(c.bad, 2);
    }

    #[test]
    fn client_rate_drops_base_rate_past_ten_samples() {
        let mut c = ClientProxyRecord::from_detail("1.2.3.4:8080".to_string(), 8, 2);
        for _ in 0..9 {
            c.record_success();
        }
        c.record_failure();
        let t = f64::from(c.good + c.bad);
        assert!(t >= 10.0);
        assert_eq!(c.rate(), f64::from(c.good) / (t + 1.0));
    }
}
