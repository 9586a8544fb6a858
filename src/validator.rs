//! Anonymity probes: does a candidate proxy forward traffic, and if so,
//! how much of the caller's identity does it leak.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use regex::Regex;
use serde_json::Value;

use crate::utils::http::{build_get, build_get_origin_form, build_post_form, send_direct, send_via_proxy, send_via_proxy_tls};

const HTTPBIN_HOST: &str = "httpbin.org";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckOutcome {
    pub ok: bool,
    pub anonymity: u8,
    pub supports_https: bool,
}

impl CheckOutcome {
    fn fail() -> Self {
        Self {
            ok: false,
            anonymity: 0,
            supports_https: false,
        }
    }
}

#[async_trait]
pub trait Validator: Send + Sync {
    async fn check(&self, address: &str, https: bool, origin_ip: &str) -> CheckOutcome;
    async fn verify_post(&self, address: &str) -> bool;
}

fn seed() -> String {
    let n: u64 = rand::thread_rng().gen();
    format!("{:x}", n)
}

/// Probes a candidate through httpbin.org's echo endpoints, the same
/// scheme the reference harvester uses.
pub struct HttpbinValidator {
    pub timeout: Duration,
}

#[async_trait]
impl Validator for HttpbinValidator {
    async fn check(&self, address: &str, https: bool, origin_ip: &str) -> CheckOutcome {
        let nonce = seed();
        let path = format!("/get?show_env=1&seed={}", nonce);
        let headers = crate::utils::http::default_scraper_headers();

        let resp = if https {
            let req = build_get_origin_form(&path, HTTPBIN_HOST, &headers);
            match send_via_proxy_tls(address, HTTPBIN_HOST, 443, &req, self.timeout).await {
                Ok(r) => r,
                Err(_) => return CheckOutcome::fail(),
            }
        } else {
            let url = format!("http://{}{}", HTTPBIN_HOST, path);
            let req = build_get(&url, HTTPBIN_HOST, &headers);
            match send_via_proxy(address, &req, self.timeout).await {
                Ok(r) => r,
                Err(_) => return CheckOutcome::fail(),
            }
        };
        if !resp.is_success() {
            return CheckOutcome::fail();
        }
        let body: Value = match serde_json::from_slice(&resp.body) {
            Ok(v) => v,
            Err(_) => return CheckOutcome::fail(),
        };
        let echoed_seed = body
            .get("args")
            .and_then(|a| a.get("seed"))
            .and_then(|s| s.as_str());
        if echoed_seed != Some(nonce.as_str()) {
            return CheckOutcome::fail();
        }

        let origin = body.get("origin").and_then(|v| v.as_str()).unwrap_or("");
        let headers = body.get("headers").cloned().unwrap_or(Value::Null);
        let via = headers.get("Via").and_then(|v| v.as_str()).unwrap_or("");
        let has_proxy_connection = headers.get("Proxy-Connection").is_some();

        let anonymity = if origin.contains(origin_ip) {
            0
        } else if origin.contains(',') || via.contains(',') || has_proxy_connection {
            1
        } else {
            2
        };

        CheckOutcome {
            ok: true,
            anonymity,
            supports_https: https,
        }
    }

    async fn verify_post(&self, address: &str) -> bool {
        let nonce = seed();
        let url = format!("http://{}/post", HTTPBIN_HOST);
        let form = format!("seed={}", nonce);
        let req = build_post_form(&url, HTTPBIN_HOST, &form);

        let resp = match send_via_proxy(address, &req, self.timeout).await {
            Ok(r) => r,
            Err(_) => return false,
        };
        if !resp.is_success() {
            return false;
        }
        let body: Value = match serde_json::from_slice(&resp.body) {
            Ok(v) => v,
            Err(_) => return false,
        };
        body.get("form")
            .and_then(|f| f.get("seed"))
            .and_then(|s| s.as_str())
            == Some(nonce.as_str())
    }
}

/// Matches a response against a configurable status/url/body pattern
/// rather than the fixed httpbin echo. Pattern semantics follow
/// `match_status` below.
pub struct ResponseMatchValidator {
    pub timeout: Duration,
    pub target_url: String,
    pub target_host: String,
    pub status_pattern: String,
}

#[async_trait]
impl Validator for ResponseMatchValidator {
    async fn check(&self, address: &str, https: bool, _origin_ip: &str) -> CheckOutcome {
        let req = build_get(&self.target_url, &self.target_host, &crate::utils::http::default_scraper_headers());
        let resp = match send_via_proxy(address, &req, self.timeout).await {
            Ok(r) => r,
            Err(_) => return CheckOutcome::fail(),
        };
        if match_status(&self.status_pattern, resp.status) {
            CheckOutcome {
                ok: true,
                anonymity: 0,
                supports_https: https,
            }
        } else {
            CheckOutcome::fail()
        }
    }

    async fn verify_post(&self, _address: &str) -> bool {
        false
    }
}

/// Match an HTTP status code against a pattern: a plain integer matches
/// exactly; a string pattern prefixed with `!` or `~` negates the match;
/// `x`/`X` characters are wildcard digits. The pattern length must equal
/// the number of digits in `status`, or the match always fails.
pub fn match_status(pattern: &str, status: u16) -> bool {
    let (negate, body) = match pattern.strip_prefix('!').or_else(|| pattern.strip_prefix('~')) {
        Some(rest) => (true, rest),
        None => (false, pattern),
    };

    let status_str = status.to_string();
    let matches = if body.chars().all(|c| c.is_ascii_digit()) {
        body == status_str
    } else {
        body.len() == status_str.len()
            && body
                .chars()
                .zip(status_str.chars())
                .all(|(p, s)| p == 'x' || p == 'X' || p == s)
    };

    if negate {
        !matches
    } else {
        matches
    }
}

/// Single unproxied GET used to discover this host's own public IP.
/// Failure here is fatal: without it the engine cannot tell a
/// transparent proxy (which leaks the origin) from an anonymous one.
pub async fn get_origin_ip(timeout: Duration) -> Option<String> {
    let url = format!("http://{}/get", HTTPBIN_HOST);
    let req = build_get(&url, HTTPBIN_HOST, &crate::utils::http::default_scraper_headers());
    let resp = send_direct(HTTPBIN_HOST, 80, &req, timeout).await.ok()?;
    if !resp.is_success() {
        return None;
    }
    let body: Value = serde_json::from_slice(&resp.body).ok()?;
    let origin = body.get("origin").and_then(|v| v.as_str())?;
    let re = Regex::new(r"^\d{1,3}(\.\d{1,3}){3}$").unwrap();
    if re.is_match(origin) {
        Some(origin.to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn match_status_exact_integer() {
        assert!(match_status("200", 200));
        assert!(!match_status("200", 404));
    }

    #[test]
    fn match_status_wildcard_class() {
        assert!(match_status("2xx", 200));
        assert!(match_status("2xx", 299));
        assert!(!match_status("2xx", 301));
    }

    #[test]
    fn match_status_negated_wildcard() {
        assert!(match_status("!20X", 400));
        assert!(!match_status("!20X", 200));
    }

    #[test]
    fn match_status_leading_zero_digit_pattern() {
        assert!(match_status("0200", 200) == false);
        // "0200" has length 4 but 200's string form has length 3, so no match
    }

    #[test]
    fn match_status_tilde_negates_same_as_bang() {
        assert!(match_status("~200", 404));
        assert!(!match_status("~200", 200));
    }
}
