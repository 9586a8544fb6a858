//! Pulls `ip:port` candidates out of page text: scan for IP-shaped and
//! port-shaped digit runs in document order, and pair each port with
//! the most recently seen IP token.

use once_cell::sync::Lazy;
use regex::Regex;

static TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}|\d{2,5})").unwrap());

fn is_ip(candidate: &str) -> bool {
    for (i, octet) in candidate.split('.').enumerate() {
        let n: u32 = match octet.parse() {
            Ok(n) => n,
            Err(_) => return false,
        };
        if i == 0 && n == 0 {
            return false;
        }
        if n > 255 {
            return false;
        }
    }
    true
}

fn is_port(candidate: &str) -> bool {
    let n: u32 = match candidate.parse() {
        Ok(n) => n,
        Err(_) => return false,
    };
    n == 80 || (n > 1024 && n < 65536)
}

/// Extract `ip:port` pairs from free text. The most recently seen IP
/// token pairs with every later valid port token until a newer IP
/// token replaces it, matching the reference extractor's behavior.
pub fn extract_proxies(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut pre_ip: Option<&str> = None;
    for m in TOKEN_RE.find_iter(text) {
        let token = m.as_str();
        if token.contains('.') {
            pre_ip = Some(token);
        } else if let Some(ip) = pre_ip {
            if is_ip(ip) && is_port(token) {
                out.push(format!("{}:{}", ip, token));
            }
        }
    }
    out
}
