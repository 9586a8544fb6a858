//! Wire types for the `/proxies` endpoint.

use serde::{Deserialize, Serialize};

use crate::manager::ProxyDetail;

fn default_order() -> String {
    "rate".to_string()
}

#[derive(Debug, Deserialize)]
pub struct ProxiesQuery {
    pub count: Option<usize>,
    #[serde(default)]
    pub detail: bool,
    #[serde(default = "default_order")]
    pub order: String,
    #[serde(default)]
    pub https: bool,
    #[serde(default)]
    pub post: bool,
    pub min_anonymity: Option<u8>,
}

/// Detail object fields per §4.6: `address, success, fail, timestamp,
/// anonymity, https, post`. `timestamp` is the last-check time, not the
/// internal next-check deadline.
#[derive(Debug, Clone, Serialize)]
pub struct ProxyDetailResponse {
    pub address: String,
    pub success: u32,
    pub fail: u32,
    pub timestamp: i64,
    pub anonymity: u8,
    pub https: bool,
    pub post: bool,
}

impl From<&ProxyDetail> for ProxyDetailResponse {
    fn from(d: &ProxyDetail) -> Self {
        Self {
            address: d.address.clone(),
            success: d.success,
            fail: d.fail,
            timestamp: d.timestamp,
            anonymity: d.anonymity,
            https: d.https,
            post: d.post,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}
