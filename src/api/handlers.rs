//! Handlers backing the server's external HTTP surface.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use serde_json::Value;

use crate::api::models::{HealthResponse, ProxiesQuery, ProxyDetailResponse};
use crate::manager::Manager;

pub struct ApiState {
    pub manager: Arc<Manager>,
}

/// `GET /proxies` — the single functional route. Unknown query
/// parameters are ignored (axum's `Query` extractor already does this).
pub async fn list_proxies(
    State(state): State<Arc<ApiState>>,
    Query(params): Query<ProxiesQuery>,
) -> Json<Value> {
    let min_anonymity = params.min_anonymity.unwrap_or(0);
    let mut records = state
        .manager
        .list_proxies(min_anonymity, params.https, params.post)
        .await;

    match params.order.as_str() {
        "time" => records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp)),
        _ => records.sort_by(|a, b| b.rate.partial_cmp(&a.rate).unwrap_or(std::cmp::Ordering::Equal)),
    }

    if let Some(count) = params.count {
        if count > 0 {
            records.truncate(count);
        }
    }

    if params.detail {
        let detailed: Vec<ProxyDetailResponse> = records.iter().map(ProxyDetailResponse::from).collect();
        Json(serde_json::to_value(detailed).unwrap_or(Value::Array(vec![])))
    } else {
        let addresses: Vec<String> = records.into_iter().map(|r| r.address).collect();
        Json(serde_json::to_value(addresses).unwrap_or(Value::Array(vec![])))
    }
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub async fn root_info() -> Json<Value> {
    Json(serde_json::json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "proxies": "/proxies",
            "health": "/health"
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::{Manager, ManagerConfig};
    use crate::validator::{CheckOutcome, Validator};
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

    fn default_query() -> ProxiesQuery {
        ProxiesQuery {
            count: None,
            detail: false,
            order: "rate".to_string(),
            https: false,
            post: false,
            min_anonymity: None,
        }
    }

    /// spec.md §8 scenario 6, driven through the real axum handler: filter
    /// to `anonymity==2 && https`, rank by rate, keep the top 3.
    #[tokio::test]
    async fn list_proxies_handler_applies_filters_order_and_count() {
        let manager = Arc::new(Manager::new(
            ManagerConfig {
                queue_size: 10,
                backup_size: 100,
                block_time: 7200,
                max_fail_times: 2,
                check_interval: 300,
                checker_clients: 1,
                min_anonymity: 0,
                wait_queue_capacity: 64,
                label_queue_capacity: 64,
            },
            Arc::new(AlwaysOk),
            "1.1.1.1".to_string(),
        ));

        // (address, good, bad, anonymity, https) — rate = good/(good+bad+1)
        manager.seed_test_record("10.0.0.1:8080", 90, 10, 2, true, false).await; // rate ~0.891, qualifies
        manager.seed_test_record("10.0.0.2:8080", 80, 20, 2, true, false).await; // rate ~0.792, qualifies
        manager.seed_test_record("10.0.0.3:8080", 70, 30, 2, true, false).await; // rate ~0.693, qualifies
        manager.seed_test_record("10.0.0.4:8080", 60, 40, 2, true, false).await; // rate ~0.594, qualifies but lowest -> dropped
        manager.seed_test_record("10.0.0.5:8080", 95, 5, 1, true, false).await; // anonymity too low
        manager.seed_test_record("10.0.0.6:8080", 99, 1, 2, false, false).await; // no https

        let state = Arc::new(ApiState { manager });
        let params = ProxiesQuery {
            count: Some(3),
            detail: true,
            min_anonymity: Some(2),
            https: true,
            ..default_query()
        };
        let Json(body) = list_proxies(State(state), Query(params)).await;
        let items = body.as_array().expect("detail response is a JSON array");
        assert_eq!(items.len(), 3);
        assert_eq!(items[0]["address"], "10.0.0.1:8080");
        assert_eq!(items[1]["address"], "10.0.0.2:8080");
        assert_eq!(items[2]["address"], "10.0.0.3:8080");
    }
}
