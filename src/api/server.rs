//! Axum wiring for the `/proxies` route plus ambient health/root endpoints.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;

use crate::api::handlers::{health_check, list_proxies, root_info, ApiState};
use crate::manager::Manager;
use crate::utils::error::{ProxyError, ProxyResult};

pub struct ApiServer {
    bind: String,
    app: Router,
}

impl ApiServer {
    pub fn new(bind: String, manager: Arc<Manager>) -> Self {
        let state = Arc::new(ApiState { manager });
        let app = Router::new()
            .route("/", get(root_info))
            .route("/health", get(health_check))
            .route("/proxies", get(list_proxies))
            .layer(CorsLayer::permissive())
            .with_state(state);

        Self { bind, app }
    }

    pub async fn start(self) -> ProxyResult<()> {
        let addr: SocketAddr = self
            .bind
            .parse()
            .map_err(|e| ProxyError::Config(format!("invalid bind address '{}': {}", self.bind, e)))?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(ProxyError::Network)?;
        log::info!("API listening on http://{}", addr);
        axum::serve(listener, self.app)
            .await
            .map_err(|e| ProxyError::Http(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::ManagerConfig;
    use crate::validator::CheckOutcome;
    use async_trait::async_trait;

    struct AlwaysOk;

    #[async_trait]
    impl crate::validator::Validator for AlwaysOk {
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

    fn test_manager() -> Arc<Manager> {
        Arc::new(Manager::new(
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
        ))
    }

    #[tokio::test]
    async fn server_builds_with_expected_routes() {
        let server = ApiServer::new("127.0.0.1:0".to_string(), test_manager());
        assert_eq!(server.bind, "127.0.0.1:0");
    }
}
