//! cdgrid-api — HTTP API for the deployment coordinator.
//!
//! # Routes
//!
//! | Method | Path | Access | Description |
//! |---|---|---|---|
//! | GET | `/` | any | Service name and version |
//! | POST | `/deploy` | app secret | Start or join a deployment |
//! | POST | `/job-status` | app secret | Read one job |
//! | POST | `/register-apps` | trusted | Replace the registration set |
//! | GET | `/available-apps` | trusted | List registrations |
//! | POST | `/clear-jobs` | trusted | Drop every job record |
//! | GET | `/load` | trusted or monitoring | Job counts per window |

pub mod access;
pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::middleware;
use axum::routing::{get, post};

use cdgrid_coordinator::{Dispatcher, LoadReporter};
use cdgrid_state::StateStore;

pub use access::{AccessConfig, AccessError, AccessPolicy, parse_network};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    pub dispatcher: Dispatcher,
    pub reporter: LoadReporter,
    pub access: Arc<AccessPolicy>,
}

impl ApiState {
    pub fn new(store: StateStore, dispatcher: Dispatcher, access: AccessPolicy) -> Self {
        Self {
            reporter: LoadReporter::new(store.clone()),
            store,
            dispatcher,
            access: Arc::new(access),
        }
    }
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let trusted = Router::new()
        .route("/register-apps", post(handlers::register_apps))
        .route("/available-apps", get(handlers::available_apps))
        .route("/clear-jobs", post(handlers::clear_jobs))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            access::require_trusted,
        ));

    let monitored = Router::new()
        .route("/load", get(handlers::load))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            access::require_monitoring,
        ));

    Router::new()
        .route("/", get(handlers::root))
        .route("/deploy", post(handlers::deploy))
        .route("/job-status", post(handlers::job_status))
        .merge(trusted)
        .merge(monitored)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::SocketAddr;
    use std::time::Duration;

    use axum::body::Body;
    use axum::extract::connect_info::MockConnectInfo;
    use axum::http::{Request, StatusCode};
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use cdgrid_coordinator::{Poller, PollerConfig};
    use cdgrid_executor::ScriptedExecutor;
    use cdgrid_state::AppRegistration;

    fn test_state() -> ApiState {
        let store = StateStore::open_in_memory().unwrap();
        store
            .replace_apps(&[AppRegistration::new("app-1", "s3cret", "t1")])
            .unwrap();
        let executor = Arc::new(ScriptedExecutor::new());
        let poller = Poller::with_interval(
            store.clone(),
            executor.clone(),
            &PollerConfig::default(),
            Duration::from_millis(10),
        );
        let dispatcher = Dispatcher::new(store.clone(), executor, poller);
        let access = AccessPolicy::from_config(&AccessConfig {
            trusted_networks: vec!["10.0.0.0/8".into()],
            monitoring_networks: vec!["192.0.2.0/24".into()],
        })
        .unwrap();
        ApiState::new(store, dispatcher, access)
    }

    fn get_from(uri: &str, client: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header("x-forwarded-for", client)
            .body(Body::empty())
            .unwrap()
    }

    fn post_json(uri: &str, client: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .header("x-forwarded-for", client)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(resp: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn root_reports_version() {
        let router = build_router(test_state());
        let resp = router.oneshot(get_from("/", "203.0.113.1")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["app"], "cdgrid-api");
        assert!(body["version"].is_string());
    }

    #[tokio::test]
    async fn untrusted_origin_is_forbidden() {
        let router = build_router(test_state());
        for req in [
            get_from("/available-apps", "203.0.113.1"),
            post_json("/register-apps", "203.0.113.1", json!([])),
            post_json("/clear-jobs", "192.0.2.5", json!({})),
        ] {
            let resp = router.clone().oneshot(req).await.unwrap();
            assert_eq!(resp.status(), StatusCode::FORBIDDEN);
            let body = body_json(resp).await;
            assert_eq!(body["status"], "error");
            assert_eq!(body["error"], "access denied");
        }
    }

    #[tokio::test]
    async fn missing_client_address_is_forbidden() {
        let router = build_router(test_state());
        let req = Request::builder()
            .uri("/available-apps")
            .body(Body::empty())
            .unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn socket_peer_is_used_without_forwarded_header() {
        let peer: SocketAddr = "10.1.2.3:40000".parse().unwrap();
        let router = build_router(test_state()).layer(MockConnectInfo(peer));
        let req = Request::builder()
            .uri("/available-apps")
            .body(Body::empty())
            .unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn register_then_list_hides_secrets() {
        let router = build_router(test_state());
        let apps = json!([
            {"id": "a", "secret": "x", "target": "inv-a"},
            {"deployment_id": "b", "deployment_secret": "y", "inventory": "inv-b"},
        ]);
        let resp = router
            .clone()
            .oneshot(post_json("/register-apps", "10.0.0.2", apps))
            .await
            .unwrap();
        assert_eq!(body_json(resp).await, json!({"status": "ok"}));

        let resp = router
            .oneshot(get_from("/available-apps", "10.0.0.2"))
            .await
            .unwrap();
        let body = body_json(resp).await;
        assert_eq!(body["status"], "ok");
        let regs = body["registrations"].as_array().unwrap();
        assert_eq!(regs.len(), 2);
        assert!(regs.iter().all(|r| r.get("secret").is_none()));
    }

    #[tokio::test]
    async fn invalid_registration_keeps_old_set() {
        let state = test_state();
        let router = build_router(state.clone());
        let apps = json!([
            {"id": "a", "secret": "x", "target": "inv-a"},
            {"id": "a", "secret": "y", "target": "inv-b"},
        ]);
        let resp = router
            .oneshot(post_json("/register-apps", "10.0.0.2", apps))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "error");
        assert_eq!(state.store.list_apps().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn bad_credentials_are_a_domain_error() {
        let router = build_router(test_state());
        let resp = router
            .oneshot(post_json(
                "/deploy",
                "203.0.113.1",
                json!({"id": "app-1", "secret": "wrong"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            body_json(resp).await,
            json!({"status": "error", "error": "app not found"})
        );
    }

    #[tokio::test]
    async fn malformed_bodies_get_the_error_envelope() {
        let state = test_state();
        let router = build_router(state.clone());

        let resp = router
            .clone()
            .oneshot(post_json("/deploy", "203.0.113.1", json!({"id": "app-1"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["status"], "error");
        assert!(body["error"].as_str().unwrap().contains("secret"));

        let req = Request::builder()
            .method("POST")
            .uri("/job-status")
            .header("x-forwarded-for", "203.0.113.1")
            .body(Body::from("id=app-1"))
            .unwrap();
        let resp = router.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "error");

        let resp = router
            .oneshot(post_json(
                "/register-apps",
                "10.0.0.2",
                json!({"id": "a", "secret": "x", "target": "inv-a"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "error");
        assert_eq!(state.store.list_apps().unwrap().len(), 1);
        assert!(state.store.list_jobs().unwrap().is_empty());
    }

    #[tokio::test]
    async fn load_is_open_to_monitoring_networks() {
        let router = build_router(test_state());
        let resp = router
            .clone()
            .oneshot(get_from("/load?windows=recent:60", "192.0.2.5"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(
            body["load"]["recent"],
            json!({"starting": 0, "running": 0, "success": 0, "error": 0})
        );

        let resp = router
            .oneshot(get_from("/load", "203.0.113.1"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn malformed_windows_are_rejected() {
        let router = build_router(test_state());
        let resp = router
            .oneshot(get_from("/load?windows=hour", "10.0.0.2"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "error");
    }

    #[tokio::test]
    async fn clear_jobs_reports_count() {
        let state = test_state();
        state.store.get_or_create_active("t1").unwrap();
        state.store.get_or_create_active("t2").unwrap();
        let router = build_router(state);

        let resp = router
            .oneshot(post_json("/clear-jobs", "10.0.0.2", json!({})))
            .await
            .unwrap();
        assert_eq!(body_json(resp).await, json!({"status": "ok", "cleared": 2}));
    }
}
