use std::net::SocketAddr;

use axum::{
    extract::{
        ConnectInfo,
        Request,
    },
    middleware::{
        self,
        Next,
    },
    response::Response,
    routing::{
        get,
        post,
    },
    Router,
};
use http::header;
use tower_http::cors::CorsLayer;

use crate::{
    handlers,
    AgentState,
};

/// The local operator API. No auth (trusted boundary), permissive CORS for
/// LAN access, every request logged.
pub fn router(state: AgentState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/local/tenant", get(handlers::get_tenant))
        .route("/api/local/tenant-sync", post(handlers::trigger_tenant_sync))
        .route("/api/local/meters", get(handlers::list_meters))
        .route("/api/local/readings", get(handlers::recent_readings))
        .route("/api/local/sync-status", get(handlers::sync_status))
        .route("/api/local/sync-trigger", post(handlers::trigger_upload_gated))
        .route("/api/local/meter-sync-status", get(handlers::meter_sync_status))
        .route(
            "/api/local/meter-sync-trigger",
            post(handlers::trigger_meter_sync),
        )
        .route("/api/meter-reading/status", get(handlers::collector_status))
        .route("/api/meter-reading/trigger", post(handlers::trigger_collection))
        .route(
            "/api/sync/meter-reading-upload/status",
            get(handlers::upload_status),
        )
        .route(
            "/api/sync/meter-reading-upload/log",
            get(handlers::upload_log),
        )
        .route(
            "/api/sync/meter-reading-upload/trigger",
            post(handlers::trigger_upload),
        )
        .layer(middleware::from_fn(log_request))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn log_request(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let source = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.to_string())
        .unwrap_or_else(|| "unknown".to_owned());
    let user_agent = request
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_owned();
    let response = next.run(request).await;
    tracing::info!(
        "{method} {path} from {source} ({user_agent}) -> {}",
        response.status()
    );
    response
}

#[cfg(test)]
mod tests {
    use std::{
        sync::Arc,
        time::Duration,
    };

    use axum::body::Body;
    use bacnet::{
        testing::{
            FakeDriver,
            FakeOutcome,
        },
        BacnetGateway,
        ObjectType,
        PropertyId,
        ReadRequest,
    };
    use cache::MeterCache;
    use cloud_client::testing::FakeClientSystem;
    use collector::CollectionEngine;
    use common::{
        store::LocalStore,
        testing::{
            FakeRemoteConfig,
            MemoryStore,
        },
        types::{
            Meter,
            Tenant,
            UnixMillis,
        },
    };
    use connectivity::ConnectivityMonitor;
    use downstream_sync::MeterSyncAgent;
    use http::{
        Request as HttpRequest,
        StatusCode,
    };
    use pretty_assertions::assert_eq;
    use tower::ServiceExt;
    use uploader::{
        UploadConfig,
        UploadManager,
    };

    use super::*;

    struct Fixture {
        store: Arc<MemoryStore>,
        cloud: Arc<FakeClientSystem>,
        driver: Arc<FakeDriver>,
        state: AgentState,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let cloud = Arc::new(FakeClientSystem::new());
        let driver = Arc::new(FakeDriver::new());
        let cache = Arc::new(MeterCache::new());
        let connectivity = ConnectivityMonitor::new(cloud.clone(), Duration::from_secs(60));
        let collector = CollectionEngine::new(
            store.clone(),
            cache.clone(),
            BacnetGateway::new(driver.clone(), Duration::from_secs(3)),
            Duration::from_secs(60),
        );
        let meter_sync = MeterSyncAgent::new(
            store.clone(),
            Arc::new(FakeRemoteConfig::new()),
            cache.clone(),
            cloud.clone(),
            7,
            Duration::from_secs(3600),
        );
        let uploader = UploadManager::new(
            store.clone(),
            cloud.clone(),
            connectivity.clone(),
            7,
            UploadConfig {
                interval: Duration::from_secs(300),
                batch_size: 1000,
                max_retries: 5,
            },
        );
        let state = AgentState {
            tenant_id: 7,
            store: store.clone(),
            cache,
            connectivity,
            collector,
            meter_sync,
            uploader,
            started_at: UnixMillis::now(),
        };
        Fixture {
            store,
            cloud,
            driver,
            state,
        }
    }

    fn tenant() -> Tenant {
        Tenant {
            tenant_id: 7,
            name: "Site A".to_owned(),
            address: None,
            city: None,
            country: None,
            active: true,
            api_key: Some("k".to_owned()),
        }
    }

    fn meter(meter_id: i64, element: i64) -> Meter {
        Meter {
            meter_id,
            meter_element_id: element,
            name: format!("meter-{meter_id}-{element}"),
            ip: "192.0.2.5".to_owned(),
            port: 47808,
            element: "kWh".to_owned(),
            active: true,
        }
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get(path: &str) -> HttpRequest<Body> {
        HttpRequest::get(path).body(Body::empty()).unwrap()
    }

    fn post(path: &str) -> HttpRequest<Body> {
        HttpRequest::post(path).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn health_answers_ok() {
        let fx = fixture();
        let response = router(fx.state).oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn tenant_endpoint_reports_initializing_until_cached() {
        let fx = fixture();
        let app = router(fx.state.clone());
        let response = app.clone().oneshot(get("/api/local/tenant")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_json(response).await["status"], "initializing");

        fx.store.upsert_tenant(&tenant()).await.unwrap();
        fx.state.cache.reload(fx.store.as_ref()).await.unwrap();
        let response = app.oneshot(get("/api/local/tenant")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["tenant_id"], 7);
        assert!(body.get("api_key").is_none());
    }

    #[tokio::test]
    async fn offline_upload_trigger_answers_503() {
        let fx = fixture();
        // The monitor starts Offline and no probe has run.
        let response = router(fx.state)
            .oneshot(post("/api/local/sync-trigger"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn online_upload_trigger_runs_a_cycle() {
        let fx = fixture();
        fx.state.connectivity.force_check().await;
        let response = router(fx.state)
            .oneshot(post("/api/local/sync-trigger"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["is_client_connected"], true);
        assert_eq!(body["uploaded"], 0);
    }

    #[tokio::test]
    async fn meters_endpoint_lists_active_meters() {
        let fx = fixture();
        fx.store.put_meter(meter(10, 1));
        let response = router(fx.state)
            .oneshot(get("/api/local/meters"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["meter_id"], 10);
    }

    #[tokio::test]
    async fn tenant_sync_rejects_a_foreign_tenant_id() {
        let fx = fixture();
        let request = HttpRequest::post("/api/local/tenant-sync")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"tenant_id": 8}"#))
            .unwrap();
        let response = router(fx.state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_collection_trigger_answers_409() {
        let fx = fixture();
        fx.store.upsert_tenant(&tenant()).await.unwrap();
        fx.store.put_meter(meter(10, 1));
        fx.driver.script(
            "192.0.2.5:47808".parse().unwrap(),
            ReadRequest {
                object_type: ObjectType::AnalogInput,
                instance: 1,
                property: PropertyId::PresentValue,
            },
            FakeOutcome::Hang,
        );
        let app = router(fx.state.clone());

        let busy_app = app.clone();
        let first = tokio::spawn(async move {
            busy_app
                .oneshot(post("/api/meter-reading/trigger"))
                .await
                .unwrap()
        });
        while !fx.state.collector.status().is_running {
            tokio::task::yield_now().await;
        }
        let response = app.oneshot(post("/api/meter-reading/trigger")).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = first.await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn upload_log_returns_recent_rows() {
        let fx = fixture();
        fx.store.append_sync_log(30, true, None).await.unwrap();
        fx.store
            .append_sync_log(10, false, Some("400 bad request"))
            .await
            .unwrap();
        let response = router(fx.state)
            .oneshot(get("/api/sync/meter-reading-upload/log?limit=5"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let rows = body.as_array().unwrap();
        assert_eq!(rows.len(), 2);
        // Newest first.
        assert_eq!(rows[0]["success"], false);
    }

    #[tokio::test]
    async fn sync_status_reports_queue_and_failures() {
        let fx = fixture();
        fx.store
            .append_sync_log(10, false, Some("boom"))
            .await
            .unwrap();
        fx.cloud.set_online(true);
        fx.state.connectivity.force_check().await;
        let response = router(fx.state)
            .oneshot(get("/api/local/sync-status"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["is_connected"], true);
        assert_eq!(body["queue_size"], 0);
        assert_eq!(body["sync_errors"].as_array().unwrap().len(), 1);
    }
}
