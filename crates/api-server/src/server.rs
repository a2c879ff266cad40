//! API server — HTTP routes for the triggers and commands, plus the
//! Prometheus exporter.

use crate::auth::require_cron_secret;
use crate::rest::{self, AppState};
use crate::swagger::ApiDoc;
use axum::middleware;
use axum::routing::{get, post, put};
use axum::Router;
use campaign_core::config::AppConfig;
use campaign_enrollment::SequencerEngine;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

/// Build the full router. Everything under `/v1` requires the trigger secret.
pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        // Records
        .route("/v1/businesses/:id", put(rest::put_business))
        .route("/v1/customers/:id", put(rest::put_customer))
        .route("/v1/jobs/:id", put(rest::put_job))
        // Periodic triggers
        .route("/v1/cron/process-touches", post(rest::process_touches))
        .route("/v1/cron/resolve-conflicts", post(rest::resolve_conflicts))
        // Conflicts and jobs
        .route("/v1/conflicts/resolve", post(rest::resolve_conflict))
        .route("/v1/conflicts/revert", post(rest::revert_conflict))
        .route("/v1/jobs/:id/complete", post(rest::complete_job))
        // Campaign lifecycle
        .route("/v1/campaigns/:id", put(rest::put_campaign).delete(rest::delete_campaign))
        .route("/v1/campaigns/:id/pause", post(rest::pause_campaign))
        .route("/v1/campaigns/:id/resume", post(rest::resume_campaign))
        .route("/v1/enrollments/:id/stop", post(rest::stop_enrollment))
        .route("/v1/customers/:id/opt-out", post(rest::opt_out))
        // Alerts
        .route("/v1/alerts/:id/retry", post(rest::retry_alert))
        .route("/v1/alerts/:id/acknowledge", post(rest::acknowledge_alert))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_cron_secret));

    Router::new()
        .merge(protected)
        // Operational endpoints
        .route("/health", get(rest::health_check))
        .route("/live", get(rest::liveness))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        // Middleware
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Main API server.
pub struct ApiServer {
    config: AppConfig,
    engine: Arc<SequencerEngine>,
}

impl ApiServer {
    pub fn new(config: AppConfig, engine: Arc<SequencerEngine>) -> Self {
        Self { config, engine }
    }

    /// Start the HTTP REST server.
    pub async fn start_http(&self) -> anyhow::Result<()> {
        if self.config.auth.cron_secret.is_empty() {
            warn!("No cron secret configured; every /v1 request will be rejected");
        }

        let state = AppState {
            engine: self.engine.clone(),
            node_id: self.config.node_id.clone(),
            cron_secret: self.config.auth.cron_secret.clone(),
            start_time: Instant::now(),
        };
        let app = router(state);

        let addr = SocketAddr::new(self.config.api.host.parse()?, self.config.api.http_port);

        info!(addr = %addr, "Starting HTTP server");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }

    /// Start the metrics server on a separate port.
    pub async fn start_metrics(&self) -> anyhow::Result<()> {
        let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
        let handle = builder
            .with_http_listener(SocketAddr::new(
                self.config.api.host.parse()?,
                self.config.metrics.port,
            ))
            .install_recorder()?;

        info!(port = self.config.metrics.port, "Metrics exporter started");

        // Keep the handle alive
        std::mem::forget(handle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use campaign_channels::{ChannelDispatcher, PassthroughComposer, ScriptedSender};
    use campaign_core::types::{
        Business, Campaign, CampaignStatus, Channel, Customer, Job, TouchDefinition,
    };
    use campaign_delivery::SlidingWindowLimiter;
    use campaign_enrollment::EngineStore;
    use chrono::Utc;
    use serde_json::Value;
    use std::time::Duration;
    use tower::ServiceExt;
    use uuid::Uuid;

    const SECRET: &str = "test-secret";

    struct Fixture {
        app: Router,
        store: Arc<EngineStore>,
        job_id: Uuid,
    }

    fn fixture() -> Fixture {
        let config = AppConfig::default();
        let store = Arc::new(EngineStore::new());
        let now = Utc::now();
        let owner = Uuid::new_v4();

        store.upsert_business(Business {
            id: owner,
            name: "Acme Plumbing".to_string(),
            timezone: Some("America/Chicago".to_string()),
            ..Default::default()
        });
        store.upsert_campaign(Campaign {
            id: Uuid::new_v4(),
            owner_id: owner,
            name: "Review request".to_string(),
            service_type: None,
            status: CampaignStatus::Active,
            touches: vec![TouchDefinition {
                touch_number: 1,
                channel: Channel::Email,
                delay_hours: 0,
                content_ref: "How did we do?".to_string(),
            }],
            created_at: now,
            updated_at: now,
        });
        let customer = Customer {
            id: Uuid::new_v4(),
            owner_id: owner,
            name: "Jo".to_string(),
            email: Some("jo@example.com".to_string()),
            ..Default::default()
        };
        let job = Job {
            id: Uuid::new_v4(),
            owner_id: owner,
            customer_id: customer.id,
            service_type: "drain".to_string(),
            completed_at: Some(now),
            enrollment_resolution: None,
            conflict_detected_at: None,
            enrollment_id: None,
        };
        let job_id = job.id;
        store.upsert_customer(customer);
        store.upsert_job(job);

        let dispatcher = ChannelDispatcher::new(Duration::from_secs(1))
            .with_sender(Arc::new(ScriptedSender::new(Channel::Email)));
        let limiter = Arc::new(SlidingWindowLimiter::from_config(&config.rate_limit));
        let engine = Arc::new(SequencerEngine::new(
            config,
            store.clone(),
            dispatcher,
            Arc::new(PassthroughComposer),
            limiter,
        ));

        let app = router(AppState {
            engine,
            node_id: "test-node".to_string(),
            cron_secret: SECRET.to_string(),
            start_time: Instant::now(),
        });
        Fixture { app, store, job_id }
    }

    fn authed(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {SECRET}"));
        match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn test_triggers_require_secret() {
        let f = fixture();
        let req = Request::builder()
            .method("POST")
            .uri("/v1/cron/process-touches")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&f.app, req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "unauthorized");

        let req = Request::builder()
            .method("POST")
            .uri("/v1/cron/resolve-conflicts")
            .header(header::AUTHORIZATION, "Bearer wrong")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&f.app, req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_health_is_open() {
        let f = fixture();
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let (status, body) = send(&f.app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["node_id"], "test-node");
    }

    #[tokio::test]
    async fn test_complete_job_then_process_batch() {
        let f = fixture();
        let uri = format!("/v1/jobs/{}/complete", f.job_id);
        let (status, body) = send(&f.app, authed("POST", &uri, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "enrolled");

        // Completing again reports the existing enrollment.
        let (_, again) = send(&f.app, authed("POST", &uri, None)).await;
        assert_eq!(again["outcome"], "already_enrolled");
        assert_eq!(again["enrollment_id"], body["enrollment_id"]);

        let (status, batch) = send(&f.app, authed("POST", "/v1/cron/process-touches?limit=5", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(batch["ok"], true);
        assert_eq!(batch["claimed"], 1);
        assert_eq!(batch["results"]["processed"], 1);
        assert!(batch["retries"].is_object());
    }

    #[tokio::test]
    async fn test_process_rejects_out_of_range_limit() {
        let f = fixture();
        let (status, body) = send(&f.app, authed("POST", "/v1/cron/process-touches?limit=0", None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["ok"], false);
    }

    #[tokio::test]
    async fn test_resolve_without_conflict_is_bad_request() {
        let f = fixture();
        let (status, body) = send(
            &f.app,
            authed(
                "POST",
                "/v1/conflicts/resolve",
                Some(serde_json::json!({ "job_id": f.job_id, "action": "skip" })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_unknown_campaign_is_not_found() {
        let f = fixture();
        let uri = format!("/v1/campaigns/{}/pause", Uuid::new_v4());
        let (status, _) = send(&f.app, authed("POST", &uri, None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_stop_enrollment_twice_conflicts() {
        let f = fixture();
        let uri = format!("/v1/jobs/{}/complete", f.job_id);
        send(&f.app, authed("POST", &uri, None)).await;
        let enrollment_id = f.store.get_job(f.job_id).unwrap().enrollment_id.unwrap();

        let stop_uri = format!("/v1/enrollments/{enrollment_id}/stop");
        let body = serde_json::json!({ "reason": "owner_stopped" });
        let (status, first) = send(&f.app, authed("POST", &stop_uri, Some(body.clone()))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["success"], true);

        let (status, _) = send(&f.app, authed("POST", &stop_uri, Some(body))).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_records_put_then_complete_job_enrolls() {
        let f = fixture();
        let owner = Uuid::new_v4();
        let customer = Uuid::new_v4();
        let job = Uuid::new_v4();

        let (status, body) = send(
            &f.app,
            authed(
                "PUT",
                &format!("/v1/businesses/{owner}"),
                Some(serde_json::json!({ "name": "Bright Electric", "timezone": "America/Denver" })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["timezone"], "America/Denver");

        let campaign = serde_json::json!({
            "owner_id": owner,
            "name": "Follow-up",
            "service_type": "panel",
            "touches": [
                { "touch_number": 1, "channel": "email", "delay_hours": 0, "content_ref": "Thanks" },
                { "touch_number": 2, "channel": "email", "delay_hours": 48, "content_ref": "Review?" }
            ]
        });
        let (status, body) =
            send(&f.app, authed("PUT", &format!("/v1/campaigns/{}", Uuid::new_v4()), Some(campaign))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "active");

        let (status, _) = send(
            &f.app,
            authed(
                "PUT",
                &format!("/v1/customers/{customer}"),
                Some(serde_json::json!({ "owner_id": owner, "name": "Sam", "email": "sam@example.com" })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(
            &f.app,
            authed(
                "PUT",
                &format!("/v1/jobs/{job}"),
                Some(serde_json::json!({
                    "owner_id": owner,
                    "customer_id": customer,
                    "service_type": "panel",
                    "completed_at": Utc::now()
                })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["enrollment_id"].is_null());

        let (status, body) = send(&f.app, authed("POST", &format!("/v1/jobs/{job}/complete"), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "enrolled");
        assert!(f.store.get_job(job).unwrap().enrollment_id.is_some());
    }

    #[tokio::test]
    async fn test_put_job_for_unknown_owner_is_not_found() {
        let f = fixture();
        let body = serde_json::json!({
            "owner_id": Uuid::new_v4(),
            "customer_id": Uuid::new_v4(),
            "service_type": "drain",
            "completed_at": null
        });
        let (status, resp) =
            send(&f.app, authed("PUT", &format!("/v1/jobs/{}", Uuid::new_v4()), Some(body))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(resp["error"].is_string());
    }

    #[tokio::test]
    async fn test_put_campaign_with_gap_in_touches_is_rejected() {
        let f = fixture();
        let owner = f.store.get_job(f.job_id).unwrap().owner_id;
        let campaign = serde_json::json!({
            "owner_id": owner,
            "name": "Broken",
            "service_type": null,
            "touches": [
                { "touch_number": 1, "channel": "email", "delay_hours": 0, "content_ref": "a" },
                { "touch_number": 3, "channel": "sms", "delay_hours": 24, "content_ref": "b" }
            ]
        });
        let (status, _) =
            send(&f.app, authed("PUT", &format!("/v1/campaigns/{}", Uuid::new_v4()), Some(campaign))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_records_require_secret() {
        let f = fixture();
        let req = Request::builder()
            .method("PUT")
            .uri(format!("/v1/customers/{}", Uuid::new_v4()))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{}"))
            .unwrap();
        let (status, _) = send(&f.app, req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
}
