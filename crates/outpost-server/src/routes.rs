use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use axum::extract::{ConnectInfo, DefaultBodyLimit, Path, Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::Utc;
use outpost_core::models::NodeId;
use outpost_core::sync::{
    ExchangeRequest, ExchangeResponse, RegisterRequest, RegisterResponse, StatusResponse, SyncHub,
    SERVER_VERSION,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::auth::{verify_bearer, AuthenticatedNode};
use crate::config::AppConfig;
use crate::error::AppError;
use crate::rate_limit::{RateLimitMetricsSnapshot, SyncRateLimiter};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    hub: SyncHub,
    rate_limiter: Arc<SyncRateLimiter>,
}

impl AppState {
    pub fn new(config: Arc<AppConfig>, hub: SyncHub) -> Self {
        Self {
            rate_limiter: Arc::new(SyncRateLimiter::from_config(config.as_ref())),
            hub,
            config,
        }
    }
}

pub fn app_router(state: AppState) -> Router {
    // Base64 of a compressed packet stays well under the decompressed limit.
    let body_limit = state.config.sync.max_packet_bytes;

    let protected_routes = Router::new()
        .route("/sync/exchange", post(exchange))
        .route("/sync/status/{node_id}", get(status))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_node));

    let register_routes = Router::new()
        .route("/sync/register", post(register))
        .route_layer(middleware::from_fn_with_state(state.clone(), limit_registration));

    Router::new()
        .route("/healthz", get(healthz))
        .merge(register_routes)
        .merge(protected_routes)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: i64,
    server_version: &'static str,
    server_code: String,
    schema_version: u32,
    rate_limit: RateLimitMetricsSnapshot,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now().timestamp(),
        server_version: SERVER_VERSION,
        server_code: state.hub.local_node().code.clone(),
        schema_version: state.hub.context().schema().version(),
        rate_limit: state.rate_limiter.metrics_snapshot().await,
    })
}

async fn require_node(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let node = verify_bearer(state.hub.registry(), request.headers())?;
    request.extensions_mut().insert(node);
    Ok(next.run(request).await)
}

/// Count registrations per caller address before the body is read.
///
/// Requests served without connection info (in-process tests) share the
/// unspecified address.
async fn limit_registration(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let address = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED), |ConnectInfo(addr)| addr.ip());
    state.rate_limiter.check_register(address).await?;
    Ok(next.run(request).await)
}

async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, AppError> {
    let response = state.hub.register(&request).await?;
    tracing::info!(
        endpoint = "register",
        node_id = %response.node_id,
        code = %request.code.trim(),
        "Registered node"
    );
    Ok(Json(response))
}

async fn exchange(
    State(state): State<AppState>,
    Extension(node): Extension<AuthenticatedNode>,
    Json(request): Json<ExchangeRequest>,
) -> Result<Json<ExchangeResponse>, AppError> {
    state.rate_limiter.check_exchange(node.node_id).await?;

    let response = state.hub.exchange(&node.token, &request).await?;
    tracing::debug!(
        endpoint = "exchange",
        node = %node.code,
        success = response.success,
        processed = response.processed_count,
        "Exchange handled"
    );
    Ok(Json(response))
}

async fn status(
    State(state): State<AppState>,
    Extension(node): Extension<AuthenticatedNode>,
    Path(node_id): Path<NodeId>,
) -> Result<Json<StatusResponse>, AppError> {
    let caller = state.hub.registry().authenticate(&node.token).await?;
    if caller.id != node_id {
        tracing::warn!(
            target: "outpost::security",
            caller = %caller.code,
            requested = %node_id,
            "Refused status request for another node"
        );
        return Err(AppError::unauthorized(
            "a node may only read its own sync status",
        ));
    }
    Ok(Json(state.hub.status(&node_id).await?))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{header, StatusCode};
    use outpost_core::models::{EntitySchema, FieldDef, FieldKind, NodeRole, SchemaRegistry};
    use outpost_core::sync::{packet, Packet, TokenIssuer};
    use outpost_core::{DatabaseService, SyncContext};
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;
    use crate::config::test_config;

    async fn router() -> Router {
        let config = Arc::new(test_config());
        let mut schema = SchemaRegistry::new(2).with_min_compatible(2);
        schema
            .register(EntitySchema {
                entity_type: "estimate".to_string(),
                fields: vec![FieldDef {
                    name: "title".to_string(),
                    kind: FieldKind::Text,
                    synced: true,
                    nullable: false,
                }],
            })
            .unwrap();
        let ctx = SyncContext::new(
            DatabaseService::open_in_memory().await.unwrap(),
            schema,
            config.sync.clone(),
            NodeRole::Server,
        );
        let tokens = TokenIssuer::new(&config.token_secret, config.token_ttl).unwrap();
        let hub = SyncHub::start(ctx, tokens, &config.server_code, &config.server_name)
            .await
            .unwrap();
        app_router(AppState::new(config, hub))
    }

    async fn send(router: &Router, request: axum::http::Request<Body>) -> (StatusCode, Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn post_json(uri: &str, token: Option<&str>, body: &Value) -> axum::http::Request<Body> {
        let mut builder = axum::http::Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn get_with(uri: &str, token: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap()
    }

    async fn register(router: &Router, code: &str) -> RegisterResponse {
        let (status, body) = send(
            router,
            post_json("/sync/register", None, &json!({ "code": code, "name": "Desk" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        serde_json::from_value(body).unwrap()
    }

    fn heartbeat(registration: &RegisterResponse, schema_version: u32) -> Value {
        let packet = Packet {
            source_node_id: registration.node_id,
            target_node_id: registration.server_node_id,
            packet_no: 0,
            ack_packet_no: 0,
            schema_version,
            created_at: 0,
            entries: Vec::new(),
        };
        let bytes = packet::compress(&packet).unwrap();
        json!({ "packet_data": packet::encode_base64(&bytes) })
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn healthz_reports_schema_version() {
        let router = router().await;
        let request = axum::http::Request::builder()
            .uri("/healthz")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&router, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["schema_version"], 2);
        assert_eq!(body["server_code"], "hq");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn register_issues_token_and_rejects_duplicates() {
        let router = router().await;
        let registration = register(&router, "desk-01").await;
        assert!(!registration.auth_token.is_empty());
        assert_eq!(registration.server_code, "hq");
        assert_eq!(registration.schema_version, 2);

        let (status, body) = send(
            &router,
            post_json("/sync/register", None, &json!({ "code": "DESK-01", "name": "Again" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().contains("already registered"));

        let (status, _) = send(
            &router,
            post_json("/sync/register", None, &json!({ "code": "no spaces", "name": "x" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn exchange_requires_bearer_token() {
        let router = router().await;
        let registration = register(&router, "desk-01").await;
        let body = heartbeat(&registration, 2);

        let (status, _) = send(&router, post_json("/sync/exchange", None, &body)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = send(&router, post_json("/sync/exchange", Some("forged"), &body)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn heartbeat_exchange_returns_reply_packet() {
        let router = router().await;
        let registration = register(&router, "desk-01").await;

        let (status, body) = send(
            &router,
            post_json(
                "/sync/exchange",
                Some(&registration.auth_token),
                &heartbeat(&registration, 2),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let response: ExchangeResponse = serde_json::from_value(body).unwrap();
        assert!(response.success);
        assert_eq!(response.processed_count, 0);

        let bytes = packet::decode_base64(&response.packet_data.unwrap()).unwrap();
        let reply = packet::decompress(&bytes, usize::MAX).unwrap();
        assert_eq!(reply.target_node_id, registration.node_id);
        assert_eq!(reply.source_node_id, registration.server_node_id);
        assert!(reply.is_heartbeat());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn outdated_schema_gets_upgrade_required() {
        let router = router().await;
        let registration = register(&router, "desk-01").await;

        let (status, body) = send(
            &router,
            post_json(
                "/sync/exchange",
                Some(&registration.auth_token),
                &heartbeat(&registration, 1),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::UPGRADE_REQUIRED);
        assert!(body["error"].as_str().unwrap().contains("Upgrade required"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn status_is_limited_to_the_calling_node() {
        let router = router().await;
        let desk = register(&router, "desk-01").await;
        let laptop = register(&router, "laptop-02").await;

        let (status, body) = send(
            &router,
            get_with(&format!("/sync/status/{}", desk.node_id), &desk.auth_token),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["node_code"], "desk-01");
        assert_eq!(body["received_packet_no"], 0);

        let (status, _) = send(
            &router,
            get_with(&format!("/sync/status/{}", laptop.node_id), &desk.auth_token),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn register_is_rate_limited_per_address() {
        let router = router().await;
        let from = |code: &str, ip: [u8; 4]| {
            let body = json!({ "code": code, "name": "Desk" });
            let mut request = post_json("/sync/register", None, &body);
            request
                .extensions_mut()
                .insert(ConnectInfo(SocketAddr::from((ip, 40_000))));
            request
        };

        // test_config allows three registrations per window; new codes do not reset it.
        for code in ["desk-01", "desk-02", "desk-03"] {
            let (status, _) = send(&router, from(code, [10, 0, 0, 7])).await;
            assert_eq!(status, StatusCode::OK);
        }
        let response = router
            .clone()
            .oneshot(from("desk-04", [10, 0, 0, 7]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key(header::RETRY_AFTER));

        let (status, _) = send(&router, from("desk-04", [10, 0, 0, 8])).await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = send(
            &router,
            axum::http::Request::builder()
                .uri("/healthz")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(body["rate_limit"]["register_limited"], 1);
        assert_eq!(body["rate_limit"]["register_allowed"], 4);
    }
}
