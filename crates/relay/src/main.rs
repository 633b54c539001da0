mod api;
mod auth;
mod chat;
mod config;
mod cors;
mod db;
mod error;
mod groups;
mod metrics;
mod store;
mod ws;

use anyhow::Context;
use axum::{
    body::Body,
    extract::{DefaultBodyLimit, MatchedPath, State},
    http::{header::CONTENT_TYPE, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::{sync::Arc, time::Duration, time::Instant};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::auth::jwt::JwtAccessTokenService;
use crate::chat::{persistence::MessageWriter, ChatHub};
use crate::config::{LogFormat, RelayConfig};
use crate::db::pool::{check_pool_health, create_pg_pool, PoolConfig};
use crate::error::{
    attach_request_id_header, request_id_from_headers_or_generate, with_request_id_scope,
};
use crate::groups::GroupRegistry;
use crate::metrics::RelayMetrics;
use crate::store::ChatStore;

const MAX_REQUEST_BODY_BYTES: usize = 64 * 1024;
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::from_env();
    init_tracing(&config)?;

    if config.is_dev_jwt_secret() {
        warn!("MURMUR_RELAY_JWT_SECRET is unset, using the development secret");
    }

    let jwt_service =
        Arc::new(JwtAccessTokenService::new(&config.jwt_secret).context("invalid relay JWT secret")?);
    let store = connect_store(&config).await?;

    let relay_metrics = Arc::new(RelayMetrics::default());
    metrics::set_global_metrics(Arc::clone(&relay_metrics));

    let (writer, writer_handle) = MessageWriter::spawn(store.clone());
    let hub = ChatHub::new(Arc::new(GroupRegistry::new()), writer, config.outbound_buffer);
    let app = build_router(
        hub,
        store.clone(),
        jwt_service,
        relay_metrics,
        config.cors_origins.as_deref(),
    );

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind relay listener on {}", config.listen_addr))?;

    info!(
        listen_addr = %config.listen_addr,
        store = store.backend(),
        outbound_buffer = config.outbound_buffer,
        "starting chat relay"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("chat relay exited unexpectedly")?;

    if writer_handle.shutdown(WRITER_DRAIN_TIMEOUT).await {
        info!("pending chat messages flushed");
    }

    Ok(())
}

fn init_tracing(config: &RelayConfig) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_new(&config.log_filter)
        .with_context(|| format!("invalid MURMUR_RELAY_LOG_FILTER '{}'", config.log_filter))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let installed = match config.log_format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.try_init(),
    };
    installed.map_err(|error| anyhow::anyhow!("failed to install tracing subscriber: {error}"))
}

async fn connect_store(config: &RelayConfig) -> anyhow::Result<ChatStore> {
    let Some(database_url) = config.database_url.as_deref() else {
        warn!("MURMUR_RELAY_DATABASE_URL is unset, chat history is kept in memory only");
        return Ok(ChatStore::in_memory());
    };

    let pool = create_pg_pool(database_url, PoolConfig::from_env())
        .await
        .context("failed to initialize chat relay PostgreSQL pool")?;
    check_pool_health(&pool).await?;
    db::migrations::run_migrations(&pool).await?;

    Ok(ChatStore::Postgres(pool))
}

fn build_router(
    hub: ChatHub,
    store: ChatStore,
    jwt_service: Arc<JwtAccessTokenService>,
    relay_metrics: Arc<RelayMetrics>,
    cors_origins: Option<&str>,
) -> Router {
    apply_middleware(
        Router::new()
            .route("/healthz", get(healthz))
            .route("/metrics", get(render_metrics).with_state(relay_metrics))
            .merge(ws::router(hub, Arc::clone(&jwt_service)))
            .merge(api::router(store, jwt_service))
            .layer(cors::cors_layer(cors_origins)),
    )
}

fn apply_middleware(router: Router) -> Router {
    router
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(middleware::from_fn(request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn render_metrics(State(relay_metrics): State<Arc<RelayMetrics>>) -> Response {
    ([(CONTENT_TYPE, "text/plain; version=0.0.4")], relay_metrics.render_prometheus())
        .into_response()
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(signal_error) = tokio::signal::ctrl_c().await {
            error!(error = %signal_error, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(signal_error) => {
                error!(error = %signal_error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = request_id_from_headers_or_generate(request.headers());
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let route = matched_route(&request);
    let started_at = Instant::now();

    let mut response = with_request_id_scope(request_id.clone(), next.run(request)).await;
    attach_request_id_header(&mut response, &request_id);

    let status = response.status().as_u16();
    let latency_ms = started_at.elapsed().as_millis() as u64;
    metrics::record_http_request(method.as_str(), route.as_deref(), status, latency_ms);

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status,
        latency_ms,
        "request completed"
    );

    response
}

/// Route template the request matched, `None` for fallback traffic.
fn matched_route(request: &Request<Body>) -> Option<String> {
    request.extensions().get::<MatchedPath>().map(|matched| matched.as_str().to_owned())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        http::{header::AUTHORIZATION, Method, Request, StatusCode},
        middleware::{self, Next},
        response::Response,
        routing::{get, post},
        Router,
    };
    use tower::ServiceExt;

    use super::{apply_middleware, build_router, matched_route, MAX_REQUEST_BODY_BYTES};
    use crate::{
        auth::jwt::JwtAccessTokenService,
        chat::{persistence::MessageWriter, ChatHub},
        groups::GroupRegistry,
        metrics::RelayMetrics,
        store::ChatStore,
    };

    const TEST_SECRET: &str = "murmur_test_secret_that_is_definitely_long_enough";

    fn test_router() -> (Router, Arc<JwtAccessTokenService>, Arc<RelayMetrics>) {
        let jwt_service = Arc::new(
            JwtAccessTokenService::new(TEST_SECRET).expect("test jwt service should initialize"),
        );
        let store = ChatStore::in_memory();
        let (writer, _handle) = MessageWriter::spawn(store.clone());
        let hub = ChatHub::new(Arc::new(GroupRegistry::new()), writer, 8);
        let relay_metrics = Arc::new(RelayMetrics::default());
        let router =
            build_router(hub, store, Arc::clone(&jwt_service), Arc::clone(&relay_metrics), None);
        (router, jwt_service, relay_metrics)
    }

    #[tokio::test]
    async fn health_check_has_request_id_header() {
        let (router, _, _) = test_router();
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .expect("healthz request should build"),
            )
            .await
            .expect("healthz request should succeed");

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn incoming_request_id_is_echoed_in_error_envelope() {
        let (router, _, _) = test_router();
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/v1/conversations")
                    .header("x-request-id", "req-123")
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("request should return a response");

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get("x-request-id").and_then(|value| value.to_str().ok()),
            Some("req-123")
        );
        let body = to_bytes(response.into_body(), usize::MAX).await.expect("body should read");
        let json: serde_json::Value = serde_json::from_slice(&body).expect("body should be json");
        assert_eq!(json["error"]["request_id"], "req-123");
    }

    #[tokio::test]
    async fn conversation_api_is_mounted() {
        let (router, jwt_service, _) = test_router();
        let token = jwt_service.issue_user_token(1).expect("token should be issued");

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/v1/conversations")
                    .header(AUTHORIZATION, format!("Bearer {token}"))
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("request should return a response");

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_endpoint_renders_prometheus_text() {
        let (router, _, relay_metrics) = test_router();
        relay_metrics.record_ws_event("chat_message");

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .expect("metrics request should build"),
            )
            .await
            .expect("metrics request should succeed");

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.expect("body should read");
        let text = String::from_utf8(body.to_vec()).expect("metrics should be utf-8");
        assert!(text.contains("murmur_ws_events_total{event=\"chat_message\"} 1"));
        assert!(text.contains("# TYPE murmur_ws_active_connections gauge"));
    }

    #[tokio::test]
    async fn panic_handler_returns_internal_server_error() {
        async fn panic_route() -> &'static str {
            panic!("test panic");
        }

        let app = apply_middleware(Router::new().route("/panic", get(panic_route)));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/panic")
                    .body(Body::empty())
                    .expect("panic request should build"),
            )
            .await
            .expect("panic request should return a response");

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn request_body_limit_is_enforced() {
        async fn echo(body: String) -> String {
            body
        }

        let oversized_body = "a".repeat(MAX_REQUEST_BODY_BYTES + 1);
        let app = apply_middleware(Router::new().route("/echo", post(echo)));

        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/echo")
                    .header("content-type", "text/plain")
                    .body(Body::from(oversized_body))
                    .expect("echo request should build"),
            )
            .await
            .expect("echo request should return a response");

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn metrics_label_is_the_route_template_not_the_raw_path() {
        async fn echo_route(request: Request<Body>, next: Next) -> Response {
            let route = matched_route(&request).unwrap_or_else(|| "none".to_string());
            let mut response = next.run(request).await;
            response.headers_mut().insert("x-route", route.parse().expect("route header"));
            response
        }

        let app = Router::new()
            .route("/v1/conversations/{id}", get(|| async { "ok" }))
            .layer(middleware::from_fn(echo_route));

        for (uri, expected) in
            [("/v1/conversations/42", "/v1/conversations/{id}"), ("/wp-login.php", "none")]
        {
            let response = app
                .clone()
                .oneshot(Request::builder().uri(uri).body(Body::empty()).expect("request"))
                .await
                .expect("request should return a response");
            assert_eq!(response.headers()["x-route"], expected, "uri: {uri}");
        }
    }
}
