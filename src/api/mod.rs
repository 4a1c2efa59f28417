//! REST API for agents and operators
//!
//! ## Architecture
//!
//! - **Axum** web framework with Tower middleware
//! - **Shared state** (`ApiState`) holding storage, registry and pipeline handles
//! - **OpenAPI** document via utoipa
//!
//! ## Endpoints
//!
//! - `POST /v1/metrics` - Ingest one report
//! - `POST /v1/metrics:batch` - Ingest several reports
//! - `GET /v1/metrics` - Query stored reports
//! - `GET /v1/agents` - List agents
//! - `GET|DELETE /v1/agents/{id}` - One agent
//! - `GET /v1/agents/{id}/metrics/latest` - Newest report
//! - `GET /v1/agents/{id}/ip-changes[/summary]` - Address history
//! - `GET /v1/health` - Component health (unauthenticated)
//! - `GET /v1/stats` - Counters
//! - `POST /v1/auth/token` - JWT issuing (unauthenticated)
//! - `GET /v1/docs/openapi.json` - API document (unauthenticated)

pub mod error;
pub mod middleware;
pub mod routes;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use state::ApiState;

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    http::HeaderValue,
    routing::{get, post},
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, SupportedProtocolVersion};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use utoipa::OpenApi;

use crate::config::{ApiConfig, ServerConfig, TlsConfig};
use crate::error::{Error, Result};

#[derive(OpenApi)]
#[openapi(
    info(title = "wameter", description = "Network telemetry server API"),
    paths(
        routes::metrics::ingest_report,
        routes::metrics::ingest_batch,
        routes::metrics::query_metrics,
        routes::agents::list_agents,
        routes::agents::get_agent,
        routes::agents::delete_agent,
        routes::agents::latest_metrics,
        routes::agents::ip_changes,
        routes::agents::ip_change_summary,
        routes::health::health_check,
        routes::stats::get_stats,
        routes::auth::issue_token,
    )
)]
pub struct ApiDoc;

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("ignoring invalid CORS origin '{origin}'");
                None
            }
        })
        .collect();

    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if allowed.is_empty() {
        layer.allow_origin(Any)
    } else {
        layer.allow_origin(AllowOrigin::list(allowed))
    }
}

/// Build the full router with middleware applied
pub fn router(state: ApiState, api: &ApiConfig, request_timeout: Duration) -> Router {
    let protected = Router::new()
        .route("/v1/metrics", post(routes::metrics::ingest_report).get(routes::metrics::query_metrics))
        .route("/v1/metrics:batch", post(routes::metrics::ingest_batch))
        .route("/v1/agents", get(routes::agents::list_agents))
        .route(
            "/v1/agents/{id}",
            get(routes::agents::get_agent).delete(routes::agents::delete_agent),
        )
        .route("/v1/agents/{id}/metrics/latest", get(routes::agents::latest_metrics))
        .route("/v1/agents/{id}/ip-changes", get(routes::agents::ip_changes))
        .route(
            "/v1/agents/{id}/ip-changes/summary",
            get(routes::agents::ip_change_summary),
        )
        .route("/v1/stats", get(routes::stats::get_stats))
        .route_layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state.auth),
            middleware::auth_middleware,
        ));

    let mut public = Router::new()
        .route("/v1/health", get(routes::health::health_check))
        .route("/v1/auth/token", post(routes::auth::issue_token));
    if api.docs.enabled {
        public = public.route("/v1/docs/openapi.json", get(openapi_json));
    }

    let mut app = protected
        .merge(public)
        .with_state(state)
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http());

    if let Some(limiter) = middleware::RequestLimiter::from_config(&api.rate_limit) {
        app = app.layer(axum::middleware::from_fn_with_state(
            limiter,
            middleware::rate_limit_middleware,
        ));
    }

    if api.cors.enabled {
        app = app.layer(cors_layer(&api.cors.allowed_origins));
    }

    app
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| {
        Error::invalid_config("api.tls", format!("cannot open {}", path.display())).with_source(e)
    })?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| {
            Error::invalid_config("api.tls", format!("invalid PEM in {}", path.display())).with_source(e)
        })?;
    if certs.is_empty() {
        return Err(Error::invalid_config(
            "api.tls",
            format!("no certificates in {}", path.display()),
        ));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|e| {
        Error::invalid_config("api.tls", format!("cannot open {}", path.display())).with_source(e)
    })?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| {
            Error::invalid_config("api.tls", format!("invalid PEM in {}", path.display())).with_source(e)
        })?
        .ok_or_else(|| {
            Error::invalid_config("api.tls", format!("no private key in {}", path.display()))
        })
}

fn protocol_versions(tls: &TlsConfig) -> Vec<&'static SupportedProtocolVersion> {
    let min = tls.min_version.as_deref().unwrap_or("1.2");
    let max = tls.max_version.as_deref().unwrap_or("1.3");
    let mut versions = Vec::new();
    if min == "1.2" {
        versions.push(&rustls::version::TLS12);
    }
    if max == "1.3" {
        versions.push(&rustls::version::TLS13);
    }
    versions
}

/// rustls server configuration from the `server.tls` section
pub fn tls_config(tls: &TlsConfig) -> Result<rustls::ServerConfig> {
    const OP: &str = "api.tls";
    let (Some(cert_file), Some(key_file)) = (&tls.cert_file, &tls.key_file) else {
        return Err(Error::invalid_config(OP, "tls requires cert_file and key_file"));
    };
    let versions = protocol_versions(tls);
    if versions.is_empty() {
        return Err(Error::invalid_config(OP, "tls min_version is above max_version"));
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = rustls::ServerConfig::builder_with_provider(Arc::clone(&provider))
        .with_protocol_versions(&versions)
        .map_err(|e| Error::invalid_config(OP, "unsupported tls versions").with_source(e))?;

    let builder = match &tls.client_ca {
        Some(ca) => {
            let mut roots = RootCertStore::empty();
            for cert in load_certs(ca)? {
                roots
                    .add(cert)
                    .map_err(|e| Error::invalid_config(OP, "invalid client CA").with_source(e))?;
            }
            let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider);
            let verifier = if tls.require_client_cert {
                verifier.build()
            } else {
                verifier.allow_unauthenticated().build()
            }
            .map_err(|e| Error::invalid_config(OP, "invalid client CA").with_source(e))?;
            builder.with_client_cert_verifier(verifier)
        }
        None => builder.with_no_client_auth(),
    };

    let mut config = builder
        .with_single_cert(load_certs(cert_file)?, load_key(key_file)?)
        .map_err(|e| Error::invalid_config(OP, "certificate and key do not match").with_source(e))?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(config)
}

/// Serve `app` until `shutdown` is cancelled, then drain in-flight requests
pub async fn serve(app: Router, server: &ServerConfig, shutdown: CancellationToken) -> Result<()> {
    if server.tls.enabled {
        let rustls_config =
            axum_server::tls_rustls::RustlsConfig::from_config(Arc::new(tls_config(&server.tls)?));
        let handle = axum_server::Handle::new();
        let grace = server.shutdown_timeout;
        let signal = handle.clone();
        tokio::spawn(async move {
            shutdown.cancelled().await;
            signal.graceful_shutdown(Some(grace));
        });

        info!("API server listening on https://{}", server.address);
        axum_server::bind_rustls(server.address, rustls_config)
            .handle(handle)
            .serve(app.into_make_service())
            .await?;
    } else {
        let listener = tokio::net::TcpListener::bind(server.address).await?;
        info!("API server listening on http://{}", listener.local_addr()?);
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
    }
    info!("API server stopped");
    Ok(())
}
