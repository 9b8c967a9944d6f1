//! HTTP surface: JSON endpoints plus the guarded site.

pub mod handlers;
mod openapi;
mod state;

pub use openapi::openapi;
pub use state::AppState;

use anyhow::{Context, Result};
use axum::{
    body::Body,
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE},
        HeaderName, HeaderValue, Method, Request,
    },
    middleware,
    routing::{get, post},
    Extension, Router,
};
use handlers::{auth, gate, health, invite, profile, sso};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    cors::CorsLayer,
    request_id::PropagateRequestIdLayer,
    set_header::SetRequestHeaderLayer,
    trace::TraceLayer,
};
use tracing::{info, info_span, Span};
use ulid::Ulid;
use url::Url;
use utoipa_swagger_ui::SwaggerUi;

/// Build the application router. Requests no endpoint claims fall through
/// to `site`, behind the route guard.
pub fn router(state: Arc<AppState>, site: Router) -> Router {
    Router::new()
        .route("/health", get(health::health).options(health::health))
        .route("/auth/callback", post(auth::callback))
        .route("/auth/logout", post(auth::logout))
        .route("/auth/refresh", post(auth::refresh))
        .route("/sso/session", get(sso::session))
        .route("/sso/validate", post(sso::validate))
        .route("/sso/set-session", post(sso::set_session))
        .route("/sso/redirect-to-role", get(sso::redirect_to_role))
        .route("/invite/generate", post(invite::generate))
        .route("/invite/validate", get(invite::validate))
        .route("/invite/consume/:token", post(invite::consume))
        .route("/invite/list", get(invite::list))
        .route("/invite/deactivate/:id", post(invite::deactivate))
        .route("/profile/nickname/check", get(profile::check_nickname))
        .route("/profile/nickname", post(profile::update_nickname))
        .route("/admin/users/:id/role", post(profile::set_role))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", openapi()))
        .fallback_service(site.layer(middleware::from_fn(gate::gate)))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(Extension(state)),
        )
}

/// Serve until `shutdown` resolves.
///
/// # Errors
/// Returns an error if the frontend URL is not a valid origin or the server fails.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    site: Router,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let origin = frontend_origin(state.config().frontend_base_url())?;

    // Credentialed requests need an exact origin.
    let cors = CorsLayer::new()
        .allow_origin(origin)
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE]);

    let app = router(state, site).layer(cors);

    info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("Gracefully shutdown");
    Ok(())
}

fn frontend_origin(frontend_base_url: &str) -> Result<HeaderValue> {
    let url = Url::parse(frontend_base_url)
        .with_context(|| format!("Invalid frontend base URL: {frontend_base_url}"))?;
    HeaderValue::from_str(&url.origin().ascii_serialization())
        .context("Frontend origin is not a valid header value")
}

// span
fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.path = request.uri().path(),
        request_id
    )
}
