//! Route guard applied to every site navigation.

use super::root::{found, role_redirect};
use crate::{
    api::AppState,
    guard::{GuardState, Navigation},
    roles::{canonical_path, encode_path},
    session::cookie::extract_session_token,
};
use axum::{
    extract::{Extension, Request},
    http::{
        header::{CACHE_CONTROL, HOST, RETRY_AFTER},
        HeaderValue, StatusCode,
    },
    middleware::Next,
    response::{Html, IntoResponse, Response},
};
use std::sync::Arc;
use tracing::{debug, info, instrument};

const RETRY_PAGE: &str = r#"<!doctype html>
<html lang="zh">
<head><meta charset="utf-8"><title>百刀会</title></head>
<body>
<p>服务暂时不可用，请稍后重试。</p>
<p>Service temporarily unavailable, please retry.</p>
<p><a href="">Retry</a></p>
</body>
</html>
"#;

#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn gate(
    Extension(state): Extension<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    // The site service decodes and normalizes paths before resolving files,
    // so the guard has to see the same path it will.
    let raw = request.uri().path();
    let Some(path) = canonical_path(raw) else {
        debug!(path = raw, "Rejecting unresolvable path");
        return StatusCode::BAD_REQUEST.into_response();
    };
    let encoded = encode_path(&path);
    if encoded != raw {
        let target = match request.uri().query() {
            Some(query) => format!("{encoded}?{query}"),
            None => encoded,
        };
        debug!(from = raw, to = %target, "Redirecting to canonical path");
        return found(&target);
    }

    let host = request
        .headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .map(ToString::to_string);
    let navigation = Navigation::new(path)
        .with_host(host)
        .with_token(extract_session_token(request.headers()));

    if state.guard().section(&navigation).is_none() {
        if navigation.path == "/" {
            return role_redirect(&state, request.headers()).await;
        }
        return next.run(request).await;
    }

    match state.guard().evaluate(&navigation).await {
        GuardState::Granted(identity) => {
            request.extensions_mut().insert(identity);
            next.run(request).await
        }
        GuardState::DeniedUnauthenticated { redirect_to } => found(&redirect_to),
        GuardState::DeniedWrongRole { redirect_to } => {
            info!(to = %redirect_to, "Redirecting to own section");
            found(&redirect_to)
        }
        GuardState::DeniedUnavailable | GuardState::Unchecked | GuardState::Checking => {
            retry_page()
        }
    }
}

/// Outage response. The session cookie is left alone so a retry can succeed.
fn retry_page() -> Response {
    let mut response = (StatusCode::SERVICE_UNAVAILABLE, Html(RETRY_PAGE)).into_response();
    let headers = response.headers_mut();
    headers.insert(RETRY_AFTER, HeaderValue::from_static("5"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}
