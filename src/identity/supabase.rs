//! Supabase GoTrue client.

use super::{IdentityProvider, ProviderError, ProviderUser};
use crate::APP_USER_AGENT;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{debug, instrument, warn};
use url::Url;
use uuid::Uuid;

#[derive(Deserialize)]
struct UserPayload {
    id: Uuid,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    app_metadata: Map<String, Value>,
    #[serde(default)]
    user_metadata: Map<String, Value>,
}

#[derive(Deserialize)]
struct TokenPayload {
    user: UserPayload,
}

impl UserPayload {
    fn into_user(self) -> Result<ProviderUser, ProviderError> {
        let email = self
            .email
            .map(|email| email.trim().to_lowercase())
            .filter(|email| !email.is_empty())
            .ok_or(ProviderError::Rejected)?;
        let text = |metadata: &Map<String, Value>, key: &str| {
            metadata
                .get(key)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(ToString::to_string)
        };
        // Users can edit user_metadata themselves, so the role only comes
        // from app_metadata.
        let role_claim = text(&self.app_metadata, "role");
        let nickname = text(&self.user_metadata, "nickname")
            .or_else(|| text(&self.user_metadata, "full_name"));
        Ok(ProviderUser {
            id: self.id,
            email,
            role_claim,
            nickname,
        })
    }
}

pub struct SupabaseProvider {
    client: Client,
    base_url: Url,
    api_key: SecretString,
}

impl SupabaseProvider {
    /// # Errors
    /// Returns an error if the base URL is invalid or the HTTP client cannot be built.
    pub fn new(base_url: &str, api_key: SecretString, timeout: Duration) -> Result<Self> {
        // Trailing slash so `join` appends instead of replacing the last segment.
        let base_url = Url::parse(&format!("{}/", base_url.trim_end_matches('/')))
            .with_context(|| format!("Invalid identity provider URL: {base_url}"))?;
        let client = Client::builder()
            .user_agent(APP_USER_AGENT)
            .timeout(timeout)
            .build()
            .context("Failed to build identity provider client")?;
        Ok(Self {
            client,
            base_url,
            api_key,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, ProviderError> {
        self.base_url
            .join(path)
            .map_err(|err| ProviderError::Unavailable(format!("bad endpoint {path}: {err}")))
    }

    async fn send<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, ProviderError> {
        let response = request.send().await.map_err(|err| {
            warn!("Identity provider request failed: {err}");
            ProviderError::Unavailable(err.to_string())
        })?;
        let status = response.status();
        if status.is_success() {
            return response.json::<T>().await.map_err(|err| {
                warn!("Identity provider sent an unreadable body: {err}");
                ProviderError::Unavailable(err.to_string())
            });
        }
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            warn!(%status, "Identity provider unavailable");
            return Err(ProviderError::Unavailable(format!("status {status}")));
        }
        debug!(%status, "Identity provider rejected credentials");
        Err(ProviderError::Rejected)
    }
}

#[async_trait]
impl IdentityProvider for SupabaseProvider {
    #[instrument(skip_all)]
    async fn exchange_code(
        &self,
        code: &str,
        code_verifier: Option<&str>,
        redirect_uri: Option<&str>,
    ) -> Result<ProviderUser, ProviderError> {
        let mut url = self.endpoint("auth/v1/token")?;
        url.query_pairs_mut().append_pair("grant_type", "pkce");
        let mut body = json!({ "auth_code": code });
        if let Some(verifier) = code_verifier {
            body["code_verifier"] = json!(verifier);
        }
        if let Some(redirect_uri) = redirect_uri {
            body["redirect_to"] = json!(redirect_uri);
        }
        let request = self
            .client
            .post(url)
            .header("apikey", self.api_key.expose_secret())
            .json(&body);
        let payload: TokenPayload = Self::send(request).await?;
        payload.user.into_user()
    }

    #[instrument(skip_all)]
    async fn fetch_user(&self, access_token: &str) -> Result<ProviderUser, ProviderError> {
        let url = self.endpoint("auth/v1/user")?;
        let attempt = || {
            self.client
                .get(url.clone())
                .header("apikey", self.api_key.expose_secret())
                .bearer_auth(access_token)
        };
        let payload: UserPayload = match Self::send(attempt()).await {
            Err(ProviderError::Unavailable(reason)) => {
                debug!("Retrying user lookup after: {reason}");
                Self::send(attempt()).await?
            }
            other => other?,
        };
        payload.into_user()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::Query,
        http::{HeaderMap, StatusCode as AxumStatus},
        response::IntoResponse,
        routing::{get, post},
        Json, Router,
    };
    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    };
    use tokio::net::TcpListener;

    const USER_ID: &str = "6f1c1e9c-7bde-4c8f-9d7e-1df3a1b5c001";

    fn user_json() -> Value {
        json!({
            "id": USER_ID,
            "email": "Member@Example.com",
            "app_metadata": { "role": "Member" },
            "user_metadata": { "role": "Master", "nickname": "刀客" }
        })
    }

    async fn serve(router: Router) -> Result<String> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        Ok(format!("http://{addr}"))
    }

    fn provider(base: &str, timeout: Duration) -> Result<SupabaseProvider> {
        SupabaseProvider::new(base, SecretString::from("anon-key"), timeout)
    }

    #[tokio::test]
    async fn exchange_code_reads_user_metadata() -> Result<()> {
        let router = Router::new().route(
            "/auth/v1/token",
            post(
                |Query(query): Query<HashMap<String, String>>,
                 headers: HeaderMap,
                 Json(body): Json<Value>| async move {
                    let ok = query.get("grant_type").map(String::as_str) == Some("pkce")
                        && headers.get("apikey").is_some()
                        && body["auth_code"] == "code-1"
                        && body["code_verifier"] == "verifier";
                    if ok {
                        Json(json!({ "access_token": "p", "user": user_json() })).into_response()
                    } else {
                        AxumStatus::BAD_REQUEST.into_response()
                    }
                },
            ),
        );
        let base = serve(router).await?;
        let user = provider(&base, Duration::from_secs(2))?
            .exchange_code("code-1", Some("verifier"), None)
            .await?;
        assert_eq!(user.id, Uuid::parse_str(USER_ID)?);
        assert_eq!(user.email, "member@example.com");
        assert_eq!(user.role_claim.as_deref(), Some("Member"));
        assert_eq!(user.nickname.as_deref(), Some("刀客"));
        Ok(())
    }

    #[tokio::test]
    async fn rejected_code_is_not_an_outage() -> Result<()> {
        let router = Router::new().route(
            "/auth/v1/token",
            post(|| async { AxumStatus::BAD_REQUEST }),
        );
        let base = serve(router).await?;
        let result = provider(&base, Duration::from_secs(2))?
            .exchange_code("used-code", None, None)
            .await;
        assert_eq!(result, Err(ProviderError::Rejected));
        Ok(())
    }

    #[tokio::test]
    async fn server_errors_are_unavailable_and_retried_once() -> Result<()> {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let router = Router::new().route(
            "/auth/v1/user",
            get(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    AxumStatus::BAD_GATEWAY
                }
            }),
        );
        let base = serve(router).await?;
        let result = provider(&base, Duration::from_secs(2))?
            .fetch_user("token")
            .await;
        assert!(matches!(result, Err(ProviderError::Unavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test]
    async fn fetch_user_recovers_on_retry() -> Result<()> {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let router = Router::new().route(
            "/auth/v1/user",
            get(move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        AxumStatus::SERVICE_UNAVAILABLE.into_response()
                    } else {
                        Json(user_json()).into_response()
                    }
                }
            }),
        );
        let base = serve(router).await?;
        let user = provider(&base, Duration::from_secs(2))?
            .fetch_user("token")
            .await?;
        assert_eq!(user.email, "member@example.com");
        Ok(())
    }

    #[tokio::test]
    async fn slow_provider_times_out_as_unavailable() -> Result<()> {
        let router = Router::new().route(
            "/auth/v1/token",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                AxumStatus::OK
            }),
        );
        let base = serve(router).await?;
        let result = provider(&base, Duration::from_millis(100))?
            .exchange_code("code", None, None)
            .await;
        assert!(matches!(result, Err(ProviderError::Unavailable(_))));
        Ok(())
    }

    #[tokio::test]
    async fn unreachable_provider_is_unavailable() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let base = format!("http://{}", listener.local_addr()?);
        drop(listener);
        let result = provider(&base, Duration::from_secs(1))?
            .fetch_user("token")
            .await;
        assert!(matches!(result, Err(ProviderError::Unavailable(_))));
        Ok(())
    }

    #[test]
    fn users_without_email_are_rejected() {
        let payload = UserPayload {
            id: Uuid::nil(),
            email: None,
            app_metadata: Map::new(),
            user_metadata: Map::new(),
        };
        assert_eq!(payload.into_user(), Err(ProviderError::Rejected));
    }
}
