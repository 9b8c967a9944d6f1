//! Welcome notifications sent after a role grant commits.

use crate::{roles::Role, session::Identity, APP_USER_AGENT};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::info;

#[async_trait]
pub trait WelcomeNotifier: Send + Sync {
    async fn role_granted(&self, user: &Identity, role: Role) -> Result<()>;
}

#[derive(Clone, Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl WelcomeNotifier for LogNotifier {
    async fn role_granted(&self, user: &Identity, role: Role) -> Result<()> {
        info!(user = %user.id, email = %user.email, %role, "Role granted");
        Ok(())
    }
}

#[derive(Serialize)]
struct WelcomePayload<'a> {
    user_id: String,
    email: &'a str,
    nickname: Option<&'a str>,
    role: Role,
}

/// Posts a JSON event to the mail worker.
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(url: String, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(APP_USER_AGENT)
            .timeout(timeout)
            .build()
            .context("Failed to build notifier client")?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl WelcomeNotifier for WebhookNotifier {
    async fn role_granted(&self, user: &Identity, role: Role) -> Result<()> {
        let payload = WelcomePayload {
            user_id: user.id.to_string(),
            email: &user.email,
            nickname: user.nickname.as_deref(),
            role,
        };
        self.client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .context("Failed to reach mail worker")?
            .error_for_status()
            .context("Mail worker refused welcome event")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::post, Json, Router};
    use serde_json::Value;
    use std::sync::Arc;
    use tokio::{net::TcpListener, sync::Mutex};
    use uuid::Uuid;

    fn user() -> Identity {
        Identity {
            id: Uuid::new_v4(),
            email: "new.member@example.com".to_string(),
            role: Role::Member,
            nickname: Some("新人".to_string()),
        }
    }

    #[tokio::test]
    async fn webhook_posts_event() -> Result<()> {
        let received: Arc<Mutex<Option<Value>>> = Arc::default();
        let sink = received.clone();
        let router = Router::new().route(
            "/welcome",
            post(move |Json(body): Json<Value>| {
                let sink = sink.clone();
                async move {
                    *sink.lock().await = Some(body);
                    StatusCode::ACCEPTED
                }
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let url = format!("http://{}/welcome", listener.local_addr()?);
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        let notifier = WebhookNotifier::new(url, Duration::from_secs(2))?;
        notifier.role_granted(&user(), Role::Member).await?;

        let body = received.lock().await.clone().unwrap_or_default();
        assert_eq!(body["role"], "Member");
        assert_eq!(body["email"], "new.member@example.com");
        Ok(())
    }

    #[tokio::test]
    async fn webhook_errors_surface() -> Result<()> {
        let router = Router::new().route("/welcome", post(|| async { StatusCode::BAD_GATEWAY }));
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let url = format!("http://{}/welcome", listener.local_addr()?);
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        let notifier = WebhookNotifier::new(url, Duration::from_secs(2))?;
        assert!(notifier.role_granted(&user(), Role::Seller).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn log_notifier_never_fails() {
        assert!(LogNotifier.role_granted(&user(), Role::Member).await.is_ok());
    }
}
