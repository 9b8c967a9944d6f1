//! External OAuth identity provider.
//!
//! The provider authenticates people; this service decides what they may do.
//! Only the provider's user id, email and metadata hints (initial role and
//! nickname) are consumed.

mod supabase;

pub use supabase::SupabaseProvider;

use crate::error::GateError;
use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderUser {
    pub id: Uuid,
    pub email: String,
    pub role_claim: Option<String>,
    pub nickname: Option<String>,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// The provider refused the code or token.
    #[error("credentials rejected by identity provider")]
    Rejected,
    #[error("identity provider unavailable: {0}")]
    Unavailable(String),
}

impl From<ProviderError> for GateError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Rejected => Self::Unauthenticated,
            ProviderError::Unavailable(reason) => Self::ServiceUnavailable(reason),
        }
    }
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Exchange an OAuth authorization code. Codes are single use, so this is
    /// never retried.
    async fn exchange_code(
        &self,
        code: &str,
        code_verifier: Option<&str>,
        redirect_uri: Option<&str>,
    ) -> Result<ProviderUser, ProviderError>;

    /// Look up the user behind a provider access token.
    async fn fetch_user(&self, access_token: &str) -> Result<ProviderUser, ProviderError>;
}
