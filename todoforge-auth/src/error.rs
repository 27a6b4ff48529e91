use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("OAuth error {error}: {}", .description.as_deref().unwrap_or("no description"))]
    OAuth {
        error: String,
        description: Option<String>,
    },

    #[error("Token request failed: {0}")]
    Request(String),

    #[error("The user declined the sign-in request")]
    AuthorizationDeclined,

    #[error("Device code expired before sign-in completed")]
    DeviceCodeExpired,

    #[error("Sign-in redirect carried an unexpected state parameter")]
    StateMismatch,

    #[error("Sign-in callback failed: {0}")]
    Callback(String),

    #[error("Invalid authority configuration: {0}")]
    InvalidConfig(String),

    #[error("Account not found in token cache: {0}")]
    AccountNotFound(String),

    #[error("Invalid id token: {0}")]
    InvalidIdToken(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

pub type Result<T> = std::result::Result<T, AuthError>;
