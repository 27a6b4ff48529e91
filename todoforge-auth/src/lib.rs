//! # todoforge-auth
//!
//! Token acquisition against the Microsoft identity platform.
//!
//! This crate provides:
//! - [`PublicClient`] - Device-code, redirect and refresh-token grants over a token cache
//! - [`FileCachePlugin`] - Persists the token cache as a JSON file
//! - [`InteractiveTokenProvider`] - Silent reuse with an interactive fallback
//! - [`TokenProvider`] - Trait for components that need bearer tokens
//! - [`StaticTokenProvider`] - Fixed token for tests and overrides
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use todoforge_auth::{
//!     AuthConfig, ConsolePrompt, FileCachePlugin, InteractiveTokenProvider, PublicClient,
//!     TokenProvider,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = PublicClient::new(AuthConfig::new(
//!     "00000000-0000-0000-0000-000000000000",
//!     AuthConfig::DEFAULT_AUTHORITY,
//! ))?
//! .with_cache_plugin(Arc::new(FileCachePlugin::new("/tmp/token_cache.json")));
//!
//! let provider = InteractiveTokenProvider::new(
//!     client,
//!     vec!["Tasks.ReadWrite".to_string()],
//!     Arc::new(ConsolePrompt::new(true)),
//! );
//!
//! let token = provider.access_token().await?;
//! println!("Got token of length {}", token.len());
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;

pub mod cache;
pub mod callback;
pub mod client;
pub mod error;
pub mod prompt;
pub mod provider;

pub use cache::{CachePlugin, FileCachePlugin, TokenCache, TokenCacheContext};
pub use client::{AccountInfo, AuthClient, AuthConfig, AuthenticationResult, PublicClient};
pub use error::{AuthError, Result};
pub use prompt::{ConsolePrompt, DeviceCodeInfo, SignInPrompt};
pub use provider::{InteractiveFlow, InteractiveTokenProvider};

// ============================================================================
// TokenProvider Trait
// ============================================================================

/// Trait for components that need a bearer token.
///
/// Graph requests call this before every request, so implementations
/// decide on their own whether a cached token is still good.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Return a bearer token.
    ///
    /// # Errors
    ///
    /// Returns an error if no token could be obtained.
    async fn access_token(&self) -> Result<String>;
}

/// Token provider that always returns the same token.
///
/// # Example
///
/// ```
/// use todoforge_auth::{StaticTokenProvider, TokenProvider};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let provider = StaticTokenProvider::new("test_token_123");
/// assert_eq!(provider.access_token().await?, "test_token_123");
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn access_token(&self) -> Result<String> {
        Ok(self.token.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_token_provider() {
        let provider = StaticTokenProvider::new("token1");
        assert_eq!(provider.access_token().await.unwrap(), "token1");
    }
}
