//! Silent-first token acquisition with a single interactive fallback.

use crate::client::{AuthClient, AuthenticationResult};
use crate::error::Result;
use crate::prompt::SignInPrompt;
use crate::TokenProvider;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// How the user signs in when no cached token can be used.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractiveFlow {
    /// Enter a code on another device.
    #[default]
    DeviceCode,
    /// Authorize in the browser and redirect back to a loopback listener.
    Redirect,
}

/// Hands out bearer tokens, reusing the cached account when possible.
///
/// With no cached account the interactive flow runs straight away. With one,
/// silent acquisition is tried first and any failure falls back to the
/// interactive flow exactly once.
pub struct InteractiveTokenProvider<C> {
    client: C,
    scopes: Vec<String>,
    prompt: Arc<dyn SignInPrompt>,
    flow: InteractiveFlow,
}

impl<C: AuthClient> InteractiveTokenProvider<C> {
    pub fn new(client: C, scopes: Vec<String>, prompt: Arc<dyn SignInPrompt>) -> Self {
        Self {
            client,
            scopes,
            prompt,
            flow: InteractiveFlow::default(),
        }
    }

    pub fn with_flow(mut self, flow: InteractiveFlow) -> Self {
        self.flow = flow;
        self
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Acquire a token, returning the full authentication result.
    pub async fn acquire(&self) -> Result<AuthenticationResult> {
        let accounts = self.client.accounts().await?;

        let Some(account) = accounts.first() else {
            debug!("No cached account; starting {:?} sign-in", self.flow);
            return self.acquire_interactive().await;
        };

        match self.client.acquire_token_silent(account, &self.scopes).await {
            Ok(result) => Ok(result),
            Err(e) => {
                warn!(
                    "Silent token acquisition for {} failed, signing in again: {}",
                    account.username, e
                );
                self.acquire_interactive().await
            }
        }
    }

    /// Run the configured interactive flow regardless of cached state.
    pub async fn acquire_interactive(&self) -> Result<AuthenticationResult> {
        let prompt = self.prompt.as_ref();
        match self.flow {
            InteractiveFlow::DeviceCode => {
                self.client
                    .acquire_token_by_device_code(&self.scopes, prompt)
                    .await
            }
            InteractiveFlow::Redirect => {
                self.client
                    .acquire_token_by_redirect(&self.scopes, prompt)
                    .await
            }
        }
    }

    /// Remove every cached account.
    pub async fn sign_out(&self) -> Result<usize> {
        let accounts = self.client.accounts().await?;
        for account in &accounts {
            self.client.remove_account(account).await?;
        }
        Ok(accounts.len())
    }
}

#[async_trait]
impl<C: AuthClient> TokenProvider for InteractiveTokenProvider<C> {
    async fn access_token(&self) -> Result<String> {
        Ok(self.acquire().await?.access_token)
    }
}
