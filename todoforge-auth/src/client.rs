//! Public client application for the Microsoft identity platform.
//!
//! [`PublicClient`] drives three OAuth2 grants through the `oauth2` crate:
//! the device authorization grant and the authorization-code grant with
//! PKCE for interactive sign-in, and the refresh-token grant for silent
//! renewal. Every acquisition goes through the in-memory [`TokenCache`],
//! bracketed by the configured [`CachePlugin`] hooks.

use crate::cache::{CachePlugin, CachedAccessToken, CachedAccount, TokenCache, TokenCacheContext};
use crate::callback;
use crate::error::{AuthError, Result};
use crate::prompt::{DeviceCodeInfo, SignInPrompt};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, TimeDelta, Utc};
use oauth2::basic::{
    BasicErrorResponse, BasicErrorResponseType, BasicRevocationErrorResponse,
    BasicTokenIntrospectionResponse, BasicTokenType,
};
use oauth2::{
    AuthType, AuthUrl, AuthorizationCode, Client, ClientId, CsrfToken,
    DeviceAuthorizationResponse, DeviceAuthorizationUrl, DeviceCodeErrorResponseType,
    EndpointNotSet, EndpointSet, ErrorResponseType, ExtraDeviceAuthorizationFields,
    ExtraTokenFields, PkceCodeChallenge, RedirectUrl, RefreshToken, RequestTokenError, Scope,
    StandardErrorResponse, StandardRevocableToken, StandardTokenResponse, TokenResponse as _,
    TokenUrl,
};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

/// Always requested so the platform returns an id token and a refresh token.
const OIDC_SCOPES: [&str; 3] = ["openid", "profile", "offline_access"];

const DEFAULT_TOKEN_LIFETIME_SECS: u64 = 3600;
const CALLBACK_TIMEOUT_SECS: u64 = 120;

// ============================================================================
// Public Types
// ============================================================================

/// A signed-in account as recorded in the token cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountInfo {
    /// `<object id>.<tenant id>`
    pub home_account_id: String,
    pub username: String,
    pub tenant_id: String,
}

/// Outcome of a successful token acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticationResult {
    pub access_token: String,
    pub expires_on: DateTime<Utc>,
    pub scopes: Vec<String>,
    pub account: AccountInfo,
}

impl AuthenticationResult {
    fn from_cached(account: &AccountInfo, token: &CachedAccessToken) -> Self {
        Self {
            access_token: token.secret.clone(),
            expires_on: token.expires_on,
            scopes: token.scopes.clone(),
            account: account.clone(),
        }
    }
}

/// Application registration and authority to sign in against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthConfig {
    pub client_id: String,
    /// e.g. `https://login.microsoftonline.com/common`
    pub authority: String,
    /// Loopback port for the redirect flow; `0` picks a free port.
    pub redirect_port: u16,
}

impl AuthConfig {
    pub const DEFAULT_AUTHORITY: &'static str = "https://login.microsoftonline.com/common";

    pub fn new(client_id: impl Into<String>, authority: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            authority: authority.into(),
            redirect_port: 0,
        }
    }

    pub fn with_redirect_port(mut self, port: u16) -> Self {
        self.redirect_port = port;
        self
    }

    fn endpoint(&self, name: &str) -> String {
        format!("{}/oauth2/v2.0/{}", self.authority.trim_end_matches('/'), name)
    }

    fn authorize_endpoint(&self) -> String {
        self.endpoint("authorize")
    }

    fn device_code_endpoint(&self) -> String {
        self.endpoint("devicecode")
    }

    fn token_endpoint(&self) -> String {
        self.endpoint("token")
    }
}

/// Operations of a public client application.
///
/// This is the seam between the token provider and the identity platform;
/// [`PublicClient`] is the real implementation.
#[async_trait]
pub trait AuthClient: Send + Sync {
    /// Accounts currently present in the token cache.
    async fn accounts(&self) -> Result<Vec<AccountInfo>>;

    /// Acquire a token for `account` without user interaction.
    async fn acquire_token_silent(
        &self,
        account: &AccountInfo,
        scopes: &[String],
    ) -> Result<AuthenticationResult>;

    /// Acquire a token through the device-code flow, showing the code via
    /// `prompt`.
    async fn acquire_token_by_device_code(
        &self,
        scopes: &[String],
        prompt: &dyn SignInPrompt,
    ) -> Result<AuthenticationResult>;

    /// Acquire a token through a browser redirect to a loopback listener.
    async fn acquire_token_by_redirect(
        &self,
        scopes: &[String],
        prompt: &dyn SignInPrompt,
    ) -> Result<AuthenticationResult>;

    /// Forget an account and its tokens.
    async fn remove_account(&self, account: &AccountInfo) -> Result<()>;
}

// ============================================================================
// OAuth2 Types
// ============================================================================

/// Token response fields the identity platform adds to the standard set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct IdTokenFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id_token: Option<String>,
}

impl ExtraTokenFields for IdTokenFields {}

/// Device authorization fields the identity platform adds to the standard set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct DeviceCodeFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl ExtraDeviceAuthorizationFields for DeviceCodeFields {}

type PlatformTokenResponse = StandardTokenResponse<IdTokenFields, BasicTokenType>;
type DeviceCodeDetails = DeviceAuthorizationResponse<DeviceCodeFields>;

type OAuthClient = Client<
    BasicErrorResponse,
    PlatformTokenResponse,
    BasicTokenIntrospectionResponse,
    StandardRevocableToken,
    BasicRevocationErrorResponse,
    EndpointSet,
    EndpointSet,
    EndpointNotSet,
    EndpointNotSet,
    EndpointSet,
>;

type SleepFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type SleepFn = Arc<dyn Fn(Duration) -> SleepFuture + Send + Sync>;

fn token_error<RE, T>(err: RequestTokenError<RE, StandardErrorResponse<T>>) -> AuthError
where
    RE: std::error::Error + 'static,
    T: ErrorResponseType + fmt::Display + 'static,
{
    match err {
        RequestTokenError::ServerResponse(response) => AuthError::OAuth {
            error: response.error().to_string(),
            description: response.error_description().cloned(),
        },
        RequestTokenError::Request(e) => AuthError::Request(e.to_string()),
        RequestTokenError::Parse(e, _) => AuthError::InvalidResponse(e.to_string()),
        RequestTokenError::Other(message) => AuthError::InvalidResponse(message),
    }
}

fn invalid_endpoint(e: impl fmt::Display) -> AuthError {
    AuthError::InvalidConfig(e.to_string())
}

/// Derive the cached account identity from an id token's claims.
///
/// The signature is not checked; the token arrived over TLS straight from
/// the token endpoint.
pub fn account_from_id_token(id_token: &str) -> Result<AccountInfo> {
    let payload = id_token
        .split('.')
        .nth(1)
        .ok_or_else(|| AuthError::InvalidIdToken("expected a JWT".to_string()))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| AuthError::InvalidIdToken(e.to_string()))?;
    let claims: IdTokenClaims = serde_json::from_slice(&bytes)?;

    let object_id = claims
        .oid
        .or(claims.sub)
        .ok_or_else(|| AuthError::InvalidIdToken("missing oid and sub claims".to_string()))?;
    let tenant_id = claims.tid.unwrap_or_default();
    let home_account_id = format!("{}.{}", object_id, tenant_id);
    let username = claims
        .preferred_username
        .or(claims.name)
        .unwrap_or(object_id);

    Ok(AccountInfo {
        home_account_id,
        username,
        tenant_id,
    })
}

#[derive(Debug, Deserialize)]
struct IdTokenClaims {
    #[serde(default)]
    oid: Option<String>,
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    tid: Option<String>,
    #[serde(default)]
    preferred_username: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

/// Requested scopes plus the OIDC scopes, each once.
fn request_scopes(scopes: &[String]) -> Vec<Scope> {
    let mut all: Vec<&str> = scopes.iter().map(String::as_str).collect();
    for reserved in OIDC_SCOPES {
        if !all.contains(&reserved) {
            all.push(reserved);
        }
    }
    all.into_iter().map(|s| Scope::new(s.to_string())).collect()
}

/// Cache entry for the access token in `response`.
fn cached_access_token(
    response: &PlatformTokenResponse,
    requested: &[String],
) -> Result<CachedAccessToken> {
    let lifetime = response
        .expires_in()
        .unwrap_or(Duration::from_secs(DEFAULT_TOKEN_LIFETIME_SECS));
    let expires_on = TimeDelta::from_std(lifetime)
        .ok()
        .and_then(|delta| Utc::now().checked_add_signed(delta))
        .ok_or_else(|| {
            AuthError::InvalidResponse(format!("token lifetime out of range: {:?}", lifetime))
        })?;

    let scopes = match response.scopes() {
        Some(granted) => granted.iter().map(|s| s.to_string()).collect(),
        None => requested.to_vec(),
    };

    Ok(CachedAccessToken {
        secret: response.access_token().secret().clone(),
        expires_on,
        scopes,
    })
}

// ============================================================================
// Client Implementation
// ============================================================================

/// Public client application backed by the Microsoft identity platform.
pub struct PublicClient {
    config: AuthConfig,
    oauth: OAuthClient,
    http: reqwest::Client,
    cache: Mutex<TokenCache>,
    cache_plugin: Option<Arc<dyn CachePlugin>>,
    sleep: SleepFn,
}

impl PublicClient {
    /// Build a client for `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the authority does not form valid endpoint URLs.
    pub fn new(config: AuthConfig) -> Result<Self> {
        let oauth: OAuthClient = Client::new(ClientId::new(config.client_id.clone()))
            .set_auth_type(AuthType::RequestBody)
            .set_auth_uri(AuthUrl::new(config.authorize_endpoint()).map_err(invalid_endpoint)?)
            .set_device_authorization_url(
                DeviceAuthorizationUrl::new(config.device_code_endpoint())
                    .map_err(invalid_endpoint)?,
            )
            .set_token_uri(TokenUrl::new(config.token_endpoint()).map_err(invalid_endpoint)?);

        // Token endpoints must not be followed through redirects.
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            config,
            oauth,
            http,
            cache: Mutex::new(TokenCache::new()),
            cache_plugin: None,
            sleep: Arc::new(|interval| -> SleepFuture { Box::pin(tokio::time::sleep(interval)) }),
        })
    }

    /// Persist the token cache through `plugin`.
    pub fn with_cache_plugin(mut self, plugin: Arc<dyn CachePlugin>) -> Self {
        self.cache_plugin = Some(plugin);
        self
    }

    #[cfg(test)]
    fn with_sleep(mut self, sleep: SleepFn) -> Self {
        self.sleep = sleep;
        self
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    async fn load_cache(&self, cache: &mut TokenCache) -> Result<()> {
        if let Some(plugin) = &self.cache_plugin {
            let mut context = TokenCacheContext::new(cache, false);
            plugin.before_cache_access(&mut context).await?;
        }
        Ok(())
    }

    async fn store_cache(&self, cache: &mut TokenCache, has_changed: bool) -> Result<()> {
        if let Some(plugin) = &self.cache_plugin {
            let context = TokenCacheContext::new(cache, has_changed);
            plugin.after_cache_access(&context).await?;
        }
        Ok(())
    }

    /// Serve a token from the cache, refreshing it if needed. The flag is
    /// `true` when the cache was modified.
    async fn silent_from_cache(
        &self,
        cache: &mut TokenCache,
        account: &AccountInfo,
        scopes: &[String],
    ) -> Result<(AuthenticationResult, bool)> {
        let entry = cache
            .get(&account.home_account_id)
            .cloned()
            .ok_or_else(|| AuthError::AccountNotFound(account.username.clone()))?;

        if let Some(token) = entry
            .access_token
            .as_ref()
            .filter(|t| t.is_usable(scopes, Utc::now()))
        {
            debug!("Using cached access token for {}", account.username);
            return Ok((AuthenticationResult::from_cached(&entry.account, token), false));
        }

        debug!("Redeeming refresh token for {}", account.username);
        let refresh_token = RefreshToken::new(entry.refresh_token.clone());
        let response = self
            .oauth
            .exchange_refresh_token(&refresh_token)
            .add_scopes(request_scopes(scopes))
            .request_async(&self.http)
            .await
            .map_err(token_error)?;

        let access_token = cached_access_token(&response, scopes)?;
        let result = AuthenticationResult::from_cached(&entry.account, &access_token);

        cache.upsert(CachedAccount {
            account: entry.account,
            // The platform may rotate refresh tokens; keep the newest one.
            refresh_token: response
                .refresh_token()
                .map(|t| t.secret().clone())
                .unwrap_or(entry.refresh_token),
            access_token: Some(access_token),
        });

        Ok((result, true))
    }

    async fn device_code_login(
        &self,
        scopes: &[String],
        prompt: &dyn SignInPrompt,
    ) -> Result<PlatformTokenResponse> {
        let details: DeviceCodeDetails = self
            .oauth
            .exchange_device_code()
            .add_scopes(request_scopes(scopes))
            .request_async(&self.http)
            .await
            .map_err(token_error)?;

        let expires_in = details.expires_in();
        let deadline = Instant::now().checked_add(expires_in).ok_or_else(|| {
            AuthError::InvalidResponse(format!("device code lifetime out of range: {:?}", expires_in))
        })?;

        prompt.show_device_code(&DeviceCodeInfo {
            user_code: details.user_code().secret().clone(),
            verification_uri: details.verification_uri().url().to_string(),
            expires_in: expires_in.as_secs(),
            message: details.extra_fields().message.clone(),
        });

        // Polling honours authorization_pending and slow_down; the deadline
        // bounds the whole exchange including in-flight requests.
        let sleep = Arc::clone(&self.sleep);
        let poll = self.oauth.exchange_device_access_token(&details).request_async(
            &self.http,
            move |interval| (*sleep)(interval),
            None,
        );

        match tokio::time::timeout_at(deadline, poll).await {
            Err(_) => Err(AuthError::DeviceCodeExpired),
            Ok(Ok(token)) => Ok(token),
            Ok(Err(RequestTokenError::ServerResponse(err))) => match err.error() {
                DeviceCodeErrorResponseType::ExpiredToken => Err(AuthError::DeviceCodeExpired),
                DeviceCodeErrorResponseType::AccessDenied => Err(AuthError::AuthorizationDeclined),
                DeviceCodeErrorResponseType::Basic(BasicErrorResponseType::Extension(code))
                    if code == "authorization_declined" =>
                {
                    Err(AuthError::AuthorizationDeclined)
                }
                _ => Err(token_error::<oauth2::HttpClientError<reqwest::Error>, _>(RequestTokenError::ServerResponse(err))),
            },
            Ok(Err(e)) => Err(token_error(e)),
        }
    }

    async fn redirect_login(
        &self,
        scopes: &[String],
        prompt: &dyn SignInPrompt,
    ) -> Result<PlatformTokenResponse> {
        // Listen before the browser opens so the redirect cannot be missed.
        let listener = callback::bind_loopback(self.config.redirect_port).await?;
        let port = listener.local_addr()?.port();
        let redirect_url =
            RedirectUrl::new(format!("http://localhost:{}", port)).map_err(invalid_endpoint)?;

        let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();
        let (authorize_url, csrf_state) = self
            .oauth
            .authorize_url(CsrfToken::new_random)
            .add_scopes(request_scopes(scopes))
            .set_pkce_challenge(pkce_challenge)
            .set_redirect_uri(Cow::Borrowed(&redirect_url))
            .url();

        debug!("Waiting for the sign-in redirect on port {}", port);
        prompt.open_authorization_url(authorize_url.as_str());

        let params =
            callback::accept_callback(listener, Duration::from_secs(CALLBACK_TIMEOUT_SECS)).await?;

        if let Some(error) = params.get("error") {
            return Err(match error.as_str() {
                "access_denied" => AuthError::AuthorizationDeclined,
                _ => AuthError::OAuth {
                    error: error.clone(),
                    description: params.get("error_description").cloned(),
                },
            });
        }

        if params.get("state").map(String::as_str) != Some(csrf_state.secret().as_str()) {
            return Err(AuthError::StateMismatch);
        }

        let code = params.get("code").ok_or_else(|| {
            AuthError::InvalidResponse("redirect without an authorization code".to_string())
        })?;

        self.oauth
            .exchange_code(AuthorizationCode::new(code.clone()))
            .set_pkce_verifier(pkce_verifier)
            .set_redirect_uri(Cow::Borrowed(&redirect_url))
            .request_async(&self.http)
            .await
            .map_err(token_error)
    }

    /// Record the account and tokens of an interactive sign-in.
    async fn complete_sign_in(
        &self,
        response: PlatformTokenResponse,
        scopes: &[String],
    ) -> Result<AuthenticationResult> {
        let id_token = response.extra_fields().id_token.as_deref().ok_or_else(|| {
            AuthError::InvalidResponse("no id_token in token response".to_string())
        })?;
        let account = account_from_id_token(id_token)?;
        let refresh_token = response
            .refresh_token()
            .map(|t| t.secret().clone())
            .ok_or_else(|| {
                AuthError::InvalidResponse("no refresh_token in token response".to_string())
            })?;
        let access_token = cached_access_token(&response, scopes)?;
        let result = AuthenticationResult::from_cached(&account, &access_token);

        let mut cache = self.cache.lock().await;
        self.load_cache(&mut cache).await?;
        cache.upsert(CachedAccount {
            account,
            refresh_token,
            access_token: Some(access_token),
        });
        self.store_cache(&mut cache, true).await?;

        info!("Signed in as {}", result.account.username);
        Ok(result)
    }
}

#[async_trait]
impl AuthClient for PublicClient {
    async fn accounts(&self) -> Result<Vec<AccountInfo>> {
        let mut cache = self.cache.lock().await;
        self.load_cache(&mut cache).await?;
        let accounts = cache.accounts();
        self.store_cache(&mut cache, false).await?;
        Ok(accounts)
    }

    async fn acquire_token_silent(
        &self,
        account: &AccountInfo,
        scopes: &[String],
    ) -> Result<AuthenticationResult> {
        let mut cache = self.cache.lock().await;
        self.load_cache(&mut cache).await?;

        let outcome = self.silent_from_cache(&mut cache, account, scopes).await;
        let has_changed = matches!(outcome, Ok((_, true)));
        self.store_cache(&mut cache, has_changed).await?;

        outcome.map(|(result, _)| result)
    }

    async fn acquire_token_by_device_code(
        &self,
        scopes: &[String],
        prompt: &dyn SignInPrompt,
    ) -> Result<AuthenticationResult> {
        let response = self.device_code_login(scopes, prompt).await?;
        self.complete_sign_in(response, scopes).await
    }

    async fn acquire_token_by_redirect(
        &self,
        scopes: &[String],
        prompt: &dyn SignInPrompt,
    ) -> Result<AuthenticationResult> {
        let response = self.redirect_login(scopes, prompt).await?;
        self.complete_sign_in(response, scopes).await
    }

    async fn remove_account(&self, account: &AccountInfo) -> Result<()> {
        let mut cache = self.cache.lock().await;
        self.load_cache(&mut cache).await?;
        let removed = cache.remove(&account.home_account_id);
        self.store_cache(&mut cache, removed).await?;

        if removed {
            info!("Signed out {}", account.username);
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TOKEN_PATH: &str = "/common/oauth2/v2.0/token";
    const DEVICE_CODE_PATH: &str = "/common/oauth2/v2.0/devicecode";

    /// Keeps the "persisted" cache in memory and counts writes.
    #[derive(Default)]
    struct RecordingPlugin {
        stored: std::sync::Mutex<Option<TokenCache>>,
        writes: AtomicUsize,
    }

    impl RecordingPlugin {
        fn with_cache(cache: TokenCache) -> Self {
            Self {
                stored: std::sync::Mutex::new(Some(cache)),
                writes: AtomicUsize::new(0),
            }
        }

        fn writes(&self) -> usize {
            self.writes.load(Ordering::SeqCst)
        }

        fn stored(&self) -> TokenCache {
            self.stored.lock().unwrap().clone().unwrap_or_default()
        }
    }

    #[async_trait]
    impl CachePlugin for RecordingPlugin {
        async fn before_cache_access(&self, context: &mut TokenCacheContext<'_>) -> Result<()> {
            if let Some(cache) = self.stored.lock().unwrap().clone() {
                context.replace(cache);
            }
            Ok(())
        }

        async fn after_cache_access(&self, context: &TokenCacheContext<'_>) -> Result<()> {
            if context.has_changed() {
                self.writes.fetch_add(1, Ordering::SeqCst);
                *self.stored.lock().unwrap() = Some(context.token_cache().clone());
            }
            Ok(())
        }
    }

    /// What the simulated browser sends back to the loopback listener.
    #[derive(Clone, Copy, Default)]
    enum BrowserReply {
        #[default]
        Nothing,
        Code,
        ForgedState,
        Denied,
    }

    #[derive(Default)]
    struct RecordingPrompt {
        shown: std::sync::Mutex<Vec<DeviceCodeInfo>>,
        opened: std::sync::Mutex<Vec<String>>,
        reply: BrowserReply,
    }

    impl RecordingPrompt {
        fn replying(reply: BrowserReply) -> Self {
            Self {
                reply,
                ..Self::default()
            }
        }
    }

    impl SignInPrompt for RecordingPrompt {
        fn show_device_code(&self, info: &DeviceCodeInfo) {
            self.shown.lock().unwrap().push(info.clone());
        }

        fn open_authorization_url(&self, url: &str) {
            self.opened.lock().unwrap().push(url.to_string());

            let url = reqwest::Url::parse(url).unwrap();
            let query: HashMap<String, String> = url.query_pairs().into_owned().collect();
            let redirect = reqwest::Url::parse(&query["redirect_uri"]).unwrap();
            let port = redirect.port().unwrap();

            let callback_query = match self.reply {
                BrowserReply::Nothing => return,
                BrowserReply::Code => format!("code=code-1&state={}", query["state"]),
                BrowserReply::ForgedState => "code=code-1&state=forged".to_string(),
                BrowserReply::Denied => {
                    "error=access_denied&error_description=user%20cancelled".to_string()
                }
            };

            tokio::spawn(async move {
                let _ = reqwest::get(format!("http://127.0.0.1:{}/?{}", port, callback_query)).await;
            });
        }
    }

    fn fake_id_token(oid: &str, tid: &str, username: &str) -> String {
        let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"none"}"#);
        let claims = URL_SAFE_NO_PAD.encode(
            json!({ "oid": oid, "tid": tid, "preferred_username": username }).to_string(),
        );
        format!("{}.{}.signature", header, claims)
    }

    fn sign_in_response() -> serde_json::Value {
        json!({
            "token_type": "Bearer",
            "access_token": "at-1",
            "refresh_token": "rt-1",
            "expires_in": 3600,
            "scope": "Tasks.ReadWrite",
            "id_token": fake_id_token("oid-1", "tid-1", "alex@example.com")
        })
    }

    fn device_code_response(expires_in: u64, interval: u64) -> serde_json::Value {
        json!({
            "device_code": "dc-1",
            "user_code": "ABCD-1234",
            "verification_uri": "https://microsoft.com/devicelogin",
            "expires_in": expires_in,
            "interval": interval,
            "message": "Enter ABCD-1234"
        })
    }

    async fn mount_device_code(server: &MockServer, expires_in: u64, interval: u64) {
        Mock::given(method("POST"))
            .and(path(DEVICE_CODE_PATH))
            .and(body_string_contains("client_id=client-id"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(device_code_response(expires_in, interval)),
            )
            .expect(1)
            .mount(server)
            .await;
    }

    fn oauth_error(code: &str) -> ResponseTemplate {
        ResponseTemplate::new(400).set_body_json(json!({ "error": code }))
    }

    fn account() -> AccountInfo {
        AccountInfo {
            home_account_id: "oid-1.tid-1".to_string(),
            username: "alex@example.com".to_string(),
            tenant_id: "tid-1".to_string(),
        }
    }

    fn scopes() -> Vec<String> {
        vec!["Tasks.ReadWrite".to_string()]
    }

    fn cache_with_token(expires_in_minutes: i64) -> TokenCache {
        let mut cache = TokenCache::new();
        cache.upsert(CachedAccount {
            account: account(),
            refresh_token: "rt-1".to_string(),
            access_token: Some(CachedAccessToken {
                secret: "cached-at".to_string(),
                expires_on: Utc::now() + chrono::Duration::minutes(expires_in_minutes),
                scopes: scopes(),
            }),
        });
        cache
    }

    fn client_for(server: &MockServer, plugin: Arc<RecordingPlugin>) -> PublicClient {
        PublicClient::new(AuthConfig::new(
            "client-id",
            format!("{}/common", server.uri()),
        ))
        .unwrap()
        .with_cache_plugin(plugin)
    }

    /// Sleep that returns immediately and records each requested interval.
    fn recording_sleep() -> (SleepFn, Arc<std::sync::Mutex<Vec<Duration>>>) {
        let intervals = Arc::new(std::sync::Mutex::new(Vec::new()));
        let recorded = Arc::clone(&intervals);
        let sleep: SleepFn = Arc::new(move |interval| -> SleepFuture {
            recorded.lock().unwrap().push(interval);
            Box::pin(async {})
        });
        (sleep, intervals)
    }

    #[test]
    fn test_account_from_id_token() {
        let token = fake_id_token("oid-1", "tid-1", "alex@example.com");
        let parsed = account_from_id_token(&token).unwrap();
        assert_eq!(parsed, account());
    }

    #[test]
    fn test_account_from_invalid_id_token() {
        assert!(matches!(
            account_from_id_token("garbage"),
            Err(AuthError::InvalidIdToken(_))
        ));
    }

    #[test]
    fn test_request_scopes_adds_oidc_scopes_once() {
        let scopes = vec!["Tasks.ReadWrite".to_string(), "offline_access".to_string()];
        let requested: Vec<String> = request_scopes(&scopes)
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            requested,
            vec!["Tasks.ReadWrite", "offline_access", "openid", "profile"]
        );
    }

    #[test]
    fn test_endpoints_trim_trailing_slash() {
        let config = AuthConfig::new("id", "https://login.microsoftonline.com/common/");
        assert_eq!(
            config.token_endpoint(),
            "https://login.microsoftonline.com/common/oauth2/v2.0/token"
        );
        assert_eq!(
            config.device_code_endpoint(),
            "https://login.microsoftonline.com/common/oauth2/v2.0/devicecode"
        );
        assert_eq!(
            config.authorize_endpoint(),
            "https://login.microsoftonline.com/common/oauth2/v2.0/authorize"
        );
    }

    #[test]
    fn test_invalid_authority_is_rejected() {
        let result = PublicClient::new(AuthConfig::new("id", "not a url"));
        assert!(matches!(result, Err(AuthError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_device_code_login_populates_cache() {
        let server = MockServer::start().await;
        mount_device_code(&server, 900, 0).await;

        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .and(body_string_contains("device_code=dc-1"))
            .respond_with(oauth_error("authorization_pending"))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .and(body_string_contains("device_code=dc-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(sign_in_response()))
            .expect(1)
            .mount(&server)
            .await;

        let plugin = Arc::new(RecordingPlugin::default());
        let client = client_for(&server, plugin.clone());
        let prompt = RecordingPrompt::default();

        let result = client
            .acquire_token_by_device_code(&scopes(), &prompt)
            .await
            .unwrap();

        assert_eq!(result.access_token, "at-1");
        assert_eq!(result.account, account());
        {
            let shown = prompt.shown.lock().unwrap();
            assert_eq!(shown[0].user_code, "ABCD-1234");
            assert_eq!(shown[0].message.as_deref(), Some("Enter ABCD-1234"));
        }
        assert_eq!(plugin.writes(), 1);

        let accounts = client.accounts().await.unwrap();
        assert_eq!(accounts, vec![account()]);
        assert_eq!(plugin.writes(), 1);
        assert_eq!(
            plugin.stored().get("oid-1.tid-1").unwrap().refresh_token,
            "rt-1"
        );
    }

    #[tokio::test]
    async fn test_device_code_slow_down_stretches_interval() {
        let server = MockServer::start().await;
        mount_device_code(&server, 900, 1).await;

        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .respond_with(oauth_error("slow_down"))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(sign_in_response()))
            .expect(1)
            .mount(&server)
            .await;

        let (sleep, intervals) = recording_sleep();
        let plugin = Arc::new(RecordingPlugin::default());
        let client = client_for(&server, plugin.clone()).with_sleep(sleep);

        let result = client
            .acquire_token_by_device_code(&scopes(), &RecordingPrompt::default())
            .await
            .unwrap();

        assert_eq!(result.access_token, "at-1");
        assert_eq!(*intervals.lock().unwrap(), vec![Duration::from_secs(6)]);
        assert_eq!(plugin.writes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_code_deadline_expires() {
        let server = MockServer::start().await;
        mount_device_code(&server, 30, 5).await;

        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .respond_with(oauth_error("authorization_pending"))
            .mount(&server)
            .await;

        let plugin = Arc::new(RecordingPlugin::default());
        let client = client_for(&server, plugin.clone());
        let prompt = RecordingPrompt::default();

        let started = Instant::now();
        let result = client.acquire_token_by_device_code(&scopes(), &prompt).await;

        assert!(matches!(result, Err(AuthError::DeviceCodeExpired)));
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert_eq!(prompt.shown.lock().unwrap().len(), 1);
        assert_eq!(plugin.writes(), 0);
    }

    #[tokio::test]
    async fn test_device_code_expired_token_response() {
        let server = MockServer::start().await;
        mount_device_code(&server, 900, 0).await;

        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .respond_with(oauth_error("expired_token"))
            .expect(1)
            .mount(&server)
            .await;

        let plugin = Arc::new(RecordingPlugin::default());
        let client = client_for(&server, plugin.clone());

        let result = client
            .acquire_token_by_device_code(&scopes(), &RecordingPrompt::default())
            .await;

        assert!(matches!(result, Err(AuthError::DeviceCodeExpired)));
        assert_eq!(plugin.writes(), 0);
    }

    #[tokio::test]
    async fn test_device_code_declined() {
        for code in ["authorization_declined", "access_denied"] {
            let server = MockServer::start().await;
            mount_device_code(&server, 900, 0).await;

            Mock::given(method("POST"))
                .and(path(TOKEN_PATH))
                .respond_with(oauth_error(code))
                .expect(1)
                .mount(&server)
                .await;

            let plugin = Arc::new(RecordingPlugin::default());
            let client = client_for(&server, plugin.clone());

            let result = client
                .acquire_token_by_device_code(&scopes(), &RecordingPrompt::default())
                .await;

            assert!(
                matches!(result, Err(AuthError::AuthorizationDeclined)),
                "{} should decline, got {:?}",
                code,
                result
            );
            assert_eq!(plugin.writes(), 0);
        }
    }

    #[tokio::test]
    async fn test_device_code_absurd_lifetime_is_rejected() {
        let server = MockServer::start().await;
        mount_device_code(&server, u64::MAX, 0).await;

        let plugin = Arc::new(RecordingPlugin::default());
        let client = client_for(&server, plugin.clone());
        let prompt = RecordingPrompt::default();

        let result = client.acquire_token_by_device_code(&scopes(), &prompt).await;

        assert!(matches!(result, Err(AuthError::InvalidResponse(_))));
        assert!(prompt.shown.lock().unwrap().is_empty());
        assert_eq!(plugin.writes(), 0);
    }

    #[tokio::test]
    async fn test_redirect_login_populates_cache() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code=code-1"))
            .and(body_string_contains("code_verifier="))
            .and(body_string_contains("client_id=client-id"))
            .respond_with(ResponseTemplate::new(200).set_body_json(sign_in_response()))
            .expect(1)
            .mount(&server)
            .await;

        let plugin = Arc::new(RecordingPlugin::default());
        let client = client_for(&server, plugin.clone());
        let prompt = RecordingPrompt::replying(BrowserReply::Code);

        let result = client
            .acquire_token_by_redirect(&scopes(), &prompt)
            .await
            .unwrap();

        assert_eq!(result.access_token, "at-1");
        assert_eq!(result.account, account());
        assert_eq!(plugin.writes(), 1);

        let opened = prompt.opened.lock().unwrap();
        assert_eq!(opened.len(), 1);
        assert!(opened[0].contains("/common/oauth2/v2.0/authorize?"));
        assert!(opened[0].contains("code_challenge_method=S256"));
        assert!(opened[0].contains("redirect_uri=http%3A%2F%2Flocalhost%3A"));
    }

    #[tokio::test]
    async fn test_redirect_login_rejects_forged_state() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(sign_in_response()))
            .expect(0)
            .mount(&server)
            .await;

        let plugin = Arc::new(RecordingPlugin::default());
        let client = client_for(&server, plugin.clone());

        let result = client
            .acquire_token_by_redirect(&scopes(), &RecordingPrompt::replying(BrowserReply::ForgedState))
            .await;

        assert!(matches!(result, Err(AuthError::StateMismatch)));
        assert_eq!(plugin.writes(), 0);
    }

    #[tokio::test]
    async fn test_redirect_login_declined() {
        let server = MockServer::start().await;
        let plugin = Arc::new(RecordingPlugin::default());
        let client = client_for(&server, plugin.clone());

        let result = client
            .acquire_token_by_redirect(&scopes(), &RecordingPrompt::replying(BrowserReply::Denied))
            .await;

        assert!(matches!(result, Err(AuthError::AuthorizationDeclined)));
        assert_eq!(plugin.writes(), 0);
    }

    #[tokio::test]
    async fn test_silent_uses_valid_cached_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let plugin = Arc::new(RecordingPlugin::with_cache(cache_with_token(60)));
        let client = client_for(&server, plugin.clone());

        let result = client
            .acquire_token_silent(&account(), &scopes())
            .await
            .unwrap();

        assert_eq!(result.access_token, "cached-at");
        assert_eq!(plugin.writes(), 0);
    }

    #[tokio::test]
    async fn test_silent_refreshes_expired_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=rt-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "token_type": "Bearer",
                "access_token": "at-2",
                "refresh_token": "rt-2",
                "expires_in": 3600,
                "scope": "Tasks.ReadWrite"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let plugin = Arc::new(RecordingPlugin::with_cache(cache_with_token(-10)));
        let client = client_for(&server, plugin.clone());

        let result = client
            .acquire_token_silent(&account(), &scopes())
            .await
            .unwrap();

        assert_eq!(result.access_token, "at-2");
        assert_eq!(result.scopes, scopes());
        assert_eq!(plugin.writes(), 1);

        let stored = plugin.stored();
        let entry = stored.get("oid-1.tid-1").unwrap();
        assert_eq!(entry.refresh_token, "rt-2");
        assert_eq!(entry.access_token.as_ref().unwrap().secret, "at-2");
    }

    #[tokio::test]
    async fn test_silent_refresh_absurd_lifetime_does_not_persist() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "token_type": "Bearer",
                "access_token": "at-2",
                "expires_in": u64::MAX
            })))
            .expect(1)
            .mount(&server)
            .await;

        let plugin = Arc::new(RecordingPlugin::with_cache(cache_with_token(-10)));
        let client = client_for(&server, plugin.clone());

        let result = client.acquire_token_silent(&account(), &scopes()).await;

        assert!(matches!(result, Err(AuthError::InvalidResponse(_))));
        assert_eq!(plugin.writes(), 0);
    }

    #[tokio::test]
    async fn test_silent_refresh_failure_does_not_persist() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "invalid_grant",
                "error_description": "AADSTS70000: refresh token expired"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let plugin = Arc::new(RecordingPlugin::with_cache(cache_with_token(-10)));
        let client = client_for(&server, plugin.clone());

        let result = client.acquire_token_silent(&account(), &scopes()).await;

        match result {
            Err(AuthError::OAuth { error, description }) => {
                assert_eq!(error, "invalid_grant");
                assert!(description.unwrap().contains("AADSTS70000"));
            }
            other => panic!("expected invalid_grant, got {:?}", other),
        }
        assert_eq!(plugin.writes(), 0);
    }

    #[tokio::test]
    async fn test_silent_unknown_account() {
        let server = MockServer::start().await;
        let plugin = Arc::new(RecordingPlugin::default());
        let client = client_for(&server, plugin);

        let result = client.acquire_token_silent(&account(), &scopes()).await;
        assert!(matches!(result, Err(AuthError::AccountNotFound(_))));
    }

    #[tokio::test]
    async fn test_remove_account_persists() {
        let server = MockServer::start().await;
        let plugin = Arc::new(RecordingPlugin::with_cache(cache_with_token(60)));
        let client = client_for(&server, plugin.clone());

        client.remove_account(&account()).await.unwrap();
        assert_eq!(plugin.writes(), 1);
        assert!(plugin.stored().is_empty());

        client.remove_account(&account()).await.unwrap();
        assert_eq!(plugin.writes(), 1);
    }
}
