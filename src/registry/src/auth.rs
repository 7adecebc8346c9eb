//! Registry authentication.
//!
//! The distribution token handshake is modeled as an explicit state machine:
//!
//! ```text
//!   NoChallenge ──401 Bearer──▶ ChallengeReceived ──token──▶ TokenAcquired
//!        │                                                     │
//!        └──401 Basic + credentials──▶ Basic      401 new scope / expiry
//!                                                              │
//!                                              ChallengeReceived ◀┘
//! ```
//!
//! A [`TokenManager`] lives for exactly one pull. Tokens are never persisted
//! or shared across pulls.

use chrono::{DateTime, Duration, Utc};
use hoist_core::config::Credentials;
use hoist_core::error::{AuthErrorKind, HoistError, Result};
use parking_lot::RwLock;
use reqwest::header::WWW_AUTHENTICATE;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;

use crate::transport::status_error;

/// Token lifetime assumed when the token service does not send `expires_in`.
const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 60;

/// Tokens are refreshed this long before their estimated expiry.
const EXPIRY_MARGIN_SECS: i64 = 5;

/// Authentication scheme named by a `WWW-Authenticate` challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeScheme {
    Bearer,
    Basic,
}

/// Parsed `WWW-Authenticate` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub scheme: ChallengeScheme,
    pub realm: String,
    pub service: Option<String>,
    pub scope: Option<String>,
}

impl Challenge {
    /// Parse a challenge header such as
    /// `Bearer realm="https://auth.docker.io/token",service="registry.docker.io"`.
    pub fn parse(header: &str) -> Result<Self> {
        let header = header.trim();
        let (scheme_str, params_str) = match header.find(char::is_whitespace) {
            Some(idx) => (&header[..idx], header[idx..].trim_start()),
            None => (header, ""),
        };

        let scheme = if scheme_str.eq_ignore_ascii_case("bearer") {
            ChallengeScheme::Bearer
        } else if scheme_str.eq_ignore_ascii_case("basic") {
            ChallengeScheme::Basic
        } else {
            return Err(HoistError::auth(
                AuthErrorKind::MalformedChallenge,
                format!("unsupported authentication scheme in '{}'", header),
            ));
        };

        let params = parse_auth_params(params_str).map_err(|msg| {
            HoistError::auth(
                AuthErrorKind::MalformedChallenge,
                format!("{} in '{}'", msg, header),
            )
        })?;

        let mut realm = None;
        let mut service = None;
        let mut scope = None;
        for (key, value) in params {
            if key.eq_ignore_ascii_case("realm") {
                realm = Some(value);
            } else if key.eq_ignore_ascii_case("service") {
                service = Some(value);
            } else if key.eq_ignore_ascii_case("scope") {
                scope = Some(value);
            }
        }

        // Basic challenges may omit the realm; bearer challenges cannot.
        let realm = match (scheme, realm) {
            (_, Some(r)) if !r.is_empty() => r,
            (ChallengeScheme::Basic, _) => String::new(),
            (ChallengeScheme::Bearer, _) => {
                return Err(HoistError::auth(
                    AuthErrorKind::MalformedChallenge,
                    format!("missing realm in '{}'", header),
                ))
            }
        };

        Ok(Self {
            scheme,
            realm,
            service,
            scope,
        })
    }
}

/// Split `key="value", key2=value2` pairs, honoring quoted commas and escapes.
fn parse_auth_params(input: &str) -> std::result::Result<Vec<(String, String)>, String> {
    let mut params = Vec::new();
    let mut chars = input.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace() || *c == ',') {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut key = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' || c.is_whitespace() {
                break;
            }
            key.push(c);
            chars.next();
        }
        while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
            chars.next();
        }
        if chars.next() != Some('=') || key.is_empty() {
            return Err(format!("expected key=value near '{}'", key));
        }
        while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
            chars.next();
        }

        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            let mut closed = false;
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => {
                        closed = true;
                        break;
                    }
                    other => value.push(other),
                }
            }
            if !closed {
                return Err(format!("unterminated quoted value for '{}'", key));
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c == ',' || c.is_whitespace() {
                    break;
                }
                value.push(c);
                chars.next();
            }
        }

        params.push((key, value));
    }

    Ok(params)
}

/// Bearer token issued by a token service.
#[derive(Clone)]
pub struct Token {
    value: String,
    pub realm: String,
    pub service: Option<String>,
    pub scope: String,
    pub expires_at: DateTime<Utc>,
}

impl Token {
    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() + Duration::seconds(EXPIRY_MARGIN_SECS) >= self.expires_at
    }
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Token")
            .field("realm", &self.realm)
            .field("service", &self.service)
            .field("scope", &self.scope)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Authentication state of one pull.
#[derive(Debug, Clone)]
pub enum AuthState {
    /// No challenge seen; requests go out without credentials
    NoChallenge,
    /// Registry issued a bearer challenge that has not been answered yet
    ChallengeReceived(Challenge),
    /// Bearer token in hand
    TokenAcquired(Token),
    /// Registry asked for HTTP basic credentials
    Basic(Credentials),
}

/// Token service response body.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
    expires_in: Option<i64>,
    issued_at: Option<DateTime<Utc>>,
}

/// Negotiates and caches the credential presented on registry requests.
pub struct TokenManager {
    client: Client,
    base_url: String,
    credentials: Option<Credentials>,
    default_scope: String,
    request_timeout: Option<std::time::Duration>,
    state: RwLock<AuthState>,
}

impl TokenManager {
    /// Create a token manager for one repository scope (`repository:<name>:pull`).
    pub fn new(
        client: Client,
        base_url: impl Into<String>,
        credentials: Option<Credentials>,
        default_scope: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            credentials,
            default_scope: default_scope.into(),
            request_timeout: None,
            state: RwLock::new(AuthState::NoChallenge),
        }
    }

    /// Deadline for the API probe and token requests.
    pub fn with_request_timeout(mut self, timeout: Option<std::time::Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn bounded(&self, request: RequestBuilder) -> RequestBuilder {
        match self.request_timeout {
            Some(timeout) => request.timeout(timeout),
            None => request,
        }
    }

    /// Current state snapshot.
    pub fn state(&self) -> AuthState {
        self.state.read().clone()
    }

    /// Probe `/v2/` and complete the handshake the registry asks for.
    ///
    /// Returns the state the handshake ended in.
    pub async fn authenticate(&self) -> Result<AuthState> {
        let url = format!("{}/v2/", self.base_url);
        tracing::debug!(url = %url, "Probing registry API");

        let resp = self.bounded(self.client.get(&url)).send().await?;
        let status = resp.status();

        if status.is_success() {
            tracing::debug!(url = %url, "Registry requires no authentication");
            *self.state.write() = AuthState::NoChallenge;
            return Ok(AuthState::NoChallenge);
        }

        if status == StatusCode::UNAUTHORIZED {
            let header = resp
                .headers()
                .get(WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned);
            self.answer_challenge(header.as_deref()).await?;
            return Ok(self.state());
        }

        Err(status_error(&url, status, "registry API probe"))
    }

    /// Attach the current credential to a request, refreshing an expired token first.
    pub async fn authorize(&self, request: RequestBuilder) -> Result<RequestBuilder> {
        let expired = match &*self.state.read() {
            AuthState::TokenAcquired(token) if token.is_expired() => Some(Challenge {
                scheme: ChallengeScheme::Bearer,
                realm: token.realm.clone(),
                service: token.service.clone(),
                scope: Some(token.scope.clone()),
            }),
            _ => None,
        };

        if let Some(challenge) = expired {
            tracing::debug!(scope = ?challenge.scope, "Bearer token expired, refreshing");
            self.acquire_token(&challenge).await?;
        }

        Ok(match &*self.state.read() {
            AuthState::TokenAcquired(token) => request.bearer_auth(token.value()),
            AuthState::Basic(creds) => request.basic_auth(&creds.username, Some(&creds.password)),
            AuthState::NoChallenge | AuthState::ChallengeReceived(_) => request,
        })
    }

    /// React to a 401 on an authorized request.
    ///
    /// Returns `Ok(())` when a new credential was obtained and the request
    /// should be retried. A challenge the current credential already
    /// satisfies means the registry rejected it: `Unauthorized`.
    pub async fn handle_unauthorized(&self, www_authenticate: Option<&str>) -> Result<()> {
        let header = www_authenticate.ok_or_else(|| {
            HoistError::auth(
                AuthErrorKind::MalformedChallenge,
                "401 response without WWW-Authenticate header",
            )
        })?;
        let challenge = Challenge::parse(header)?;
        let wanted_scope = challenge
            .scope
            .clone()
            .unwrap_or_else(|| self.default_scope.clone());

        let already_satisfied = match &*self.state.read() {
            AuthState::TokenAcquired(token) => token.scope == wanted_scope && !token.is_expired(),
            AuthState::Basic(_) => challenge.scheme == ChallengeScheme::Basic,
            AuthState::NoChallenge | AuthState::ChallengeReceived(_) => false,
        };
        if already_satisfied {
            return Err(HoistError::auth(
                AuthErrorKind::Unauthorized,
                format!("registry rejected credentials for scope '{}'", wanted_scope),
            ));
        }

        self.answer_challenge(Some(header)).await
    }

    async fn answer_challenge(&self, header: Option<&str>) -> Result<()> {
        let header = header.ok_or_else(|| {
            HoistError::auth(
                AuthErrorKind::MalformedChallenge,
                "401 response without WWW-Authenticate header",
            )
        })?;
        let challenge = Challenge::parse(header)?;
        tracing::debug!(
            scheme = ?challenge.scheme,
            realm = %challenge.realm,
            service = ?challenge.service,
            scope = ?challenge.scope,
            "Received authentication challenge"
        );

        match challenge.scheme {
            ChallengeScheme::Bearer => {
                *self.state.write() = AuthState::ChallengeReceived(challenge.clone());
                self.acquire_token(&challenge).await
            }
            ChallengeScheme::Basic => match &self.credentials {
                Some(creds) => {
                    *self.state.write() = AuthState::Basic(creds.clone());
                    Ok(())
                }
                None => Err(HoistError::auth(
                    AuthErrorKind::Unauthorized,
                    "registry requires basic authentication but no credentials were given",
                )),
            },
        }
    }

    /// Exchange a bearer challenge for a token at the challenge's realm.
    async fn acquire_token(&self, challenge: &Challenge) -> Result<()> {
        let scope = challenge
            .scope
            .clone()
            .unwrap_or_else(|| self.default_scope.clone());

        let mut token_url = reqwest::Url::parse(&challenge.realm).map_err(|e| {
            HoistError::auth(
                AuthErrorKind::MalformedChallenge,
                format!("invalid realm URL '{}': {}", challenge.realm, e),
            )
        })?;
        {
            let mut query = token_url.query_pairs_mut();
            if let Some(service) = &challenge.service {
                query.append_pair("service", service);
            }
            query.append_pair("scope", &scope);
        }

        let mut request = self.client.get(token_url.clone());
        if let Some(creds) = &self.credentials {
            request = request.basic_auth(&creds.username, Some(&creds.password));
        }

        let resp = self.bounded(request).send().await?;
        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(HoistError::auth(
                AuthErrorKind::Unauthorized,
                format!("token service {} returned {}", challenge.realm, status),
            ));
        }
        if !status.is_success() {
            return Err(status_error(token_url.as_str(), status, "token request"));
        }

        // A failed body read stays a retryable network error.
        let bytes = resp.bytes().await?;
        let body: TokenResponse = serde_json::from_slice(&bytes).map_err(|e| {
            HoistError::auth(
                AuthErrorKind::InvalidTokenResponse,
                format!("undecodable token response from {}: {}", challenge.realm, e),
            )
        })?;

        let value = body
            .token
            .or(body.access_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                HoistError::auth(
                    AuthErrorKind::InvalidTokenResponse,
                    format!("no token in response from {}", challenge.realm),
                )
            })?;

        let lifetime = body
            .expires_in
            .filter(|s| *s > 0)
            .unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS);
        let expires_at = body.issued_at.unwrap_or_else(Utc::now) + Duration::seconds(lifetime);

        tracing::debug!(
            realm = %challenge.realm,
            scope = %scope,
            expires_at = %expires_at,
            "Acquired bearer token"
        );

        *self.state.write() = AuthState::TokenAcquired(Token {
            value,
            realm: challenge.realm.clone(),
            service: challenge.service.clone(),
            scope,
            expires_at,
        });
        Ok(())
    }
}
