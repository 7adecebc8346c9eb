//! Authenticated HTTP access to the registry API.
//!
//! The HTTP client only bounds connection setup. Small API responses get a
//! whole-request deadline; blob transfers are bounded until the response
//! headers arrive and then by an idle deadline on the body stream, so large
//! layers on slow links are never cut off while data keeps flowing.

use std::time::Duration;

use hoist_core::config::EndpointConfig;
use hoist_core::error::{AuthErrorKind, HoistError, Result};
use reqwest::header::{ACCEPT, WWW_AUTHENTICATE};
use reqwest::{Client, Response, StatusCode};

use crate::auth::TokenManager;

const USER_AGENT: &str = concat!("hoist/", env!("CARGO_PKG_VERSION"));

/// Build the HTTP client for one pull from the endpoint configuration.
pub fn build_http_client(config: &EndpointConfig) -> Result<Client> {
    let mut builder = Client::builder()
        .user_agent(USER_AGENT)
        .danger_accept_invalid_certs(config.insecure);

    if let Some(timeout) = config.timeout() {
        builder = builder.connect_timeout(timeout);
    }

    if let Some(proxy) = config.proxy.as_deref().filter(|p| !p.is_empty()) {
        let proxy = reqwest::Proxy::all(proxy)
            .map_err(|e| HoistError::Config(format!("invalid proxy '{}': {}", proxy, e)))?;
        builder = builder.proxy(proxy);
    }

    builder
        .build()
        .map_err(|e| HoistError::Config(format!("failed to create HTTP client: {}", e)))
}

/// Map a non-success HTTP status onto the error taxonomy.
///
/// `what` names the requested object (tag, manifest, blob) for diagnostics.
pub fn status_error(url: &str, status: StatusCode, what: &str) -> HoistError {
    match status {
        StatusCode::NOT_FOUND => HoistError::not_found(format!("{} ({})", what, url)),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => HoistError::auth(
            AuthErrorKind::Unauthorized,
            format!("{} denied with {} at {}", what, status, url),
        ),
        StatusCode::NOT_ACCEPTABLE | StatusCode::UNSUPPORTED_MEDIA_TYPE => {
            HoistError::UnsupportedFormat(format!(
                "registry cannot serve {} in an accepted format ({})",
                what, status
            ))
        }
        _ => HoistError::network(url, format!("{} failed with status {}", what, status)),
    }
}

/// Registry API client carrying the pull's authentication state.
pub struct RegistryTransport {
    client: Client,
    base_url: String,
    tokens: TokenManager,
    request_timeout: Option<Duration>,
}

impl RegistryTransport {
    pub fn new(client: Client, base_url: impl Into<String>, tokens: TokenManager) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            tokens,
            request_timeout: None,
        }
    }

    /// Deadline for API requests, and the idle deadline for blob bodies.
    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    /// `<base>/v2/<path>`
    pub fn api_url(&self, path: &str) -> String {
        format!("{}/v2/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Authenticated GET for a small API response, body included in the deadline.
    ///
    /// A 401 is handed to the token manager once; the request is retried
    /// with the new credential. Any other non-success status is mapped with
    /// [`status_error`].
    pub async fn get(&self, url: &str, accept: Option<&str>, what: &str) -> Result<Response> {
        self.get_with(url, accept, what, true).await
    }

    /// Authenticated GET for a blob. Only the wait for the response headers
    /// is bounded; the caller reads the body with [`Self::request_timeout`]
    /// as an idle deadline.
    pub async fn get_blob(&self, url: &str, what: &str) -> Result<Response> {
        self.get_with(url, None, what, false).await
    }

    async fn get_with(
        &self,
        url: &str,
        accept: Option<&str>,
        what: &str,
        whole_request: bool,
    ) -> Result<Response> {
        let mut retried = false;
        loop {
            let mut request = self.client.get(url);
            if let Some(accept) = accept {
                request = request.header(ACCEPT, accept);
            }
            let request = self.tokens.authorize(request).await?;
            let resp = match self.request_timeout {
                Some(timeout) if whole_request => request.timeout(timeout).send().await?,
                Some(timeout) => tokio::time::timeout(timeout, request.send())
                    .await
                    .map_err(|_| {
                        HoistError::network(
                            url,
                            format!("{} got no response within {}s", what, timeout.as_secs()),
                        )
                    })??,
                None => request.send().await?,
            };
            let status = resp.status();

            if status.is_success() {
                return Ok(resp);
            }

            if status == StatusCode::UNAUTHORIZED && !retried {
                let challenge = resp
                    .headers()
                    .get(WWW_AUTHENTICATE)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_owned);
                tracing::debug!(url = %url, "Request challenged, re-authenticating");
                self.tokens.handle_unauthorized(challenge.as_deref()).await?;
                retried = true;
                continue;
            }

            return Err(status_error(url, status, what));
        }
    }
}
