use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{HoistError, Result};

/// Default index endpoint (Docker Hub).
pub const DEFAULT_INDEX_URL: &str = "https://index.docker.io";

/// Default number of concurrent layer downloads.
pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 3;

/// Default per-request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Registry endpoint configuration.
///
/// Immutable for the duration of one pull. Each pull session clones it, so
/// concurrent pulls never share mutable state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Index URL (e.g., "https://index.docker.io")
    pub index_url: String,

    /// Registry URL override; when set, API requests go here instead of the index
    pub registry_url: Option<String>,

    /// HTTP/HTTPS proxy URL
    pub proxy: Option<String>,

    /// Skip TLS certificate verification
    pub insecure: bool,

    /// Registry credentials
    pub credentials: Option<Credentials>,

    /// Platform selected from manifest lists
    pub platform: Platform,

    /// Upper bound on concurrent blob downloads
    pub max_concurrent_downloads: usize,

    /// Per-request timeout in seconds (0 = none)
    pub timeout_secs: u64,

    /// Parent directory for the per-pull scratch workspace (system temp dir if unset)
    pub scratch_dir: Option<PathBuf>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            index_url: DEFAULT_INDEX_URL.to_string(),
            registry_url: None,
            proxy: None,
            insecure: false,
            credentials: None,
            platform: Platform::host(),
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            scratch_dir: None,
        }
    }
}

impl EndpointConfig {
    /// Base URL used for `/v2/` API requests, without a trailing slash.
    ///
    /// The registry override wins over the index. A bare hostname gets `https://`.
    pub fn base_url(&self) -> String {
        let raw = self
            .registry_url
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(&self.index_url)
            .trim()
            .trim_end_matches('/');

        if raw.contains("://") {
            raw.to_string()
        } else {
            format!("https://{}", raw)
        }
    }

    /// Request timeout, if any.
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }

    /// Check the configuration before any request is made.
    pub fn validate(&self) -> Result<()> {
        let base = self.base_url();
        let url = reqwest::Url::parse(&base)
            .map_err(|e| HoistError::Config(format!("invalid registry URL '{}': {}", base, e)))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(HoistError::Config(format!(
                "unsupported registry URL scheme '{}' in '{}'",
                url.scheme(),
                base
            )));
        }

        if let Some(proxy) = &self.proxy {
            reqwest::Url::parse(proxy)
                .map_err(|e| HoistError::Config(format!("invalid proxy URL '{}': {}", proxy, e)))?;
        }

        if self.max_concurrent_downloads == 0 {
            return Err(HoistError::Config(
                "max_concurrent_downloads must be at least 1".to_string(),
            ));
        }

        if let Some(creds) = &self.credentials {
            if creds.username.is_empty() {
                return Err(HoistError::Config(
                    "username must not be empty when credentials are set".to_string(),
                ));
            }
        }

        Ok(())
    }
}

/// Username/password pair for a registry.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Target platform for manifest list resolution (e.g., `linux/arm64/v8`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
    pub variant: Option<String>,
}

impl Platform {
    pub fn new(os: impl Into<String>, architecture: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            architecture: architecture.into(),
            variant: None,
        }
    }

    /// Linux on the host CPU architecture.
    ///
    /// Images are always Linux images, whatever OS hoist itself runs on.
    pub fn host() -> Self {
        let arch = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            "x86" => "386",
            "powerpc64" => "ppc64le",
            other => other,
        };
        Self::new("linux", arch)
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(variant) = &self.variant {
            write!(f, "/{}", variant)?;
        }
        Ok(())
    }
}

impl std::str::FromStr for Platform {
    type Err = HoistError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('/').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(HoistError::Config(format!(
                "invalid platform '{}': expected os/arch[/variant]",
                s
            )));
        }
        match parts.as_slice() {
            [os, arch] => Ok(Self::new(*os, *arch)),
            [os, arch, variant] => Ok(Self {
                os: os.to_string(),
                architecture: arch.to_string(),
                variant: Some(variant.to_string()),
            }),
            _ => Err(HoistError::Config(format!(
                "invalid platform '{}': expected os/arch[/variant]",
                s
            ))),
        }
    }
}
