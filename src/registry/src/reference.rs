//! Image reference parsing.
//!
//! Parses references like `redis`, `redis:7`, or `bitnami/redis:7.2` into a
//! namespace-qualified repository and a tag. The registry host is never part
//! of the reference; it comes from the endpoint configuration.

use hoist_core::error::{HoistError, Result};

/// Namespace applied to single-component (official) image names.
const OFFICIAL_NAMESPACE: &str = "library";

/// Default tag when none is specified.
const DEFAULT_TAG: &str = "latest";

/// Longest tag the distribution API accepts.
const MAX_TAG_LEN: usize = 128;

/// Parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    /// Repository path (e.g., "library/nginx", "bitnami/redis")
    pub repository: String,
    /// Tag (e.g., "latest", "7.2")
    pub tag: String,
}

impl ImageReference {
    /// Parse an image reference string.
    ///
    /// Supports formats:
    /// - `redis` → library/redis:latest
    /// - `redis:7` → library/redis:7
    /// - `bitnami/redis` → bitnami/redis:latest
    /// - `org/team/image:v1` → org/team/image:v1
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(HoistError::InvalidReference(
                "empty image reference".to_string(),
            ));
        }
        if reference.contains("://") {
            return Err(HoistError::InvalidReference(format!(
                "'{}' contains a URL scheme; pass the registry with --registry instead",
                reference
            )));
        }
        if reference.contains('@') {
            return Err(HoistError::InvalidReference(format!(
                "'{}': digest references are not supported, use name[:tag]",
                reference
            )));
        }

        // The tag separator is the last colon after the last slash
        let name_start = reference.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (name, tag) = match reference[name_start..].rfind(':') {
            Some(colon) => {
                let split = name_start + colon;
                (&reference[..split], &reference[split + 1..])
            }
            None => (reference, DEFAULT_TAG),
        };

        validate_tag(tag, reference)?;
        let repository = Self::qualify_repository(name, reference)?;

        Ok(ImageReference {
            repository,
            tag: tag.to_string(),
        })
    }

    /// Apply the official namespace and validate path components.
    fn qualify_repository(name: &str, reference: &str) -> Result<String> {
        let components: Vec<&str> = name.split('/').collect();

        if let Some(first) = components.first() {
            if components.len() > 1
                && (first.contains('.') || first.contains(':') || *first == "localhost")
            {
                return Err(HoistError::InvalidReference(format!(
                    "'{}' names a registry host '{}'; pass it with --registry instead",
                    reference, first
                )));
            }
        }

        for component in &components {
            validate_component(component, reference)?;
        }

        Ok(if components.len() == 1 {
            format!("{}/{}", OFFICIAL_NAMESPACE, name)
        } else {
            name.to_string()
        })
    }

    /// Repository scope requested from the token service.
    pub fn pull_scope(&self) -> String {
        format!("repository:{}:pull", self.repository)
    }

    /// Archive file stem with path-unsafe characters replaced
    /// (e.g., "library/redis" → "library_redis").
    pub fn file_stem(&self) -> String {
        self.repository
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }

    /// The `repository:tag` label written into the archive.
    pub fn repo_tag(&self) -> String {
        format!("{}:{}", self.repository, self.tag)
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)
    }
}

impl std::str::FromStr for ImageReference {
    type Err = HoistError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn validate_component(component: &str, reference: &str) -> Result<()> {
    let valid_chars = component
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'));
    let valid_edges = component
        .chars()
        .next()
        .map_or(false, |c| c.is_ascii_alphanumeric())
        && component
            .chars()
            .last()
            .map_or(false, |c| c.is_ascii_alphanumeric());

    if component.is_empty() || !valid_chars || !valid_edges {
        return Err(HoistError::InvalidReference(format!(
            "invalid repository component '{}' in '{}'",
            component, reference
        )));
    }
    Ok(())
}

fn validate_tag(tag: &str, reference: &str) -> Result<()> {
    let valid = !tag.is_empty()
        && tag.len() <= MAX_TAG_LEN
        && tag
            .chars()
            .next()
            .map_or(false, |c| c.is_ascii_alphanumeric() || c == '_')
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));

    if !valid {
        return Err(HoistError::InvalidReference(format!(
            "invalid tag '{}' in '{}'",
            tag, reference
        )));
    }
    Ok(())
}
