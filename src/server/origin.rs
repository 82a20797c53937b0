//! Origin validation
//!
//! WebSocket upgrades carry the browser's `Origin` header; deployments
//! restrict who may connect by matching its hostname against a configured
//! regexp. An empty pattern admits every origin.

use regex::Regex;

/// Decides whether an upgrade request's origin is acceptable.
#[derive(Debug, Clone)]
pub struct OriginPolicy {
    pattern: Option<Regex>,
}

impl OriginPolicy {
    /// Build a policy from the configured pattern. Empty or whitespace-only
    /// patterns disable the check.
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        let trimmed = pattern.trim();
        if trimmed.is_empty() {
            return Ok(Self { pattern: None });
        }
        Ok(Self {
            pattern: Some(Regex::new(trimmed)?),
        })
    }

    /// Policy that admits every origin.
    pub fn allow_all() -> Self {
        Self { pattern: None }
    }

    /// Whether this policy admits every origin.
    pub fn is_open(&self) -> bool {
        self.pattern.is_none()
    }

    /// Check an optional `Origin` header. Once a pattern is configured,
    /// requests without the header are rejected.
    pub fn allows_header(&self, origin: Option<&str>) -> bool {
        match (&self.pattern, origin) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(_), Some(value)) => self.allows(value),
        }
    }

    /// Check an `Origin` header value. Requests without a parseable
    /// hostname are rejected once a pattern is configured.
    pub fn allows(&self, origin: &str) -> bool {
        let Some(pattern) = &self.pattern else {
            return true;
        };
        match origin_hostname(origin) {
            Some(hostname) => pattern.is_match(hostname),
            None => false,
        }
    }
}

/// Extract the hostname from an origin value like
/// `https://app.example.com:8443`.
fn origin_hostname(origin: &str) -> Option<&str> {
    let rest = origin.trim();
    let rest = match rest.find("://") {
        Some(idx) => &rest[idx + 3..],
        None => rest,
    };
    let authority = rest.split('/').next().unwrap_or(rest);
    let host = if let Some(bracketed) = authority.strip_prefix('[') {
        bracketed.split(']').next().unwrap_or(bracketed)
    } else {
        authority.split(':').next().unwrap_or(authority)
    };
    let host = host.trim();
    if host.is_empty() {
        None
    } else {
        Some(host)
    }
}
