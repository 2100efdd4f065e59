//! Endpoint allow-list enforcement.
//!
//! A service stores its endpoint as a regular expression. Every resolved
//! query URL must match it in full before any request leaves the process:
//! the pattern is anchored at both ends, so `https://phl\.carto\.com/.+`
//! does not admit `https://evil.example/?https://phl.carto.com/x`.

use regex::Regex;

use digest_common::error::DigestError;

#[derive(Debug, Clone)]
pub struct EndpointPattern {
    raw: String,
    regex: Regex,
}

impl EndpointPattern {
    /// Compile a stored endpoint pattern.
    ///
    /// Patterns written for JavaScript often escape `/` as `\/`; those
    /// escapes are accepted and treated as a literal slash.
    pub fn compile(raw: &str) -> Result<Self, regex::Error> {
        let normalized = raw.trim().replace("\\/", "/");
        let regex = Regex::new(&format!("^(?:{})$", normalized))?;
        Ok(Self {
            raw: raw.to_string(),
            regex,
        })
    }

    pub fn matches(&self, url: &str) -> bool {
        self.regex.is_match(url)
    }

    /// Fail with `EndpointViolation` unless `url` fully matches.
    pub fn ensure_allowed(&self, url: &str) -> Result<(), DigestError> {
        if self.matches(url) {
            Ok(())
        } else {
            Err(DigestError::EndpointViolation {
                url: url.to_string(),
                pattern: self.raw.clone(),
            })
        }
    }
}

/// Compile `pattern` and check `url` against it in one step.
///
/// An invalid pattern allows nothing and is reported as a violation.
pub fn check(pattern: &str, url: &str) -> Result<(), DigestError> {
    match EndpointPattern::compile(pattern) {
        Ok(compiled) => compiled.ensure_allowed(url),
        Err(e) => {
            tracing::error!(
                pattern = %pattern,
                error = %e,
                "Service endpoint pattern does not compile"
            );
            Err(DigestError::EndpointViolation {
                url: url.to_string(),
                pattern: format!("{} (invalid pattern: {})", pattern, e),
            })
        }
    }
}
