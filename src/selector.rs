//! FQDN selectors and the matchers they compile to.
//!
//! All matching happens against the lower-case, dot-terminated form of a
//! domain name (`Cilium.IO` becomes `cilium.io.`).

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::FqdnError;

/// Characters allowed in a DNS label by selector validation.
const DNS_CHARS: &str = "[-a-zA-Z0-9_]";

/// Normalize a domain name to its lower-case, fully-qualified form.
pub fn to_fqdn(name: &str) -> String {
    let mut fqdn = name.trim().to_ascii_lowercase();
    if !fqdn.ends_with('.') {
        fqdn.push('.');
    }
    fqdn
}

/// A policy-layer reference to one or more domain names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FqdnSelector {
    /// Matches exactly one fully-qualified name.
    MatchName(String),
    /// Matches names against a glob where `*` spans any DNS characters,
    /// dots included.
    MatchPattern(String),
}

impl FqdnSelector {
    /// Exact-name selector.
    pub fn name(name: impl Into<String>) -> Self {
        Self::MatchName(name.into())
    }

    /// Pattern selector.
    pub fn pattern(pattern: impl Into<String>) -> Self {
        Self::MatchPattern(pattern.into())
    }

    /// Validate the selector and compile it into a matcher.
    pub fn compile(&self) -> Result<SelectorMatcher, FqdnError> {
        match self {
            Self::MatchName(name) => {
                validate(self, name, false)?;
                Ok(SelectorMatcher::Exact(to_fqdn(name)))
            }
            Self::MatchPattern(pattern) => {
                validate(self, pattern, true)?;
                let pattern = to_fqdn(pattern);
                let source = if pattern == "*." {
                    format!("^({DNS_CHARS}+[.])+$")
                } else {
                    let body = pattern
                        .split('*')
                        .map(regex::escape)
                        .collect::<Vec<_>>()
                        .join("[-a-zA-Z0-9_.]*");
                    format!("^{body}$")
                };
                let regex = Regex::new(&source).map_err(|e| FqdnError::InvalidSelector {
                    selector: self.to_string(),
                    reason: e.to_string(),
                })?;
                Ok(SelectorMatcher::Pattern(regex))
            }
        }
    }
}

impl fmt::Display for FqdnSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MatchName(name) => write!(f, "MatchName: {name}"),
            Self::MatchPattern(pattern) => write!(f, "MatchPattern: {pattern}"),
        }
    }
}

fn validate(selector: &FqdnSelector, value: &str, allow_wildcard: bool) -> Result<(), FqdnError> {
    let reject = |reason: &str| FqdnError::InvalidSelector {
        selector: selector.to_string(),
        reason: reason.to_string(),
    };

    let trimmed = value.trim();
    let body = trimmed.strip_suffix('.').unwrap_or(trimmed);
    if body.is_empty() {
        return Err(reject("empty name"));
    }
    if body.split('.').any(str::is_empty) {
        return Err(reject("empty label"));
    }

    let valid = body.chars().all(|c| {
        c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' || (allow_wildcard && c == '*')
    });
    if !valid {
        return Err(reject(if allow_wildcard {
            "only DNS characters and '*' are allowed"
        } else {
            "only DNS characters are allowed"
        }));
    }

    Ok(())
}

/// Compiled form of an [`FqdnSelector`].
#[derive(Debug, Clone)]
pub enum SelectorMatcher {
    /// Fully-qualified name compared for equality.
    Exact(String),
    /// Anchored regular expression.
    Pattern(Regex),
}

impl SelectorMatcher {
    /// Check a name that is already in [`to_fqdn`] form.
    pub fn matches(&self, fqdn: &str) -> bool {
        match self {
            Self::Exact(name) => name == fqdn,
            Self::Pattern(regex) => regex.is_match(fqdn),
        }
    }
}
