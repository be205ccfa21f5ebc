//! API identifier derivation.
//!
//! Every request is bucketed under an identifier of the form
//! `"METHOD /path"`. Configured route patterns collapse families of paths
//! into one bucket (`"GET /users/{id}"`, `"POST /v1/chat/*"`); the first
//! matching pattern wins and its text becomes the identifier. Paths that
//! match nothing use their literal path, with the query string and trailing
//! slashes stripped.
//!
//! The identifier keys both the per-API rate window and the request log.

use crate::policy::{LimitRule, RateLimitPolicy};

/// Result of matching a request against the configured API patterns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiMatch {
    /// `"METHOD /path-or-pattern"`.
    pub identifier: String,
    /// Rate rule attached to this API, when one is configured.
    pub rule: Option<LimitRule>,
}

/// Normalizes a request path: strips the query string and trailing slashes;
/// an empty result becomes `/`.
#[must_use]
pub fn normalize_path(path: &str) -> &str {
    let path = path.split('?').next().unwrap_or(path);
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/"
    } else {
        trimmed
    }
}

/// Derives the API identifier and its rate rule for a request.
#[must_use]
pub fn resolve_api(method: &str, path: &str, policy: &RateLimitPolicy) -> ApiMatch {
    let method = method.to_ascii_uppercase();
    let path = normalize_path(path);

    for pattern in &policy.api_patterns {
        if pattern_matches(&pattern.pattern, &method, path) {
            // An exact entry in `apis` overrides the pattern's own rule.
            let rule = policy.apis.get(&pattern.pattern).copied().or(Some(pattern.rule));
            return ApiMatch { identifier: pattern.pattern.clone(), rule };
        }
    }

    let identifier = format!("{method} {path}");
    let rule = policy.apis.get(&identifier).copied();
    ApiMatch { identifier, rule }
}

/// Looks up the rate rule for an already-derived identifier.
///
/// Used when a parked request is re-evaluated: the identifier was fixed at
/// arrival, but the rule attached to it follows the current policy.
#[must_use]
pub fn rule_for_identifier(policy: &RateLimitPolicy, identifier: &str) -> Option<LimitRule> {
    policy.apis.get(identifier).copied().or_else(|| {
        policy
            .api_patterns
            .iter()
            .find(|p| p.pattern == identifier)
            .map(|p| p.rule)
    })
}

/// Matches a `"METHOD /seg/{param}/..."` pattern against a request.
///
/// `{param}` matches exactly one path segment; a trailing `*` matches one or
/// more remaining segments.
fn pattern_matches(pattern: &str, method: &str, path: &str) -> bool {
    let Some((pat_method, pat_path)) = pattern.split_once(' ') else {
        return false;
    };
    if !pat_method.eq_ignore_ascii_case(method) {
        return false;
    }

    let pat_path = normalize_path(pat_path);
    let mut pattern_segments = pat_path.split('/').filter(|s| !s.is_empty()).peekable();
    let mut path_segments = path.split('/').filter(|s| !s.is_empty()).peekable();

    loop {
        match (pattern_segments.next(), path_segments.peek()) {
            (Some("*"), Some(_)) => return pattern_segments.peek().is_none(),
            (Some("*"), None) => return false,
            (Some(seg), Some(&actual)) => {
                let is_param = seg.starts_with('{') && seg.ends_with('}');
                if !is_param && seg != actual {
                    return false;
                }
                path_segments.next();
            }
            (Some(_), None) => return false,
            (None, Some(_)) => return false,
            (None, None) => return true,
        }
    }
}
