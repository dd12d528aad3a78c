//! Capability grants and checks.
//!
//! Every privileged host-function call names a capability — a dotted token
//! such as `kv.read` or `events.emit.location`. Plugins are granted glob
//! patterns over these tokens when they load:
//!
//! - `*` matches exactly one dot-delimited segment
//! - `**` matches zero or more trailing segments
//! - anything else matches literally
//!
//! The default policy is deny: a plugin with no binding, or an empty grant
//! list, is denied everything. Grants have no precedence order — any
//! matching pattern allows.
//!
//! One enforcer instance is shared process-wide (capability state is a
//! cross-cutting concern and plugin names are unique within a process), but
//! the type is an ordinary constructable value so tests can build their own.

use std::collections::HashMap;

use parking_lot::RwLock;
use thiserror::Error;

/// Errors from grant management.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapabilityError {
    /// The plugin name was empty.
    #[error("plugin name must not be empty")]
    EmptyPluginName,

    /// A grant pattern was empty or syntactically invalid.
    #[error("invalid capability pattern '{pattern}': {reason}")]
    BadPattern {
        /// The rejected pattern.
        pattern: String,
        /// What was wrong.
        reason: &'static str,
    },
}

/// Result type for grant management.
pub type CapabilityResult<T> = Result<T, CapabilityError>;

// ============================================================================
// Pattern matching
// ============================================================================

/// Matches `pattern` against `value` split on `separator`: `*` is one
/// segment, a final `**` is any (possibly empty) suffix, anything else is
/// literal. Shared with stream-pattern matching, which uses `:` segments.
pub(crate) fn segment_glob(pattern: &str, value: &str, separator: char) -> bool {
    let mut pat = pattern.split(separator);
    let mut cap = value.split(separator).peekable();

    for p in pat.by_ref() {
        if p == "**" {
            // Trailing wildcard swallows the rest, including nothing.
            return true;
        }
        match cap.next() {
            Some(c) if p == "*" || p == c => continue,
            _ => return false,
        }
    }
    cap.peek().is_none()
}

/// Validates pattern syntax: non-empty, non-empty segments, `**` only as the
/// final segment, `*`/`**` never mixed into a literal segment.
fn validate_pattern(pattern: &str) -> CapabilityResult<()> {
    if pattern.is_empty() {
        return Err(CapabilityError::BadPattern {
            pattern: pattern.to_string(),
            reason: "empty pattern",
        });
    }
    let segments: Vec<&str> = pattern.split('.').collect();
    for (i, segment) in segments.iter().enumerate() {
        if segment.is_empty() {
            return Err(CapabilityError::BadPattern {
                pattern: pattern.to_string(),
                reason: "empty segment",
            });
        }
        if *segment == "**" && i != segments.len() - 1 {
            return Err(CapabilityError::BadPattern {
                pattern: pattern.to_string(),
                reason: "'**' is only valid as the final segment",
            });
        }
        if segment.contains('*') && *segment != "*" && *segment != "**" {
            return Err(CapabilityError::BadPattern {
                pattern: pattern.to_string(),
                reason: "'*' must stand alone in its segment",
            });
        }
    }
    Ok(())
}

// ============================================================================
// Enforcer
// ============================================================================

/// Stores per-plugin grant lists and answers allow/deny checks.
#[derive(Debug, Default)]
pub struct CapabilityEnforcer {
    grants: RwLock<HashMap<String, Vec<String>>>,
}

impl CapabilityEnforcer {
    /// Creates an empty enforcer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the grant set for `plugin`.
    ///
    /// Rejects an empty plugin name and any empty or malformed pattern; on
    /// rejection the previous grants are left untouched.
    pub fn set_grants(
        &self,
        plugin: &str,
        patterns: impl IntoIterator<Item = impl Into<String>>,
    ) -> CapabilityResult<()> {
        if plugin.is_empty() {
            return Err(CapabilityError::EmptyPluginName);
        }
        let patterns: Vec<String> = patterns.into_iter().map(Into::into).collect();
        for pattern in &patterns {
            validate_pattern(pattern)?;
        }
        self.grants.write().insert(plugin.to_string(), patterns);
        Ok(())
    }

    /// Removes the binding for `plugin`. Removing a missing binding is
    /// silent.
    pub fn remove_grants(&self, plugin: &str) -> CapabilityResult<()> {
        if plugin.is_empty() {
            return Err(CapabilityError::EmptyPluginName);
        }
        self.grants.write().remove(plugin);
        Ok(())
    }

    /// Returns whether `plugin` may exercise `capability`.
    pub fn check(&self, plugin: &str, capability: &str) -> bool {
        let grants = self.grants.read();
        match grants.get(plugin) {
            Some(patterns) => patterns.iter().any(|p| segment_glob(p, capability, '.')),
            None => false,
        }
    }

    /// Drops every binding.
    pub fn reset(&self) {
        self.grants.write().clear();
    }
}
