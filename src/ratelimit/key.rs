//! Limit key generation and handling.

use std::fmt;

/// Whether a limit applies to a client address or to an API token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Per client IP address
    Ip,
    /// Per API credential
    Token,
}

impl Scope {
    /// The canonical upper-case name of this scope.
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Ip => "IP",
            Scope::Token => "TOKEN",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A key that uniquely identifies the rate limit state of one caller.
///
/// The scope is part of the key, so an IP and a token with the same text
/// never share state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LimitKey {
    /// The scope this key belongs to
    pub scope: Scope,
    /// The caller identity (IP address or token)
    pub identity: String,
}

impl LimitKey {
    /// Create a new limit key.
    pub fn new(scope: Scope, identity: impl Into<String>) -> Self {
        Self {
            scope,
            identity: identity.into(),
        }
    }

    /// Create a key for a client address.
    pub fn ip(identity: impl Into<String>) -> Self {
        Self::new(Scope::Ip, identity)
    }

    /// Create a key for an API token.
    pub fn token(identity: impl Into<String>) -> Self {
        Self::new(Scope::Token, identity)
    }

    /// Convert the key to a flat string, used for external storage keys.
    pub fn to_string_key(&self) -> String {
        format!("{}:{}", self.scope, self.identity)
    }
}

impl fmt::Display for LimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}
