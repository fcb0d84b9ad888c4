//! Upstream parsing and cache identity derivation
//!
//! A user declares an upstream as `host`, `host:port` or a URL such as
//! `https://host:port`. [`Upstream::parse`] normalizes it and
//! [`CacheIdentity::derive`] turns it into the name shared by every object
//! that belongs to the cache.
//!
//! The name has the form `registry-<normalized host>-<digest>`. The digest is
//! taken over the canonical `host[:port]`, so hosts that normalize to the same
//! readable part (`a-b.io` and `a.b.io`) still get different names.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use url::Url;

/// Prefix of every cache name
pub const NAME_PREFIX: &str = "registry-";

/// Upper bound for a cache name.
///
/// StatefulSet pods add `-<ordinal>` and the controller-revision-hash label
/// adds another suffix, both must stay within the 63 character label limit.
pub const MAX_NAME_LEN: usize = 52;

/// Hex characters of the digest suffix
const DIGEST_SUFFIX_LEN: usize = 8;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("upstream must be provided; desired format: host[:port]")]
    Empty,
    #[error("upstream {0:?} has no host component")]
    MissingHost(String),
    #[error("upstream {upstream:?} is not a valid host[:port] or URL: {reason}")]
    Malformed { upstream: String, reason: String },
    #[error("upstream {upstream:?} uses unsupported scheme {scheme:?}, expected http or https")]
    UnsupportedScheme { upstream: String, scheme: String },
    #[error("upstream {0:?} must not contain credentials, a path, a query or a fragment")]
    UnexpectedComponent(String),
}

/// Protocol used by the cache to reach the upstream
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// A parsed, normalized upstream registry
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Upstream {
    scheme: Scheme,
    host: String,
    port: Option<u16>,
}

impl Upstream {
    /// Parse a declared upstream.
    ///
    /// A missing scheme means `https`. Hosts are lowercased and a port equal
    /// to the scheme default is dropped.
    pub fn parse(raw: &str) -> Result<Self, IdentityError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(IdentityError::Empty);
        }

        let candidate = if trimmed.contains("://") {
            trimmed.to_string()
        } else {
            format!("https://{trimmed}")
        };

        let url = Url::parse(&candidate).map_err(|e| match e {
            url::ParseError::EmptyHost => IdentityError::MissingHost(trimmed.to_string()),
            other => IdentityError::Malformed {
                upstream: trimmed.to_string(),
                reason: other.to_string(),
            },
        })?;

        let scheme = match url.scheme() {
            "https" => Scheme::Https,
            "http" => Scheme::Http,
            other => {
                return Err(IdentityError::UnsupportedScheme {
                    upstream: trimmed.to_string(),
                    scheme: other.to_string(),
                })
            }
        };

        if !url.username().is_empty()
            || url.password().is_some()
            || !(url.path().is_empty() || url.path() == "/")
            || url.query().is_some()
            || url.fragment().is_some()
        {
            return Err(IdentityError::UnexpectedComponent(trimmed.to_string()));
        }

        let host = match url.host_str() {
            Some(h) if !h.is_empty() => h.to_ascii_lowercase(),
            _ => return Err(IdentityError::MissingHost(trimmed.to_string())),
        };

        Ok(Self {
            scheme,
            host,
            port: url.port(),
        })
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// `host[:port]`, the key containerd matches image references against
    pub fn mirror_key(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{}", self.host, port),
            None => self.host.clone(),
        }
    }

    /// URL the cache server proxies to
    pub fn remote_url(&self) -> String {
        format!("{}://{}", self.scheme.as_str(), self.mirror_key())
    }

    pub fn identity(&self) -> CacheIdentity {
        CacheIdentity::derive(self)
    }
}

impl FromStr for Upstream {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.mirror_key())
    }
}

/// Name of a cache, the sole key correlating an upstream to its objects
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheIdentity(String);

impl CacheIdentity {
    /// Derive the cache name for an upstream. Pure and deterministic.
    pub fn derive(upstream: &Upstream) -> Self {
        let key = upstream.mirror_key();

        let mut readable = String::with_capacity(key.len());
        for c in key.chars() {
            if c.is_ascii_alphanumeric() {
                readable.push(c.to_ascii_lowercase());
            } else if !readable.ends_with('-') {
                readable.push('-');
            }
        }

        let budget = MAX_NAME_LEN - NAME_PREFIX.len() - 1 - DIGEST_SUFFIX_LEN;
        readable.truncate(budget);
        let readable = readable.trim_matches('-');

        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        let digest = hex::encode(hasher.finalize());

        Self(format!(
            "{NAME_PREFIX}{readable}-{}",
            &digest[..DIGEST_SUFFIX_LEN]
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheIdentity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
