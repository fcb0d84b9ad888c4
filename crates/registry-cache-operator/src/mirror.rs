//! Mirror directive and its containerd rendering

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::net::SocketAddr;

use registry_cache_common::content_digest;
use thiserror::Error;

use crate::discovery::DiscoveredEndpoint;
use crate::upstream::UpstreamSpec;

/// First line of every rendered fragment
pub const ARTIFACT_HEADER: &str = "# managed by registry-cache-operator, do not edit";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DirectiveError {
    #[error("no endpoint discovered for caches: {}", .missing.join(", "))]
    Incomplete { missing: Vec<String> },
    #[error("upstream {0} is configured more than once")]
    Duplicate(String),
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("mirror key {0:?} cannot be rendered")]
    InvalidKey(String),
    #[error("failed to format mirror configuration: {0}")]
    Format(#[from] std::fmt::Error),
}

/// Complete mapping from upstream (host[:port]) to the cache serving it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MirrorDirective {
    mirrors: BTreeMap<String, SocketAddr>,
}

impl MirrorDirective {
    /// Pair every configured upstream with its discovered endpoint.
    ///
    /// Fails unless every upstream has an endpoint.
    pub fn assemble(
        upstreams: &[UpstreamSpec],
        endpoints: &[DiscoveredEndpoint],
    ) -> Result<Self, DirectiveError> {
        let by_identity: BTreeMap<&str, SocketAddr> = endpoints
            .iter()
            .map(|e| (e.identity.as_str(), e.address))
            .collect();

        let mut directive = Self::default();
        let mut missing = Vec::new();
        for spec in upstreams {
            match by_identity.get(spec.identity.as_str()) {
                Some(address) => directive.insert(spec.upstream.mirror_key(), *address)?,
                None => missing.push(spec.identity.to_string()),
            }
        }

        if !missing.is_empty() {
            return Err(DirectiveError::Incomplete { missing });
        }
        Ok(directive)
    }

    pub fn insert(&mut self, mirror_key: String, address: SocketAddr) -> Result<(), DirectiveError> {
        if self.mirrors.contains_key(&mirror_key) {
            return Err(DirectiveError::Duplicate(mirror_key));
        }
        self.mirrors.insert(mirror_key, address);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.mirrors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mirrors.is_empty()
    }

    /// Mirrors ordered by key
    pub fn iter(&self) -> impl Iterator<Item = (&str, &SocketAddr)> {
        self.mirrors.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Render as a containerd configuration fragment.
    ///
    /// Stanzas are ordered by mirror key, so equal directives render to equal
    /// bytes regardless of how they were built.
    pub fn render(&self) -> Result<RenderedArtifact, RenderError> {
        let mut content = String::new();
        writeln!(content, "{ARTIFACT_HEADER}")?;
        for (key, address) in &self.mirrors {
            if key.is_empty() || key.chars().any(|c| c == '"' || c == '\\' || c.is_control()) {
                return Err(RenderError::InvalidKey(key.clone()));
            }
            writeln!(
                content,
                "[plugins.\"io.containerd.grpc.v1.cri\".registry.mirrors.\"{key}\"]"
            )?;
            writeln!(content, "  endpoint = [\"http://{address}\"]")?;
        }
        Ok(RenderedArtifact { content })
    }
}

/// Rendered fragment delivered to the node agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedArtifact {
    content: String,
}

impl RenderedArtifact {
    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn digest(&self) -> String {
        content_digest(self.content.as_bytes())
    }
}
