//! Validated per-cache input
//!
//! [`resolve_upstreams`] turns the declared caches into [`UpstreamSpec`]s,
//! applying defaults and rejecting anything that would produce an invalid or
//! ambiguous workload. It runs on every reconcile; nothing is persisted.

use std::collections::HashMap;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use registry_cache_common::{CacheIdentity, IdentityError, Upstream};
use thiserror::Error;

use crate::config::RegistryCache;
use crate::quantity::{parse_storage_quantity, QuantityError};
use crate::settings::OperatorSettings;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("caches[{index}].upstream: {source}")]
    Upstream {
        index: usize,
        #[source]
        source: IdentityError,
    },
    #[error("caches[{index}].size: {source}")]
    Size {
        index: usize,
        #[source]
        source: QuantityError,
    },
    #[error("caches[{index}].storageClassName must not be empty")]
    EmptyStorageClass { index: usize },
    #[error("caches[{index}].upstream {upstream:?} duplicates caches[{first}] (cache {name})")]
    Duplicate {
        index: usize,
        first: usize,
        upstream: String,
        name: String,
    },
}

/// One configured cache, with defaults applied
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamSpec {
    pub upstream: Upstream,
    pub identity: CacheIdentity,
    pub volume_size: Quantity,
    pub garbage_collection_enabled: bool,
    pub storage_class_name: Option<String>,
}

impl UpstreamSpec {
    pub fn new(
        upstream: Upstream,
        volume_size: Quantity,
        garbage_collection_enabled: bool,
        storage_class_name: Option<String>,
    ) -> Self {
        let identity = upstream.identity();
        Self {
            upstream,
            identity,
            volume_size,
            garbage_collection_enabled,
            storage_class_name,
        }
    }
}

/// Every problem found in the declared caches, in declared order
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{}", join(.0))]
pub struct ConfigErrors(Vec<ConfigError>);

impl ConfigErrors {
    pub fn errors(&self) -> &[ConfigError] {
        &self.0
    }
}

impl From<ConfigError> for ConfigErrors {
    fn from(error: ConfigError) -> Self {
        Self(vec![error])
    }
}

fn join(errors: &[ConfigError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Validate the declared caches and apply defaults.
///
/// The order of the declared list is kept. All caches are checked before
/// failing, so the error lists every problem at once.
pub fn resolve_upstreams(
    caches: &[RegistryCache],
    settings: &OperatorSettings,
) -> Result<Vec<UpstreamSpec>, ConfigErrors> {
    let mut seen: HashMap<CacheIdentity, usize> = HashMap::new();
    let mut specs = Vec::with_capacity(caches.len());
    let mut errors = Vec::new();

    for (index, cache) in caches.iter().enumerate() {
        let found = errors.len();

        let upstream = Upstream::parse(&cache.upstream)
            .map_err(|source| errors.push(ConfigError::Upstream { index, source }))
            .ok();

        let volume_size = match cache.size.as_deref() {
            Some(raw) => parse_storage_quantity(raw)
                .map_err(|source| errors.push(ConfigError::Size { index, source }))
                .ok(),
            None => Some(settings.default_cache_size.clone()),
        };

        let storage_class_name = match cache.storage_class_name.as_deref() {
            Some(sc) if sc.trim().is_empty() => {
                errors.push(ConfigError::EmptyStorageClass { index });
                None
            }
            Some(sc) => Some(sc.trim().to_string()),
            None => None,
        };

        let (Some(upstream), Some(volume_size)) = (upstream, volume_size) else {
            continue;
        };
        if errors.len() > found {
            continue;
        }

        let spec = UpstreamSpec::new(
            upstream,
            volume_size,
            cache.garbage_collection_enabled.unwrap_or(true),
            storage_class_name,
        );

        if let Some(&first) = seen.get(&spec.identity) {
            errors.push(ConfigError::Duplicate {
                index,
                first,
                upstream: spec.upstream.mirror_key(),
                name: spec.identity.to_string(),
            });
            continue;
        }
        seen.insert(spec.identity.clone(), index);
        specs.push(spec);
    }

    if errors.is_empty() {
        Ok(specs)
    } else {
        Err(ConfigErrors(errors))
    }
}
