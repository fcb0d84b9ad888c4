//! registry-cache-operator: pull-through registry caches with node mirror configuration

pub mod agent_manifest;
pub mod bundle;
pub mod config;
pub mod controllers;
pub mod discovery;
pub mod health;
pub mod mirror;
pub mod quantity;
pub mod reconciler;
pub mod settings;
pub mod upstream;
pub mod workload;

#[cfg(test)]
mod test_utils;

pub use config::RegistryConfig;
pub use settings::OperatorSettings;
