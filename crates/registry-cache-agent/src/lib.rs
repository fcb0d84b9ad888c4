//! Node agent keeping containerd's registry mirror fragment in sync with the
//! fragment rendered by the operator.

pub mod agent;
pub mod config;
pub mod fragment;
pub mod imports;
pub mod runtime;

pub use agent::{AgentError, CycleOutcome, NodeAgent};
pub use config::{AgentCli, AgentConfig, LogFormat};
