//! Per-node convergence loop
//!
//! Each cycle compares the fragment delivered to the node with the copy the
//! runtime imports, replaces the copy when they differ and restarts the
//! runtime. Failures end the cycle and the next tick starts over, so the
//! loop itself never stops.

use std::fs;
use std::io;
use std::path::PathBuf;

use thiserror::Error;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument};

use crate::config::AgentConfig;
use crate::fragment::{read_applied, write_atomic, WriteError};
use crate::imports::{ensure_imports, ImportsError};
use crate::runtime::{RestartError, RuntimeRestarter};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("interval must be at least one second")]
    ZeroInterval,

    #[error("input path {0} has no usable file name")]
    InputName(PathBuf),

    #[error("input file {0} does not exist")]
    MissingInput(PathBuf),

    #[error("failed to read desired fragment {path}")]
    ReadDesired {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to read applied fragment {path}")]
    ReadApplied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Imports(#[from] ImportsError),

    #[error(transparent)]
    Write(#[from] WriteError),

    #[error(transparent)]
    Restart(#[from] RestartError),
}

/// What one cycle did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Desired and applied content matched, nothing was pending
    Unchanged,
    /// The fragment was replaced and the runtime restarted
    Applied,
    /// Content already matched, a restart left over from an earlier change ran
    Restarted,
}

pub struct NodeAgent<R: RuntimeRestarter> {
    config: AgentConfig,
    restarter: R,
    fragment_path: PathBuf,
    restart_pending: bool,
}

impl<R: RuntimeRestarter> NodeAgent<R> {
    pub fn new(config: AgentConfig, restarter: R) -> Self {
        let fragment_path = config.fragment_path();
        Self {
            config,
            restarter,
            fragment_path,
            restart_pending: false,
        }
    }

    /// A change was written but the runtime has not picked it up yet
    pub fn restart_pending(&self) -> bool {
        self.restart_pending
    }

    /// Checks that must hold before the first cycle
    pub fn startup(&mut self) -> Result<(), AgentError> {
        let input = self.config.input().to_path_buf();
        if !input.exists() {
            return Err(AgentError::MissingInput(input));
        }

        self.check_imports()?;

        info!(
            input = %input.display(),
            fragment = %self.fragment_path.display(),
            service = %self.config.runtime_service,
            interval_secs = self.config.interval.as_secs(),
            "Node agent ready"
        );
        Ok(())
    }

    /// One read, compare, apply pass
    #[instrument(skip(self), fields(fragment = %self.fragment_path.display()))]
    pub async fn run_cycle(&mut self) -> Result<CycleOutcome, AgentError> {
        self.check_imports()?;

        let input = self.config.input();
        let desired = fs::read(input).map_err(|source| AgentError::ReadDesired {
            path: input.to_path_buf(),
            source,
        })?;

        let applied = read_applied(&self.fragment_path)
            .map_err(|source| AgentError::ReadApplied {
                path: self.fragment_path.clone(),
                source,
            })?
            .unwrap_or_default();

        let replaced = desired != applied;
        if replaced {
            write_atomic(&self.fragment_path, &desired)?;
            self.restart_pending = true;
            info!(
                bytes = desired.len(),
                previous_bytes = applied.len(),
                "Replaced runtime fragment"
            );
        }

        if !self.restart_pending {
            debug!("Runtime fragment in sync");
            return Ok(CycleOutcome::Unchanged);
        }

        self.restarter.restart().await?;
        self.restart_pending = false;

        if replaced {
            info!("Applied runtime fragment");
            Ok(CycleOutcome::Applied)
        } else {
            info!("Completed pending runtime restart");
            Ok(CycleOutcome::Restarted)
        }
    }

    /// Run cycles on a fixed interval until the process is stopped
    pub async fn run(&mut self) {
        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            interval_secs = self.config.interval.as_secs(),
            "Starting convergence loop"
        );

        loop {
            ticker.tick().await;

            if let Err(e) = self.run_cycle().await {
                error!(
                    error = %e,
                    restart_pending = self.restart_pending,
                    "Convergence cycle failed, retrying on next tick"
                );
            }
        }
    }

    fn check_imports(&mut self) -> Result<(), AgentError> {
        let change = ensure_imports(
            &self.config.runtime_config_on_host(),
            &self.config.imports_glob(),
        )?;
        if change.changed() {
            self.restart_pending = true;
        }
        Ok(())
    }
}
