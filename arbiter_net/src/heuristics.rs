//! Heuristics executor: external fitness probes.
//!
//! Each configured probe is a shell command; a run passes only when every
//! probe exits zero within the budget. Results feed the membership node
//! list (probes run against each new membership while the cast-vote timer
//! is paused) and the HeuristicsChange message (regular re-runs).

use std::process::Stdio;
use std::time::Duration;

use arbiter_proto::Heuristics;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::{HeuristicsMode, HeuristicsSettings};

/// Runs the configured probes.
#[derive(Debug, Clone)]
pub struct HeuristicsExecutor {
    settings: HeuristicsSettings,
}

impl HeuristicsExecutor {
    /// Executor over the given settings.
    pub fn new(settings: HeuristicsSettings) -> Self {
        HeuristicsExecutor { settings }
    }

    /// The settings in force.
    pub fn settings(&self) -> &HeuristicsSettings {
        &self.settings
    }

    /// Whether probes run at all.
    pub fn enabled(&self) -> bool {
        self.settings.mode != HeuristicsMode::Disabled
    }

    /// Whether regular re-runs are part of the mode.
    pub fn regular_runs(&self) -> bool {
        self.settings.mode == HeuristicsMode::Enabled
    }

    /// Run every probe with the membership-change budget.
    pub async fn run(&self) -> Heuristics {
        self.run_with_timeout(Duration::from_millis(self.settings.timeout as u64))
            .await
    }

    /// Run every probe with the after-connect budget.
    pub async fn run_sync(&self) -> Heuristics {
        self.run_with_timeout(Duration::from_millis(self.settings.sync_timeout as u64))
            .await
    }

    async fn run_with_timeout(&self, budget: Duration) -> Heuristics {
        if !self.enabled() {
            return Heuristics::Undefined;
        }

        for exec in &self.settings.execs {
            let mut command = Command::new("/bin/sh");
            command
                .arg("-c")
                .arg(&exec.command)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true);

            match tokio::time::timeout(budget, command.status()).await {
                Ok(Ok(status)) if status.success() => {
                    debug!(name = %exec.name, "heuristics probe passed");
                }
                Ok(Ok(status)) => {
                    warn!(name = %exec.name, %status, "heuristics probe failed");
                    return Heuristics::Fail;
                }
                Ok(Err(err)) => {
                    warn!(name = %exec.name, %err, "heuristics probe can't be spawned");
                    return Heuristics::Fail;
                }
                Err(_) => {
                    warn!(name = %exec.name, "heuristics probe timed out");
                    return Heuristics::Fail;
                }
            }
        }
        Heuristics::Pass
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeuristicsExec;

    fn settings(mode: HeuristicsMode, commands: &[&str]) -> HeuristicsSettings {
        HeuristicsSettings {
            mode,
            timeout: 2_000,
            sync_timeout: 2_000,
            interval: 30_000,
            execs: commands
                .iter()
                .enumerate()
                .map(|(index, command)| HeuristicsExec {
                    name: format!("probe{}", index),
                    command: (*command).to_string(),
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn disabled_mode_is_undefined() {
        let exec = HeuristicsExecutor::new(settings(HeuristicsMode::Disabled, &["false"]));
        assert_eq!(exec.run().await, Heuristics::Undefined);
    }

    #[tokio::test]
    async fn all_probes_passing_is_pass() {
        let exec = HeuristicsExecutor::new(settings(HeuristicsMode::Enabled, &["true", "true"]));
        assert_eq!(exec.run().await, Heuristics::Pass);
    }

    #[tokio::test]
    async fn any_probe_failing_is_fail() {
        let exec = HeuristicsExecutor::new(settings(HeuristicsMode::Enabled, &["true", "false"]));
        assert_eq!(exec.run().await, Heuristics::Fail);
    }

    #[tokio::test]
    async fn timeout_is_fail() {
        let mut settings = settings(HeuristicsMode::Sync, &["sleep 10"]);
        settings.timeout = 50;
        let exec = HeuristicsExecutor::new(settings);
        assert_eq!(exec.run().await, Heuristics::Fail);
    }
}
