use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

/// Worker tunables, read from the environment.
#[derive(Envconfig, Clone)]
pub struct WorkerConfig {
    /// How long to sleep when a poll finds no eligible job.
    #[envconfig(from = "QUEUECTL_IDLE_INTERVAL_MS", default = "500")]
    pub idle_interval: EnvMsDuration,

    /// Pause between finishing one job and polling for the next.
    #[envconfig(from = "QUEUECTL_INTER_JOB_INTERVAL_MS", default = "100")]
    pub inter_job_interval: EnvMsDuration,

    #[envconfig(from = "QUEUECTL_HEARTBEAT_INTERVAL_MS", default = "2000")]
    pub heartbeat_interval: EnvMsDuration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            idle_interval: EnvMsDuration(time::Duration::from_millis(500)),
            inter_job_interval: EnvMsDuration(time::Duration::from_millis(100)),
            heartbeat_interval: EnvMsDuration(time::Duration::from_millis(2000)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}
