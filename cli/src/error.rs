use anyhow::{anyhow, Error};

use queuectl_common::store::StoreError;
use queuectl_worker::error::WorkerError;

/// An error on its way out to the terminal, tagged with the exit code the
/// command surface promises: 2 for invalid input, 1 for operational failure.
#[derive(Debug)]
pub struct CliError {
    pub inner: Error,
    pub exit_code: u8,
}

impl CliError {
    /// Rejected before any store mutation.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self {
            inner: anyhow!("invalid input: {}", message.into()),
            exit_code: 2,
        }
    }
}

impl From<Error> for CliError {
    fn from(inner: Error) -> Self {
        Self {
            inner,
            exit_code: 1,
        }
    }
}

impl From<StoreError> for CliError {
    fn from(error: StoreError) -> Self {
        Error::from(error).into()
    }
}

impl From<WorkerError> for CliError {
    fn from(error: WorkerError) -> Self {
        Error::from(error).into()
    }
}
