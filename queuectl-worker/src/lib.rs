//! Worker side of queuectl: the claim/execute/record loop and the
//! supervisor that runs N of them until told to stop.

pub mod config;
pub mod error;
pub mod supervisor;
pub mod worker;
