//! Side-effecting helpers: session storage, the status log, configuration,
//! worker processes, time and signals.

pub mod clock;
pub mod config;
pub mod paths;
pub mod process;
pub mod shutdown;
pub mod status_log;
pub mod store;
pub mod worker;
