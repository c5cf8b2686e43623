//! Logging macros that set target to "db_proxy" for all log calls.
//!
//! Without an explicit target, tracing uses the full module path
//! (e.g. "db_proxy::mitm"), which makes filtering in deployments that
//! aggregate logs by component name noisier than it needs to be. These
//! macros ensure all logs from this crate use a single "db_proxy" target.

macro_rules! trace {
    ($($arg:tt)*) => { ::tracing::trace!(target: "db_proxy", $($arg)*) };
}

macro_rules! debug {
    ($($arg:tt)*) => { ::tracing::debug!(target: "db_proxy", $($arg)*) };
}

macro_rules! info {
    ($($arg:tt)*) => { ::tracing::info!(target: "db_proxy", $($arg)*) };
}

macro_rules! warn {
    ($($arg:tt)*) => { ::tracing::warn!(target: "db_proxy", $($arg)*) };
}

macro_rules! error {
    ($($arg:tt)*) => { ::tracing::error!(target: "db_proxy", $($arg)*) };
}
