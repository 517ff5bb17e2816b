//! Logging macros that set target to "credbroker" for all log calls.
//!
//! Without an explicit target, tracing uses the full module path
//! (e.g. "credbroker::connectors::pg::handshake"), which makes per-crate
//! filtering in `RUST_LOG` needlessly verbose. These macros keep every
//! log line from this crate under a single "credbroker" target.

macro_rules! trace {
    ($($arg:tt)*) => { ::tracing::trace!(target: "credbroker", $($arg)*) };
}

macro_rules! debug {
    ($($arg:tt)*) => { ::tracing::debug!(target: "credbroker", $($arg)*) };
}

macro_rules! info {
    ($($arg:tt)*) => { ::tracing::info!(target: "credbroker", $($arg)*) };
}

macro_rules! warn {
    ($($arg:tt)*) => { ::tracing::warn!(target: "credbroker", $($arg)*) };
}

macro_rules! error {
    ($($arg:tt)*) => { ::tracing::error!(target: "credbroker", $($arg)*) };
}
