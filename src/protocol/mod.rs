//! Wire protocols spoken by the built-in connectors.

pub mod postgres;
