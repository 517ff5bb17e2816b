//! Built-in TCP connectors

pub mod pg;
