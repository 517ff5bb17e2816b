//! PostgreSQL frontend/backend protocol v3
//!
//! Only the subset the broker needs to authenticate on a client's behalf:
//! startup packets, the SSL probe, authentication requests and error
//! responses. Everything after authentication is relayed as opaque bytes.
//!
//! Reference: <https://www.postgresql.org/docs/current/protocol.html>

pub mod auth;
pub mod codec;
pub mod constants;
pub mod messages;

pub use auth::{compute_md5_password, ScramSha256, MAX_SCRAM_ITERATIONS};
pub use codec::*;
pub use constants::*;
pub use messages::*;
