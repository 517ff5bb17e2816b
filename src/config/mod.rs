//! Configuration module for credbroker
//!
//! One broker process serves any number of services, each with its own
//! listener, connector and credentials:
//!
//! ```yaml
//! version: "2"
//! services:
//!   pg-db:
//!     connector: pg
//!     listenOn: tcp://127.0.0.1:15432
//!     credentials:
//!       host: db.internal
//!       port: 5432
//!       username: app
//!       password:
//!         from: env
//!         get: PG_PASSWORD
//!       sslmode: verify-full
//! ```
//!
//! Literal credential values are shorthand for `{ from: literal, get: <value> }`.

mod loader;
mod types;

pub use loader::{apply_env_overrides, load_config, load_config_from_str};
pub use types::*;
