//! Built-in secret providers.
//!
//! - `literal` - the lookup key is the value itself
//! - `env` - environment variables
//! - `file` - file contents, the lookup key is a path

mod env;
mod file;
mod literal;

pub use env::EnvProvider;
pub use file::FileProvider;
pub use literal::LiteralProvider;
