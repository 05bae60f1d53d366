//! Terminal command execution for agent-driven shells: compound-command
//! parsing, pooled sessions with task affinity, completion detection for
//! hosts without execution events, and supervision of long-running services.

pub mod config;
pub mod context;
pub mod error;
pub mod server;
pub mod services;
pub mod terminal;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::Config;
pub use context::ShellContext;
pub use error::AppError;
