//! Flowline runtime: tokio-backed flow manager, configuration and tracing setup.

pub mod config;
pub mod error;
pub mod runtime;
pub mod telemetry;

pub mod prelude {
    pub use crate::config::RuntimeConfig;
    pub use crate::runtime::Runtime;
}

pub use config::RuntimeConfig;
pub use error::RuntimeError;
pub use runtime::Runtime;
pub use telemetry::{init_stdout_tracing, init_tracing};
