//! Tether Runtime - orchestration layer for Tether.
//!
//! This crate provides:
//! - Layered configuration (`TetherConfig`, `ConfigLoader`)
//! - Logging configuration (`LoggingBuilder`, `init_from_config`)
//! - Runtime orchestration (`TetherRuntime`): context-scoped dispatch,
//!   observer correlation and graceful shutdown
//!
//! ```ignore
//! use tether_runtime::TetherRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = TetherRuntime::new()?;
//!     // hand `runtime` to the platform event loop ...
//!     runtime.run().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod runtime;

pub use config::{ConfigError, ConfigLoader, ConfigResult, TetherConfig};
pub use error::{RuntimeError, RuntimeResult};
pub use logging::{LoggingBuilder, SpanEvents};
pub use runtime::{RuntimeBuilder, RuntimeStats, TetherRuntime};

// Re-export tracing for use by other crates
pub use tracing;
pub use tracing_subscriber;

/// Prelude module for convenient imports.
///
/// This provides all the commonly used logging macros:
/// - `trace!`, `debug!`, `info!`, `warn!`, `error!`
/// - `span`, `event`
/// - `instrument` attribute
/// - `Level` for span creation
pub mod prelude {
    pub use tracing::{Level, debug, error, event, info, instrument, span, trace, warn};
}
