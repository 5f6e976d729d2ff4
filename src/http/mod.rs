//! HTTP listener management with TLS support.
//!
//! - [`group`]: atomic start and coordinated shutdown of several listeners
//! - [`shutdown`]: the shared cancellation signal, termination and reload signals
//! - [`static_files`]: the static file service at the end of the request pipeline

pub mod group;
pub mod shutdown;
pub mod static_files;

pub use group::{Group, GroupBuilder, GroupError, GroupState, ServerSpec};
pub use shutdown::Shutdown;
