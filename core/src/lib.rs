//! Coordination engine for the kubexit process supervisor.
//!
//! kubexit wraps a single child command inside a pod and coordinates its
//! lifecycle with named sibling containers: birth dependencies gate the
//! child's start on peer readiness, death dependencies trigger its
//! graceful shutdown, and the child's own birth and death are published
//! as a tombstone file in a shared graveyard directory.
//!
//! The [`engine`] module composes the pieces; the other modules are its
//! collaborators and are usable on their own.

pub mod engine;
pub mod error;
pub mod event;
pub mod kubernetes;
pub mod shutdown;
pub mod supervisor;
pub mod tombstone;

pub use error::{CoreError, Result};
pub use event::Trace;
pub use shutdown::Shutdown;
