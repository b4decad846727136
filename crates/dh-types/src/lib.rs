//! Shared wire types for the `dh` workspace: the vsock exec protocol, the
//! REPL subprocess protocol, the pool-daemon protocol, the output envelope,
//! and the error taxonomy. Kept dependency-light so the host CLI, the
//! in-VM runner, and the REPL runner can all depend on it without pulling
//! in tokio or any engine client.

pub mod envelope;
pub mod error;
pub mod pool_proto;
pub mod repl_proto;
pub mod version;
pub mod vsock_proto;

pub use envelope::{Envelope, ErrorBody};
pub use error::{DhError, ErrorKind};
pub use version::EngineVersion;
