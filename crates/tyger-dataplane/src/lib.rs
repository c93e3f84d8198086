//! Buffer data plane: the HTTP block protocol, local-mode disk store and
//! signed URLs, the axum routes serving them, and the parallel client used
//! by the sidecar. See spec.md §4.B.

pub mod client;
pub mod error;
pub mod local;
pub mod protocol;
pub mod server;
pub mod signing;

pub use error::DataPlaneError;
pub use local::LocalStore;
pub use signing::SigningKeys;
