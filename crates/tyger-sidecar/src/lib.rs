//! Buffer sidecar: creates a named pipe for a bound buffer and streams it
//! against either the buffer data plane or, for ephemeral buffers, a peer
//! sidecar directly. See spec.md §4.F.

pub mod forward;
pub mod pipe;
pub mod point_to_point;

pub use forward::{forward, Direction, ForwardError};
pub use pipe::{ensure_fifo, pipe_env_var, pipe_path, PipeError};
