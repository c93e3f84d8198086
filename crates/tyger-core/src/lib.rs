//! Tyger domain crate: types, port traits, validation, and the
//! backend-independent run lifecycle engine. No sqlx, no axum, no
//! Kubernetes/Docker client — those live in `tyger-postgres` and
//! `tyger-backend` respectively, coded against the traits in [`ports`].

pub mod buffer;
pub mod codespec;
pub mod engine;
pub mod error;
pub mod ports;
pub mod retry;
pub mod types;

pub use error::{Result, TygerError};
