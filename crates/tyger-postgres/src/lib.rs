//! PostgreSQL adapter crate for Tyger: implements `tyger_core::ports::Repository`
//! over a `sqlx::PgPool`, runs schema migrations, and exposes the
//! `LISTEN/NOTIFY` change stream used by the engine and by long-poll API
//! handlers.

pub mod listen;
pub mod sqlx_types;
pub mod store;

pub use listen::{ChangeEvent, ChangeListener};
pub use store::PgRepository;

use sqlx::PgPool;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("migrations");

/// Applies all pending migrations. Safe to call on every process start —
/// `sqlx::migrate!` tracks applied versions in `_sqlx_migrations`.
pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    MIGRATOR.run(pool).await?;
    Ok(())
}
