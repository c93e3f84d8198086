//! Named-pipe setup for a bound buffer, per spec.md §4.F: a FIFO at
//! `/tyger/$(NAME)_PIPE`, exposed to the job container as the env var
//! `<NAME>_PIPE`.

use std::path::{Path, PathBuf};

use nix::sys::stat::Mode;
use nix::unistd::mkfifo;

const PIPE_ROOT: &str = "/tyger";

#[derive(Debug, thiserror::Error)]
pub enum PipeError {
    #[error("failed to create fifo at {0}: {1}")]
    Create(PathBuf, #[source] nix::Error),
    #[error("io error on pipe {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),
}

/// Env var a job container reads to find its pipe path, e.g. `input` ->
/// `INPUT_PIPE`. Mirrors `tyger_backend::common::pipe_env_var`, duplicated
/// here rather than pulled in as a dependency since the sidecar binary has
/// no other need of the backend crate.
pub fn pipe_env_var(buffer_param_name: &str) -> String {
    format!("{}_PIPE", buffer_param_name.to_ascii_uppercase())
}

pub fn pipe_path(buffer_param_name: &str) -> PathBuf {
    Path::new(PIPE_ROOT).join(format!("{}_PIPE", buffer_param_name.to_ascii_uppercase()))
}

/// Creates the FIFO if it doesn't already exist. Idempotent so the sidecar
/// can be restarted without failing on `EEXIST`.
pub fn ensure_fifo(path: &Path) -> Result<(), PipeError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| PipeError::Io(path.to_path_buf(), e))?;
    }
    match mkfifo(path, Mode::from_bits_truncate(0o600)) {
        Ok(()) => Ok(()),
        Err(nix::Error::EEXIST) => Ok(()),
        Err(e) => Err(PipeError::Create(path.to_path_buf(), e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipe_env_var_and_path_derive_from_buffer_name() {
        assert_eq!(pipe_env_var("input"), "INPUT_PIPE");
        assert_eq!(pipe_path("input"), PathBuf::from("/tyger/INPUT_PIPE"));
    }

    #[test]
    fn ensure_fifo_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("TEST_PIPE");
        ensure_fifo(&path).unwrap();
        assert!(path.exists());
        ensure_fifo(&path).unwrap();
    }
}
