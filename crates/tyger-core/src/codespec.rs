//! Codespec content hashing and validation.
//!
//! The hashing scheme follows `sem_os_core::authoring::canonical_hash`:
//! canonicalize to JSON with sorted map keys, hash with SHA-256, hex-encode.
//! Two puts of semantically-identical content produce the same hash and are
//! deduplicated into the existing version rather than minting a new one.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::error::{Result, TygerError};
use crate::types::{CodespecBuffers, CodespecContent, CodespecKind};

static BUFFER_PARAM_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").unwrap());

/// Canonical content hash used for semantic-equality dedup (spec.md §3).
/// `serde_json::to_value` + `BTreeMap` re-serialization gives deterministic
/// key ordering regardless of HashMap iteration order, mirroring
/// `compute_content_hash`'s canonicalization step.
pub fn compute_content_hash(content: &CodespecContent) -> Result<String> {
    let value = serde_json::to_value(content)
        .map_err(|e| TygerError::Fatal(anyhow::anyhow!("codespec serialize failed: {e}")))?;
    let canonical = canonicalize(&value);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

/// Recursively re-emits a `serde_json::Value` with object keys sorted, so
/// hashing is insensitive to the source HashMap's iteration order.
fn canonicalize(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut entries: Vec<(&String, &serde_json::Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let body = entries
                .into_iter()
                .map(|(k, v)| format!("{}:{}", serde_json::to_string(k).unwrap(), canonicalize(v)))
                .collect::<Vec<_>>()
                .join(",");
            format!("{{{body}}}")
        }
        serde_json::Value::Array(items) => {
            let body = items.iter().map(canonicalize).collect::<Vec<_>>().join(",");
            format!("[{body}]")
        }
        other => other.to_string(),
    }
}

/// Validates a codespec's buffer parameter names and socket-binding
/// interaction with `$(...)` substitution references, per spec.md §3.
pub fn validate(content: &CodespecContent) -> Result<()> {
    if content.image.trim().is_empty() {
        return Err(TygerError::validation("InvalidCodespec", "image must not be empty"));
    }

    let buffers = content.buffers.clone().unwrap_or_default();
    validate_buffer_param_names(&buffers)?;
    validate_socket_pipe_references(content, &buffers)?;

    if matches!(content.kind, CodespecKind::Worker) && content.buffers.is_some() {
        return Err(TygerError::validation(
            "InvalidCodespec",
            "worker codespecs must not declare input/output buffers",
        ));
    }
    if matches!(content.kind, CodespecKind::Job) && !content.endpoints.is_empty() {
        return Err(TygerError::validation(
            "InvalidCodespec",
            "job codespecs must not declare endpoints",
        ));
    }

    Ok(())
}

fn validate_buffer_param_names(buffers: &CodespecBuffers) -> Result<()> {
    let mut seen: HashMap<String, &str> = HashMap::new();
    for (name, which) in buffers
        .inputs
        .iter()
        .map(|n| (n, "inputs"))
        .chain(buffers.outputs.iter().map(|n| (n, "outputs")))
    {
        if !BUFFER_PARAM_NAME_RE.is_match(name) {
            return Err(TygerError::validation(
                "InvalidCodespec",
                format!("buffer parameter name '{name}' must match ^[a-z0-9]([-a-z0-9]*[a-z0-9])?$"),
            ));
        }
        let lower = name.to_ascii_lowercase();
        if let Some(existing) = seen.insert(lower, which) {
            return Err(TygerError::validation(
                "InvalidCodespec",
                format!(
                    "buffer parameter name '{name}' collides case-insensitively across {existing}/{which}"
                ),
            ));
        }
    }
    Ok(())
}

/// A buffer bound to a socket must not also be referenced via
/// `$(UPPERCASE_NAME_PIPE)` substitution in argv/command/env — that
/// substitution form is reserved for the named-pipe sidecar path, which a
/// socket-bound buffer does not get.
fn validate_socket_pipe_references(content: &CodespecContent, buffers: &CodespecBuffers) -> Result<()> {
    let socket_bound: std::collections::HashSet<String> = content
        .sockets
        .iter()
        .flat_map(|s| [s.input_buffer.clone(), s.output_buffer.clone()])
        .flatten()
        .map(|n| n.to_ascii_uppercase())
        .collect();

    if socket_bound.is_empty() {
        return Ok(());
    }

    let haystacks: Vec<&str> = content
        .command
        .iter()
        .chain(content.args.iter())
        .map(String::as_str)
        .chain(content.env.values().map(String::as_str))
        .collect();

    for name in buffers.inputs.iter().chain(buffers.outputs.iter()) {
        let upper = name.to_ascii_uppercase();
        if !socket_bound.contains(&upper) {
            continue;
        }
        let token = format!("$({upper}_PIPE)");
        if haystacks.iter().any(|h| h.contains(&token)) {
            return Err(TygerError::validation(
                "InvalidCodespec",
                format!("buffer '{name}' is socket-bound and must not use substitution reference {token}"),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ResourceRequirements;

    fn base_content() -> CodespecContent {
        CodespecContent {
            kind: CodespecKind::Job,
            image: "busybox".into(),
            command: vec!["sh".into(), "-c".into(), "cat $(INPUT_PIPE)".into()],
            args: vec![],
            working_dir: None,
            env: HashMap::new(),
            identity: None,
            resources: ResourceRequirements::default(),
            max_replicas: None,
            buffers: Some(CodespecBuffers {
                inputs: vec!["input".into()],
                outputs: vec!["output".into()],
            }),
            sockets: vec![],
            endpoints: HashMap::new(),
        }
    }

    #[test]
    fn identical_content_hashes_equal_regardless_of_map_order() {
        let mut a = base_content();
        a.env.insert("A".into(), "1".into());
        a.env.insert("B".into(), "2".into());

        let mut b = base_content();
        b.env.insert("B".into(), "2".into());
        b.env.insert("A".into(), "1".into());

        assert_eq!(compute_content_hash(&a).unwrap(), compute_content_hash(&b).unwrap());
    }

    #[test]
    fn differing_content_hashes_differ() {
        let a = base_content();
        let mut b = base_content();
        b.image = "alpine".into();
        assert_ne!(compute_content_hash(&a).unwrap(), compute_content_hash(&b).unwrap());
    }

    #[test]
    fn rejects_invalid_buffer_param_name() {
        let mut c = base_content();
        c.buffers.as_mut().unwrap().inputs = vec!["Invalid_Name".into()];
        assert!(validate(&c).is_err());
    }

    #[test]
    fn rejects_case_insensitive_collision() {
        let mut c = base_content();
        c.buffers = Some(CodespecBuffers {
            inputs: vec!["data".into()],
            outputs: vec!["DATA".into()],
        });
        assert!(validate(&c).is_err());
    }

    #[test]
    fn rejects_pipe_substitution_on_socket_bound_buffer() {
        let mut c = base_content();
        c.sockets = vec![crate::types::SocketSpec {
            port: 8080,
            input_buffer: Some("input".into()),
            output_buffer: None,
        }];
        c.command = vec!["sh".into(), "-c".into(), "cat $(INPUT_PIPE)".into()];
        assert!(validate(&c).is_err());
    }

    #[test]
    fn accepts_well_formed_echo_codespec() {
        let c = base_content();
        assert!(validate(&c).is_ok());
    }
}
