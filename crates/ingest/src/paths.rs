use std::path::{Path, PathBuf};

use crate::types::{IngestError, Result};

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

pub fn default_codex_home() -> PathBuf {
    if let Some(path) = std::env::var_os("CODEX_HOME") {
        return PathBuf::from(path);
    }
    if let Some(home) = home_dir() {
        return home.join(".codex");
    }
    PathBuf::from(".codex")
}

pub fn default_codex_sessions_root() -> PathBuf {
    default_codex_home().join("sessions")
}

pub fn default_opencode_db() -> PathBuf {
    let base = std::env::var_os("XDG_DATA_HOME")
        .map(PathBuf::from)
        .or_else(|| home_dir().map(|home| home.join(".local").join("share")))
        .unwrap_or_else(|| PathBuf::from("."));
    base.join("opencode").join("opencode.db")
}

/// Maps a Gemini ingest argument to the normalized JSONL it names.
pub fn resolve_gemini_input(path: &Path) -> Result<PathBuf> {
    let label = path.display().to_string();
    if path.is_dir() {
        return [
            path.join("telemetry.jsonl"),
            path.join(".gemini").join("telemetry.jsonl"),
        ]
        .into_iter()
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| IngestError::InvalidInput {
            location: label,
            message: "no telemetry.jsonl here or under .gemini".to_string(),
        });
    }
    if path.extension().and_then(|value| value.to_str()) != Some("jsonl") {
        return Err(IngestError::InvalidInput {
            location: label,
            message: "expected a directory or a .jsonl file".to_string(),
        });
    }
    if !path.is_file() {
        return Err(IngestError::InvalidInput {
            location: label,
            message: "input does not exist".to_string(),
        });
    }
    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gemini_inputs_resolve_through_dot_gemini() {
        let dir = tempfile::tempdir().expect("tempdir");
        let nested = dir.path().join(".gemini");
        std::fs::create_dir_all(&nested).expect("mkdir");
        std::fs::write(nested.join("telemetry.jsonl"), "").expect("write");
        assert_eq!(
            resolve_gemini_input(dir.path()).expect("resolve"),
            nested.join("telemetry.jsonl")
        );

        std::fs::write(dir.path().join("telemetry.jsonl"), "").expect("write");
        assert_eq!(
            resolve_gemini_input(dir.path()).expect("resolve"),
            dir.path().join("telemetry.jsonl")
        );
    }

    #[test]
    fn gemini_inputs_must_be_jsonl_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = dir.path().join("telemetry.log");
        std::fs::write(&log, "").expect("write");
        assert!(matches!(
            resolve_gemini_input(&log),
            Err(IngestError::InvalidInput { .. })
        ));
        assert!(resolve_gemini_input(&dir.path().join("missing.jsonl")).is_err());
        assert!(resolve_gemini_input(dir.path()).is_err());
    }
}
