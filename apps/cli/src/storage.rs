use std::fs;
use std::path::{Path, PathBuf};

const DATA_DIR_NAME: &str = "token-ingest";
const DB_FILE_NAME: &str = "usage.sqlite";

#[derive(Debug, Clone)]
pub struct DatabaseResolution {
    pub path: PathBuf,
    pub matched_existing: bool,
}

/// Picks the database file: the explicit path if given, otherwise
/// `usage.sqlite` under the platform data directory. Parent directories are
/// created as needed.
pub fn resolve_database(explicit: Option<&Path>) -> Result<DatabaseResolution, String> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => dirs::data_dir()
            .ok_or_else(|| "could not resolve a data directory".to_string())?
            .join(DATA_DIR_NAME)
            .join(DB_FILE_NAME),
    };
    let matched_existing = path.exists();
    if !matched_existing && let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| format!("create data dir {}: {}", parent.display(), err))?;
    }
    Ok(DatabaseResolution {
        path,
        matched_existing,
    })
}
