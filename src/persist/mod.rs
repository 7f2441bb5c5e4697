//! Small helpers for the JSON state files kept next to the process.

use serde::de::DeserializeOwned;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

/// Reads and parses `path`. A missing, unreadable or malformed file is `None`.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return None,
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "state file unreadable");
            return None;
        }
    };
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "state file malformed, ignoring");
            None
        }
    }
}

/// Writes `content` to a sibling temp file, fsyncs it and renames it over
/// `path`. On failure the previous file is left untouched.
pub fn write_atomic(path: &Path, content: &[u8]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;
    let base = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("state.json");
    let tmp_path = dir.join(format!(".{}.tmp-{}", base, uuid::Uuid::new_v4().simple()));

    let result = (|| {
        let mut tmp = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)?;
        tmp.write_all(content)?;
        tmp.flush()?;
        tmp.sync_all()?;
        fs::rename(&tmp_path, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
        return result;
    }

    // best-effort: persist the rename itself
    if let Ok(dir_file) = File::open(dir) {
        let _ = dir_file.sync_all();
    }
    Ok(())
}

/// Removes `path`, treating an already-missing file as success.
pub fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn malformed_and_missing_files_read_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.json");
        assert!(read_json::<Value>(&path).is_none());

        for garbage in ["", "{", "not json", "{\"deviceId\":", "\u{0}\u{1}"] {
            fs::write(&path, garbage).unwrap();
            assert!(read_json::<Value>(&path).is_none(), "{garbage:?}");
        }
    }

    #[test]
    fn atomic_write_replaces_content_and_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.json");
        write_atomic(&path, br#"{"deviceId":"d1"}"#).unwrap();
        write_atomic(&path, br#"{"deviceId":"d2"}"#).unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), r#"{"deviceId":"d2"}"#);
        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn remove_if_exists_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.json");
        remove_if_exists(&path).unwrap();
        fs::write(&path, "{}").unwrap();
        remove_if_exists(&path).unwrap();
        assert!(!path.exists());
    }
}
