//! Persisted JSON document IO shared by the instance registry and the host
//! profile store.
//!
//! Both stores persist as a single JSON document at a caller-supplied path.
//! A missing or empty document is a valid empty store rather than an error,
//! and dumps rewrite the document atomically (staging file plus rename) so a
//! crash mid-write never leaves a truncated registry behind.

use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Errors raised while reading or writing a persisted document.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Raised when file system operations fail.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when decoding or encoding the document fails.
    #[error("failed to parse {path}: {message}")]
    Parse {
        /// Path that could not be parsed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when a document path has no file name component.
    #[error("document path {path} is missing a filename")]
    MissingFileName {
        /// Offending path.
        path: Utf8PathBuf,
    },
}

fn split_path(path: &Utf8Path) -> Result<(&Utf8Path, &str), StoreError> {
    let parent = path.parent().unwrap_or_else(|| Utf8Path::new("."));
    let file_name = path
        .file_name()
        .ok_or_else(|| StoreError::MissingFileName {
            path: path.to_path_buf(),
        })?;
    Ok((parent, file_name))
}

fn io_error(path: &Utf8Path, err: &io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

/// Loads a JSON document, treating a missing or empty file as the default
/// value.
///
/// # Errors
///
/// Returns [`StoreError::Io`] when the file exists but cannot be read, or
/// [`StoreError::Parse`] when its contents are not valid JSON for `T`.
pub fn load_document<T>(path: &Utf8Path) -> Result<T, StoreError>
where
    T: DeserializeOwned + Default,
{
    let (parent, file_name) = split_path(path)?;

    let dir = match Dir::open_ambient_dir(parent, ambient_authority()) {
        Ok(dir) => dir,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(T::default()),
        Err(err) => return Err(io_error(parent, &err)),
    };

    let contents = match dir.read_to_string(file_name) {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(T::default()),
        Err(err) => return Err(io_error(path, &err)),
    };

    if contents.trim().is_empty() {
        return Ok(T::default());
    }

    serde_json::from_str(&contents).map_err(|err| StoreError::Parse {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}

/// Atomically rewrites the document at `path` with `value`.
///
/// The rendered JSON is written to a staging file in the same directory and
/// renamed over the target, so readers never observe a partial document.
///
/// # Errors
///
/// Returns [`StoreError::Io`] when the directory or files cannot be written,
/// or [`StoreError::Parse`] when `value` cannot be rendered as JSON.
pub fn dump_document<T>(path: &Utf8Path, value: &T) -> Result<(), StoreError>
where
    T: Serialize,
{
    let (parent, file_name) = split_path(path)?;

    Dir::create_ambient_dir_all(parent, ambient_authority())
        .map_err(|err| io_error(parent, &err))?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority())
        .map_err(|err| io_error(parent, &err))?;

    let rendered = serde_json::to_string_pretty(value).map_err(|err| StoreError::Parse {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;

    let staging = format!("{file_name}.tmp");
    dir.write(&staging, rendered)
        .map_err(|err| io_error(path, &err))?;
    dir.rename(&staging, &dir, file_name)
        .map_err(|err| io_error(path, &err))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use camino::Utf8PathBuf;
    use tempfile::TempDir;

    use super::*;

    fn temp_document_path(tmp: &TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(tmp.path().join("store.json"))
            .unwrap_or_else(|err| panic!("temp path should be utf8: {}", err.display()))
    }

    #[test]
    fn load_missing_document_yields_default() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let path = temp_document_path(&tmp);

        let loaded: BTreeMap<String, String> =
            load_document(&path).unwrap_or_else(|err| panic!("load: {err}"));

        assert!(loaded.is_empty());
    }

    #[test]
    fn load_empty_document_yields_default() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let path = temp_document_path(&tmp);
        std::fs::write(&path, "  \n").unwrap_or_else(|err| panic!("seed file: {err}"));

        let loaded: BTreeMap<String, String> =
            load_document(&path).unwrap_or_else(|err| panic!("load: {err}"));

        assert!(loaded.is_empty());
    }

    #[test]
    fn dump_then_load_round_trips() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let path = temp_document_path(&tmp);
        let mut original = BTreeMap::new();
        original.insert(String::from("alpha"), String::from("one"));
        original.insert(String::from("beta"), String::from("two"));

        dump_document(&path, &original).unwrap_or_else(|err| panic!("dump: {err}"));
        let reloaded: BTreeMap<String, String> =
            load_document(&path).unwrap_or_else(|err| panic!("load: {err}"));

        assert_eq!(reloaded, original);
    }

    #[test]
    fn dump_leaves_no_staging_file_behind() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let path = temp_document_path(&tmp);
        let value: BTreeMap<String, String> = BTreeMap::new();

        dump_document(&path, &value).unwrap_or_else(|err| panic!("dump: {err}"));

        assert!(!tmp.path().join("store.json.tmp").exists());
    }

    #[test]
    fn load_rejects_malformed_document() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let path = temp_document_path(&tmp);
        std::fs::write(&path, "{not json").unwrap_or_else(|err| panic!("seed file: {err}"));

        let result: Result<BTreeMap<String, String>, StoreError> = load_document(&path);

        assert!(matches!(result, Err(StoreError::Parse { .. })));
    }
}
