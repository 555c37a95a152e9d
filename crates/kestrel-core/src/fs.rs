// SPDX-License-Identifier: CEPL-1.0
//! Opaque byte-blob provider used for shader bytecode and other assets.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AssetError {
    #[error("file not found: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{} is empty", path.display())]
    Empty { path: PathBuf },
}

/// Reads a whole file into memory.
///
/// A missing file is reported as [`AssetError::NotFound`] so callers can treat
/// it as fatal without inspecting io error kinds.
pub fn read_binary_file(path: impl AsRef<Path>) -> Result<Vec<u8>, AssetError> {
    let path = path.as_ref();
    let bytes = std::fs::read(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => AssetError::NotFound {
            path: path.to_path_buf(),
        },
        _ => AssetError::Io {
            path: path.to_path_buf(),
            source: e,
        },
    })?;

    if bytes.is_empty() {
        return Err(AssetError::Empty {
            path: path.to_path_buf(),
        });
    }

    tracing::debug!("read {} bytes from {}", bytes.len(), path.display());
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("kestrel-core-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    #[test]
    fn missing_file_is_not_found() {
        let err = read_binary_file(scratch("does-not-exist.spv")).unwrap_err();
        assert!(matches!(err, AssetError::NotFound { .. }));
        assert!(err.to_string().contains("does-not-exist.spv"));
    }

    #[test]
    fn reads_bytes_verbatim() {
        let path = scratch("blob.bin");
        std::fs::write(&path, [0x03, 0x02, 0x23, 0x07, 0xff]).unwrap();
        let bytes = read_binary_file(&path).unwrap();
        assert_eq!(bytes, vec![0x03, 0x02, 0x23, 0x07, 0xff]);
    }

    #[test]
    fn empty_file_is_rejected() {
        let path = scratch("empty.bin");
        std::fs::write(&path, []).unwrap();
        assert!(matches!(
            read_binary_file(&path),
            Err(AssetError::Empty { .. })
        ));
    }
}
