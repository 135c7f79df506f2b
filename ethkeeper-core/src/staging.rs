//! Transient on-disk staging for keystore blobs.
//!
//! Decryption goes through a file on disk, so each operation that needs the
//! blob materialized gets a [`StagingArea`]: a directory keyed by account
//! path, created atomically and exclusively, and removed on every exit path.
//! A staging directory that survives an operation is both a security defect
//! (key material left on disk) and an operational one (it blocks further
//! operations on that account path), so removal is wired into `Drop` and
//! cannot be skipped by an early return.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::{CustodyError, CustodyResult};
use crate::keystore::MAX_KEYSTORE_BYTES;

/// Exclusively-owned staging directory for a single in-flight operation.
#[derive(Debug)]
pub struct StagingArea {
    path: PathBuf,
    destroyed: bool,
}

impl StagingArea {
    /// Creates the staging directory for `account_path` under `root`.
    ///
    /// Creation is atomic-exclusive: an existing directory means either a
    /// concurrent operation on the same account path or an area abandoned by
    /// an unclean failure, and is reported as a conflict rather than
    /// silently reused.
    ///
    /// # Errors
    ///
    /// [`CustodyError::StagingConflict`] when the area already exists,
    /// [`CustodyError::InvalidAccountPath`] when the account path would
    /// escape `root`, [`CustodyError::Io`] for other filesystem failures.
    pub fn materialize(root: &Path, account_path: &str) -> CustodyResult<Self> {
        let rel = staging_rel_path(account_path)?;
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| CustodyError::io("creating staging root", err))?;
        }
        match fs::create_dir(&path) {
            Ok(()) => Ok(Self {
                path,
                destroyed: false,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(CustodyError::StagingConflict { path })
            }
            Err(err) => Err(CustodyError::io("creating staging area", err)),
        }
    }

    /// Path of the staging directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes `blob` into the area under `file_name`, returning the file
    /// path.
    ///
    /// # Errors
    ///
    /// [`CustodyError::InvalidAccountPath`] when `file_name` is not a single
    /// path component, [`CustodyError::Io`] when the write fails.
    pub fn write_blob(&self, file_name: &str, blob: &[u8]) -> CustodyResult<PathBuf> {
        sanitize_component(file_name)?;
        let path = self.path.join(file_name);
        fs::write(&path, blob).map_err(|err| CustodyError::io("writing staged keystore", err))?;
        Ok(path)
    }

    /// Reads a staged blob back, enforcing the size bound against the file
    /// metadata before the read.
    ///
    /// # Errors
    ///
    /// [`CustodyError::KeystoreTooLarge`] past the bound,
    /// [`CustodyError::Io`] when the file cannot be read.
    pub fn read_blob(&self, path: &Path) -> CustodyResult<Vec<u8>> {
        let meta =
            fs::metadata(path).map_err(|err| CustodyError::io("statting staged keystore", err))?;
        if meta.len() > MAX_KEYSTORE_BYTES {
            return Err(CustodyError::KeystoreTooLarge {
                size: meta.len(),
                limit: MAX_KEYSTORE_BYTES,
            });
        }
        fs::read(path).map_err(|err| CustodyError::io("reading staged keystore", err))
    }

    /// Removes the area and its contents.
    ///
    /// `Drop` performs the same removal best-effort; call this on the
    /// success path so removal failures surface as errors instead of log
    /// lines.
    ///
    /// # Errors
    ///
    /// [`CustodyError::Io`] when the directory cannot be removed.
    pub fn destroy(mut self) -> CustodyResult<()> {
        self.destroyed = true;
        fs::remove_dir_all(&self.path)
            .map_err(|err| CustodyError::io("removing staging area", err))
    }
}

impl Drop for StagingArea {
    fn drop(&mut self) {
        if self.destroyed {
            return;
        }
        if let Err(err) = fs::remove_dir_all(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %err, "failed to remove staging area");
            }
        }
    }
}

/// Maps an account path to its staging directory location relative to the
/// staging root. Rejects anything that could escape the root.
pub(crate) fn staging_rel_path(account_path: &str) -> CustodyResult<PathBuf> {
    if account_path.is_empty() {
        return Err(CustodyError::invalid_account_path(
            account_path,
            "must not be empty",
        ));
    }
    let mut rel = PathBuf::new();
    for segment in account_path.split('/') {
        if segment.is_empty()
            || segment == "."
            || segment == ".."
            || segment.contains('\\')
            || segment.contains('\0')
        {
            return Err(CustodyError::invalid_account_path(
                account_path,
                "segments must be plain path components",
            ));
        }
        rel.push(segment);
    }
    Ok(rel)
}

fn sanitize_component(value: &str) -> CustodyResult<()> {
    if value.is_empty()
        || value == "."
        || value == ".."
        || value.contains(['/', '\\', '\0'])
    {
        return Err(CustodyError::invalid_account_path(
            value,
            "must be a single path component",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;
    use uuid::Uuid;

    fn temp_root() -> PathBuf {
        std::env::temp_dir().join(format!("ethkeeper-staging-{}", Uuid::new_v4()))
    }

    #[test]
    fn materialize_is_exclusive_until_destroyed() {
        let root = temp_root();
        let area = StagingArea::materialize(&root, "accounts/alice").unwrap();

        assert!(matches!(
            StagingArea::materialize(&root, "accounts/alice"),
            Err(CustodyError::StagingConflict { .. })
        ));

        // A different account path is unaffected.
        let other = StagingArea::materialize(&root, "accounts/bob").unwrap();
        other.destroy().unwrap();

        area.destroy().unwrap();
        let again = StagingArea::materialize(&root, "accounts/alice").unwrap();
        again.destroy().unwrap();

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn write_and_read_blob_roundtrip() {
        let root = temp_root();
        let area = StagingArea::materialize(&root, "acc").unwrap();

        let staged = area.write_blob("key.json", b"{\"version\":3}").unwrap();
        assert!(staged.starts_with(area.path()));
        assert_eq!(area.read_blob(&staged).unwrap(), b"{\"version\":3}");

        area.destroy().unwrap();
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn read_blob_enforces_size_bound_from_metadata() {
        let root = temp_root();
        let area = StagingArea::materialize(&root, "acc").unwrap();

        let oversized = vec![b'x'; (MAX_KEYSTORE_BYTES + 1) as usize];
        let staged = area.write_blob("big.json", &oversized).unwrap();
        assert!(matches!(
            area.read_blob(&staged),
            Err(CustodyError::KeystoreTooLarge { .. })
        ));

        area.destroy().unwrap();
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn drop_removes_the_area() {
        let root = temp_root();
        let path = {
            let area = StagingArea::materialize(&root, "acc").unwrap();
            area.write_blob("key.json", b"blob").unwrap();
            area.path().to_path_buf()
        };
        assert!(!path.exists());
        let _ = fs::remove_dir_all(&root);
    }

    #[test_case("" ; "empty")]
    #[test_case(".." ; "parent")]
    #[test_case("a/../b" ; "traversal")]
    #[test_case("/absolute" ; "absolute")]
    #[test_case("trailing/" ; "trailing separator")]
    fn rejects_escaping_account_paths(account_path: &str) {
        let root = temp_root();
        assert!(matches!(
            StagingArea::materialize(&root, account_path),
            Err(CustodyError::InvalidAccountPath { .. })
        ));
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn rejects_nested_blob_file_names() {
        let root = temp_root();
        let area = StagingArea::materialize(&root, "acc").unwrap();
        assert!(matches!(
            area.write_blob("../escape.json", b"blob"),
            Err(CustodyError::InvalidAccountPath { .. })
        ));
        area.destroy().unwrap();
        let _ = fs::remove_dir_all(&root);
    }
}
