//! Filesystem streaming backend.
//!
//! Each key maps to one file in the data directory. The file starts with
//! the 32-byte TTL envelope from [`crate::ttl`] followed by the raw payload.
//!
//! Uploads are staged in `<data_dir>/.partial/` and published with a hard
//! link. Linking fails atomically when the target already exists, so two
//! writers of a fresh key can never both succeed, and a cancelled or failed
//! upload never leaves a file under the record's name.
//!
//! Replacing an expired record is check-then-act: the stale file is removed
//! and the staged upload linked in its place. A concurrent writer can win
//! the window between those two steps, in which case this writer reports
//! [`StorageError::Conflict`].
//!
//! Removal of an expired record is guarded by the identity (device and
//! inode on Unix) of the file whose header was inspected. If the name has
//! been relinked to a newer record in the meantime, that record is left
//! alone.

use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;

use crate::ttl::{self, TtlHeader};
use crate::{
    BoxReader, CancelReader, CancelToken, Removable, StorageError, StorageResult, StreamBackend,
};

/// Subdirectory of the data directory holding in-flight uploads.
const STAGING_DIR: &str = ".partial";

/// Configuration for [`FileBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileConfig {
    /// Directory holding one file per key. Created if missing.
    pub data_dir: PathBuf,
}

impl FileConfig {
    /// Configuration rooted at `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    /// Check required fields.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Config`] if the data directory is empty.
    pub fn validate(&self) -> StorageResult<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(StorageError::Config {
                reason: "file backend data_dir cannot be empty".to_owned(),
            });
        }
        Ok(())
    }
}

/// A [`StreamBackend`] storing one file per key.
///
/// # Examples
///
/// ```no_run
/// # use stash_storage::{FileBackend, FileConfig};
/// # #[tokio::main]
/// # async fn main() {
/// let backend = FileBackend::open(FileConfig::new("/var/lib/stash/files")).await.unwrap();
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct FileBackend {
    data_dir: PathBuf,
    staging_dir: PathBuf,
}

impl FileBackend {
    /// Open the backend, creating the data directory if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Config`] if the configuration is invalid or
    /// the path exists but is not a directory, and [`StorageError::Open`] if
    /// the directories cannot be created.
    pub async fn open(config: FileConfig) -> StorageResult<Self> {
        config.validate()?;
        let data_dir = config.data_dir;

        match fs::metadata(&data_dir).await {
            Ok(meta) if !meta.is_dir() => {
                return Err(StorageError::Config {
                    reason: format!("'{}' is not a directory", data_dir.display()),
                });
            }
            Ok(_) => {}
            Err(e) if e.kind() == IoErrorKind::NotFound => create_dir(&data_dir).await?,
            Err(e) => {
                return Err(StorageError::Open {
                    path: data_dir.display().to_string(),
                    reason: e.to_string(),
                });
            }
        }

        let staging_dir = data_dir.join(STAGING_DIR);
        create_dir(&staging_dir).await?;

        Ok(Self {
            data_dir,
            staging_dir,
        })
    }

    /// The directory records are stored in.
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn record_path(&self, key: &str) -> StorageResult<PathBuf> {
        validate_key(key)?;
        Ok(self.data_dir.join(key))
    }

    /// Decode the header of the record at `path`, if one exists, along with
    /// the identity of the file it was read from.
    async fn stored_record(key: &str, path: &Path) -> StorageResult<Option<(TtlHeader, FileId)>> {
        let mut file = match File::open(path).await {
            Ok(file) => file,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StorageError::Read {
                    key: key.to_owned(),
                    reason: format!("cannot open file to check for expiration: {e}"),
                });
            }
        };
        let id = file_id(&file).await.map_err(|e| StorageError::Read {
            key: key.to_owned(),
            reason: format!("cannot stat file: {e}"),
        })?;
        let header = ttl::read_header(&mut file).await?;
        Ok(Some((header, id)))
    }

    /// Fail with a conflict if `path` holds a record that has not expired.
    /// Returns the identity of the expired record in the way, if any.
    async fn ensure_vacant(key: &str, path: &Path) -> StorageResult<Option<FileId>> {
        match Self::stored_record(key, path).await? {
            Some((header, _)) if !header.is_expired() => Err(StorageError::conflict(key)),
            Some((_, stale)) => Ok(Some(stale)),
            None => Ok(None),
        }
    }

    /// Move a fully written staging file into place under `target`.
    async fn publish(key: &str, staged: &Path, target: &Path) -> StorageResult<()> {
        match fs::hard_link(staged, target).await {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == IoErrorKind::AlreadyExists => {}
            Err(e) => return Err(publish_error(key, &e)),
        }

        // Something is in the way: either a live record written meanwhile,
        // or the expired record this save is replacing.
        if let Some(stale) = Self::ensure_vacant(key, target).await? {
            let removed = remove_if_same(target, stale)
                .await
                .map_err(|e| publish_error(key, &e))?;
            if removed {
                tracing::debug!(key = %key, "replaced expired record");
            }
        }

        match fs::hard_link(staged, target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == IoErrorKind::AlreadyExists => Err(StorageError::conflict(key)),
            Err(e) => Err(publish_error(key, &e)),
        }
    }
}

#[async_trait::async_trait]
impl StreamBackend for FileBackend {
    async fn save_ttl(
        &self,
        cancel: &CancelToken,
        key: &str,
        reader: BoxReader,
        ttl: Duration,
    ) -> StorageResult<u64> {
        let target = self.record_path(key)?;
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        Self::ensure_vacant(key, &target).await?;

        let staged = Staged::new(self.staging_dir.join(uuid::Uuid::new_v4().to_string()));
        let mut file = File::create(&staged.path)
            .await
            .map_err(|e| StorageError::Write {
                key: key.to_owned(),
                reason: format!("cannot create staging file: {e}"),
            })?;

        ttl::write_header(&mut file, ttl)
            .await
            .map_err(|e| StorageError::Write {
                key: key.to_owned(),
                reason: format!("cannot write expiration data: {e}"),
            })?;

        let mut source = CancelReader::new(reader, cancel);
        let written = tokio::io::copy(&mut source, &mut file)
            .await
            .map_err(|e| StorageError::from_stream_io(key, &e, StorageError::write))?;

        file.flush().await.map_err(|e| StorageError::Write {
            key: key.to_owned(),
            reason: e.to_string(),
        })?;
        file.sync_all().await.map_err(|e| StorageError::Write {
            key: key.to_owned(),
            reason: e.to_string(),
        })?;
        drop(file);

        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        Self::publish(key, &staged.path, &target).await?;
        staged.discard().await;

        tracing::debug!(key = %key, bytes = written, ttl_ms = ttl.as_millis(), "saved file");
        Ok(written)
    }

    async fn retrieve(&self, cancel: &CancelToken, key: &str) -> StorageResult<BoxReader> {
        let path = self.record_path(key)?;
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }

        let mut file = match File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == IoErrorKind::NotFound => {
                return Err(StorageError::not_found(key));
            }
            Err(e) => {
                return Err(StorageError::Read {
                    key: key.to_owned(),
                    reason: format!("cannot open file: {e}"),
                });
            }
        };

        let header = ttl::read_header(&mut file).await?;
        if header.is_expired() {
            let inspected = file_id(&file).await;
            // An open handle keeps the inode from being reused before the
            // identity check; other platforms cannot remove an open file.
            #[cfg(not(unix))]
            drop(file);
            match inspected {
                Ok(id) => match remove_if_same(&path, id).await {
                    Ok(true) => tracing::debug!(key = %key, "evicted expired file"),
                    Ok(false) => tracing::debug!(key = %key, "expired file already replaced"),
                    Err(e) => tracing::warn!(key = %key, error = %e, "failed to evict expired file"),
                },
                Err(e) => tracing::warn!(key = %key, error = %e, "cannot stat expired file"),
            }
            return Err(StorageError::not_found(key));
        }

        Ok(Box::pin(CancelReader::new(file, cancel)))
    }
}

#[async_trait::async_trait]
impl Removable for FileBackend {
    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.record_path(key)?;
        remove_if_exists(&path)
            .await
            .map_err(|e| StorageError::Delete {
                key: key.to_owned(),
                reason: e.to_string(),
            })
    }
}

/// A staging file that is removed unless the save completes.
struct Staged {
    path: PathBuf,
    armed: bool,
}

impl Staged {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    /// Remove the staging name after a successful publish; the record keeps
    /// its own link.
    async fn discard(mut self) {
        self.armed = false;
        if let Err(e) = remove_if_exists(&self.path).await {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to remove staging file");
        }
    }
}

impl Drop for Staged {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Err(e) if e.kind() != IoErrorKind::NotFound => {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to remove partial upload");
            }
            _ => {}
        }
    }
}

fn validate_key(key: &str) -> StorageResult<()> {
    let reason = if key.is_empty() {
        "key cannot be empty"
    } else if key.starts_with('.') {
        "key cannot start with '.'"
    } else if key.contains(['/', '\\', '\0']) {
        "key must be a single path component"
    } else {
        return Ok(());
    };
    Err(StorageError::InvalidKey {
        key: key.to_owned(),
        reason: reason.to_owned(),
    })
}

async fn create_dir(path: &Path) -> StorageResult<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(0o750);
    builder.create(path).await.map_err(|e| StorageError::Open {
        path: path.display().to_string(),
        reason: format!("cannot create directory: {e}"),
    })
}

async fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() != IoErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Identity of an on-disk file, stable across renames and links.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileId(u64, u64);

impl FileId {
    #[cfg(unix)]
    fn of(meta: &std::fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self(meta.dev(), meta.ino())
    }

    // No inode on this platform: length and modification time stand in.
    #[cfg(not(unix))]
    fn of(meta: &std::fs::Metadata) -> Self {
        let modified = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map_or(0, |d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX));
        Self(meta.len(), modified)
    }
}

async fn file_id(file: &File) -> std::io::Result<FileId> {
    file.metadata().await.map(|meta| FileId::of(&meta))
}

/// Remove `path` only while it still names the file identified by
/// `expected`. Returns whether a file was removed.
async fn remove_if_same(path: &Path, expected: FileId) -> std::io::Result<bool> {
    match fs::metadata(path).await {
        Ok(meta) if FileId::of(&meta) == expected => {}
        Ok(_) => return Ok(false),
        Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    }
    remove_if_exists(path).await.map(|()| true)
}

fn publish_error(key: &str, err: &std::io::Error) -> StorageError {
    StorageError::Write {
        key: key.to_owned(),
        reason: format!("cannot publish file: {err}"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| u8::try_from(i * 31 % 251).unwrap()).collect()
    }

    fn reader(data: &[u8]) -> BoxReader {
        Box::pin(std::io::Cursor::new(data.to_vec()))
    }

    async fn open_in(dir: &tempfile::TempDir) -> FileBackend {
        FileBackend::open(FileConfig::new(dir.path().join("data")))
            .await
            .unwrap()
    }

    async fn read_all(mut r: BoxReader) -> Vec<u8> {
        let mut out = Vec::new();
        r.read_to_end(&mut out).await.unwrap();
        out
    }

    async fn staging_entries(backend: &FileBackend) -> usize {
        let mut entries = fs::read_dir(&backend.staging_dir).await.unwrap();
        let mut count = 0;
        while entries.next_entry().await.unwrap().is_some() {
            count += 1;
        }
        count
    }

    #[tokio::test]
    async fn open_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let backend = open_in(&dir).await;
        assert!(backend.data_dir().is_dir());
    }

    #[tokio::test]
    async fn open_rejects_regular_file_and_empty_path() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plain");
        std::fs::write(&file, b"x").unwrap();

        let err = FileBackend::open(FileConfig::new(&file)).await.unwrap_err();
        assert!(matches!(err, StorageError::Config { .. }));

        let err = FileBackend::open(FileConfig::new("")).await.unwrap_err();
        assert!(matches!(err, StorageError::Config { .. }));
    }

    #[tokio::test]
    async fn save_and_retrieve_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = open_in(&dir).await;
        let cancel = CancelToken::new();
        let data = payload(10 * 1024);

        let written = backend.save(&cancel, "doc", reader(&data)).await.unwrap();
        assert_eq!(written, 10 * 1024);

        let got = read_all(backend.retrieve(&cancel, "doc").await.unwrap()).await;
        assert_eq!(got, data);
        assert_eq!(staging_entries(&backend).await, 0);
    }

    #[tokio::test]
    async fn empty_payload_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = open_in(&dir).await;
        let cancel = CancelToken::new();

        assert_eq!(backend.save(&cancel, "empty", reader(b"")).await.unwrap(), 0);
        let got = read_all(backend.retrieve(&cancel, "empty").await.unwrap()).await;
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn file_starts_with_ttl_envelope() {
        let dir = tempfile::tempdir().unwrap();
        let backend = open_in(&dir).await;
        let cancel = CancelToken::new();
        backend
            .save_ttl(&cancel, "k", reader(b"abc"), Duration::from_secs(60))
            .await
            .unwrap();

        let raw = std::fs::read(backend.data_dir().join("k")).unwrap();
        assert_eq!(raw.len(), ttl::HEADER_LEN + 3);
        assert_eq!(raw[0], ttl::VERSION_V0);
        assert_eq!(&raw[ttl::HEADER_LEN..], b"abc");
    }

    #[tokio::test]
    async fn live_record_conflicts_and_is_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let backend = open_in(&dir).await;
        let cancel = CancelToken::new();

        backend
            .save_ttl(&cancel, "k", reader(b"first"), Duration::from_secs(3600))
            .await
            .unwrap();
        let err = backend
            .save_ttl(&cancel, "k", reader(b"second"), Duration::from_secs(1800))
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let got = read_all(backend.retrieve(&cancel, "k").await.unwrap()).await;
        assert_eq!(got, b"first");
    }

    #[tokio::test]
    async fn expired_record_is_evicted_on_retrieve() {
        let dir = tempfile::tempdir().unwrap();
        let backend = open_in(&dir).await;
        let cancel = CancelToken::new();

        backend
            .save_ttl(&cancel, "y", reader(b"h"), Duration::from_millis(500))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let err = backend.retrieve(&cancel, "y").await.err().unwrap();
        assert!(err.is_not_found());
        assert!(!backend.data_dir().join("y").exists());
    }

    #[tokio::test]
    async fn expired_record_can_be_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let backend = open_in(&dir).await;
        let cancel = CancelToken::new();

        backend
            .save_ttl(&cancel, "k", reader(b"old"), Duration::from_millis(200))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        backend.save(&cancel, "k", reader(b"new")).await.unwrap();
        let got = read_all(backend.retrieve(&cancel, "k").await.unwrap()).await;
        assert_eq!(got, b"new");
    }

    #[tokio::test]
    async fn eviction_spares_a_record_relinked_after_inspection() {
        let dir = tempfile::tempdir().unwrap();
        let backend = open_in(&dir).await;
        let cancel = CancelToken::new();
        let path = backend.data_dir().join("k");

        backend
            .save_ttl(&cancel, "k", reader(b"old"), Duration::from_millis(200))
            .await
            .unwrap();
        let stale = File::open(&path).await.unwrap();
        let inspected = file_id(&stale).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        // Another writer replaces the expired record before the stale
        // handle's eviction runs.
        fs::remove_file(&path).await.unwrap();
        backend.save(&cancel, "k", reader(b"new")).await.unwrap();

        assert!(!remove_if_same(&path, inspected).await.unwrap());
        drop(stale);
        let got = read_all(backend.retrieve(&cancel, "k").await.unwrap()).await;
        assert_eq!(got, b"new");

        let current = file_id(&File::open(&path).await.unwrap()).await.unwrap();
        assert!(remove_if_same(&path, current).await.unwrap());
        assert!(!path.exists());
        assert!(!remove_if_same(&path, current).await.unwrap());
    }

    #[tokio::test]
    async fn unknown_header_version_is_unexpected() {
        let dir = tempfile::tempdir().unwrap();
        let backend = open_in(&dir).await;
        let cancel = CancelToken::new();
        backend.save(&cancel, "k", reader(b"abc")).await.unwrap();

        let path = backend.data_dir().join("k");
        let mut raw = std::fs::read(&path).unwrap();
        raw[0] = 0x07;
        std::fs::remove_file(&path).unwrap();
        std::fs::write(&path, raw).unwrap();

        let err = backend.retrieve(&cancel, "k").await.err().unwrap();
        assert!(matches!(err, StorageError::Header { .. }));
        let err = backend.save(&cancel, "k", reader(b"x")).await.unwrap_err();
        assert!(matches!(err, StorageError::Header { .. }));
    }

    #[tokio::test]
    async fn cancelled_save_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let backend = open_in(&dir).await;
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = backend
            .save(&cancel, "k", reader(&payload(4096)))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Cancelled));
        assert!(!backend.data_dir().join("k").exists());
        assert_eq!(staging_entries(&backend).await, 0);
    }

    #[tokio::test]
    async fn cancellation_mid_transfer_removes_partial_upload() {
        let dir = tempfile::tempdir().unwrap();
        let backend = open_in(&dir).await;
        let cancel = CancelToken::new();

        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b"partial bytes").await.unwrap();
        // `client` stays open, so the upload stalls until cancelled.
        cancel.cancel_after(Duration::from_millis(100));

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            backend.save(&cancel, "k", Box::pin(server)),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert!(matches!(err, StorageError::Cancelled));
        assert!(!backend.data_dir().join("k").exists());
        assert_eq!(staging_entries(&backend).await, 0);
        drop(client);
    }

    #[tokio::test]
    async fn retrieved_stream_observes_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let backend = open_in(&dir).await;
        let cancel = CancelToken::new();
        backend.save(&cancel, "k", reader(b"abc")).await.unwrap();

        let mut stream = backend.retrieve(&cancel, "k").await.unwrap();
        cancel.cancel();
        let mut out = Vec::new();
        let err = stream.read_to_end(&mut out).await.unwrap_err();
        assert!(crate::is_cancelled_io(&err));

        let err = backend.retrieve(&cancel, "k").await.err().unwrap();
        assert!(matches!(err, StorageError::Cancelled));
    }

    #[tokio::test]
    async fn rejects_keys_that_escape_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        let backend = open_in(&dir).await;
        let cancel = CancelToken::new();

        for key in ["", "..", ".partial", "a/b", "..\\x"] {
            let err = backend.save(&cancel, key, reader(b"x")).await.unwrap_err();
            assert!(matches!(err, StorageError::InvalidKey { .. }), "{key}");
        }
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let backend = open_in(&dir).await;
        let cancel = CancelToken::new();

        backend.delete("missing").await.unwrap();
        backend.save(&cancel, "k", reader(b"v")).await.unwrap();
        backend.delete("k").await.unwrap();
        let err = backend.retrieve(&cancel, "k").await.err().unwrap();
        assert!(err.is_not_found());
    }
}
