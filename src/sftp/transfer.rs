//! File operations over an established remote session.
//!
//! Every path and name is validated before the remote filesystem is touched,
//! and every copy is bounded by a size ceiling. Partial output from an aborted
//! copy is removed.

use crate::config::MAX_TRANSFER_BYTES;
use crate::error::{AppError, AppResult};
use crate::validation::{self, remote_home, sanitize_filename, validate_local_path, validate_name, validate_remote_path};
use serde::Serialize;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

const DEFAULT_CHUNK_SIZE: usize = 8 * 1024;

/// Metadata of one remote entry
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoteStat {
    pub size: u64,
    pub is_dir: bool,
    pub modified: Option<i64>,
}

/// The remote filesystem operations the transfer layer needs
pub trait RemoteFs {
    type Reader: Read;
    type Writer: Write;

    fn read_dir(&self, path: &Path) -> io::Result<Vec<(PathBuf, RemoteStat)>>;
    fn open_read(&self, path: &Path) -> io::Result<Self::Reader>;
    fn create(&self, path: &Path) -> io::Result<Self::Writer>;
    fn mkdir(&self, path: &Path) -> io::Result<()>;
    fn remove_file(&self, path: &Path) -> io::Result<()>;
    fn remove_dir(&self, path: &Path) -> io::Result<()>;
}

/// Directory entry as shown to the UI
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteFileEntry {
    pub name: String,
    pub path: String,
    pub size: u64,
    pub is_directory: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_time: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadOutcome {
    pub remote_path: String,
    pub bytes: u64,
}

/// Copy `reader` into `writer` in chunks, failing once more than `max_bytes` would be written.
///
/// The limit is checked before each write, so at most `max_bytes` ever reach the writer.
pub fn copy_with_limit<R, W>(reader: &mut R, writer: &mut W, max_bytes: u64, chunk_size: usize) -> AppResult<u64>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let mut buffer = vec![0u8; chunk_size.max(1)];
    let mut total: u64 = 0;

    loop {
        let read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(AppError::RemoteIo(format!("Read error during transfer: {}", e))),
        };

        total += read as u64;
        if total > max_bytes {
            return Err(AppError::TransferSizeExceeded { limit: max_bytes });
        }

        writer
            .write_all(&buffer[..read])
            .map_err(|e| AppError::RemoteIo(format!("Write error during transfer: {}", e)))?;
    }

    writer
        .flush()
        .map_err(|e| AppError::RemoteIo(format!("Write error during transfer: {}", e)))?;
    Ok(total)
}

fn remote_io(action: &str, path: &Path, err: io::Error) -> AppError {
    AppError::RemoteIo(format!("Failed to {} '{}': {}", action, path.display(), err))
}

/// Validated file operations for one user over one remote filesystem
pub struct SecureFileTransfer<F: RemoteFs> {
    fs: F,
    username: String,
    home: PathBuf,
    local_root: PathBuf,
    max_bytes: u64,
    chunk_size: usize,
}

impl<F: RemoteFs> SecureFileTransfer<F> {
    /// Local transfers are bounded to the user's home directory unless overridden.
    pub fn new(fs: F, username: &str) -> AppResult<Self> {
        validation::validate_username(username)?;
        let local_root = dirs::home_dir()
            .ok_or_else(|| AppError::Config("Could not determine local home directory".to_string()))?;

        Ok(Self {
            fs,
            username: username.to_string(),
            home: remote_home(username),
            local_root,
            max_bytes: MAX_TRANSFER_BYTES,
            chunk_size: DEFAULT_CHUNK_SIZE,
        })
    }

    pub fn with_local_root(mut self, local_root: impl Into<PathBuf>) -> Self {
        self.local_root = local_root.into();
        self
    }

    /// Lower the size ceiling. Values above [`MAX_TRANSFER_BYTES`] are clamped to it.
    pub fn with_transfer_limit(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes.min(MAX_TRANSFER_BYTES);
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    /// List a remote directory: directories first, then case-insensitive by name
    pub fn list_directory(&self, remote_path: &str) -> AppResult<Vec<RemoteFileEntry>> {
        let path = validate_remote_path(remote_path, &self.username)?;
        tracing::info!(remote_path = %path.display(), "Listing remote directory");

        let entries = self
            .fs
            .read_dir(&path)
            .map_err(|e| remote_io("read directory", &path, e))?;

        let mut result: Vec<RemoteFileEntry> = entries
            .into_iter()
            .filter_map(|(entry_path, stat)| {
                let name = entry_path.file_name()?.to_string_lossy().to_string();
                if name == "." || name == ".." {
                    return None;
                }
                Some(RemoteFileEntry {
                    name,
                    path: entry_path.to_string_lossy().to_string(),
                    size: stat.size,
                    is_directory: stat.is_dir,
                    modified_time: stat.modified,
                })
            })
            .collect();

        result.sort_by(|a, b| {
            b.is_directory
                .cmp(&a.is_directory)
                .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
        });

        tracing::debug!(count = result.len(), "Directory listing completed");
        Ok(result)
    }

    /// Download a remote file to a local path. Returns the number of bytes copied.
    pub fn download(&self, remote_path: &str, local_path: &str) -> AppResult<u64> {
        let remote = validate_remote_path(remote_path, &self.username)?;
        let local = validate_local_path(local_path, &self.local_root)?;
        tracing::info!(remote = %remote.display(), local = %local.display(), "Downloading file");

        let mut reader = self
            .fs
            .open_read(&remote)
            .map_err(|e| remote_io("open remote file", &remote, e))?;
        let mut writer = File::create(&local)?;

        match copy_with_limit(&mut reader, &mut writer, self.max_bytes, self.chunk_size) {
            Ok(bytes) => {
                tracing::info!(bytes, "Download complete");
                Ok(bytes)
            }
            Err(e) => {
                drop(writer);
                if let Err(cleanup) = std::fs::remove_file(&local) {
                    tracing::warn!(local = %local.display(), "Failed to remove partial download: {}", cleanup);
                }
                Err(e)
            }
        }
    }

    /// Upload a local file into a remote directory.
    ///
    /// The remote name is the sanitized local file name.
    pub fn upload(&self, local_path: &str, remote_dir: &str) -> AppResult<UploadOutcome> {
        let local = validate_local_path(local_path, &self.local_root)?;
        let original_name = local
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| AppError::InvalidName("Local path has no file name".to_string()))?;
        let file_name = sanitize_filename(&original_name)?;
        let dir = validate_remote_path(remote_dir, &self.username)?;
        let remote = dir.join(&file_name);

        let mut reader = File::open(&local)?;
        let local_size = reader.metadata()?.len();
        if local_size > self.max_bytes {
            return Err(AppError::TransferSizeExceeded { limit: self.max_bytes });
        }

        if file_name != original_name {
            tracing::info!(original = %original_name, sanitized = %file_name, "Upload file name sanitized");
        }
        tracing::info!(local = %local.display(), remote = %remote.display(), "Uploading file");

        let mut writer = self
            .fs
            .create(&remote)
            .map_err(|e| remote_io("create remote file", &remote, e))?;

        match copy_with_limit(&mut reader, &mut writer, self.max_bytes, self.chunk_size) {
            Ok(bytes) => {
                tracing::info!(bytes, "Upload complete");
                Ok(UploadOutcome {
                    remote_path: remote.to_string_lossy().to_string(),
                    bytes,
                })
            }
            Err(e) => {
                drop(writer);
                if let Err(cleanup) = self.fs.remove_file(&remote) {
                    tracing::warn!(remote = %remote.display(), "Failed to remove partial upload: {}", cleanup);
                }
                Err(e)
            }
        }
    }

    /// Create `name` inside `parent`. Returns the new directory's path.
    pub fn create_directory(&self, parent: &str, name: &str) -> AppResult<String> {
        let name = validate_name(name)?;
        let parent = validate_remote_path(parent, &self.username)?;
        let path = parent.join(name);
        tracing::info!(remote = %path.display(), "Creating remote directory");

        self.fs
            .mkdir(&path)
            .map_err(|e| remote_io("create directory", &path, e))?;
        Ok(path.to_string_lossy().to_string())
    }

    pub fn delete(&self, remote_path: &str, is_directory: bool) -> AppResult<()> {
        let path = validate_remote_path(remote_path, &self.username)?;
        if path == self.home {
            return Err(AppError::PathTraversalRejected(
                "Refusing to delete the home directory".to_string(),
            ));
        }
        tracing::info!(remote = %path.display(), is_directory, "Deleting remote path");

        if is_directory {
            self.fs.remove_dir(&path).map_err(|e| remote_io("delete directory", &path, e))
        } else {
            self.fs.remove_file(&path).map_err(|e| remote_io("delete file", &path, e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Remote filesystem rooted in a scratch directory
    struct LocalFs {
        root: TempDir,
        calls: AtomicUsize,
    }

    impl LocalFs {
        fn new(username: &str) -> Self {
            let root = tempfile::tempdir().unwrap();
            std::fs::create_dir_all(root.path().join("home").join(username)).unwrap();
            Self {
                root,
                calls: AtomicUsize::new(0),
            }
        }

        fn real(&self, path: &Path) -> PathBuf {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.root.path().join(path.strip_prefix("/").unwrap_or(path))
        }
    }

    impl RemoteFs for &LocalFs {
        type Reader = File;
        type Writer = File;

        fn read_dir(&self, path: &Path) -> io::Result<Vec<(PathBuf, RemoteStat)>> {
            std::fs::read_dir(self.real(path))?
                .map(|entry| {
                    let entry = entry?;
                    let meta = entry.metadata()?;
                    Ok((
                        path.join(entry.file_name()),
                        RemoteStat {
                            size: meta.len(),
                            is_dir: meta.is_dir(),
                            modified: None,
                        },
                    ))
                })
                .collect()
        }

        fn open_read(&self, path: &Path) -> io::Result<File> {
            File::open(self.real(path))
        }

        fn create(&self, path: &Path) -> io::Result<File> {
            File::create(self.real(path))
        }

        fn mkdir(&self, path: &Path) -> io::Result<()> {
            std::fs::create_dir(self.real(path))
        }

        fn remove_file(&self, path: &Path) -> io::Result<()> {
            std::fs::remove_file(self.real(path))
        }

        fn remove_dir(&self, path: &Path) -> io::Result<()> {
            std::fs::remove_dir(self.real(path))
        }
    }

    /// Remote writer that fails once `remaining` bytes have been accepted
    struct ShortWriter {
        file: File,
        remaining: usize,
    }

    impl Write for ShortWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.remaining == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "connection reset"));
            }
            let n = buf.len().min(self.remaining);
            self.remaining -= n;
            self.file.write(&buf[..n])
        }

        fn flush(&mut self) -> io::Result<()> {
            self.file.flush()
        }
    }

    /// [`LocalFs`] whose uploads break after `quota` bytes
    struct ShortFs<'a> {
        inner: &'a LocalFs,
        quota: usize,
    }

    impl RemoteFs for ShortFs<'_> {
        type Reader = File;
        type Writer = ShortWriter;

        fn read_dir(&self, path: &Path) -> io::Result<Vec<(PathBuf, RemoteStat)>> {
            self.inner.read_dir(path)
        }

        fn open_read(&self, path: &Path) -> io::Result<File> {
            self.inner.open_read(path)
        }

        fn create(&self, path: &Path) -> io::Result<ShortWriter> {
            Ok(ShortWriter {
                file: self.inner.create(path)?,
                remaining: self.quota,
            })
        }

        fn mkdir(&self, path: &Path) -> io::Result<()> {
            self.inner.mkdir(path)
        }

        fn remove_file(&self, path: &Path) -> io::Result<()> {
            self.inner.remove_file(path)
        }

        fn remove_dir(&self, path: &Path) -> io::Result<()> {
            self.inner.remove_dir(path)
        }
    }

    fn transfer<'a>(fs: &'a LocalFs, local: &TempDir) -> SecureFileTransfer<&'a LocalFs> {
        SecureFileTransfer::new(fs, "alice")
            .unwrap()
            .with_local_root(local.path())
    }

    #[test]
    fn test_copy_with_limit_checks_before_writing() {
        let mut out = Vec::new();
        let err = copy_with_limit(&mut &[7u8; 17][..], &mut out, 16, 4).unwrap_err();
        assert!(matches!(err, AppError::TransferSizeExceeded { limit: 16 }));
        assert!(out.len() <= 16);

        let mut out = Vec::new();
        assert_eq!(copy_with_limit(&mut &[7u8; 16][..], &mut out, 16, 4).unwrap(), 16);
    }

    #[test]
    fn test_upload_then_download_round_trip() {
        let fs = LocalFs::new("alice");
        let local = tempfile::tempdir().unwrap();
        let t = transfer(&fs, &local).with_transfer_limit(64).with_chunk_size(5);

        for (name, payload) in [("empty.bin", vec![]), ("data.bin", (0u8..64).collect::<Vec<u8>>())] {
            let source = local.path().join(name);
            std::fs::write(&source, &payload).unwrap();

            let outcome = t.upload(source.to_str().unwrap(), "").unwrap();
            assert_eq!(outcome.remote_path, format!("/home/alice/{}", name));
            assert_eq!(outcome.bytes, payload.len() as u64);

            let back = local.path().join(format!("back-{}", name));
            t.download(&outcome.remote_path, back.to_str().unwrap()).unwrap();
            assert_eq!(std::fs::read(&back).unwrap(), payload);
        }
    }

    #[test]
    fn test_upload_over_ceiling_leaves_no_remote_artifact() {
        let fs = LocalFs::new("alice");
        let local = tempfile::tempdir().unwrap();
        let t = transfer(&fs, &local).with_transfer_limit(16);

        let source = local.path().join("big.bin");
        std::fs::write(&source, [1u8; 17]).unwrap();

        let err = t.upload(source.to_str().unwrap(), "/home/alice").unwrap_err();
        assert!(matches!(err, AppError::TransferSizeExceeded { .. }));
        assert!(!fs.root.path().join("home/alice/big.bin").exists());
    }

    #[test]
    fn test_upload_broken_mid_copy_removes_remote_partial() {
        let fs = LocalFs::new("alice");
        let local = tempfile::tempdir().unwrap();
        let short = ShortFs { inner: &fs, quota: 10 };
        let t = SecureFileTransfer::new(short, "alice")
            .unwrap()
            .with_local_root(local.path())
            .with_chunk_size(4);

        let source = local.path().join("notes.txt");
        std::fs::write(&source, [b'x'; 32]).unwrap();

        let err = t.upload(source.to_str().unwrap(), "/home/alice").unwrap_err();
        assert!(matches!(err, AppError::RemoteIo(_)), "{err:?}");
        assert!(!fs.root.path().join("home/alice/notes.txt").exists());
    }

    #[test]
    fn test_transfer_limit_cannot_exceed_hard_ceiling() {
        let fs = LocalFs::new("alice");
        let local = tempfile::tempdir().unwrap();
        assert_eq!(transfer(&fs, &local).with_transfer_limit(u64::MAX).max_bytes, MAX_TRANSFER_BYTES);
        assert_eq!(transfer(&fs, &local).with_transfer_limit(1024).max_bytes, 1024);
    }

    #[test]
    fn test_download_over_ceiling_removes_partial_file() {
        let fs = LocalFs::new("alice");
        std::fs::write(fs.root.path().join("home/alice/big.bin"), [1u8; 17]).unwrap();
        let local = tempfile::tempdir().unwrap();
        let t = transfer(&fs, &local).with_transfer_limit(16).with_chunk_size(4);

        let dest = local.path().join("big.bin");
        let err = t.download("big.bin", dest.to_str().unwrap()).unwrap_err();
        assert!(matches!(err, AppError::TransferSizeExceeded { .. }));
        assert!(!dest.exists());
    }

    #[test]
    fn test_upload_name_is_sanitized() {
        let fs = LocalFs::new("alice");
        let local = tempfile::tempdir().unwrap();
        let t = transfer(&fs, &local);

        let source = local.path().join("report$(whoami).pdf");
        std::fs::write(&source, b"%PDF").unwrap();

        let outcome = t.upload(source.to_str().unwrap(), "/home/alice").unwrap();
        assert_eq!(outcome.remote_path, "/home/alice/report_whoami_.pdf");
        assert!(fs.root.path().join("home/alice/report_whoami_.pdf").exists());
    }

    #[test]
    fn test_invalid_directory_names_never_reach_remote() {
        let fs = LocalFs::new("alice");
        let local = tempfile::tempdir().unwrap();
        let t = transfer(&fs, &local);
        let long = "a".repeat(256);

        for name in ["", "   ", "a/b", "a\\b", "..", "x..y", long.as_str()] {
            assert!(
                matches!(t.create_directory("/home/alice", name), Err(AppError::InvalidName(_))),
                "{name:?} should be rejected"
            );
        }
        assert_eq!(fs.calls.load(Ordering::SeqCst), 0);

        let created = t.create_directory("/home/alice", "  projects ").unwrap();
        assert_eq!(created, "/home/alice/projects");
    }

    #[test]
    fn test_traversal_rejected_before_remote_io() {
        let fs = LocalFs::new("alice");
        let local = tempfile::tempdir().unwrap();
        let t = transfer(&fs, &local);

        for path in ["../bob", "/home/alice/../bob", "docs/../../etc", "/etc/passwd", "/home/alicex"] {
            assert!(
                matches!(t.list_directory(path), Err(AppError::PathTraversalRejected(_))),
                "{path} should be rejected"
            );
        }
        assert!(t.delete("/home/alice/../../root", false).is_err());
        assert_eq!(fs.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_listing_sorts_directories_first() {
        let fs = LocalFs::new("alice");
        let home = fs.root.path().join("home/alice");
        std::fs::write(home.join("b.txt"), b"b").unwrap();
        std::fs::write(home.join("A.txt"), b"a").unwrap();
        std::fs::create_dir(home.join("zeta")).unwrap();
        std::fs::create_dir(home.join("Alpha")).unwrap();
        let local = tempfile::tempdir().unwrap();

        let names: Vec<String> = transfer(&fs, &local)
            .list_directory("")
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["Alpha", "zeta", "A.txt", "b.txt"]);
    }

    #[test]
    fn test_delete_refuses_home() {
        let fs = LocalFs::new("alice");
        let local = tempfile::tempdir().unwrap();
        let t = transfer(&fs, &local);
        assert!(matches!(t.delete("/home/alice/", true), Err(AppError::PathTraversalRejected(_))));
        assert!(matches!(t.delete("", true), Err(AppError::PathTraversalRejected(_))));

        std::fs::write(fs.root.path().join("home/alice/old.log"), b"x").unwrap();
        t.delete("old.log", false).unwrap();
        assert!(!fs.root.path().join("home/alice/old.log").exists());
    }

    #[test]
    fn test_local_path_outside_root_rejected() {
        let fs = LocalFs::new("alice");
        let local = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let outside = other.path().join("stolen.bin");
        let t = transfer(&fs, &local);

        std::fs::write(fs.root.path().join("home/alice/secret"), b"x").unwrap();
        let err = t.download("secret", outside.to_str().unwrap()).unwrap_err();
        assert!(matches!(err, AppError::PathTraversalRejected(_)));
        assert!(!outside.exists());
    }
}
