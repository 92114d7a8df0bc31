use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{
    BackendResult, Backend, Error, FileEntry, FileInfo, ListerAt, Method, ReaderAt, Request,
    WriterAt,
};
use crate::auth::{PERMISSION_FILE_CREATE, PERMISSION_FILE_UPDATE};
use crate::jail::Jail;
use crate::session::SessionContext;

/// Pluggable free-space predicate consulted before every write.
pub type DiskSpacePredicate = Arc<dyn Fn() -> bool + Send + Sync>;

/// Jailed local-filesystem backend. Constructed per session; the session
/// context (identity and permissions) is fixed for the backend's lifetime.
pub struct DiskBackend {
    jail: Jail,
    ctx: Arc<SessionContext>,
    owner: Option<(u32, u32)>,
    has_disk_space: Option<DiskSpacePredicate>,
    // Serializes the stat-then-create window on the write path. Reads do
    // not take this lock.
    write_lock: Mutex<()>,
}

impl DiskBackend {
    pub fn new(root: impl AsRef<Path>, ctx: Arc<SessionContext>) -> std::io::Result<Self> {
        Ok(Self {
            jail: Jail::new(root)?,
            ctx,
            owner: None,
            has_disk_space: None,
            write_lock: Mutex::new(()),
        })
    }

    /// Ownership applied (best effort) to entries created through this
    /// backend.
    pub fn with_owner(mut self, uid: u32, gid: u32) -> Self {
        self.owner = Some((uid, gid));
        self
    }

    pub fn with_disk_space_check(mut self, predicate: DiskSpacePredicate) -> Self {
        self.has_disk_space = Some(predicate);
        self
    }

    pub fn root(&self) -> &Path {
        self.jail.root()
    }

    /// Chown failures leave the entry owned by the server process; the
    /// request still succeeds.
    fn chown_best_effort(&self, path: &Path) {
        if let Some((uid, gid)) = self.owner {
            if let Err(err) = std::os::unix::fs::chown(path, Some(uid), Some(gid)) {
                warn!(path = %path.display(), uid, gid, %err, "error chowning file");
            }
        }
    }

    fn metadata_to_info(metadata: &std::fs::Metadata) -> FileInfo {
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);

        let atime = metadata
            .accessed()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as u32)
            .unwrap_or(mtime);

        FileInfo {
            size: metadata.len(),
            is_dir: metadata.is_dir(),
            mode: metadata.mode(),
            mtime,
            atime,
            uid: metadata.uid(),
            gid: metadata.gid(),
        }
    }
}

#[async_trait]
impl Backend for DiskBackend {
    async fn file_read(&self, req: &Request) -> BackendResult<Box<dyn ReaderAt>> {
        if req.method != Method::Get {
            return Err(Error::OpUnsupported);
        }

        let path = self.jail.join(&req.filepath)?;
        debug!(path = %path.display(), "opening file for reading");

        let metadata = fs::metadata(&path).await.map_err(|_| Error::NoSuchFile)?;
        if metadata.is_dir() {
            return Err(Error::OpUnsupported);
        }

        let file = fs::File::open(&path).await.map_err(|err| {
            warn!(path = %path.display(), %err, "could not open file for reading");
            Error::from_io(&err)
        })?;

        Ok(Box::new(DiskReader {
            file: file.into_std().await,
        }))
    }

    async fn file_write(&self, req: &Request) -> BackendResult<Box<dyn WriterAt>> {
        if req.method != Method::Put && req.method != Method::Open {
            return Err(Error::OpUnsupported);
        }

        let path = self.jail.join(&req.filepath)?;

        if let Some(predicate) = &self.has_disk_space {
            if !predicate() {
                return Err(Error::QuotaExceeded);
            }
        }

        let _guard = self.write_lock.lock().await;

        let file = match fs::metadata(&path).await {
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                // Creating a new entry is gated separately from updating an
                // existing one.
                if !self.ctx.can(PERMISSION_FILE_CREATE) {
                    return Err(Error::PermissionDenied);
                }

                if let Some(parent) = path.parent() {
                    let mut builder = fs::DirBuilder::new();
                    builder.recursive(true).mode(0o755);
                    builder.create(parent).await.map_err(|err| {
                        warn!(path = %path.display(), %err, "error making path for file");
                        Error::Failure
                    })?;
                }

                let file = fs::File::create(&path).await.map_err(|err| {
                    warn!(path = %path.display(), %err, "error creating file");
                    Error::Failure
                })?;

                self.chown_best_effort(&path);
                file
            }
            Ok(metadata) if metadata.is_dir() => {
                warn!(path = %path.display(), "attempted to open a directory for writing");
                return Err(Error::OpUnsupported);
            }
            Ok(_) => {
                if !self.ctx.can(PERMISSION_FILE_UPDATE) {
                    return Err(Error::PermissionDenied);
                }

                let file = fs::File::create(&path).await.map_err(|err| {
                    warn!(path = %path.display(), %err, "error opening existing file");
                    Error::Failure
                })?;

                self.chown_best_effort(&path);
                file
            }
            Err(err) => {
                warn!(path = %path.display(), %err, "error performing file stat");
                return Err(Error::Failure);
            }
        };

        debug!(path = %path.display(), "opened file for writing");

        Ok(Box::new(DiskWriter {
            file: file.into_std().await,
        }))
    }

    async fn file_cmd(&self, req: &Request) -> BackendResult<()> {
        let path = self.jail.join(&req.filepath)?;
        let target = match &req.target {
            Some(target) => Some(self.jail.join(target)?),
            None => None,
        };

        match req.method {
            Method::Setstat => {
                let metadata = fs::metadata(&path).await.map_err(|_| Error::NoSuchFile)?;

                // Use the client-provided mode when it carries permission
                // bits; otherwise fall back to 0644. Directories are always
                // forced to 0755.
                let mut mode = req.attrs.mode.map(|m| m & 0o7777).unwrap_or(0);
                if mode == 0 {
                    mode = 0o644;
                }
                if metadata.is_dir() {
                    mode = 0o755;
                }

                fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))
                    .await
                    .map_err(|err| {
                        warn!(path = %path.display(), %err, "failed to perform setstat");
                        Error::Failure
                    })?;
                return Ok(());
            }
            Method::Rename => {
                let target = target.as_ref().ok_or(Error::NoSuchFile)?;
                fs::rename(&path, target).await.map_err(|err| {
                    warn!(
                        source = %path.display(),
                        target = %target.display(),
                        %err,
                        "failed to rename file",
                    );
                    Error::from_io(&err)
                })?;
            }
            Method::Rmdir => {
                fs::remove_dir_all(&path).await.map_err(|err| {
                    warn!(path = %path.display(), %err, "failed to remove directory");
                    Error::from_io(&err)
                })?;
                return Ok(());
            }
            Method::Mkdir => {
                let mut builder = fs::DirBuilder::new();
                builder.recursive(true).mode(0o755);
                builder.create(&path).await.map_err(|err| {
                    warn!(path = %path.display(), %err, "failed to create directory");
                    Error::Failure
                })?;
            }
            Method::Symlink => {
                let target = target.as_ref().ok_or(Error::NoSuchFile)?;
                fs::symlink(&path, target).await.map_err(|err| {
                    warn!(
                        source = %path.display(),
                        target = %target.display(),
                        %err,
                        "failed to create symlink",
                    );
                    Error::Failure
                })?;
            }
            Method::Remove => {
                fs::remove_file(&path).await.map_err(|err| {
                    if err.kind() != std::io::ErrorKind::NotFound {
                        warn!(path = %path.display(), %err, "failed to remove a file");
                    }
                    Error::from_io(&err)
                })?;
                return Ok(());
            }
            _ => return Err(Error::OpUnsupported),
        }

        // The entry touched by Rename/Mkdir/Symlink is owned by the server
        // process at this point.
        self.chown_best_effort(target.as_deref().unwrap_or(&path));

        Ok(())
    }

    async fn file_list(&self, req: &Request) -> BackendResult<ListerAt> {
        let path = self.jail.join(&req.filepath)?;

        match req.method {
            Method::List => {
                let mut read_dir = fs::read_dir(&path).await.map_err(|err| {
                    debug!(path = %path.display(), %err, "error listing directory");
                    Error::from_io(&err)
                })?;

                let mut entries = Vec::new();
                while let Some(entry) = read_dir.next_entry().await.map_err(|err| {
                    warn!(path = %path.display(), %err, "error reading directory entry");
                    Error::Failure
                })? {
                    let name = entry.file_name().to_string_lossy().to_string();
                    let metadata = match entry.metadata().await {
                        Ok(metadata) => metadata,
                        Err(_) => continue,
                    };
                    entries.push(FileEntry {
                        name,
                        info: Self::metadata_to_info(&metadata),
                    });
                }

                Ok(ListerAt::new(entries))
            }
            Method::Stat => {
                let metadata = fs::metadata(&path).await.map_err(|_| Error::NoSuchFile)?;
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| "/".to_string());

                Ok(ListerAt::single(FileEntry {
                    name,
                    info: Self::metadata_to_info(&metadata),
                }))
            }
            _ => Err(Error::OpUnsupported),
        }
    }

    fn kind(&self) -> &'static str {
        "os"
    }
}

struct DiskReader {
    file: std::fs::File,
}

#[async_trait]
impl ReaderAt for DiskReader {
    async fn read_at(&mut self, offset: u64, len: u32) -> BackendResult<Bytes> {
        use std::os::unix::fs::FileExt;

        let mut buf = vec![0u8; len as usize];
        let mut filled = 0usize;

        while filled < buf.len() {
            match self.file.read_at(&mut buf[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(Error::from_io(&err)),
            }
        }

        buf.truncate(filled);
        Ok(Bytes::from(buf))
    }
}

struct DiskWriter {
    file: std::fs::File,
}

#[async_trait]
impl WriterAt for DiskWriter {
    async fn write_at(&mut self, offset: u64, data: Bytes) -> BackendResult<()> {
        use std::os::unix::fs::FileExt;

        self.file
            .write_all_at(&data, offset)
            .map_err(|err| Error::from_io(&err))
    }

    async fn close(&mut self) -> BackendResult<()> {
        self.file.sync_all().map_err(|err| Error::from_io(&err))
    }
}
