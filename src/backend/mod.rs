use async_trait::async_trait;
use bytes::Bytes;
use russh_sftp::protocol::StatusCode;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod local;
pub mod memory;
pub mod notify;
pub mod readonly;
pub mod registry;
pub mod s3;
pub mod staged;

pub use local::DiskBackend;
pub use memory::MemoryBackend;
pub use notify::NotifyBackend;
pub use readonly::ReadOnlyBackend;
pub use s3::{S3Backend, S3Options};
pub use staged::StagedBackend;

pub type BackendResult<T> = Result<T, Error>;

/// The only errors allowed to cross the backend boundary. Internal causes
/// (I/O, network, SDK) are classified into one of these before surfacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("permission denied")]
    PermissionDenied,
    #[error("no such file")]
    NoSuchFile,
    #[error("operation unsupported")]
    OpUnsupported,
    #[error("quota exceeded")]
    QuotaExceeded,
    #[error("failure")]
    Failure,
}

impl From<Error> for StatusCode {
    fn from(err: Error) -> Self {
        match err {
            Error::PermissionDenied => StatusCode::PermissionDenied,
            Error::NoSuchFile => StatusCode::NoSuchFile,
            Error::OpUnsupported => StatusCode::OpUnsupported,
            // SFTP v3 has no quota status code
            Error::QuotaExceeded => StatusCode::Failure,
            Error::Failure => StatusCode::Failure,
        }
    }
}

impl Error {
    pub fn from_io(err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Error::NoSuchFile,
            std::io::ErrorKind::PermissionDenied => Error::PermissionDenied,
            _ => Error::Failure,
        }
    }
}

/// SFTP operation discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Put,
    Open,
    Setstat,
    Rename,
    Rmdir,
    Mkdir,
    Remove,
    Symlink,
    List,
    Stat,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "Get",
            Method::Put => "Put",
            Method::Open => "Open",
            Method::Setstat => "Setstat",
            Method::Rename => "Rename",
            Method::Rmdir => "Rmdir",
            Method::Mkdir => "Mkdir",
            Method::Remove => "Remove",
            Method::Symlink => "Symlink",
            Method::List => "List",
            Method::Stat => "Stat",
        }
    }
}

/// Attributes supplied by the client on open and setstat requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReqAttrs {
    pub size: Option<u64>,
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub atime: Option<u32>,
    pub mtime: Option<u32>,
}

/// An inbound filesystem operation, decoded from the wire by the SFTP
/// handler and routed through the per-session façade.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub filepath: String,
    pub target: Option<String>,
    pub attrs: ReqAttrs,
}

impl Request {
    pub fn new(method: Method, filepath: impl Into<String>) -> Self {
        Self {
            method,
            filepath: filepath.into(),
            target: None,
            attrs: ReqAttrs::default(),
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_attrs(mut self, attrs: ReqAttrs) -> Self {
        self.attrs = attrs;
        self
    }
}

/// File metadata information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInfo {
    pub size: u64,
    pub is_dir: bool,
    /// Full unix mode including the file-type bits.
    pub mode: u32,
    pub mtime: u32,
    pub atime: u32,
    pub uid: u32,
    pub gid: u32,
}

impl FileInfo {
    pub fn directory() -> Self {
        Self::directory_with_mtime(current_timestamp())
    }

    pub fn directory_with_mtime(mtime: u32) -> Self {
        Self {
            size: 4096,
            is_dir: true,
            mode: 0o040_755,
            mtime,
            atime: mtime,
            uid: 0,
            gid: 0,
        }
    }

    pub fn file(size: u64) -> Self {
        Self::file_with_mtime(size, current_timestamp())
    }

    pub fn file_with_mtime(size: u64, mtime: u32) -> Self {
        Self {
            size,
            is_dir: false,
            mode: 0o100_644,
            mtime,
            atime: mtime,
            uid: 0,
            gid: 0,
        }
    }
}

/// A named directory entry or stat result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
    pub info: FileInfo,
}

/// Positioned lister consumed by the SFTP handler: copies entries starting
/// at an offset and reports end-of-stream alongside the copied slice.
#[derive(Debug, Clone, Default)]
pub struct ListerAt(Vec<FileEntry>);

impl ListerAt {
    pub fn new(entries: Vec<FileEntry>) -> Self {
        Self(entries)
    }

    pub fn single(entry: FileEntry) -> Self {
        Self(vec![entry])
    }

    /// Copies up to `max` entries starting at `offset`. The flag reports
    /// whether the end of the listing was reached.
    pub fn list_at(&self, max: usize, offset: u64) -> (Vec<FileEntry>, bool) {
        let offset = offset as usize;
        if offset >= self.0.len() {
            return (Vec::new(), true);
        }

        let end = (offset + max).min(self.0.len());
        (self.0[offset..end].to_vec(), end == self.0.len())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Positioned byte reader backing an open `Get` handle. An empty buffer
/// signals end-of-file.
#[async_trait]
pub trait ReaderAt: Send + Sync {
    async fn read_at(&mut self, offset: u64, len: u32) -> BackendResult<Bytes>;
}

/// Positioned byte writer backing an open `Put`/`Open` handle.
#[async_trait]
pub trait WriterAt: Send + Sync {
    async fn write_at(&mut self, offset: u64, data: Bytes) -> BackendResult<()>;

    /// Flushes buffered data and finalizes the handle. Called exactly once,
    /// when the client closes the handle.
    async fn close(&mut self) -> BackendResult<()>;
}

/// Abstract filesystem contract implemented by storage backends and
/// decorators. Backends are constructed per channel with an immutable
/// session context, so no request can observe a partially configured
/// instance.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Opens a positioned reader. Valid only for `Get`.
    async fn file_read(&self, req: &Request) -> BackendResult<Box<dyn ReaderAt>>;

    /// Opens a positioned writer. Valid for `Put` (create) and for `Open`
    /// on an existing regular file.
    async fn file_write(&self, req: &Request) -> BackendResult<Box<dyn WriterAt>>;

    /// Executes a metadata operation: `Setstat`, `Rename`, `Rmdir`,
    /// `Mkdir`, `Symlink` or `Remove`.
    async fn file_cmd(&self, req: &Request) -> BackendResult<()>;

    /// Lists a directory (`List`) or stats a single path (`Stat`).
    async fn file_list(&self, req: &Request) -> BackendResult<ListerAt>;

    /// Short backend kind label used in log records.
    fn kind(&self) -> &'static str;
}

/// Get current Unix timestamp
pub fn current_timestamp() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}
