use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{BackendResult, Backend, Error, ListerAt, Method, ReaderAt, Request, WriterAt};

/// Chunk size used when replaying a staged file into the destination.
const REPLICATE_CHUNK: usize = 1024 * 1024;

/// Sync-and-delete decorator: uploads first land in a local staging area,
/// are replicated to the destination backend when the handle closes, and
/// are removed from the staging area on success. Bridges backends whose
/// write paths are not POSIX-streamable.
pub struct StagedBackend {
    destination: Arc<dyn Backend>,
    staging: PathBuf,
}

impl StagedBackend {
    /// `directory` overrides the staging area; by default a private
    /// directory is created under the system temp root.
    pub fn new(destination: Box<dyn Backend>, directory: Option<PathBuf>) -> std::io::Result<Self> {
        let staging = directory
            .unwrap_or_else(|| std::env::temp_dir().join(format!("staged-{}", Uuid::new_v4())));
        std::fs::create_dir_all(&staging)?;

        Ok(Self {
            destination: Arc::from(destination),
            staging,
        })
    }

    pub fn staging_dir(&self) -> &PathBuf {
        &self.staging
    }
}

#[async_trait]
impl Backend for StagedBackend {
    async fn file_read(&self, req: &Request) -> BackendResult<Box<dyn ReaderAt>> {
        self.destination.file_read(req).await
    }

    async fn file_write(&self, req: &Request) -> BackendResult<Box<dyn WriterAt>> {
        if req.method != Method::Put && req.method != Method::Open {
            return Err(Error::OpUnsupported);
        }

        let staged = self.staging.join(Uuid::new_v4().to_string());
        let file = std::fs::File::create(&staged).map_err(|err| {
            warn!(path = %staged.display(), %err, "error creating staging file");
            Error::Failure
        })?;

        debug!(path = %staged.display(), filepath = %req.filepath, "staging upload");

        Ok(Box::new(StagedWriter {
            staged,
            file: Some(file),
            request: req.clone(),
            destination: self.destination.clone(),
        }))
    }

    async fn file_cmd(&self, req: &Request) -> BackendResult<()> {
        self.destination.file_cmd(req).await
    }

    async fn file_list(&self, req: &Request) -> BackendResult<ListerAt> {
        self.destination.file_list(req).await
    }

    fn kind(&self) -> &'static str {
        self.destination.kind()
    }
}

struct StagedWriter {
    staged: PathBuf,
    file: Option<std::fs::File>,
    request: Request,
    destination: Arc<dyn Backend>,
}

impl StagedWriter {
    async fn replicate(&mut self) -> BackendResult<()> {
        let staged = tokio::fs::File::open(&self.staged).await.map_err(|err| {
            warn!(path = %self.staged.display(), %err, "error reopening staged file");
            Error::Failure
        })?;
        let mut staged = staged.into_std().await;

        let mut writer = self.destination.file_write(&self.request).await?;
        let mut offset = 0u64;
        let mut buf = vec![0u8; REPLICATE_CHUNK];

        loop {
            use std::io::Read;
            let n = staged.read(&mut buf).map_err(|err| {
                warn!(path = %self.staged.display(), %err, "error reading staged file");
                Error::Failure
            })?;
            if n == 0 {
                break;
            }
            writer
                .write_at(offset, Bytes::copy_from_slice(&buf[..n]))
                .await?;
            offset += n as u64;
        }

        writer.close().await
    }
}

#[async_trait]
impl WriterAt for StagedWriter {
    async fn write_at(&mut self, offset: u64, data: Bytes) -> BackendResult<()> {
        use std::os::unix::fs::FileExt;

        let file = self.file.as_ref().ok_or(Error::Failure)?;
        file.write_all_at(&data, offset)
            .map_err(|err| Error::from_io(&err))
    }

    async fn close(&mut self) -> BackendResult<()> {
        // Drop the write handle before replaying the staged bytes.
        self.file.take();

        self.replicate().await?;

        if let Err(err) = tokio::fs::remove_file(&self.staged).await {
            warn!(path = %self.staged.display(), %err, "error removing staged file");
        }

        debug!(
            path = %self.staged.display(),
            filepath = %self.request.filepath,
            "staged upload replicated",
        );

        Ok(())
    }
}
