use async_trait::async_trait;
use tracing::info;

use super::{BackendResult, Backend, Error, ListerAt, ReaderAt, Request, WriterAt};

/// Observing decorator: emits one structured record per operation with the
/// method, paths and outcome, then forwards the original result unchanged.
pub struct NotifyBackend {
    inner: Box<dyn Backend>,
}

impl NotifyBackend {
    pub fn new(inner: Box<dyn Backend>) -> Self {
        Self { inner }
    }

    fn record(&self, req: &Request, error: Option<&Error>) {
        info!(
            backend = self.inner.kind(),
            method = req.method.as_str(),
            path = %req.filepath,
            target = req.target.as_deref().unwrap_or(""),
            error = error.map(|e| e.to_string()).unwrap_or_default(),
            "filesystem operation",
        );
    }
}

#[async_trait]
impl Backend for NotifyBackend {
    async fn file_read(&self, req: &Request) -> BackendResult<Box<dyn ReaderAt>> {
        let result = self.inner.file_read(req).await;
        self.record(req, result.as_ref().err());
        result
    }

    async fn file_write(&self, req: &Request) -> BackendResult<Box<dyn WriterAt>> {
        let result = self.inner.file_write(req).await;
        self.record(req, result.as_ref().err());
        result
    }

    async fn file_cmd(&self, req: &Request) -> BackendResult<()> {
        let result = self.inner.file_cmd(req).await;
        self.record(req, result.as_ref().err());
        result
    }

    async fn file_list(&self, req: &Request) -> BackendResult<ListerAt> {
        let result = self.inner.file_list(req).await;
        self.record(req, result.as_ref().err());
        result
    }

    fn kind(&self) -> &'static str {
        self.inner.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryBackend, Method};

    #[tokio::test]
    async fn results_are_forwarded_unmodified() {
        let backend = NotifyBackend::new(Box::new(MemoryBackend::new()));

        assert_eq!(
            backend
                .file_list(&Request::new(Method::Stat, "/ghost"))
                .await
                .map(|_| ())
                .unwrap_err(),
            Error::NoSuchFile
        );

        backend
            .file_cmd(&Request::new(Method::Mkdir, "/dir"))
            .await
            .unwrap();
        assert!(backend
            .file_list(&Request::new(Method::Stat, "/dir"))
            .await
            .is_ok());
    }
}
