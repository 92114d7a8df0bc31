use async_trait::async_trait;

use super::{BackendResult, Backend, Error, ListerAt, ReaderAt, Request, WriterAt};

/// Decorator that refuses every mutation with `OpUnsupported` while
/// passing reads and listings through to the wrapped backend.
pub struct ReadOnlyBackend {
    inner: Box<dyn Backend>,
}

impl ReadOnlyBackend {
    pub fn new(inner: Box<dyn Backend>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Backend for ReadOnlyBackend {
    async fn file_read(&self, req: &Request) -> BackendResult<Box<dyn ReaderAt>> {
        self.inner.file_read(req).await
    }

    async fn file_write(&self, _req: &Request) -> BackendResult<Box<dyn WriterAt>> {
        Err(Error::OpUnsupported)
    }

    async fn file_cmd(&self, _req: &Request) -> BackendResult<()> {
        Err(Error::OpUnsupported)
    }

    async fn file_list(&self, req: &Request) -> BackendResult<ListerAt> {
        self.inner.file_list(req).await
    }

    fn kind(&self) -> &'static str {
        self.inner.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryBackend, Method};
    use bytes::Bytes;

    async fn seeded() -> ReadOnlyBackend {
        let inner = MemoryBackend::new();
        let mut writer = inner
            .file_write(&Request::new(Method::Put, "/file.txt"))
            .await
            .unwrap();
        writer.write_at(0, Bytes::from_static(b"data")).await.unwrap();
        writer.close().await.unwrap();
        ReadOnlyBackend::new(Box::new(inner))
    }

    #[tokio::test]
    async fn every_mutation_is_unsupported() {
        let backend = seeded().await;

        assert_eq!(
            backend
                .file_write(&Request::new(Method::Put, "/x"))
                .await
                .map(|_| ())
                .unwrap_err(),
            Error::OpUnsupported
        );

        for method in [
            Method::Setstat,
            Method::Rename,
            Method::Rmdir,
            Method::Mkdir,
            Method::Remove,
            Method::Symlink,
        ] {
            assert_eq!(
                backend
                    .file_cmd(&Request::new(method, "/file.txt").with_target("/y"))
                    .await
                    .unwrap_err(),
                Error::OpUnsupported,
                "{method:?} should be refused"
            );
        }
    }

    #[tokio::test]
    async fn reads_and_listings_pass_through() {
        let backend = seeded().await;

        let mut reader = backend
            .file_read(&Request::new(Method::Get, "/file.txt"))
            .await
            .unwrap();
        assert_eq!(reader.read_at(0, 16).await.unwrap().as_ref(), b"data");

        let lister = backend
            .file_list(&Request::new(Method::List, "/"))
            .await
            .unwrap();
        assert_eq!(lister.len(), 1);
    }
}
