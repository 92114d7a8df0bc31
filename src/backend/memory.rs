use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;
use std::sync::Arc;

use super::{
    current_timestamp, BackendResult, Backend, Error, FileEntry, FileInfo, ListerAt, Method,
    ReaderAt, Request, WriterAt,
};
use crate::jail::clean_client_path;

const KEEP_MARKER: &str = ".keep";

#[derive(Debug, Clone)]
struct FileData {
    content: Bytes,
    mtime: u32,
}

/// In-memory storage backend for testing and development. Directories are
/// emulated with key prefixes and `.keep` markers, mirroring the
/// object-store layout.
pub struct MemoryBackend {
    files: Arc<RwLock<HashMap<String, FileData>>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            files: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Normalized relative key for a client path ("" is the root).
    fn key(path: &str) -> BackendResult<String> {
        let cleaned = clean_client_path(path).ok_or(Error::NoSuchFile)?;
        Ok(cleaned.trim_start_matches('/').to_string())
    }

    fn is_dir(files: &HashMap<String, FileData>, key: &str) -> bool {
        if key.is_empty() {
            return true;
        }
        let prefix = format!("{key}/");
        files.keys().any(|k| k.starts_with(&prefix))
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn file_read(&self, req: &Request) -> BackendResult<Box<dyn ReaderAt>> {
        if req.method != Method::Get {
            return Err(Error::OpUnsupported);
        }

        let key = Self::key(&req.filepath)?;
        let files = self.files.read();

        if Self::is_dir(&files, &key) {
            return Err(Error::OpUnsupported);
        }

        let data = files.get(&key).ok_or(Error::NoSuchFile)?;
        Ok(Box::new(MemReader {
            content: data.content.clone(),
        }))
    }

    async fn file_write(&self, req: &Request) -> BackendResult<Box<dyn WriterAt>> {
        if req.method != Method::Put && req.method != Method::Open {
            return Err(Error::OpUnsupported);
        }

        let key = Self::key(&req.filepath)?;
        {
            let files = self.files.read();
            if Self::is_dir(&files, &key) {
                return Err(Error::OpUnsupported);
            }
            if req.method == Method::Open && !files.contains_key(&key) {
                return Err(Error::NoSuchFile);
            }
        }

        Ok(Box::new(MemWriter {
            key,
            buffer: BytesMut::new(),
            files: self.files.clone(),
        }))
    }

    async fn file_cmd(&self, req: &Request) -> BackendResult<()> {
        let key = Self::key(&req.filepath)?;

        match req.method {
            Method::Setstat => Ok(()),
            Method::Mkdir => {
                self.files.write().insert(
                    format!("{key}/{KEEP_MARKER}"),
                    FileData {
                        content: Bytes::new(),
                        mtime: current_timestamp(),
                    },
                );
                Ok(())
            }
            Method::Rmdir => {
                let prefix = format!("{key}/");
                let mut files = self.files.write();
                let doomed: Vec<String> = files
                    .keys()
                    .filter(|k| k.starts_with(&prefix))
                    .cloned()
                    .collect();
                if doomed.is_empty() {
                    return Err(Error::NoSuchFile);
                }
                for k in doomed {
                    files.remove(&k);
                }
                Ok(())
            }
            Method::Remove => {
                let mut files = self.files.write();
                files.remove(&key).map(|_| ()).ok_or(Error::NoSuchFile)
            }
            Method::Rename => {
                let target = req.target.as_deref().ok_or(Error::NoSuchFile)?;
                let target_key = Self::key(target)?;
                let mut files = self.files.write();

                if let Some(data) = files.remove(&key) {
                    files.insert(target_key, data);
                    return Ok(());
                }

                let prefix = format!("{key}/");
                let moved: Vec<String> = files
                    .keys()
                    .filter(|k| k.starts_with(&prefix))
                    .cloned()
                    .collect();
                if moved.is_empty() {
                    return Err(Error::NoSuchFile);
                }
                for old in moved {
                    let new = format!("{target_key}/{}", &old[prefix.len()..]);
                    if let Some(data) = files.remove(&old) {
                        files.insert(new, data);
                    }
                }
                Ok(())
            }
            Method::Symlink => Err(Error::OpUnsupported),
            _ => Err(Error::OpUnsupported),
        }
    }

    async fn file_list(&self, req: &Request) -> BackendResult<ListerAt> {
        let key = Self::key(&req.filepath)?;
        let files = self.files.read();

        match req.method {
            Method::List => {
                if !Self::is_dir(&files, &key) {
                    return Err(Error::NoSuchFile);
                }

                let prefix = if key.is_empty() {
                    String::new()
                } else {
                    format!("{key}/")
                };

                let mut seen = HashSet::new();
                let mut entries = Vec::new();

                for (k, data) in files.iter() {
                    let relative = match k.strip_prefix(&prefix) {
                        Some(rel) if !rel.is_empty() => rel,
                        _ => continue,
                    };

                    let name = relative.split('/').next().unwrap_or(relative);
                    if name == KEEP_MARKER || !seen.insert(name.to_string()) {
                        continue;
                    }

                    let info = if relative.contains('/') {
                        FileInfo::directory_with_mtime(data.mtime)
                    } else {
                        FileInfo::file_with_mtime(data.content.len() as u64, data.mtime)
                    };

                    entries.push(FileEntry {
                        name: name.to_string(),
                        info,
                    });
                }

                Ok(ListerAt::new(entries))
            }
            Method::Stat => {
                if key.is_empty() {
                    return Ok(ListerAt::single(FileEntry {
                        name: "/".to_string(),
                        info: FileInfo::directory(),
                    }));
                }

                let name = key.rsplit('/').next().unwrap_or(&key).to_string();

                if let Some(data) = files.get(&key) {
                    return Ok(ListerAt::single(FileEntry {
                        name,
                        info: FileInfo::file_with_mtime(data.content.len() as u64, data.mtime),
                    }));
                }

                if Self::is_dir(&files, &key) {
                    return Ok(ListerAt::single(FileEntry {
                        name,
                        info: FileInfo::directory(),
                    }));
                }

                Err(Error::NoSuchFile)
            }
            _ => Err(Error::OpUnsupported),
        }
    }

    fn kind(&self) -> &'static str {
        "memory"
    }
}

struct MemReader {
    content: Bytes,
}

#[async_trait]
impl ReaderAt for MemReader {
    async fn read_at(&mut self, offset: u64, len: u32) -> BackendResult<Bytes> {
        let start = offset as usize;
        if start >= self.content.len() {
            return Ok(Bytes::new());
        }
        let end = (start + len as usize).min(self.content.len());
        Ok(self.content.slice(start..end))
    }
}

struct MemWriter {
    key: String,
    buffer: BytesMut,
    files: Arc<RwLock<HashMap<String, FileData>>>,
}

#[async_trait]
impl WriterAt for MemWriter {
    async fn write_at(&mut self, offset: u64, data: Bytes) -> BackendResult<()> {
        let start = offset as usize;
        let end = start + data.len();
        if end > self.buffer.len() {
            self.buffer.resize(end, 0);
        }
        self.buffer[start..end].copy_from_slice(&data);
        Ok(())
    }

    async fn close(&mut self) -> BackendResult<()> {
        self.files.write().insert(
            self.key.clone(),
            FileData {
                content: self.buffer.split().freeze(),
                mtime: current_timestamp(),
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn put(backend: &MemoryBackend, path: &str, content: &[u8]) {
        let mut writer = backend
            .file_write(&Request::new(Method::Put, path))
            .await
            .unwrap();
        writer
            .write_at(0, Bytes::copy_from_slice(content))
            .await
            .unwrap();
        writer.close().await.unwrap();
    }

    #[tokio::test]
    async fn write_then_read() {
        let backend = MemoryBackend::new();
        put(&backend, "/hello.txt", b"hi").await;

        let mut reader = backend
            .file_read(&Request::new(Method::Get, "/hello.txt"))
            .await
            .unwrap();
        assert_eq!(reader.read_at(0, 16).await.unwrap().as_ref(), b"hi");
        assert!(reader.read_at(2, 16).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn open_requires_existing_file() {
        let backend = MemoryBackend::new();
        let err = backend
            .file_write(&Request::new(Method::Open, "/ghost"))
            .await
            .map(|_| ())
            .unwrap_err();
        assert_eq!(err, Error::NoSuchFile);
    }

    #[tokio::test]
    async fn mkdir_list_rmdir() {
        let backend = MemoryBackend::new();
        backend
            .file_cmd(&Request::new(Method::Mkdir, "/sub"))
            .await
            .unwrap();

        let lister = backend
            .file_list(&Request::new(Method::List, "/"))
            .await
            .unwrap();
        let (entries, _) = lister.list_at(16, 0);
        assert!(entries.iter().any(|e| e.name == "sub" && e.info.is_dir));

        backend
            .file_cmd(&Request::new(Method::Rmdir, "/sub"))
            .await
            .unwrap();
        let lister = backend
            .file_list(&Request::new(Method::List, "/"))
            .await
            .unwrap();
        assert!(lister.is_empty());
    }

    #[tokio::test]
    async fn rename_file_and_stat() {
        let backend = MemoryBackend::new();
        put(&backend, "/a", b"data").await;

        backend
            .file_cmd(&Request::new(Method::Rename, "/a").with_target("/b"))
            .await
            .unwrap();

        assert_eq!(
            backend
                .file_list(&Request::new(Method::Stat, "/a"))
                .await
                .map(|_| ())
                .unwrap_err(),
            Error::NoSuchFile
        );
        assert!(backend
            .file_list(&Request::new(Method::Stat, "/b"))
            .await
            .is_ok());
    }
}
