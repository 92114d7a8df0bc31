use std::collections::HashMap;

use bytes::Bytes;
use russh_sftp::protocol::{
    Attrs, Data, File, FileAttributes, Handle, Name, OpenFlags, Status, StatusCode, Version,
};
use tracing::debug;

use crate::backend::{FileInfo, Method, ReqAttrs, Request};
use crate::handle::{HandleEntry, HandleMap};
use crate::jail::clean_client_path;
use crate::session::SessionFs;

/// Entries returned per READDIR round-trip.
const READDIR_CHUNK: usize = 128;

fn to_file_attributes(info: &FileInfo) -> FileAttributes {
    FileAttributes {
        size: Some(info.size),
        permissions: Some(info.mode),
        mtime: Some(info.mtime),
        atime: Some(info.atime),
        uid: Some(info.uid),
        gid: Some(info.gid),
        ..Default::default()
    }
}

fn to_req_attrs(attrs: &FileAttributes) -> ReqAttrs {
    ReqAttrs {
        size: attrs.size,
        mode: attrs.permissions,
        uid: attrs.uid,
        gid: attrs.gid,
        atime: attrs.atime,
        mtime: attrs.mtime,
    }
}

fn ok_status(id: u32) -> Status {
    Status {
        id,
        status_code: StatusCode::Ok,
        error_message: "Ok".to_string(),
        language_tag: "en".to_string(),
    }
}

/// Translates SFTP protocol messages into filesystem requests against the
/// per-session façade. One handler exists per channel; requests on a
/// channel are served in arrival order by the framing library.
pub struct SftpHandler {
    fs: SessionFs,
    handles: HandleMap,
}

impl SftpHandler {
    pub fn new(fs: SessionFs) -> Self {
        Self {
            fs,
            handles: HandleMap::new(),
        }
    }

    async fn stat_entry(&self, path: &str) -> Result<Attrs, StatusCode> {
        let lister = self.fs.list(&Request::new(Method::Stat, path)).await?;
        let (entries, _) = lister.list_at(1, 0);
        let entry = entries.into_iter().next().ok_or(StatusCode::NoSuchFile)?;

        Ok(Attrs {
            id: 0,
            attrs: to_file_attributes(&entry.info),
        })
    }
}

impl russh_sftp::server::Handler for SftpHandler {
    type Error = StatusCode;

    fn unimplemented(&self) -> Self::Error {
        StatusCode::OpUnsupported
    }

    async fn init(
        &mut self,
        version: u32,
        _extensions: HashMap<String, String>,
    ) -> Result<Version, Self::Error> {
        debug!(version, session = %self.fs.context().id, "SFTP init");
        Ok(Version::new())
    }

    async fn open(
        &mut self,
        id: u32,
        filename: String,
        pflags: OpenFlags,
        attrs: FileAttributes,
    ) -> Result<Handle, Self::Error> {
        debug!(id, path = %filename, ?pflags, "opening file");

        let handle = if pflags.contains(OpenFlags::WRITE) || pflags.contains(OpenFlags::APPEND) {
            let method = if pflags.contains(OpenFlags::CREATE) {
                Method::Put
            } else {
                Method::Open
            };
            let req = Request::new(method, &filename).with_attrs(to_req_attrs(&attrs));
            let writer = self.fs.write(&req).await?;
            self.handles.insert(HandleEntry::Write {
                path: filename,
                writer,
            })
        } else {
            let reader = self.fs.read(&Request::new(Method::Get, &filename)).await?;
            self.handles.insert(HandleEntry::Read {
                path: filename,
                reader,
            })
        };

        Ok(Handle { id, handle })
    }

    async fn close(&mut self, id: u32, handle: String) -> Result<Status, Self::Error> {
        debug!(id, %handle, "closing handle");

        match self.handles.remove(&handle) {
            Some(HandleEntry::Write { mut writer, .. }) => {
                writer.close().await?;
            }
            Some(_) => {}
            None => return Err(StatusCode::Failure),
        }

        Ok(ok_status(id))
    }

    async fn read(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        len: u32,
    ) -> Result<Data, Self::Error> {
        let entry = self.handles.get_mut(&handle).ok_or(StatusCode::Failure)?;

        match entry {
            HandleEntry::Read { reader, .. } => {
                let chunk = reader.read_at(offset, len).await?;
                if chunk.is_empty() {
                    return Err(StatusCode::Eof);
                }
                Ok(Data {
                    id,
                    data: chunk.to_vec(),
                })
            }
            _ => Err(StatusCode::Failure),
        }
    }

    async fn write(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<Status, Self::Error> {
        let entry = self.handles.get_mut(&handle).ok_or(StatusCode::Failure)?;

        match entry {
            HandleEntry::Write { writer, .. } => {
                writer.write_at(offset, Bytes::from(data)).await?;
                Ok(ok_status(id))
            }
            _ => Err(StatusCode::Failure),
        }
    }

    async fn opendir(&mut self, id: u32, path: String) -> Result<Handle, Self::Error> {
        debug!(id, %path, "opening directory");

        let lister = self.fs.list(&Request::new(Method::List, &path)).await?;
        let handle = self.handles.insert(HandleEntry::Dir {
            path,
            lister,
            offset: 0,
        });

        Ok(Handle { id, handle })
    }

    async fn readdir(&mut self, id: u32, handle: String) -> Result<Name, Self::Error> {
        let entry = self.handles.get_mut(&handle).ok_or(StatusCode::Failure)?;

        match entry {
            HandleEntry::Dir { lister, offset, .. } => {
                let (copied, _eof) = lister.list_at(READDIR_CHUNK, *offset);
                if copied.is_empty() {
                    return Err(StatusCode::Eof);
                }
                *offset += copied.len() as u64;

                let files = copied
                    .into_iter()
                    .map(|entry| File {
                        filename: entry.name,
                        longname: String::new(),
                        attrs: to_file_attributes(&entry.info),
                    })
                    .collect();

                Ok(Name { id, files })
            }
            _ => Err(StatusCode::Failure),
        }
    }

    async fn stat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let mut attrs = self.stat_entry(&path).await?;
        attrs.id = id;
        Ok(attrs)
    }

    async fn lstat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        // Symlinks are not followed outside the jail; plain stat semantics.
        self.stat(id, path).await
    }

    async fn fstat(&mut self, id: u32, handle: String) -> Result<Attrs, Self::Error> {
        let path = match self.handles.get(&handle) {
            Some(HandleEntry::Dir { .. }) => {
                return Ok(Attrs {
                    id,
                    attrs: to_file_attributes(&FileInfo::directory()),
                });
            }
            Some(entry) => entry.path().to_string(),
            None => return Err(StatusCode::Failure),
        };

        match self.stat_entry(&path).await {
            Ok(mut attrs) => {
                attrs.id = id;
                Ok(attrs)
            }
            // An in-flight upload may not be visible in the backend yet.
            Err(StatusCode::NoSuchFile) => Ok(Attrs {
                id,
                attrs: to_file_attributes(&FileInfo::file(0)),
            }),
            Err(err) => Err(err),
        }
    }

    async fn setstat(
        &mut self,
        id: u32,
        path: String,
        attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        let req = Request::new(Method::Setstat, &path).with_attrs(to_req_attrs(&attrs));
        self.fs.cmd(&req).await?;
        Ok(ok_status(id))
    }

    async fn fsetstat(
        &mut self,
        id: u32,
        handle: String,
        attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        let path = self
            .handles
            .get(&handle)
            .map(|entry| entry.path().to_string())
            .ok_or(StatusCode::Failure)?;
        self.setstat(id, path, attrs).await
    }

    async fn realpath(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        let resolved = clean_client_path(&path).ok_or(StatusCode::NoSuchFile)?;

        Ok(Name {
            id,
            files: vec![File::dummy(&resolved)],
        })
    }

    async fn mkdir(
        &mut self,
        id: u32,
        path: String,
        attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        let req = Request::new(Method::Mkdir, &path).with_attrs(to_req_attrs(&attrs));
        self.fs.cmd(&req).await?;
        Ok(ok_status(id))
    }

    async fn rmdir(&mut self, id: u32, path: String) -> Result<Status, Self::Error> {
        self.fs.cmd(&Request::new(Method::Rmdir, &path)).await?;
        Ok(ok_status(id))
    }

    async fn remove(&mut self, id: u32, filename: String) -> Result<Status, Self::Error> {
        self.fs.cmd(&Request::new(Method::Remove, &filename)).await?;
        Ok(ok_status(id))
    }

    async fn rename(
        &mut self,
        id: u32,
        oldpath: String,
        newpath: String,
    ) -> Result<Status, Self::Error> {
        let req = Request::new(Method::Rename, &oldpath).with_target(&newpath);
        self.fs.cmd(&req).await?;
        Ok(ok_status(id))
    }

    async fn symlink(
        &mut self,
        id: u32,
        linkpath: String,
        targetpath: String,
    ) -> Result<Status, Self::Error> {
        // The link is created at `linkpath` pointing to `targetpath`.
        let req = Request::new(Method::Symlink, &targetpath).with_target(&linkpath);
        self.fs.cmd(&req).await?;
        Ok(ok_status(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{PermissionSet, PERMISSION_FILE_READ};
    use crate::backend::MemoryBackend;
    use crate::session::SessionContext;
    use russh_sftp::server::Handler;
    use std::sync::Arc;

    fn handler_with(perms: PermissionSet) -> SftpHandler {
        let ctx = Arc::new(SessionContext::new("session", "test", perms));
        SftpHandler::new(SessionFs::new(Box::new(MemoryBackend::new()), ctx))
    }

    fn wildcard_handler() -> SftpHandler {
        handler_with(PermissionSet::wildcard())
    }

    async fn put(handler: &mut SftpHandler, path: &str, content: &[u8]) {
        let open = handler
            .open(
                1,
                path.to_string(),
                OpenFlags::WRITE | OpenFlags::CREATE,
                FileAttributes::default(),
            )
            .await
            .unwrap();
        handler
            .write(2, open.handle.clone(), 0, content.to_vec())
            .await
            .unwrap();
        handler.close(3, open.handle).await.unwrap();
    }

    async fn get(handler: &mut SftpHandler, path: &str) -> Result<Vec<u8>, StatusCode> {
        let open = handler
            .open(4, path.to_string(), OpenFlags::READ, FileAttributes::default())
            .await?;

        let mut out = Vec::new();
        let mut offset = 0u64;
        loop {
            match handler.read(5, open.handle.clone(), offset, 32 * 1024).await {
                Ok(data) => {
                    offset += data.data.len() as u64;
                    out.extend_from_slice(&data.data);
                }
                Err(StatusCode::Eof) => break,
                Err(err) => return Err(err),
            }
        }

        handler.close(6, open.handle).await?;
        Ok(out)
    }

    #[tokio::test]
    async fn put_then_get_round_trip() {
        let mut handler = wildcard_handler();
        put(&mut handler, "/hello.txt", b"hi").await;
        assert_eq!(get(&mut handler, "/hello.txt").await.unwrap(), b"hi");
    }

    #[tokio::test]
    async fn read_only_session_cannot_upload() {
        let mut handler =
            handler_with(PermissionSet::new(vec![PERMISSION_FILE_READ.to_string()]));

        let err = handler
            .open(
                1,
                "/x".to_string(),
                OpenFlags::WRITE | OpenFlags::CREATE,
                FileAttributes::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err, StatusCode::PermissionDenied);
    }

    #[tokio::test]
    async fn readdir_pages_and_terminates_with_eof() {
        let mut handler = wildcard_handler();
        put(&mut handler, "/a.txt", b"1").await;
        put(&mut handler, "/b.txt", b"2").await;

        let open = handler.opendir(1, "/".to_string()).await.unwrap();
        let name = handler.readdir(2, open.handle.clone()).await.unwrap();
        assert_eq!(name.files.len(), 2);

        assert_eq!(
            handler.readdir(3, open.handle.clone()).await.unwrap_err(),
            StatusCode::Eof
        );
        handler.close(4, open.handle).await.unwrap();
    }

    #[tokio::test]
    async fn stat_missing_path_is_no_such_file() {
        let mut handler = wildcard_handler();
        assert_eq!(
            handler.stat(1, "/ghost".to_string()).await.unwrap_err(),
            StatusCode::NoSuchFile
        );
    }

    #[tokio::test]
    async fn rename_then_stat_old_and_new() {
        let mut handler = wildcard_handler();
        put(&mut handler, "/a", b"payload").await;

        handler
            .rename(1, "/a".to_string(), "/b".to_string())
            .await
            .unwrap();

        assert_eq!(
            handler.stat(2, "/a".to_string()).await.unwrap_err(),
            StatusCode::NoSuchFile
        );
        let attrs = handler.stat(3, "/b".to_string()).await.unwrap();
        assert_eq!(attrs.attrs.size, Some(7));
    }

    #[tokio::test]
    async fn jail_escape_in_realpath_is_no_such_file() {
        let mut handler = wildcard_handler();
        assert_eq!(
            handler
                .realpath(1, "/../../etc".to_string())
                .await
                .unwrap_err(),
            StatusCode::NoSuchFile
        );

        let name = handler.realpath(2, "/a/../b".to_string()).await.unwrap();
        assert_eq!(name.files[0].filename, "/b");
    }

    #[tokio::test]
    async fn mkdir_visible_in_listing_until_rmdir() {
        let mut handler = wildcard_handler();

        handler
            .mkdir(1, "/sub".to_string(), FileAttributes::default())
            .await
            .unwrap();

        let open = handler.opendir(2, "/".to_string()).await.unwrap();
        let name = handler.readdir(3, open.handle.clone()).await.unwrap();
        assert!(name.files.iter().any(|f| f.filename == "sub"));
        handler.close(4, open.handle).await.unwrap();

        handler.rmdir(5, "/sub".to_string()).await.unwrap();

        let open = handler.opendir(6, "/".to_string()).await.unwrap();
        assert_eq!(
            handler.readdir(7, open.handle.clone()).await.unwrap_err(),
            StatusCode::Eof
        );
        handler.close(8, open.handle).await.unwrap();
    }

    #[tokio::test]
    async fn empty_directory_readdir_is_immediately_eof() {
        let mut handler = wildcard_handler();
        let open = handler.opendir(1, "/".to_string()).await.unwrap();
        assert_eq!(
            handler.readdir(2, open.handle.clone()).await.unwrap_err(),
            StatusCode::Eof
        );
    }
}
