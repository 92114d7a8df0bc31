use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::operation::head_object::HeadObjectError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use super::{
    current_timestamp, BackendResult, Backend, Error, FileEntry, FileInfo, ListerAt, Method,
    ReaderAt, Request, WriterAt,
};
use crate::auth::{PERMISSION_FILE_CREATE, PERMISSION_FILE_UPDATE};
use crate::jail::clean_client_path;
use crate::session::SessionContext;

/// Marker object holding otherwise-empty directories open.
const KEEP_MARKER: &str = ".keep";

/// Multipart parts must be at least 5 MiB, except the final one.
const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// Connection settings for an S3-compatible object store, taken from an
/// access descriptor's parameter map.
#[derive(Debug, Clone)]
pub struct S3Options {
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    pub access_key: String,
    pub secret: String,
}

enum KeyKind {
    File(FileInfo),
    Dir,
    Missing,
}

/// Object-store backend. Files map to keys; directories are emulated with
/// `/`-delimited prefixes.
pub struct S3Backend {
    client: Client,
    bucket: String,
    ctx: Arc<SessionContext>,
}

impl S3Backend {
    pub fn new(client: Client, bucket: impl Into<String>, ctx: Arc<SessionContext>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            ctx,
        }
    }

    /// Create from AWS SDK config loaded from the ambient environment
    /// (shared credentials, instance profiles).
    pub async fn from_env(bucket: impl Into<String>, ctx: Arc<SessionContext>) -> Self {
        let aws_config = aws_config::load_from_env().await;
        Self::new(Client::new(&aws_config), bucket, ctx)
    }

    pub fn from_options(options: &S3Options, ctx: Arc<SessionContext>) -> Self {
        let credentials = Credentials::new(
            options.access_key.clone(),
            options.secret.clone(),
            None,
            None,
            "access-descriptor",
        );

        let config = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(options.region.clone()))
            .endpoint_url(&options.endpoint)
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();

        Self::new(Client::from_conf(config), options.bucket.clone(), ctx)
    }

    /// Normalized object key for a client path ("" is the bucket root).
    fn key(path: &str) -> BackendResult<String> {
        let cleaned = clean_client_path(path).ok_or(Error::NoSuchFile)?;
        Ok(cleaned.trim_start_matches('/').to_string())
    }

    fn parse_datetime(dt: &aws_sdk_s3::primitives::DateTime) -> u32 {
        dt.secs() as u32
    }

    /// Classifies a key as file, emulated directory or missing.
    async fn key_kind(&self, key: &str) -> BackendResult<KeyKind> {
        if key.is_empty() {
            return Ok(KeyKind::Dir);
        }

        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(head) => {
                let size = head.content_length.unwrap_or(0) as u64;
                let mtime = head
                    .last_modified
                    .as_ref()
                    .map(Self::parse_datetime)
                    .unwrap_or_else(current_timestamp);
                return Ok(KeyKind::File(FileInfo::file_with_mtime(size, mtime)));
            }
            Err(err) => {
                let not_found = err
                    .as_service_error()
                    .is_some_and(HeadObjectError::is_not_found);
                if !not_found {
                    warn!(key, %err, "error running HEAD on object");
                    return Err(Error::Failure);
                }
            }
        }

        let listed = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(format!("{key}/"))
            .max_keys(1)
            .send()
            .await
            .map_err(|err| {
                warn!(key, %err, "error probing prefix");
                Error::Failure
            })?;

        if listed.contents.map(|c| !c.is_empty()).unwrap_or(false) {
            Ok(KeyKind::Dir)
        } else {
            Ok(KeyKind::Missing)
        }
    }

    /// Collects every key under `prefix` (no delimiter), paginating as
    /// needed.
    async fn keys_under(&self, prefix: &str) -> BackendResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut call = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);
            if let Some(token) = &continuation {
                call = call.continuation_token(token);
            }

            let page = call.send().await.map_err(|err| {
                warn!(prefix, %err, "error listing prefix");
                Error::Failure
            })?;

            if let Some(contents) = page.contents {
                keys.extend(contents.into_iter().filter_map(|o| o.key));
            }

            match page.next_continuation_token {
                Some(token) => continuation = Some(token),
                None => break,
            }
        }

        Ok(keys)
    }

    async fn copy_key(&self, src: &str, dst: &str) -> BackendResult<()> {
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(format!("{}/{}", self.bucket, src))
            .key(dst)
            .send()
            .await
            .map_err(|err| {
                warn!(src, dst, %err, "error copying object");
                Error::Failure
            })?;
        Ok(())
    }

    async fn delete_key(&self, key: &str) -> BackendResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| {
                warn!(key, %err, "error deleting object");
                Error::Failure
            })?;
        Ok(())
    }
}

#[async_trait]
impl Backend for S3Backend {
    async fn file_read(&self, req: &Request) -> BackendResult<Box<dyn ReaderAt>> {
        if req.method != Method::Get {
            return Err(Error::OpUnsupported);
        }

        let key = Self::key(&req.filepath)?;
        match self.key_kind(&key).await? {
            KeyKind::File(info) => Ok(Box::new(S3Reader {
                client: self.client.clone(),
                bucket: self.bucket.clone(),
                key,
                size: info.size,
            })),
            KeyKind::Dir => Err(Error::OpUnsupported),
            KeyKind::Missing => Err(Error::NoSuchFile),
        }
    }

    async fn file_write(&self, req: &Request) -> BackendResult<Box<dyn WriterAt>> {
        if req.method != Method::Put && req.method != Method::Open {
            return Err(Error::OpUnsupported);
        }

        let key = Self::key(&req.filepath)?;
        match self.key_kind(&key).await? {
            KeyKind::File(_) => {
                if !self.ctx.can(PERMISSION_FILE_UPDATE) {
                    return Err(Error::PermissionDenied);
                }
            }
            KeyKind::Dir => {
                warn!(%key, "attempted to open a directory for writing");
                return Err(Error::OpUnsupported);
            }
            KeyKind::Missing => {
                if req.method == Method::Open {
                    return Err(Error::NoSuchFile);
                }
                if !self.ctx.can(PERMISSION_FILE_CREATE) {
                    return Err(Error::PermissionDenied);
                }
            }
        }

        debug!(%key, "starting object upload");

        Ok(Box::new(S3Writer {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            key,
            upload_id: None,
            parts: Vec::new(),
            part_number: 0,
            buffer: BytesMut::new(),
            written: 0,
        }))
    }

    async fn file_cmd(&self, req: &Request) -> BackendResult<()> {
        let key = Self::key(&req.filepath)?;

        match req.method {
            // Object stores carry no permission bits; acknowledge so
            // clients that chmod after upload keep working.
            Method::Setstat => Ok(()),
            Method::Mkdir => {
                self.client
                    .put_object()
                    .bucket(&self.bucket)
                    .key(format!("{key}/{KEEP_MARKER}"))
                    .body(ByteStream::from_static(b""))
                    .send()
                    .await
                    .map_err(|err| {
                        warn!(%key, %err, "failed to create directory marker");
                        Error::Failure
                    })?;
                Ok(())
            }
            Method::Rmdir => {
                let doomed = self.keys_under(&format!("{key}/")).await?;
                if doomed.is_empty() {
                    return Err(Error::NoSuchFile);
                }
                for k in doomed {
                    self.delete_key(&k).await?;
                }
                Ok(())
            }
            Method::Remove => match self.key_kind(&key).await? {
                KeyKind::File(_) => self.delete_key(&key).await,
                _ => Err(Error::NoSuchFile),
            },
            Method::Rename => {
                let target = req.target.as_deref().ok_or(Error::NoSuchFile)?;
                let target_key = Self::key(target)?;

                match self.key_kind(&key).await? {
                    KeyKind::File(_) => {
                        self.copy_key(&key, &target_key).await?;
                        self.delete_key(&key).await
                    }
                    KeyKind::Dir => {
                        let prefix = format!("{key}/");
                        for old in self.keys_under(&prefix).await? {
                            let new = format!("{target_key}/{}", &old[prefix.len()..]);
                            self.copy_key(&old, &new).await?;
                            self.delete_key(&old).await?;
                        }
                        Ok(())
                    }
                    KeyKind::Missing => Err(Error::NoSuchFile),
                }
            }
            Method::Symlink => Err(Error::OpUnsupported),
            _ => Err(Error::OpUnsupported),
        }
    }

    async fn file_list(&self, req: &Request) -> BackendResult<ListerAt> {
        let key = Self::key(&req.filepath)?;

        match req.method {
            Method::List => {
                let prefix = if key.is_empty() {
                    String::new()
                } else {
                    match self.key_kind(&key).await? {
                        KeyKind::Dir => format!("{key}/"),
                        KeyKind::File(_) => return Err(Error::NoSuchFile),
                        KeyKind::Missing => return Err(Error::NoSuchFile),
                    }
                };

                debug!(%prefix, "listing objects");

                let mut seen = HashSet::new();
                let mut entries = Vec::new();
                let mut continuation: Option<String> = None;

                loop {
                    let mut call = self
                        .client
                        .list_objects_v2()
                        .bucket(&self.bucket)
                        .prefix(&prefix)
                        .delimiter("/");
                    if let Some(token) = &continuation {
                        call = call.continuation_token(token);
                    }

                    let page = call.send().await.map_err(|err| {
                        warn!(%prefix, %err, "error listing directory");
                        Error::Failure
                    })?;

                    if let Some(prefixes) = page.common_prefixes {
                        for common in prefixes {
                            let Some(full) = common.prefix else { continue };
                            let name = full
                                .strip_prefix(&prefix)
                                .unwrap_or(&full)
                                .trim_end_matches('/');
                            if !name.is_empty() && seen.insert(name.to_string()) {
                                entries.push(FileEntry {
                                    name: name.to_string(),
                                    info: FileInfo::directory(),
                                });
                            }
                        }
                    }

                    if let Some(contents) = page.contents {
                        for object in contents {
                            let Some(full) = object.key else { continue };
                            let name = full.strip_prefix(&prefix).unwrap_or(&full);
                            if name.is_empty() || name == KEEP_MARKER {
                                continue;
                            }
                            if !seen.insert(name.to_string()) {
                                continue;
                            }

                            let mtime = object
                                .last_modified
                                .as_ref()
                                .map(Self::parse_datetime)
                                .unwrap_or_else(current_timestamp);
                            entries.push(FileEntry {
                                name: name.to_string(),
                                info: FileInfo::file_with_mtime(
                                    object.size.unwrap_or(0) as u64,
                                    mtime,
                                ),
                            });
                        }
                    }

                    match page.next_continuation_token {
                        Some(token) => continuation = Some(token),
                        None => break,
                    }
                }

                Ok(ListerAt::new(entries))
            }
            Method::Stat => {
                let name = key.rsplit('/').next().unwrap_or("/").to_string();
                match self.key_kind(&key).await? {
                    KeyKind::File(info) => Ok(ListerAt::single(FileEntry { name, info })),
                    KeyKind::Dir => Ok(ListerAt::single(FileEntry {
                        name: if key.is_empty() { "/".to_string() } else { name },
                        info: FileInfo::directory(),
                    })),
                    KeyKind::Missing => Err(Error::NoSuchFile),
                }
            }
            _ => Err(Error::OpUnsupported),
        }
    }

    fn kind(&self) -> &'static str {
        "s3"
    }
}

/// Ranged-GET positioned reader.
struct S3Reader {
    client: Client,
    bucket: String,
    key: String,
    size: u64,
}

#[async_trait]
impl ReaderAt for S3Reader {
    async fn read_at(&mut self, offset: u64, len: u32) -> BackendResult<Bytes> {
        if len == 0 || offset >= self.size {
            return Ok(Bytes::new());
        }

        let end = (offset + len as u64 - 1).min(self.size - 1);
        let range = format!("bytes={offset}-{end}");

        let object = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&self.key)
            .range(&range)
            .send()
            .await
            .map_err(|err| {
                if err
                    .as_service_error()
                    .is_some_and(GetObjectError::is_no_such_key)
                {
                    Error::NoSuchFile
                } else {
                    warn!(key = %self.key, %range, %err, "error reading object range");
                    Error::Failure
                }
            })?;

        let bytes = object
            .body
            .collect()
            .await
            .map_err(|err| {
                warn!(key = %self.key, %err, "error draining object body");
                Error::Failure
            })?
            .into_bytes();

        Ok(bytes)
    }
}

/// Multipart-upload positioned writer. Data is buffered until the part
/// threshold and flushed as numbered parts; close completes the upload.
/// Offsets must arrive tail-sequential because parts cannot be rewritten.
struct S3Writer {
    client: Client,
    bucket: String,
    key: String,
    upload_id: Option<String>,
    parts: Vec<CompletedPart>,
    part_number: i32,
    buffer: BytesMut,
    written: u64,
}

impl S3Writer {
    async fn ensure_upload(&mut self) -> BackendResult<String> {
        if let Some(id) = &self.upload_id {
            return Ok(id.clone());
        }

        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .send()
            .await
            .map_err(|err| {
                warn!(key = %self.key, %err, "error starting multipart upload");
                Error::Failure
            })?;

        let id = created.upload_id.ok_or(Error::Failure)?;
        self.upload_id = Some(id.clone());
        Ok(id)
    }

    async fn flush_part(&mut self, len: usize) -> BackendResult<()> {
        let upload_id = self.ensure_upload().await?;
        let body = self.buffer.split_to(len).freeze();
        self.part_number += 1;

        let part = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&upload_id)
            .part_number(self.part_number)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|err| {
                warn!(key = %self.key, part = self.part_number, %err, "error uploading part");
                Error::Failure
            })?;

        self.parts.push(
            CompletedPart::builder()
                .part_number(self.part_number)
                .set_e_tag(part.e_tag)
                .build(),
        );

        Ok(())
    }

    async fn abort(&mut self) {
        if let Some(upload_id) = self.upload_id.take() {
            if let Err(err) = self
                .client
                .abort_multipart_upload()
                .bucket(&self.bucket)
                .key(&self.key)
                .upload_id(&upload_id)
                .send()
                .await
            {
                warn!(key = %self.key, %err, "error aborting multipart upload");
            }
        }
    }

    async fn finish(&mut self) -> BackendResult<()> {
        match self.upload_id.clone() {
            // Small objects never opened a multipart session.
            None => {
                let body = self.buffer.split().freeze();
                self.client
                    .put_object()
                    .bucket(&self.bucket)
                    .key(&self.key)
                    .body(ByteStream::from(body))
                    .send()
                    .await
                    .map_err(|err| {
                        warn!(key = %self.key, %err, "error uploading object");
                        Error::Failure
                    })?;
                Ok(())
            }
            Some(upload_id) => {
                if !self.buffer.is_empty() {
                    let len = self.buffer.len();
                    self.flush_part(len).await?;
                }

                let completed = CompletedMultipartUpload::builder()
                    .set_parts(Some(self.parts.clone()))
                    .build();

                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(&self.key)
                    .upload_id(&upload_id)
                    .multipart_upload(completed)
                    .send()
                    .await
                    .map_err(|err| {
                        warn!(key = %self.key, %err, "error completing multipart upload");
                        Error::Failure
                    })?;

                Ok(())
            }
        }
    }
}

#[async_trait]
impl WriterAt for S3Writer {
    async fn write_at(&mut self, offset: u64, data: Bytes) -> BackendResult<()> {
        // Parts already shipped cannot be rewritten; only appends at the
        // current tail are accepted.
        if offset != self.written {
            warn!(
                key = %self.key,
                offset,
                expected = self.written,
                "non-sequential write to object upload",
            );
            self.abort().await;
            return Err(Error::Failure);
        }

        self.written += data.len() as u64;
        self.buffer.extend_from_slice(&data);

        while self.buffer.len() >= MIN_PART_SIZE {
            if let Err(err) = self.flush_part(MIN_PART_SIZE).await {
                self.abort().await;
                return Err(err);
            }
        }

        Ok(())
    }

    async fn close(&mut self) -> BackendResult<()> {
        match self.finish().await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.abort().await;
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_normalizes_paths() {
        assert_eq!(S3Backend::key("/").unwrap(), "");
        assert_eq!(S3Backend::key("/a/b.txt").unwrap(), "a/b.txt");
        assert_eq!(S3Backend::key("a/./b/../c").unwrap(), "a/c");
        assert_eq!(S3Backend::key("/../x").unwrap_err(), Error::NoSuchFile);
    }

    #[test]
    fn part_threshold_matches_s3_minimum() {
        assert_eq!(MIN_PART_SIZE, 5 * 1024 * 1024);
    }
}
