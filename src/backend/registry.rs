use std::path::PathBuf;
use std::sync::Arc;

use super::{Backend, DiskBackend, ReadOnlyBackend, S3Backend, S3Options, StagedBackend};
use crate::config::Access;
use crate::session::SessionContext;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unsupported backend: {0}")]
    Unsupported(String),

    #[error("missing required parameter {0:?}")]
    MissingParam(&'static str),

    #[error("invalid parameter {name}: {value:?}")]
    InvalidParam { name: &'static str, value: String },

    #[error("missing dropbox token")]
    MissingToken,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn required<'a>(access: &'a Access, name: &'static str) -> Result<&'a str, RegistryError> {
    access
        .params
        .get(name)
        .map(String::as_str)
        .filter(|v| !v.is_empty())
        .ok_or(RegistryError::MissingParam(name))
}

fn optional_u32(access: &Access, name: &'static str) -> Result<Option<u32>, RegistryError> {
    match access.params.get(name) {
        None => Ok(None),
        Some(value) => value
            .parse::<u32>()
            .map(Some)
            .map_err(|_| RegistryError::InvalidParam {
                name,
                value: value.clone(),
            }),
    }
}

/// Constructs the backend described by an access descriptor, applying the
/// read-only and sync-and-delete decorators as configured.
pub fn build(
    access: &Access,
    ctx: Arc<SessionContext>,
) -> Result<Box<dyn Backend>, RegistryError> {
    let mut backend: Box<dyn Backend> = match access.fs.as_str() {
        "os" => {
            let base = required(access, "basePath")?;
            let mut disk = DiskBackend::new(base, ctx)?;

            match (optional_u32(access, "uid")?, optional_u32(access, "gid")?) {
                (Some(uid), Some(gid)) => disk = disk.with_owner(uid, gid),
                (Some(_), None) => return Err(RegistryError::MissingParam("gid")),
                (None, Some(_)) => return Err(RegistryError::MissingParam("uid")),
                (None, None) => {}
            }

            Box::new(disk)
        }
        "s3" => {
            let options = S3Options {
                endpoint: required(access, "endpoint")?.to_string(),
                region: required(access, "region")?.to_string(),
                bucket: required(access, "bucket")?.to_string(),
                access_key: required(access, "access_key")?.to_string(),
                secret: required(access, "secret")?.to_string(),
            };
            Box::new(S3Backend::from_options(&options, ctx))
        }
        "dropbox" => {
            // The connector itself is an external integration; resolve the
            // token anyway so operators get the precise error.
            let token = access
                .params
                .get("token")
                .cloned()
                .filter(|t| !t.is_empty())
                .or_else(|| std::env::var("DROPBOX_TOKEN").ok().filter(|t| !t.is_empty()));

            return Err(match token {
                None => RegistryError::MissingToken,
                Some(_) => RegistryError::Unsupported("dropbox".to_string()),
            });
        }
        kind @ ("sftp" | "mail" | "gdrive") => {
            return Err(RegistryError::Unsupported(kind.to_string()))
        }
        other => return Err(RegistryError::Unsupported(other.to_string())),
    };

    if access.read_only {
        backend = Box::new(ReadOnlyBackend::new(backend));
    }

    if let Some(snd) = &access.sync_and_delete {
        if snd.enable {
            let directory = if snd.directory.is_empty() {
                None
            } else {
                Some(PathBuf::from(&snd.directory))
            };
            backend = Box::new(StagedBackend::new(backend, directory)?);
        }
    }

    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::PermissionSet;
    use crate::backend::{Error, Method, Request};
    use crate::config::SyncAndDelete;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn ctx() -> Arc<SessionContext> {
        Arc::new(SessionContext::new(
            "session",
            "test",
            PermissionSet::wildcard(),
        ))
    }

    fn os_access(base: &str) -> Access {
        Access {
            user: "test".to_string(),
            pass: "test".to_string(),
            fs: "os".to_string(),
            params: HashMap::from([("basePath".to_string(), base.to_string())]),
            read_only: false,
            sync_and_delete: None,
        }
    }

    fn expect_err(result: Result<Box<dyn Backend>, RegistryError>) -> RegistryError {
        match result {
            Ok(_) => panic!("expected an error"),
            Err(err) => err,
        }
    }

    #[tokio::test]
    async fn builds_a_disk_backend() {
        let dir = TempDir::new().unwrap();
        let backend = build(&os_access(dir.path().to_str().unwrap()), ctx()).unwrap();

        assert_eq!(backend.kind(), "os");
        assert!(backend
            .file_cmd(&Request::new(Method::Mkdir, "/sub"))
            .await
            .is_ok());
    }

    #[test]
    fn missing_base_path_is_reported() {
        let mut access = os_access("/tmp");
        access.params.clear();

        assert!(matches!(
            expect_err(build(&access, ctx())),
            RegistryError::MissingParam("basePath")
        ));
    }

    #[test]
    fn uid_without_gid_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut access = os_access(dir.path().to_str().unwrap());
        access.params.insert("uid".to_string(), "1000".to_string());

        assert!(matches!(
            expect_err(build(&access, ctx())),
            RegistryError::MissingParam("gid")
        ));
    }

    #[test]
    fn unknown_kind_is_unsupported() {
        let mut access = os_access("/tmp");
        access.fs = "tape".to_string();

        match expect_err(build(&access, ctx())) {
            RegistryError::Unsupported(kind) => assert_eq!(kind, "tape"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn external_kinds_are_unsupported() {
        for kind in ["sftp", "mail", "gdrive"] {
            let mut access = os_access("/tmp");
            access.fs = kind.to_string();
            assert!(matches!(
                expect_err(build(&access, ctx())),
                RegistryError::Unsupported(_)
            ));
        }
    }

    #[test]
    fn dropbox_with_token_param_is_still_external() {
        let mut access = os_access("/tmp");
        access.fs = "dropbox".to_string();
        access.params = HashMap::from([("token".to_string(), "tok".to_string())]);

        assert!(matches!(
            expect_err(build(&access, ctx())),
            RegistryError::Unsupported(_)
        ));
    }

    #[tokio::test]
    async fn read_only_flag_wraps_the_backend() {
        let dir = TempDir::new().unwrap();
        let mut access = os_access(dir.path().to_str().unwrap());
        access.read_only = true;

        let backend = build(&access, ctx()).unwrap();
        assert_eq!(
            backend
                .file_write(&Request::new(Method::Put, "/x"))
                .await
                .map(|_| ())
                .unwrap_err(),
            Error::OpUnsupported
        );
        assert!(backend
            .file_list(&Request::new(Method::List, "/"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn sync_and_delete_wraps_with_a_staging_area() {
        let data = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();

        let mut access = os_access(data.path().to_str().unwrap());
        access.sync_and_delete = Some(SyncAndDelete {
            enable: true,
            directory: staging.path().to_str().unwrap().to_string(),
        });

        let backend = build(&access, ctx()).unwrap();
        let mut writer = backend
            .file_write(&Request::new(Method::Put, "/f.txt"))
            .await
            .unwrap();
        writer
            .write_at(0, bytes::Bytes::from_static(b"payload"))
            .await
            .unwrap();
        writer.close().await.unwrap();

        assert_eq!(
            std::fs::read(data.path().join("f.txt")).unwrap(),
            b"payload"
        );
        assert_eq!(std::fs::read_dir(staging.path()).unwrap().count(), 0);
    }
}
