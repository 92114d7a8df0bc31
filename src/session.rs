use std::collections::HashMap;
use std::sync::Arc;

use crate::auth::{
    PermissionSet, PERMISSION_FILE_CREATE, PERMISSION_FILE_DELETE, PERMISSION_FILE_READ,
    PERMISSION_FILE_READ_CONTENT, PERMISSION_FILE_UPDATE,
};
use crate::backend::{Backend, BackendResult, Error, ListerAt, Method, ReaderAt, Request, WriterAt};

/// Extension keys carried through the SSH permission map between the
/// handshake and the subsystem start.
pub const EXT_UUID: &str = "uuid";
pub const EXT_USER: &str = "user";
pub const EXT_PERMISSIONS: &str = "permissions";

/// Immutable per-channel identity bundle. Created once at subsystem start
/// from the values attached during the handshake; never mutated afterwards.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub id: String,
    pub username: String,
    pub permissions: PermissionSet,
}

impl SessionContext {
    pub fn new(id: impl Into<String>, username: impl Into<String>, permissions: PermissionSet) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
            permissions,
        }
    }

    /// Serializes the context into the string map smuggled through the SSH
    /// library at authentication time.
    pub fn to_extensions(&self) -> HashMap<String, String> {
        HashMap::from([
            (EXT_UUID.to_string(), self.id.clone()),
            (EXT_USER.to_string(), self.username.clone()),
            (EXT_PERMISSIONS.to_string(), self.permissions.join()),
        ])
    }

    /// Re-materializes a typed context from the wire-level string map.
    /// Returns `None` when the handshake never attached an identity.
    pub fn from_extensions(extensions: &HashMap<String, String>) -> Option<Self> {
        let id = extensions.get(EXT_UUID)?;
        if id.is_empty() {
            return None;
        }

        Some(Self {
            id: id.clone(),
            username: extensions.get(EXT_USER)?.clone(),
            permissions: PermissionSet::from_joined(extensions.get(EXT_PERMISSIONS)?),
        })
    }

    pub fn can(&self, token: &str) -> bool {
        self.permissions.can(token)
    }
}

/// Per-session filesystem façade: maps each method to its required
/// permission, rejects before the backend is touched, and guarantees only
/// the closed error taxonomy escapes.
pub struct SessionFs {
    backend: Box<dyn Backend>,
    ctx: Arc<SessionContext>,
}

impl SessionFs {
    pub fn new(backend: Box<dyn Backend>, ctx: Arc<SessionContext>) -> Self {
        Self { backend, ctx }
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    /// Method → permission gate. `Put`/`Open` are admitted with either
    /// write token here; the backend applies the precise create-vs-update
    /// rule once existence is known.
    fn check(&self, method: Method) -> BackendResult<()> {
        let allowed = match method {
            Method::Get => self.ctx.can(PERMISSION_FILE_READ_CONTENT),
            Method::Put | Method::Open => {
                self.ctx.can(PERMISSION_FILE_CREATE) || self.ctx.can(PERMISSION_FILE_UPDATE)
            }
            Method::List | Method::Stat => self.ctx.can(PERMISSION_FILE_READ),
            Method::Mkdir | Method::Symlink => self.ctx.can(PERMISSION_FILE_CREATE),
            Method::Rename | Method::Setstat => self.ctx.can(PERMISSION_FILE_UPDATE),
            Method::Rmdir | Method::Remove => self.ctx.can(PERMISSION_FILE_DELETE),
        };

        if allowed {
            Ok(())
        } else {
            Err(Error::PermissionDenied)
        }
    }

    pub async fn read(&self, req: &Request) -> BackendResult<Box<dyn ReaderAt>> {
        self.check(req.method)?;
        self.backend.file_read(req).await
    }

    pub async fn write(&self, req: &Request) -> BackendResult<Box<dyn WriterAt>> {
        self.check(req.method)?;
        self.backend.file_write(req).await
    }

    pub async fn cmd(&self, req: &Request) -> BackendResult<()> {
        self.check(req.method)?;
        self.backend.file_cmd(req).await
    }

    pub async fn list(&self, req: &Request) -> BackendResult<ListerAt> {
        self.check(req.method)?;
        self.backend.file_list(req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Backend probe that records whether it was reached.
    struct CountingBackend {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Backend for CountingBackend {
        async fn file_read(&self, _req: &Request) -> BackendResult<Box<dyn ReaderAt>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Failure)
        }

        async fn file_write(&self, _req: &Request) -> BackendResult<Box<dyn WriterAt>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Failure)
        }

        async fn file_cmd(&self, _req: &Request) -> BackendResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn file_list(&self, _req: &Request) -> BackendResult<ListerAt> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ListerAt::default())
        }

        fn kind(&self) -> &'static str {
            "probe"
        }
    }

    fn facade_with(perms: Vec<&str>) -> (SessionFs, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let ctx = Arc::new(SessionContext::new(
            "session",
            "test",
            PermissionSet::new(perms.into_iter().map(str::to_string).collect()),
        ));
        let fs = SessionFs::new(
            Box::new(CountingBackend {
                calls: calls.clone(),
            }),
            ctx,
        );
        (fs, calls)
    }

    #[tokio::test]
    async fn put_without_write_tokens_never_reaches_backend() {
        let (fs, calls) = facade_with(vec![PERMISSION_FILE_READ]);

        let err = fs
            .write(&Request::new(Method::Put, "/x"))
            .await
            .map(|_| ())
            .unwrap_err();

        assert_eq!(err, Error::PermissionDenied);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn get_requires_read_content() {
        let (fs, calls) = facade_with(vec![PERMISSION_FILE_READ]);

        let err = fs
            .read(&Request::new(Method::Get, "/x"))
            .await
            .map(|_| ())
            .unwrap_err();

        assert_eq!(err, Error::PermissionDenied);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn list_and_stat_require_read() {
        let (fs, calls) = facade_with(vec![PERMISSION_FILE_READ_CONTENT]);

        assert_eq!(
            fs.list(&Request::new(Method::List, "/")).await.unwrap_err(),
            Error::PermissionDenied
        );
        assert_eq!(
            fs.list(&Request::new(Method::Stat, "/x")).await.unwrap_err(),
            Error::PermissionDenied
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn command_permission_map() {
        let (fs, calls) = facade_with(vec![PERMISSION_FILE_CREATE]);

        assert!(fs.cmd(&Request::new(Method::Mkdir, "/d")).await.is_ok());
        assert!(fs
            .cmd(&Request::new(Method::Symlink, "/a").with_target("/b"))
            .await
            .is_ok());
        assert_eq!(
            fs.cmd(&Request::new(Method::Rename, "/a").with_target("/b"))
                .await
                .unwrap_err(),
            Error::PermissionDenied
        );
        assert_eq!(
            fs.cmd(&Request::new(Method::Rmdir, "/d")).await.unwrap_err(),
            Error::PermissionDenied
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn wildcard_admits_everything() {
        let (fs, calls) = facade_with(vec!["*"]);

        assert!(fs.cmd(&Request::new(Method::Mkdir, "/d")).await.is_ok());
        assert!(fs.cmd(&Request::new(Method::Remove, "/x")).await.is_ok());
        assert!(fs.list(&Request::new(Method::List, "/")).await.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn extensions_round_trip() {
        let ctx = SessionContext::new("abc", "alice", PermissionSet::wildcard());
        let restored = SessionContext::from_extensions(&ctx.to_extensions()).unwrap();

        assert_eq!(restored.id, "abc");
        assert_eq!(restored.username, "alice");
        assert!(restored.can("anything"));
    }

    #[test]
    fn empty_uuid_extension_is_rejected() {
        let mut extensions = SessionContext::new("x", "u", PermissionSet::wildcard()).to_extensions();
        extensions.insert(EXT_UUID.to_string(), String::new());

        assert!(SessionContext::from_extensions(&extensions).is_none());
    }
}
