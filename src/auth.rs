use std::collections::HashMap;
use std::net::SocketAddr;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::config::Access;

/// Permission to list files and read their metadata.
pub const PERMISSION_FILE_READ: &str = "file.read";
/// Permission to read the contents of a file.
pub const PERMISSION_FILE_READ_CONTENT: &str = "file.read-content";
/// Permission to create a file.
pub const PERMISSION_FILE_CREATE: &str = "file.create";
/// Permission to update a file.
pub const PERMISSION_FILE_UPDATE: &str = "file.update";
/// Permission to delete a file.
pub const PERMISSION_FILE_DELETE: &str = "file.delete";

/// The full token set granted to users without an explicit permission list.
pub fn default_permissions() -> Vec<String> {
    vec![
        PERMISSION_FILE_READ.to_string(),
        PERMISSION_FILE_READ_CONTENT.to_string(),
        PERMISSION_FILE_CREATE.to_string(),
        PERMISSION_FILE_UPDATE.to_string(),
        PERMISSION_FILE_DELETE.to_string(),
    ]
}

/// An immutable set of permission tokens. The single-element set `["*"]`
/// grants every token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSet(Vec<String>);

impl PermissionSet {
    pub fn new(tokens: Vec<String>) -> Self {
        Self(tokens)
    }

    pub fn wildcard() -> Self {
        Self(vec!["*".to_string()])
    }

    pub fn can(&self, token: &str) -> bool {
        if self.0.len() == 1 && self.0[0] == "*" {
            return true;
        }
        self.0.iter().any(|t| t == token)
    }

    /// Comma-joined form carried through the SSH permission extensions.
    pub fn join(&self) -> String {
        self.0.join(",")
    }

    pub fn from_joined(joined: &str) -> Self {
        Self(
            joined
                .split(',')
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }
}

impl From<Vec<String>> for PermissionSet {
    fn from(tokens: Vec<String>) -> Self {
        Self::new(tokens)
    }
}

/// A password digest plus the algorithm that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordHash {
    pub algorithm: String,
    pub digest: Vec<u8>,
}

impl PasswordHash {
    pub fn sha256(secret: &str) -> Self {
        Self {
            algorithm: "sha256".to_string(),
            digest: Sha256::digest(secret.as_bytes()).to_vec(),
        }
    }

    /// Constant-time comparison of the stored digest against a candidate
    /// secret.
    pub fn verify(&self, secret: &str) -> bool {
        let candidate = Sha256::digest(secret.as_bytes());
        self.digest.as_slice().ct_eq(candidate.as_slice()).into()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub password: PasswordHash,
    pub permissions: PermissionSet,
}

/// An authentication request presented to the server.
#[derive(Debug, Clone)]
pub struct AuthenticationRequest {
    pub username: String,
    pub secret: String,
    pub peer: Option<SocketAddr>,
    pub session_id: String,
    pub client_version: Option<String>,
}

/// A successful authentication outcome.
#[derive(Debug, Clone)]
pub struct AuthenticationResponse {
    /// Opaque per-session identifier.
    pub server: String,
    /// Bearer token for auxiliary front-ends sharing the substrate.
    pub token: String,
    pub user: User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("the credentials provided were invalid")]
    InvalidCredentials,
}

/// Pluggable credential store consulted once per SSH handshake.
#[async_trait]
pub trait UserProvider: Send + Sync {
    async fn login(
        &self,
        request: &AuthenticationRequest,
    ) -> Result<AuthenticationResponse, AuthError>;

    /// Idempotent insert-or-update keyed by username.
    async fn register(&self, user: User);
}

/// In-process user store, seeded from the configuration's access list.
pub struct MemoryUserProvider {
    users: RwLock<HashMap<String, User>>,
}

impl MemoryUserProvider {
    pub fn new() -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_accesses(accesses: &[Access]) -> Self {
        let provider = Self::new();
        let mut users = provider.users.write();

        for (idx, access) in accesses.iter().enumerate() {
            users.insert(
                access.user.clone(),
                User {
                    id: idx as i64 + 1,
                    username: access.user.clone(),
                    password: PasswordHash::sha256(&access.pass),
                    permissions: PermissionSet::new(default_permissions()),
                },
            );
        }

        drop(users);
        provider
    }
}

impl Default for MemoryUserProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UserProvider for MemoryUserProvider {
    async fn login(
        &self,
        request: &AuthenticationRequest,
    ) -> Result<AuthenticationResponse, AuthError> {
        let user = {
            let users = self.users.read();
            users.get(&request.username).cloned()
        };

        let user = user.ok_or(AuthError::InvalidCredentials)?;

        if !user.password.verify(&request.secret) {
            return Err(AuthError::InvalidCredentials);
        }

        Ok(AuthenticationResponse {
            server: Uuid::new_v4().to_string(),
            token: Uuid::new_v4().to_string(),
            user,
        })
    }

    async fn register(&self, user: User) {
        self.users.write().insert(user.username.clone(), user);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(user: &str, pass: &str) -> AuthenticationRequest {
        AuthenticationRequest {
            username: user.to_string(),
            secret: pass.to_string(),
            peer: None,
            session_id: Uuid::new_v4().to_string(),
            client_version: None,
        }
    }

    fn test_user(name: &str, pass: &str, permissions: PermissionSet) -> User {
        User {
            id: 1,
            username: name.to_string(),
            password: PasswordHash::sha256(pass),
            permissions,
        }
    }

    #[test]
    fn wildcard_grants_every_token() {
        let perms = PermissionSet::wildcard();
        for token in default_permissions() {
            assert!(perms.can(&token));
        }
        assert!(perms.can("anything.else"));
    }

    #[test]
    fn membership_is_exact() {
        let perms = PermissionSet::new(vec![PERMISSION_FILE_READ.to_string()]);
        assert!(perms.can(PERMISSION_FILE_READ));
        assert!(!perms.can(PERMISSION_FILE_READ_CONTENT));
        assert!(!perms.can(PERMISSION_FILE_DELETE));
    }

    #[test]
    fn wildcard_requires_single_element() {
        let perms =
            PermissionSet::new(vec!["*".to_string(), PERMISSION_FILE_READ.to_string()]);
        assert!(!perms.can(PERMISSION_FILE_DELETE));
        assert!(perms.can(PERMISSION_FILE_READ));
    }

    #[test]
    fn joined_round_trip() {
        let perms = PermissionSet::new(default_permissions());
        assert_eq!(PermissionSet::from_joined(&perms.join()), perms);
    }

    #[test]
    fn password_hash_verifies() {
        let hash = PasswordHash::sha256("secret");
        assert!(hash.verify("secret"));
        assert!(!hash.verify("Secret"));
        assert!(!hash.verify(""));
    }

    #[tokio::test]
    async fn login_accepts_valid_credentials() {
        let provider = MemoryUserProvider::new();
        provider
            .register(test_user("test", "test", PermissionSet::wildcard()))
            .await;

        let resp = provider.login(&request("test", "test")).await.unwrap();
        assert_eq!(resp.user.username, "test");
        assert!(!resp.server.is_empty());
        assert!(!resp.token.is_empty());
    }

    #[tokio::test]
    async fn login_rejects_bad_password_and_unknown_user() {
        let provider = MemoryUserProvider::new();
        provider
            .register(test_user("test", "test", PermissionSet::wildcard()))
            .await;

        assert_eq!(
            provider.login(&request("test", "wrong")).await.unwrap_err(),
            AuthError::InvalidCredentials
        );
        assert_eq!(
            provider.login(&request("ghost", "test")).await.unwrap_err(),
            AuthError::InvalidCredentials
        );
    }

    #[tokio::test]
    async fn register_is_idempotent_by_username() {
        let provider = MemoryUserProvider::new();
        provider
            .register(test_user("test", "old", PermissionSet::wildcard()))
            .await;
        provider
            .register(test_user("test", "new", PermissionSet::wildcard()))
            .await;

        assert!(provider.login(&request("test", "old")).await.is_err());
        assert!(provider.login(&request("test", "new")).await.is_ok());
    }
}
