use thiserror::Error;

/// Top-level error type for the crate
#[derive(Debug, Error)]
pub enum Error {
    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),

    #[error("key error: {0}")]
    Key(#[from] russh::keys::Error),

    #[error("host key error: {0}")]
    HostKey(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("backend error: {0}")]
    Backend(#[from] crate::backend::registry::RegistryError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
