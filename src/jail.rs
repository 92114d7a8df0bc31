use std::path::{Component, Path, PathBuf};

use crate::backend::Error;

/// Root-confined path mapper. Every client-supplied path is cleaned
/// lexically, joined onto the data root and asserted to stay inside it.
/// Failures are reported as `NoSuchFile` so the jail geometry is never
/// revealed to clients.
#[derive(Debug, Clone)]
pub struct Jail {
    root: PathBuf,
}

impl Jail {
    /// Creates a jail rooted at `root`. The directory is created if missing
    /// and canonicalized so the containment check compares real prefixes.
    pub fn new(root: impl AsRef<Path>) -> std::io::Result<Self> {
        let root = root.as_ref();
        std::fs::create_dir_all(root)?;
        Ok(Self {
            root: root.canonicalize()?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a client path to a real filesystem path inside the root.
    pub fn join(&self, client_path: &str) -> Result<PathBuf, Error> {
        let cleaned = clean_client_path(client_path).ok_or(Error::NoSuchFile)?;
        let joined = match cleaned.strip_prefix('/') {
            Some("") => self.root.clone(),
            Some(rel) => self.root.join(rel),
            None => self.root.join(&cleaned),
        };

        if !joined.starts_with(&self.root) {
            return Err(Error::NoSuchFile);
        }

        Ok(joined)
    }
}

/// Lexically normalizes a client path to an absolute virtual path
/// ("/a/b"). Returns `None` when `..` components would climb above the
/// virtual root.
pub fn clean_client_path(path: &str) -> Option<String> {
    let mut parts: Vec<&str> = Vec::new();

    for component in Path::new(path).components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::Normal(part) => parts.push(part.to_str()?),
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return None;
                }
            }
            Component::Prefix(_) => return None,
        }
    }

    Some(format!("/{}", parts.join("/")))
}
