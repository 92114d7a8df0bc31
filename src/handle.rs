use std::collections::HashMap;

use uuid::Uuid;

use crate::backend::{ListerAt, ReaderAt, WriterAt};

/// State attached to one open SFTP handle.
pub enum HandleEntry {
    Read {
        path: String,
        reader: Box<dyn ReaderAt>,
    },
    Write {
        path: String,
        writer: Box<dyn WriterAt>,
    },
    Dir {
        path: String,
        lister: ListerAt,
        offset: u64,
    },
}

impl HandleEntry {
    pub fn path(&self) -> &str {
        match self {
            HandleEntry::Read { path, .. } => path,
            HandleEntry::Write { path, .. } => path,
            HandleEntry::Dir { path, .. } => path,
        }
    }
}

/// Open handles for one SFTP channel, keyed by opaque handle strings.
#[derive(Default)]
pub struct HandleMap {
    entries: HashMap<String, HandleEntry>,
}

impl HandleMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: HandleEntry) -> String {
        let handle = Uuid::new_v4().to_string();
        self.entries.insert(handle.clone(), entry);
        handle
    }

    pub fn get_mut(&mut self, handle: &str) -> Option<&mut HandleEntry> {
        self.entries.get_mut(handle)
    }

    pub fn get(&self, handle: &str) -> Option<&HandleEntry> {
        self.entries.get(handle)
    }

    pub fn remove(&mut self, handle: &str) -> Option<HandleEntry> {
        self.entries.remove(handle)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::FileEntry;
    use crate::backend::FileInfo;

    #[test]
    fn insert_get_remove() {
        let mut handles = HandleMap::new();

        let handle = handles.insert(HandleEntry::Dir {
            path: "/".to_string(),
            lister: ListerAt::new(vec![FileEntry {
                name: "a".to_string(),
                info: FileInfo::file(1),
            }]),
            offset: 0,
        });

        assert_eq!(handles.len(), 1);
        assert_eq!(handles.get(&handle).unwrap().path(), "/");
        assert!(handles.remove(&handle).is_some());
        assert!(handles.is_empty());
        assert!(handles.remove(&handle).is_none());
    }

    #[test]
    fn handles_are_unique() {
        let mut handles = HandleMap::new();
        let a = handles.insert(HandleEntry::Dir {
            path: "/a".to_string(),
            lister: ListerAt::default(),
            offset: 0,
        });
        let b = handles.insert(HandleEntry::Dir {
            path: "/b".to_string(),
            lister: ListerAt::default(),
            offset: 0,
        });
        assert_ne!(a, b);
    }
}
