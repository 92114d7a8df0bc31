use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Version-1 JSON configuration. Unknown fields are ignored; a parse
/// failure aborts startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: u32,
    #[serde(default)]
    pub accesses: Vec<Access>,
    /// Used by the auxiliary FTP front-end; parsed and retained here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passive_transfer_port_range: Option<PortRange>,
}

/// Declarative description of one user's backend. Immutable once loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Access {
    pub user: String,
    pub pass: String,
    pub fs: String,
    #[serde(default)]
    pub params: HashMap<String, String>,
    #[serde(default, rename = "readOnly")]
    pub read_only: bool,
    #[serde(default, rename = "syncAndDelete", skip_serializing_if = "Option::is_none")]
    pub sync_and_delete: Option<SyncAndDelete>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncAndDelete {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub directory: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, Error> {
        let raw = std::fs::read_to_string(path)
            .map_err(|err| Error::Config(format!("can't read {}: {err}", path.display())))?;

        let config: Config = serde_json::from_str(&raw)
            .map_err(|err| Error::Config(format!("can't parse {}: {err}", path.display())))?;

        if config.version != 1 {
            return Err(Error::Config(format!(
                "unsupported configuration version {}",
                config.version
            )));
        }

        Ok(config)
    }

    pub fn access_for(&self, username: &str) -> Option<&Access> {
        self.accesses.iter().find(|a| a.user == username)
    }

    /// Minimal config written on first run so a bare invocation serves
    /// `/tmp` for `test:test`.
    pub fn default_template() -> &'static str {
        r#"{
  "version": 1,
  "accesses": [
    {
      "user": "test",
      "pass": "test",
      "fs": "os",
      "params": {
        "basePath": "/tmp"
      }
    }
  ],
  "passive_transfer_port_range": {
    "start": 2122,
    "end": 2130
  }
}
"#
    }

    pub fn write_default(path: &Path) -> std::io::Result<()> {
        std::fs::write(path, Self::default_template())
    }
}
