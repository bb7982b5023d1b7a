//! Persistence for tool rows and remote tool-server rows.
//!
//! Both the registry and the server manager write the full set of their rows on every
//! mutation, before publishing the change in memory.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::models::server::RemoteToolServer;
use crate::models::tool::ToolTable;

pub trait Store: Send + Sync {
    fn load_tools(&self) -> Result<ToolTable>;
    fn save_tools(&self, table: &ToolTable) -> Result<()>;
    fn load_servers(&self) -> Result<Vec<RemoteToolServer>>;
    fn save_servers(&self, servers: &[RemoteToolServer]) -> Result<()>;
}

/// Keeps rows for the lifetime of the process only
#[derive(Default)]
pub struct MemoryStore {
    tools: Mutex<ToolTable>,
    servers: Mutex<Vec<RemoteToolServer>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn load_tools(&self) -> Result<ToolTable> {
        Ok(self.tools.lock().clone())
    }

    fn save_tools(&self, table: &ToolTable) -> Result<()> {
        *self.tools.lock() = table.clone();
        Ok(())
    }

    fn load_servers(&self) -> Result<Vec<RemoteToolServer>> {
        Ok(self.servers.lock().clone())
    }

    fn save_servers(&self, servers: &[RemoteToolServer]) -> Result<()> {
        *self.servers.lock() = servers.to_vec();
        Ok(())
    }
}

const TOOLS_FILE: &str = "tools.json";
const SERVERS_FILE: &str = "servers.json";

/// Stores each row set as JSON in its own file under a data directory
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create data directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    /// A missing file reads as the empty value
    fn read<T: DeserializeOwned + Default>(&self, file_name: &str) -> Result<T> {
        let path = self.dir.join(file_name);
        if !path.exists() {
            return Ok(T::default());
        }
        let file = File::open(&path).with_context(|| format!("failed to open {}", path.display()))?;
        serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("failed to parse {}", path.display()))
    }

    /// Write to a sibling temp file and rename it over the target
    fn write<T: Serialize + ?Sized>(&self, file_name: &str, rows: &T) -> Result<()> {
        let path = self.dir.join(file_name);
        let tmp = temp_path(&path);
        {
            let file = File::create(&tmp)
                .with_context(|| format!("failed to create {}", tmp.display()))?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, rows)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp, &path)
            .with_context(|| format!("failed to replace {}", path.display()))?;
        Ok(())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

impl Store for JsonFileStore {
    fn load_tools(&self) -> Result<ToolTable> {
        self.read(TOOLS_FILE)
    }

    fn save_tools(&self, table: &ToolTable) -> Result<()> {
        self.write(TOOLS_FILE, table)
    }

    fn load_servers(&self) -> Result<Vec<RemoteToolServer>> {
        self.read(SERVERS_FILE)
    }

    fn save_servers(&self, servers: &[RemoteToolServer]) -> Result<()> {
        self.write(SERVERS_FILE, servers)
    }
}
