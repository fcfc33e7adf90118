//! Durable container → IP mapping for one logical network.
//!
//! The data file lives at `<data_dir>/<network>/<network>.json` next to a
//! `lock` file. The store never locks on its own: callers take
//! [`AllocationStore::lock`] around every load → mutate → persist sequence,
//! since any number of plugin processes may share the file.

pub mod lock;

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::net::Ipv4Addr;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{CniError, Result};
pub use lock::{FileLock, LockGuard};

/// Default root for allocation data.
pub const DEFAULT_DATA_DIR: &str = "/var/lib/cni/brcni";

/// One container's address lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRecord {
    /// Container ID
    pub id: String,
    /// Interface name inside the container
    #[serde(rename = "if")]
    pub if_name: String,
}

/// On-disk allocator state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    /// Allocated IP → lease
    #[serde(default)]
    pub ips: BTreeMap<String, AllocationRecord>,
    /// Last allocated IP, empty if nothing was ever allocated
    #[serde(default)]
    pub last: String,
}

/// File-backed allocation store.
#[derive(Debug)]
pub struct AllocationStore {
    dir: PathBuf,
    data_file: PathBuf,
    lock: FileLock,
    data: StoreSnapshot,
}

impl AllocationStore {
    /// Open (creating if needed) the store directory for `network`.
    pub fn open(data_dir: impl AsRef<Path>, network: &str) -> Result<Self> {
        if network.is_empty() || network.contains('/') || network == "." || network == ".." {
            return Err(CniError::config(format!("invalid network name {:?}", network)));
        }

        let dir = data_dir.as_ref().join(network);
        fs::create_dir_all(&dir).map_err(|e| CniError::io(&dir, e))?;

        Ok(Self {
            data_file: dir.join(format!("{}.json", network)),
            lock: FileLock::new(dir.join("lock")),
            dir,
            data: StoreSnapshot::default(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn data_file(&self) -> &Path {
        &self.data_file
    }

    /// The lock that must be held around every operation on this store.
    pub fn lock(&self) -> &FileLock {
        &self.lock
    }

    pub fn snapshot(&self) -> &StoreSnapshot {
        &self.data
    }

    /// Replace the in-memory snapshot with the file contents.
    pub fn load(&mut self) -> Result<()> {
        self.data = match fs::read(&self.data_file) {
            Ok(raw) if raw.iter().all(u8::is_ascii_whitespace) => StoreSnapshot::default(),
            Ok(raw) => serde_json::from_slice(&raw)
                .map_err(|source| CniError::Json { path: self.data_file.clone(), source })?,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.data_file.display(), "creating empty allocation file");
                let empty = StoreSnapshot::default();
                write_json(&self.data_file, &empty)?;
                empty
            }
            Err(e) => return Err(CniError::io(&self.data_file, e)),
        };
        Ok(())
    }

    pub fn last(&self) -> Option<Ipv4Addr> {
        self.data.last.parse().ok()
    }

    pub fn query_by_id(&self, id: &str) -> Option<Ipv4Addr> {
        self.data
            .ips
            .iter()
            .find(|(_, record)| record.id == id)
            .and_then(|(ip, _)| ip.parse().ok())
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.data.ips.contains_key(&ip.to_string())
    }

    /// Record `ip` for `id`, advance the last-allocated marker and persist.
    pub fn add(&mut self, ip: Ipv4Addr, id: &str, if_name: &str) -> Result<()> {
        let key = ip.to_string();
        self.data.ips.insert(
            key.clone(),
            AllocationRecord { id: id.to_string(), if_name: if_name.to_string() },
        );
        self.data.last = key;
        self.persist()
    }

    /// Drop the lease held by `id`, if any, and persist.
    pub fn remove(&mut self, id: &str) -> Result<Option<Ipv4Addr>> {
        let Some(key) = self
            .data
            .ips
            .iter()
            .find(|(_, record)| record.id == id)
            .map(|(ip, _)| ip.clone())
        else {
            return Ok(None);
        };

        self.data.ips.remove(&key);
        self.persist()?;
        info!(container_id = %id, ip = %key, "released address");
        Ok(key.parse().ok())
    }

    fn persist(&self) -> Result<()> {
        write_json(&self.data_file, &self.data)
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let raw = serde_json::to_vec(value)
        .map_err(|source| CniError::Json { path: path.to_path_buf(), source })?;
    write_atomic(path, &raw)
}

/// Replace `path` with `contents` so readers only ever see the old or the new file.
///
/// Every call writes its own temp file, so writers holding only a shared lock
/// (creating a missing data file) cannot trip over each other.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let file_name = path
        .file_name()
        .ok_or_else(|| CniError::config(format!("{} is not a file path", path.display())))?;
    let tmp = dir.join(format!(
        ".{}.{}.{}.tmp",
        file_name.to_string_lossy(),
        std::process::id(),
        Uuid::new_v4().simple()
    ));

    let write = || -> std::io::Result<()> {
        let mut file =
            OpenOptions::new().write(true).create(true).truncate(true).mode(0o644).open(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        File::open(dir)?.sync_all()
    };

    write().map_err(|e| {
        let _ = fs::remove_file(&tmp);
        CniError::io(path, e)
    })
}
