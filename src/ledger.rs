use std::collections::{BTreeMap, HashMap};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::{Mutex, RwLock};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

/// Chaincode namespace used to derive state addresses.
pub const NAMESPACE: &str = "seed";

const TX_LOG: &str = "txlog.jsonl";

/// Writes produced by one simulated transaction, applied atomically per key.
pub type WriteSet = BTreeMap<String, Vec<u8>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitEntry {
    pub tx_id: String,
    pub function: String,
    pub keys: Vec<String>,
    pub committed_at: String,
}

impl CommitEntry {
    pub fn new(tx_id: &str, function: &str, writes: &WriteSet) -> Self {
        Self {
            tx_id: tx_id.to_string(),
            function: function.to_string(),
            keys: writes.keys().cloned().collect(),
            committed_at: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        }
    }
}

/// Key/value world state maintained by the peer.
pub trait WorldState: Send + Sync {
    fn get_state(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Apply a committed write set and record it in the commit log.
    fn apply(&self, entry: &CommitEntry, writes: &WriteSet) -> Result<()>;

    fn history(&self) -> Result<Vec<CommitEntry>>;
}

/// Namespace prefix (6 hex chars) followed by the blake3 hex of the key.
pub fn state_address(key: &str) -> String {
    let ns = blake3_hex(NAMESPACE.as_bytes());
    format!("{}{}", &ns[..6], blake3_hex(key.as_bytes()))
}

pub fn blake3_hex(data: &[u8]) -> String {
    let mut h = blake3::Hasher::new();
    h.update(data);
    hex::encode(h.finalize().as_bytes())
}

/// One JSON file per key, named by its state address.
pub struct FileState {
    dir: PathBuf,
    log_lock: Mutex<()>,
}

impl FileState {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        Ok(Self {
            dir,
            log_lock: Mutex::new(()),
        })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", state_address(key)))
    }

    fn write_atomic(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, bytes).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &path).with_context(|| format!("renaming {}", path.display()))?;
        Ok(())
    }
}

impl WorldState for FileState {
    fn get_state(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key);
        match fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(anyhow!("reading {}: {e}", path.display())),
        }
    }

    fn apply(&self, entry: &CommitEntry, writes: &WriteSet) -> Result<()> {
        for (key, value) in writes {
            self.write_atomic(key, value)?;
        }
        let _guard = self
            .log_lock
            .lock()
            .map_err(|_| anyhow!("commit log lock poisoned"))?;
        let log_path = self.dir.join(TX_LOG);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_context(|| format!("opening {}", log_path.display()))?;
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        file.write_all(&line)
            .with_context(|| format!("appending {}", log_path.display()))?;
        Ok(())
    }

    fn history(&self) -> Result<Vec<CommitEntry>> {
        let log_path = self.dir.join(TX_LOG);
        if !log_path.exists() {
            return Ok(vec![]);
        }
        let file = fs::File::open(&log_path)?;
        let mut out = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            out.push(serde_json::from_str(&line)?);
        }
        Ok(out)
    }
}

/// Process-local state, used by tests and throwaway runs.
#[derive(Default)]
pub struct MemoryState {
    entries: RwLock<HashMap<String, Vec<u8>>>,
    log: Mutex<Vec<CommitEntry>>,
}

impl MemoryState {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WorldState for MemoryState {
    fn get_state(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| anyhow!("state lock poisoned"))?;
        Ok(entries.get(key).cloned())
    }

    fn apply(&self, entry: &CommitEntry, writes: &WriteSet) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| anyhow!("state lock poisoned"))?;
        for (key, value) in writes {
            entries.insert(key.clone(), value.clone());
        }
        self.log
            .lock()
            .map_err(|_| anyhow!("commit log lock poisoned"))?
            .push(entry.clone());
        Ok(())
    }

    fn history(&self) -> Result<Vec<CommitEntry>> {
        Ok(self
            .log
            .lock()
            .map_err(|_| anyhow!("commit log lock poisoned"))?
            .clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_is_namespaced_and_stable() {
        let a = state_address("seed-001");
        assert_eq!(a.len(), 6 + 64);
        assert_eq!(a, state_address("seed-001"));
        assert_ne!(a, state_address("seed-002"));
        assert_eq!(&a[..6], &state_address("other")[..6]);
    }

    #[test]
    fn memory_state_applies_writes() {
        let state = MemoryState::new();
        let mut writes = WriteSet::new();
        writes.insert("k".into(), b"v".to_vec());
        state
            .apply(&CommitEntry::new("tx1", "Put", &writes), &writes)
            .unwrap();
        assert_eq!(state.get_state("k").unwrap(), Some(b"v".to_vec()));
        assert_eq!(state.get_state("missing").unwrap(), None);
        assert_eq!(state.history().unwrap()[0].keys, vec!["k".to_string()]);
    }
}
