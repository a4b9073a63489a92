use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tern_marshal::to_canonical_cbor;

use crate::{StoreError, StoreResult, Vatstore};

const VATSTORE_DIR: &str = "vatstore";
const VATSTORE_FILE: &str = "vatstore.log";

/// One mutation as persisted in the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum LogRecord {
    Set {
        key: String,
        #[serde(with = "serde_bytes")]
        value: Vec<u8>,
    },
    Delete {
        key: String,
    },
}

/// Filesystem-backed vatstore: a length-prefixed canonical CBOR mutation
/// log replayed into an ordered map on open.
///
/// Every mutation is synced before the call returns, so the log survives
/// process crashes; a torn final record is reported as corruption rather
/// than silently dropped.
#[derive(Debug)]
pub struct FsVatstore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl FsVatstore {
    pub fn open(root: impl AsRef<Path>) -> StoreResult<Self> {
        let dir = root.as_ref().join(VATSTORE_DIR);
        fs::create_dir_all(&dir)?;
        let path = dir.join(VATSTORE_FILE);
        if !path.exists() {
            File::create(&path)?;
        }
        let mut entries = BTreeMap::new();
        for record in read_all_records(&path)? {
            match record {
                LogRecord::Set { key, value } => {
                    entries.insert(key, value);
                }
                LogRecord::Delete { key } => {
                    entries.remove(&key);
                }
            }
        }
        Ok(Self { path, entries: Mutex::new(entries) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rewrite the log so it holds exactly one `Set` per live entry,
    /// dropping overwritten and deleted history. The replacement file is
    /// synced before it is swapped into place.
    pub fn compact(&self) -> StoreResult<()> {
        let entries = self.entries.lock().unwrap();
        let tmp_path = self.path.with_extension("log.tmp");
        let mut tmp = File::create(&tmp_path)?;
        for (key, value) in entries.iter() {
            let record = LogRecord::Set { key: key.clone(), value: value.clone() };
            write_record(&mut tmp, &record)?;
        }
        tmp.sync_all()?;
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    fn append(&self, record: &LogRecord) -> StoreResult<()> {
        let mut file = OpenOptions::new().append(true).create(true).open(&self.path)?;
        write_record(&mut file, record)?;
        file.sync_all()?;
        Ok(())
    }
}

impl Vatstore for FsVatstore {
    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        // log first so the map never holds a write the disk does not
        self.append(&LogRecord::Set { key: key.to_string(), value: value.to_vec() })?;
        self.entries.lock().unwrap().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        if !self.entries.lock().unwrap().contains_key(key) {
            return Ok(());
        }
        self.append(&LogRecord::Delete { key: key.to_string() })?;
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    fn get_after(&self, prior: &str, prefix: &str) -> StoreResult<Option<(String, Vec<u8>)>> {
        let entries = self.entries.lock().unwrap();
        Ok(entries
            .range::<str, _>((Bound::Excluded(prior), Bound::Unbounded))
            .find(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone())))
    }
}

fn write_record(file: &mut File, record: &LogRecord) -> StoreResult<()> {
    let bytes = to_canonical_cbor(record)?;
    let len = bytes.len();
    if len > u32::MAX as usize {
        return Err(StoreError::Corrupt("record larger than 4GiB".into()));
    }
    file.write_all(&(len as u32).to_le_bytes())?;
    file.write_all(&bytes)?;
    Ok(())
}

fn read_all_records(path: &Path) -> StoreResult<Vec<LogRecord>> {
    let mut file = File::open(path)?;
    let mut records = Vec::new();
    loop {
        let mut len_buf = [0u8; 4];
        let read = file.read(&mut len_buf)?;
        if read == 0 {
            break;
        }
        if read < len_buf.len() {
            return Err(StoreError::Corrupt(format!(
                "truncated length header (read {read} bytes)"
            )));
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut buf = vec![0u8; len];
        if let Err(err) = file.read_exact(&mut buf) {
            if err.kind() == ErrorKind::UnexpectedEof {
                return Err(StoreError::Corrupt("truncated record payload".into()));
            }
            return Err(err.into());
        }
        let record: LogRecord = serde_cbor::from_slice(&buf)?;
        records.push(record);
    }
    Ok(records)
}
