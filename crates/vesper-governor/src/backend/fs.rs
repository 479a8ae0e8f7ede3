//! Directory-backed durable storage
//!
//! Layout under the root directory:
//!
//! ```text
//! <root>/<database>/VERSION
//! <root>/<database>/<store>/<hex key>.bin
//! <root>/<database>/<store>/<xxh3 of key>.long
//! <root>/<database>/.staging/<n>.tmp
//! ```
//!
//! Hex names double the key length, so keys over [`MAX_NAMED_KEY_BYTES`]
//! are filed under their hash instead. A `.long` file starts with the key
//! itself (u32 little-endian length, then the bytes) followed by the value.
//!
//! Writes are staged to temporary files and renamed into place on commit.
//! Commits on one database are serialized.

use super::{
    pending_keys, pending_value, DurableBlobStore, DurableDatabase, DurableTransaction, PendingOp,
    TransactionMode,
};
use crate::{GovernorError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use xxhash_rust::xxh3::xxh3_64;

const VERSION_FILE: &str = "VERSION";
const STAGING_DIR: &str = ".staging";
const LONG_KEY_SUFFIX: &str = ".long";

/// Longest key stored under a readable hex name
pub const MAX_NAMED_KEY_BYTES: usize = 100;

/// Durable store rooted at a directory
#[derive(Debug, Clone)]
pub struct FsDurableStore {
    root: PathBuf,
}

impl FsDurableStore {
    /// Use `root`, creating it on first open
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn is_long_key(key: &str) -> bool {
    key.len() > MAX_NAMED_KEY_BYTES
}

fn encode_key(key: &str) -> String {
    if is_long_key(key) {
        return format!("{:016x}{LONG_KEY_SUFFIX}", xxh3_64(key.as_bytes()));
    }
    let mut name = String::with_capacity(key.len() * 2 + 4);
    for byte in key.as_bytes() {
        name.push_str(&format!("{byte:02x}"));
    }
    name.push_str(".bin");
    name
}

fn decode_key(file_name: &str) -> Option<String> {
    let hex = file_name.strip_suffix(".bin")?;
    if hex.len() % 2 != 0 {
        return None;
    }
    let bytes = (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect::<Option<Vec<u8>>>()?;
    String::from_utf8(bytes).ok()
}

/// File contents for `key`; long keys carry the key ahead of the value
fn frame_value(key: &str, value: &Bytes) -> Bytes {
    if !is_long_key(key) {
        return value.clone();
    }
    let mut framed = BytesMut::with_capacity(4 + key.len() + value.len());
    framed.put_u32_le(key.len() as u32);
    framed.put_slice(key.as_bytes());
    framed.put_slice(value);
    framed.freeze()
}

/// Split a `.long` file into its key and value
fn unframe_value(mut data: Bytes) -> Option<(String, Bytes)> {
    if data.len() < 4 {
        return None;
    }
    let key_len = data.get_u32_le() as usize;
    if data.len() < key_len {
        return None;
    }
    let key = String::from_utf8(data.split_to(key_len).to_vec()).ok()?;
    Some((key, data))
}

async fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait::async_trait]
impl DurableBlobStore for FsDurableStore {
    async fn open(
        &self,
        name: &str,
        version: u32,
        stores: &[String],
    ) -> Result<Arc<dyn DurableDatabase>> {
        let dir = self.root.join(name);
        fs::create_dir_all(&dir).await.map_err(|e| {
            GovernorError::StorageUnavailable(format!("cannot create {}: {e}", dir.display()))
        })?;

        let version_path = dir.join(VERSION_FILE);
        match fs::read_to_string(&version_path).await {
            Ok(text) => {
                let current: u32 = text.trim().parse().map_err(|_| GovernorError::CorruptRecord {
                    key: version_path.display().to_string(),
                    reason: "unreadable version".into(),
                })?;
                if current > version {
                    return Err(GovernorError::StorageUnavailable(format!(
                        "database {name} is at version {current}, cannot open at {version}"
                    )));
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        fs::write(&version_path, version.to_string()).await?;

        for store in stores {
            fs::create_dir_all(dir.join(store)).await?;
        }
        let staging = dir.join(STAGING_DIR);
        if fs::metadata(&staging).await.is_ok() {
            fs::remove_dir_all(&staging).await?;
        }
        fs::create_dir_all(&staging).await?;

        debug!("Opened database {} at version {}", dir.display(), version);
        Ok(Arc::new(FsDatabase {
            state: Arc::new(FsDatabaseState {
                dir,
                commit_lock: Mutex::new(()),
                staged: AtomicU64::new(0),
            }),
        }))
    }
}

#[derive(Debug)]
struct FsDatabaseState {
    dir: PathBuf,
    commit_lock: Mutex<()>,
    staged: AtomicU64,
}

#[derive(Debug)]
struct FsDatabase {
    state: Arc<FsDatabaseState>,
}

#[async_trait::async_trait]
impl DurableDatabase for FsDatabase {
    async fn transaction(
        &self,
        stores: &[&str],
        mode: TransactionMode,
    ) -> Result<Box<dyn DurableTransaction>> {
        for store in stores {
            if fs::metadata(self.state.dir.join(store)).await.is_err() {
                return Err(GovernorError::Backend(format!(
                    "object store {store} does not exist"
                )));
            }
        }
        Ok(Box::new(FsTransaction {
            state: self.state.clone(),
            scope: stores.iter().map(|s| s.to_string()).collect(),
            mode,
            ops: Vec::new(),
        }))
    }
}

struct FsTransaction {
    state: Arc<FsDatabaseState>,
    scope: Vec<String>,
    mode: TransactionMode,
    ops: Vec<PendingOp>,
}

impl FsTransaction {
    fn store_dir(&self, store: &str) -> Result<PathBuf> {
        if self.scope.iter().any(|s| s == store) {
            Ok(self.state.dir.join(store))
        } else {
            Err(GovernorError::Backend(format!(
                "object store {store} is not in the transaction scope"
            )))
        }
    }

    fn writable(&self, store: &str) -> Result<()> {
        self.store_dir(store)?;
        if self.mode == TransactionMode::ReadOnly {
            return Err(GovernorError::Backend(
                "write attempted in a read-only transaction".into(),
            ));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl DurableTransaction for FsTransaction {
    async fn get(&mut self, store: &str, key: &str) -> Result<Option<Bytes>> {
        let dir = self.store_dir(store)?;
        if let Some(pending) = pending_value(&self.ops, store, key) {
            return Ok(pending);
        }
        let data = match fs::read(dir.join(encode_key(key))).await {
            Ok(data) => Bytes::from(data),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if !is_long_key(key) {
            return Ok(Some(data));
        }
        match unframe_value(data) {
            Some((stored, value)) if stored == key => Ok(Some(value)),
            // Another key with the same hash
            Some(_) => Ok(None),
            None => Err(GovernorError::CorruptRecord {
                key: key.to_string(),
                reason: "truncated key header".into(),
            }),
        }
    }

    async fn put(&mut self, store: &str, key: &str, value: Bytes) -> Result<()> {
        self.writable(store)?;
        self.ops.push(PendingOp::Put {
            store: store.to_string(),
            key: key.to_string(),
            value,
        });
        Ok(())
    }

    async fn delete(&mut self, store: &str, key: &str) -> Result<()> {
        self.writable(store)?;
        self.ops.push(PendingOp::Delete {
            store: store.to_string(),
            key: key.to_string(),
        });
        Ok(())
    }

    async fn clear(&mut self, store: &str) -> Result<()> {
        self.writable(store)?;
        self.ops.push(PendingOp::Clear {
            store: store.to_string(),
        });
        Ok(())
    }

    async fn keys(&mut self, store: &str) -> Result<Vec<String>> {
        let dir = self.store_dir(store)?;
        let mut keys = Vec::new();
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.ends_with(LONG_KEY_SUFFIX) {
                let data = Bytes::from(fs::read(entry.path()).await?);
                match unframe_value(data) {
                    Some((key, _)) => keys.push(key),
                    None => warn!("Skipping unreadable long-key file {}", name),
                }
            } else if let Some(key) = decode_key(name) {
                keys.push(key);
            }
        }
        Ok(pending_keys(&self.ops, store, keys))
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        if self.ops.is_empty() {
            return Ok(());
        }
        let state = self.state.clone();
        let _guard = state.commit_lock.lock().await;
        let staging = state.dir.join(STAGING_DIR);

        // Stage every put before touching live files
        let mut staged = Vec::new();
        for op in &self.ops {
            if let PendingOp::Put { key, value, .. } = op {
                let n = state.staged.fetch_add(1, Ordering::SeqCst);
                let tmp = staging.join(format!("{n}.tmp"));
                if let Err(e) = fs::write(&tmp, frame_value(key, value)).await {
                    for path in &staged {
                        let _ = fs::remove_file(path).await;
                    }
                    return Err(e.into());
                }
                staged.push(tmp);
            }
        }

        let mut staged = staged.into_iter();
        for op in &self.ops {
            match op {
                PendingOp::Put { store, key, .. } => {
                    if let Some(tmp) = staged.next() {
                        fs::rename(&tmp, state.dir.join(store).join(encode_key(key))).await?;
                    }
                }
                PendingOp::Delete { store, key } => {
                    remove_if_present(&state.dir.join(store).join(encode_key(key))).await?;
                }
                PendingOp::Clear { store } => {
                    let dir = state.dir.join(store);
                    fs::remove_dir_all(&dir).await?;
                    fs::create_dir_all(&dir).await?;
                }
            }
        }
        debug!(
            "Committed {} ops to {}",
            self.ops.len(),
            state.dir.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stores() -> Vec<String> {
        vec!["tensors".to_string()]
    }

    #[test]
    fn test_key_encoding() {
        let name = encode_key("model/unet@3#0");
        assert!(name.ends_with(".bin"));
        assert!(!name.contains('/'));
        assert_eq!(decode_key(&name).as_deref(), Some("model/unet@3#0"));
        assert_eq!(decode_key("zz.bin"), None);
        assert_eq!(decode_key("notes.txt"), None);

        let long = "k".repeat(MAX_NAMED_KEY_BYTES + 1);
        let name = encode_key(&long);
        assert!(name.ends_with(LONG_KEY_SUFFIX));
        assert_eq!(name.len(), 16 + LONG_KEY_SUFFIX.len());
        assert_eq!(decode_key(&name), None);
    }

    #[tokio::test]
    async fn test_long_keys_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let db = FsDurableStore::new(dir.path())
            .open("vesper", 1, &stores())
            .await
            .unwrap();
        let long = format!("model/{}#0", "x".repeat(300));

        let mut tx = db
            .transaction(&["tensors"], TransactionMode::ReadWrite)
            .await
            .unwrap();
        tx.put("tensors", &long, Bytes::from_static(b"payload")).await.unwrap();
        tx.put("tensors", "short", Bytes::from_static(b"s")).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = db
            .transaction(&["tensors"], TransactionMode::ReadOnly)
            .await
            .unwrap();
        assert_eq!(
            tx.get("tensors", &long).await.unwrap(),
            Some(Bytes::from_static(b"payload"))
        );
        let mut keys = tx.keys("tensors").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec![long.clone(), "short".to_string()]);

        let mut tx = db
            .transaction(&["tensors"], TransactionMode::ReadWrite)
            .await
            .unwrap();
        tx.delete("tensors", &long).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = db
            .transaction(&["tensors"], TransactionMode::ReadOnly)
            .await
            .unwrap();
        assert_eq!(tx.get("tensors", &long).await.unwrap(), None);
        assert_eq!(tx.keys("tensors").await.unwrap(), vec!["short".to_string()]);
    }

    #[tokio::test]
    async fn test_commit_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let host = FsDurableStore::new(dir.path());

        let db = host.open("vesper", 1, &stores()).await.unwrap();
        let mut tx = db
            .transaction(&["tensors"], TransactionMode::ReadWrite)
            .await
            .unwrap();
        tx.put("tensors", "a", Bytes::from_static(b"alpha")).await.unwrap();
        tx.put("tensors", "b", Bytes::from_static(b"beta")).await.unwrap();
        tx.delete("tensors", "b").await.unwrap();
        tx.commit().await.unwrap();

        let db = FsDurableStore::new(dir.path())
            .open("vesper", 1, &stores())
            .await
            .unwrap();
        let mut tx = db
            .transaction(&["tensors"], TransactionMode::ReadOnly)
            .await
            .unwrap();
        assert_eq!(
            tx.get("tensors", "a").await.unwrap(),
            Some(Bytes::from_static(b"alpha"))
        );
        assert_eq!(tx.get("tensors", "b").await.unwrap(), None);
        assert_eq!(tx.keys("tensors").await.unwrap(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_uncommitted_writes_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let host = FsDurableStore::new(dir.path());
        let db = host.open("vesper", 1, &stores()).await.unwrap();

        let mut tx = db
            .transaction(&["tensors"], TransactionMode::ReadWrite)
            .await
            .unwrap();
        tx.put("tensors", "a", Bytes::from_static(b"x")).await.unwrap();
        drop(tx);

        let mut tx = db
            .transaction(&["tensors"], TransactionMode::ReadOnly)
            .await
            .unwrap();
        assert!(tx.keys("tensors").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clear_then_put() {
        let dir = tempfile::tempdir().unwrap();
        let db = FsDurableStore::new(dir.path())
            .open("vesper", 1, &stores())
            .await
            .unwrap();

        let mut tx = db
            .transaction(&["tensors"], TransactionMode::ReadWrite)
            .await
            .unwrap();
        tx.put("tensors", "old", Bytes::from_static(b"1")).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = db
            .transaction(&["tensors"], TransactionMode::ReadWrite)
            .await
            .unwrap();
        tx.clear("tensors").await.unwrap();
        tx.put("tensors", "new", Bytes::from_static(b"2")).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = db
            .transaction(&["tensors"], TransactionMode::ReadOnly)
            .await
            .unwrap();
        assert_eq!(tx.keys("tensors").await.unwrap(), vec!["new".to_string()]);
    }

    #[tokio::test]
    async fn test_version_downgrade_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let host = FsDurableStore::new(dir.path());
        host.open("vesper", 2, &stores()).await.unwrap();
        assert!(matches!(
            host.open("vesper", 1, &stores()).await,
            Err(GovernorError::StorageUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_store_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let db = FsDurableStore::new(dir.path())
            .open("vesper", 1, &stores())
            .await
            .unwrap();
        assert!(db
            .transaction(&["missing"], TransactionMode::ReadOnly)
            .await
            .is_err());
    }
}
