//! Token persistence
//!
//! The deployment holds exactly one `TokenSet`. It is read on every API call
//! and replaced whole after every successful refresh. Backends implement
//! `TokenStore`; the RPC client only ever sees `Arc<dyn TokenStore>`.
//!
//! `FileTokenStore` re-reads the file on every `load` because the gateway may
//! run as many short-lived processes sharing one file. There is no locking:
//! the last writer wins.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::constants::TOKEN_STORE_KEY;
use crate::error::{Error, Result};

/// Access/refresh credential pair plus the tenant's API host.
///
/// Always replaced as a unit; there is no way to update one field in place.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSet {
    /// Short-lived bearer credential sent as `auth` on every call
    pub access_token: String,
    /// Rotates on every refresh
    pub refresh_token: String,
    /// Tenant API host, e.g. `acme.bitrix24.com`
    pub domain: String,
}

impl TokenSet {
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        domain: impl Into<String>,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            domain: domain.into(),
        }
    }
}

impl fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSet")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("domain", &self.domain)
            .finish()
    }
}

/// Durable home of the deployment's single `TokenSet`.
///
/// Uses `Pin<Box<dyn Future>>` return types so stores can be shared as
/// `Arc<dyn TokenStore>`.
pub trait TokenStore: Send + Sync {
    /// Read the current record. `Ok(None)` means the app was never installed.
    fn load(&self) -> Pin<Box<dyn Future<Output = Result<Option<TokenSet>>> + Send + '_>>;

    /// Replace the record as a whole.
    fn save<'a>(
        &'a self,
        tokens: &'a TokenSet,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

/// JSON file mapping record keys to token sets; the record lives under
/// `TOKEN_STORE_KEY`.
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_records(&self) -> Result<Option<HashMap<String, TokenSet>>> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "token file not found");
                return Ok(None);
            }
            Err(e) => {
                return Err(Error::StoreUnavailable(format!(
                    "reading {}: {e}",
                    self.path.display()
                )));
            }
        };
        let records = serde_json::from_str(&contents).map_err(|e| {
            Error::StoreUnavailable(format!("parsing {}: {e}", self.path.display()))
        })?;
        Ok(Some(records))
    }
}

impl TokenStore for FileTokenStore {
    fn load(&self) -> Pin<Box<dyn Future<Output = Result<Option<TokenSet>>> + Send + '_>> {
        Box::pin(async move {
            let tokens = self
                .read_records()
                .await?
                .and_then(|mut records| records.remove(TOKEN_STORE_KEY));
            debug!(found = tokens.is_some(), "loaded token set");
            Ok(tokens)
        })
    }

    fn save<'a>(
        &'a self,
        tokens: &'a TokenSet,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let mut records = HashMap::with_capacity(1);
            records.insert(TOKEN_STORE_KEY.to_string(), tokens.clone());
            write_atomic(&self.path, &records).await
        })
    }
}

/// Write the record map atomically.
///
/// Writes a temp file next to the target, created 0600 on unix since it holds
/// live tokens, and renames it over the target. The temp name carries the pid
/// and a counter so concurrent saves never share a temp file. A failed save
/// removes its temp file.
async fn write_atomic(path: &Path, records: &HashMap<String, TokenSet>) -> Result<()> {
    static COUNTER: AtomicU32 = AtomicU32::new(0);

    let json = serde_json::to_string_pretty(records)
        .map_err(|e| Error::StoreUnavailable(format!("serializing token set: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::StoreUnavailable("token path has no parent directory".into()))?;

    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let tmp_path = dir.join(format!(".tokens.tmp.{}.{seq}", std::process::id()));

    if let Err(e) = write_private(&tmp_path, json.as_bytes()).await {
        discard(&tmp_path).await;
        return Err(Error::StoreUnavailable(format!("writing temp token file: {e}")));
    }

    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        discard(&tmp_path).await;
        return Err(Error::StoreUnavailable(format!("renaming temp token file: {e}")));
    }

    debug!(path = %path.display(), "persisted token set");
    Ok(())
}

async fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await?;
    file.write_all(contents).await?;
    file.sync_all().await
}

async fn discard(tmp_path: &Path) {
    if let Err(e) = tokio::fs::remove_file(tmp_path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %tmp_path.display(), error = %e, "could not remove temp token file");
    }
}

/// In-process store. Counts writes so callers can check whether a code path
/// touched persistence at all.
#[derive(Default)]
pub struct MemoryTokenStore {
    tokens: Mutex<Option<TokenSet>>,
    writes: AtomicUsize,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tokens(tokens: TokenSet) -> Self {
        Self {
            tokens: Mutex::new(Some(tokens)),
            writes: AtomicUsize::new(0),
        }
    }

    /// Number of `save` calls so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Current record without going through the trait.
    pub async fn snapshot(&self) -> Option<TokenSet> {
        self.tokens.lock().await.clone()
    }
}

impl TokenStore for MemoryTokenStore {
    fn load(&self) -> Pin<Box<dyn Future<Output = Result<Option<TokenSet>>> + Send + '_>> {
        Box::pin(async move { Ok(self.tokens.lock().await.clone()) })
    }

    fn save<'a>(
        &'a self,
        tokens: &'a TokenSet,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            *self.tokens.lock().await = Some(tokens.clone());
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TokenSet {
        TokenSet::new("A1", "R1", "x.example")
    }

    #[tokio::test]
    async fn missing_file_loads_as_not_installed() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::new(dir.path().join("tokens.json"));

        assert!(store.load().await.unwrap().is_none());
        assert!(!store.path().exists(), "load must not create the file");
    }

    #[tokio::test]
    async fn roundtrip_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");

        FileTokenStore::new(path.clone())
            .save(&sample())
            .await
            .unwrap();

        // A fresh instance stands in for the next process invocation
        let loaded = FileTokenStore::new(path).load().await.unwrap().unwrap();
        assert_eq!(loaded, sample());
    }

    #[tokio::test]
    async fn save_replaces_whole_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::new(dir.path().join("tokens.json"));

        store.save(&sample()).await.unwrap();
        let next = TokenSet::new("A2", "R2", "y.example");
        store.save(&next).await.unwrap();

        assert_eq!(store.load().await.unwrap().unwrap(), next);
    }

    #[tokio::test]
    async fn record_is_stored_under_fixed_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        FileTokenStore::new(path.clone())
            .save(&sample())
            .await
            .unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&tokio::fs::read_to_string(&path).await.unwrap()).unwrap();
        assert_eq!(raw[TOKEN_STORE_KEY]["access_token"], "A1");
        assert_eq!(raw[TOKEN_STORE_KEY]["refresh_token"], "R1");
        assert_eq!(raw[TOKEN_STORE_KEY]["domain"], "x.example");
    }

    #[tokio::test]
    async fn file_without_record_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        tokio::fs::write(&path, "{}").await.unwrap();

        assert!(FileTokenStore::new(path).load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupt_file_is_store_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        tokio::fs::write(&path, "not json {{").await.unwrap();

        let err = FileTokenStore::new(path).load().await.unwrap_err();
        assert!(matches!(err, Error::StoreUnavailable(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn unwritable_location_is_store_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::new(dir.path().join("missing-dir").join("tokens.json"));

        let err = store.save(&sample()).await.unwrap_err();
        assert!(matches!(err, Error::StoreUnavailable(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn failed_rename_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        // A directory at the target path makes the final rename fail
        let path = dir.path().join("tokens.json");
        tokio::fs::create_dir(&path).await.unwrap();

        let err = FileTokenStore::new(path).save(&sample()).await.unwrap_err();
        assert!(matches!(err, Error::StoreUnavailable(_)), "got {err:?}");

        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        let mut names = vec![];
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names, vec!["tokens.json".to_string()]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_permissions_are_0600() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        FileTokenStore::new(path.clone())
            .save(&sample())
            .await
            .unwrap();

        let mode = tokio::fs::metadata(&path).await.unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "token file must be 0600, got {mode:o}");
    }

    #[tokio::test]
    async fn concurrent_saves_leave_a_valid_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        let store = std::sync::Arc::new(FileTokenStore::new(path.clone()));

        let mut handles = vec![];
        for i in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let tokens = TokenSet::new(format!("A{i}"), format!("R{i}"), "x.example");
                store.save(&tokens).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        // Last writer wins; whichever it was, the file must parse whole
        let loaded = store.load().await.unwrap().unwrap();
        assert!(loaded.access_token.starts_with('A'));
        assert_eq!(
            loaded.access_token[1..],
            loaded.refresh_token[1..],
            "access and refresh must come from the same save"
        );
    }

    #[test]
    fn debug_redacts_tokens() {
        let debug = format!("{:?}", sample());
        assert!(!debug.contains("A1"));
        assert!(!debug.contains("R1"));
        assert!(debug.contains("x.example"));
    }

    #[tokio::test]
    async fn memory_store_counts_writes() {
        let store = MemoryTokenStore::with_tokens(sample());
        assert_eq!(store.load().await.unwrap(), Some(sample()));
        assert_eq!(store.writes(), 0);

        let next = TokenSet::new("A2", "R2", "x.example");
        store.save(&next).await.unwrap();
        assert_eq!(store.writes(), 1);
        assert_eq!(store.snapshot().await, Some(next));
    }

    #[tokio::test]
    async fn empty_memory_store_is_not_installed() {
        assert!(MemoryTokenStore::new().load().await.unwrap().is_none());
    }
}
