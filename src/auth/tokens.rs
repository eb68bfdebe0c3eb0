//! Token storage and management

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::codec;
use crate::models::Claims;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("session store I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("session store at {path} is corrupt: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to serialize session record: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("no session is stored")]
    NoSession,
}

/// The persisted session, written and replaced as one unit.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub access_token: String,
    /// Same as `access_token` when the backend issues no separate refresh token.
    pub refresh_token: String,
    pub saved_at: DateTime<Utc>,
    /// Cached claims of `access_token`.
    pub user: Claims,
}

impl SessionRecord {
    pub fn new(access_token: String, refresh_token: Option<String>, user: Claims) -> Self {
        let refresh_token = refresh_token.unwrap_or_else(|| access_token.clone());
        Self {
            access_token,
            refresh_token,
            saved_at: Utc::now(),
            user,
        }
    }

    /// Apply a refreshed access token, keeping a distinct refresh token unless
    /// a new one is supplied.
    pub(crate) fn rotate(
        &mut self,
        access_token: &str,
        refresh_token: Option<&str>,
        user: &Claims,
    ) {
        let shared = self.refresh_token == self.access_token;
        match refresh_token {
            Some(rt) => self.refresh_token = rt.to_string(),
            None if shared => self.refresh_token = access_token.to_string(),
            None => {}
        }
        self.access_token = access_token.to_string();
        self.user = user.clone();
        self.saved_at = Utc::now();
    }
}

impl fmt::Debug for SessionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRecord")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("saved_at", &self.saved_at)
            .field("user", &self.user)
            .finish()
    }
}

/// Token store trait for different storage backends
pub trait TokenStore: Send + Sync {
    /// Replace the stored session.
    fn save(&self, record: &SessionRecord) -> Result<(), StoreError>;
    fn load(&self) -> Result<Option<SessionRecord>, StoreError>;
    /// Remove every session key. No-op when nothing is stored.
    fn clear(&self) -> Result<(), StoreError>;
    /// Swap in a refreshed access token together with its claims.
    fn update_access_token(
        &self,
        access_token: &str,
        refresh_token: Option<&str>,
        user: &Claims,
    ) -> Result<(), StoreError>;
}

/// Non-durable store, for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    record: Mutex<Option<SessionRecord>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenStore for MemoryTokenStore {
    fn save(&self, record: &SessionRecord) -> Result<(), StoreError> {
        *self.record.lock().unwrap_or_else(|e| e.into_inner()) = Some(record.clone());
        Ok(())
    }

    fn load(&self) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self.record.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.record.lock().unwrap_or_else(|e| e.into_inner()).take();
        Ok(())
    }

    fn update_access_token(
        &self,
        access_token: &str,
        refresh_token: Option<&str>,
        user: &Claims,
    ) -> Result<(), StoreError> {
        let mut guard = self.record.lock().unwrap_or_else(|e| e.into_inner());
        let record = guard.as_mut().ok_or(StoreError::NoSession)?;
        record.rotate(access_token, refresh_token, user);
        Ok(())
    }
}

/// On-disk layout of the session file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    /// Bare token written by older client versions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    session: Option<SessionRecord>,
}

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Create `path` (it must not exist) and write `content`. On Unix the file is
/// owner-only from the moment it exists (contains tokens).
fn write_private(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(content)?;
    file.sync_all()
}

/// Durable store backed by a TOML file.
///
/// Writes land in a sibling temp file that is renamed over the target, so a
/// reader sees either the old record or the new one.
#[derive(Debug)]
pub struct FileTokenStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// Sibling temp file, unique per process and write.
    fn temp_path(&self) -> PathBuf {
        let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "session".to_string());
        self.path
            .with_file_name(format!(".{}.{}.{}.tmp", name, std::process::id(), seq))
    }

    fn read_file(&self) -> Result<StoreFile, StoreError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(StoreFile::default()),
            Err(e) => return Err(self.io_err(e)),
        };
        toml::from_str(&content).map_err(|source| StoreError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    fn write_file(&self, file: &StoreFile) -> Result<(), StoreError> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).map_err(|e| self.io_err(e))?;
        }

        let content = toml::to_string_pretty(file)?;
        let tmp = self.temp_path();
        if let Err(e) = write_private(&tmp, content.as_bytes()) {
            let _ = fs::remove_file(&tmp);
            return Err(self.io_err(e));
        }

        fs::rename(&tmp, &self.path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            self.io_err(e)
        })
    }

    fn migrate_legacy(&self, token: String) -> Result<Option<SessionRecord>, StoreError> {
        match codec::decode(&token) {
            Ok(user) => {
                let record = SessionRecord::new(token, None, user);
                self.write_file(&StoreFile {
                    token: None,
                    session: Some(record.clone()),
                })?;
                tracing::info!("Migrated legacy token into session record");
                Ok(Some(record))
            }
            Err(e) => {
                tracing::warn!("Dropping undecodable legacy token: {}", e);
                self.write_file(&StoreFile::default())?;
                Ok(None)
            }
        }
    }
}

impl TokenStore for FileTokenStore {
    fn save(&self, record: &SessionRecord) -> Result<(), StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.write_file(&StoreFile {
            token: None,
            session: Some(record.clone()),
        })
    }

    fn load(&self) -> Result<Option<SessionRecord>, StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let file = self.read_file()?;
        match (file.session, file.token) {
            (Some(record), None) => Ok(Some(record)),
            (Some(record), Some(_)) => {
                // Canonical record wins; the stale legacy key just goes away.
                self.write_file(&StoreFile {
                    token: None,
                    session: Some(record.clone()),
                })?;
                Ok(Some(record))
            }
            (None, Some(token)) => self.migrate_legacy(token),
            (None, None) => Ok(None),
        }
    }

    fn clear(&self) -> Result<(), StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_err(e)),
        }
    }

    fn update_access_token(
        &self,
        access_token: &str,
        refresh_token: Option<&str>,
        user: &Claims,
    ) -> Result<(), StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = self.read_file()?;
        let record = file.session.as_mut().ok_or(StoreError::NoSession)?;
        record.rotate(access_token, refresh_token, user);
        file.token = None;
        self.write_file(&file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::mint_token;

    fn claims(subject: &str) -> Claims {
        Claims {
            subject: subject.into(),
            role: "counselor".into(),
            issued_at: 10,
            expires_at: 20,
        }
    }

    fn file_store() -> (tempfile::TempDir, FileTokenStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::new(dir.path().join("nested").join("session.toml"));
        (dir, store)
    }

    #[test]
    fn test_file_store_save_and_load() {
        let (_dir, store) = file_store();
        assert!(store.load().unwrap().is_none());

        let record = SessionRecord::new("access".into(), Some("refresh".into()), claims("1"));
        store.save(&record).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded, record);
        assert!(!store.path().with_extension("toml.tmp").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_file_store_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let (_dir, store) = file_store();
        store
            .save(&SessionRecord::new("a".into(), None, claims("1")))
            .unwrap();
        let mode = fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[cfg(unix)]
    #[test]
    fn test_temp_file_is_private_from_creation() {
        use std::os::unix::fs::PermissionsExt;

        let (dir, store) = file_store();
        let tmp = store.temp_path();
        assert_ne!(tmp, store.temp_path());
        fs::create_dir_all(tmp.parent().unwrap()).unwrap();

        write_private(&tmp, b"secret").unwrap();
        let mode = fs::metadata(&tmp).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        // Never writes through an existing file.
        assert!(write_private(&tmp, b"again").is_err());
        assert!(tmp.starts_with(dir.path()));
    }

    #[test]
    fn test_save_leaves_no_temp_files() {
        let (dir, store) = file_store();
        store
            .save(&SessionRecord::new("a".into(), None, claims("1")))
            .unwrap();
        store
            .save(&SessionRecord::new("b".into(), None, claims("1")))
            .unwrap();

        let names: Vec<String> = fs::read_dir(dir.path().join("nested"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["session.toml".to_string()]);
    }

    #[test]
    fn test_clear_without_session_is_noop() {
        let (_dir, store) = file_store();
        store.clear().unwrap();
        store.clear().unwrap();

        let memory = MemoryTokenStore::new();
        memory.clear().unwrap();
    }

    #[test]
    fn test_clear_removes_record() {
        let (_dir, store) = file_store();
        store
            .save(&SessionRecord::new("a".into(), None, claims("1")))
            .unwrap();
        store.clear().unwrap();
        assert!(store.load().unwrap().is_none());
        assert!(!store.path().exists());
    }

    #[test]
    fn test_legacy_token_migrates() {
        let (_dir, store) = file_store();
        let token = mint_token("99", "teacher", 3600);
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(store.path(), format!("token = \"{}\"\n", token)).unwrap();

        let record = store.load().unwrap().unwrap();
        assert_eq!(record.access_token, token);
        assert_eq!(record.refresh_token, token);
        assert_eq!(record.user.subject, "99");
        assert_eq!(record.user.role, "teacher");

        let raw = fs::read_to_string(store.path()).unwrap();
        let doc: toml::Table = toml::from_str(&raw).unwrap();
        assert!(!doc.contains_key("token"));
        assert!(doc.contains_key("session"));

        // Second load reads the canonical record.
        assert_eq!(store.load().unwrap().unwrap(), record);
    }

    #[test]
    fn test_undecodable_legacy_token_is_dropped() {
        let (_dir, store) = file_store();
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(store.path(), "token = \"garbage\"\n").unwrap();

        assert!(store.load().unwrap().is_none());
        let raw = fs::read_to_string(store.path()).unwrap();
        assert!(!raw.contains("garbage"));
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let (_dir, store) = file_store();
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(store.path(), "session = [[[").unwrap();
        assert!(matches!(store.load(), Err(StoreError::Parse { .. })));
    }

    #[test]
    fn test_update_access_token_shared_refresh() {
        let store = MemoryTokenStore::new();
        store
            .save(&SessionRecord::new("old".into(), None, claims("1")))
            .unwrap();

        store.update_access_token("new", None, &claims("2")).unwrap();
        let record = store.load().unwrap().unwrap();
        assert_eq!(record.access_token, "new");
        assert_eq!(record.refresh_token, "new");
        assert_eq!(record.user.subject, "2");
    }

    #[test]
    fn test_update_access_token_keeps_distinct_refresh() {
        let (_dir, store) = file_store();
        store
            .save(&SessionRecord::new("old".into(), Some("rt".into()), claims("1")))
            .unwrap();

        store.update_access_token("new", None, &claims("1")).unwrap();
        let record = store.load().unwrap().unwrap();
        assert_eq!(record.access_token, "new");
        assert_eq!(record.refresh_token, "rt");

        store
            .update_access_token("newer", Some("rt2"), &claims("1"))
            .unwrap();
        assert_eq!(store.load().unwrap().unwrap().refresh_token, "rt2");
    }

    #[test]
    fn test_update_without_session_fails() {
        let (_dir, store) = file_store();
        assert!(matches!(
            store.update_access_token("x", None, &claims("1")),
            Err(StoreError::NoSession)
        ));
    }

    #[test]
    fn test_debug_redacts_tokens() {
        let record = SessionRecord::new("secret-access".into(), None, claims("1"));
        let printed = format!("{:?}", record);
        assert!(!printed.contains("secret-access"));
    }
}
