use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, info, warn};

use crate::credentials::{normalize_email, CredentialRecord};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid credential key: {0}")]
    InvalidKey(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("persist error: {0}")]
    Persist(String),
}

/// Durable credential storage keyed by user email.
pub trait CredentialStore: Send + Sync {
    fn load(&self, user_email: &str) -> Result<Option<CredentialRecord>, StoreError>;
    /// Whole-record overwrite.
    fn save(&self, user_email: &str, record: &CredentialRecord) -> Result<(), StoreError>;
    /// Returns whether a record existed.
    fn delete(&self, user_email: &str) -> Result<bool, StoreError>;
    /// First decodable record, for single-user mode. Unreadable entries are skipped.
    fn find_any(&self) -> Option<(String, CredentialRecord)>;
    fn list_users(&self) -> Vec<String>;
}

fn validate_key(user_email: &str) -> Result<String, StoreError> {
    let key = normalize_email(user_email);
    if key.is_empty()
        || key.contains('/')
        || key.contains('\\')
        || key.contains("..")
        || key.starts_with('.')
        || key.chars().any(|c| c.is_control())
    {
        return Err(StoreError::InvalidKey(user_email.to_string()));
    }
    Ok(key)
}

/// A simple in-memory store, mainly for testing.
pub struct MemoryCredentialStore {
    map: Mutex<HashMap<String, CredentialRecord>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load(&self, user_email: &str) -> Result<Option<CredentialRecord>, StoreError> {
        let key = validate_key(user_email)?;
        let map = self
            .map
            .lock()
            .map_err(|e| StoreError::Unavailable(format!("lock poisoned: {}", e)))?;
        Ok(map.get(&key).cloned())
    }

    fn save(&self, user_email: &str, record: &CredentialRecord) -> Result<(), StoreError> {
        let key = validate_key(user_email)?;
        self.map
            .lock()
            .map_err(|e| StoreError::Persist(format!("lock poisoned: {}", e)))?
            .insert(key, record.clone());
        Ok(())
    }

    fn delete(&self, user_email: &str) -> Result<bool, StoreError> {
        let key = validate_key(user_email)?;
        Ok(self
            .map
            .lock()
            .map_err(|e| StoreError::Persist(format!("lock poisoned: {}", e)))?
            .remove(&key)
            .is_some())
    }

    fn find_any(&self) -> Option<(String, CredentialRecord)> {
        let map = self.map.lock().ok()?;
        let mut keys: Vec<&String> = map.keys().collect();
        keys.sort();
        let key = keys.first()?;
        map.get(*key).map(|r| ((*key).clone(), r.clone()))
    }

    fn list_users(&self) -> Vec<String> {
        let mut users: Vec<String> = self
            .map
            .lock()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        users.sort();
        users
    }
}

/// One `<email>.json` file per user under a credentials directory.
///
/// Default location is `~/.microsoft_teams_mcp/credentials`, or `./.credentials`
/// when no home directory can be resolved.
pub struct FileCredentialStore {
    dir: PathBuf,
}

impl FileCredentialStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn new_default() -> Self {
        Self::new(default_credentials_dir())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn credential_path(&self, user_email: &str) -> Result<PathBuf, StoreError> {
        let key = validate_key(user_email)?;
        Ok(self.dir.join(format!("{}.json", key)))
    }

    fn read_record(path: &Path) -> Result<CredentialRecord, StoreError> {
        let raw = fs::read_to_string(path)
            .map_err(|e| StoreError::Unavailable(format!("{}: {}", path.display(), e)))?;
        serde_json::from_str(&raw)
            .map_err(|e| StoreError::Unavailable(format!("{}: malformed: {}", path.display(), e)))
    }

    fn ensure_dir(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir)
            .map_err(|e| StoreError::Persist(format!("{}: {}", self.dir.display(), e)))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o700);
            if let Err(e) = fs::set_permissions(&self.dir, perms) {
                debug!("Could not restrict credentials dir permissions: {}", e);
            }
        }
        Ok(())
    }

    fn json_files(&self) -> Vec<PathBuf> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(dir = %self.dir.display(), "Credentials dir not readable: {}", e);
                return Vec::new();
            }
        };
        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        files.sort();
        files
    }
}

pub fn default_credentials_dir() -> PathBuf {
    match dirs::home_dir() {
        Some(home) => home.join(".microsoft_teams_mcp").join("credentials"),
        None => PathBuf::from(".credentials"),
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self, user_email: &str) -> Result<Option<CredentialRecord>, StoreError> {
        let path = self.credential_path(user_email)?;
        if !path.exists() {
            return Ok(None);
        }
        Self::read_record(&path).map(Some)
    }

    fn save(&self, user_email: &str, record: &CredentialRecord) -> Result<(), StoreError> {
        let path = self.credential_path(user_email)?;
        self.ensure_dir()?;

        let body = serde_json::to_string_pretty(record)
            .map_err(|e| StoreError::Persist(format!("serde: {}", e)))?;
        let tmp = path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4().simple()));

        let write = || -> Result<(), StoreError> {
            fs::write(&tmp, &body).map_err(|e| StoreError::Persist(e.to_string()))?;

            // Set restrictive permissions on Unix (owner read/write only)
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let perms = fs::Permissions::from_mode(0o600);
                fs::set_permissions(&tmp, perms)
                    .map_err(|e| StoreError::Persist(format!("chmod: {}", e)))?;
            }

            fs::rename(&tmp, &path).map_err(|e| StoreError::Persist(format!("rename: {}", e)))
        };

        if let Err(e) = write() {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }

        info!(path = %path.display(), "Stored credentials");
        Ok(())
    }

    fn delete(&self, user_email: &str) -> Result<bool, StoreError> {
        let path = self.credential_path(user_email)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                info!(path = %path.display(), "Deleted credentials");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::Persist(format!("{}: {}", path.display(), e))),
        }
    }

    fn find_any(&self) -> Option<(String, CredentialRecord)> {
        for path in self.json_files() {
            let Some(user_email) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string)
            else {
                continue;
            };
            match Self::read_record(&path) {
                Ok(record) => {
                    info!(user_email = %user_email, "Using stored credentials (single-user mode)");
                    return Some((user_email, record));
                }
                Err(e) => warn!("Skipping unreadable credential file: {}", e),
            }
        }
        None
    }

    fn list_users(&self) -> Vec<String> {
        self.json_files()
            .iter()
            .filter_map(|p| p.file_stem().and_then(|s| s.to_str()).map(str::to_string))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn sample() -> CredentialRecord {
        CredentialRecord {
            access_token: Some("at".into()),
            refresh_token: Some("rt".into()),
            expiry: Some(Utc::now() + Duration::hours(1)),
            ..Default::default()
        }
    }

    #[test]
    fn test_rejects_path_like_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path());
        for bad in ["", "../evil@example.com", "a/b@example.com", "a\\b", ".hidden"] {
            assert!(matches!(
                store.save(bad, &sample()),
                Err(StoreError::InvalidKey(_))
            ));
        }
    }

    #[test]
    fn test_keys_are_case_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path());
        store.save("Alice@Example.com", &sample()).unwrap();
        assert!(store.load("alice@example.com").unwrap().is_some());
        assert_eq!(store.list_users(), vec!["alice@example.com".to_string()]);
    }

    #[test]
    fn test_save_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path());
        store.save("alice@example.com", &sample()).unwrap();
        store.save("alice@example.com", &sample()).unwrap();
        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["alice@example.com.json".to_string()]);
    }

    #[cfg(unix)]
    #[test]
    fn test_file_mode_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path());
        store.save("alice@example.com", &sample()).unwrap();
        let path = store.credential_path("alice@example.com").unwrap();
        let mode = fs::metadata(path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn test_delete_reports_presence() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path());
        assert!(!store.delete("alice@example.com").unwrap());
        store.save("alice@example.com", &sample()).unwrap();
        assert!(store.delete("alice@example.com").unwrap());
        assert!(store.load("alice@example.com").unwrap().is_none());
    }

    #[test]
    fn test_memory_store_find_any_is_ordered() {
        let store = MemoryCredentialStore::new();
        assert!(store.find_any().is_none());
        store.save("zed@example.com", &sample()).unwrap();
        store.save("amy@example.com", &sample()).unwrap();
        assert_eq!(store.find_any().unwrap().0, "amy@example.com");
    }
}
