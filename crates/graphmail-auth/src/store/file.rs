//! JSON file store with atomic replacement and advisory locking.

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, warn};

use super::{CredentialStore, StoreError};
use crate::token::TokenSet;

/// Stores the credential record as a JSON file readable only by its owner.
///
/// Writers hold an exclusive lock on a sidecar `<record>.lock` file while they
/// replace the record; readers take a shared lock on it when they can.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    path: PathBuf,
    account: String,
}

impl FileCredentialStore {
    /// Creates a store for `account` backed by the file at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, account: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            account: account.into(),
        }
    }

    /// Path of the credential record.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(".lock");
        PathBuf::from(name)
    }

    fn directory(&self) -> PathBuf {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    fn open_lock(&self) -> io::Result<File> {
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.lock_path())
    }

    /// Exclusive lock held for the lifetime of the returned file.
    fn lock_exclusive(&self) -> Result<File, StoreError> {
        fs::create_dir_all(self.directory())?;
        let lock = self.open_lock()?;
        lock.lock()?;
        Ok(lock)
    }

    /// Shared lock, or `None` when the lock file cannot be opened or locked.
    fn lock_shared(&self) -> Option<File> {
        let lock = self.open_lock().ok()?;
        match lock.lock_shared() {
            Ok(()) => Some(lock),
            Err(e) => {
                debug!("Reading credential record without a lock: {e}");
                None
            }
        }
    }

    fn read_record(&self) -> Option<TokenSet> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No credential record");
                return None;
            }
            Err(e) => {
                warn!(path = %self.path.display(), "Failed to read credential record: {e}");
                return None;
            }
        };

        warn_if_exposed(&self.path);

        let tokens: TokenSet = match serde_json::from_str(&contents) {
            Ok(tokens) => tokens,
            Err(e) => {
                warn!(path = %self.path.display(), "Ignoring unreadable credential record: {e}");
                return None;
            }
        };

        if tokens.account != self.account {
            warn!(
                path = %self.path.display(),
                stored = %tokens.account,
                expected = %self.account,
                "Ignoring credential record for a different account"
            );
            return None;
        }

        Some(tokens)
    }

    /// Deletes the record file. Caller holds the exclusive lock.
    fn remove_record(&self) -> Result<bool, StoreError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "Removed credential record");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self) -> Option<TokenSet> {
        let _lock = self.lock_shared();
        self.read_record()
    }

    fn save(&self, tokens: &TokenSet) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(tokens)?;
        let _lock = self.lock_exclusive()?;

        let mut temp = NamedTempFile::new_in(self.directory())?;
        restrict_permissions(temp.as_file())?;
        temp.write_all(&json)?;
        temp.as_file().sync_all()?;
        temp.persist(&self.path)?;

        debug!(path = %self.path.display(), "Saved credential record");
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        let _lock = self.lock_exclusive()?;
        self.remove_record()?;
        Ok(())
    }

    fn clear_if(&self, stale: &dyn Fn(&TokenSet) -> bool) -> Result<bool, StoreError> {
        let _lock = self.lock_exclusive()?;
        match self.read_record() {
            Some(record) if stale(&record) => self.remove_record(),
            _ => Ok(false),
        }
    }
}

#[cfg(unix)]
fn restrict_permissions(file: &File) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
#[allow(clippy::unnecessary_wraps)]
const fn restrict_permissions(_file: &File) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn warn_if_exposed(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(meta) = fs::metadata(path) {
        let mode = meta.permissions().mode() & 0o777;
        if mode & 0o077 != 0 {
            warn!(
                path = %path.display(),
                mode = %format!("{mode:o}"),
                "Credential record is readable by other users; expected 600"
            );
        }
    }
}

#[cfg(not(unix))]
const fn warn_if_exposed(_path: &Path) {}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::{DateTime, Utc};
    use proptest::prelude::*;

    use super::*;
    use crate::token::parse_scope;

    fn tokens(account: &str) -> TokenSet {
        TokenSet {
            account: account.into(),
            access_token: "eyJ0eXAi.access".into(),
            refresh_token: Some("0.AAAA.refresh".into()),
            token_type: "Bearer".into(),
            expires_at: DateTime::from_timestamp(1_800_000_000, 0).unwrap(),
            scope: parse_scope("offline_access Mail.Read"),
        }
    }

    #[test]
    fn test_missing_record_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path().join("tokens.json"), "default");
        assert!(store.load().is_none());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path().join("nested/tokens.json"), "default");

        store.save(&tokens("default")).unwrap();
        assert_eq!(store.load(), Some(tokens("default")));
        assert!(dir.path().join("nested/tokens.json.lock").exists());
    }

    #[test]
    fn test_save_replaces_previous_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path().join("tokens.json"), "default");

        store.save(&tokens("default")).unwrap();
        let mut next = tokens("default");
        next.access_token = "second".into();
        store.save(&next).unwrap();

        assert_eq!(store.load().unwrap().access_token, "second");
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().starts_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_corrupt_record_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        fs::write(&path, "{\"access_token\": \"trunc").unwrap();

        let store = FileCredentialStore::new(&path, "default");
        assert!(store.load().is_none());
    }

    #[test]
    fn test_other_account_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        FileCredentialStore::new(&path, "work").save(&tokens("work")).unwrap();

        assert!(FileCredentialStore::new(&path, "default").load().is_none());
        assert!(FileCredentialStore::new(&path, "work").load().is_some());
    }

    #[test]
    fn test_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path().join("tokens.json"), "default");

        store.clear().unwrap();
        store.save(&tokens("default")).unwrap();
        store.clear().unwrap();
        assert!(store.load().is_none());
        assert!(!store.path().exists());
    }

    #[test]
    fn test_clear_if_keeps_a_newer_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path().join("tokens.json"), "default");
        let mut rotated = tokens("default");
        rotated.refresh_token = Some("0.BBBB.rotated".into());
        store.save(&rotated).unwrap();

        let rejected = &|record: &TokenSet| record.refresh_token.as_deref() == Some("0.AAAA.refresh");
        assert!(!store.clear_if(rejected).unwrap());
        assert_eq!(store.load(), Some(rotated));

        store.save(&tokens("default")).unwrap();
        assert!(store.clear_if(rejected).unwrap());
        assert!(!store.path().exists());
        assert!(!store.clear_if(rejected).unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn test_record_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path().join("tokens.json"), "default");
        store.save(&tokens("default")).unwrap();

        let mode = fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    fn arb_tokens() -> impl Strategy<Value = TokenSet> {
        (
            "[a-z]{1,12}",
            "[A-Za-z0-9._-]{1,64}",
            proptest::option::of("[A-Za-z0-9._-]{1,64}"),
            0i64..4_000_000_000,
            proptest::collection::btree_set("[A-Za-z.]{1,16}", 0..6),
        )
            .prop_map(|(account, access_token, refresh_token, secs, scope)| TokenSet {
                account,
                access_token,
                refresh_token,
                token_type: "Bearer".into(),
                expires_at: DateTime::<Utc>::from_timestamp(secs, 0).unwrap(),
                scope,
            })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_save_load_round_trip(tokens in arb_tokens()) {
            let dir = tempfile::tempdir().unwrap();
            let store = FileCredentialStore::new(dir.path().join("tokens.json"), tokens.account.clone());
            store.save(&tokens).unwrap();
            prop_assert_eq!(store.load(), Some(tokens));
        }
    }
}
