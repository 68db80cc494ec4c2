//! Durable account registry
//!
//! Manages a JSON file mapping account IDs to account records. All writes use
//! atomic temp-file + rename to prevent corruption on crash, and the file is
//! written 0600 because records carry upstream credentials. A tokio Mutex
//! serializes concurrent writers; reads briefly take the lock to clone.
//!
//! The registry file is the single source of truth for which accounts exist.
//! The pool reads from this store at selection time.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::account::{Account, AccountStatus};
use crate::error::{Error, Result};

/// Thread-safe registry file manager.
pub struct AccountStore {
    path: PathBuf,
    state: Mutex<HashMap<String, Account>>,
}

impl AccountStore {
    /// Load the registry from the given file path.
    ///
    /// If the file doesn't exist, creates it as `{}` (cold start with zero
    /// accounts). Selection reports `no_active_accounts` until accounts are
    /// registered via the admin API.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading registry file: {e}")))?;
            let accounts: HashMap<String, Account> = serde_json::from_str(&contents)
                .map_err(|e| Error::Parse(format!("parsing registry file: {e}")))?;
            info!(path = %path.display(), accounts = accounts.len(), "loaded account registry");
            accounts
        } else {
            info!(path = %path.display(), "registry file not found, starting with empty registry");
            let state = HashMap::new();
            write_atomic(&path, &state).await?;
            state
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// Get a clone of a specific account.
    pub async fn get(&self, account_id: &str) -> Option<Account> {
        let state = self.state.lock().await;
        state.get(account_id).cloned()
    }

    /// All accounts belonging to an organization, any status.
    ///
    /// Sorted by id so selection tie-breaks are deterministic.
    pub async fn for_organization(&self, organization_id: &str) -> Vec<Account> {
        let state = self.state.lock().await;
        let mut accounts: Vec<Account> = state
            .values()
            .filter(|a| a.organization_id == organization_id)
            .cloned()
            .collect();
        accounts.sort_by(|a, b| a.id.cmp(&b.id));
        accounts
    }

    /// Find an account by its credential value (for idempotent registration).
    pub async fn find_by_credential(&self, credential: &str) -> Option<Account> {
        let state = self.state.lock().await;
        state.values().find(|a| a.credential == credential).cloned()
    }

    /// Insert or replace an account and persist to disk.
    pub async fn insert(&self, account: Account) -> Result<()> {
        let mut state = self.state.lock().await;
        debug!(account_id = account.id, organization_id = account.organization_id, "stored account");
        state.insert(account.id.clone(), account);
        write_atomic(&self.path, &state).await
    }

    /// Flip an account's administrative status and persist.
    ///
    /// Returns the updated account, or `NotFound` if the id is unknown. There
    /// is deliberately no remove operation — accounts referenced by historical
    /// usage are soft-deleted by disabling them.
    pub async fn set_status(&self, account_id: &str, status: AccountStatus) -> Result<Account> {
        let mut state = self.state.lock().await;
        let account = state
            .get_mut(account_id)
            .ok_or_else(|| Error::NotFound(account_id.to_string()))?;
        account.status = status;
        let updated = account.clone();
        debug!(account_id, status = status.label(), "updated account status");
        write_atomic(&self.path, &state).await?;
        Ok(updated)
    }

    /// List all account IDs.
    pub async fn account_ids(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state.keys().cloned().collect()
    }

    /// Number of stored accounts.
    pub async fn len(&self) -> usize {
        let state = self.state.lock().await;
        state.len()
    }

    /// Whether the registry is empty.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Write the registry to a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over the
/// target. This prevents corruption if the process crashes mid-write. Sets
/// file permissions to 0600 (owner read/write only) since records contain
/// upstream credentials.
async fn write_atomic(path: &Path, data: &HashMap<String, Account>) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::Parse(format!("serializing registry: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("registry path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".accounts.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp registry file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting registry file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp registry file: {e}")))?;

    debug!(path = %path.display(), "persisted account registry");
    Ok(())
}
