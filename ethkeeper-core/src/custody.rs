//! Custody operations exposed to the host dispatch layer.
//!
//! Each operation loads the account record from the host store, stages the
//! encrypted blob on disk when decryption is needed, and tears the staging
//! area down before returning, on success and on failure alike. Operations
//! on the same account path are serialized by a per-path lock; the staging
//! area's exclusive creation stays as the fail-closed backstop for anything
//! that bypasses the lock, such as a stale directory left by a crashed
//! process.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use alloy_consensus::{SignableTransaction, Signed};
use alloy_primitives::{Address, Signature};
use tracing::{debug, info};

use crate::account::{Account, AccountView, KeystoreUrl, Passphrase, KEYSTORE_SCHEME};
use crate::error::{CustodyError, CustodyResult};
use crate::keystore::{
    decrypt_keystore, encrypt_keystore_with_params, DecryptedKey, ScryptParams,
};
use crate::signer::SigningAuthorizer;
use crate::staging::{staging_rel_path, StagingArea};
use crate::store::KvStore;

/// Tunables for a [`Custody`] instance.
#[derive(Debug, Clone)]
pub struct CustodyConfig {
    /// Root under which per-account staging directories are created.
    pub staging_root: PathBuf,
    /// scrypt cost profile for newly encrypted blobs.
    pub scrypt: ScryptParams,
}

impl Default for CustodyConfig {
    fn default() -> Self {
        Self {
            staging_root: std::env::temp_dir().join("ethkeeper"),
            scrypt: ScryptParams::STANDARD,
        }
    }
}

/// One mutex per account path, created on first use.
///
/// Entries held by no in-flight operation are pruned when a new path misses
/// the map, so the map tracks the working set rather than every path ever
/// touched.
#[derive(Debug, Default)]
struct PathLocks {
    locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
}

impl PathLocks {
    fn lock_for(&self, account_path: &str) -> CustodyResult<Arc<Mutex<()>>> {
        {
            let locks = self
                .locks
                .read()
                .map_err(|_| CustodyError::storage("path locks", "lock poisoned"))?;
            if let Some(lock) = locks.get(account_path) {
                return Ok(Arc::clone(lock));
            }
        }
        let mut locks = self
            .locks
            .write()
            .map_err(|_| CustodyError::storage("path locks", "lock poisoned"))?;
        // A count of one means only the map holds the lock.
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        Ok(Arc::clone(locks.entry(account_path.to_owned()).or_default()))
    }
}

/// Entry point for custody operations over a host-provided store.
///
/// Generic over the [`KvStore`] capability so the host can plug in its own
/// persistence; tests run against [`crate::MemoryStore`].
pub struct Custody<S> {
    store: S,
    config: CustodyConfig,
    locks: PathLocks,
}

impl<S> std::fmt::Debug for Custody<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Custody")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S: KvStore> Custody<S> {
    /// Creates a custody layer with the default configuration.
    pub fn new(store: S) -> Self {
        Self::with_config(store, CustodyConfig::default())
    }

    /// Creates a custody layer with an explicit configuration.
    pub fn with_config(store: S, config: CustodyConfig) -> Self {
        Self {
            store,
            config,
            locks: PathLocks::default(),
        }
    }

    /// Loads the account record at `account_path`. An absent record is
    /// `Ok(None)`, a normal outcome for idempotent checks.
    ///
    /// # Errors
    ///
    /// Returns [`CustodyError::Storage`] when the backend fails or the
    /// stored bytes do not decode.
    pub fn load_account(&self, account_path: &str) -> CustodyResult<Option<Account>> {
        let Some(bytes) = self.store.get(account_path)? else {
            return Ok(None);
        };
        Account::decode(&bytes).map(Some)
    }

    /// Whether a record exists at `account_path`, without decoding it.
    ///
    /// # Errors
    ///
    /// Returns [`CustodyError::Storage`] when the backend read fails.
    pub fn account_exists(&self, account_path: &str) -> CustodyResult<bool> {
        Ok(self.store.get(account_path)?.is_some())
    }

    /// Imports an encrypted keystore blob under `account_path`.
    ///
    /// The blob is staged on disk, decrypted to recover and verify its
    /// address, and the record is persisted only after that round trip
    /// succeeds; the recovered key is wiped before this function returns.
    ///
    /// # Errors
    ///
    /// [`CustodyError::AccountExists`] when the path already holds a
    /// record; codec and staging errors propagate.
    pub fn import(
        &self,
        account_path: &str,
        blob: &[u8],
        passphrase: Passphrase,
    ) -> CustodyResult<Address> {
        let lock = self.locks.lock_for(account_path)?;
        let _guard = hold(&lock)?;

        if self.account_exists(account_path)? {
            return Err(CustodyError::AccountExists {
                path: account_path.to_owned(),
            });
        }

        debug!(account_path, "importing keystore blob");
        let staging = StagingArea::materialize(&self.config.staging_root, account_path)?;
        let staged = staging.write_blob(&blob_file_name(account_path), blob)?;
        let staged_blob = staging.read_blob(&staged)?;
        let mut key = decrypt_keystore(&staged_blob, passphrase.expose())?;
        let address = key.address();
        key.wipe();

        // Staging is finished once the blob decrypted; tear it down before
        // the record is persisted so a removal failure cannot leave a
        // stored record behind a reported error.
        staging.destroy()?;

        let account = Account {
            address,
            keystore_url: format!("{KEYSTORE_SCHEME}://{}", staged.display()),
            json_keystore: blob.to_vec(),
            passphrase,
        };
        self.store.put(account_path, account.encode()?)?;

        info!(account_path, %address, "account imported");
        Ok(address)
    }

    /// Returns the redacted view of the account at `account_path`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`CustodyError::Storage`] when the backend fails.
    pub fn account(&self, account_path: &str) -> CustodyResult<Option<AccountView>> {
        Ok(self
            .load_account(account_path)?
            .map(|account| AccountView::from(&account)))
    }

    /// Signs `tx` with the key held for `account_path`, on behalf of
    /// `target`.
    ///
    /// The stored record's address must be reproducible from its own blob;
    /// a mismatch is fatal for the record. The decrypted key is wiped when
    /// the signing attempt completes, whatever the outcome.
    ///
    /// # Errors
    ///
    /// [`CustodyError::AccountNotFound`] when no record exists,
    /// [`CustodyError::NotAuthorized`] when `target` is not the account's
    /// address, [`CustodyError::CorruptAccount`] on an address
    /// inconsistency; codec and staging errors propagate.
    pub fn sign<T>(&self, account_path: &str, target: Address, tx: T) -> CustodyResult<Signed<T>>
    where
        T: SignableTransaction<Signature>,
    {
        let lock = self.locks.lock_for(account_path)?;
        let _guard = hold(&lock)?;

        let account = self.require_account(account_path)?;
        let key = self.account_key(account_path, &account)?;
        let mut authorizer = SigningAuthorizer::new(key);
        authorizer.sign_transaction(target, tx)
    }

    /// Re-encrypts the stored blob under `new_passphrase`.
    ///
    /// All-or-nothing: the record is rewritten only after the old blob
    /// decrypted and the new blob encrypted successfully; any stage failure
    /// leaves the stored record untouched.
    ///
    /// # Errors
    ///
    /// [`CustodyError::AccountNotFound`] when no record exists,
    /// [`CustodyError::DecryptionFailed`] when `old_passphrase` is wrong,
    /// [`CustodyError::CorruptAccount`] on an address inconsistency.
    pub fn rekey(
        &self,
        account_path: &str,
        old_passphrase: &Passphrase,
        new_passphrase: Passphrase,
    ) -> CustodyResult<()> {
        let lock = self.locks.lock_for(account_path)?;
        let _guard = hold(&lock)?;

        let mut account = self.require_account(account_path)?;
        debug!(account_path, "rekeying account");

        let staging = StagingArea::materialize(&self.config.staging_root, account_path)?;
        let staged = staging.write_blob(&blob_file_name(account_path), &account.json_keystore)?;
        let staged_blob = staging.read_blob(&staged)?;

        let mut key = decrypt_keystore(&staged_blob, old_passphrase.expose())?;
        if account.address != key.address() {
            key.wipe();
            return Err(CustodyError::corrupt(
                account_path,
                "stored address cannot be reproduced from the keystore blob",
            ));
        }

        let new_blob = reencrypt_wiped(&mut key, &new_passphrase, self.config.scrypt);
        // Staging teardown precedes persistence, as in `import`.
        staging.destroy()?;
        account.json_keystore = new_blob?;
        account.passphrase = new_passphrase;

        self.store.put(account_path, account.encode()?)?;

        info!(account_path, "account rekeyed");
        Ok(())
    }

    /// Copies the still-encrypted blob for `account_path` into
    /// `destination_dir`, returning the written file path.
    ///
    /// The destination file name comes from matching the record's internal
    /// keystore locator against the account's staging prefix; a locator
    /// that does not map cleanly is a data-integrity error, never
    /// defaulted.
    ///
    /// # Errors
    ///
    /// [`CustodyError::AccountNotFound`] when no record exists,
    /// [`CustodyError::CorruptAccount`] when the locator is unmappable.
    pub fn export(&self, account_path: &str, destination_dir: &Path) -> CustodyResult<PathBuf> {
        let lock = self.locks.lock_for(account_path)?;
        let _guard = hold(&lock)?;

        let account = self.require_account(account_path)?;
        let url = KeystoreUrl::parse(&account.keystore_url)?;

        let expected_dir = self
            .config
            .staging_root
            .join(staging_rel_path(account_path)?);
        let recorded = Path::new(&url.path);
        let file_name = recorded
            .strip_prefix(&expected_dir)
            .ok()
            .filter(|rest| rest.components().count() == 1)
            .ok_or_else(|| {
                CustodyError::corrupt(
                    account_path,
                    "keystore locator does not map under the account staging prefix",
                )
            })?;

        fs::create_dir_all(destination_dir)
            .map_err(|err| CustodyError::io("creating export directory", err))?;
        let destination = destination_dir.join(file_name);
        fs::write(&destination, &account.json_keystore)
            .map_err(|err| CustodyError::io("writing exported keystore", err))?;

        info!(account_path, destination = %destination.display(), "keystore exported");
        Ok(destination)
    }

    /// Removes the account record at `account_path`. Removing an absent
    /// record is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`CustodyError::Storage`] when the backend delete fails.
    pub fn delete(&self, account_path: &str) -> CustodyResult<()> {
        let lock = self.locks.lock_for(account_path)?;
        let _guard = hold(&lock)?;

        self.store.delete(account_path)?;
        info!(account_path, "account deleted");
        Ok(())
    }

    fn require_account(&self, account_path: &str) -> CustodyResult<Account> {
        self.load_account(account_path)?
            .ok_or_else(|| CustodyError::AccountNotFound {
                path: account_path.to_owned(),
            })
    }

    /// Stages the account's blob, decrypts it with the stored passphrase,
    /// and verifies the record's address against the recovered key. The
    /// staging area is removed before this returns, on every path.
    fn account_key(&self, account_path: &str, account: &Account) -> CustodyResult<DecryptedKey> {
        let staging = StagingArea::materialize(&self.config.staging_root, account_path)?;
        let staged = staging.write_blob(&blob_file_name(account_path), &account.json_keystore)?;
        let staged_blob = staging.read_blob(&staged)?;

        let key = match decrypt_keystore(&staged_blob, account.passphrase.expose()) {
            Ok(key) => key,
            Err(err) => {
                // Drop removes the staging area best-effort; the decrypt
                // error is the one worth surfacing.
                drop(staging);
                return Err(err);
            }
        };
        staging.destroy()?;

        if account.address != key.address() {
            let mut key = key;
            key.wipe();
            return Err(CustodyError::corrupt(
                account_path,
                "stored address cannot be reproduced from the keystore blob",
            ));
        }
        Ok(key)
    }
}

/// Encrypts `key` under `new_passphrase`, wiping the key when the attempt
/// completes, successful or not.
fn reencrypt_wiped(
    key: &mut DecryptedKey,
    new_passphrase: &Passphrase,
    params: ScryptParams,
) -> CustodyResult<Vec<u8>> {
    let result = encrypt_keystore_with_params(key, new_passphrase.expose(), params);
    key.wipe();
    result
}

fn hold(lock: &Arc<Mutex<()>>) -> CustodyResult<std::sync::MutexGuard<'_, ()>> {
    lock.lock()
        .map_err(|_| CustodyError::storage("path lock", "lock poisoned"))
}

/// Deterministic blob file name for an account path: its last segment plus
/// the keystore extension. Never derived from anything but the account path
/// itself.
fn blob_file_name(account_path: &str) -> String {
    let segment = account_path.rsplit('/').next().unwrap_or(account_path);
    format!("{segment}.json")
}
