//! Common test utilities shared across integration tests.

use std::path::{Path, PathBuf};
use std::sync::Once;

use ethkeeper_core::{
    encrypt_keystore_with_params, Custody, CustodyConfig, DecryptedKey, MemoryStore,
    ScryptParams,
};
use uuid::Uuid;

static TRACING: Once = Once::new();

/// Installs a fmt subscriber once; `RUST_LOG` controls verbosity.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn temp_root() -> PathBuf {
    std::env::temp_dir().join(format!("ethkeeper-it-{}", Uuid::new_v4()))
}

pub fn cleanup(root: &Path) {
    let _ = std::fs::remove_dir_all(root);
}

/// Custody layer over an in-memory store, staging under `root`, with fast
/// scrypt parameters so tests stay quick.
pub fn test_custody(root: &Path) -> Custody<MemoryStore> {
    let config = CustodyConfig {
        staging_root: root.to_path_buf(),
        scrypt: ScryptParams::FAST_INSECURE,
    };
    Custody::with_config(MemoryStore::new(), config)
}

/// Encrypts `secret` under `passphrase` with fast parameters.
pub fn fixture_blob(secret: [u8; 32], passphrase: &str) -> Vec<u8> {
    let key = DecryptedKey::from_secret_bytes(secret).expect("valid secret");
    encrypt_keystore_with_params(&key, passphrase, ScryptParams::FAST_INSECURE)
        .expect("encrypt fixture")
}

/// Private key 0x…01, whose address is a well-known derivation fixture.
pub fn one_key() -> [u8; 32] {
    let mut bytes = [0u8; 32];
    bytes[31] = 1;
    bytes
}
