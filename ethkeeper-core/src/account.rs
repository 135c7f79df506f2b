//! Persisted account records and their wire representation.
//!
//! An [`Account`] is the field-tagged blob the host store holds for each
//! account path. It carries the encrypted keystore blob and the passphrase
//! that unlocks it, so the encoded form is itself a secret and is only ever
//! handed to the host storage capability, never logged.

use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CustodyError, CustodyResult};

/// URL scheme under which staged keystore blobs are addressed.
pub const KEYSTORE_SCHEME: &str = "keystore";

/// A keystore passphrase.
///
/// Wraps the underlying string so it is zeroized on drop and redacted from
/// `Debug` output. It round-trips through serde because the record owning it
/// is persisted by the host store; it must never appear in logs or error
/// text.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct Passphrase(String);

impl Passphrase {
    /// Wraps a passphrase string.
    pub fn new<S: Into<String>>(secret: S) -> Self {
        Self(secret.into())
    }

    /// Exposes the passphrase for key derivation.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Passphrase {
    fn from(secret: &str) -> Self {
        Self::new(secret)
    }
}

impl std::fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Passphrase([REDACTED])")
    }
}

/// Parsed `scheme://path` keystore locator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeystoreUrl {
    /// URL scheme; [`KEYSTORE_SCHEME`] for blobs staged by this subsystem.
    pub scheme: String,
    /// Path component following the scheme separator.
    pub path: String,
}

impl KeystoreUrl {
    /// Parses a `scheme://path` locator.
    ///
    /// # Errors
    ///
    /// Returns [`CustodyError::InvalidUrl`] when the scheme separator is
    /// absent or the scheme is empty.
    pub fn parse(url: &str) -> CustodyResult<Self> {
        let (scheme, path) = url
            .split_once("://")
            .ok_or_else(|| CustodyError::invalid_url("protocol scheme missing"))?;
        if scheme.is_empty() {
            return Err(CustodyError::invalid_url("protocol scheme missing"));
        }
        Ok(Self {
            scheme: scheme.to_owned(),
            path: path.to_owned(),
        })
    }
}

impl std::fmt::Display for KeystoreUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", self.scheme, self.path)
    }
}

/// Persisted record describing one Ethereum account under custody.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    /// Address the stored blob must decrypt to.
    pub address: Address,
    /// `keystore://` locator recording where the blob was staged at import.
    pub keystore_url: String,
    /// Encrypted keystore blob; never decrypted at rest.
    #[serde(with = "base64_bytes")]
    pub json_keystore: Vec<u8>,
    /// Passphrase unlocking `json_keystore`.
    pub passphrase: Passphrase,
}

impl Account {
    /// Encodes the record for the host store.
    ///
    /// # Errors
    ///
    /// Returns [`CustodyError::Storage`] if serialization fails.
    pub fn encode(&self) -> CustodyResult<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|err| CustodyError::storage("encoding account record", err.to_string()))
    }

    /// Decodes a record read from the host store.
    ///
    /// # Errors
    ///
    /// Returns [`CustodyError::Storage`] if the stored bytes do not decode.
    pub fn decode(bytes: &[u8]) -> CustodyResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|err| CustodyError::storage("decoding account record", err.to_string()))
    }
}

/// Redacted, caller-facing view of an account record.
///
/// Carries explicit typed fields only; the blob and passphrase never leave
/// the custody layer through this type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountView {
    /// The account's address.
    pub address: Address,
    /// Keystore locator recorded at import.
    pub keystore_url: String,
}

impl From<&Account> for AccountView {
    fn from(account: &Account) -> Self {
        Self {
            address: account.address,
            keystore_url: account.keystore_url.clone(),
        }
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
