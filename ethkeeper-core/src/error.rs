//! Error types for the custody subsystem.

use std::path::PathBuf;

use thiserror::Error;

/// Convenience alias for custody results.
pub type CustodyResult<T> = Result<T, CustodyError>;

/// Errors produced by custody operations.
///
/// Variants are grouped by cause so callers can tell validation problems
/// (recoverable by supplying corrected input) from authorization failures,
/// staging conflicts, stored-record integrity faults, and delegated backend
/// failures. No variant ever carries passphrases or key material.
#[derive(Debug, Error)]
pub enum CustodyError {
    /// A keystore locator is missing or has a malformed scheme.
    #[error("invalid keystore URL: {reason}")]
    InvalidUrl {
        /// What was wrong with the locator.
        reason: String,
    },

    /// An account path cannot be mapped to a staging directory.
    #[error("invalid account path {path:?}: {reason}")]
    InvalidAccountPath {
        /// The rejected path.
        path: String,
        /// Why it was rejected.
        reason: String,
    },

    /// An encrypted blob exceeds the size bound and was rejected before
    /// parsing.
    #[error("keystore blob is suspiciously large at {size} bytes (limit {limit})")]
    KeystoreTooLarge {
        /// Observed size in bytes.
        size: u64,
        /// The enforced bound.
        limit: u64,
    },

    /// A blob parsed, but is not a keystore this codec understands.
    #[error("malformed keystore: {context}")]
    MalformedKeystore {
        /// What failed to parse or validate.
        context: String,
    },

    /// Decryption failed. Wrong passphrase and tampered ciphertext are
    /// deliberately indistinguishable.
    #[error("keystore decryption failed")]
    DecryptionFailed,

    /// Encryption of a keystore blob failed.
    #[error("keystore encryption failed: {context}")]
    EncryptionFailed {
        /// The failing step.
        context: String,
    },

    /// Passphrase-to-key derivation failed.
    #[error("key derivation failed: {context}")]
    KeyDerivationFailed {
        /// The failing step.
        context: String,
    },

    /// The caller asked a key to sign for an address it does not own.
    /// Intentionally carries no detail beyond the refusal.
    #[error("not authorized to sign for the requested address")]
    NotAuthorized,

    /// A staging area for the account path already exists: either a
    /// concurrent operation or an area abandoned by an unclean failure.
    #[error("staging area already exists at {}", path.display())]
    StagingConflict {
        /// Location of the conflicting area.
        path: PathBuf,
    },

    /// An import targeted a path that already holds an account record.
    #[error("account already exists at {path}")]
    AccountExists {
        /// The occupied account path.
        path: String,
    },

    /// An operation required an account record that does not exist.
    #[error("no account at {path}")]
    AccountNotFound {
        /// The empty account path.
        path: String,
    },

    /// A stored record contradicts itself, e.g. its address cannot be
    /// reproduced from its own blob. Fatal for the record, never defaulted.
    #[error("account record at {path} is inconsistent: {context}")]
    CorruptAccount {
        /// The account path holding the bad record.
        path: String,
        /// What was inconsistent.
        context: String,
    },

    /// The ECDSA backend refused to sign.
    #[error("signing failed: {context}")]
    SigningFailed {
        /// The failing step.
        context: String,
    },

    /// The host storage backend failed.
    #[error("storage error during {context}: {message}")]
    Storage {
        /// The operation in flight.
        context: String,
        /// Backend-reported detail.
        message: String,
    },

    /// A filesystem operation failed.
    #[error("I/O error during {context}: {source}")]
    Io {
        /// The operation in flight.
        context: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl CustodyError {
    /// Creates an invalid-URL error.
    pub fn invalid_url<S: Into<String>>(reason: S) -> Self {
        Self::InvalidUrl {
            reason: reason.into(),
        }
    }

    /// Creates an invalid-account-path error.
    pub fn invalid_account_path<P: Into<String>, R: Into<String>>(path: P, reason: R) -> Self {
        Self::InvalidAccountPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Creates a malformed-keystore error.
    pub fn malformed<S: Into<String>>(context: S) -> Self {
        Self::MalformedKeystore {
            context: context.into(),
        }
    }

    /// Creates an encryption error.
    pub fn encryption<S: Into<String>>(context: S) -> Self {
        Self::EncryptionFailed {
            context: context.into(),
        }
    }

    /// Creates a key-derivation error.
    pub fn kdf<S: Into<String>>(context: S) -> Self {
        Self::KeyDerivationFailed {
            context: context.into(),
        }
    }

    /// Creates a signing error.
    pub fn signing<S: Into<String>>(context: S) -> Self {
        Self::SigningFailed {
            context: context.into(),
        }
    }

    /// Creates a corrupt-account error.
    pub fn corrupt<P: Into<String>, C: Into<String>>(path: P, context: C) -> Self {
        Self::CorruptAccount {
            path: path.into(),
            context: context.into(),
        }
    }

    /// Creates a storage error.
    pub fn storage<C: Into<String>, M: Into<String>>(context: C, message: M) -> Self {
        Self::Storage {
            context: context.into(),
            message: message.into(),
        }
    }

    /// Creates an I/O error with context.
    pub fn io<S: Into<String>>(context: S, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}
