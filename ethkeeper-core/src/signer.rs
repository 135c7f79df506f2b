//! Single-use, address-verified transaction signing.

use alloy_consensus::{SignableTransaction, Signed};
use alloy_primitives::{Address, Signature, U256};
use tracing::debug;

use crate::error::{CustodyError, CustodyResult};
use crate::keystore::DecryptedKey;

/// Binds a decrypted key to exactly one authorized signing use.
///
/// The authorizer refuses to sign on behalf of any address other than the
/// one derived from the key itself. Whatever the outcome, the secret scalar
/// is wiped when the signing attempt completes; a spent authorizer refuses
/// further use, and signing again requires decrypting the keystore blob
/// again.
#[derive(Debug)]
pub struct SigningAuthorizer {
    key: DecryptedKey,
}

impl SigningAuthorizer {
    /// Takes ownership of `key` for a single signing use.
    #[must_use]
    pub const fn new(key: DecryptedKey) -> Self {
        Self { key }
    }

    /// Address the held key is entitled to sign for.
    #[must_use]
    pub const fn address(&self) -> Address {
        self.key.address()
    }

    /// Whether the single authorized use has been consumed.
    #[must_use]
    pub const fn is_spent(&self) -> bool {
        self.key.is_wiped()
    }

    /// Signs `tx` on behalf of `target`.
    ///
    /// The transaction's signing hash comes from the transaction format
    /// itself ([`SignableTransaction::signature_hash`]), which already binds
    /// the chain id.
    ///
    /// # Errors
    ///
    /// [`CustodyError::NotAuthorized`] when `target` is not the address
    /// derived from the held key — deliberately a bare refusal with no
    /// detail. [`CustodyError::SigningFailed`] when the ECDSA backend
    /// rejects the operation or the authorizer is already spent. The key is
    /// wiped in every case.
    pub fn sign_transaction<T>(&mut self, target: Address, tx: T) -> CustodyResult<Signed<T>>
    where
        T: SignableTransaction<Signature>,
    {
        let result = Self::sign_checked(&self.key, target, tx);
        self.key.wipe();
        result
    }

    fn sign_checked<T>(key: &DecryptedKey, target: Address, tx: T) -> CustodyResult<Signed<T>>
    where
        T: SignableTransaction<Signature>,
    {
        if target != key.address() {
            return Err(CustodyError::NotAuthorized);
        }

        let signing_key = key.signing_key()?;
        let hash = tx.signature_hash();
        let (signature, recovery_id) = signing_key
            .sign_prehash_recoverable(hash.as_slice())
            .map_err(|err| CustodyError::signing(format!("ecdsa backend: {err}")))?;

        let bytes = signature.to_bytes();
        let r = U256::from_be_slice(&bytes[..32]);
        let s = U256::from_be_slice(&bytes[32..]);
        let signature = Signature::new(r, s, recovery_id.is_y_odd());

        debug!(signer = %key.address(), "transaction signed");
        Ok(tx.into_signed(signature))
    }
}
