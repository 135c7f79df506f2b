//! Ethereum V3 JSON keystore codec.
//!
//! Encrypts and decrypts the geth-compatible keystore wire format: scrypt
//! key derivation, AES-128-CTR payload encryption, keccak-256 MAC. The
//! standard scrypt cost is high on purpose so that offline passphrase
//! guessing stays infeasible; legitimate encrypt/decrypt calls pay that cost
//! too.
//!
//! The codec owns no persistence. Callers decide where blobs live.

use aes::cipher::{KeyIvInit, StreamCipher};
use alloy_primitives::{keccak256, Address};
use k256::ecdsa::SigningKey;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use uuid::Uuid;
use zeroize::{Zeroize, Zeroizing};

use crate::error::{CustodyError, CustodyResult};

type Aes128Ctr = ctr::Ctr64BE<aes::Aes128>;

/// Maximum accepted size of an encrypted keystore blob, in bytes.
///
/// A V3 blob is around 500 bytes; anything past this bound is rejected
/// before parsing as a guard against resource exhaustion from malformed
/// input.
pub const MAX_KEYSTORE_BYTES: u64 = 1024;

const KEYSTORE_VERSION: u32 = 3;
const CIPHER_AES_128_CTR: &str = "aes-128-ctr";
const KDF_SCRYPT: &str = "scrypt";
const DKLEN: u32 = 32;

// Memory for scrypt is 128 * r * N bytes; cost parameters past these bounds
// are an attack on the decrypting process, not a real keystore. The memory
// ceiling comfortably admits go-ethereum's "standard" profile (256 MiB).
const MAX_SCRYPT_LOG_N: u8 = 24;
const MAX_SCRYPT_MEMORY: u128 = 1 << 30;
const MAX_SCRYPT_P: u32 = 16;

/// scrypt cost parameters carried in a keystore blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScryptParams {
    /// CPU/memory cost, as log2 of N.
    pub log_n: u8,
    /// Block size.
    pub r: u32,
    /// Parallelism.
    pub p: u32,
}

impl ScryptParams {
    /// go-ethereum's "standard" profile: N = 2^18, r = 8, p = 1.
    pub const STANDARD: Self = Self {
        log_n: 18,
        r: 8,
        p: 1,
    };

    /// A deliberately weak profile for test fixtures. Offers no brute-force
    /// resistance; never use it for real keys.
    pub const FAST_INSECURE: Self = Self {
        log_n: 4,
        r: 8,
        p: 1,
    };

    fn to_scrypt(self) -> CustodyResult<scrypt::Params> {
        scrypt::Params::new(self.log_n, self.r, self.p, 32)
            .map_err(|_| CustodyError::kdf("invalid scrypt parameters"))
    }
}

/// A decrypted private key bound to its derived address.
///
/// The secret scalar lives in process memory only: the type is never
/// serialized, `Debug` redacts it, and the buffer is zeroed on drop and by
/// [`DecryptedKey::wipe`]. Operations that consume a key wipe it as soon as
/// their single authorized use completes.
pub struct DecryptedKey {
    secret: [u8; 32],
    address: Address,
    wiped: bool,
}

impl DecryptedKey {
    /// Builds a key from a raw secret scalar, deriving its address.
    ///
    /// # Errors
    ///
    /// Returns [`CustodyError::DecryptionFailed`] when the bytes are not a
    /// valid secp256k1 scalar. The input copy is zeroed on failure.
    pub fn from_secret_bytes(mut secret: [u8; 32]) -> CustodyResult<Self> {
        match SigningKey::from_slice(&secret) {
            Ok(signing_key) => {
                let address = Address::from_private_key(&signing_key);
                Ok(Self {
                    secret,
                    address,
                    wiped: false,
                })
            }
            Err(_) => {
                secret.zeroize();
                Err(CustodyError::DecryptionFailed)
            }
        }
    }

    /// Address derived from the secret scalar.
    #[must_use]
    pub const fn address(&self) -> Address {
        self.address
    }

    /// Overwrites the secret scalar with zeros. Idempotent.
    pub fn wipe(&mut self) {
        self.secret.zeroize();
        self.wiped = true;
    }

    /// Whether the scalar has been wiped. A wiped key refuses further
    /// cryptographic use.
    #[must_use]
    pub const fn is_wiped(&self) -> bool {
        self.wiped
    }

    pub(crate) fn signing_key(&self) -> CustodyResult<SigningKey> {
        if self.wiped {
            return Err(CustodyError::signing("key material already wiped"));
        }
        SigningKey::from_slice(&self.secret)
            .map_err(|_| CustodyError::signing("invalid secret scalar"))
    }

    #[cfg(test)]
    pub(crate) const fn secret_bytes(&self) -> &[u8; 32] {
        &self.secret
    }
}

impl Drop for DecryptedKey {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

impl std::fmt::Debug for DecryptedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecryptedKey")
            .field("address", &self.address)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct KeystoreFile {
    version: u32,
    id: String,
    address: String,
    crypto: CryptoSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CryptoSection {
    cipher: String,
    ciphertext: String,
    cipherparams: CipherParams,
    kdf: String,
    kdfparams: KdfParams,
    mac: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CipherParams {
    iv: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct KdfParams {
    dklen: u32,
    n: u64,
    r: u32,
    p: u32,
    salt: String,
}

/// Decrypts a V3 keystore blob with `passphrase`.
///
/// The size bound is enforced before any parse. A failed MAC check maps to
/// [`CustodyError::DecryptionFailed`] whether the passphrase was wrong or
/// the ciphertext was tampered with; callers cannot tell which.
///
/// # Errors
///
/// [`CustodyError::KeystoreTooLarge`] past the size bound,
/// [`CustodyError::MalformedKeystore`] for blobs this codec cannot read,
/// [`CustodyError::DecryptionFailed`] when the MAC check fails.
pub fn decrypt_keystore(blob: &[u8], passphrase: &str) -> CustodyResult<DecryptedKey> {
    let size = blob.len() as u64;
    if size > MAX_KEYSTORE_BYTES {
        return Err(CustodyError::KeystoreTooLarge {
            size,
            limit: MAX_KEYSTORE_BYTES,
        });
    }

    let file: KeystoreFile = serde_json::from_slice(blob)
        .map_err(|err| CustodyError::malformed(format!("not a V3 keystore: {err}")))?;
    if file.version != KEYSTORE_VERSION {
        return Err(CustodyError::malformed(format!(
            "unsupported keystore version {}",
            file.version
        )));
    }

    let crypto = &file.crypto;
    if crypto.cipher != CIPHER_AES_128_CTR {
        return Err(CustodyError::malformed(format!(
            "unsupported cipher {:?}",
            crypto.cipher
        )));
    }
    if crypto.kdf != KDF_SCRYPT {
        return Err(CustodyError::malformed(format!(
            "unsupported kdf {:?}",
            crypto.kdf
        )));
    }
    if crypto.kdfparams.dklen != DKLEN {
        return Err(CustodyError::malformed("kdfparams.dklen must be 32"));
    }

    let salt = decode_hex_field(&crypto.kdfparams.salt, "kdfparams.salt")?;
    let iv = decode_hex_field(&crypto.cipherparams.iv, "cipherparams.iv")?;
    if iv.len() != 16 {
        return Err(CustodyError::malformed("cipherparams.iv must be 16 bytes"));
    }
    let ciphertext = decode_hex_field(&crypto.ciphertext, "ciphertext")?;
    if ciphertext.len() != 32 {
        return Err(CustodyError::malformed("ciphertext must be 32 bytes"));
    }
    let mac = decode_hex_field(&crypto.mac, "mac")?;

    let params = scrypt_params_from_kdf(&crypto.kdfparams)?;
    let derived = derive_key(passphrase, &salt, params)?;

    // MAC = keccak256(derived[16..32] || ciphertext), compared in constant
    // time.
    let computed = keccak256([&derived[16..32], ciphertext.as_slice()].concat());
    if computed.as_slice().ct_eq(mac.as_slice()).unwrap_u8() == 0 {
        return Err(CustodyError::DecryptionFailed);
    }

    let mut secret = [0u8; 32];
    secret.copy_from_slice(&ciphertext);
    apply_aes_ctr(&derived[..16], &iv, &mut secret);

    let key = DecryptedKey::from_secret_bytes(secret)?;

    // Blob-internal address is advisory but, when present, must agree with
    // the recovered key.
    if !file.address.is_empty() {
        if let Ok(embedded) = file.address.parse::<Address>() {
            if embedded != key.address() {
                return Err(CustodyError::malformed(
                    "embedded address does not match the recovered key",
                ));
            }
        }
    }

    Ok(key)
}

/// Encrypts `key` under `passphrase` with the standard scrypt profile.
///
/// Deliberately expensive; see [`ScryptParams::STANDARD`].
///
/// # Errors
///
/// Returns [`CustodyError::EncryptionFailed`] when the key has been wiped
/// or serialization fails.
pub fn encrypt_keystore(key: &DecryptedKey, passphrase: &str) -> CustodyResult<Vec<u8>> {
    encrypt_keystore_with_params(key, passphrase, ScryptParams::STANDARD)
}

/// Same as [`encrypt_keystore`], with an explicit scrypt cost profile.
///
/// Test fixtures use [`ScryptParams::FAST_INSECURE`]; production callers
/// should not pass anything weaker than [`ScryptParams::STANDARD`].
///
/// # Errors
///
/// Returns [`CustodyError::EncryptionFailed`] when the key has been wiped
/// or serialization fails, [`CustodyError::KeyDerivationFailed`] for an
/// unusable cost profile.
pub fn encrypt_keystore_with_params(
    key: &DecryptedKey,
    passphrase: &str,
    params: ScryptParams,
) -> CustodyResult<Vec<u8>> {
    if key.is_wiped() {
        return Err(CustodyError::encryption("key material already wiped"));
    }

    let mut salt = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut salt);
    let mut iv = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut iv);

    let derived = derive_key(passphrase, &salt, params)?;

    // The plaintext copy is encrypted in place, so no cleartext scalar
    // outlives this scope.
    let mut ciphertext = key.secret;
    apply_aes_ctr(&derived[..16], &iv, &mut ciphertext);

    let mac = keccak256([&derived[16..32], ciphertext.as_slice()].concat());

    let file = KeystoreFile {
        version: KEYSTORE_VERSION,
        id: Uuid::new_v4().to_string(),
        address: format!("{:x}", key.address()),
        crypto: CryptoSection {
            cipher: CIPHER_AES_128_CTR.to_owned(),
            ciphertext: hex::encode(ciphertext),
            cipherparams: CipherParams {
                iv: hex::encode(iv),
            },
            kdf: KDF_SCRYPT.to_owned(),
            kdfparams: KdfParams {
                dklen: DKLEN,
                n: 1u64 << params.log_n,
                r: params.r,
                p: params.p,
                salt: hex::encode(salt),
            },
            mac: hex::encode(mac),
        },
    };

    serde_json::to_vec(&file)
        .map_err(|err| CustodyError::encryption(format!("serializing keystore: {err}")))
}

fn derive_key(
    passphrase: &str,
    salt: &[u8],
    params: ScryptParams,
) -> CustodyResult<Zeroizing<[u8; 32]>> {
    let scrypt_params = params.to_scrypt()?;
    let mut derived = Zeroizing::new([0u8; 32]);
    scrypt::scrypt(
        passphrase.as_bytes(),
        salt,
        &scrypt_params,
        &mut derived[..],
    )
    .map_err(|_| CustodyError::kdf("scrypt output length"))?;
    Ok(derived)
}

fn apply_aes_ctr(derived_half: &[u8], iv: &[u8], buffer: &mut [u8; 32]) {
    let mut enc_key = [0u8; 16];
    enc_key.copy_from_slice(derived_half);
    let mut iv_bytes = [0u8; 16];
    iv_bytes.copy_from_slice(iv);
    let mut cipher = Aes128Ctr::new(&enc_key.into(), &iv_bytes.into());
    cipher.apply_keystream(buffer);
    enc_key.zeroize();
}

fn scrypt_params_from_kdf(kdf: &KdfParams) -> CustodyResult<ScryptParams> {
    if !kdf.n.is_power_of_two() || kdf.n < 2 {
        return Err(CustodyError::malformed(
            "kdfparams.n must be a power of two",
        ));
    }
    let log_n = kdf.n.trailing_zeros() as u8;
    if log_n > MAX_SCRYPT_LOG_N {
        return Err(CustodyError::malformed("kdfparams.n too large"));
    }
    if kdf.r == 0 || kdf.p == 0 {
        return Err(CustodyError::malformed(
            "kdfparams.r and kdfparams.p must be nonzero",
        ));
    }
    if kdf.p > MAX_SCRYPT_P {
        return Err(CustodyError::malformed("kdfparams.p too large"));
    }
    if 128 * u128::from(kdf.r) * u128::from(kdf.n) > MAX_SCRYPT_MEMORY {
        return Err(CustodyError::malformed(
            "kdfparams demand excessive memory",
        ));
    }
    Ok(ScryptParams {
        log_n,
        r: kdf.r,
        p: kdf.p,
    })
}

fn decode_hex_field(value: &str, field: &str) -> CustodyResult<Vec<u8>> {
    hex::decode(value.trim_start_matches("0x"))
        .map_err(|_| CustodyError::malformed(format!("{field} is not valid hex")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    // Private key 0x…01; its address is a fixed point of secp256k1 address
    // derivation, handy as a fixture.
    pub(crate) const ONE_KEY: [u8; 32] = {
        let mut bytes = [0u8; 32];
        bytes[31] = 1;
        bytes
    };
    const ONE_ADDRESS: &str = "0x7E5F4552091A69125d5DfCb7b8C2659029395Bdf";

    fn one_key() -> DecryptedKey {
        DecryptedKey::from_secret_bytes(ONE_KEY).unwrap()
    }

    #[test]
    fn derives_known_address() {
        assert_eq!(one_key().address(), ONE_ADDRESS.parse::<Address>().unwrap());
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let blob =
            encrypt_keystore_with_params(&one_key(), "test-pass", ScryptParams::FAST_INSECURE)
                .unwrap();
        assert!((blob.len() as u64) <= MAX_KEYSTORE_BYTES);

        let key = decrypt_keystore(&blob, "test-pass").unwrap();
        assert_eq!(key.secret_bytes(), &ONE_KEY);
        assert_eq!(key.address(), one_key().address());
    }

    #[test]
    fn wrong_passphrase_fails_closed() {
        let blob =
            encrypt_keystore_with_params(&one_key(), "test-pass", ScryptParams::FAST_INSECURE)
                .unwrap();
        assert!(matches!(
            decrypt_keystore(&blob, "not-the-pass"),
            Err(CustodyError::DecryptionFailed)
        ));
    }

    #[test]
    fn oversize_blob_rejected_before_parse() {
        // Not even valid UTF-8, demonstrating the bound fires before any
        // parsing happens.
        let blob = vec![0xFFu8; 4096];
        assert!(matches!(
            decrypt_keystore(&blob, "irrelevant"),
            Err(CustodyError::KeystoreTooLarge { size: 4096, .. })
        ));
    }

    #[test]
    fn garbage_blob_is_malformed() {
        assert!(matches!(
            decrypt_keystore(b"{\"not\": \"a keystore\"}", "x"),
            Err(CustodyError::MalformedKeystore { .. })
        ));
    }

    #[test]
    fn tampered_ciphertext_fails_mac() {
        let blob =
            encrypt_keystore_with_params(&one_key(), "test-pass", ScryptParams::FAST_INSECURE)
                .unwrap();
        let mut parsed: serde_json::Value = serde_json::from_slice(&blob).unwrap();
        let ciphertext = parsed["crypto"]["ciphertext"].as_str().unwrap().to_owned();
        let mut flipped = ciphertext.into_bytes();
        flipped[0] = if flipped[0] == b'0' { b'1' } else { b'0' };
        parsed["crypto"]["ciphertext"] =
            serde_json::Value::String(String::from_utf8(flipped).unwrap());
        let tampered = serde_json::to_vec(&parsed).unwrap();

        assert!(matches!(
            decrypt_keystore(&tampered, "test-pass"),
            Err(CustodyError::DecryptionFailed)
        ));
    }

    #[test_case(1000 ; "not a power of two")]
    #[test_case(1 << 30 ; "too large")]
    #[test_case(1 ; "too small")]
    fn bad_scrypt_n_is_malformed(n: u64) {
        let blob =
            encrypt_keystore_with_params(&one_key(), "test-pass", ScryptParams::FAST_INSECURE)
                .unwrap();
        let mut parsed: serde_json::Value = serde_json::from_slice(&blob).unwrap();
        parsed["crypto"]["kdfparams"]["n"] = serde_json::Value::from(n);
        let bad = serde_json::to_vec(&parsed).unwrap();

        assert!(matches!(
            decrypt_keystore(&bad, "test-pass"),
            Err(CustodyError::MalformedKeystore { .. })
        ));
    }

    // Parameters whose derivation would exhaust process memory must be
    // rejected with a typed error, not attempted.
    #[test_case(2, 1 << 29, 1 ; "memory bomb")]
    #[test_case(16, 0, 1 ; "zero r")]
    #[test_case(16, 8, 0 ; "zero p")]
    #[test_case(16, 8, 1000 ; "excessive parallelism")]
    fn hostile_scrypt_cost_is_malformed(n: u64, r: u64, p: u64) {
        let blob =
            encrypt_keystore_with_params(&one_key(), "test-pass", ScryptParams::FAST_INSECURE)
                .unwrap();
        let mut parsed: serde_json::Value = serde_json::from_slice(&blob).unwrap();
        parsed["crypto"]["kdfparams"]["n"] = serde_json::Value::from(n);
        parsed["crypto"]["kdfparams"]["r"] = serde_json::Value::from(r);
        parsed["crypto"]["kdfparams"]["p"] = serde_json::Value::from(p);
        let hostile = serde_json::to_vec(&parsed).unwrap();

        assert!(matches!(
            decrypt_keystore(&hostile, "test-pass"),
            Err(CustodyError::MalformedKeystore { .. })
        ));
    }

    #[test]
    fn embedded_address_mismatch_is_malformed() {
        let blob =
            encrypt_keystore_with_params(&one_key(), "test-pass", ScryptParams::FAST_INSECURE)
                .unwrap();
        let mut parsed: serde_json::Value = serde_json::from_slice(&blob).unwrap();
        parsed["address"] =
            serde_json::Value::String(format!("{:x}", Address::repeat_byte(0x99)));
        let inconsistent = serde_json::to_vec(&parsed).unwrap();

        assert!(matches!(
            decrypt_keystore(&inconsistent, "test-pass"),
            Err(CustodyError::MalformedKeystore { .. })
        ));
    }

    #[test]
    fn wipe_zeroes_and_disables_the_key() {
        let mut key = one_key();
        key.wipe();
        assert!(key.is_wiped());
        assert_eq!(key.secret_bytes(), &[0u8; 32]);
        assert!(matches!(
            encrypt_keystore_with_params(&key, "p", ScryptParams::FAST_INSECURE),
            Err(CustodyError::EncryptionFailed { .. })
        ));
        assert!(matches!(
            key.signing_key(),
            Err(CustodyError::SigningFailed { .. })
        ));
    }

    #[test]
    fn debug_redacts_secret() {
        let rendered = format!("{:?}", one_key());
        assert!(rendered.contains("[REDACTED]"));
        assert!(!rendered.to_lowercase().contains(&hex::encode(ONE_KEY)));
    }

    #[test]
    fn invalid_scalar_rejected() {
        // Zero is not a valid secp256k1 secret scalar.
        assert!(matches!(
            DecryptedKey::from_secret_bytes([0u8; 32]),
            Err(CustodyError::DecryptionFailed)
        ));
    }
}
