#![deny(clippy::all, clippy::pedantic, clippy::nursery)]
//! Ethereum private-key custody: V3 keystore codec, staged decryption on
//! disk, account records over a pluggable store, and single-use signing.

mod account;
pub use account::*;

mod custody;
pub use custody::*;

mod error;
pub use error::*;

mod keystore;
pub use keystore::*;

mod signer;
pub use signer::*;

mod staging;
pub use staging::*;

mod store;
pub use store::*;
