//! Cryptographic primitives for the Partitioned Event Store.
//!
//! Provides domain-separated BLAKE3 hashing, Ed25519 signing/verification,
//! and the two capabilities the rest of the store consumes: [`Signer`] and
//! [`Verifier`].
//!
//! All crypto operations wrap established libraries; there is no custom cryptography.

pub mod directory;
pub mod hasher;
pub mod keychain;
pub mod signer;

pub use directory::{KeyDirectory, Verifier};
pub use hasher::{ContentHasher, HasherError};
pub use keychain::Keychain;
pub use signer::{Signature, SignatureError, Signer, SigningKey, VerifyingKey};
