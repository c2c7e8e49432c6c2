//! Identifiers, keys and timestamps.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Defines a 32-byte public identifier with hex display.
macro_rules! bytes32 {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
            bincode::Encode, bincode::Decode,
        )]
        pub struct $name(pub [u8; 32]);

        impl $name {
            pub fn from_bytes(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            /// Decode from a hex string of exactly 32 bytes.
            pub fn from_hex(s: &str) -> Option<Self> {
                let bytes = hex::decode(s).ok()?;
                bytes.try_into().ok().map(Self)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        impl From<[u8; 32]> for $name {
            fn from(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }
    };
}

/// Defines a random task identifier.
macro_rules! task_id {
    ($(#[$meta:meta])* $name:ident) => {
        bytes32!($(#[$meta])* $name);

        impl $name {
            /// A fresh random identifier.
            pub fn random() -> Self {
                use rand::RngCore;
                let mut bytes = [0u8; 32];
                rand::rngs::OsRng.fill_bytes(&mut bytes);
                Self(bytes)
            }
        }
    };
}

bytes32!(
    /// A 256-bit hash (SHA-256 or BLAKE3 depending on context).
    Hash256
);

bytes32!(
    /// Ed25519 public key: coin, reserve, merchant and exchange keys.
    EddsaPublicKey
);

task_id!(WithdrawalGroupId);
task_id!(RefreshGroupId);
task_id!(RecoupGroupId);
task_id!(DepositGroupId);

/// Ed25519 secret key. Zeroized on drop.
#[derive(
    Serialize, Deserialize, Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop,
    bincode::Encode, bincode::Decode,
)]
pub struct EddsaPrivateKey(pub [u8; 32]);

impl EddsaPrivateKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for EddsaPrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EddsaPrivateKey([REDACTED])")
    }
}

/// A public/private Ed25519 pair.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct EddsaKeyPair {
    pub pub_key: EddsaPublicKey,
    pub priv_key: EddsaPrivateKey,
}

/// Signature scheme of a denomination key.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
    bincode::Encode, bincode::Decode,
)]
pub enum DenomCipher {
    Rsa,
    Eddsa,
}

/// Public key of a denomination.
///
/// The derived ordering (cipher first, then key bytes) is the canonical
/// ordering used to break ties in coin selection.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
    bincode::Encode, bincode::Decode,
)]
pub struct DenominationPubKey {
    pub cipher: DenomCipher,
    pub key: Vec<u8>,
}

impl DenominationPubKey {
    pub fn eddsa(key: EddsaPublicKey) -> Self {
        Self { cipher: DenomCipher::Eddsa, key: key.0.to_vec() }
    }

    /// SHA-256 of the raw key bytes.
    pub fn hash(&self) -> Hash256 {
        use sha2::{Digest, Sha256};
        Hash256(Sha256::digest(&self.key).into())
    }
}

/// Milliseconds since the Unix epoch.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord,
    bincode::Encode, bincode::Decode,
)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub fn now() -> Self {
        Self(chrono::Utc::now().timestamp_millis().max(0) as u64)
    }

    pub fn from_millis(ms: u64) -> Self {
        Self(ms)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }

    pub fn saturating_add(self, d: Duration) -> Self {
        let ms = u64::try_from(d.as_millis()).unwrap_or(u64::MAX);
        Self(self.0.saturating_add(ms))
    }

    /// Time remaining until `self`, zero if already reached.
    pub fn duration_since(self, earlier: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match chrono::DateTime::from_timestamp_millis(self.0 as i64) {
            Some(dt) => write!(f, "{}", dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)),
            None => write!(f, "{}ms", self.0),
        }
    }
}
