//! Identifier types shared between the tree database and the remote contract.
//!
//! The remote service addresses every file and folder by an opaque string
//! uuid. Internally the id is stored as eight little-endian u64 words of a
//! 64-byte zero-padded buffer, so equality and total ordering are
//! constant-size word comparisons. The diff's merge walk depends on that
//! ordering.

use std::fmt::{self, Display, Formatter};

/// Fixed-width remote identifier.
///
/// `Uuid::NIL` (all zero words) means "no parent": entries directly under
/// the account's base folder carry it once the base folder has been
/// remapped away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Uuid([u64; 8]);

impl Uuid {
    pub const NIL: Uuid = Uuid([0; 8]);

    pub fn is_nil(&self) -> bool {
        *self == Self::NIL
    }
}

impl From<&str> for Uuid {
    fn from(s: &str) -> Self {
        let mut bytes = [0u8; 64];
        let len = s.len().min(64);
        bytes[..len].copy_from_slice(&s.as_bytes()[..len]);

        let mut words = [0u64; 8];
        for (i, word) in words.iter_mut().enumerate() {
            let mut chunk = [0u8; 8];
            chunk.copy_from_slice(&bytes[i * 8..(i + 1) * 8]);
            *word = u64::from_le_bytes(chunk);
        }
        Uuid(words)
    }
}

impl From<&String> for Uuid {
    fn from(s: &String) -> Self {
        Uuid::from(s.as_str())
    }
}

impl Display for Uuid {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut bytes = [0u8; 64];
        for (i, word) in self.0.iter().enumerate() {
            bytes[i * 8..(i + 1) * 8].copy_from_slice(&word.to_le_bytes());
        }
        let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
        f.write_str(&String::from_utf8_lossy(&bytes[..end]))
    }
}

/// Last path component of an entry. Opaque and printable; path separators
/// inside names are not validated at this layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct FileName(String);

impl FileName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for FileName {
    fn from(s: &str) -> Self {
        FileName(s.to_string())
    }
}

impl From<String> for FileName {
    fn from(s: String) -> Self {
        FileName(s)
    }
}

impl Display for FileName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 32-byte content digest, lowercase hex in its serialized form.
///
/// The all-zero value means "hash unknown": directories, and files whose
/// live event carried no digest. An unknown hash never matches a computed
/// one, so the executor's hash shortcut cannot skip such downloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Decode a hex digest, tolerating short or malformed input the way the
    /// remote delivers it: whatever decodes is kept, the rest stays zero.
    pub fn from_hex(s: &str) -> Self {
        let mut out = [0u8; 32];
        if let Ok(decoded) = hex::decode(s) {
            let len = decoded.len().min(32);
            out[..len].copy_from_slice(&decoded[..len]);
        }
        ContentHash(out)
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl Display for ContentHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}
