//! Time-based one-time passwords (RFC 6238) for completing login.
//!
//! HMAC-SHA1 over the big-endian time counter, dynamic truncation,
//! zero-padded decimal output. Digits and period come from configuration
//! because accounts differ.

use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use sha1::Sha1;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TotpError {
    #[error("secret is not valid base32")]
    InvalidSecret,
}

pub struct TotpGenerator {
    /// Base32 shared secret; spaces and case are tolerated.
    pub secret: String,
    pub digits: u32,
    /// Step length in seconds.
    pub period: u64,
}

impl TotpGenerator {
    /// One-time password for the current wall-clock time.
    pub fn generate(&self) -> Result<String, TotpError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        self.generate_at(now)
    }

    /// One-time password for a given unix timestamp in seconds.
    pub fn generate_at(&self, unix_secs: u64) -> Result<String, TotpError> {
        let normalized = self.secret.replace(' ', "").to_ascii_uppercase();
        let key = base32::decode(base32::Alphabet::Rfc4648 { padding: false }, &normalized)
            .ok_or(TotpError::InvalidSecret)?;

        let counter = unix_secs / self.period.max(1);

        let mut mac =
            Hmac::<Sha1>::new_from_slice(&key).map_err(|_| TotpError::InvalidSecret)?;
        mac.update(&counter.to_be_bytes());
        let digest = mac.finalize().into_bytes();

        // RFC 4226 dynamic truncation
        let offset = (digest[digest.len() - 1] & 0x0f) as usize;
        let code = ((digest[offset] as u32 & 0x7f) << 24)
            | ((digest[offset + 1] as u32) << 16)
            | ((digest[offset + 2] as u32) << 8)
            | (digest[offset + 3] as u32);

        let modulo = 10u32.pow(self.digits.min(9));
        Ok(format!(
            "{:0width$}",
            code % modulo,
            width = self.digits as usize
        ))
    }
}
