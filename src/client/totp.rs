//! Time-based one-time passwords (RFC 6238, HMAC-SHA1)

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::error::{Result, TvError};

type HmacSha1 = Hmac<Sha1>;

const STEP_SECS: i64 = 30;
const DIGITS: u32 = 6;

/// Decode an RFC 4648 base32 string. Case, spaces and padding are ignored.
pub fn decode_base32(input: &str) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(input.len() * 5 / 8);
    let mut buffer: u32 = 0;
    let mut bits = 0u32;

    for c in input.chars().filter(|c| !c.is_whitespace() && *c != '=' && *c != '-') {
        let value = match c.to_ascii_uppercase() {
            c @ 'A'..='Z' => c as u32 - 'A' as u32,
            c @ '2'..='7' => c as u32 - '2' as u32 + 26,
            _ => {
                return Err(TvError::validation(
                    "totp_secret",
                    "********",
                    format!("invalid base32 character '{}'", c),
                ))
            }
        };
        buffer = (buffer << 5) | value;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push((buffer >> bits) as u8);
            buffer &= (1 << bits) - 1;
        }
    }

    if out.is_empty() {
        return Err(TvError::validation("totp_secret", "", "secret is empty"));
    }
    Ok(out)
}

/// HOTP value for `counter` (RFC 4226 dynamic truncation)
fn hotp(key: &[u8], counter: u64, digits: u32) -> Result<String> {
    let mut mac = HmacSha1::new_from_slice(key)
        .map_err(|e| TvError::Internal(format!("HMAC key error: {}", e)))?;
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let code = u32::from_be_bytes([
        digest[offset] & 0x7f,
        digest[offset + 1],
        digest[offset + 2],
        digest[offset + 3],
    ]);
    let code = code % 10u32.pow(digits);
    Ok(format!("{:0width$}", code, width = digits as usize))
}

/// Code for a Unix timestamp
pub fn totp_at(secret: &str, unix_secs: i64) -> Result<String> {
    let key = decode_base32(secret)?;
    hotp(&key, (unix_secs / STEP_SECS) as u64, DIGITS)
}

/// Code for the current time
pub fn generate_totp(secret: &str) -> Result<String> {
    totp_at(secret, Utc::now().timestamp())
}
