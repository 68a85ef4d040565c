//! Bearer-token authorization.
//!
//! The server never stores tokens, only their SHA-256 digests, configured
//! as `<alias>:<sha256-hex>` entries. Presented tokens are hashed and
//! compared in constant time. Health and metrics endpoints stay open.

use anyhow::{bail, Result};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

pub struct AuthKeys {
    keys: Vec<(String, [u8; 32])>,
}

impl AuthKeys {
    /// Parse configured `<alias>:<sha256-hex>` entries. Returns `None`
    /// when no entries are configured (authentication disabled).
    pub fn parse(entries: &[String]) -> Result<Option<Self>> {
        if entries.is_empty() {
            return Ok(None);
        }

        let mut keys = Vec::with_capacity(entries.len());
        for entry in entries {
            let Some((alias, digest_hex)) = entry.split_once(':') else {
                bail!("authorization entry without ':' separator");
            };
            if digest_hex.len() != 64 {
                bail!("authorization digest for '{alias}' is not a sha256 hex string");
            }

            let mut digest = [0u8; 32];
            for (index, byte) in digest.iter_mut().enumerate() {
                let pair = &digest_hex[index * 2..index * 2 + 2];
                *byte = u8::from_str_radix(pair, 16)
                    .map_err(|_| anyhow::anyhow!("invalid hex in digest for '{alias}'"))?;
            }
            keys.push((alias.to_string(), digest));
        }

        Ok(Some(Self { keys }))
    }

    /// Check a presented bearer token; returns the matching alias.
    pub fn validate(&self, token: &str) -> Option<&str> {
        let presented: [u8; 32] = Sha256::digest(token.as_bytes()).into();

        for (alias, digest) in &self.keys {
            if bool::from(presented.ct_eq(digest)) {
                return Some(alias);
            }
        }
        None
    }
}

/// Extract the token of an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header: &str) -> Option<&str> {
    header.strip_prefix("Bearer ")
}
