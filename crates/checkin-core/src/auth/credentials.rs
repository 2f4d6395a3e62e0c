use anyhow::{anyhow, Context, Result};
use keyring::Entry;

use crate::cache::CACHE_KEY_LEN;

const SERVICE_NAME: &str = "checkin-admin";

/// Keychain account holding the local cache encryption key.
const CACHE_KEY_ACCOUNT: &str = "__cache_key__";

pub struct CredentialStore;

impl CredentialStore {
    /// Store username and password in the OS keychain
    pub fn store(username: &str, password: &str) -> Result<()> {
        let entry = Entry::new(SERVICE_NAME, username)
            .context("Failed to create keyring entry")?;
        entry
            .set_password(password)
            .context("Failed to store password in keychain")?;
        Ok(())
    }

    /// Retrieve password for a username from the OS keychain
    pub fn get_password(username: &str) -> Result<String> {
        let entry = Entry::new(SERVICE_NAME, username)
            .context("Failed to create keyring entry")?;
        entry
            .get_password()
            .context("Failed to retrieve password from keychain")
    }

    /// Delete stored credentials for a username
    pub fn delete(username: &str) -> Result<()> {
        let entry = Entry::new(SERVICE_NAME, username)
            .context("Failed to create keyring entry")?;
        entry
            .delete_credential()
            .context("Failed to delete credential from keychain")?;
        Ok(())
    }

    /// Check if credentials exist for a username
    pub fn has_credentials(username: &str) -> bool {
        if let Ok(entry) = Entry::new(SERVICE_NAME, username) {
            entry.get_password().is_ok()
        } else {
            false
        }
    }

    /// Fetch the cache encryption key, creating one on first use.
    pub fn cache_key(generate: impl FnOnce() -> [u8; CACHE_KEY_LEN]) -> Result<[u8; CACHE_KEY_LEN]> {
        let entry = Entry::new(SERVICE_NAME, CACHE_KEY_ACCOUNT)
            .context("Failed to create keyring entry")?;
        match entry.get_password() {
            Ok(hex) => decode_key(&hex),
            Err(keyring::Error::NoEntry) => {
                let key = generate();
                entry
                    .set_password(&encode_key(&key))
                    .context("Failed to store cache key in keychain")?;
                Ok(key)
            }
            Err(e) => Err(anyhow!(e).context("Failed to read cache key from keychain")),
        }
    }
}

fn encode_key(key: &[u8; CACHE_KEY_LEN]) -> String {
    key.iter().map(|b| format!("{:02x}", b)).collect()
}

fn decode_key(hex: &str) -> Result<[u8; CACHE_KEY_LEN]> {
    if !hex.is_ascii() || hex.len() != CACHE_KEY_LEN * 2 {
        return Err(anyhow!("Stored cache key has the wrong length"));
    }
    let mut key = [0u8; CACHE_KEY_LEN];
    for (i, byte) in key.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
            .context("Stored cache key is not hex")?;
    }
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_hex_roundtrip() {
        let mut key = [0u8; CACHE_KEY_LEN];
        key[0] = 0xab;
        key[31] = 0x01;
        let hex = encode_key(&key);
        assert_eq!(hex.len(), 64);
        assert!(hex.starts_with("ab"));
        assert_eq!(decode_key(&hex).unwrap(), key);
    }

    #[test]
    fn test_decode_key_rejects_garbage() {
        assert!(decode_key("abc").is_err());
        assert!(decode_key(&"zz".repeat(CACHE_KEY_LEN)).is_err());
    }
}
