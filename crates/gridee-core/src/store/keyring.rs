use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use keyring::Entry;
use tracing::debug;

use super::{apply_edits, select, Edit, KeyValueStore, StoreError};

const SERVICE_NAME: &str = "gridee";
const ACCOUNT_NAME: &str = "auth_prefs";

/// Key-value store kept in the OS keychain.
///
/// The whole map lives in one credential entry as a JSON object, so a batch
/// is a single keychain write.
pub struct KeyringStore {
    service: String,
    account: String,
    write_lock: Mutex<()>,
}

impl KeyringStore {
    pub fn new() -> Self {
        Self::with_account(SERVICE_NAME, ACCOUNT_NAME)
    }

    pub fn with_account(service: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            account: account.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn entry(&self) -> Result<Entry, StoreError> {
        Ok(Entry::new(&self.service, &self.account)?)
    }

    fn read_map(&self) -> Result<HashMap<String, String>, StoreError> {
        match self.entry()?.get_password() {
            Ok(blob) => decode_blob(&blob),
            Err(keyring::Error::NoEntry) => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_map(&self, map: &HashMap<String, String>) -> Result<(), StoreError> {
        let entry = self.entry()?;
        if map.is_empty() {
            // Nothing left to keep, drop the credential entirely
            return match entry.delete_credential() {
                Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
                Err(e) => Err(e.into()),
            };
        }
        entry.set_password(&serde_json::to_string(map)?)?;
        Ok(())
    }
}

impl Default for KeyringStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueStore for KeyringStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.read_map()?.remove(key))
    }

    fn get_many(&self, keys: &[&str]) -> Result<Vec<Option<String>>, StoreError> {
        Ok(select(&self.read_map()?, keys))
    }

    fn commit(&self, edits: Vec<Edit>) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut map = self.read_map()?;
        apply_edits(&mut map, edits);
        self.write_map(&map)?;
        debug!(service = %self.service, entries = map.len(), "Keychain entry written");
        Ok(())
    }
}

fn decode_blob(blob: &str) -> Result<HashMap<String, String>, StoreError> {
    let value: serde_json::Value = serde_json::from_str(blob)?;
    let object = value
        .as_object()
        .ok_or_else(|| StoreError::Corrupt("keychain entry is not a JSON object".to_string()))?;

    object
        .iter()
        .map(|(k, v)| match v.as_str() {
            Some(s) => Ok((k.clone(), s.to_string())),
            None => Err(StoreError::Corrupt(format!("value for '{}' is not a string", k))),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_blob() {
        let map = decode_blob(r#"{"jwt_token":"a.b.c","user_id":"u1"}"#).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map.get("user_id").map(String::as_str), Some("u1"));
    }

    #[test]
    fn test_decode_blob_rejects_non_object() {
        assert!(matches!(decode_blob("[1,2]"), Err(StoreError::Corrupt(_))));
        assert!(matches!(decode_blob("nope"), Err(StoreError::Serialization(_))));
    }

    #[test]
    fn test_decode_blob_rejects_non_string_values() {
        assert!(matches!(
            decode_blob(r#"{"token_timestamp":123}"#),
            Err(StoreError::Corrupt(_))
        ));
    }
}
