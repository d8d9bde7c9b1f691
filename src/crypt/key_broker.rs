use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use bson::Uuid;
use tokio::time::Instant;

use super::{data_key::DataKey, key_vault::KeyVault, kms::KmsClient};
use crate::{
    error::{Error, Result},
    trace::ENCRYPTION_TRACING_EVENT_TARGET,
};

/// How long an unwrapped data key is reused before it is fetched and unwrapped again.
pub(crate) const KEY_CACHE_TTL: Duration = Duration::from_secs(60);

/// A reference to a data key, by UUID or by one of its alt names.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum EncryptKey {
    /// The key's `_id`.
    Id(Uuid),
    /// One of the key's `keyAltNames`.
    AltName(String),
}

impl From<Uuid> for EncryptKey {
    fn from(id: Uuid) -> Self {
        Self::Id(id)
    }
}

#[derive(Debug)]
struct CachedKey {
    material: Arc<Vec<u8>>,
    alt_names: Vec<String>,
    expires: Instant,
}

#[derive(Debug, Default)]
struct KeyCache {
    keys: HashMap<Uuid, CachedKey>,
    alt_names: HashMap<String, Uuid>,
}

impl KeyCache {
    fn get(&mut self, id: &Uuid) -> Option<Arc<Vec<u8>>> {
        let expired = self.keys.get(id)?.expires <= Instant::now();
        if expired {
            self.evict(id);
            return None;
        }
        self.keys.get(id).map(|k| k.material.clone())
    }

    fn evict(&mut self, id: &Uuid) {
        if let Some(key) = self.keys.remove(id) {
            for name in key.alt_names {
                self.alt_names.remove(&name);
            }
        }
    }

    fn insert(&mut self, key: &DataKey, material: Vec<u8>) -> Arc<Vec<u8>> {
        let material = Arc::new(material);
        for name in &key.key_alt_names {
            self.alt_names.insert(name.clone(), key.id);
        }
        self.keys.insert(
            key.id,
            CachedKey {
                material: material.clone(),
                alt_names: key.key_alt_names.clone(),
                expires: Instant::now() + KEY_CACHE_TTL,
            },
        );
        material
    }
}

/// Resolves key references to unwrapped key material, fetching from the key vault and unwrapping
/// through KMS on a cache miss.
#[derive(Debug)]
pub(crate) struct KeyBroker {
    vault: KeyVault,
    kms: Arc<KmsClient>,
    cache: Mutex<KeyCache>,
}

impl KeyBroker {
    pub(crate) fn new(vault: KeyVault, kms: Arc<KmsClient>) -> Self {
        Self {
            vault,
            kms,
            cache: Default::default(),
        }
    }

    pub(crate) fn vault(&self) -> &KeyVault {
        &self.vault
    }

    pub(crate) fn kms(&self) -> &KmsClient {
        &self.kms
    }

    fn cached(&self, key: &EncryptKey) -> Option<(Uuid, Arc<Vec<u8>>)> {
        let mut cache = self.cache.lock().ok()?;
        let id = match key {
            EncryptKey::Id(id) => *id,
            EncryptKey::AltName(name) => *cache.alt_names.get(name)?,
        };
        cache.get(&id).map(|material| (id, material))
    }

    fn store(&self, key: &DataKey, material: Vec<u8>) -> Arc<Vec<u8>> {
        match self.cache.lock() {
            Ok(mut cache) => cache.insert(key, material),
            Err(_) => Arc::new(material),
        }
    }

    /// The key id and material `key` refers to. An unknown id or alt name is an error.
    pub(crate) async fn resolve(&self, key: &EncryptKey) -> Result<(Uuid, Arc<Vec<u8>>)> {
        if let Some(hit) = self.cached(key) {
            return Ok(hit);
        }
        let found = match key {
            EncryptKey::Id(id) => self.vault.find_by_id(id).await?,
            EncryptKey::AltName(name) => self.vault.find_by_alt_name(name).await?,
        };
        let data_key = found.ok_or_else(|| match key {
            EncryptKey::Id(id) => Error::encryption(format!(
                "not all keys requested were satisfied: no key with id {id}"
            )),
            EncryptKey::AltName(name) => Error::encryption(format!(
                "not all keys requested were satisfied: no key with alt name {name:?}"
            )),
        })?;
        tracing::debug!(
            target: ENCRYPTION_TRACING_EVENT_TARGET,
            key_id = %data_key.id,
            "Fetched data key from key vault",
        );
        let material = data_key.unwrap(&self.kms).await?;
        Ok((data_key.id, self.store(&data_key, material)))
    }

    /// Loads every listed key not already cached with a single key vault query.
    pub(crate) async fn prefetch(&self, keys: &[EncryptKey]) -> Result<()> {
        let mut ids = Vec::new();
        let mut alt_names = Vec::new();
        for key in keys {
            if self.cached(key).is_some() {
                continue;
            }
            match key {
                EncryptKey::Id(id) if !ids.contains(id) => ids.push(*id),
                EncryptKey::AltName(name) if !alt_names.contains(name) => {
                    alt_names.push(name.clone())
                }
                _ => {}
            }
        }
        if ids.is_empty() && alt_names.is_empty() {
            return Ok(());
        }
        for data_key in self.vault.find_many(&ids, &alt_names).await? {
            let material = data_key.unwrap(&self.kms).await?;
            self.store(&data_key, material);
        }
        Ok(())
    }

    /// Drops a key from the cache, so the next use reads it from the key vault again.
    pub(crate) fn forget(&self, id: &Uuid) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.evict(id);
        }
    }
}

#[cfg(test)]
mod test {
    use bson::{spec::BinarySubtype, Binary, DateTime};

    use super::*;

    fn data_key(alt_names: &[&str]) -> DataKey {
        bson::from_document(bson::doc! {
            "_id": Uuid::new(),
            "keyAltNames": alt_names,
            "keyMaterial": Binary { subtype: BinarySubtype::Generic, bytes: vec![0; 8] },
            "masterKey": { "provider": "local" },
            "creationDate": DateTime::now(),
            "updateDate": DateTime::now(),
            "status": 0,
        })
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn cached_keys_expire() {
        let mut cache = KeyCache::default();
        let key = data_key(&["alt"]);
        cache.insert(&key, vec![1, 2, 3]);

        assert_eq!(cache.alt_names.get("alt"), Some(&key.id));
        assert_eq!(cache.get(&key.id).as_deref(), Some(&vec![1, 2, 3]));

        tokio::time::advance(KEY_CACHE_TTL + Duration::from_millis(1)).await;
        assert!(cache.get(&key.id).is_none());
        assert!(cache.alt_names.is_empty());
    }

    #[test]
    fn evicting_forgets_alt_names() {
        let mut cache = KeyCache::default();
        let a = data_key(&["a", "b"]);
        let c = data_key(&["c"]);
        cache.insert(&a, vec![1]);
        cache.insert(&c, vec![2]);
        cache.evict(&a.id);
        assert!(!cache.alt_names.contains_key("a"));
        assert!(!cache.alt_names.contains_key("b"));
        assert_eq!(cache.alt_names.get("c"), Some(&c.id));
    }
}
