// Secret Store
// Lookup of per-destination stream keys; storage is owned by the host

use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::sync::RwLock;

/// Stream key lookup. Absence is `None`; lookups never fail.
pub trait SecretStore: Send + Sync {
    fn get_stream_key<'a>(&'a self, destination_id: &'a str) -> BoxFuture<'a, Option<String>>;
}

/// In-memory store, used by the standalone server and by tests
#[derive(Default)]
pub struct MemorySecretStore {
    keys: RwLock<HashMap<String, String>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_stream_key(&self, destination_id: &str, key: &str) {
        let mut keys = self.keys.write().unwrap_or_else(|e| {
            log::warn!("Secret store lock poisoned (set_stream_key), recovering: {e}");
            e.into_inner()
        });
        keys.insert(destination_id.to_string(), key.to_string());
    }

    pub fn delete_stream_key(&self, destination_id: &str) {
        let mut keys = self.keys.write().unwrap_or_else(|e| {
            log::warn!("Secret store lock poisoned (delete_stream_key), recovering: {e}");
            e.into_inner()
        });
        keys.remove(destination_id);
    }

    /// Load keys from `FREESTREAM_KEY_<ID>` environment variables (id upper-cased, `-` as `_`)
    pub fn load_from_env(&self, destination_ids: impl IntoIterator<Item = String>) -> usize {
        let mut loaded = 0;
        for id in destination_ids {
            let var = format!("FREESTREAM_KEY_{}", id.to_uppercase().replace('-', "_"));
            if let Ok(key) = std::env::var(&var) {
                if !key.trim().is_empty() {
                    self.set_stream_key(&id, key.trim());
                    loaded += 1;
                }
            }
        }
        loaded
    }
}

impl SecretStore for MemorySecretStore {
    fn get_stream_key<'a>(&'a self, destination_id: &'a str) -> BoxFuture<'a, Option<String>> {
        let key = match self.keys.read() {
            Ok(keys) => keys.get(destination_id).cloned(),
            Err(e) => {
                log::warn!("Secret store lock poisoned (get_stream_key), recovering: {e}");
                e.into_inner().get(destination_id).cloned()
            }
        };
        Box::pin(async move { key.filter(|k| !k.is_empty()) })
    }
}
