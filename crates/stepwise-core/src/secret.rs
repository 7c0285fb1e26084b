//! Secret provider port and the resolution chain used by tools.
//!
//! The engine never persists secret values. Tools ask [`SecretService`] for
//! a value by name; providers are consulted in order and the first hit wins.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use stepwise_types::error::SecretError;
use stepwise_types::secret::SecretEntry;

/// Trait for secret storage backends (vault file, environment).
pub trait SecretProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Returns None if the secret does not exist in this provider.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>, SecretError>> + Send;

    fn set(&self, key: &str, value: &str) -> impl Future<Output = Result<(), SecretError>> + Send;

    fn delete(&self, key: &str) -> impl Future<Output = Result<(), SecretError>> + Send;

    /// Metadata only, never values.
    fn list(&self) -> impl Future<Output = Result<Vec<SecretEntry>, SecretError>> + Send;
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Object-safe version of [`SecretProvider`] with boxed futures.
pub trait SecretProviderDyn: Send + Sync {
    fn name(&self) -> &str;
    fn get_boxed<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>, SecretError>>;
    fn set_boxed<'a>(&'a self, key: &'a str, value: &'a str) -> BoxFuture<'a, Result<(), SecretError>>;
    fn delete_boxed<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), SecretError>>;
    fn list_boxed(&self) -> BoxFuture<'_, Result<Vec<SecretEntry>, SecretError>>;
}

impl<T: SecretProvider> SecretProviderDyn for T {
    fn name(&self) -> &str {
        SecretProvider::name(self)
    }

    fn get_boxed<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>, SecretError>> {
        Box::pin(self.get(key))
    }

    fn set_boxed<'a>(&'a self, key: &'a str, value: &'a str) -> BoxFuture<'a, Result<(), SecretError>> {
        Box::pin(self.set(key, value))
    }

    fn delete_boxed<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), SecretError>> {
        Box::pin(self.delete(key))
    }

    fn list_boxed(&self) -> BoxFuture<'_, Result<Vec<SecretEntry>, SecretError>> {
        Box::pin(self.list())
    }
}

/// Shared, type-erased secret provider.
pub type DynSecretProvider = Arc<dyn SecretProviderDyn>;

/// Wrap a concrete provider for use in a [`SecretService`] chain.
pub fn dyn_provider<T: SecretProvider + 'static>(provider: T) -> DynSecretProvider {
    Arc::new(provider)
}

/// Resolves secrets through a chain of providers in priority order.
pub struct SecretService {
    providers: Vec<DynSecretProvider>,
}

impl SecretService {
    /// Providers should be ordered by precedence (highest priority first).
    pub fn new(providers: Vec<DynSecretProvider>) -> Self {
        Self { providers }
    }

    /// A service with no providers: every lookup comes back empty.
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// First value found wins. A failing provider is logged and skipped so a
    /// broken vault degrades to "absent" rather than failing the caller.
    pub async fn get_secret(&self, key: &str) -> Option<String> {
        for provider in &self.providers {
            match provider.get_boxed(key).await {
                Ok(Some(value)) => return Some(value),
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(provider = provider.name(), key, "secret lookup failed: {e}");
                }
            }
        }
        None
    }

    /// Store a secret value in the first writable provider.
    pub async fn set_secret(&self, key: &str, value: &str) -> Result<(), SecretError> {
        for provider in &self.providers {
            match provider.set_boxed(key, value).await {
                Ok(()) => return Ok(()),
                Err(SecretError::ReadOnly) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(SecretError::ProviderUnavailable)
    }

    /// Delete a secret from every provider that has it.
    pub async fn delete_secret(&self, key: &str) -> Result<(), SecretError> {
        let mut deleted = false;
        for provider in &self.providers {
            match provider.delete_boxed(key).await {
                Ok(()) => deleted = true,
                Err(SecretError::NotFound | SecretError::ReadOnly) => continue,
                Err(e) => return Err(e),
            }
        }
        if deleted { Ok(()) } else { Err(SecretError::NotFound) }
    }

    /// All secrets across providers. First provider wins for duplicate keys.
    pub async fn list_secrets(&self) -> Vec<SecretEntry> {
        let mut seen = HashSet::new();
        let mut entries = Vec::new();
        for provider in &self.providers {
            match provider.list_boxed().await {
                Ok(found) => {
                    for entry in found {
                        if seen.insert(entry.key.clone()) {
                            entries.push(entry);
                        }
                    }
                }
                Err(e) => tracing::warn!(provider = provider.name(), "secret listing failed: {e}"),
            }
        }
        entries
    }

    /// Mask a secret value, showing only the last 4 characters.
    ///
    /// - "sk-abcdefghijklmnop" -> "****mnop"
    /// - "abc" -> "****"
    pub fn mask_secret(value: &str) -> String {
        let chars: Vec<char> = value.chars().collect();
        if chars.len() <= 4 {
            "****".to_string()
        } else {
            let tail: String = chars[chars.len() - 4..].iter().collect();
            format!("****{tail}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use stepwise_types::secret::SecretSource;

    struct MapProvider {
        values: Mutex<HashMap<String, String>>,
        writable: bool,
        broken: bool,
    }

    impl MapProvider {
        fn new(writable: bool) -> Self {
            Self {
                values: Mutex::new(HashMap::new()),
                writable,
                broken: false,
            }
        }

        fn with(self, key: &str, value: &str) -> Self {
            self.values
                .lock()
                .unwrap()
                .insert(key.to_string(), value.to_string());
            self
        }
    }

    impl SecretProvider for MapProvider {
        fn name(&self) -> &str {
            "map"
        }

        async fn get(&self, key: &str) -> Result<Option<String>, SecretError> {
            if self.broken {
                return Err(SecretError::DecryptionError);
            }
            Ok(self.values.lock().unwrap().get(key).cloned())
        }

        async fn set(&self, key: &str, value: &str) -> Result<(), SecretError> {
            if !self.writable {
                return Err(SecretError::ReadOnly);
            }
            self.values
                .lock()
                .unwrap()
                .insert(key.to_string(), value.to_string());
            Ok(())
        }

        async fn delete(&self, key: &str) -> Result<(), SecretError> {
            match self.values.lock().unwrap().remove(key) {
                Some(_) => Ok(()),
                None => Err(SecretError::NotFound),
            }
        }

        async fn list(&self) -> Result<Vec<SecretEntry>, SecretError> {
            Ok(self
                .values
                .lock()
                .unwrap()
                .keys()
                .map(|k| SecretEntry {
                    key: k.clone(),
                    source: SecretSource::Vault,
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn first_provider_wins_and_broken_providers_are_skipped() {
        let broken = MapProvider {
            broken: true,
            ..MapProvider::new(true)
        };
        let service = SecretService::new(vec![
            dyn_provider(broken),
            dyn_provider(MapProvider::new(false).with("K", "one")),
            dyn_provider(MapProvider::new(true).with("K", "two")),
        ]);
        assert_eq!(service.get_secret("K").await.as_deref(), Some("one"));
        assert_eq!(service.get_secret("missing").await, None);
    }

    #[tokio::test]
    async fn set_skips_read_only_providers() {
        let service = SecretService::new(vec![
            dyn_provider(MapProvider::new(false)),
            dyn_provider(MapProvider::new(true)),
        ]);
        service.set_secret("K", "v").await.unwrap();
        assert_eq!(service.get_secret("K").await.as_deref(), Some("v"));
        assert_eq!(service.list_secrets().await.len(), 1);

        service.delete_secret("K").await.unwrap();
        assert!(matches!(
            service.delete_secret("K").await,
            Err(SecretError::NotFound)
        ));
        assert!(matches!(
            SecretService::empty().set_secret("K", "v").await,
            Err(SecretError::ProviderUnavailable)
        ));
    }

    #[test]
    fn masking() {
        assert_eq!(SecretService::mask_secret("sk-abcdefghijklmnop"), "****mnop");
        assert_eq!(SecretService::mask_secret("abc"), "****");
    }
}
