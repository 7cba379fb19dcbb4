use crate::oci_registry::{DOCKER_HUB_URL, RegistryClient, RegistryError, RegistryTransport};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;
use tracing::debug;

type ClientCell = Arc<OnceCell<Arc<dyn RegistryClient>>>;

/// Holds at most one registry client per host for the lifetime of one audit run.
///
/// Entries are only ever added. Concurrent first requests for the same host share a
/// single `open` call; a failed `open` is not remembered, so a later request retries.
pub struct RegistryClientCache {
    transport: Arc<dyn RegistryTransport>,
    clients: Mutex<HashMap<String, ClientCell>>,
}

impl RegistryClientCache {
    pub fn new(transport: Arc<dyn RegistryTransport>) -> Self {
        Self {
            transport,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Base URL for a registry host, an empty host being Docker Hub
    pub fn registry_url(host: &str) -> String {
        if host.is_empty() {
            DOCKER_HUB_URL.to_string()
        } else {
            format!("https://{}", host)
        }
    }

    pub async fn get(&self, host: &str) -> Result<Arc<dyn RegistryClient>, RegistryError> {
        let cell = {
            // a poisoned map is still consistent, entries are inserted whole
            let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
            clients.entry(host.to_string()).or_default().clone()
        };

        if let Some(client) = cell.get() {
            debug!("Registry client cache hit for {:?}", host);
            return Ok(client.clone());
        }

        let client = cell
            .get_or_try_init(|| async {
                let url = Self::registry_url(host);
                debug!("Registry client cache miss for {:?}, connecting to {}", host, url);
                self.transport.open(&url, "", "").await
            })
            .await?;
        Ok(client.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci_registry::{MockRegistryClient, MockRegistryTransport};
    use mockall::predicate::eq;
    use std::time::Duration;

    fn client() -> Arc<dyn RegistryClient> {
        Arc::new(MockRegistryClient::new())
    }

    #[test]
    fn test_registry_url() {
        assert_eq!(RegistryClientCache::registry_url(""), DOCKER_HUB_URL);
        assert_eq!(
            RegistryClientCache::registry_url("myregistry.io:5000"),
            "https://myregistry.io:5000"
        );
    }

    #[tokio::test]
    async fn opens_each_host_once() {
        let mut transport = MockRegistryTransport::new();
        transport
            .expect_open()
            .with(eq(DOCKER_HUB_URL), eq(""), eq(""))
            .times(1)
            .returning(|_, _, _| Ok(client()));
        transport
            .expect_open()
            .with(eq("https://quay.io"), eq(""), eq(""))
            .times(1)
            .returning(|_, _, _| Ok(client()));

        let cache = RegistryClientCache::new(Arc::new(transport));
        let first = cache.get("").await.unwrap();
        let second = cache.get("").await.unwrap();
        cache.get("quay.io").await.unwrap();
        cache.get("quay.io").await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let mut transport = MockRegistryTransport::new();
        let mut seq = mockall::Sequence::new();
        transport
            .expect_open()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Err(RegistryError::Unauthorized("https://flaky.io".into())));
        transport
            .expect_open()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(client()));

        let cache = RegistryClientCache::new(Arc::new(transport));

        assert!(cache.get("flaky.io").await.is_err());
        assert!(cache.get("flaky.io").await.is_ok());
        assert!(cache.get("flaky.io").await.is_ok());
    }

    struct SlowTransport {
        opens: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl RegistryTransport for SlowTransport {
        async fn open(
            &self,
            _base_url: &str,
            _username: &str,
            _password: &str,
        ) -> Result<Arc<dyn RegistryClient>, RegistryError> {
            self.opens
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(client())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_access_opens_once() {
        let transport = Arc::new(SlowTransport {
            opens: Default::default(),
        });
        let cache = Arc::new(RegistryClientCache::new(transport.clone()));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get("ghcr.io").await.map(|_| ()) })
            })
            .collect();

        for result in futures::future::join_all(handles).await {
            result.unwrap().unwrap();
        }

        assert_eq!(
            transport.opens.load(std::sync::atomic::Ordering::SeqCst),
            1
        );
    }
}
