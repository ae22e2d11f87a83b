use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use async_trait::async_trait;
use tokio::sync::mpsc;

use dubbo_protocol::Result;

use crate::consumer::ConsumerDescriptor;

/// identifies one subscribable service: interface plus group and version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceKey {
    pub service_path: String,
    pub group: String,
    pub version: String,
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.service_path, self.group, self.version)
    }
}

/// one live provider as reported by the registry. the scheduler never
/// invents addresses beyond the notified set.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderAddress {
    pub host: String,
    pub port: u16,
    pub service_path: String,
    pub group: String,
    pub version: String,
    pub weight: i32,
}

impl ProviderAddress {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn key(&self) -> ServiceKey {
        ServiceKey {
            service_path: self.service_path.clone(),
            group: self.group.clone(),
            version: self.version.clone(),
        }
    }
}

/// one full snapshot of the live providers for a service. subscribers diff
/// consecutive snapshots instead of tracking individual add/remove events.
#[derive(Debug, Clone)]
pub struct ProviderUpdate {
    pub key: ServiceKey,
    pub providers: Vec<ProviderAddress>,
}

/// the discovery seam. real deployments back this with a coordination
/// service; tests use [`StaticRegistry`].
#[async_trait]
pub trait Registry: Send + Sync {
    /// resolves once initial address discovery has completed.
    async fn ready(&self) -> Result<()>;

    async fn register_consumers(&self, consumers: Vec<ConsumerDescriptor>) -> Result<()>;

    /// subscribe for full-snapshot updates of one service. the current
    /// snapshot is delivered immediately on the given channel.
    async fn subscribe(
        &self,
        key: ServiceKey,
        notify: mpsc::UnboundedSender<ProviderUpdate>,
    ) -> Result<()>;
}

/// a fixed provider table, updatable by hand.
#[derive(Default)]
pub struct StaticRegistry {
    providers: RwLock<HashMap<ServiceKey, Vec<ProviderAddress>>>,
    subscribers: RwLock<Vec<(ServiceKey, mpsc::UnboundedSender<ProviderUpdate>)>>,
    consumers: RwLock<Vec<ConsumerDescriptor>>,
}

impl StaticRegistry {
    pub fn new() -> StaticRegistry {
        Default::default()
    }

    /// replace the provider set for one service and notify its subscribers.
    pub fn update_providers(&self, key: ServiceKey, providers: Vec<ProviderAddress>) {
        self.providers
            .write()
            .unwrap()
            .insert(key.clone(), providers.clone());
        let subscribers = self.subscribers.read().unwrap();
        for (k, tx) in subscribers.iter() {
            if *k == key {
                let _ = tx.send(ProviderUpdate {
                    key: key.clone(),
                    providers: providers.clone(),
                });
            }
        }
    }

    pub fn registered_consumers(&self) -> Vec<ConsumerDescriptor> {
        self.consumers.read().unwrap().clone()
    }
}

#[async_trait]
impl Registry for StaticRegistry {
    async fn ready(&self) -> Result<()> {
        Ok(())
    }

    async fn register_consumers(&self, consumers: Vec<ConsumerDescriptor>) -> Result<()> {
        self.consumers.write().unwrap().extend(consumers);
        Ok(())
    }

    async fn subscribe(
        &self,
        key: ServiceKey,
        notify: mpsc::UnboundedSender<ProviderUpdate>,
    ) -> Result<()> {
        let current = self
            .providers
            .read()
            .unwrap()
            .get(&key)
            .cloned()
            .unwrap_or_default();
        let _ = notify.send(ProviderUpdate {
            key: key.clone(),
            providers: current,
        });
        self.subscribers.write().unwrap().push((key, notify));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ServiceKey {
        ServiceKey {
            service_path: "Echo".to_owned(),
            group: String::new(),
            version: "0.0.0".to_owned(),
        }
    }

    fn provider(port: u16) -> ProviderAddress {
        ProviderAddress {
            host: "127.0.0.1".to_owned(),
            port,
            service_path: "Echo".to_owned(),
            group: String::new(),
            version: "0.0.0".to_owned(),
            weight: 1,
        }
    }

    #[tokio::test]
    async fn subscribe_delivers_current_snapshot() {
        let registry = StaticRegistry::new();
        registry.update_providers(key(), vec![provider(8972)]);

        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.subscribe(key(), tx).await.unwrap();

        let update = rx.recv().await.unwrap();
        assert_eq!(key(), update.key);
        assert_eq!(1, update.providers.len());
        assert_eq!("127.0.0.1:8972", update.providers[0].addr());
    }

    #[tokio::test]
    async fn update_notifies_subscribers() {
        let registry = StaticRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.subscribe(key(), tx).await.unwrap();
        rx.recv().await.unwrap(); // initial empty snapshot

        registry.update_providers(key(), vec![provider(8972), provider(8973)]);
        let update = rx.recv().await.unwrap();
        assert_eq!(2, update.providers.len());

        registry.update_providers(key(), vec![]);
        let update = rx.recv().await.unwrap();
        assert!(update.providers.is_empty());
    }
}
