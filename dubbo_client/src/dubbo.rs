use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use log::debug;

use dubbo_protocol::{Error, ErrorKind, Result};

use crate::config::{Application, Opt};
use crate::consumer::build_consumer;
use crate::counter::QpsCounter;
use crate::middleware::Middleware;
use crate::proxy::{ServiceDescriptor, ServiceProxy};
use crate::queue::RequestQueue;
use crate::registry::Registry;
use crate::scheduler::Scheduler;
use crate::serializer::{JsonSerializer, Serializer};
use crate::transport::{TcpTransport, Transport};

/// marks a declared service as a remote proxy target; identity passthrough.
pub fn proxy_service(provider: ServiceDescriptor) -> ServiceDescriptor {
    provider
}

pub struct DubboBuilder {
    application: Application,
    opt: Opt,
    registry: Option<Arc<dyn Registry>>,
    transport: Option<Arc<dyn Transport>>,
    serializer: Option<Arc<dyn Serializer>>,
    services: Vec<ServiceDescriptor>,
}

impl DubboBuilder {
    pub fn application(mut self, application: Application) -> Self {
        self.application = application;
        self
    }

    pub fn opt(mut self, opt: Opt) -> Self {
        self.opt = opt;
        self
    }

    pub fn registry(mut self, registry: Arc<dyn Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = Some(serializer);
        self
    }

    pub fn service(mut self, descriptor: ServiceDescriptor) -> Self {
        self.services.push(descriptor);
        self
    }

    /// wires the queue and the scheduler task. fails synchronously on
    /// missing configuration, before any network activity happens.
    pub fn build(self) -> Result<Dubbo> {
        let registry = self
            .registry
            .ok_or_else(|| Error::new(ErrorKind::Config, "please specify a registry instance"))?;
        if self.services.is_empty() {
            return Err(Error::new(ErrorKind::Config, "no service declared"));
        }

        let connect_timeout = self.opt.connect_timeout;
        let transport = self.transport.unwrap_or_else(|| {
            Arc::new(TcpTransport {
                connect_timeout,
            })
        });
        let serializer = self
            .serializer
            .unwrap_or_else(|| Arc::new(JsonSerializer));

        let (queue, intake) = RequestQueue::new();
        let counter = Arc::new(QpsCounter::new());
        let middlewares: Arc<RwLock<Vec<Arc<dyn Middleware>>>> =
            Arc::new(RwLock::new(Vec::new()));

        let mut services = HashMap::new();
        let mut consumers = Vec::new();
        let mut keys = Vec::new();
        for descriptor in self.services {
            debug!(
                "declaring service {} -> {}",
                descriptor.short_name, descriptor.service_path
            );
            consumers.push(build_consumer(
                &self.application,
                &descriptor,
                self.opt.invoke_timeout,
            ));
            keys.push(descriptor.key());
            services.insert(
                descriptor.short_name.clone(),
                ServiceProxy::new(
                    descriptor,
                    self.application.clone(),
                    self.opt.invoke_timeout,
                    middlewares.clone(),
                    queue.clone(),
                ),
            );
        }

        Scheduler::spawn(
            self.opt,
            registry.clone(),
            transport,
            serializer,
            intake,
            keys,
            consumers,
            counter.clone(),
        );

        Ok(Dubbo {
            application: self.application,
            registry,
            services,
            middlewares,
            counter,
        })
    }
}

/// the consumer runtime: declared services, the middleware list and the
/// handle to the running scheduler.
pub struct Dubbo {
    application: Application,
    registry: Arc<dyn Registry>,
    services: HashMap<String, ServiceProxy>,
    middlewares: Arc<RwLock<Vec<Arc<dyn Middleware>>>>,
    counter: Arc<QpsCounter>,
}

impl std::fmt::Debug for Dubbo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dubbo").finish_non_exhaustive()
    }
}

impl Dubbo {
    pub fn builder() -> DubboBuilder {
        DubboBuilder {
            application: Application::default(),
            opt: Opt::default(),
            registry: None,
            transport: None,
            serializer: None,
            services: Vec::new(),
        }
    }

    /// register an interceptor; calls issued afterwards run through it.
    /// calls already in flight keep the chain they started with.
    pub fn use_middleware<M: Middleware + 'static>(&self, middleware: M) -> &Self {
        self.middlewares.write().unwrap().push(Arc::new(middleware));
        self
    }

    pub fn service(&self, short_name: &str) -> Option<&ServiceProxy> {
        self.services.get(short_name)
    }

    /// resolves once the registry finished its initial discovery; embedders
    /// gate their startup-complete signal on this.
    pub async fn ready(&self) -> Result<()> {
        self.registry.ready().await
    }

    /// dispatches counted during the last full second.
    pub fn qps(&self) -> u64 {
        self.counter.qps()
    }

    pub fn application(&self) -> &Application {
        &self.application
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::StaticRegistry;

    #[test]
    fn missing_registry_is_a_config_error() {
        let err = Dubbo::builder()
            .service(ServiceDescriptor::new("echo", "Echo").method("say"))
            .build()
            .unwrap_err();
        assert_eq!(ErrorKind::Config, err.kind());
    }

    #[test]
    fn missing_services_is_a_config_error() {
        let err = Dubbo::builder()
            .registry(Arc::new(StaticRegistry::new()))
            .build()
            .unwrap_err();
        assert_eq!(ErrorKind::Config, err.kind());
    }
}
