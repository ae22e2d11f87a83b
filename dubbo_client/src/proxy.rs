use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error};
use serde_json::Value;

use dubbo_protocol::{Error, ErrorKind, Result};

use crate::config::Application;
use crate::context::Context;
use crate::middleware::{Middleware, Next, Terminal};
use crate::queue::RequestQueue;
use crate::registry::ServiceKey;

/// the declared shape of one remote service: an explicit method table
/// instead of runtime property probing.
#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    /// lookup key on the consumer side.
    pub short_name: String,
    /// remote interface name.
    pub service_path: String,
    pub methods: Vec<String>,
    pub group: String,
    pub version: String,
    /// per-service override of the global invoke timeout.
    pub timeout: Option<Duration>,
}

impl ServiceDescriptor {
    pub fn new(short_name: &str, service_path: &str) -> ServiceDescriptor {
        ServiceDescriptor {
            short_name: short_name.to_owned(),
            service_path: service_path.to_owned(),
            methods: Vec::new(),
            group: String::new(),
            version: "0.0.0".to_owned(),
            timeout: None,
        }
    }

    pub fn method(mut self, name: &str) -> Self {
        self.methods.push(name.to_owned());
        self
    }

    pub fn group(mut self, group: &str) -> Self {
        self.group = group.to_owned();
        self
    }

    pub fn version(mut self, version: &str) -> Self {
        self.version = version.to_owned();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn key(&self) -> ServiceKey {
        ServiceKey {
            service_path: self.service_path.clone(),
            group: self.group.clone(),
            version: self.version.clone(),
        }
    }
}

/// the non-removable innermost chain step: enqueue and await resolution.
struct QueueTerminal {
    queue: RequestQueue,
}

#[async_trait]
impl Terminal for QueueTerminal {
    async fn call(&self, ctx: &mut Context) -> Result<()> {
        debug!(
            "enqueue request {} {}.{}",
            ctx.seq, ctx.service_path, ctx.method
        );
        let body = self.queue.push(ctx.invocation()).await?;
        ctx.body = Some(body);
        Ok(())
    }
}

/// callable handle for one declared service. each call builds a fresh
/// context, composes the current middleware list and runs the chain; the
/// chain's outcome is the call's outcome.
pub struct ServiceProxy {
    descriptor: ServiceDescriptor,
    application: Application,
    default_timeout: Duration,
    middlewares: Arc<RwLock<Vec<Arc<dyn Middleware>>>>,
    terminal: QueueTerminal,
}

impl ServiceProxy {
    pub(crate) fn new(
        descriptor: ServiceDescriptor,
        application: Application,
        default_timeout: Duration,
        middlewares: Arc<RwLock<Vec<Arc<dyn Middleware>>>>,
        queue: RequestQueue,
    ) -> ServiceProxy {
        ServiceProxy {
            descriptor,
            application,
            default_timeout,
            middlewares,
            terminal: QueueTerminal { queue },
        }
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    /// invoke one declared method; positional args go out verbatim.
    pub async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        if !self.descriptor.methods.iter().any(|m| m == method) {
            return Err(Error::new(
                ErrorKind::Config,
                format!(
                    "method {} is not declared on {}",
                    method, self.descriptor.service_path
                ),
            ));
        }

        let timeout = self.descriptor.timeout.unwrap_or(self.default_timeout);
        let mut ctx = Context::new(&self.descriptor.service_path, method, args, timeout);
        ctx.group = self.descriptor.group.clone();
        ctx.version = self.descriptor.version.clone();
        ctx.metadata
            .insert("application".to_owned(), self.application.name.clone());

        let chain: Vec<Arc<dyn Middleware>> = self.middlewares.read().unwrap().clone();
        match Next::new(&chain, &self.terminal).run(&mut ctx).await {
            Ok(()) => Ok(ctx.body.take().unwrap_or(Value::Null)),
            Err(err) => {
                error!(
                    "call {}.{} failed: {}",
                    self.descriptor.service_path, method, err
                );
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn undeclared_method_is_rejected() {
        let (queue, _intake) = RequestQueue::new();
        let proxy = ServiceProxy::new(
            ServiceDescriptor::new("echo", "Echo").method("say"),
            Application::default(),
            Duration::from_secs(1),
            Arc::new(RwLock::new(Vec::new())),
            queue,
        );
        let err = proxy.invoke("shout", vec![json!("hi")]).await.unwrap_err();
        assert_eq!(ErrorKind::Config, err.kind());
    }

    #[tokio::test]
    async fn chain_outcome_is_call_outcome() {
        let (queue, mut intake) = RequestQueue::new();
        let proxy = ServiceProxy::new(
            ServiceDescriptor::new("echo", "Echo").method("say"),
            Application::default(),
            Duration::from_secs(1),
            Arc::new(RwLock::new(Vec::new())),
            queue,
        );

        let resolver = tokio::spawn(async move {
            let entry = intake.recv().await.unwrap();
            assert_eq!("Echo", entry.inv.service_path);
            assert_eq!("say", entry.inv.method);
            entry.tx.send(Ok(json!("hi"))).unwrap();
        });

        let reply = proxy.invoke("say", vec![json!("hi")]).await.unwrap();
        assert_eq!(json!("hi"), reply);
        resolver.await.unwrap();
    }
}
