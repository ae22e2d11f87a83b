use async_trait::async_trait;
use std::sync::Arc;

use dubbo_protocol::Result;

use crate::context::Context;

/// an onion-model interceptor around a single invocation: run logic before
/// `next`, after `next`, or skip `next` entirely to short-circuit the call.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn invoke(&self, ctx: &mut Context, next: Next<'_>) -> Result<()>;
}

/// the innermost step of every chain. appended automatically, not
/// user-registerable.
#[async_trait]
pub trait Terminal: Send + Sync {
    async fn call(&self, ctx: &mut Context) -> Result<()>;
}

/// the remainder of the chain as seen by one interceptor.
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    terminal: &'a dyn Terminal,
}

impl<'a> Next<'a> {
    pub fn new(chain: &'a [Arc<dyn Middleware>], terminal: &'a dyn Terminal) -> Next<'a> {
        Next { chain, terminal }
    }

    pub async fn run(mut self, ctx: &mut Context) -> Result<()> {
        match self.chain.split_first() {
            Some((head, rest)) => {
                self.chain = rest;
                head.invoke(ctx, self).await
            }
            None => self.terminal.call(ctx).await,
        }
    }
}
