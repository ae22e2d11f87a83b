use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value;

use crate::queue::Invocation;

static SEQ: AtomicU64 = AtomicU64::new(1);

/// process-unique correlation id for the next request.
pub fn next_seq() -> u64 {
    SEQ.fetch_add(1, Ordering::SeqCst)
}

/// one in-flight invocation. owned by the calling task while the middleware
/// chain runs; `body` is unset until the scheduler resolves the call.
#[derive(Debug)]
pub struct Context {
    pub seq: u64,
    pub service_path: String,
    pub method: String,
    pub args: Vec<Value>,
    pub group: String,
    pub version: String,
    pub timeout: Duration,
    pub metadata: HashMap<String, String>,
    pub body: Option<Value>,
}

impl Context {
    pub fn new(service_path: &str, method: &str, args: Vec<Value>, timeout: Duration) -> Context {
        Context {
            seq: next_seq(),
            service_path: service_path.to_owned(),
            method: method.to_owned(),
            args,
            group: String::new(),
            version: String::new(),
            timeout,
            metadata: HashMap::new(),
            body: None,
        }
    }

    /// the dispatchable view of this context, handed to the request queue.
    pub fn invocation(&self) -> Invocation {
        Invocation {
            seq: self.seq,
            service_path: self.service_path.clone(),
            method: self.method.clone(),
            args: self.args.clone(),
            group: self.group.clone(),
            version: self.version.clone(),
            timeout: self.timeout,
            metadata: self.metadata.clone(),
        }
    }
}
