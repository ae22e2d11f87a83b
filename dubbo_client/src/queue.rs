use std::collections::HashMap;
use std::time::Duration;

use futures::channel::oneshot;
use serde_json::Value;
use tokio::sync::mpsc;

use dubbo_protocol::{Error, ErrorKind, Result};

use crate::registry::ServiceKey;

/// the dispatchable view of a context: everything the scheduler needs to
/// frame and route one request.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub seq: u64,
    pub service_path: String,
    pub method: String,
    pub args: Vec<Value>,
    pub group: String,
    pub version: String,
    pub timeout: Duration,
    pub metadata: HashMap<String, String>,
}

impl Invocation {
    pub fn service_key(&self) -> ServiceKey {
        ServiceKey {
            service_path: self.service_path.clone(),
            group: self.group.clone(),
            version: self.version.clone(),
        }
    }
}

/// one queued request plus the sender that settles its future. the oneshot
/// sender is consumed on resolution, so every entry settles exactly once.
#[derive(Debug)]
pub struct QueueEntry {
    pub inv: Invocation,
    pub tx: oneshot::Sender<Result<Value>>,
}

/// hands invocations to the scheduler. `push` never blocks; the returned
/// future settles when the scheduler resolves the call.
#[derive(Debug, Clone)]
pub struct RequestQueue {
    intake: mpsc::UnboundedSender<QueueEntry>,
}

impl RequestQueue {
    pub fn new() -> (RequestQueue, mpsc::UnboundedReceiver<QueueEntry>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (RequestQueue { intake: tx }, rx)
    }

    pub async fn push(&self, inv: Invocation) -> Result<Value> {
        let seq = inv.seq;
        let (tx, rx) = oneshot::channel();
        if self.intake.send(QueueEntry { inv, tx }).is_err() {
            return Err(Error::new(ErrorKind::Connection, "scheduler is gone"));
        }
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::new(
                ErrorKind::Connection,
                format!("request {} was dropped unresolved", seq),
            )),
        }
    }
}
