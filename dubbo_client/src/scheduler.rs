use std::cmp;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::channel::oneshot;
use log::{debug, info, warn};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep};

use dubbo_protocol::{Error, ErrorKind, Message, MessageStatusType, MessageType, Result};

use crate::config::Opt;
use crate::consumer::ConsumerDescriptor;
use crate::context::next_seq;
use crate::counter::QpsCounter;
use crate::queue::{Invocation, QueueEntry};
use crate::registry::{ProviderAddress, ProviderUpdate, Registry, ServiceKey};
use crate::selector::{new_selector, Candidate, Selector};
use crate::serializer::Serializer;
use crate::transport::{ConnEvent, ConnHandle, Transport};

/// a request the scheduler has accepted but not yet resolved.
struct Pending {
    inv: Invocation,
    retries_left: u8,
    tx: oneshot::Sender<Result<Value>>,
}

enum ConnState {
    Connecting,
    Connected { handle: ConnHandle, missed_beats: u8 },
    Failed,
}

struct Connection {
    weight: i32,
    state: ConnState,
    /// consecutive connect failures, drives the reconnect backoff.
    attempts: u32,
    /// requests dispatched on this connection and not yet resolved.
    pending: HashMap<u64, Pending>,
}

enum Event {
    Connected { addr: String, handle: ConnHandle },
    ConnectFailed { addr: String, reason: String },
    Reconnect { addr: String },
    Timeout { seq: u64 },
}

/// owns the connection pool and all in-flight bookkeeping. runs as a single
/// task: enqueue, dispatch, response, timeout and state transitions are
/// serialized through its event loop, so the maps need no locks.
pub(crate) struct Scheduler {
    opt: Opt,
    transport: Arc<dyn Transport>,
    serializer: Arc<dyn Serializer>,
    selector: Box<dyn Selector>,
    counter: Arc<QpsCounter>,

    /// latest registry snapshot per service.
    providers: HashMap<ServiceKey, Vec<ProviderAddress>>,
    /// address -> connection; one connection may serve several services.
    conns: HashMap<String, Connection>,
    /// accepted requests with no connected candidate yet.
    parked: Vec<Pending>,
    /// seq -> address of the connection carrying it.
    dispatched: HashMap<u64, String>,

    events_tx: mpsc::UnboundedSender<Event>,
    conn_tx: mpsc::UnboundedSender<ConnEvent>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        opt: Opt,
        registry: Arc<dyn Registry>,
        transport: Arc<dyn Transport>,
        serializer: Arc<dyn Serializer>,
        intake: mpsc::UnboundedReceiver<QueueEntry>,
        keys: Vec<ServiceKey>,
        consumers: Vec<ConsumerDescriptor>,
        counter: Arc<QpsCounter>,
    ) {
        tokio::spawn(async move {
            if let Err(err) = registry.ready().await {
                warn!("registry not ready: {}", err);
            }
            if let Err(err) = registry.register_consumers(consumers).await {
                warn!("failed to register consumers: {}", err);
            }

            let (provider_tx, provider_rx) = mpsc::unbounded_channel();
            for key in keys {
                if let Err(err) = registry.subscribe(key.clone(), provider_tx.clone()).await {
                    warn!("failed to subscribe {}: {}", key, err);
                }
            }

            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let (conn_tx, conn_rx) = mpsc::unbounded_channel();
            let scheduler = Scheduler {
                selector: new_selector(opt.select_mode),
                opt,
                transport,
                serializer,
                counter,
                providers: HashMap::new(),
                conns: HashMap::new(),
                parked: Vec::new(),
                dispatched: HashMap::new(),
                events_tx,
                conn_tx,
            };
            scheduler.run(intake, events_rx, conn_rx, provider_rx).await;
        });
    }

    async fn run(
        mut self,
        mut intake: mpsc::UnboundedReceiver<QueueEntry>,
        mut events: mpsc::UnboundedReceiver<Event>,
        mut conn_events: mpsc::UnboundedReceiver<ConnEvent>,
        mut provider_updates: mpsc::UnboundedReceiver<ProviderUpdate>,
    ) {
        let mut heartbeat = interval(self.opt.heartbeat_interval);
        loop {
            tokio::select! {
                Some(entry) = intake.recv() => self.accept(entry),
                Some(update) = provider_updates.recv() => self.reconcile(update),
                Some(event) = events.recv() => self.on_event(event),
                Some(event) = conn_events.recv() => self.on_conn_event(event),
                _ = heartbeat.tick() => self.heartbeat_tick(),
            }
        }
    }

    fn on_event(&mut self, event: Event) {
        match event {
            Event::Connected { addr, handle } => self.on_connected(addr, handle),
            Event::ConnectFailed { addr, reason } => self.on_connect_failed(addr, reason),
            Event::Reconnect { addr } => self.on_reconnect(addr),
            Event::Timeout { seq } => self.on_timeout(seq),
        }
    }

    fn on_conn_event(&mut self, event: ConnEvent) {
        match event {
            ConnEvent::Response { addr, message } => self.on_response(addr, message),
            ConnEvent::Closed { addr, reason } => {
                // reader and writer halves may both report the close; the
                // second report finds the connection already failed.
                let connected = matches!(
                    self.conns.get(&addr).map(|c| &c.state),
                    Some(ConnState::Connected { .. })
                );
                if connected {
                    self.fail_conn(&addr, &reason);
                }
            }
        }
    }

    // ---- request intake and dispatch ----

    fn accept(&mut self, entry: QueueEntry) {
        let QueueEntry { inv, tx } = entry;
        // one timer per request, armed on acceptance; it covers both the
        // parked wait and the in-flight wait, so a call with zero providers
        // still settles by its deadline.
        self.arm_timer(inv.seq, inv.timeout);
        let pending = Pending {
            retries_left: self.opt.retry,
            inv,
            tx,
        };
        self.dispatch(pending);
    }

    fn arm_timer(&self, seq: u64, timeout: Duration) {
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            sleep(timeout).await;
            let _ = tx.send(Event::Timeout { seq });
        });
    }

    fn dispatch(&mut self, pending: Pending) {
        let key = pending.inv.service_key();
        let candidates = self.candidates(&key);
        let route = format!("{}.{}", pending.inv.service_path, pending.inv.method);
        match self.selector.select(&route, &candidates) {
            Some(addr) => self.send_request(addr, pending),
            None => {
                debug!(
                    "no connected provider for {}, parking request {}",
                    key, pending.inv.seq
                );
                self.parked.push(pending);
            }
        }
    }

    fn candidates(&self, key: &ServiceKey) -> Vec<Candidate> {
        let mut out = Vec::new();
        if let Some(list) = self.providers.get(key) {
            for p in list {
                if let Some(conn) = self.conns.get(&p.addr()) {
                    if let ConnState::Connected { .. } = conn.state {
                        out.push(Candidate {
                            addr: p.addr(),
                            weight: p.weight,
                        });
                    }
                }
            }
        }
        out.sort_by(|a, b| a.addr.cmp(&b.addr));
        out
    }

    fn send_request(&mut self, addr: String, pending: Pending) {
        let seq = pending.inv.seq;
        let msg = match self.build_request(&pending.inv) {
            Ok(msg) => msg,
            Err(err) => {
                Self::resolve(pending, Err(err));
                return;
            }
        };

        let mut slot = Some(pending);
        let mut failure: Option<String> = None;
        if let Some(conn) = self.conns.get_mut(&addr) {
            if let ConnState::Connected { handle, .. } = &conn.state {
                match handle.send(msg) {
                    Ok(()) => {
                        conn.pending.insert(seq, slot.take().unwrap());
                    }
                    Err(err) => failure = Some(err.to_string()),
                }
            } else {
                failure = Some("connection not ready".to_owned());
            }
        } else {
            failure = Some("connection vanished".to_owned());
        }

        match slot {
            None => {
                self.dispatched.insert(seq, addr.clone());
                self.counter.increment();
                debug!("request {} dispatched to {}", seq, addr);
            }
            Some(pending) => {
                let reason = failure.unwrap_or_default();
                warn!("dispatch of request {} to {} failed: {}", seq, addr, reason);
                self.fault(pending, &reason);
            }
        }
    }

    fn build_request(&self, inv: &Invocation) -> Result<Message> {
        let payload = self.serializer.serialize_args(&inv.args)?;
        let mut msg = Message::new();
        msg.set_message_type(MessageType::Request);
        msg.set_serialize_type(self.serializer.serialize_type());
        msg.set_seq(inv.seq);
        msg.service_path = inv.service_path.clone();
        msg.service_method = inv.method.clone();
        msg.metadata = inv.metadata.clone();
        msg.payload.extend_from_slice(&payload);
        Ok(msg)
    }

    /// one connection-level fault against this request's budget. timeouts
    /// and application errors never come through here.
    fn fault(&mut self, mut pending: Pending, reason: &str) {
        if pending.retries_left > 0 {
            pending.retries_left -= 1;
        }
        if pending.retries_left == 0 {
            debug!("request {} exhausted its retry budget", pending.inv.seq);
            Self::resolve(
                pending,
                Err(Error::new(
                    ErrorKind::Connection,
                    format!("retry budget exhausted: {}", reason),
                )),
            );
        } else {
            self.dispatch(pending);
        }
    }

    fn resolve(pending: Pending, result: Result<Value>) {
        // the receiver may already be gone; settling is best-effort here and
        // exactly-once by construction.
        let _ = pending.tx.send(result);
    }

    // ---- responses and timeouts ----

    fn on_response(&mut self, addr: String, message: Message) {
        if message.is_heartbeat() {
            if let Some(conn) = self.conns.get_mut(&addr) {
                if let ConnState::Connected { missed_beats, .. } = &mut conn.state {
                    *missed_beats = 0;
                }
            }
            return;
        }

        let seq = message.get_seq();
        let pending = match self.conns.get_mut(&addr).and_then(|c| c.pending.remove(&seq)) {
            Some(pending) => pending,
            None => {
                // late or unknown response; the first settlement already won
                debug!("discarding response {} from {}", seq, addr);
                return;
            }
        };
        self.dispatched.remove(&seq);

        let result = match message.get_message_status_type() {
            Some(MessageStatusType::Error) => Err(Error::new(
                ErrorKind::Application,
                message
                    .get_error()
                    .unwrap_or_else(|| "provider error".to_owned()),
            )),
            _ => self.serializer.deserialize_body(&message.payload),
        };
        Self::resolve(pending, result);
    }

    fn on_timeout(&mut self, seq: u64) {
        if let Some(idx) = self.parked.iter().position(|p| p.inv.seq == seq) {
            let pending = self.parked.remove(idx);
            Self::resolve(
                pending,
                Err(Error::new(
                    ErrorKind::Timeout,
                    format!("request {} timed out waiting for a provider", seq),
                )),
            );
            return;
        }
        if let Some(addr) = self.dispatched.remove(&seq) {
            if let Some(pending) = self.conns.get_mut(&addr).and_then(|c| c.pending.remove(&seq)) {
                Self::resolve(
                    pending,
                    Err(Error::new(
                        ErrorKind::Timeout,
                        format!("request {} timed out on {}", seq, addr),
                    )),
                );
            }
        }
        // otherwise the request was already resolved; the timer is a no-op
    }

    // ---- registry reconciliation ----

    fn reconcile(&mut self, update: ProviderUpdate) {
        info!(
            "provider snapshot for {}: {} addresses",
            update.key,
            update.providers.len()
        );
        self.providers
            .insert(update.key.clone(), update.providers.clone());

        for p in &update.providers {
            let addr = p.addr();
            match self.conns.get_mut(&addr) {
                Some(conn) => conn.weight = p.weight,
                None => {
                    self.conns.insert(
                        addr.clone(),
                        Connection {
                            weight: p.weight,
                            state: ConnState::Connecting,
                            attempts: 0,
                            pending: HashMap::new(),
                        },
                    );
                    self.start_connect(addr);
                }
            }
        }

        let stale: Vec<String> = self
            .conns
            .keys()
            .filter(|addr| !self.addr_wanted(addr.as_str()))
            .cloned()
            .collect();
        for addr in stale {
            self.close_conn(&addr, "address removed by registry");
        }

        self.drain_parked();
    }

    fn addr_wanted(&self, addr: &str) -> bool {
        self.providers
            .values()
            .any(|list| list.iter().any(|p| p.addr() == addr))
    }

    // ---- connection lifecycle ----

    fn start_connect(&self, addr: String) {
        let transport = self.transport.clone();
        let events = self.events_tx.clone();
        let conn_tx = self.conn_tx.clone();
        tokio::spawn(async move {
            match transport.connect(&addr, conn_tx).await {
                Ok(handle) => {
                    let _ = events.send(Event::Connected { addr, handle });
                }
                Err(err) => {
                    let _ = events.send(Event::ConnectFailed {
                        addr,
                        reason: err.to_string(),
                    });
                }
            }
        });
    }

    fn on_connected(&mut self, addr: String, handle: ConnHandle) {
        if !self.addr_wanted(&addr) {
            info!("discarding connection to removed address {}", addr);
            self.conns.remove(&addr);
            return;
        }
        if let Some(conn) = self.conns.get_mut(&addr) {
            info!("connected to {}", addr);
            conn.state = ConnState::Connected {
                handle,
                missed_beats: 0,
            };
            conn.attempts = 0;
            self.drain_parked();
        }
    }

    fn on_connect_failed(&mut self, addr: String, reason: String) {
        warn!("failed to connect {}: {}", addr, reason);
        if !self.addr_wanted(&addr) {
            self.conns.remove(&addr);
            return;
        }
        if let Some(conn) = self.conns.get_mut(&addr) {
            conn.state = ConnState::Failed;
            conn.attempts += 1;
            let attempts = conn.attempts;
            self.schedule_reconnect(addr, attempts);
        }
    }

    fn on_reconnect(&mut self, addr: String) {
        if !self.addr_wanted(&addr) {
            self.conns.remove(&addr);
            return;
        }
        if let Some(conn) = self.conns.get_mut(&addr) {
            if let ConnState::Failed = conn.state {
                conn.state = ConnState::Connecting;
                self.start_connect(addr);
            }
        }
    }

    /// transition to FAILED, drain the pending map into the retry path and
    /// schedule a backoff reconnect.
    fn fail_conn(&mut self, addr: &str, reason: &str) {
        let drained = match self.conns.get_mut(addr) {
            Some(conn) => {
                warn!("connection to {} failed: {}", addr, reason);
                conn.state = ConnState::Failed;
                conn.attempts += 1;
                let attempts = conn.attempts;
                let drained: Vec<Pending> = conn.pending.drain().map(|(_, p)| p).collect();
                Some((drained, attempts))
            }
            None => None,
        };
        if let Some((drained, attempts)) = drained {
            for p in &drained {
                self.dispatched.remove(&p.inv.seq);
            }
            for p in drained {
                self.fault(p, reason);
            }
            self.schedule_reconnect(addr.to_owned(), attempts);
        }
    }

    /// drop the connection entirely; pending requests re-enter the retry
    /// path against whatever other providers remain.
    fn close_conn(&mut self, addr: &str, reason: &str) {
        if let Some(mut conn) = self.conns.remove(addr) {
            info!("closing connection to {}: {}", addr, reason);
            let drained: Vec<Pending> = conn.pending.drain().map(|(_, p)| p).collect();
            for p in &drained {
                self.dispatched.remove(&p.inv.seq);
            }
            for p in drained {
                self.fault(p, reason);
            }
        }
    }

    fn schedule_reconnect(&self, addr: String, attempts: u32) {
        let delay = backoff_delay(self.opt.reconnect_delay, self.opt.reconnect_delay_cap, attempts);
        debug!("reconnecting {} in {:?}", addr, delay);
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            let _ = tx.send(Event::Reconnect { addr });
        });
    }

    fn drain_parked(&mut self) {
        if self.parked.is_empty() {
            return;
        }
        let parked = std::mem::take(&mut self.parked);
        for pending in parked {
            self.dispatch(pending);
        }
    }

    // ---- heartbeats ----

    fn heartbeat_tick(&mut self) {
        let threshold = self.opt.heartbeat_miss_threshold;
        let mut failed: Vec<String> = Vec::new();
        for (addr, conn) in self.conns.iter_mut() {
            if let ConnState::Connected {
                handle,
                missed_beats,
            } = &mut conn.state
            {
                if *missed_beats >= threshold {
                    failed.push(addr.clone());
                    continue;
                }
                *missed_beats += 1;
                let mut msg = Message::new();
                msg.set_message_type(MessageType::Request);
                msg.set_heartbeat(true);
                msg.set_seq(next_seq());
                if handle.send(msg).is_err() {
                    failed.push(addr.clone());
                }
            }
        }
        for addr in failed {
            self.fail_conn(&addr, "heartbeat timeout");
        }
    }
}

fn backoff_delay(base: Duration, cap: Duration, attempts: u32) -> Duration {
    let exp = attempts.saturating_sub(1).min(16);
    cmp::min(base * 2u32.saturating_pow(exp), cap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let base = Duration::from_millis(100);
        let cap = Duration::from_secs(1);
        assert_eq!(Duration::from_millis(100), backoff_delay(base, cap, 1));
        assert_eq!(Duration::from_millis(200), backoff_delay(base, cap, 2));
        assert_eq!(Duration::from_millis(400), backoff_delay(base, cap, 3));
        assert_eq!(cap, backoff_delay(base, cap, 5));
        assert_eq!(cap, backoff_delay(base, cap, 40));
    }
}
