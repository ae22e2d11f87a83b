use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

use dubbo_protocol::{Error, ErrorKind, Message, Result};

/// events a live connection marshals back onto the scheduler task. every
/// socket callback goes through this single-consumer channel, so the
/// scheduler's maps are only ever touched from one task.
#[derive(Debug)]
pub enum ConnEvent {
    Response { addr: String, message: Message },
    Closed { addr: String, reason: String },
}

/// writer half of one connection, handed to the scheduler. dropping it tears
/// the writer task down and closes the socket.
#[derive(Debug)]
pub struct ConnHandle {
    frames: mpsc::UnboundedSender<Message>,
}

impl ConnHandle {
    pub fn new(frames: mpsc::UnboundedSender<Message>) -> ConnHandle {
        ConnHandle { frames }
    }

    pub fn send(&self, msg: Message) -> Result<()> {
        self.frames
            .send(msg)
            .map_err(|_| Error::new(ErrorKind::Connection, "connection writer is gone"))
    }
}

/// the socket seam. implementations own their reader/writer tasks and report
/// everything through `ConnEvent`s.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        addr: &str,
        events: mpsc::UnboundedSender<ConnEvent>,
    ) -> Result<ConnHandle>;
}

/// tcp transport speaking the default framing.
pub struct TcpTransport {
    pub connect_timeout: Duration,
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(
        &self,
        addr: &str,
        events: mpsc::UnboundedSender<ConnEvent>,
    ) -> Result<ConnHandle> {
        let stream = timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::new(ErrorKind::Connection, format!("connect to {} timed out", addr)))?
            .map_err(|err| Error::new(ErrorKind::Connection, err))?;
        let _ = stream.set_nodelay(true);
        let (mut rd, mut wr) = stream.into_split();

        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        let write_addr = addr.to_owned();
        let write_events = events.clone();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(err) = wr.write_all(&msg.encode()).await {
                    warn!("failed to write to {}: {}", write_addr, err);
                    let _ = write_events.send(ConnEvent::Closed {
                        addr: write_addr.clone(),
                        reason: err.to_string(),
                    });
                    return;
                }
            }
        });

        let read_addr = addr.to_owned();
        tokio::spawn(async move {
            loop {
                match Message::read_from(&mut rd).await {
                    Ok(message) => {
                        let sent = events.send(ConnEvent::Response {
                            addr: read_addr.clone(),
                            message,
                        });
                        if sent.is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        debug!("connection to {} closed: {}", read_addr, err);
                        let _ = events.send(ConnEvent::Closed {
                            addr: read_addr.clone(),
                            reason: err.to_string(),
                        });
                        return;
                    }
                }
            }
        });

        Ok(ConnHandle::new(tx))
    }
}
