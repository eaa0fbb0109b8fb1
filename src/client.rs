// src/client.rs
//
// Request/reply over a record Duplex. Each request gets a fresh reply route;
// a background task reads replies and hands each one to the caller waiting
// on that route.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use dashmap::DashMap;
use serde_json::Value;
use sluice_wire::{Envelope, Response};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::chunk::Chunk;
use crate::duplex::{Duplex, DuplexReader, DuplexWriter};
use crate::stage::{Sink, Source};

type Pending = Arc<DashMap<String, oneshot::Sender<Response>>>;

pub struct Client {
    writer: Mutex<DuplexWriter>,
    pending: Pending,
    closed: CancellationToken,
    reader: JoinHandle<()>,
    reply_field: String,
    timeout: Option<Duration>,
}

impl Client {
    pub fn new(duplex: Duplex, reply_field: impl Into<String>) -> Self {
        let reply_field = reply_field.into();
        let (reader, writer) = duplex.split();
        let pending: Pending = Arc::new(DashMap::new());
        let closed = CancellationToken::new();
        let reader = tokio::spawn(route_replies(
            reader,
            pending.clone(),
            closed.clone(),
            reply_field.clone(),
        ));
        Self {
            writer: Mutex::new(writer),
            pending,
            closed,
            reader,
            reply_field,
            timeout: None,
        }
    }

    pub async fn connect(addr: &str, reply_field: impl Into<String>) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("could not connect to {addr}"))?;
        stream.set_nodelay(true).ok();
        Ok(Self::new(
            Duplex::framed(stream, format!("client:{addr}")),
            reply_field,
        ))
    }

    /// Fail requests that get no reply within `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Send `envelope` with a fresh reply route and wait for its reply.
    pub async fn act(&self, mut envelope: Envelope) -> Result<Response> {
        let id = Uuid::new_v4().to_string();
        envelope.insert(self.reply_field.clone(), id.clone());

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);
        if self.closed.is_cancelled() {
            self.pending.remove(&id);
            return Err(anyhow!("connection closed"));
        }

        if let Err(e) = self.write(envelope).await {
            self.pending.remove(&id);
            return Err(e);
        }

        let reply = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(reply) => reply,
                Err(_) => {
                    self.pending.remove(&id);
                    return Err(anyhow!("no reply within {limit:?}"));
                }
            },
            None => rx.await,
        };
        reply.map_err(|_| anyhow!("connection closed before reply"))
    }

    /// Fire and forget: the envelope goes out without a reply route.
    pub async fn send(&self, mut envelope: Envelope) -> Result<()> {
        envelope.remove(&self.reply_field);
        self.write(envelope).await
    }

    /// Requests still waiting for a reply.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// End our side of the stream and wait until the peer closes theirs.
    pub async fn close(mut self) -> Result<()> {
        self.writer.get_mut().close().await?;
        (&mut self.reader).await.context("reply task failed")?;
        Ok(())
    }

    async fn write(&self, envelope: Envelope) -> Result<()> {
        self.writer
            .lock()
            .await
            .consume(Chunk::Record(envelope.into_value()))
            .await
            .context("could not send request")
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

fn route_key(route: &Value) -> String {
    match route {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

async fn route_replies(
    mut reader: DuplexReader,
    pending: Pending,
    closed: CancellationToken,
    reply_field: String,
) {
    loop {
        match reader.produce().await {
            Ok(Some(chunk)) => {
                let Some(value) = chunk.into_record() else {
                    warn!("client received bytes, ignored");
                    continue;
                };
                match Response::from_reply(value, &reply_field) {
                    Ok((Some(route), response)) => {
                        let key = route_key(&route);
                        match pending.remove(&key) {
                            Some((_, tx)) => {
                                let _ = tx.send(response);
                            }
                            None => warn!(%key, "reply for unknown request"),
                        }
                    }
                    Ok((None, _)) => warn!("reply without {reply_field}, dropped"),
                    Err(e) => warn!("malformed reply: {e}"),
                }
            }
            Ok(None) => {
                debug!("server closed the connection");
                break;
            }
            Err(e) => {
                warn!("client read failed: {e:#}");
                break;
            }
        }
    }
    closed.cancel();
    pending.clear();
}
