// src/server.rs
//
// Every accepted connection becomes a framed Duplex pumped through the
// dispatcher and back into itself: reader -> dispatch -> writer.

use std::sync::Arc;

use anyhow::{Context, Result};
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::dispatch::Dispatcher;
use crate::duplex::Duplex;
use crate::pump::{Pipeline, PipelineControl, PipelineHandle};

pub struct Server {
    dispatcher: Arc<Dispatcher>,
    config: PipelineConfig,
    connections: Arc<DashMap<Uuid, PipelineControl>>,
    shutdown: CancellationToken,
}

impl Server {
    pub fn new(dispatcher: Dispatcher, config: PipelineConfig) -> Self {
        Self {
            dispatcher: Arc::new(dispatcher),
            config,
            connections: Arc::new(DashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub async fn bind(addr: &str) -> Result<TcpListener> {
        TcpListener::bind(addr)
            .await
            .with_context(|| format!("could not bind {addr}"))
    }

    /// Accept connections until [`Server::shutdown`] is called, then tear
    /// down every live connection.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        info!("server listening at {}", listener.local_addr()?);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        socket.set_nodelay(true).ok();
                        self.attach(socket, peer.to_string());
                    }
                    Err(e) => warn!("accept failed: {e}"),
                },
            }
        }

        let live: Vec<PipelineControl> = self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        info!(connections = live.len(), "server shutting down");
        for control in live {
            control.destroy("server shutting down");
        }
        Ok(())
    }

    /// Serve one already-connected stream.
    pub fn attach<T>(&self, io: T, peer: String) -> PipelineHandle
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let id = Uuid::new_v4();
        let (reader, writer) =
            Duplex::framed_with_limit(io, format!("conn:{peer}"), self.config.max_line).split();
        let connections = self.connections.clone();
        let pipeline = Pipeline::from_source(reader)
            .through(self.dispatcher.stage())
            .config(self.config.clone())
            .into_sink(writer)
            .on_complete(move |result| {
                connections.remove(&id);
                match result {
                    Ok(()) => debug!(%peer, "stream pipeline ended"),
                    Err(e) => error!(%peer, "server error: {e}"),
                }
            });
        self.connections.insert(id, pipeline.control());
        pipeline.spawn()
    }

    pub fn connections(&self) -> usize {
        self.connections.len()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}
