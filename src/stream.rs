//! NDJSON stream consumer.
//!
//! One connection at a time, driven through
//! `Disconnected -> Connecting -> Streaming -> Backoff -> Connecting`.
//! Any connect failure, stale read, EOF, decode error or store error drops
//! the connection and waits out the fixed backoff before reconnecting.

use crate::config::Config;
use crate::ingest::Ingestor;
use crate::telemetry::decode_line;
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Disconnected,
    Connecting,
    Streaming,
    Backoff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    Start,
    Connected,
    Dropped,
    BackoffElapsed,
}

impl StreamState {
    pub fn on(self, event: StreamEvent) -> StreamState {
        match (self, event) {
            (StreamState::Disconnected, StreamEvent::Start) => StreamState::Connecting,
            (StreamState::Connecting, StreamEvent::Connected) => StreamState::Streaming,
            (StreamState::Connecting | StreamState::Streaming, StreamEvent::Dropped) => {
                StreamState::Backoff
            }
            (StreamState::Backoff, StreamEvent::BackoffElapsed) => StreamState::Connecting,
            (state, _) => state,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub address: String,
    pub read_timeout: Duration,
    pub backoff: Duration,
    pub close_timeout: Duration,
}

impl StreamSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            address: config.stream_address(),
            read_timeout: config.stream_read_timeout(),
            backoff: config.stream_backoff(),
            close_timeout: config.stream_close_timeout(),
        }
    }
}

enum SessionEnd {
    Cancelled,
    Dropped(anyhow::Error),
}

pub struct StreamService {
    settings: StreamSettings,
    ingestor: Ingestor,
}

impl StreamService {
    pub fn new(settings: StreamSettings, ingestor: Ingestor) -> Self {
        Self { settings, ingestor }
    }

    pub fn start(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    /// Runs until `cancel` fires. Transient failures never end the loop.
    pub async fn run(self, cancel: CancellationToken) {
        let stats = self.ingestor.stats();
        let mut state = StreamState::Disconnected;
        let mut connection: Option<TcpStream> = None;

        loop {
            if cancel.is_cancelled() {
                break;
            }
            tracing::trace!(?state, address = %self.settings.address, "stream state");
            state = match state {
                StreamState::Disconnected => state.on(StreamEvent::Start),
                StreamState::Connecting => {
                    let attempt = tokio::select! {
                        _ = cancel.cancelled() => break,
                        res = timeout(self.settings.read_timeout, TcpStream::connect(&self.settings.address)) => res,
                    };
                    match attempt {
                        Ok(Ok(stream)) => {
                            tracing::info!(address = %self.settings.address, "connected to reading stream");
                            stats.set_stream_connected(true);
                            connection = Some(stream);
                            state.on(StreamEvent::Connected)
                        }
                        Ok(Err(err)) => {
                            tracing::warn!(address = %self.settings.address, error = %err, "failed to connect to reading stream");
                            stats.record_error(&err);
                            state.on(StreamEvent::Dropped)
                        }
                        Err(_) => {
                            tracing::warn!(address = %self.settings.address, "timed out connecting to reading stream");
                            stats.record_error("connect timed out");
                            state.on(StreamEvent::Dropped)
                        }
                    }
                }
                StreamState::Streaming => {
                    let Some(stream) = connection.take() else {
                        state = StreamState::Disconnected;
                        continue;
                    };
                    let end = self.consume(stream, &cancel).await;
                    stats.set_stream_connected(false);
                    match end {
                        SessionEnd::Cancelled => break,
                        SessionEnd::Dropped(err) => {
                            tracing::info!(
                                error = %format!("{err:#}"),
                                backoff_secs = self.settings.backoff.as_secs_f64(),
                                "reading stream dropped; reconnecting after backoff"
                            );
                            stats.record_error(format!("{err:#}"));
                            state.on(StreamEvent::Dropped)
                        }
                    }
                }
                StreamState::Backoff => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = sleep(self.settings.backoff) => state.on(StreamEvent::BackoffElapsed),
                    }
                }
            };
        }

        stats.set_stream_connected(false);
        tracing::info!("reading stream stopped");
    }

    async fn consume(&self, stream: TcpStream, cancel: &CancellationToken) -> SessionEnd {
        let (read_half, write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        let end = loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break SessionEnd::Cancelled,
                next = timeout(self.settings.read_timeout, lines.next_line()) => next,
            };
            let line = match next {
                Err(_) => {
                    break SessionEnd::Dropped(anyhow!(
                        "no data for {}s",
                        self.settings.read_timeout.as_secs_f64()
                    ))
                }
                Ok(Err(err)) => break SessionEnd::Dropped(anyhow!(err).context("stream read failed")),
                Ok(Ok(None)) => break SessionEnd::Dropped(anyhow!("connection closed by peer")),
                Ok(Ok(Some(line))) => line,
            };
            if line.trim().is_empty() {
                continue;
            }
            tracing::debug!(line = %line, "received");
            if let Err(err) = self.handle_line(&line).await {
                break SessionEnd::Dropped(err);
            }
        };

        close(write_half, self.settings.close_timeout).await;
        end
    }

    async fn handle_line(&self, line: &str) -> Result<()> {
        let message = decode_line(line.as_bytes(), Utc::now())?;
        self.ingestor
            .ingest(&message)
            .await
            .with_context(|| format!("failed to ingest reading from {}", message.sensor_id))?;
        Ok(())
    }
}

async fn close(mut writer: OwnedWriteHalf, wait: Duration) {
    match timeout(wait, writer.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::debug!(error = %err, "ignored error while closing stream"),
        Err(_) => tracing::debug!("timed out closing stream"),
    }
}
