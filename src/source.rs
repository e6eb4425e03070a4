//! Signal sources
//!
//! - `ChannelSource`: in-process mpsc queue (tests, embedding)
//! - `StdinSource`: one signal per stdin line; a bare `s` skips the current wait
//! - `RelaySource`: WebSocket relay forwarding channel messages

use async_trait::async_trait;
use futures_util::StreamExt;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::cancel::CancelToken;
use crate::models::RawSignal;
use crate::signal::parse_signal;

const QUEUE_CAPACITY: usize = 64;

/// Delivers signals one at a time to a single consumer
#[async_trait]
pub trait SignalSource: Send {
    /// Next signal, or None once the source is closed
    async fn next_signal(&mut self) -> Option<RawSignal>;

    /// Drop everything that queued up while the pipeline was busy
    fn discard_pending(&mut self) -> usize;
}

pub struct ChannelSource {
    rx: mpsc::Receiver<RawSignal>,
}

impl ChannelSource {
    pub fn new(capacity: usize) -> (mpsc::Sender<RawSignal>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self { rx })
    }
}

#[async_trait]
impl SignalSource for ChannelSource {
    async fn next_signal(&mut self) -> Option<RawSignal> {
        self.rx.recv().await
    }

    fn discard_pending(&mut self) -> usize {
        let mut dropped = 0;
        while let Ok(raw) = self.rx.try_recv() {
            debug!("Discarding {}", raw.describe());
            dropped += 1;
        }
        dropped
    }
}

/// Read operator input. A line that is just `s` cancels `skip`; any other
/// line that parses as a signal is forwarded to `signals` when given.
pub fn spawn_operator_input(skip: CancelToken, signals: Option<mpsc::Sender<RawSignal>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    error!("stdin read failed: {}", e);
                    break;
                }
            };

            let trimmed = line.trim();
            if trimmed.eq_ignore_ascii_case("s") {
                skip.cancel();
                continue;
            }
            if let Some(tx) = &signals {
                match parse_signal(trimmed) {
                    Some(raw) => {
                        if tx.send(raw).await.is_err() {
                            break;
                        }
                    }
                    None if !trimmed.is_empty() => debug!("Ignoring non-signal input: {}", trimmed),
                    None => {}
                }
            }
        }
        debug!("Operator input closed");
    })
}

pub struct StdinSource {
    inner: ChannelSource,
    _reader: JoinHandle<()>,
}

impl StdinSource {
    pub fn new(skip: CancelToken) -> Self {
        let (tx, inner) = ChannelSource::new(QUEUE_CAPACITY);
        let reader = spawn_operator_input(skip, Some(tx));
        Self { inner, _reader: reader }
    }
}

#[async_trait]
impl SignalSource for StdinSource {
    async fn next_signal(&mut self) -> Option<RawSignal> {
        self.inner.next_signal().await
    }

    fn discard_pending(&mut self) -> usize {
        self.inner.discard_pending()
    }
}

pub struct RelaySource {
    inner: ChannelSource,
    task: JoinHandle<()>,
}

impl RelaySource {
    pub const MAX_RECONNECTS: u32 = 5;

    pub fn connect(url: &str) -> Self {
        let (tx, inner) = ChannelSource::new(QUEUE_CAPACITY);
        let task = tokio::spawn(relay_task(url.to_string(), tx));
        Self { inner, task }
    }
}

impl Drop for RelaySource {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[async_trait]
impl SignalSource for RelaySource {
    async fn next_signal(&mut self) -> Option<RawSignal> {
        self.inner.next_signal().await
    }

    fn discard_pending(&mut self) -> usize {
        self.inner.discard_pending()
    }
}

/// Forward relay frames until the consumer goes away or reconnects run out.
/// The failure counter resets after every successful connection.
async fn relay_task(url: String, tx: mpsc::Sender<RawSignal>) {
    let mut failures = 0u32;

    while failures < RelaySource::MAX_RECONNECTS {
        info!("Connecting to signal relay {}...", url);

        match connect_async(url.as_str()).await {
            Ok((ws_stream, _)) => {
                info!("Connected to signal relay");
                failures = 0;
                let (_write, mut read) = ws_stream.split();

                while let Some(frame) = read.next().await {
                    match frame {
                        Ok(Message::Text(text)) => match parse_signal(&text) {
                            Some(raw) => {
                                if tx.send(raw).await.is_err() {
                                    return;
                                }
                            }
                            None => debug!("Relay message is not a signal"),
                        },
                        Ok(Message::Close(_)) => {
                            warn!("Signal relay closed the connection");
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            error!("Signal relay error: {}", e);
                            break;
                        }
                    }
                }
            }
            Err(e) => error!("Failed to connect to signal relay: {}", e),
        }

        failures += 1;
        if failures < RelaySource::MAX_RECONNECTS {
            let backoff = Duration::from_secs(2u64.pow(failures.min(5)));
            info!("Reconnecting to relay in {:?} ({}/{})", backoff, failures, RelaySource::MAX_RECONNECTS);
            tokio::time::sleep(backoff).await;
        }
    }

    error!("Signal relay unavailable after {} attempts", RelaySource::MAX_RECONNECTS);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_source_in_order() {
        let (tx, mut source) = ChannelSource::new(8);
        tx.send(RawSignal::new("EURUSD", "M1", "10:00:00", "call")).await.unwrap();
        tx.send(RawSignal::new("GBPJPY", "M5", "10:05:00", "put")).await.unwrap();

        assert_eq!(source.next_signal().await.unwrap().symbol.as_deref(), Some("EURUSD"));
        assert_eq!(source.next_signal().await.unwrap().symbol.as_deref(), Some("GBPJPY"));

        drop(tx);
        assert!(source.next_signal().await.is_none());
    }

    #[tokio::test]
    async fn test_discard_pending() {
        let (tx, mut source) = ChannelSource::new(8);
        for _ in 0..3 {
            tx.send(RawSignal::default()).await.unwrap();
        }
        assert_eq!(source.discard_pending(), 3);
        assert_eq!(source.discard_pending(), 0);
    }
}
