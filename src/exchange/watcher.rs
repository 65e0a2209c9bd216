use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::stream::StreamExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, IntervalStream};

use super::ExchangeStore;

/// A task which periodically runs change detection over the exchange store.
pub struct ExchangeWatcher {
    exchange: Arc<dyn ExchangeStore>,
    /// The change-detection interval.
    interval: Duration,
    /// A channel used for triggering graceful shutdown.
    shutdown: BroadcastStream<()>,
}

impl ExchangeWatcher {
    /// Create a new instance.
    pub fn new(exchange: Arc<dyn ExchangeStore>, interval: Duration, shutdown: broadcast::Receiver<()>) -> Self {
        Self {
            exchange,
            interval,
            shutdown: BroadcastStream::new(shutdown),
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut ticks = IntervalStream::new(tokio::time::interval(self.interval));

        tracing::info!("exchange watcher initialized");
        loop {
            tokio::select! {
                Some(_) = ticks.next() => {
                    if let Err(err) = self.exchange.sync().await {
                        tracing::error!(error = ?err, "error during exchange change detection");
                    }
                }
                _ = self.shutdown.next() => break,
            }
        }

        tracing::debug!("exchange watcher shutdown");
        Ok(())
    }
}
