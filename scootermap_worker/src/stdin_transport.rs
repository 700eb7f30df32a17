//! Newline-delimited JSON observations on stdin.

use async_trait::async_trait;
use scootermap_env::{Delivery, DeliveryTag, EnvError, MobilityContext, ObservationTransport, TokioContext};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// One delivery per non-empty input line.
///
/// Stdin cannot redeliver, so acknowledgement only advances a counter;
/// a restart after a failed batch replays from whatever feeds the pipe.
pub struct StdinTransport {
    lines: Mutex<Lines<BufReader<Stdin>>>,
    context: Arc<TokioContext>,
    next_tag: AtomicU64,
    acked: AtomicU64,
}

impl StdinTransport {
    pub fn new(context: Arc<TokioContext>) -> Self {
        Self {
            lines: Mutex::new(BufReader::new(tokio::io::stdin()).lines()),
            context,
            next_tag: AtomicU64::new(0),
            acked: AtomicU64::new(0),
        }
    }

    pub fn acked(&self) -> u64 {
        self.acked.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ObservationTransport for StdinTransport {
    async fn recv(&self) -> Option<Delivery> {
        let mut lines = self.lines.lock().await;
        loop {
            // next_line is cancel safe: a partial line stays buffered
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => {
                    let tag = DeliveryTag(self.next_tag.fetch_add(1, Ordering::Relaxed));
                    return Some(Delivery::new(tag, line.into_bytes(), self.context.unix_millis()));
                }
                Ok(None) => {
                    debug!("stdin closed");
                    return None;
                }
                Err(e) => {
                    warn!(error = %e, "stdin read failed, closing transport");
                    return None;
                }
            }
        }
    }

    async fn ack(&self, tags: &[DeliveryTag]) -> Result<(), EnvError> {
        self.acked.fetch_add(tags.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn name(&self) -> &str {
        "stdin"
    }
}
