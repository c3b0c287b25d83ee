//! JetStream-backed dispatcher.
//!
//! Publishes each `ReservationEvent` as JSON and waits for the broker's
//! persistence ack. On transport failure the event is parked in a bounded
//! `ArrayQueue`; a background flusher retries the parked events with
//! exponential backoff until the broker comes back.

use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream;
use async_trait::async_trait;
use crossbeam_queue::ArrayQueue;
use tokio::sync::watch;

use super::{DispatchError, EventDispatcher};
use crate::model::ReservationEvent;

/// JetStream stream holding reservation events until the order pipeline
/// consumes them.
const STREAM_NAME: &str = "SECKILL_RESERVATIONS";

const FLUSH_INTERVAL: Duration = Duration::from_millis(500);
const FLUSH_BACKOFF_MAX: Duration = Duration::from_secs(30);

pub struct NatsDispatcher {
    context: jetstream::Context,
    subject: String,
    buffer: ArrayQueue<ReservationEvent>,
}

impl NatsDispatcher {
    /// Connect to the broker and make sure the reservation stream exists so
    /// publishes are actually persisted.
    pub async fn connect(
        url: &str,
        subject: &str,
        buffer_capacity: usize,
    ) -> Result<Self, DispatchError> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| DispatchError::BrokerUnavailable(e.to_string()))?;
        let context = jetstream::new(client);
        context
            .get_or_create_stream(jetstream::stream::Config {
                name: STREAM_NAME.to_string(),
                subjects: vec![subject.to_string()],
                ..Default::default()
            })
            .await
            .map_err(|e| DispatchError::BrokerUnavailable(e.to_string()))?;

        Ok(Self {
            context,
            subject: subject.to_string(),
            buffer: ArrayQueue::new(buffer_capacity.max(1)),
        })
    }

    async fn publish_acked(&self, event: &ReservationEvent) -> Result<(), DispatchError> {
        let payload =
            serde_json::to_vec(event).map_err(|e| DispatchError::Rejected(e.to_string()))?;
        let ack = self
            .context
            .publish(self.subject.clone(), payload.into())
            .await
            .map_err(|e| DispatchError::BrokerUnavailable(e.to_string()))?;
        ack.await
            .map_err(|e| DispatchError::BrokerUnavailable(e.to_string()))?;
        Ok(())
    }

    /// Number of events currently parked for retry.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Retry every parked event once. Events that still fail go back into
    /// the buffer; returns how many were flushed.
    pub async fn flush_once(&self) -> usize {
        let mut flushed = 0;
        let pending = self.buffer.len();
        for _ in 0..pending {
            let Some(event) = self.buffer.pop() else { break };
            match self.publish_acked(&event).await {
                Ok(()) => flushed += 1,
                Err(err) => {
                    tracing::warn!(
                        target: "DISPATCH",
                        order_id = %event.order_id,
                        "flush retry failed: {err}"
                    );
                    if self.buffer.push(event.clone()).is_err() {
                        // Buffer refilled underneath us; surface the loss so
                        // the reconciler can repair the counters.
                        tracing::error!(
                            target: "RECONCILER",
                            activity_id = %event.activity_id,
                            user_id = %event.user_id,
                            order_id = %event.order_id,
                            quantity = event.quantity,
                            "reservation event dropped from retry buffer"
                        );
                    }
                    break;
                }
            }
        }
        flushed
    }

    /// Background flusher; runs until `shutdown` flips to true, then makes a
    /// final drain attempt.
    pub async fn run_flusher(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = FLUSH_INTERVAL;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
            if self.buffer.is_empty() {
                backoff = FLUSH_INTERVAL;
                continue;
            }
            let before = self.buffer.len();
            let flushed = self.flush_once().await;
            if flushed > 0 {
                tracing::info!(target: "DISPATCH", flushed, remaining = self.buffer.len(), "retry buffer drained");
            }
            backoff = if flushed == 0 && before > 0 {
                (backoff * 2).min(FLUSH_BACKOFF_MAX)
            } else {
                FLUSH_INTERVAL
            };
        }
        let remaining = self.flush_once().await;
        tracing::info!(target: "DISPATCH", flushed = remaining, parked = self.buffer.len(), "flusher stopped");
    }
}

#[async_trait]
impl EventDispatcher for NatsDispatcher {
    async fn publish(&self, event: &ReservationEvent) -> Result<(), DispatchError> {
        match self.publish_acked(event).await {
            Ok(()) => Ok(()),
            Err(DispatchError::Rejected(msg)) => Err(DispatchError::Rejected(msg)),
            Err(DispatchError::BrokerUnavailable(msg)) => {
                // Park for the flusher; only a full buffer makes the publish
                // fail outright (and the caller roll the reservation back).
                match self.buffer.push(event.clone()) {
                    Ok(()) => {
                        tracing::warn!(
                            target: "DISPATCH",
                            order_id = %event.order_id,
                            buffered = self.buffer.len(),
                            "broker unreachable, event parked for retry: {msg}"
                        );
                        Ok(())
                    }
                    Err(_) => Err(DispatchError::BrokerUnavailable(format!(
                        "retry buffer full: {msg}"
                    ))),
                }
            }
        }
    }
}
