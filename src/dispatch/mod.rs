//! Reservation dispatch: durable publish of winning requests to the
//! downstream order pipeline, at-least-once.
//!
//! The engine calls [`EventDispatcher::publish`] after a successful
//! reservation script; a failure here triggers the compensating rollback, so
//! the error split matters: `BrokerUnavailable` is retryable and
//! compensatable, `Rejected` is terminal.

mod memory;
mod nats;

pub use memory::MemoryDispatcher;
pub use nats::NatsDispatcher;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::ReservationEvent;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    /// Broker unreachable and the local retry buffer is full.
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// The broker (or serialization) refused the event; retrying is useless.
    #[error("event rejected: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait EventDispatcher: Send + Sync {
    /// Hand the event to the broker. Returns once the broker acknowledged
    /// persistence, or once the event is safely parked in the bounded local
    /// retry buffer. `BrokerUnavailable` means neither happened and the
    /// caller must compensate the reservation.
    async fn publish(&self, event: &ReservationEvent) -> Result<(), DispatchError>;
}
