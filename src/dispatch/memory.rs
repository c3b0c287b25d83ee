//! In-process dispatcher double for the test suite.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use super::{DispatchError, EventDispatcher};
use crate::model::ReservationEvent;

#[derive(Default)]
pub struct MemoryDispatcher {
    events: Mutex<Vec<ReservationEvent>>,
    failing: AtomicBool,
}

impl MemoryDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every publish fails with `BrokerUnavailable`.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<ReservationEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn event_count(&self) -> usize {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl EventDispatcher for MemoryDispatcher {
    async fn publish(&self, event: &ReservationEvent) -> Result<(), DispatchError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DispatchError::BrokerUnavailable(
                "injected broker failure".to_string(),
            ));
        }
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
        Ok(())
    }
}
