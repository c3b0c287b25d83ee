//! Core domain types: activities, reservation events, boundary outcomes.
//!
//! Activities are owned by the administrative service and cached read-only;
//! the engine never mutates one. Stock and per-user counters live in the hot
//! store as plain integers and are only touched by the reservation scripts
//! during an active window.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Activity lifecycle status, assigned by the administrative service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityStatus {
    Pending,
    Active,
    Ended,
    Cancelled,
}

/// A single flash-sale event with fixed inventory and a time window.
///
/// `total_stock` is immutable after creation; the live counter is the
/// `seckill:stock:<id>` key, not this snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub id: String,
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: ActivityStatus,
    pub total_stock: u32,
    pub seckill_price: Decimal,
    pub original_price: Decimal,
    pub per_user_limit: u32,
}

impl Activity {
    /// True when `now` falls inside the sale window.
    pub fn in_window(&self, now: DateTime<Utc>) -> bool {
        now >= self.start_time && now <= self.end_time
    }
}

/// Durable message published to the broker for each winning reservation.
///
/// The producer owns the event until the broker acknowledges persistence;
/// after that the downstream order pipeline owns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservationEvent {
    pub activity_id: String,
    pub user_id: String,
    pub quantity: u32,
    /// Monotonic per-process sequence number.
    pub sequence: u64,
    /// Server-assigned order id (UUID v4), stable across idempotent replays.
    pub order_id: String,
    pub created_at: DateTime<Utc>,
}

/// Lifecycle of a single reservation as it moves through the engine.
///
/// ```text
/// Admitted → Validated → Reserved → Dispatched → Done
///            │           │          │
///            └─Rejected  └─RolledBack (if dispatch fails)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationState {
    Admitted,
    Validated,
    Reserved,
    Dispatched,
    Done,
    Rejected,
    RolledBack,
}

impl ReservationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReservationState::Done | ReservationState::Rejected | ReservationState::RolledBack
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationState::Admitted => "admitted",
            ReservationState::Validated => "validated",
            ReservationState::Reserved => "reserved",
            ReservationState::Dispatched => "dispatched",
            ReservationState::Done => "done",
            ReservationState::Rejected => "rejected",
            ReservationState::RolledBack => "rolled_back",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal::prelude::FromPrimitive;

    fn sample_activity() -> Activity {
        Activity {
            id: "act_1".to_string(),
            name: "Midnight Drop".to_string(),
            start_time: Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
            end_time: Utc.with_ymd_and_hms(2025, 6, 1, 14, 0, 0).unwrap(),
            status: ActivityStatus::Active,
            total_stock: 300,
            seckill_price: Decimal::from_f64(9.99).unwrap(),
            original_price: Decimal::from_f64(199.00).unwrap(),
            per_user_limit: 2,
        }
    }

    #[test]
    fn test_window_boundaries_inclusive() {
        let act = sample_activity();
        assert!(act.in_window(act.start_time));
        assert!(act.in_window(act.end_time));
        assert!(!act.in_window(act.start_time - chrono::Duration::seconds(1)));
        assert!(!act.in_window(act.end_time + chrono::Duration::seconds(1)));
    }

    #[test]
    fn test_activity_json_round_trip() {
        let act = sample_activity();
        let json = serde_json::to_string(&act).unwrap();
        assert!(json.contains("\"status\":\"active\""));
        let back: Activity = serde_json::from_str(&json).unwrap();
        assert_eq!(act, back);
    }

    #[test]
    fn test_terminal_states() {
        assert!(ReservationState::Done.is_terminal());
        assert!(ReservationState::RolledBack.is_terminal());
        assert!(!ReservationState::Reserved.is_terminal());
    }
}
