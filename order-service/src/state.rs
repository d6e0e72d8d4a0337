//! The SAGA state machine. The order's status is the externally observable
//! progress of the whole transaction; events advance it, and any event that
//! does not match the current status is absorbed as a no-op.

use serde::{Deserialize, Serialize};
use shared::events::EventType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    StockReserving,
    DeliveryPreparing,
    Completed,
    Canceled,
    Failed,
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::StockReserving => "STOCK_RESERVING",
            OrderStatus::DeliveryPreparing => "DELIVERY_PREPARING",
            OrderStatus::Completed => "COMPLETED",
            OrderStatus::Canceled => "CANCELED",
            OrderStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<OrderStatus> {
        match s {
            "PENDING" => Some(OrderStatus::Pending),
            "STOCK_RESERVING" => Some(OrderStatus::StockReserving),
            "DELIVERY_PREPARING" => Some(OrderStatus::DeliveryPreparing),
            "COMPLETED" => Some(OrderStatus::Completed),
            "CANCELED" => Some(OrderStatus::Canceled),
            "FAILED" => Some(OrderStatus::Failed),
            _ => None,
        }
    }

    /// Terminal states absorb every further event.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Completed | OrderStatus::Canceled | OrderStatus::Failed
        )
    }

    /// The transition table. Returns the next status when `event` fires in
    /// this status, or `None` for a no-op.
    pub fn transition_on(self, event: EventType) -> Option<OrderStatus> {
        match (self, event) {
            (OrderStatus::Pending, EventType::PaymentCompleted) => {
                Some(OrderStatus::StockReserving)
            }
            (OrderStatus::Pending, EventType::PaymentFailed) => Some(OrderStatus::Canceled),
            (OrderStatus::StockReserving, EventType::StockReserved) => {
                Some(OrderStatus::DeliveryPreparing)
            }
            (OrderStatus::StockReserving, EventType::StockReservationFailed) => {
                Some(OrderStatus::Failed)
            }
            (OrderStatus::DeliveryPreparing, EventType::DeliveryStarted) => {
                Some(OrderStatus::Completed)
            }
            (OrderStatus::DeliveryPreparing, EventType::DeliveryFailed) => {
                Some(OrderStatus::Failed)
            }
            _ => None,
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [OrderStatus; 6] = [
        OrderStatus::Pending,
        OrderStatus::StockReserving,
        OrderStatus::DeliveryPreparing,
        OrderStatus::Completed,
        OrderStatus::Canceled,
        OrderStatus::Failed,
    ];

    #[test]
    fn happy_path_trajectory() {
        let mut status = OrderStatus::Pending;
        for event in [
            EventType::PaymentCompleted,
            EventType::StockReserved,
            EventType::DeliveryStarted,
        ] {
            status = status.transition_on(event).unwrap();
        }
        assert_eq!(status, OrderStatus::Completed);
    }

    #[test]
    fn payment_failure_cancels_without_compensation() {
        assert_eq!(
            OrderStatus::Pending.transition_on(EventType::PaymentFailed),
            Some(OrderStatus::Canceled)
        );
    }

    #[test]
    fn compensated_flows_end_failed() {
        assert_eq!(
            OrderStatus::StockReserving.transition_on(EventType::StockReservationFailed),
            Some(OrderStatus::Failed)
        );
        assert_eq!(
            OrderStatus::DeliveryPreparing.transition_on(EventType::DeliveryFailed),
            Some(OrderStatus::Failed)
        );
    }

    #[test]
    fn only_the_six_table_entries_transition() {
        let mut fired = 0;
        for status in ALL {
            for event in EventType::ALL {
                if status.transition_on(event).is_some() {
                    fired += 1;
                }
            }
        }
        assert_eq!(fired, 6);
    }

    #[test]
    fn terminal_states_absorb_everything() {
        for status in [
            OrderStatus::Completed,
            OrderStatus::Canceled,
            OrderStatus::Failed,
        ] {
            assert!(status.is_terminal());
            for event in EventType::ALL {
                assert_eq!(status.transition_on(event), None);
            }
        }
    }

    #[test]
    fn out_of_sequence_events_are_no_ops() {
        // A replayed StockReserved after the order moved on.
        assert_eq!(
            OrderStatus::DeliveryPreparing.transition_on(EventType::StockReserved),
            None
        );
        // A delivery event before stock was reserved.
        assert_eq!(
            OrderStatus::Pending.transition_on(EventType::DeliveryStarted),
            None
        );
    }

    #[test]
    fn status_strings_round_trip() {
        for status in ALL {
            assert_eq!(OrderStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(OrderStatus::parse("UNKNOWN"), None);
    }

    #[test]
    fn serializes_as_the_stored_string() {
        for status in ALL {
            let json = serde_json::to_value(status).unwrap();
            assert_eq!(json, status.as_str());
        }
    }
}
