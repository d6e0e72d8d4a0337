//! Stand-in for the external payment gateway. Charges decline with a
//! configurable probability; refunds always succeed.

use std::time::Duration;

use chrono::Utc;
use shared::error::{ErrorCode, SagaError};
use tracing::info;

const NETWORK_LATENCY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct GatewayCharge {
    pub tx_id: String,
}

#[derive(Debug, Clone)]
pub struct PaymentGateway {
    decline_rate: f64,
}

impl PaymentGateway {
    pub fn new(decline_rate: f64) -> Self {
        Self {
            decline_rate: decline_rate.clamp(0.0, 1.0),
        }
    }

    pub async fn charge(&self, order_id: i64, amount: i64) -> Result<GatewayCharge, SagaError> {
        tokio::time::sleep(NETWORK_LATENCY).await;

        if rand::random::<f64>() < self.decline_rate {
            return Err(SagaError::new(
                ErrorCode::PaymentDeclined,
                "payment declined by gateway",
            ));
        }

        let tx_id = format!("PG-TXN-{order_id}-{}", Utc::now().timestamp());
        info!(order_id, amount, tx_id = %tx_id, "charge authorized");
        Ok(GatewayCharge { tx_id })
    }

    pub async fn refund(&self, tx_id: &str) -> Result<(), SagaError> {
        tokio::time::sleep(NETWORK_LATENCY).await;
        info!(tx_id, "refund processed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn zero_rate_always_authorizes() {
        let gateway = PaymentGateway::new(0.0);
        for _ in 0..20 {
            let charge = gateway.charge(1, 50_000).await.unwrap();
            assert!(charge.tx_id.starts_with("PG-TXN-1-"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn full_rate_always_declines() {
        let gateway = PaymentGateway::new(1.0);
        for _ in 0..20 {
            let err = gateway.charge(1, 50_000).await.unwrap_err();
            assert_eq!(err.code, ErrorCode::PaymentDeclined);
            assert!(err.is_business());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn refund_never_fails() {
        let gateway = PaymentGateway::new(1.0);
        gateway.refund("PG-TXN-1-0").await.unwrap();
    }
}
