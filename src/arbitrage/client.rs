//! Binary-market order client (consumed contract).
//!
//! Thin REST surface for placing outcome-token orders. In dry-run mode
//! (the default) orders fill immediately at their limit price, so the whole
//! engine can run end to end without credentials.

use rust_decimal::Decimal;
use tracing::{error, info};

use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct BinaryOrderAck {
    pub order_id: String,
    pub filled: bool,
    pub fill_price: Decimal,
    pub fill_qty: Decimal,
}

#[derive(Clone)]
pub struct BinaryClient {
    http: reqwest::Client,
    base_url: String,
    dry_run: bool,
}

impl BinaryClient {
    pub fn new(base_url: &str, dry_run: bool) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("reqwest client");
        Self { http, base_url: base_url.trim_end_matches('/').to_string(), dry_run }
    }

    /// Place one outcome-token order. Dry-run simulates an immediate full
    /// fill at the limit price.
    pub async fn place_order(
        &self,
        token_id: &str,
        side: OrderSide,
        price: Decimal,
        qty: Decimal,
    ) -> Result<BinaryOrderAck> {
        if self.dry_run {
            info!(
                target: "arb",
                token = %&token_id[..12.min(token_id.len())],
                side = side.as_str(),
                %price,
                %qty,
                "dry-run fill"
            );
            return Ok(BinaryOrderAck {
                order_id: format!("dry-{token_id}"),
                filled: true,
                fill_price: price,
                fill_qty: qty,
            });
        }

        let body = serde_json::json!({
            "token_id": token_id,
            "side": side.as_str(),
            "price": price,
            "size": qty,
            "type": "FOK",
        });
        let resp = self
            .http
            .post(format!("{}/order", self.base_url))
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            error!(target: "arb", status = status.as_u16(), %body, "order rejected");
            return Err(Error::Broker { status: status.as_u16(), body });
        }

        let ack: serde_json::Value = resp.json().await?;
        let order_id = ack
            .get("orderID")
            .or_else(|| ack.get("id"))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let filled = ack
            .get("status")
            .and_then(|v| v.as_str())
            .map(|s| s == "matched" || s == "filled")
            .unwrap_or(false);

        Ok(BinaryOrderAck { order_id, filled, fill_price: price, fill_qty: qty })
    }

    /// Unwind a filled leg at the best available price. Used when only one
    /// side of a paired execution fills: holding a single leg is directional
    /// exposure, not arbitrage.
    pub async fn close_leg(&self, token_id: &str, qty: Decimal, best_bid: Decimal) -> Result<BinaryOrderAck> {
        self.place_order(token_id, OrderSide::Sell, best_bid, qty).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    /// Scenario: dry-run order placement.
    /// Expected: immediate full fill at the limit price with a synthetic id.
    #[tokio::test]
    async fn test_dry_run_fills_immediately() {
        let client = BinaryClient::new("https://example.invalid", true);
        let ack = client
            .place_order("tok-yes", OrderSide::Buy, dec!(0.49), dec!(100))
            .await
            .unwrap();
        assert!(ack.filled);
        assert_eq!(ack.fill_price, dec!(0.49));
        assert_eq!(ack.fill_qty, dec!(100));
        assert!(ack.order_id.starts_with("dry-"));
    }

    /// Scenario: dry-run leg close.
    /// Expected: a sell fill at the provided bid.
    #[tokio::test]
    async fn test_dry_run_close_leg() {
        let client = BinaryClient::new("https://example.invalid", true);
        let ack = client.close_leg("tok-yes", dec!(50), dec!(0.47)).await.unwrap();
        assert!(ack.filled);
        assert_eq!(ack.fill_price, dec!(0.47));
    }
}
