//! Broker REST client (consumed contract).
//!
//! Paper-trading account endpoints: account state, positions, bracket
//! orders, cancellation, and order listing. Rejections (4xx) are surfaced
//! as `Error::Broker` with the response body and are never retried here.

use std::time::Duration;

use serde_json::json;
use tracing::{error, info};

use crate::config::BrokerConfig;
use crate::error::{Error, Result};
use crate::types::{Account, BrokerOrder, BrokerPosition, Side};

/// Prices on the wire carry two decimals.
pub fn round2(price: f64) -> f64 {
    (price * 100.0).round() / 100.0
}

#[derive(Clone)]
pub struct BrokerClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    secret_key: String,
}

impl BrokerClient {
    pub fn new(cfg: &BrokerConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url: cfg.api_url.trim_end_matches('/').to_string(),
            api_key: cfg.api_key.clone(),
            secret_key: cfg.secret_key.clone(),
        }
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.http
            .get(format!("{}{}", self.base_url, path))
            .header("APCA-API-KEY-ID", &self.api_key)
            .header("APCA-API-SECRET-KEY", &self.secret_key)
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.http
            .post(format!("{}{}", self.base_url, path))
            .header("APCA-API-KEY-ID", &self.api_key)
            .header("APCA-API-SECRET-KEY", &self.secret_key)
    }

    fn delete(&self, path: &str) -> reqwest::RequestBuilder {
        self.http
            .delete(format!("{}{}", self.base_url, path))
            .header("APCA-API-KEY-ID", &self.api_key)
            .header("APCA-API-SECRET-KEY", &self.secret_key)
    }

    pub async fn get_account(&self) -> Result<Account> {
        let resp = self.get("/v2/account").send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Broker {
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }
        Ok(resp.json().await?)
    }

    pub async fn get_positions(&self) -> Result<Vec<BrokerPosition>> {
        let resp = self.get("/v2/positions").send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Broker {
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }
        Ok(resp.json().await?)
    }

    /// 404 means no position for the symbol.
    pub async fn get_position(&self, symbol: &str) -> Result<Option<BrokerPosition>> {
        let resp = self.get(&format!("/v2/positions/{symbol}")).send().await?;
        let status = resp.status();
        if status.as_u16() == 404 {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(Error::Broker {
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }
        Ok(Some(resp.json().await?))
    }

    /// Market entry with a linked limit take-profit and stop-loss.
    pub async fn place_bracket_order(
        &self,
        symbol: &str,
        qty: i64,
        side: Side,
        take_profit_price: f64,
        stop_loss_price: f64,
    ) -> Result<BrokerOrder> {
        let body = json!({
            "symbol": symbol,
            "qty": qty,
            "side": side.as_str(),
            "type": "market",
            "time_in_force": "day",
            "order_class": "bracket",
            "take_profit": { "limit_price": round2(take_profit_price) },
            "stop_loss": { "stop_price": round2(stop_loss_price) },
        });

        let resp = self.post("/v2/orders").json(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            error!(target: "trade", %symbol, status = status.as_u16(), %body, "bracket order rejected");
            return Err(Error::Broker { status: status.as_u16(), body });
        }

        let order: BrokerOrder = resp.json().await?;
        info!(
            target: "trade",
            %symbol,
            side = %side,
            qty,
            order_id = %order.id,
            "bracket order placed"
        );
        Ok(order)
    }

    pub async fn cancel_order(&self, order_id: &str) -> bool {
        match self.delete(&format!("/v2/orders/{order_id}")).send().await {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                error!(target: "trade", %order_id, status = resp.status().as_u16(), "cancel failed");
                false
            }
            Err(e) => {
                error!(target: "trade", %order_id, error = %e, "cancel request failed");
                false
            }
        }
    }

    pub async fn get_orders(&self, status_filter: &str) -> Result<Vec<BrokerOrder>> {
        let resp = self
            .get(&format!("/v2/orders?status={status_filter}&limit=500"))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Broker {
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }
        Ok(resp.json().await?)
    }

    pub async fn close_position(&self, symbol: &str) -> bool {
        match self.delete(&format!("/v2/positions/{symbol}")).send().await {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                error!(target: "trade", %symbol, status = resp.status().as_u16(), "close failed");
                false
            }
            Err(e) => {
                error!(target: "trade", %symbol, error = %e, "close request failed");
                false
            }
        }
    }
}
