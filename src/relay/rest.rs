//! REST surface for one exchange account: order placement/cancellation,
//! position snapshots, and realized-PnL lookups. Mirrors the semantic
//! surface in §6 — field names follow the exchange's own wire contract, not
//! an SDK's renamed types, the same way the teacher's `gamma_http.rs` talked
//! to Gamma directly over `reqwest` instead of through a generated client.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use tracing::{debug, warn};

use super::types::{ExchangeOrderSide, OpenType, TriggerType};

type HmacSha256 = Hmac<Sha256>;

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Renders a timestamp for a log line, the way the original client's
/// `milliseconds_to_datetime` does: negative/unparseable input is `"N/A"`,
/// and a value under the same `1e10` second-vs-millisecond heuristic used
/// elsewhere in this relay is treated as seconds rather than milliseconds.
pub fn ms_to_datetime(ms: i64) -> String {
    if ms < 0 {
        return "N/A".to_string();
    }
    let millis = if ms > 10_000_000_000 { ms } else { ms * 1000 };
    match chrono::DateTime::from_timestamp_millis(millis) {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => "N/A".to_string(),
    }
}

/// One account's credentials + REST session. `proxy` is forwarded to the
/// underlying `reqwest::Client` builder so every follower can route through
/// its own upstream proxy.
#[derive(Clone)]
pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    api_secret: String,
}

impl RestClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, api_secret: impl Into<String>, proxy: Option<&str>) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(std::time::Duration::from_secs(10));
        if let Some(p) = proxy {
            builder = builder.proxy(reqwest::Proxy::all(p).context("invalid proxy url")?);
        }
        Ok(Self {
            http: builder.build().context("failed to build reqwest client")?,
            base_url: base_url.into(),
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        })
    }

    fn signature(&self, ts_ms: i64, param_string: &str) -> String {
        let payload = format!("{}{}{}", self.api_key, ts_ms, param_string);
        let mut mac =
            HmacSha256::new_from_slice(self.api_secret.as_bytes()).expect("hmac accepts any key length");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    async fn signed_request<T: serde::de::DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        param_string: &str,
        body: Option<&Value>,
    ) -> Result<T> {
        let ts = now_ms();
        let sig = self.signature(ts, param_string);
        let url = format!("{}{}", self.base_url, path);

        let mut req = self
            .http
            .request(method, &url)
            .header("ApiKey", &self.api_key)
            .header("Request-Time", ts.to_string())
            .header("Signature", sig);

        if let Some(b) = body {
            req = req.json(b);
        }

        let resp = req.send().await.with_context(|| format!("request failed: {path}"))?;
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            bail!("{path} returned {status}: {text}");
        }

        serde_json::from_str(&text).with_context(|| format!("failed to parse response from {path}: {text}"))
    }

    // ------------------------------------------------------------------
    // Orders
    // ------------------------------------------------------------------

    pub async fn create_order(&self, params: CreateOrderParams<'_>) -> Result<String> {
        let body = serde_json::json!({
            "symbol": params.symbol,
            "vol": params.vol,
            "side": params.side as i64,
            "openType": params.open_type as i64,
            "type": if params.price.is_some() { 1 } else { 5 },
            "leverage": params.leverage,
            "price": params.price,
            "stopLossPrice": params.sl_price,
            "takeProfitPrice": params.tp_price,
        });

        let resp: OrderResponse = self
            .signed_request(reqwest::Method::POST, "/private/order/submit", "", Some(&body))
            .await?;

        if !resp.success {
            bail!("create_order rejected: {:?}", resp.error_msg);
        }
        resp.order_id.context("create_order response missing orderId")
    }

    pub async fn create_trigger_order(&self, params: CreateTriggerOrderParams<'_>) -> Result<String> {
        let trigger_type = match TriggerType::for_order_side(params.side) {
            TriggerType::LessThanOrEqual => 1,
            TriggerType::GreaterThanOrEqual => 2,
        };
        let execute_type = if params.trigger_exec == Some(1) { 1 } else { 5 };

        let body = serde_json::json!({
            "symbol": params.symbol,
            "vol": params.vol,
            "side": params.side as i64,
            "openType": params.open_type as i64,
            "leverage": params.leverage,
            "triggerPrice": params.trigger_price,
            "triggerType": trigger_type,
            "executeType": execute_type,
            "trend": "LatestPrice",
            "executeCycle": "UntilCanceled",
        });

        let resp: OrderResponse = self
            .signed_request(reqwest::Method::POST, "/private/planorder/place", "", Some(&body))
            .await?;

        if !resp.success {
            bail!("create_trigger_order rejected: {:?}", resp.error_msg);
        }
        resp.order_id.context("create_trigger_order response missing orderId")
    }

    pub async fn cancel_orders(&self, order_ids: &[String]) -> Result<()> {
        if order_ids.is_empty() {
            return Ok(());
        }
        let body = serde_json::json!(order_ids);
        let _: Value = self
            .signed_request(reqwest::Method::POST, "/private/order/cancel", "", Some(&body))
            .await?;
        Ok(())
    }

    pub async fn cancel_trigger_orders(&self, items: &[(String, String)]) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let body: Vec<Value> = items
            .iter()
            .map(|(order_id, symbol)| serde_json::json!({"orderId": order_id, "symbol": symbol}))
            .collect();
        let _: Value = self
            .signed_request(reqwest::Method::POST, "/private/planorder/cancel", "", Some(&serde_json::json!(body)))
            .await?;
        Ok(())
    }

    pub async fn cancel_all_orders(&self, symbol: &str) -> Result<()> {
        let body = serde_json::json!({"symbol": symbol});
        let _: Value = self
            .signed_request(reqwest::Method::POST, "/private/order/cancel_all", "", Some(&body))
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Positions / PnL
    // ------------------------------------------------------------------

    pub async fn get_open_positions(&self, symbol: Option<&str>) -> Result<Vec<RawPosition>> {
        let path = match symbol {
            Some(s) => format!("/private/position/open_positions?symbol={s}"),
            None => "/private/position/open_positions".to_string(),
        };
        let resp: ApiEnvelope<Vec<RawPosition>> = self
            .signed_request(reqwest::Method::GET, &path, "", None)
            .await?;
        Ok(resp.data.unwrap_or_default())
    }

    pub async fn get_realized_pnl(
        &self,
        symbol: &str,
        start_time: i64,
        end_time: i64,
        direction: i64,
    ) -> Result<Option<PnlResult>> {
        // One reconnect retry, per the refresh/report timeout budget.
        match self.get_realized_pnl_once(symbol, start_time, end_time, direction).await {
            Ok(v) => Ok(v),
            Err(e) => {
                warn!("get_realized_pnl failed, retrying once: {:?}", e);
                self.get_realized_pnl_once(symbol, start_time, end_time, direction).await
            }
        }
    }

    async fn get_realized_pnl_once(
        &self,
        symbol: &str,
        start_time: i64,
        end_time: i64,
        direction: i64,
    ) -> Result<Option<PnlResult>> {
        let path = format!(
            "/private/order/realized_pnl?symbol={symbol}&start_time={start_time}&end_time={end_time}&direction={direction}"
        );
        let resp: ApiEnvelope<PnlResult> = self
            .signed_request(reqwest::Method::GET, &path, "", None)
            .await?;
        Ok(resp.data)
    }

    pub async fn get_realized_pnl_batch(
        &self,
        start_time: i64,
        end_time: i64,
    ) -> Result<HashMap<(String, i64), PnlResult>> {
        let path = format!("/private/order/realized_pnl_batch?start_time={start_time}&end_time={end_time}");
        let resp: ApiEnvelope<Vec<PnlBatchEntry>> = self
            .signed_request(reqwest::Method::GET, &path, "", None)
            .await?;
        let mut map = HashMap::new();
        for entry in resp.data.unwrap_or_default() {
            map.insert((entry.symbol, entry.direction), PnlResult { pnl_usdt: entry.pnl_usdt });
        }
        debug!("realized_pnl_batch returned {} entries", map.len());
        Ok(map)
    }

    /// Lightweight health probe used by `NetworkSession`'s ping loop.
    pub async fn ping(&self) -> Result<()> {
        let resp = self.http.get(format!("{}/api/v1/contract/ping", self.base_url)).send().await?;
        if !resp.status().is_success() {
            bail!("ping returned {}", resp.status());
        }
        Ok(())
    }

    /// Public, unauthenticated contract listing: every instrument's
    /// precision and sizing constants in one call.
    pub async fn get_contract_detail(&self) -> Result<Vec<ContractDetail>> {
        let resp = self.http.get(format!("{}/api/v1/contract/detail", self.base_url)).send().await?;
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            bail!("contract/detail returned {status}: {text}");
        }
        let envelope: ContractDetailEnvelope =
            serde_json::from_str(&text).with_context(|| format!("failed to parse contract/detail: {text}"))?;
        if !envelope.success {
            bail!("contract/detail returned success=false");
        }
        Ok(envelope.data.unwrap_or_default())
    }
}

pub struct CreateOrderParams<'a> {
    pub symbol: &'a str,
    pub vol: f64,
    pub side: ExchangeOrderSide,
    pub open_type: OpenType,
    pub leverage: i64,
    pub price: Option<&'a str>,
    pub sl_price: Option<&'a str>,
    pub tp_price: Option<&'a str>,
}

pub struct CreateTriggerOrderParams<'a> {
    pub symbol: &'a str,
    pub vol: f64,
    pub side: ExchangeOrderSide,
    pub open_type: OpenType,
    pub leverage: i64,
    pub trigger_price: &'a str,
    pub trigger_exec: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    #[serde(rename = "orderId", alias = "order_id")]
    order_id: Option<String>,
    #[serde(default = "default_true")]
    success: bool,
    #[serde(rename = "message", alias = "error_msg")]
    error_msg: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawPosition {
    pub symbol: String,
    #[serde(rename = "positionType")]
    pub position_type: i64,
    pub state: i64,
    #[serde(rename = "holdVol")]
    pub hold_vol: f64,
    #[serde(rename = "openAvgPrice")]
    pub open_avg_price: f64,
    #[serde(rename = "holdAvgPrice")]
    pub hold_avg_price: f64,
    pub leverage: i64,
    #[serde(rename = "openType")]
    pub open_type: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PnlResult {
    pub pnl_usdt: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ContractDetailEnvelope {
    success: bool,
    data: Option<Vec<ContractDetail>>,
}

/// One entry of `/contract/detail`. Field names follow the exchange's own
/// wire contract; `SymbolSpec::from` picks out only the fields the sizing
/// math needs and applies the same fallbacks as the master's own client.
#[derive(Debug, Clone, Deserialize)]
pub struct ContractDetail {
    pub symbol: String,
    #[serde(rename = "baseCoinName")]
    pub base_coin_name: Option<String>,
    #[serde(rename = "volScale")]
    pub vol_scale: Option<u32>,
    #[serde(rename = "priceScale")]
    pub price_scale: Option<u32>,
    #[serde(rename = "contractSize")]
    pub contract_size: Option<f64>,
    #[serde(rename = "volUnit")]
    pub vol_unit: Option<f64>,
    #[serde(rename = "maxLeverage")]
    pub max_leverage: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
struct PnlBatchEntry {
    symbol: String,
    direction: i64,
    pnl_usdt: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_is_deterministic() {
        let c = RestClient::new("https://example", "key", "secret", None).unwrap();
        let a = c.signature(1_700_000_000_000, "");
        let b = c.signature(1_700_000_000_000, "");
        assert_eq!(a, b);
        assert_ne!(a, c.signature(1_700_000_000_001, ""));
    }

    #[test]
    fn test_ms_to_datetime_formats_and_handles_edge_cases() {
        assert_eq!(ms_to_datetime(1_700_000_000_000), "2023-11-14 22:13:20");
        assert_eq!(ms_to_datetime(-1), "N/A");
        // a value below the 1e10 threshold is treated as seconds, not millis
        assert_eq!(ms_to_datetime(1_700_000_000), "2023-11-14 22:13:20");
    }
}
