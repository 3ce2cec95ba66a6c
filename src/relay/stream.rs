//! MasterStream: the authenticated WebSocket client that classifies the
//! master account's raw order/position/plan pushes into `SignalEvent`s.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use rand::Rng;
use serde_json::Value;
use sha2::Sha256;
use tokio::net::TcpStream;
use tokio_tungstenite::{tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::cache::SignalCache;
use super::messages::{SignalEvent, SignalEventType};
use super::types::{normalize_symbol, PosSide};

type HmacSha256 = Hmac<Sha256>;
type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const LOGIN_TIMEOUT: Duration = Duration::from_secs(10);
const PING_INTERVAL: Duration = Duration::from_secs(12);
const READ_DEADLINE: Duration = Duration::from_secs(1);
const CLOCK_SKEW_MS: i64 = 1000;

#[derive(Debug, Clone)]
pub struct MasterStreamConfig {
    pub ws_url: String,
    pub api_key: String,
    pub api_secret: String,
    pub black_symbols: Vec<String>,
    pub quota_asset: String,
}

impl MasterStreamConfig {
    pub fn from_env() -> Self {
        Self {
            ws_url: std::env::var("MASTER_WS_URL").unwrap_or_else(|_| "wss://contract.mexc.com/edge".to_string()),
            api_key: std::env::var("MASTER_API_KEY").unwrap_or_default(),
            api_secret: std::env::var("MASTER_API_SECRET").unwrap_or_default(),
            black_symbols: std::env::var("BLACK_SYMBOLS")
                .unwrap_or_default()
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            quota_asset: std::env::var("QUOTA_ASSET").unwrap_or_else(|_| "USDT".to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Disconnected,
    Connecting,
    LoggedIn,
    Ready,
    Degraded,
    Closed,
}

pub struct MasterStream {
    cfg: MasterStreamConfig,
    cache: Arc<SignalCache>,
    stop_flag: Arc<AtomicBool>,
    ready_flag: Arc<AtomicBool>,
    state: StreamState,
}

impl MasterStream {
    pub fn new(cfg: MasterStreamConfig, cache: Arc<SignalCache>) -> Self {
        Self {
            cfg,
            cache,
            stop_flag: Arc::new(AtomicBool::new(false)),
            ready_flag: Arc::new(AtomicBool::new(false)),
            state: StreamState::Disconnected,
        }
    }

    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop_flag.clone()
    }

    pub fn ready_handle(&self) -> Arc<AtomicBool> {
        self.ready_flag.clone()
    }

    fn signature(&self, req_time: i64) -> String {
        let payload = format!("{}{}", self.cfg.api_key, req_time);
        let mut mac = HmacSha256::new_from_slice(self.cfg.api_secret.as_bytes()).expect("hmac accepts any key length");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Reconnect loop: on any terminal error, wait a jittered 0.8-1.5s and
    /// try again. Unbounded — only the Supervisor's hard stop ends this.
    pub async fn run(mut self) {
        info!("master stream starting against {}", self.cfg.ws_url);
        while !self.stop_flag.load(Ordering::SeqCst) {
            self.state = StreamState::Connecting;
            match self.connect_and_login().await {
                Ok(ws) => {
                    self.state = StreamState::Ready;
                    self.ready_flag.store(true, Ordering::SeqCst);
                    info!("master stream logged in");
                    self.handle_messages(ws).await;
                }
                Err(e) => {
                    warn!("master stream connect/login failed: {e:#}");
                }
            }
            self.ready_flag.store(false, Ordering::SeqCst);
            self.state = StreamState::Degraded;
            if self.stop_flag.load(Ordering::SeqCst) {
                break;
            }
            let jitter = rand::thread_rng().gen_range(0.8..1.5);
            tokio::time::sleep(Duration::from_secs_f64(jitter)).await;
        }
        self.state = StreamState::Closed;
        info!("master stream closed");
    }

    async fn connect_and_login(&self) -> anyhow::Result<Ws> {
        let (mut ws, _) = tokio_tungstenite::connect_async(&self.cfg.ws_url).await?;

        let req_time = super::rest::now_ms() - CLOCK_SKEW_MS;
        let login = serde_json::json!({
            "method": "login",
            "param": {
                "apiKey": self.cfg.api_key,
                "reqTime": req_time.to_string(),
                "signature": self.signature(req_time),
            }
        });
        ws.send(Message::Text(login.to_string())).await?;

        tokio::time::timeout(LOGIN_TIMEOUT, async {
            loop {
                match ws.next().await {
                    Some(Ok(Message::Text(t))) => {
                        let v: Value = serde_json::from_str(&t).unwrap_or(Value::Null);
                        if v.get("channel").and_then(|c| c.as_str()) == Some("rs.login") {
                            if v.get("data").and_then(|d| d.as_str()) == Some("success") {
                                return Ok(());
                            }
                            anyhow::bail!("login rejected: {v}");
                        }
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => anyhow::bail!("ws error during login: {e}"),
                    None => anyhow::bail!("ws closed during login"),
                }
            }
        })
        .await
        .map_err(|_| anyhow::anyhow!("login timed out after {LOGIN_TIMEOUT:?}"))??;

        Ok(ws)
    }

    async fn handle_messages(&mut self, ws: Ws) {
        let (mut sink, mut stream) = ws.split();
        let mut ping_tick = tokio::time::interval(PING_INTERVAL);

        loop {
            if self.stop_flag.load(Ordering::SeqCst) {
                break;
            }
            tokio::select! {
                _ = ping_tick.tick() => {
                    if sink.send(Message::Text(serde_json::json!({"method": "ping"}).to_string())).await.is_err() {
                        warn!("ping send failed, reconnecting");
                        break;
                    }
                }
                frame = tokio::time::timeout(READ_DEADLINE, stream.next()) => {
                    match frame {
                        Ok(Some(Ok(Message::Text(t)))) => self.classify_and_emit(&t).await,
                        Ok(Some(Ok(_))) => continue,
                        Ok(Some(Err(e))) => {
                            warn!("ws read error: {e}");
                            break;
                        }
                        Ok(None) => {
                            warn!("master stream closed by peer");
                            break;
                        }
                        Err(_) => continue, // 1s read deadline, just re-check stop_flag
                    }
                }
            }
        }
    }

    async fn classify_and_emit(&self, raw_text: &str) {
        let Ok(v) = serde_json::from_str::<Value>(raw_text) else { return };
        let Some(ev) = self.classify(&v) else { return };
        if self.cfg.black_symbols.iter().any(|s| s == &ev.symbol) {
            debug!("dropping blacklisted symbol {}", ev.symbol);
            return;
        }
        self.cache.push_event(ev).await;
    }

    fn classify(&self, v: &Value) -> Option<SignalEvent> {
        let channel = v.get("channel")?.as_str()?;
        let data = v.get("data")?;

        match channel {
            "push.personal.order" => self.classify_order(data),
            "push.personal.position" => self.classify_position(data),
            "push.personal.plan.order" => self.classify_plan_order(data),
            "push.personal.stop.order" => self.classify_stop_order(data),
            "push.personal.order.deal" => self.classify_deal(data),
            _ => None,
        }
    }

    fn raw_map(&self, data: &Value) -> HashMap<String, Value> {
        data.as_object().map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect()).unwrap_or_default()
    }

    fn symbol_of(&self, data: &Value) -> Option<String> {
        data.get("symbol").and_then(|s| s.as_str()).map(|s| normalize_symbol(s, &self.cfg.quota_asset))
    }

    fn classify_order(&self, data: &Value) -> Option<SignalEvent> {
        let symbol = self.symbol_of(data)?;
        let side = data.get("side").and_then(|s| s.as_i64());
        let pos_side = side.and_then(PosSide::from_order_side);
        let state = data.get("state").and_then(|s| s.as_i64())?;
        let order_type = data.get("orderType").and_then(|s| s.as_i64()).unwrap_or(0);

        let event_type = match (state, order_type) {
            (4, _) => SignalEventType::OrderCancelled,
            (5, _) => SignalEventType::OrderInvalid,
            (3, 1) => SignalEventType::LimitFilled,
            (3, 5) => SignalEventType::MarketFilled,
            (3, _) => SignalEventType::TriggerFilled,
            (2, 1) => SignalEventType::LimitPlaced,
            _ => return None,
        };

        Some(SignalEvent { symbol, pos_side, event_type, ts_ms: super::rest::now_ms(), raw: self.raw_map(data) })
    }

    fn classify_position(&self, data: &Value) -> Option<SignalEvent> {
        let symbol = self.symbol_of(data)?;
        let position_type = data.get("positionType").and_then(|s| s.as_i64())?;
        let pos_side = PosSide::from_position_type(position_type);
        let state = data.get("state").and_then(|s| s.as_i64()).unwrap_or(0);
        let hold_vol = data.get("holdVol").and_then(|s| s.as_f64()).unwrap_or(0.0);

        let event_type = if matches!(state, 1 | 2) && hold_vol > 0.0 {
            SignalEventType::PositionOpened
        } else {
            SignalEventType::PositionClosed
        };

        Some(SignalEvent { symbol, pos_side, event_type, ts_ms: super::rest::now_ms(), raw: self.raw_map(data) })
    }

    fn classify_plan_order(&self, data: &Value) -> Option<SignalEvent> {
        let symbol = self.symbol_of(data)?;
        let pos_side = data.get("side").and_then(|s| s.as_i64()).and_then(PosSide::from_order_side);
        let state = data.get("state").and_then(|s| s.as_i64()).unwrap_or(0);
        let event_type = match state {
            1 => SignalEventType::PlanOrder,
            3 => SignalEventType::PlanExecuted,
            _ => SignalEventType::PlanCancelled,
        };
        Some(SignalEvent { symbol, pos_side, event_type, ts_ms: super::rest::now_ms(), raw: self.raw_map(data) })
    }

    fn classify_stop_order(&self, data: &Value) -> Option<SignalEvent> {
        let symbol = self.symbol_of(data)?;
        let pos_side = data.get("side").and_then(|s| s.as_i64()).and_then(PosSide::from_order_side);
        Some(SignalEvent {
            symbol,
            pos_side,
            event_type: SignalEventType::OcoAttached,
            ts_ms: super::rest::now_ms(),
            raw: self.raw_map(data),
        })
    }

    fn classify_deal(&self, data: &Value) -> Option<SignalEvent> {
        let symbol = self.symbol_of(data)?;
        Some(SignalEvent {
            symbol,
            pos_side: None,
            event_type: SignalEventType::Deal,
            ts_ms: super::rest::now_ms(),
            raw: self.raw_map(data),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream() -> MasterStream {
        let cfg = MasterStreamConfig {
            ws_url: "wss://example.invalid".into(),
            api_key: "k".into(),
            api_secret: "s".into(),
            black_symbols: vec!["DOGE_USDT".into()],
            quota_asset: "USDT".into(),
        };
        MasterStream::new(cfg, Arc::new(SignalCache::new()))
    }

    #[test]
    fn test_classify_order_limit_placed() {
        let s = stream();
        let data = serde_json::json!({"symbol":"BTCUSDT","side":1,"state":2,"orderType":1,"orderId":"L1"});
        let v = serde_json::json!({"channel":"push.personal.order","data":data});
        let ev = s.classify(&v).unwrap();
        assert_eq!(ev.event_type, SignalEventType::LimitPlaced);
        assert_eq!(ev.symbol, "BTC_USDT");
        assert_eq!(ev.pos_side, Some(PosSide::Long));
    }

    #[test]
    fn test_classify_order_market_filled() {
        let s = stream();
        let data = serde_json::json!({"symbol":"BTCUSDT","side":1,"state":3,"orderType":5,"vol":10,"price":"100"});
        let v = serde_json::json!({"channel":"push.personal.order","data":data});
        let ev = s.classify(&v).unwrap();
        assert_eq!(ev.event_type, SignalEventType::MarketFilled);
    }

    #[test]
    fn test_classify_order_cancelled_regardless_of_order_type() {
        let s = stream();
        let data = serde_json::json!({"symbol":"BTCUSDT","side":1,"state":4,"orderType":1});
        let v = serde_json::json!({"channel":"push.personal.order","data":data});
        let ev = s.classify(&v).unwrap();
        assert_eq!(ev.event_type, SignalEventType::OrderCancelled);
    }

    #[test]
    fn test_classify_position_opened_vs_closed() {
        let s = stream();
        let opened = serde_json::json!({"symbol":"BTCUSDT","positionType":1,"state":1,"holdVol":5.0});
        let v = serde_json::json!({"channel":"push.personal.position","data":opened});
        assert_eq!(s.classify(&v).unwrap().event_type, SignalEventType::PositionOpened);

        let closed = serde_json::json!({"symbol":"BTCUSDT","positionType":1,"state":3,"holdVol":0.0});
        let v = serde_json::json!({"channel":"push.personal.position","data":closed});
        assert_eq!(s.classify(&v).unwrap().event_type, SignalEventType::PositionClosed);
    }

    #[test]
    fn test_classify_stop_order_is_oco_attached() {
        let s = stream();
        let data = serde_json::json!({"symbol":"BTCUSDT","side":1,"takeProfitPrice":110.0,"stopLossPrice":90.0});
        let v = serde_json::json!({"channel":"push.personal.stop.order","data":data});
        let ev = s.classify(&v).unwrap();
        assert_eq!(ev.event_type, SignalEventType::OcoAttached);
    }

    #[test]
    fn test_unknown_channel_is_ignored() {
        let s = stream();
        let v = serde_json::json!({"channel":"push.something.else","data":{}});
        assert!(s.classify(&v).is_none());
    }
}
