//! Notifier: the thin sink the core pushes UI log lines and PnL reports
//! through. The Telegram bot that the real UI uses lives outside this
//! crate's scope; `LogNotifier` is the default, dependency-free sink.

use async_trait::async_trait;
use tracing::info;

use super::refresh::PnlReport;
use super::rest::ms_to_datetime;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn log_line(&self, line: String);
    async fn pnl_report(&self, report: &PnlReport);
}

/// Default sink: every notification becomes a structured log line. Good
/// enough for a headless deployment; a Telegram-backed Notifier can be
/// swapped in at the composition root without touching the core.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn log_line(&self, line: String) {
        info!(target: "relay::ui", "{line}");
    }

    async fn pnl_report(&self, report: &PnlReport) {
        info!(
            target: "relay::ui",
            "PNL cid={} {} {:?} pnl={:?} entry={}",
            report.cid, report.symbol, report.pos_side, report.pnl_usdt, ms_to_datetime(report.entry_ts)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::types::PosSide;

    #[tokio::test]
    async fn test_log_notifier_does_not_panic() {
        let n = LogNotifier;
        n.log_line("BTC_USDT LONG :: MARKET FAILED: timeout".to_string()).await;
        n.pnl_report(&PnlReport { cid: 1, symbol: "BTC_USDT".into(), pos_side: PosSide::Long, pnl_usdt: Some(12.5), entry_ts: 0 })
            .await;
    }
}
