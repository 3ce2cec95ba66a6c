//! Shared value types for the copy pipeline: sides, order methods, symbol
//! normalization. Kept free of channel/actor concerns so every other module
//! can depend on it without cycles.

use std::fmt;

/// Position direction. Mirrors the exchange's `positionType` (1=LONG, 2=SHORT).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PosSide {
    Long,
    Short,
}

impl PosSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            PosSide::Long => "LONG",
            PosSide::Short => "SHORT",
        }
    }

    pub fn opposite(&self) -> PosSide {
        match self {
            PosSide::Long => PosSide::Short,
            PosSide::Short => PosSide::Long,
        }
    }

    pub fn from_position_type(code: i64) -> Option<PosSide> {
        match code {
            1 => Some(PosSide::Long),
            2 => Some(PosSide::Short),
            _ => None,
        }
    }

    /// `side` field on `push.personal.order`: 1=OpenLong, 2=CloseShort, 3=OpenShort, 4=CloseLong.
    pub fn from_order_side(code: i64) -> Option<PosSide> {
        match code {
            1 | 4 => Some(PosSide::Long),
            2 | 3 => Some(PosSide::Short),
            _ => None,
        }
    }
}

impl fmt::Display for PosSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order-side as sent to the exchange REST surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderSide {
    Buy,
    Sell,
}

/// Exchange order-side enum: OpenLong=1, CloseLong=2, OpenShort=3, CloseShort=4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeOrderSide {
    OpenLong = 1,
    CloseLong = 2,
    OpenShort = 3,
    CloseShort = 4,
}

impl ExchangeOrderSide {
    pub fn resolve(side: OrderSide, pos_side: PosSide, closing: bool) -> Self {
        use ExchangeOrderSide::*;
        match (side, pos_side, closing) {
            (OrderSide::Buy, PosSide::Long, false) => OpenLong,
            (OrderSide::Sell, PosSide::Long, true) => CloseLong,
            (OrderSide::Sell, PosSide::Short, false) => OpenShort,
            (OrderSide::Buy, PosSide::Short, true) => CloseShort,
            // Any other combination still resolves to the matching open/close
            // pair for the stated position side; `side` only disambiguates
            // buy/sell at the wire level and is not otherwise load-bearing.
            (_, PosSide::Long, false) => OpenLong,
            (_, PosSide::Long, true) => CloseLong,
            (_, PosSide::Short, false) => OpenShort,
            (_, PosSide::Short, true) => CloseShort,
        }
    }
}

/// `openType`: 1=Isolated, 2=Crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenType {
    Isolated = 1,
    Crossed = 2,
}

impl OpenType {
    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            1 => Some(OpenType::Isolated),
            2 => Some(OpenType::Crossed),
            _ => None,
        }
    }
}

/// Order execution method carried on a `MasterEvent` / `OrderIntent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderMethod {
    Market,
    Limit,
    Trigger,
}

/// Trigger comparison: `LessThanOrEqual` for OpenLong/CloseShort, else `GreaterThanOrEqual`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerType {
    LessThanOrEqual,
    GreaterThanOrEqual,
}

impl TriggerType {
    pub fn for_order_side(side: ExchangeOrderSide) -> Self {
        match side {
            ExchangeOrderSide::OpenLong | ExchangeOrderSide::CloseShort => {
                TriggerType::LessThanOrEqual
            }
            ExchangeOrderSide::OpenShort | ExchangeOrderSide::CloseLong => {
                TriggerType::GreaterThanOrEqual
            }
        }
    }
}

/// Normalizes a raw symbol into the internal canonical form: uppercase,
/// separators stripped, quote asset joined with an underscore.
///
/// `BTCUSDT` / `btc-usdt` / `BTC_USDT` all normalize to `BTC_USDT`.
pub fn normalize_symbol(raw: &str, quota_asset: &str) -> String {
    if raw.is_empty() {
        return String::new();
    }
    let qa = quota_asset.to_uppercase();
    let stripped: String = raw
        .to_uppercase()
        .chars()
        .filter(|c| *c != '-' && *c != '_' && *c != ' ')
        .collect();
    match stripped.strip_suffix(&qa) {
        Some(base) => format!("{base}_{qa}"),
        None => stripped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_symbol_plain() {
        assert_eq!(normalize_symbol("BTCUSDT", "USDT"), "BTC_USDT");
    }

    #[test]
    fn test_normalize_symbol_dashes_and_case() {
        assert_eq!(normalize_symbol("btc-usdt", "USDT"), "BTC_USDT");
        assert_eq!(normalize_symbol("btc_usdt", "USDT"), "BTC_USDT");
        assert_eq!(normalize_symbol("btc usdt", "USDT"), "BTC_USDT");
    }

    #[test]
    fn test_normalize_symbol_empty() {
        assert_eq!(normalize_symbol("", "USDT"), "");
    }

    #[test]
    fn test_pos_side_from_order_side() {
        assert_eq!(PosSide::from_order_side(1), Some(PosSide::Long));
        assert_eq!(PosSide::from_order_side(4), Some(PosSide::Long));
        assert_eq!(PosSide::from_order_side(2), Some(PosSide::Short));
        assert_eq!(PosSide::from_order_side(3), Some(PosSide::Short));
        assert_eq!(PosSide::from_order_side(0), None);
    }

    #[test]
    fn test_trigger_type_mapping() {
        assert_eq!(
            TriggerType::for_order_side(ExchangeOrderSide::OpenLong),
            TriggerType::LessThanOrEqual
        );
        assert_eq!(
            TriggerType::for_order_side(ExchangeOrderSide::CloseShort),
            TriggerType::LessThanOrEqual
        );
        assert_eq!(
            TriggerType::for_order_side(ExchangeOrderSide::OpenShort),
            TriggerType::GreaterThanOrEqual
        );
        assert_eq!(
            TriggerType::for_order_side(ExchangeOrderSide::CloseLong),
            TriggerType::GreaterThanOrEqual
        );
    }
}
