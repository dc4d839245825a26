//! Securities and exchanges - immutable after load.

use std::sync::Arc;

use crate::core::time::seconds_since_midnight;

pub type SecurityId = u32;
pub type ExchangeId = u16;

// Instrument type tags, following the IB contract convention.
pub const KIND_STOCK: &str = "STK";
pub const KIND_FOREX_PAIR: &str = "CASH";
pub const KIND_FUTURE: &str = "FUT";
pub const KIND_OPTION: &str = "OPT";

/// One interval of a tiered tick-size ladder: [lower, upper) -> tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickSizeRule {
    pub lower: f64,
    pub upper: f64,
    pub value: f64,
}

#[derive(Debug, Default)]
pub struct Exchange {
    pub id: ExchangeId,
    pub name: String,
    pub mic: String,
    pub country: String,
    pub tz: String,
    pub desc: String,
    pub utc_offset: i32,
    pub odd_lot_allowed: bool,
    /// Sorted by lower bound; empty means no ladder.
    pub tick_size_table: Vec<TickSizeRule>,
    // Session windows in seconds since local midnight; zero means open-ended.
    pub trade_start: i32,
    pub trade_end: i32,
    pub break_start: i32,
    pub break_end: i32,
}

impl Exchange {
    /// Ladder lookup by reference price. Returns 0 when no ladder applies.
    pub fn tick_size(&self, reference: f64) -> f64 {
        self.tick_size_table
            .iter()
            .find(|r| reference >= r.lower && reference < r.upper)
            .map(|r| r.value)
            .unwrap_or(0.0)
    }

    /// Seconds since midnight in the exchange's time zone.
    pub fn local_seconds(&self) -> i32 {
        seconds_since_midnight(self.utc_offset)
    }

    pub fn in_trade_period(&self) -> bool {
        let t = self.local_seconds();
        (self.break_start <= 0 || (t > self.break_start && t < self.break_end))
            && (self.trade_start <= 0 || (t > self.trade_start && t < self.trade_end))
    }

    /// Decode an `HHMMHHMM` session window into (start, end) seconds.
    pub fn decode_period(period: i32) -> (i32, i32) {
        if period <= 0 {
            return (0, 0);
        }
        let start = period / 10000;
        let end = period % 10000;
        (
            (start / 100) * 3600 + (start % 100) * 60,
            (end / 100) * 3600 + (end % 100) * 60,
        )
    }
}

#[derive(Debug)]
pub struct Security {
    pub id: SecurityId,
    pub symbol: String,
    pub local_symbol: String,
    /// Instrument type tag (`STK`, `CASH`, `FUT`, `OPT`, ...)
    pub kind: String,
    pub currency: String,
    pub exchange: Arc<Exchange>,
    pub underlying: Option<SecurityId>,
    /// Currency rate to the reference numeraire.
    pub rate: f64,
    pub multiplier: f64,
    pub tick_size: f64,
    pub lot_size: i32,
    pub close_price: f64,
    // Option fields
    pub strike_price: f64,
    pub maturity_date: i32,
    pub put_or_call: bool,
    pub opt_attribute: Option<char>,
}

impl Security {
    /// Own tick size, or the exchange ladder resolved at `px`.
    pub fn tick_size(&self, px: f64) -> f64 {
        if self.tick_size > 0.0 {
            self.tick_size
        } else {
            self.exchange.tick_size(px)
        }
    }

    pub fn in_trade_period(&self) -> bool {
        self.exchange.in_trade_period()
    }

    pub fn is_forex_pair(&self) -> bool {
        self.kind == KIND_FOREX_PAIR
    }
}
