//! Market data model: per-source snapshots with a five-level depth.

pub mod hub;

pub use hub::{FeedHandle, MarketDataAdapter, MarketDataHub};

use std::fmt;

use crate::reference::SecurityId;

pub const DEPTH_SIZE: usize = 5;

/// Cumulative trade state for one security on one source.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Trade {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    /// Last trade size.
    pub qty: f64,
    pub vwap: f64,
    pub volume: f64,
}

impl Trade {
    /// `open` latches on first print, `high`/`low` ratchet, `close`
    /// replaces (zero low is treated as unset).
    pub fn update_px(&mut self, px: f64) {
        if self.open == 0.0 {
            self.open = px;
        }
        if px > self.high {
            self.high = px;
        }
        if px < self.low || self.low == 0.0 {
            self.low = px;
        }
        self.close = px;
    }

    /// Volume-weighted blend computed before the volume bump.
    pub fn update_volume(&mut self, qty: f64) {
        self.vwap = (self.volume * self.vwap + self.close * qty) / (self.volume + qty);
        self.volume += qty;
        self.qty = qty;
    }

    /// Structural change test used by the runner to decide whether to
    /// dispatch `on_market_trade`.
    pub fn differs(&self, other: &Trade) -> bool {
        self.volume != other.volume
            || self.close != other.close
            || self.high != other.high
            || self.low != other.low
    }
}

/// One depth level.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Quote {
    pub ask_price: f64,
    pub ask_size: f64,
    pub bid_price: f64,
    pub bid_size: f64,
}

impl Quote {
    pub fn differs(&self, other: &Quote) -> bool {
        self.ask_price != other.ask_price
            || self.ask_size != other.ask_size
            || self.bid_price != other.bid_price
            || self.bid_size != other.bid_size
    }
}

/// Most-recent snapshot for one `(source, security)`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MarketData {
    /// Seconds UTC of the last update.
    pub tm: i64,
    pub trade: Trade,
    pub depth: [Quote; DEPTH_SIZE],
}

impl MarketData {
    /// Top of book.
    pub fn quote(&self) -> &Quote {
        &self.depth[0]
    }
}

/// A 1-4 byte ascii source tag packed little-endian into 32 bits.
/// Zero means "default source".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DataSrc(pub u32);

impl DataSrc {
    pub const DEFAULT: DataSrc = DataSrc(0);

    pub fn from_tag(tag: &str) -> Option<DataSrc> {
        let bytes = tag.as_bytes();
        if bytes.len() > 4 || bytes.iter().any(|b| !b.is_ascii() || *b == 0) {
            return None;
        }
        let mut id = 0u32;
        for (i, b) in bytes.iter().enumerate() {
            id |= u32::from(*b) << (8 * i);
        }
        Some(DataSrc(id))
    }
}

impl fmt::Display for DataSrc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut id = self.0;
        while id != 0 {
            f.write_str(
                std::str::from_utf8(&[(id & 0xff) as u8]).unwrap_or("?"),
            )?;
            id >>= 8;
        }
        Ok(())
    }
}

pub type MdKey = (DataSrc, SecurityId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trade_update_rules() {
        let mut t = Trade::default();
        t.update_px(10.0);
        assert_eq!((t.open, t.high, t.low, t.close), (10.0, 10.0, 10.0, 10.0));
        t.update_px(12.0);
        assert_eq!((t.open, t.high, t.low, t.close), (10.0, 12.0, 10.0, 12.0));
        t.update_px(9.0);
        assert_eq!((t.open, t.high, t.low, t.close), (10.0, 12.0, 9.0, 9.0));
    }

    #[test]
    fn vwap_is_blended_before_volume_bump() {
        let mut t = Trade::default();
        t.update_px(10.0);
        t.update_volume(100.0);
        assert_eq!(t.vwap, 10.0);
        assert_eq!(t.volume, 100.0);
        t.update_px(20.0);
        t.update_volume(100.0);
        assert_eq!(t.vwap, 15.0);
        assert_eq!(t.volume, 200.0);
        assert_eq!(t.qty, 100.0);
    }

    #[test]
    fn trade_change_test_ignores_vwap() {
        let a = Trade { vwap: 1.0, ..Default::default() };
        let b = Trade { vwap: 2.0, ..Default::default() };
        assert!(!a.differs(&b));
        let c = Trade { close: 5.0, ..Default::default() };
        assert!(a.differs(&c));
    }

    #[test]
    fn src_tag_packing_round_trips() {
        let src = DataSrc::from_tag("SIM").unwrap();
        assert_eq!(src.to_string(), "SIM");
        assert_eq!(DataSrc::from_tag(""), Some(DataSrc(0)));
        assert!(DataSrc::from_tag("TOOBIG").is_none());
        // single byte matches the raw ascii value
        assert_eq!(DataSrc::from_tag("B"), Some(DataSrc(u32::from(b'B'))));
    }
}
