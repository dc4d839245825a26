//! Account entities: users, sub-accounts, broker accounts.
//!
//! Identity is immutable after load; the exposure counters (throttles and
//! position values) are the mutable half and live behind atomics/locks.

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::security::{ExchangeId, SecurityId};

pub type UserId = u16;
pub type SubAccountId = u16;
pub type BrokerAccountId = u16;

/// Per-entity trading limits, zero meaning unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Limits {
    pub msg_rate: f64,
    pub msg_rate_per_security: f64,
    pub order_qty: f64,
    pub order_value: f64,
    /// Per-security worst-case exposure value.
    pub value: f64,
    /// Per-security turnover.
    pub turnover: f64,
    pub total_value: f64,
    pub total_turnover: f64,
}

impl Limits {
    /// Parse a `key=value` blob separated by commas, semicolons, or
    /// newlines. Unknown keys are ignored.
    pub fn parse(blob: &str) -> Limits {
        let mut limits = Limits::default();
        for item in blob.split(|c| c == ',' || c == ';' || c == '\n') {
            let Some((k, v)) = item.split_once('=') else {
                continue;
            };
            let Ok(value) = v.trim().parse::<f64>() else {
                continue;
            };
            match k.trim().to_ascii_lowercase().as_str() {
                "msg_rate" => limits.msg_rate = value,
                "msg_rate_per_security" => limits.msg_rate_per_security = value,
                "order_qty" => limits.order_qty = value,
                "order_value" => limits.order_value = value,
                "value" => limits.value = value,
                "turnover" => limits.turnover = value,
                "total_value" => limits.total_value = value,
                "total_turnover" => limits.total_turnover = value,
                _ => {}
            }
        }
        limits
    }
}

/// Parse an adapter parameter blob: `key=value` per line.
pub fn parse_params(blob: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for line in blob.split('\n') {
        let Some((k, v)) = line.split_once('=') else {
            continue;
        };
        let (k, v) = (k.trim(), v.trim());
        if k.is_empty() || v.is_empty() {
            continue;
        }
        out.insert(k.to_string(), v.to_string());
    }
    out
}

/// Lock-free per-second message counter. Packed as one 64-bit word:
/// high word = epoch second, low word = count within that second.
#[derive(Default)]
pub struct Throttle(AtomicU64);

impl Throttle {
    pub fn count(&self, now: i64) -> u32 {
        let v = self.0.load(Ordering::Relaxed);
        if (v >> 32) as u32 == now as u32 {
            v as u32
        } else {
            0
        }
    }

    /// Count one message; resets on a second boundary.
    pub fn update(&self, now: i64) {
        let sec = now as u32;
        let mut cur = self.0.load(Ordering::Relaxed);
        loop {
            let next = if (cur >> 32) as u32 == sec {
                cur + 1
            } else {
                (u64::from(sec) << 32) | 1
            };
            match self
                .0
                .compare_exchange_weak(cur, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(seen) => cur = seen,
            }
        }
    }
}

/// Lazily-created per-security throttles for one entity.
#[derive(Default)]
pub struct SecurityThrottles {
    map: RwLock<HashMap<SecurityId, Arc<Throttle>>>,
}

impl SecurityThrottles {
    pub fn count(&self, sec_id: SecurityId, now: i64) -> u32 {
        self.map
            .read()
            .get(&sec_id)
            .map(|t| t.count(now))
            .unwrap_or(0)
    }

    pub fn update(&self, sec_id: SecurityId, now: i64) {
        if let Some(t) = self.map.read().get(&sec_id) {
            t.update(now);
            return;
        }
        let t = self
            .map
            .write()
            .entry(sec_id)
            .or_insert_with(|| Arc::new(Throttle::default()))
            .clone();
        t.update(now);
    }
}

/// Aggregate traded/outstanding value counters in the reference numeraire.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PositionValue {
    pub total_bought: f64,
    pub total_sold: f64,
    pub total_outstanding_buy: f64,
    pub total_outstanding_sell: f64,
}

impl PositionValue {
    pub fn handle_new(&mut self, is_buy: bool, qty: f64, price: f64, multiplier: f64) {
        let value = qty * price * multiplier;
        if is_buy {
            self.total_outstanding_buy += value;
        } else {
            self.total_outstanding_sell += value;
        }
    }

    pub fn handle_trade(
        &mut self,
        is_buy: bool,
        qty: f64,
        price: f64,
        price0: f64,
        multiplier: f64,
        is_bust: bool,
        is_otc: bool,
    ) {
        if is_otc {
            return;
        }
        let value = qty * price * multiplier;
        if !is_bust {
            let value0 = qty * price0 * multiplier;
            if is_buy {
                self.total_outstanding_buy -= value0;
                self.total_bought += value;
            } else {
                self.total_outstanding_sell -= value0;
                self.total_sold += value;
            }
        } else if is_buy {
            self.total_bought -= value;
        } else {
            self.total_sold -= value;
        }
    }

    pub fn handle_finish(&mut self, is_buy: bool, leaves_qty: f64, price0: f64, multiplier: f64) {
        let value = leaves_qty * price0 * multiplier;
        if is_buy {
            self.total_outstanding_buy -= value;
        } else {
            self.total_outstanding_sell -= value;
        }
    }
}

/// The risk-relevant mutable half shared by all account entities.
#[derive(Default)]
pub struct AccountRisk {
    pub limits: Limits,
    pub throttle: Throttle,
    pub sec_throttles: SecurityThrottles,
    pub position_value: Mutex<PositionValue>,
}

pub struct User {
    pub id: UserId,
    pub name: String,
    /// SHA-1 hex digest of the password.
    pub password: String,
    pub is_admin: bool,
    pub is_disabled: bool,
    pub sub_accounts: HashSet<SubAccountId>,
    pub risk: AccountRisk,
}

impl User {
    pub fn permissioned(&self, sub_account: SubAccountId) -> bool {
        self.sub_accounts.contains(&sub_account)
    }
}

pub struct SubAccount {
    pub id: SubAccountId,
    pub name: String,
    /// Broker account per exchange; key 0 is the default route.
    pub broker_accounts: HashMap<ExchangeId, BrokerAccountId>,
    pub risk: AccountRisk,
}

impl SubAccount {
    pub fn broker_for(&self, exchange: ExchangeId) -> Option<BrokerAccountId> {
        self.broker_accounts
            .get(&exchange)
            .or_else(|| self.broker_accounts.get(&0))
            .copied()
    }
}

pub struct BrokerAccount {
    pub id: BrokerAccountId,
    pub name: String,
    pub adapter_name: String,
    pub params: HashMap<String, String>,
    pub risk: AccountRisk,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_parse_mixed_separators() {
        let l = Limits::parse("msg_rate=10, order_qty=500;value=1e6\nbogus_key=3");
        assert_eq!(l.msg_rate, 10.0);
        assert_eq!(l.order_qty, 500.0);
        assert_eq!(l.value, 1e6);
        assert_eq!(l.turnover, 0.0);
    }

    #[test]
    fn params_parse_per_line() {
        let p = parse_params("host=localhost\nport=9000\nmalformed\nempty=");
        assert_eq!(p.get("host").map(String::as_str), Some("localhost"));
        assert_eq!(p.get("port").map(String::as_str), Some("9000"));
        assert_eq!(p.len(), 2);
    }

    #[test]
    fn throttle_resets_on_second_boundary() {
        let t = Throttle::default();
        t.update(100);
        t.update(100);
        assert_eq!(t.count(100), 2);
        // next second: counter restarts at one
        t.update(101);
        assert_eq!(t.count(101), 1);
        assert_eq!(t.count(102), 0);
    }

    #[test]
    fn position_value_round_trip() {
        let mut pv = PositionValue::default();
        pv.handle_new(true, 100.0, 10.0, 1.0);
        assert_eq!(pv.total_outstanding_buy, 1000.0);
        pv.handle_trade(true, 100.0, 10.0, 10.0, 1.0, false, false);
        assert_eq!(pv.total_outstanding_buy, 0.0);
        assert_eq!(pv.total_bought, 1000.0);
        // bust reverses the fill
        pv.handle_trade(true, 100.0, 10.0, 10.0, 1.0, true, false);
        assert_eq!(pv.total_bought, 0.0);
    }

    #[test]
    fn broker_route_falls_back_to_default() {
        let mut accounts = HashMap::new();
        accounts.insert(0u16, 7u16);
        accounts.insert(3u16, 9u16);
        let sub = SubAccount {
            id: 1,
            name: "a".into(),
            broker_accounts: accounts,
            risk: AccountRisk::default(),
        };
        assert_eq!(sub.broker_for(3), Some(9));
        assert_eq!(sub.broker_for(5), Some(7));
    }
}
