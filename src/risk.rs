//! Pre-trade risk: stateless checks over sub-account, broker-account,
//! and user limits, driven by the position engine's cached exposures.

use std::sync::Arc;
use thiserror::Error;

use crate::core::time::unix_now;
use crate::orderbook::Order;
use crate::position::{Position, PositionManager};
use crate::reference::account::AccountRisk;
use crate::reference::SecurityId;

/// A failed check. The message rides into `Confirmation.text` on the
/// resulting risk-reject, so it has to read well for a human.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RiskError {
    #[error("{scope} limit breach: message rate per security {n} >= {limit}")]
    MsgRatePerSecurity { scope: &'static str, n: u32, limit: f64 },

    #[error("{scope} limit breach: message rate {n} >= {limit}")]
    MsgRate { scope: &'static str, n: u32, limit: f64 },

    #[error("{scope} limit breach: single order quantity {qty} > {limit}")]
    OrderQty { scope: &'static str, qty: f64, limit: f64 },

    #[error("{scope} limit breach: single order value {value} > {limit}")]
    OrderValue { scope: &'static str, value: f64, limit: f64 },

    #[error("{scope} limit breach: security intraday trade value {value} > {limit}")]
    SecurityValue { scope: &'static str, value: f64, limit: f64 },

    #[error("{scope} limit breach: security intraday turnover {value} > {limit}")]
    SecurityTurnover { scope: &'static str, value: f64, limit: f64 },

    #[error("{scope} limit breach: total intraday trade value {value} > {limit}")]
    TotalValue { scope: &'static str, value: f64, limit: f64 },

    #[error("{scope} limit breach: total intraday turnover {value} > {limit}")]
    TotalTurnover { scope: &'static str, value: f64, limit: f64 },

    #[error("not permissioned to trade with sub account: {0}")]
    SubAccountNotPermissioned(String),

    #[error("not permissioned to trade on exchange: {0}")]
    ExchangeNotPermissioned(String),

    #[error("execution adapter '{0}' is not started")]
    AdapterMissing(String),

    #[error("execution adapter '{0}' is disconnected")]
    AdapterDisconnected(String),

    #[error("can not find last price for this security")]
    NoReferencePrice,

    #[error("price can not be empty for limit order")]
    MissingLimitPrice,

    #[error("adapter rejected: {0}")]
    AdapterRejected(String),
}

pub struct RiskManager {
    positions: Arc<PositionManager>,
    disabled: bool,
}

impl RiskManager {
    pub fn new(positions: Arc<PositionManager>, disabled: bool) -> Arc<RiskManager> {
        Arc::new(RiskManager { positions, disabled })
    }

    /// Full pre-trade check, short-circuiting per entity in order:
    /// sub-account, broker-account, user.
    pub fn check(&self, ord: &Order) -> Result<(), RiskError> {
        if self.disabled {
            return Ok(());
        }
        check_entity(
            "sub_account",
            ord,
            &ord.sub_account.risk,
            self.positions.sub_position(ord.sub_account.id, ord.sec.id),
        )?;
        if let Some(broker) = &ord.broker_account {
            check_entity(
                "broker_account",
                ord,
                &broker.risk,
                self.positions.broker_position(broker.id, ord.sec.id),
            )?;
        }
        check_entity(
            "user",
            ord,
            &ord.user.risk,
            self.positions.user_position(ord.user.id, ord.sec.id),
        )?;
        Ok(())
    }

    /// Reduced variant used at cancel time.
    pub fn check_msg_rate(&self, ord: &Order) -> Result<(), RiskError> {
        if self.disabled {
            return Ok(());
        }
        check_msg_rate("sub_account", &ord.sub_account.risk, ord.sec.id)?;
        if let Some(broker) = &ord.broker_account {
            check_msg_rate("broker_account", &broker.risk, ord.sec.id)?;
        }
        check_msg_rate("user", &ord.user.risk, ord.sec.id)?;
        Ok(())
    }
}

fn check_msg_rate(
    scope: &'static str,
    risk: &AccountRisk,
    sec_id: SecurityId,
) -> Result<(), RiskError> {
    let now = unix_now();
    let limits = &risk.limits;
    if limits.msg_rate_per_security > 0.0 {
        let n = risk.sec_throttles.count(sec_id, now);
        if f64::from(n) >= limits.msg_rate_per_security {
            return Err(RiskError::MsgRatePerSecurity {
                scope,
                n,
                limit: limits.msg_rate_per_security,
            });
        }
    }
    if limits.msg_rate > 0.0 {
        let n = risk.throttle.count(now);
        if f64::from(n) >= limits.msg_rate {
            return Err(RiskError::MsgRate {
                scope,
                n,
                limit: limits.msg_rate,
            });
        }
    }
    Ok(())
}

/// The signed-or-absolute worst case: a buy can grow either the long
/// side (net + outstanding buys + this order) or already be short
/// (net - outstanding sells); take the worse magnitude. Sells mirror.
fn worst_case(net: f64, out_buy: f64, out_sell: f64, v: f64, is_buy: bool) -> f64 {
    if is_buy {
        (net + out_buy + v).abs().max((net - out_sell).abs())
    } else {
        (net + out_buy).abs().max((net - out_sell - v).abs())
    }
}

fn check_entity(
    scope: &'static str,
    ord: &Order,
    risk: &AccountRisk,
    pos: Position,
) -> Result<(), RiskError> {
    check_msg_rate(scope, risk, ord.sec.id)?;

    let limits = &risk.limits;
    if limits.order_qty > 0.0 && ord.qty > limits.order_qty {
        return Err(RiskError::OrderQty {
            scope,
            qty: ord.qty,
            limit: limits.order_qty,
        });
    }

    let v = ord.qty * ord.price * ord.sec.multiplier * ord.sec.rate;
    if limits.order_value > 0.0 && v > limits.order_value {
        return Err(RiskError::OrderValue {
            scope,
            value: v,
            limit: limits.order_value,
        });
    }

    let is_buy = ord.is_buy();
    if limits.value > 0.0 {
        let net = pos.value.total_bought - pos.value.total_sold;
        let v2 = worst_case(
            net,
            pos.value.total_outstanding_buy,
            pos.value.total_outstanding_sell,
            v,
            is_buy,
        );
        if v2 > limits.value {
            return Err(RiskError::SecurityValue {
                scope,
                value: v2,
                limit: limits.value,
            });
        }
    }

    if limits.turnover > 0.0 {
        let v2 = pos.value.total_bought
            + pos.value.total_outstanding_buy
            + pos.value.total_sold
            + pos.value.total_outstanding_sell
            + v;
        if v2 > limits.turnover {
            return Err(RiskError::SecurityTurnover {
                scope,
                value: v2,
                limit: limits.turnover,
            });
        }
    }

    if limits.total_value > 0.0 {
        let value = *risk.position_value.lock();
        let net = value.total_bought - value.total_sold;
        let v2 = worst_case(
            net,
            value.total_outstanding_buy,
            value.total_outstanding_sell,
            v,
            is_buy,
        );
        if v2 > limits.total_value {
            return Err(RiskError::TotalValue {
                scope,
                value: v2,
                limit: limits.total_value,
            });
        }
    }

    if limits.total_turnover > 0.0 {
        let value = *risk.position_value.lock();
        let v2 = value.total_bought
            + value.total_outstanding_buy
            + value.total_sold
            + value.total_outstanding_sell
            + v;
        if v2 > limits.total_turnover {
            return Err(RiskError::TotalTurnover {
                scope,
                value: v2,
                limit: limits.total_turnover,
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orderbook::testkit::{fixture, new_order};
    use crate::orderbook::{Confirmation, Order, OrderStatus};

    #[test]
    fn order_qty_breach_names_the_numbers() {
        let fx = fixture("risk-qty");
        let risk = RiskManager::new(fx.positions.clone(), false);
        let mut store = crate::reference::testkit::small_store();
        store.users[0].limits = "order_qty=500".into();
        let cache = std::sync::Arc::new(
            crate::reference::ReferenceCache::load(&store).unwrap(),
        );
        let mut ord = Order::new(
            crate::orderbook::OrderDraft {
                sec: cache.security(10).unwrap().clone(),
                sub_account: cache.sub_account(2).unwrap().clone(),
                side: crate::orderbook::Side::Buy,
                kind: crate::orderbook::OrdType::Limit,
                tif: crate::orderbook::Tif::Day,
                qty: 600.0,
                price: 1.0,
                stop_price: 0.0,
            },
            cache.user(1).unwrap().clone(),
            Some(cache.broker_account(3).unwrap().clone()),
            0,
            None,
        );
        ord.id = 1;
        let err = risk.check(&ord).unwrap_err();
        assert!(err.to_string().contains("order quantity 600 > 500"));
    }

    #[test]
    fn value_limit_uses_worst_case_exposure() {
        let fx = fixture("risk-value");
        // seed exposure: unconfirmed buy of 100 @ 10 = 1000 outstanding
        let ord = new_order(&fx, 1, 100.0, 10.0);
        fx.book.handle(
            Confirmation::status(ord, OrderStatus::UnconfirmedNew, "", 1),
            true,
        );
        let pos = fx.positions.sub_position(2, 10);
        assert_eq!(pos.value.total_outstanding_buy, 1000.0);

        let risk = AccountRisk {
            limits: crate::reference::Limits::parse("value=1500"),
            ..Default::default()
        };
        let ord2 = new_order(&fx, 2, 100.0, 10.0);
        // net 0, outstanding 1000, this order 1000 -> worst case 2000 > 1500
        let err = check_entity("sub_account", &ord2, &risk, pos).unwrap_err();
        assert!(matches!(err, RiskError::SecurityValue { .. }));
    }

    #[test]
    fn turnover_sums_both_sides() {
        let fx = fixture("risk-turnover");
        let pos = Position {
            value: crate::reference::PositionValue {
                total_bought: 400.0,
                total_sold: 500.0,
                total_outstanding_buy: 50.0,
                total_outstanding_sell: 25.0,
            },
            ..Default::default()
        };
        let risk = AccountRisk {
            limits: crate::reference::Limits::parse("turnover=1000"),
            ..Default::default()
        };
        let ord = new_order(&fx, 3, 10.0, 10.0); // value 100 -> total 1075
        let err = check_entity("sub_account", &ord, &risk, pos).unwrap_err();
        assert!(matches!(err, RiskError::SecurityTurnover { .. }));
    }

    #[test]
    fn msg_rate_counts_this_second() {
        let fx = fixture("risk-msgrate");
        let risk = AccountRisk {
            limits: crate::reference::Limits::parse("msg_rate=2"),
            ..Default::default()
        };
        let ord = new_order(&fx, 4, 1.0, 1.0);
        // retry if the wall clock crosses a second mid-check
        for _ in 0..5 {
            let now = unix_now();
            risk.throttle.update(now);
            risk.throttle.update(now);
            let result = check_entity("user", &ord, &risk, Position::default());
            if unix_now() == now {
                assert!(matches!(result, Err(RiskError::MsgRate { .. })));
                return;
            }
        }
        panic!("clock never held still for a full check");
    }

    #[test]
    fn disabled_rms_skips_checks() {
        let fx = fixture("risk-disabled");
        let risk = RiskManager::new(fx.positions.clone(), true);
        let ord = new_order(&fx, 5, 100.0, 1.0);
        assert!(risk.check(&ord).is_ok());
    }
}
