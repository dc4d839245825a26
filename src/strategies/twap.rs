//! Time-weighted average price: slices a parent order over a fixed
//! horizon, one admin action per one-second tick.

use std::sync::Arc;
use tracing::debug;

use crate::algo::{
    param_f64, param_i64, param_security, param_str, Algo, AlgoCtx, Instrument, ParamDef,
    ParamDefs, ParamKind, ParamMap, ParamValue,
};
use crate::core::time::unix_now;
use crate::marketdata::MarketData;
use crate::orderbook::{Confirmation, OrdType, OrderDraft, Side, Tif};
use crate::reference::SubAccount;

/// Child-order pricing policy: join, mid, cross, or market.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggression {
    Low,
    Medium,
    High,
    Highest,
}

impl Aggression {
    fn parse(s: &str) -> Option<Aggression> {
        match s {
            "Low" => Some(Aggression::Low),
            "Medium" => Some(Aggression::Medium),
            "High" => Some(Aggression::High),
            "Highest" => Some(Aggression::Highest),
            _ => None,
        }
    }
}

pub fn param_defs() -> ParamDefs {
    vec![
        ParamDef::new("Security", ParamKind::Security).required(),
        ParamDef::new("Price", ParamKind::Float)
            .bounds(0.0, 10_000_000.0)
            .precision(7),
        ParamDef::new("ValidSeconds", ParamKind::Int)
            .required()
            .default_value(ParamValue::Int(300))
            .bounds(60.0, 86400.0),
        ParamDef::new("MinSize", ParamKind::Float).bounds(0.0, 10_000_000.0),
        ParamDef::new("MaxPov", ParamKind::Float)
            .bounds(0.0, 1.0)
            .precision(2),
        ParamDef::new("Aggression", ParamKind::Choice)
            .required()
            .choices(&["Low", "Medium", "High", "Highest"]),
    ]
}

#[derive(Default)]
pub struct Twap {
    inst: Option<Arc<Instrument>>,
    acc: Option<Arc<SubAccount>>,
    side: Option<Side>,
    qty: f64,
    price_cap: f64,
    begin_time: i64,
    end_time: i64,
    min_size: f64,
    max_pov: f64,
    initial_volume: f64,
    agg: Option<Aggression>,
}

impl Algo for Twap {
    fn on_start(&mut self, ctx: &AlgoCtx, params: &ParamMap) -> Result<(), String> {
        let st = param_security(params, "Security")
            .ok_or_else(|| "Security required".to_string())?;
        let sec = st.sec.clone();
        self.acc = Some(st.sub_account.clone());
        self.side = Some(st.side);
        self.qty = st.qty;
        if self.qty <= 0.0 {
            return Err("Security qty must be positive".into());
        }
        self.inst = Some(
            ctx.subscribe(&sec, st.src)
                .ok_or_else(|| "no market data route for security".to_string())?,
        );
        let seconds = param_i64(params, "ValidSeconds").unwrap_or(0);
        if seconds < 60 {
            return Err("Too short ValidSeconds, must be >= 60".into());
        }
        self.begin_time = unix_now();
        self.end_time = self.begin_time + seconds;
        self.price_cap = param_f64(params, "Price").unwrap_or(0.0);
        self.min_size = param_f64(params, "MinSize").unwrap_or(0.0);
        if self.min_size <= 0.0 && sec.lot_size <= 0 {
            return Err("MinSize required for security without lot size".into());
        }
        if self.min_size > 0.0 && sec.lot_size > 0 {
            let lot = f64::from(sec.lot_size);
            self.min_size = (self.min_size / lot).round() * lot;
        }
        self.max_pov = param_f64(params, "MaxPov").unwrap_or(0.0).min(1.0);
        let agg = param_str(params, "Aggression")
            .and_then(Aggression::parse)
            .ok_or_else(|| {
                "Invalid aggression, must be in (Low, Medium, High, Highest)".to_string()
            })?;
        self.agg = Some(agg);
        self.tick(ctx);
        debug!(algo = ctx.id, "twap started");
        Ok(())
    }

    fn on_stop(&mut self, ctx: &AlgoCtx) {
        debug!(algo = ctx.id, "twap stopped");
    }

    fn on_market_trade(
        &mut self,
        _ctx: &AlgoCtx,
        _inst: &Arc<Instrument>,
        md: &MarketData,
        _prev: &MarketData,
    ) {
        // latch the session volume seen at start, for the pov cap
        if self.initial_volume <= 0.0 {
            self.initial_volume = md.trade.volume;
        }
    }

    fn on_confirmation(&mut self, ctx: &AlgoCtx, _cm: &Confirmation) {
        if let Some(inst) = &self.inst {
            if inst.total_qty() >= self.qty {
                ctx.stop();
            }
        }
    }

    fn on_timer(&mut self, ctx: &AlgoCtx) {
        self.tick(ctx);
    }
}

impl Twap {
    /// One scheduling step.
    fn tick(&mut self, ctx: &AlgoCtx) {
        if !ctx.is_active() {
            return;
        }
        let now = unix_now();
        if now > self.end_time {
            ctx.stop();
            return;
        }
        ctx.set_timeout(1000);
        let (Some(inst), Some(side), Some(acc), Some(agg)) =
            (self.inst.clone(), self.side, self.acc.clone(), self.agg)
        else {
            return;
        };
        if !inst.sec.in_trade_period() {
            return;
        }

        let md = ctx.market_data(&inst);
        let bid = md.quote().bid_price;
        let ask = md.quote().ask_price;
        let last_px = md.trade.close;
        let is_buy = side.is_buy();
        let mut mid_px = 0.0;
        if ask > bid && bid > 0.0 {
            mid_px = (ask + bid) / 2.0;
            let tick_size = inst.sec.tick_size(mid_px);
            if tick_size > 0.0 {
                mid_px = if is_buy {
                    (mid_px / tick_size).ceil() * tick_size
                } else {
                    (mid_px / tick_size).floor() * tick_size
                };
            }
        }

        // one admin action per tick: reprice by cancelling strays first
        if inst.has_active_orders() {
            for oid in inst.active_orders() {
                let Some(ord) = ctx.order(oid) else {
                    continue;
                };
                if is_buy {
                    if ord.price < bid {
                        ctx.cancel(&ord);
                    }
                } else if ask > 0.0 && ord.price > ask {
                    ctx.cancel(&ord);
                }
            }
            return;
        }

        if self.initial_volume > 0.0 && self.max_pov > 0.0 {
            let traded = md.trade.volume - self.initial_volume;
            if inst.total_qty() > self.max_pov * traded {
                return;
            }
        }

        let horizon = (self.end_time - self.begin_time) as f64;
        let ratio = (((now - self.begin_time) as f64 + 1.0) / horizon).min(1.0);
        let expect = self.qty * ratio;
        let leaves = expect - inst.total_exposure();
        if leaves <= 0.0 {
            return;
        }
        let total_leaves = self.qty - inst.total_exposure();
        let lot = f64::from(inst.sec.lot_size.max(1));
        let max_qty = if inst.sec.exchange.odd_lot_allowed {
            total_leaves
        } else {
            (total_leaves / lot).floor() * lot
        };
        if max_qty <= 0.0 {
            return;
        }
        let mut would_qty = (leaves / lot).ceil() * lot;
        if would_qty < self.min_size {
            would_qty = self.min_size;
        }
        if would_qty > max_qty {
            would_qty = max_qty;
        }

        let mut kind = OrdType::Limit;
        let mut price = 0.0;
        match agg {
            Aggression::Low => {
                let join = if is_buy { bid } else { ask };
                if join > 0.0 {
                    price = join;
                } else if last_px > 0.0 {
                    price = last_px;
                } else {
                    return;
                }
            }
            Aggression::Medium if mid_px > 0.0 => price = mid_px,
            Aggression::Medium | Aggression::High => {
                // cross, or fall through to market when the far side is empty
                let cross = if is_buy { ask } else { bid };
                if cross > 0.0 {
                    price = cross;
                } else {
                    kind = OrdType::Market;
                }
            }
            Aggression::Highest => kind = OrdType::Market,
        }

        if self.price_cap > 0.0
            && ((is_buy && price > self.price_cap) || (!is_buy && price < self.price_cap))
        {
            return;
        }

        ctx.place(
            &inst,
            OrderDraft {
                sec: inst.sec.clone(),
                sub_account: acc,
                side,
                kind,
                tif: Tif::Day,
                qty: would_qty,
                price,
                stop_price: 0.0,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggression_parses_exact_names_only() {
        assert_eq!(Aggression::parse("Low"), Some(Aggression::Low));
        assert_eq!(Aggression::parse("Highest"), Some(Aggression::Highest));
        assert_eq!(Aggression::parse("low"), None);
        assert_eq!(Aggression::parse(""), None);
    }

    #[test]
    fn param_schema_shape() {
        let defs = param_defs();
        assert_eq!(defs.len(), 6);
        let valid = defs.iter().find(|d| d.name == "ValidSeconds").unwrap();
        assert!(valid.required);
        assert_eq!(valid.min, 60.0);
        let agg = defs.iter().find(|d| d.name == "Aggression").unwrap();
        assert_eq!(agg.choices.len(), 4);
    }
}
