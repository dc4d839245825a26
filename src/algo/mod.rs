//! Strategy runtime contract: the `Algo` trait, typed parameters, and
//! the per-algo instrument bindings.

pub mod manager;

pub use manager::{AlgoManager, AlgoReplay};

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::marketdata::{DataSrc, MarketData};
use crate::orderbook::{Confirmation, Order, OrderDraft, OrderId, Side};
use crate::reference::{ReferenceCache, Security, SubAccount, User};

pub type AlgoId = u32;

/// The multi-typed target of an algo: what to trade, where, for whom.
#[derive(Clone)]
pub struct SecurityTuple {
    pub src: DataSrc,
    pub sec: Arc<Security>,
    pub sub_account: Arc<SubAccount>,
    pub side: Side,
    pub qty: f64,
}

/// Tagged parameter value passed through algo param maps.
#[derive(Clone)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Security(SecurityTuple),
    List(Vec<ParamValue>),
}

/// Declared type of a parameter.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Bool,
    Int,
    Float,
    Str,
    Security,
    /// A string drawn from a fixed choice list.
    Choice,
}

impl ParamKind {
    pub fn type_name(self) -> &'static str {
        match self {
            ParamKind::Bool => "bool",
            ParamKind::Int => "int",
            ParamKind::Float => "float",
            ParamKind::Str => "string",
            ParamKind::Security => "security",
            ParamKind::Choice => "vector",
        }
    }
}

/// Parameter schema entry with precision and bounds metadata, dumped to
/// clients as `algo_def`.
#[derive(Clone)]
pub struct ParamDef {
    pub name: &'static str,
    pub kind: ParamKind,
    pub default: Option<ParamValue>,
    pub choices: &'static [&'static str],
    pub required: bool,
    pub min: f64,
    pub max: f64,
    pub precision: i32,
}

impl ParamDef {
    pub fn new(name: &'static str, kind: ParamKind) -> ParamDef {
        ParamDef {
            name,
            kind,
            default: None,
            choices: &[],
            required: false,
            min: 0.0,
            max: 0.0,
            precision: 0,
        }
    }

    pub fn required(mut self) -> ParamDef {
        self.required = true;
        self
    }

    pub fn default_value(mut self, v: ParamValue) -> ParamDef {
        self.default = Some(v);
        self
    }

    pub fn bounds(mut self, min: f64, max: f64) -> ParamDef {
        self.min = min;
        self.max = max;
        self
    }

    pub fn precision(mut self, p: i32) -> ParamDef {
        self.precision = p;
        self
    }

    pub fn choices(mut self, choices: &'static [&'static str]) -> ParamDef {
        self.choices = choices;
        self
    }
}

pub type ParamDefs = Vec<ParamDef>;
pub type ParamMap = HashMap<String, ParamValue>;

pub fn param_f64(params: &ParamMap, name: &str) -> Option<f64> {
    match params.get(name)? {
        ParamValue::Float(v) => Some(*v),
        ParamValue::Int(v) => Some(*v as f64),
        _ => None,
    }
}

pub fn param_i64(params: &ParamMap, name: &str) -> Option<i64> {
    match params.get(name)? {
        ParamValue::Int(v) => Some(*v),
        ParamValue::Float(v) => Some(*v as i64),
        _ => None,
    }
}

pub fn param_str<'a>(params: &'a ParamMap, name: &str) -> Option<&'a str> {
    match params.get(name)? {
        ParamValue::Str(v) => Some(v),
        _ => None,
    }
}

pub fn param_security<'a>(params: &'a ParamMap, name: &str) -> Option<&'a SecurityTuple> {
    match params.get(name)? {
        ParamValue::Security(v) => Some(v),
        _ => None,
    }
}

/// Convert a client-supplied JSON object into a typed param map, driven
/// by the schema. Security tuples arrive as
/// `[src, security_id, sub_account, side, qty]`.
pub fn parse_param_map(
    defs: &ParamDefs,
    json: &serde_json::Value,
    cache: &ReferenceCache,
) -> Result<ParamMap, String> {
    let obj = json
        .as_object()
        .ok_or_else(|| "params must be an object".to_string())?;
    let mut out = ParamMap::new();
    for def in defs {
        let Some(value) = obj.get(def.name) else {
            if def.required {
                return Err(format!("missing required param: {}", def.name));
            }
            if let Some(default) = &def.default {
                out.insert(def.name.to_string(), default.clone());
            }
            continue;
        };
        let parsed = match def.kind {
            ParamKind::Bool => ParamValue::Bool(
                value
                    .as_bool()
                    .ok_or_else(|| format!("{} must be a bool", def.name))?,
            ),
            ParamKind::Int => {
                let v = value
                    .as_i64()
                    .ok_or_else(|| format!("{} must be an integer", def.name))?;
                check_bounds(def, v as f64)?;
                ParamValue::Int(v)
            }
            ParamKind::Float => {
                let v = value
                    .as_f64()
                    .ok_or_else(|| format!("{} must be a number", def.name))?;
                check_bounds(def, v)?;
                ParamValue::Float(v)
            }
            ParamKind::Str => ParamValue::Str(
                value
                    .as_str()
                    .ok_or_else(|| format!("{} must be a string", def.name))?
                    .to_string(),
            ),
            ParamKind::Choice => {
                let v = value
                    .as_str()
                    .ok_or_else(|| format!("{} must be a string", def.name))?;
                if !def.choices.is_empty() && !def.choices.contains(&v) {
                    return Err(format!(
                        "{} must be one of ({})",
                        def.name,
                        def.choices.join(", ")
                    ));
                }
                ParamValue::Str(v.to_string())
            }
            ParamKind::Security => {
                let arr = value
                    .as_array()
                    .filter(|a| a.len() >= 5)
                    .ok_or_else(|| {
                        format!("{} must be [src, security, sub_account, side, qty]", def.name)
                    })?;
                let src = DataSrc::from_tag(arr[0].as_str().unwrap_or(""))
                    .ok_or_else(|| format!("{}: bad src tag", def.name))?;
                let sec_id = arr[1]
                    .as_u64()
                    .ok_or_else(|| format!("{}: bad security id", def.name))?;
                let sec = cache
                    .security(sec_id as u32)
                    .ok_or_else(|| format!("{}: unknown security {}", def.name, sec_id))?
                    .clone();
                let sub_account = match &arr[2] {
                    serde_json::Value::String(name) => cache.sub_account_by_name(name),
                    serde_json::Value::Number(n) => {
                        cache.sub_account(n.as_u64().unwrap_or(0) as u16)
                    }
                    _ => None,
                }
                .ok_or_else(|| format!("{}: unknown sub account", def.name))?
                .clone();
                let side = Side::parse(arr[3].as_str().unwrap_or(""))
                    .ok_or_else(|| format!("{}: bad side", def.name))?;
                let qty = arr[4]
                    .as_f64()
                    .filter(|q| *q > 0.0)
                    .ok_or_else(|| format!("{}: bad qty", def.name))?;
                ParamValue::Security(SecurityTuple {
                    src,
                    sec,
                    sub_account,
                    side,
                    qty,
                })
            }
        };
        out.insert(def.name.to_string(), parsed);
    }
    Ok(out)
}

fn check_bounds(def: &ParamDef, v: f64) -> Result<(), String> {
    if def.min < def.max && (v < def.min || v > def.max) {
        return Err(format!(
            "{} out of range [{}, {}]",
            def.name, def.min, def.max
        ));
    }
    Ok(())
}

/// A strategy instance's binding to one `(source, security)`: the
/// algo's live order set plus its filled/outstanding quantities.
pub struct Instrument {
    pub algo_id: AlgoId,
    pub sec: Arc<Security>,
    pub src: DataSrc,
    state: Mutex<InstrumentState>,
}

#[derive(Default)]
pub struct InstrumentState {
    pub active_orders: HashSet<OrderId>,
    pub bought_qty: f64,
    pub sold_qty: f64,
    pub outstanding_buy_qty: f64,
    pub outstanding_sell_qty: f64,
}

impl Instrument {
    pub fn new(algo_id: AlgoId, sec: Arc<Security>, src: DataSrc) -> Arc<Instrument> {
        Arc::new(Instrument {
            algo_id,
            sec,
            src,
            state: Mutex::new(InstrumentState::default()),
        })
    }

    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut InstrumentState) -> R) -> R {
        f(&mut self.state.lock())
    }

    pub fn active_orders(&self) -> Vec<OrderId> {
        self.state.lock().active_orders.iter().copied().collect()
    }

    pub fn has_active_orders(&self) -> bool {
        !self.state.lock().active_orders.is_empty()
    }

    pub fn bought_qty(&self) -> f64 {
        self.state.lock().bought_qty
    }

    pub fn sold_qty(&self) -> f64 {
        self.state.lock().sold_qty
    }

    pub fn net_qty(&self) -> f64 {
        let st = self.state.lock();
        st.bought_qty - st.sold_qty
    }

    pub fn total_qty(&self) -> f64 {
        let st = self.state.lock();
        st.bought_qty + st.sold_qty
    }

    pub fn total_outstanding_qty(&self) -> f64 {
        let st = self.state.lock();
        st.outstanding_buy_qty + st.outstanding_sell_qty
    }

    pub fn total_exposure(&self) -> f64 {
        let st = self.state.lock();
        st.bought_qty + st.sold_qty + st.outstanding_buy_qty + st.outstanding_sell_qty
    }
}

/// Runtime handle handed to every strategy callback. All mutating calls
/// are ignored once the algo is stopped.
pub struct AlgoCtx {
    pub id: AlgoId,
    pub name: String,
    pub token: String,
    pub user: Arc<User>,
    active: AtomicBool,
    instruments: Mutex<Vec<Arc<Instrument>>>,
    mgr: Weak<AlgoManager>,
}

impl AlgoCtx {
    pub(crate) fn new(
        id: AlgoId,
        name: String,
        token: String,
        user: Arc<User>,
        mgr: Weak<AlgoManager>,
    ) -> Arc<AlgoCtx> {
        Arc::new(AlgoCtx {
            id,
            name,
            token,
            user,
            active: AtomicBool::new(true),
            instruments: Mutex::new(vec![]),
            mgr,
        })
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn deactivate(&self) -> bool {
        self.active.swap(false, Ordering::SeqCst)
    }

    pub fn instruments(&self) -> Vec<Arc<Instrument>> {
        self.instruments.lock().clone()
    }

    /// Snapshot of the instrument's `(source, security)` market data.
    pub fn market_data(&self, inst: &Instrument) -> MarketData {
        self.mgr
            .upgrade()
            .map(|m| m.hub().get(inst.sec.id, inst.src))
            .unwrap_or_default()
    }

    /// Look an order up by id in the process-wide book.
    pub fn order(&self, id: OrderId) -> Option<Arc<Order>> {
        self.mgr.upgrade().and_then(|m| m.order_book().get(id))
    }

    /// Bind to `(security, source)`: routes the hub subscription and
    /// registers the instrument with this algo's runner shard.
    pub fn subscribe(&self, sec: &Arc<Security>, src: DataSrc) -> Option<Arc<Instrument>> {
        let mgr = self.mgr.upgrade()?;
        let entry = mgr.hub().subscribe(sec, src)?;
        let inst = Instrument::new(self.id, sec.clone(), entry.src);
        self.instruments.lock().push(inst.clone());
        mgr.register_instrument(inst.clone());
        Some(inst)
    }

    /// Place a child order on an instrument. The draft's security is
    /// forced to the instrument's.
    pub fn place(&self, inst: &Arc<Instrument>, mut draft: OrderDraft) -> Option<Arc<Order>> {
        if !self.is_active() {
            return None;
        }
        let mgr = self.mgr.upgrade()?;
        draft.sec = inst.sec.clone();
        let is_buy = draft.side.is_buy();
        let qty = draft.qty;
        let ord = mgr
            .connectivity()
            .place(draft, self.user.clone(), self.id, Some(inst.clone()))?;
        inst.with_state(|st| {
            st.active_orders.insert(ord.id);
            if is_buy {
                st.outstanding_buy_qty += qty;
            } else {
                st.outstanding_sell_qty += qty;
            }
        });
        Some(ord)
    }

    pub fn cancel(&self, ord: &Arc<Order>) -> bool {
        match self.mgr.upgrade() {
            Some(mgr) => mgr.connectivity().cancel(ord),
            None => false,
        }
    }

    /// One-shot timer: `on_timer` fires on this algo's strand after
    /// `ms` milliseconds. Timers armed before a stop still fire; the
    /// strategy is expected to early-return on `!is_active()`.
    pub fn set_timeout(&self, ms: u64) {
        if let Some(mgr) = self.mgr.upgrade() {
            mgr.set_timeout(self.id, ms);
        }
    }

    pub fn stop(&self) {
        if let Some(mgr) = self.mgr.upgrade() {
            mgr.stop(self.id);
        }
    }
}

/// The strategy contract. Every callback runs on the algo's shard
/// strand: `on_start` strictly precedes everything else, callbacks
/// never interleave, and there is no suspension inside a callback.
pub trait Algo: Send {
    /// Returns an error string to fail the spawn; the runtime then
    /// stops the algo and journals `failed`.
    fn on_start(&mut self, ctx: &AlgoCtx, params: &ParamMap) -> Result<(), String>;

    fn on_stop(&mut self, _ctx: &AlgoCtx) {}

    fn on_market_trade(
        &mut self,
        _ctx: &AlgoCtx,
        _inst: &Arc<Instrument>,
        _md: &MarketData,
        _prev: &MarketData,
    ) {
    }

    fn on_market_quote(
        &mut self,
        _ctx: &AlgoCtx,
        _inst: &Arc<Instrument>,
        _md: &MarketData,
        _prev: &MarketData,
    ) {
    }

    fn on_confirmation(&mut self, _ctx: &AlgoCtx, _cm: &Confirmation) {}

    fn on_timer(&mut self, _ctx: &AlgoCtx) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instrument_aggregates() {
        let cache = crate::reference::ReferenceCache::load(
            &crate::reference::testkit::small_store(),
        )
        .unwrap();
        let inst = Instrument::new(1, cache.security(10).unwrap().clone(), DataSrc::DEFAULT);
        inst.with_state(|st| {
            st.bought_qty = 300.0;
            st.sold_qty = 100.0;
            st.outstanding_buy_qty = 50.0;
            st.outstanding_sell_qty = 25.0;
        });
        assert_eq!(inst.net_qty(), 200.0);
        assert_eq!(inst.total_qty(), 400.0);
        assert_eq!(inst.total_outstanding_qty(), 75.0);
        assert_eq!(inst.total_exposure(), 475.0);
    }

    #[test]
    fn param_map_parses_typed_values() {
        let cache = crate::reference::ReferenceCache::load(
            &crate::reference::testkit::small_store(),
        )
        .unwrap();
        let defs: ParamDefs = vec![
            ParamDef::new("Security", ParamKind::Security).required(),
            ParamDef::new("ValidSeconds", ParamKind::Int)
                .required()
                .default_value(ParamValue::Int(300))
                .bounds(60.0, 86400.0),
            ParamDef::new("Aggression", ParamKind::Choice)
                .required()
                .choices(&["Low", "Medium", "High", "Highest"]),
        ];
        let json = serde_json::json!({
            "Security": ["", 10, "book-a", "Buy", 1000.0],
            "ValidSeconds": 120,
            "Aggression": "Low",
        });
        let params = parse_param_map(&defs, &json, &cache).unwrap();
        let st = param_security(&params, "Security").unwrap();
        assert_eq!(st.sec.id, 10);
        assert_eq!(st.qty, 1000.0);
        assert_eq!(param_i64(&params, "ValidSeconds"), Some(120));
        assert_eq!(param_str(&params, "Aggression"), Some("Low"));

        // out of bounds
        let bad = serde_json::json!({
            "Security": ["", 10, "book-a", "Buy", 1000.0],
            "ValidSeconds": 10,
            "Aggression": "Low",
        });
        assert!(parse_param_map(&defs, &bad, &cache).is_err());

        // missing required
        let missing = serde_json::json!({ "ValidSeconds": 120, "Aggression": "Low" });
        assert!(parse_param_map(&defs, &missing, &cache).is_err());
    }
}
