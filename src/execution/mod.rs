//! Exchange connectivity: the Place/Cancel front door and the
//! normalisation of adapter callbacks into confirmations.

pub mod sim;

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::algo::{AlgoId, Instrument};
use crate::core::time::{now_utc_micros, unix_now};
use crate::marketdata::MarketDataHub;
use crate::orderbook::{
    Confirmation, ExecTransType, OrdType, Order, OrderBook, OrderDraft, OrderId, OrderStatus,
};
use crate::reference::{ReferenceCache, User};
use crate::risk::{RiskError, RiskManager};

/// Execution venue port. `place`/`cancel` return the synchronous
/// admission result: `Err` carries the venue's rejection reason.
/// Asynchronous outcomes arrive through the `handle_*` callbacks.
pub trait ExecutionAdapter: Send + Sync {
    fn start(&self);
    fn connected(&self) -> bool;
    fn reconnect(&self) {}
    fn place(&self, ord: &Order) -> Result<(), String>;
    fn cancel(&self, ord: &Order) -> Result<(), String>;
}

pub struct ConnectivityManager {
    adapters: RwLock<HashMap<String, Arc<dyn ExecutionAdapter>>>,
    cache: Arc<ReferenceCache>,
    book: Arc<OrderBook>,
    risk: Arc<RiskManager>,
    hub: Arc<MarketDataHub>,
}

impl ConnectivityManager {
    pub fn new(
        cache: Arc<ReferenceCache>,
        book: Arc<OrderBook>,
        risk: Arc<RiskManager>,
        hub: Arc<MarketDataHub>,
    ) -> Arc<ConnectivityManager> {
        Arc::new(ConnectivityManager {
            adapters: Default::default(),
            cache,
            book,
            risk,
            hub,
        })
    }

    pub fn add(&self, name: &str, adapter: Arc<dyn ExecutionAdapter>) {
        self.adapters.write().insert(name.to_string(), adapter);
    }

    pub fn adapter(&self, name: &str) -> Option<Arc<dyn ExecutionAdapter>> {
        let adapters = self.adapters.read();
        adapters
            .get(name)
            .or_else(|| adapters.get(&format!("ec_{}", name)))
            .cloned()
    }

    pub fn adapters(&self) -> Vec<(String, Arc<dyn ExecutionAdapter>)> {
        self.adapters
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn reject(&self, ord: Arc<Order>, reason: String) {
        warn!(order = ord.id, %reason, "order risk-rejected");
        self.book.handle(
            Confirmation::status(ord, OrderStatus::RiskRejected, &reason, now_utc_micros()),
            false,
        );
    }

    /// The Place front door: permission, broker resolution, price
    /// substitution, pre-trade risk, journal entry, adapter dispatch.
    /// Returns the live order on success.
    pub fn place(
        &self,
        draft: OrderDraft,
        user: Arc<User>,
        algo_id: AlgoId,
        inst: Option<Arc<Instrument>>,
    ) -> Option<Arc<Order>> {
        let mut draft = draft;
        if draft.qty <= 0.0 {
            let ord = Arc::new(Order::new(draft, user, None, algo_id, inst));
            self.reject(ord, "order quantity must be positive".into());
            return None;
        }
        if !user.permissioned(draft.sub_account.id) {
            let reason =
                RiskError::SubAccountNotPermissioned(draft.sub_account.name.clone()).to_string();
            let ord = Arc::new(Order::new(draft, user, None, algo_id, inst));
            self.reject(ord, reason);
            return None;
        }
        let broker = draft
            .sub_account
            .broker_for(draft.sec.exchange.id)
            .and_then(|id| self.cache.broker_account(id).cloned());
        let Some(broker) = broker else {
            let reason =
                RiskError::ExchangeNotPermissioned(draft.sec.exchange.name.clone()).to_string();
            let ord = Arc::new(Order::new(draft, user, None, algo_id, inst));
            self.reject(ord, reason);
            return None;
        };

        if draft.kind == OrdType::Otc {
            // self-matching: bypasses the adapter and the price checks
            let mut ord = Order::new(draft, user, Some(broker), algo_id, inst);
            ord.id = self.book.new_order_id();
            ord.tm = now_utc_micros();
            ord.set_leaves(ord.qty);
            let ord = Arc::new(ord);
            self.book.handle(
                Confirmation::status(ord.clone(), OrderStatus::UnconfirmedNew, "", ord.tm),
                false,
            );
            self.book.handle(
                Confirmation::fill(
                    ord.clone(),
                    ord.qty,
                    ord.price,
                    &format!("OTC-{}", ord.id),
                    false,
                    ExecTransType::New,
                    now_utc_micros(),
                ),
                false,
            );
            return Some(ord);
        }

        let adapter = self.adapter(&broker.adapter_name);
        let adapter = match adapter {
            Some(a) if a.connected() => a,
            Some(_) => {
                let reason = RiskError::AdapterDisconnected(broker.adapter_name.clone()).to_string();
                let ord = Arc::new(Order::new(draft, user, Some(broker), algo_id, inst));
                self.reject(ord, reason);
                return None;
            }
            None => {
                let reason = RiskError::AdapterMissing(broker.adapter_name.clone()).to_string();
                let ord = Arc::new(Order::new(draft, user, Some(broker), algo_id, inst));
                self.reject(ord, reason);
                return None;
            }
        };

        if draft.kind == OrdType::Market || draft.kind == OrdType::Stop {
            if draft.price <= 0.0 {
                draft.price = self.hub.current_price(&draft.sec);
                if draft.price <= 0.0 {
                    let reason = RiskError::NoReferencePrice.to_string();
                    let ord = Arc::new(Order::new(draft, user, Some(broker), algo_id, inst));
                    self.reject(ord, reason);
                    return None;
                }
            }
        } else if draft.price <= 0.0 {
            let reason = RiskError::MissingLimitPrice.to_string();
            let ord = Arc::new(Order::new(draft, user, Some(broker), algo_id, inst));
            self.reject(ord, reason);
            return None;
        }

        let mut ord = Order::new(draft, user, Some(broker), algo_id, inst);
        if let Err(e) = self.risk.check(&ord) {
            self.reject(Arc::new(ord), e.to_string());
            return None;
        }
        ord.id = self.book.new_order_id();
        ord.tm = now_utc_micros();
        ord.set_leaves(ord.qty);
        let ord = Arc::new(ord);
        self.book.handle(
            Confirmation::status(ord.clone(), OrderStatus::UnconfirmedNew, "", ord.tm),
            false,
        );
        match adapter.place(&ord) {
            Ok(()) => {
                update_throttles(&ord);
                Some(ord)
            }
            Err(reason) => {
                self.reject(ord, reason);
                None
            }
        }
    }

    /// Cancel rides on a shadow order cloned from the original with
    /// `orig_id` pointing back. Cancel of a non-live order is a no-op.
    pub fn cancel(&self, orig: &Arc<Order>) -> bool {
        if !orig.is_live() {
            return false;
        }
        let Some(broker) = orig.broker_account.clone() else {
            return false;
        };
        let tm = now_utc_micros();
        let adapter = self.adapter(&broker.adapter_name);
        let adapter = match adapter {
            Some(a) if a.connected() => a,
            Some(_) => {
                let reason = RiskError::AdapterDisconnected(broker.adapter_name.clone()).to_string();
                self.reject(Arc::new(Order::cancel_shadow(orig, 0, tm)), reason);
                return false;
            }
            None => {
                let reason = RiskError::AdapterMissing(broker.adapter_name.clone()).to_string();
                self.reject(Arc::new(Order::cancel_shadow(orig, 0, tm)), reason);
                return false;
            }
        };
        if let Err(e) = self.risk.check_msg_rate(orig) {
            self.reject(Arc::new(Order::cancel_shadow(orig, 0, tm)), e.to_string());
            return false;
        }
        let shadow = Arc::new(Order::cancel_shadow(orig, self.book.new_order_id(), tm));
        self.book.handle(
            Confirmation::status(shadow.clone(), OrderStatus::UnconfirmedCancel, "", tm),
            false,
        );
        match adapter.cancel(&shadow) {
            Ok(()) => {
                update_throttles(orig);
                true
            }
            Err(reason) => {
                self.reject(shadow, reason);
                false
            }
        }
    }

    fn resolve(&self, id: OrderId, what: &str) -> Option<Arc<Order>> {
        let ord = self.book.get(id);
        if ord.is_none() {
            debug!(id, what, "unknown client order id in confirmation, ignored");
        }
        ord
    }

    /// Resolve a cancel-family callback: when only the cancel's own id
    /// is known, walk `orig_id` back to the original order.
    fn resolve_orig(&self, id: OrderId, orig_id: OrderId, what: &str) -> Option<Arc<Order>> {
        let orig_id = if orig_id != 0 {
            orig_id
        } else {
            let ord = self.resolve(id, what)?;
            if ord.orig_id != 0 {
                ord.orig_id
            } else {
                id
            }
        };
        self.resolve(orig_id, what)
    }

    fn emit(&self, ord: Arc<Order>, exec_type: OrderStatus, text: &str, tm: i64) {
        let tm = if tm != 0 { tm } else { now_utc_micros() };
        self.book
            .handle(Confirmation::status(ord, exec_type, text, tm), false);
    }

    pub fn handle_new(&self, id: OrderId, venue_order_id: &str, tm: i64) {
        if let Some(ord) = self.resolve(id, "new") {
            self.emit(ord, OrderStatus::New, venue_order_id, tm);
        }
    }

    pub fn handle_pending_new(&self, id: OrderId, text: &str, tm: i64) {
        if let Some(ord) = self.resolve(id, "pending new") {
            self.emit(ord, OrderStatus::PendingNew, text, tm);
        }
    }

    pub fn handle_pending_cancel(&self, id: OrderId, orig_id: OrderId, tm: i64) {
        if let Some(ord) = self.resolve_orig(id, orig_id, "pending cancel") {
            self.emit(ord, OrderStatus::PendingCancel, "", tm);
        }
    }

    pub fn handle_canceled(&self, id: OrderId, orig_id: OrderId, text: &str, tm: i64) {
        if let Some(ord) = self.resolve_orig(id, orig_id, "canceled") {
            self.emit(ord, OrderStatus::Canceled, text, tm);
        }
    }

    pub fn handle_new_rejected(&self, id: OrderId, text: &str, tm: i64) {
        if let Some(ord) = self.resolve(id, "rejected") {
            self.emit(ord, OrderStatus::Rejected, text, tm);
        }
    }

    pub fn handle_cancel_rejected(&self, id: OrderId, orig_id: OrderId, text: &str, tm: i64) {
        if let Some(ord) = self.resolve_orig(id, orig_id, "cancel rejected") {
            self.emit(ord, OrderStatus::CancelRejected, text, tm);
        }
    }

    pub fn handle_others(&self, id: OrderId, exec_type: OrderStatus, text: &str, tm: i64) {
        if let Some(ord) = self.resolve(id, "status") {
            self.emit(ord, exec_type, text, tm);
        }
    }

    pub fn handle_fill(
        &self,
        id: OrderId,
        qty: f64,
        px: f64,
        exec_id: &str,
        tm: i64,
        is_partial: bool,
        exec_trans_type: ExecTransType,
    ) {
        if self.book.is_dup_exec_id(exec_id) {
            debug!(exec_id, "duplicate exec id, ignored");
            return;
        }
        let Some(ord) = self.resolve(id, "fill") else {
            return;
        };
        if qty <= 0.0 || px <= 0.0 {
            debug!(id, qty, px, "invalid fill confirmation, ignored");
            return;
        }
        let tm = if tm != 0 { tm } else { now_utc_micros() };
        self.book.handle(
            Confirmation::fill(ord, qty, px, exec_id, is_partial, exec_trans_type, tm),
            false,
        );
    }

    /// Cancel every live order; used by the admin shutdown sweep.
    pub fn cancel_all(&self) {
        for ord in self.book.live_orders() {
            self.cancel(&ord);
        }
    }
}

fn update_throttles(ord: &Order) {
    let now = unix_now();
    let entities = [
        Some(&ord.sub_account.risk),
        ord.broker_account.as_ref().map(|b| &b.risk),
        Some(&ord.user.risk),
    ];
    for risk in entities.into_iter().flatten() {
        risk.throttle.update(now);
        if risk.limits.msg_rate_per_security > 0.0 {
            risk.sec_throttles.update(ord.sec.id, now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orderbook::testkit::{draft, fixture, Fixture};
    use parking_lot::Mutex;

    /// Records admissions; outcomes are driven manually by the test.
    struct RecordingAdapter {
        placed: Mutex<Vec<OrderId>>,
        canceled: Mutex<Vec<OrderId>>,
        up: std::sync::atomic::AtomicBool,
    }

    impl RecordingAdapter {
        fn new() -> Arc<RecordingAdapter> {
            Arc::new(RecordingAdapter {
                placed: Mutex::new(vec![]),
                canceled: Mutex::new(vec![]),
                up: std::sync::atomic::AtomicBool::new(true),
            })
        }
    }

    impl ExecutionAdapter for RecordingAdapter {
        fn start(&self) {}
        fn connected(&self) -> bool {
            self.up.load(std::sync::atomic::Ordering::SeqCst)
        }
        fn place(&self, ord: &Order) -> Result<(), String> {
            self.placed.lock().push(ord.id);
            Ok(())
        }
        fn cancel(&self, ord: &Order) -> Result<(), String> {
            self.canceled.lock().push(ord.id);
            Ok(())
        }
    }

    fn wired(tag: &str) -> (Fixture, Arc<ConnectivityManager>, Arc<RecordingAdapter>) {
        let fx = fixture(tag);
        let risk = RiskManager::new(fx.positions.clone(), false);
        let ecm = ConnectivityManager::new(
            fx.cache.clone(),
            fx.book.clone(),
            risk,
            fx.hub.clone(),
        );
        let adapter = RecordingAdapter::new();
        ecm.add("ec_sim", adapter.clone());
        (fx, ecm, adapter)
    }

    #[test]
    fn place_journals_unconfirmed_then_dispatches() {
        let (fx, ecm, adapter) = wired("ecm-place");
        let user = fx.cache.user(1).unwrap().clone();
        let ord = ecm.place(draft(&fx, 100.0, 10.0), user, 0, None).unwrap();
        assert!(ord.id > 0);
        assert_eq!(ord.status(), OrderStatus::UnconfirmedNew);
        assert_eq!(ord.state().leaves_qty, 100.0);
        assert_eq!(*adapter.placed.lock(), vec![ord.id]);
        ecm.handle_pending_new(ord.id, "", 0);
        assert_eq!(ord.status(), OrderStatus::PendingNew);
        // outstanding exposure recorded
        let pos = fx.positions.sub_position(2, 10);
        assert_eq!(pos.total_outstanding_buy_qty, 100.0);
    }

    #[test]
    fn full_fill_flows_to_positions() {
        let (fx, ecm, _adapter) = wired("ecm-fill");
        let user = fx.cache.user(1).unwrap().clone();
        let ord = ecm.place(draft(&fx, 100.0, 10.0), user, 0, None).unwrap();
        ecm.handle_new(ord.id, "V1", 0);
        assert_eq!(ord.status(), OrderStatus::New);
        ecm.handle_fill(ord.id, 100.0, 10.0, "E1", 0, false, ExecTransType::New);
        let st = ord.state();
        assert_eq!(st.status, OrderStatus::Filled);
        assert_eq!(st.cum_qty, 100.0);
        assert_eq!(st.avg_px, 10.0);
        assert_eq!(st.leaves_qty, 0.0);
        let pos = fx.positions.user_position(1, 10);
        assert_eq!(pos.qty, 100.0);
        assert_eq!(pos.avg_price, 10.0);
        // duplicate exec id is a no-op
        ecm.handle_fill(ord.id, 100.0, 10.0, "E1", 0, false, ExecTransType::New);
        assert_eq!(ord.state().cum_qty, 100.0);
        assert_eq!(fx.positions.user_position(1, 10).qty, 100.0);
    }

    #[test]
    fn risk_breach_never_reaches_the_adapter() {
        let fx = {
            let mut store = crate::reference::testkit::small_store();
            store.users[0].limits = "order_qty=500".into();
            let dir = std::env::temp_dir().join(format!(
                "meridian-ecm-risk-{}",
                std::process::id()
            ));
            let _ = std::fs::remove_dir_all(&dir);
            std::fs::create_dir_all(&dir).unwrap();
            crate::orderbook::testkit::fixture_in(store, dir)
        };
        let risk = RiskManager::new(fx.positions.clone(), false);
        let ecm =
            ConnectivityManager::new(fx.cache.clone(), fx.book.clone(), risk, fx.hub.clone());
        let adapter = RecordingAdapter::new();
        ecm.add("ec_sim", adapter.clone());
        let user = fx.cache.user(1).unwrap().clone();
        assert!(ecm.place(draft(&fx, 600.0, 1.0), user, 0, None).is_none());
        assert!(adapter.placed.lock().is_empty());
    }

    #[test]
    fn otc_fills_immediately_without_adapter() {
        let (fx, ecm, adapter) = wired("ecm-otc");
        let user = fx.cache.user(1).unwrap().clone();
        let mut d = draft(&fx, 50.0, 9.5);
        d.kind = OrdType::Otc;
        let ord = ecm.place(d, user, 0, None).unwrap();
        assert!(adapter.placed.lock().is_empty());
        let st = ord.state();
        assert_eq!(st.status, OrderStatus::Filled);
        assert_eq!(st.cum_qty, 50.0);
        assert_eq!(st.avg_px, 9.5);
        // OTC position carries qty and pnl but no turnover counters
        let pos = fx.positions.sub_position(2, 10);
        assert_eq!(pos.qty, 50.0);
        assert_eq!(pos.value.total_bought, 0.0);
    }

    #[test]
    fn market_order_without_price_is_risk_rejected() {
        let (fx, ecm, adapter) = wired("ecm-market");
        let user = fx.cache.user(1).unwrap().clone();
        let mut d = draft(&fx, 10.0, 0.0);
        d.kind = OrdType::Market;
        d.sec = {
            // close price zero and no market data: nothing to substitute
            let mut store = crate::reference::testkit::small_store();
            store.securities[0].close_price = 0.0;
            let cache = crate::reference::ReferenceCache::load(&store).unwrap();
            cache.security(10).unwrap().clone()
        };
        assert!(ecm.place(d, user, 0, None).is_none());
        assert!(adapter.placed.lock().is_empty());
    }

    #[test]
    fn limit_order_without_price_is_risk_rejected() {
        let (fx, ecm, _) = wired("ecm-limit");
        let user = fx.cache.user(1).unwrap().clone();
        assert!(ecm.place(draft(&fx, 10.0, 0.0), user, 0, None).is_none());
    }

    #[test]
    fn cancel_of_terminal_order_is_refused() {
        let (fx, ecm, adapter) = wired("ecm-cancel");
        let user = fx.cache.user(1).unwrap().clone();
        let ord = ecm.place(draft(&fx, 100.0, 10.0), user, 0, None).unwrap();
        ecm.handle_fill(ord.id, 100.0, 10.0, "E9", 0, false, ExecTransType::New);
        assert!(!ecm.cancel(&ord));
        assert!(adapter.canceled.lock().is_empty());
    }

    #[test]
    fn cancel_travels_on_a_shadow_order() {
        let (fx, ecm, adapter) = wired("ecm-shadow");
        let user = fx.cache.user(1).unwrap().clone();
        let ord = ecm.place(draft(&fx, 100.0, 10.0), user, 0, None).unwrap();
        ecm.handle_new(ord.id, "V1", 0);
        assert!(ecm.cancel(&ord));
        let shadow_id = *adapter.canceled.lock().first().unwrap();
        assert_ne!(shadow_id, ord.id);
        let shadow = fx.book.get(shadow_id).unwrap();
        assert_eq!(shadow.orig_id, ord.id);
        // venue acks the cancel against the cancel's own id
        ecm.handle_pending_cancel(shadow_id, 0, 0);
        assert_eq!(ord.status(), OrderStatus::PendingCancel);
        ecm.handle_canceled(shadow_id, 0, "", 0);
        assert_eq!(ord.status(), OrderStatus::Canceled);
        assert_eq!(ord.state().leaves_qty, 0.0);
    }

    #[test]
    fn expiry_releases_outstanding_exposure() {
        let (fx, ecm, _) = wired("ecm-expire");
        let user = fx.cache.user(1).unwrap().clone();
        let ord = ecm.place(draft(&fx, 100.0, 10.0), user, 0, None).unwrap();
        assert_eq!(fx.positions.sub_position(2, 10).total_outstanding_buy_qty, 100.0);
        ecm.handle_others(ord.id, OrderStatus::Expired, "end of day", 0);
        assert_eq!(ord.status(), OrderStatus::Expired);
        assert_eq!(ord.state().leaves_qty, 0.0);
        assert_eq!(fx.positions.sub_position(2, 10).total_outstanding_buy_qty, 0.0);
    }

    #[test]
    fn disconnected_adapter_rejects_upfront() {
        let (fx, ecm, adapter) = wired("ecm-down");
        adapter
            .up
            .store(false, std::sync::atomic::Ordering::SeqCst);
        let user = fx.cache.user(1).unwrap().clone();
        assert!(ecm.place(draft(&fx, 10.0, 10.0), user, 0, None).is_none());
        assert!(adapter.placed.lock().is_empty());
    }
}
