//! Position engine: per-entity positions, realized/unrealized P&L, and
//! the periodic mark-to-market loop.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

use crate::core::time::unix_now;
use crate::core::{Error, Result};
use crate::marketdata::MarketDataHub;
use crate::orderbook::{Confirmation, ExecTransType, OrdType, OrderStatus};
use crate::reference::{
    BrokerAccountId, PositionRow, PositionValue, ReferenceCache, ReferenceStore, SecurityId,
    SubAccountId, UserId,
};
use crate::runtime::TaskPool;

/// Per `(entity, security)` position. The four quantity counters track
/// intraday activity; the embedded value counters mirror them in the
/// reference numeraire.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Position {
    pub qty: f64,
    pub avg_price: f64,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub total_bought_qty: f64,
    pub total_sold_qty: f64,
    pub total_outstanding_buy_qty: f64,
    pub total_outstanding_sell_qty: f64,
    pub value: PositionValue,
}

/// Close-then-open: a trade first realizes P&L against the open
/// position, then any remainder re-opens at the trade price.
fn handle_pnl(pos: &mut Position, qty: f64, price: f64, multiplier: f64) {
    let qty0 = pos.qty;
    if qty0 > 0.0 && qty < 0.0 {
        if qty0 > -qty {
            pos.realized_pnl += (price - pos.avg_price) * -qty * multiplier;
        } else {
            pos.realized_pnl += (price - pos.avg_price) * qty0 * multiplier;
            pos.avg_price = price;
        }
    } else if qty0 < 0.0 && qty > 0.0 {
        if -qty0 > qty {
            pos.realized_pnl += (pos.avg_price - price) * qty * multiplier;
        } else {
            pos.realized_pnl += (pos.avg_price - price) * -qty0 * multiplier;
            pos.avg_price = price;
        }
    } else if qty0 + qty != 0.0 {
        pos.avg_price = (qty0 * pos.avg_price + qty * price) / (qty0 + qty);
    }
}

impl Position {
    pub fn handle_new(&mut self, is_buy: bool, qty: f64, price: f64, multiplier: f64) {
        if is_buy {
            self.total_outstanding_buy_qty += qty;
        } else {
            self.total_outstanding_sell_qty += qty;
        }
        self.value.handle_new(is_buy, qty, price, multiplier);
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
        self.value
            .handle_trade(is_buy, qty, price, price0, multiplier, is_bust, is_otc);
        let mut signed = if is_buy { qty } else { -qty };
        if is_otc {
            // self-matched: no outstanding to move
        } else if !is_bust {
            if signed > 0.0 {
                self.total_outstanding_buy_qty -= signed;
                self.total_bought_qty += signed;
            } else {
                self.total_outstanding_sell_qty -= -signed;
                self.total_sold_qty += -signed;
            }
        } else if signed > 0.0 {
            self.total_bought_qty -= signed;
        } else {
            self.total_sold_qty -= -signed;
        }
        if is_bust {
            signed = -signed;
        }
        handle_pnl(self, signed, price, multiplier);
        self.qty += signed;
    }

    pub fn handle_finish(&mut self, is_buy: bool, leaves_qty: f64, price0: f64, multiplier: f64) {
        if is_buy {
            self.total_outstanding_buy_qty -= leaves_qty;
        } else {
            self.total_outstanding_sell_qty -= leaves_qty;
        }
        self.value.handle_finish(is_buy, leaves_qty, price0, multiplier);
    }
}

/// Beginning-of-day snapshot per `(sub-account, security)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Bod {
    pub qty: f64,
    pub avg_price: f64,
    pub realized_pnl: f64,
    pub broker_account_id: BrokerAccountId,
    pub tm: i64,
}

struct PnlEntry {
    realized: f64,
    unrealized: f64,
    file: Option<File>,
}

pub struct PositionManager {
    sub: RwLock<HashMap<(SubAccountId, SecurityId), Position>>,
    broker: RwLock<HashMap<(BrokerAccountId, SecurityId), Position>>,
    user: RwLock<HashMap<(UserId, SecurityId), Position>>,
    bods: RwLock<HashMap<(SubAccountId, SecurityId), Bod>>,
    pnls: Mutex<HashMap<SubAccountId, PnlEntry>>,
    /// Serializes position mutation against concurrent adapter threads.
    mutation: Mutex<()>,
    session: String,
    session_tm: i64,
    store_dir: PathBuf,
    store: Arc<dyn ReferenceStore>,
    cache: Arc<ReferenceCache>,
    hub: Arc<MarketDataHub>,
    db_writer: TaskPool,
}

impl PositionManager {
    pub fn new(
        store: Arc<dyn ReferenceStore>,
        cache: Arc<ReferenceCache>,
        hub: Arc<MarketDataHub>,
        store_dir: &Path,
    ) -> Result<Arc<PositionManager>> {
        let (session, session_tm) = Self::load_session(store_dir)?;
        info!(session = %session, "session time (utc)");

        let mgr = PositionManager {
            sub: Default::default(),
            broker: Default::default(),
            user: Default::default(),
            bods: Default::default(),
            pnls: Default::default(),
            mutation: Mutex::new(()),
            session,
            session_tm,
            store_dir: store_dir.to_path_buf(),
            store,
            cache,
            hub,
            db_writer: TaskPool::new("position-writer"),
        };
        mgr.load_bods()?;
        Ok(Arc::new(mgr))
    }

    /// The session file pins the BoD cutoff for the whole process
    /// lifetime, so a restart within the day keeps the same BoD.
    fn load_session(store_dir: &Path) -> Result<(String, i64)> {
        const FMT: &str = "%Y-%m-%d %H:%M:%S";
        let path = store_dir.join("session");
        if let Ok(content) = std::fs::read_to_string(&path) {
            let text = content.trim().to_string();
            let tm = chrono::NaiveDateTime::parse_from_str(&text, FMT)
                .map_err(|e| Error::Store(format!("bad session file: {}", e)))?;
            return Ok((text, tm.and_utc().timestamp()));
        }
        let now = chrono::Utc::now();
        let text = now.format(FMT).to_string();
        std::fs::write(&path, &text)
            .map_err(|e| Error::Store(format!("failed to write {}: {}", path.display(), e)))?;
        info!("created new session");
        Ok((text, now.timestamp()))
    }

    fn load_bods(&self) -> Result<()> {
        let rows = self.store.latest_positions(self.session_tm)?;
        let mut bods = self.bods.write();
        let mut sub = self.sub.write();
        let mut broker = self.broker.write();
        for row in rows {
            let Some(sec) = self.cache.security(row.security_id) else {
                continue;
            };
            let pos = Position {
                qty: row.qty,
                avg_price: row.avg_price,
                realized_pnl: row.realized_pnl,
                ..Default::default()
            };
            bods.insert(
                (row.sub_account_id, row.security_id),
                Bod {
                    qty: row.qty,
                    avg_price: row.avg_price,
                    realized_pnl: row.realized_pnl,
                    broker_account_id: row.broker_account_id,
                    tm: row.tm,
                },
            );
            sub.insert((row.sub_account_id, row.security_id), pos);
            let agg = broker
                .entry((row.broker_account_id, row.security_id))
                .or_default();
            agg.realized_pnl += row.realized_pnl;
            handle_pnl(agg, row.qty, row.avg_price, sec.multiplier * sec.rate);
            agg.qty += row.qty;
        }
        info!(bods = bods.len(), "beginning-of-day positions loaded");
        Ok(())
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn store_dir(&self) -> &Path {
        &self.store_dir
    }

    pub fn sub_position(&self, acc: SubAccountId, sec: SecurityId) -> Position {
        self.sub.read().get(&(acc, sec)).copied().unwrap_or_default()
    }

    pub fn broker_position(&self, acc: BrokerAccountId, sec: SecurityId) -> Position {
        self.broker
            .read()
            .get(&(acc, sec))
            .copied()
            .unwrap_or_default()
    }

    pub fn user_position(&self, user: UserId, sec: SecurityId) -> Position {
        self.user
            .read()
            .get(&(user, sec))
            .copied()
            .unwrap_or_default()
    }

    pub fn sub_positions(&self) -> Vec<((SubAccountId, SecurityId), Position)> {
        self.sub.read().iter().map(|(k, v)| (*k, *v)).collect()
    }

    pub fn bods(&self) -> Vec<((SubAccountId, SecurityId), Bod)> {
        self.bods.read().iter().map(|(k, v)| (*k, *v)).collect()
    }

    pub fn pnls(&self) -> Vec<(SubAccountId, (f64, f64))> {
        self.pnls
            .lock()
            .iter()
            .map(|(k, v)| (*k, (v.realized, v.unrealized)))
            .collect()
    }

    /// Apply one confirmation to every keyed map and the per-entity
    /// aggregates. Called from the order book on every transition.
    pub fn handle(&self, cm: &Arc<Confirmation>, offline: bool) {
        let ord = &cm.order;
        let sec = &ord.sec;
        let multiplier = sec.rate * sec.multiplier;
        let is_buy = ord.is_buy();
        let is_otc = ord.kind == OrdType::Otc;
        let _guard = self.mutation.lock();
        match cm.exec_type {
            OrderStatus::PartiallyFilled | OrderStatus::Filled => {
                let is_bust = match cm.exec_trans_type {
                    ExecTransType::New => false,
                    ExecTransType::Cancel => true,
                    _ => return,
                };
                let qty = cm.last_shares;
                let px = cm.last_px;
                let px0 = ord.price;
                let apply = |p: &mut Position| {
                    p.handle_trade(is_buy, qty, px, px0, multiplier, is_bust, is_otc)
                };
                let snapshot = {
                    let mut sub = self.sub.write();
                    let p = sub.entry((ord.sub_account.id, sec.id)).or_default();
                    apply(p);
                    *p
                };
                if let Some(broker) = &ord.broker_account {
                    apply(self.broker.write().entry((broker.id, sec.id)).or_default());
                }
                apply(self.user.write().entry((ord.user.id, sec.id)).or_default());
                for value in [
                    Some(&ord.sub_account.risk.position_value),
                    ord.broker_account.as_ref().map(|b| &b.risk.position_value),
                    Some(&ord.user.risk.position_value),
                ]
                .into_iter()
                .flatten()
                {
                    value
                        .lock()
                        .handle_trade(is_buy, qty, px, px0, multiplier, is_bust, is_otc);
                }
                if offline {
                    return;
                }
                self.persist_row(cm, snapshot, is_bust);
            }
            OrderStatus::UnconfirmedNew => {
                if is_otc {
                    return;
                }
                let qty = ord.qty;
                let px = ord.price;
                let apply = |p: &mut Position| p.handle_new(is_buy, qty, px, multiplier);
                apply(self.sub.write().entry((ord.sub_account.id, sec.id)).or_default());
                if let Some(broker) = &ord.broker_account {
                    apply(self.broker.write().entry((broker.id, sec.id)).or_default());
                }
                apply(self.user.write().entry((ord.user.id, sec.id)).or_default());
                for value in [
                    Some(&ord.sub_account.risk.position_value),
                    ord.broker_account.as_ref().map(|b| &b.risk.position_value),
                    Some(&ord.user.risk.position_value),
                ]
                .into_iter()
                .flatten()
                {
                    value.lock().handle_new(is_buy, qty, px, multiplier);
                }
            }
            s if s.releases_exposure() => {
                let leaves = cm.leaves_qty;
                if leaves == 0.0 {
                    return;
                }
                let px0 = ord.price;
                let apply = |p: &mut Position| p.handle_finish(is_buy, leaves, px0, multiplier);
                apply(self.sub.write().entry((ord.sub_account.id, sec.id)).or_default());
                if let Some(broker) = &ord.broker_account {
                    apply(self.broker.write().entry((broker.id, sec.id)).or_default());
                }
                apply(self.user.write().entry((ord.user.id, sec.id)).or_default());
                for value in [
                    Some(&ord.sub_account.risk.position_value),
                    ord.broker_account.as_ref().map(|b| &b.risk.position_value),
                    Some(&ord.user.risk.position_value),
                ]
                .into_iter()
                .flatten()
                {
                    value.lock().handle_finish(is_buy, leaves, px0, multiplier);
                }
            }
            _ => {}
        }
    }

    /// Persist a position row asynchronously on the writer strand.
    fn persist_row(&self, cm: &Arc<Confirmation>, pos: Position, is_bust: bool) {
        let ord = cm.order.clone();
        let store = self.store.clone();
        let mut desc = format!(
            "tm={},qty={},px={},side={},type={},id={}",
            cm.transaction_time,
            cm.last_shares,
            cm.last_px,
            ord.side as u8 as char,
            ord.kind as u8 as char,
            ord.id
        );
        if is_bust {
            desc.push_str(",bust=1");
        }
        self.db_writer.push(move || {
            let row = PositionRow {
                user_id: ord.user.id,
                sub_account_id: ord.sub_account.id,
                security_id: ord.sec.id,
                broker_account_id: ord.broker_id(),
                qty: pos.qty,
                avg_price: pos.avg_price,
                realized_pnl: pos.realized_pnl,
                tm: unix_now(),
                desc,
            };
            if let Err(e) = store.insert_position(&row) {
                error!("failed to persist position row: {}", e);
            }
        });
    }

    /// Recompute unrealized P&L per sub-account position, aggregate per
    /// sub-account, and append to the per-account P&L series when the
    /// change exceeds one unit of the numeraire.
    pub fn update_pnl(&self) {
        let tm = unix_now();
        let mut pnls: HashMap<SubAccountId, (f64, f64)> = HashMap::new();
        {
            let mut sub = self.sub.write();
            for ((acc, sec_id), pos) in sub.iter_mut() {
                let pnl = pnls.entry(*acc).or_default();
                pnl.0 += pos.realized_pnl;
                if pos.qty == 0.0 && pos.unrealized_pnl == 0.0 {
                    continue;
                }
                let Some(sec) = self.cache.security(*sec_id) else {
                    continue;
                };
                let px = self.hub.current_price(sec);
                if px == 0.0 {
                    continue;
                }
                pos.unrealized_pnl = pos.qty * (px - pos.avg_price);
                pnl.1 += pos.unrealized_pnl;
            }
        }
        let mut entries = self.pnls.lock();
        for (acc, (realized, unrealized)) in pnls {
            let entry = entries.entry(acc).or_insert(PnlEntry {
                realized: 0.0,
                unrealized: 0.0,
                file: None,
            });
            if (entry.realized - realized).abs() < 1.0
                && (entry.unrealized - unrealized).abs() < 1.0
            {
                continue;
            }
            entry.realized = realized;
            entry.unrealized = unrealized;
            if entry.file.is_none() {
                let path = self.store_dir.join(format!("pnl-{}", acc));
                match OpenOptions::new().create(true).append(true).open(&path) {
                    Ok(f) => entry.file = Some(f),
                    Err(e) => {
                        error!(path = %path.display(), "failed to open pnl file: {}", e);
                        continue;
                    }
                }
            }
            if let Some(f) = entry.file.as_mut() {
                let _ = writeln!(f, "{} {} {}", tm, realized, unrealized);
            }
        }
    }

    /// Start the five-second mark-to-market loop.
    pub fn start_mark_to_market(self: &Arc<Self>) {
        let mgr = self.clone();
        std::thread::Builder::new()
            .name("mark-to-market".into())
            .spawn(move || loop {
                std::thread::sleep(std::time::Duration::from_secs(5));
                mgr.update_pnl();
            })
            .expect("failed to spawn mark-to-market thread");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos() -> Position {
        Position::default()
    }

    #[test]
    fn open_then_close_realizes_pnl() {
        let mut p = pos();
        p.handle_new(true, 100.0, 10.0, 1.0);
        assert_eq!(p.total_outstanding_buy_qty, 100.0);
        p.handle_trade(true, 100.0, 10.0, 10.0, 1.0, false, false);
        assert_eq!(p.qty, 100.0);
        assert_eq!(p.avg_price, 10.0);
        assert_eq!(p.total_outstanding_buy_qty, 0.0);
        assert_eq!(p.total_bought_qty, 100.0);

        // sell 60 at 12: realize on the closed quantity, keep the average
        p.handle_trade(false, 60.0, 12.0, 12.0, 1.0, false, false);
        assert_eq!(p.qty, 40.0);
        assert_eq!(p.avg_price, 10.0);
        assert_eq!(p.realized_pnl, 120.0);
    }

    #[test]
    fn sign_flip_resets_average_to_trade_price() {
        let mut p = pos();
        p.handle_trade(true, 100.0, 10.0, 10.0, 1.0, false, false);
        p.handle_trade(false, 150.0, 11.0, 11.0, 1.0, false, false);
        assert_eq!(p.qty, -50.0);
        assert_eq!(p.avg_price, 11.0);
        assert_eq!(p.realized_pnl, 100.0);
    }

    #[test]
    fn short_cover_realizes_with_corrected_sign() {
        let mut p = pos();
        p.handle_trade(false, 100.0, 20.0, 20.0, 1.0, false, false);
        assert_eq!(p.qty, -100.0);
        p.handle_trade(true, 100.0, 15.0, 15.0, 1.0, false, false);
        assert_eq!(p.qty, 0.0);
        assert_eq!(p.realized_pnl, 500.0);
    }

    #[test]
    fn bust_reverses_trade_and_counters() {
        let mut p = pos();
        p.handle_new(true, 100.0, 10.0, 1.0);
        p.handle_trade(true, 100.0, 10.0, 10.0, 1.0, false, false);
        p.handle_trade(true, 100.0, 10.0, 10.0, 1.0, true, false);
        assert_eq!(p.qty, 0.0);
        assert_eq!(p.total_bought_qty, 0.0);
        assert_eq!(p.value.total_bought, 0.0);
    }

    #[test]
    fn finish_releases_outstanding_only() {
        let mut p = pos();
        p.handle_new(true, 100.0, 10.0, 1.0);
        p.handle_finish(true, 100.0, 10.0, 1.0);
        assert_eq!(p.total_outstanding_buy_qty, 0.0);
        assert_eq!(p.value.total_outstanding_buy, 0.0);
        assert_eq!(p.qty, 0.0);
    }

    #[test]
    fn bods_seed_sub_and_broker_positions() {
        use crate::marketdata::MarketDataHub;
        use crate::reference::testkit::small_store;
        use crate::reference::ReferenceCache;

        let dir = std::env::temp_dir().join(format!("meridian-bod-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let store = small_store();
        store.positions.lock().push(PositionRow {
            user_id: 1,
            sub_account_id: 2,
            security_id: 10,
            broker_account_id: 3,
            qty: 150.0,
            avg_price: 9.5,
            realized_pnl: 40.0,
            tm: 100, // long before any session cutoff
            desc: String::new(),
        });
        let store = Arc::new(store);
        let cache = Arc::new(ReferenceCache::load(store.as_ref()).unwrap());
        let hub = Arc::new(MarketDataHub::new(cache.clone()));
        let mgr = PositionManager::new(store, cache, hub, &dir).unwrap();

        let pos = mgr.sub_position(2, 10);
        assert_eq!(pos.qty, 150.0);
        assert_eq!(pos.avg_price, 9.5);
        assert_eq!(pos.realized_pnl, 40.0);
        let broker = mgr.broker_position(3, 10);
        assert_eq!(broker.qty, 150.0);
        let bods = mgr.bods();
        assert_eq!(bods.len(), 1);
        assert_eq!(bods[0].1.broker_account_id, 3);

        // a restart within the day reads the same session file
        let store2 = Arc::new(small_store());
        let cache2 = Arc::new(ReferenceCache::load(store2.as_ref()).unwrap());
        let hub2 = Arc::new(MarketDataHub::new(cache2.clone()));
        let mgr2 = PositionManager::new(store2, cache2, hub2, &dir).unwrap();
        assert_eq!(mgr.session(), mgr2.session());
    }

    #[test]
    fn multiplier_scales_realized_pnl() {
        let mut p = pos();
        p.handle_trade(true, 10.0, 100.0, 100.0, 50.0, false, false);
        p.handle_trade(false, 10.0, 101.0, 101.0, 50.0, false, false);
        assert_eq!(p.realized_pnl, 10.0 * 1.0 * 50.0);
    }
}
