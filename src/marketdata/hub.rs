//! Market-data hub: per-source snapshot tables, exchange routing, and
//! fan-out into the algo runtime.

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};
use tracing::{info, warn};

use super::{DataSrc, MarketData, Quote, DEPTH_SIZE};
use crate::algo::AlgoManager;
use crate::core::time::unix_now;
use crate::core::{AdapterConfig, Error, Result};
use crate::reference::{ExchangeId, ReferenceCache, Security, SecurityId};

/// Market-data feed port. Implementations own their transport threads and
/// push updates back through the `FeedHandle` they were built with.
pub trait MarketDataAdapter: Send + Sync {
    fn start(&self);
    fn subscribe(&self, sec: &Security);
    fn connected(&self) -> bool;
    fn reconnect(&self) {}
}

/// One registered feed: the adapter plus its subscription set. The set
/// guarantees that subscribing twice to the same `(adapter, security)`
/// is a no-op.
pub struct AdapterEntry {
    pub name: String,
    pub src: DataSrc,
    pub adapter: Arc<dyn MarketDataAdapter>,
    subs: Mutex<HashSet<SecurityId>>,
}

impl AdapterEntry {
    fn subscribe(&self, sec: &Security) {
        if self.subs.lock().insert(sec.id) {
            self.adapter.subscribe(sec);
        }
    }
}

type SourceTable = RwLock<HashMap<SecurityId, MarketData>>;

pub struct MarketDataHub {
    cache: Arc<ReferenceCache>,
    tables: RwLock<HashMap<DataSrc, Arc<SourceTable>>>,
    adapters: RwLock<HashMap<String, Arc<AdapterEntry>>>,
    routes: RwLock<HashMap<(DataSrc, ExchangeId), Vec<Arc<AdapterEntry>>>>,
    default_entry: RwLock<Option<Arc<AdapterEntry>>>,
    algos: OnceLock<Arc<AlgoManager>>,
}

impl MarketDataHub {
    pub fn new(cache: Arc<ReferenceCache>) -> Self {
        Self {
            cache,
            tables: Default::default(),
            adapters: Default::default(),
            routes: Default::default(),
            default_entry: Default::default(),
            algos: OnceLock::new(),
        }
    }

    pub fn set_algo_manager(&self, algos: Arc<AlgoManager>) {
        let _ = self.algos.set(algos);
    }

    /// Register a feed under its config section name and build its
    /// exchange routes. The first feed added becomes the default route.
    pub fn add(
        &self,
        name: &str,
        adapter: Arc<dyn MarketDataAdapter>,
        cfg: &AdapterConfig,
    ) -> Result<Arc<AdapterEntry>> {
        let src = DataSrc::from_tag(&cfg.src).ok_or_else(|| {
            Error::Config(format!(
                "invalid market data src '{}', maximum length is 4",
                cfg.src
            ))
        })?;
        if !cfg.src.is_empty() {
            info!(adapter = name, src = %src, "market data source registered");
        }
        let entry = Arc::new(AdapterEntry {
            name: name.to_string(),
            src,
            adapter,
            subs: Mutex::new(HashSet::new()),
        });
        self.table(src);
        for market in cfg.markets.split(|c| c == ',' || c == ';') {
            let market = market.trim();
            if market.is_empty() {
                continue;
            }
            match self.cache.exchange_by_name(market) {
                Some(exchange) => {
                    self.routes
                        .write()
                        .entry((src, exchange.id))
                        .or_default()
                        .push(entry.clone());
                }
                None => warn!(market, "unknown market name, ignored"),
            }
        }
        self.adapters
            .write()
            .insert(name.to_string(), entry.clone());
        let mut default = self.default_entry.write();
        if default.is_none() {
            *default = Some(entry.clone());
        }
        Ok(entry)
    }

    pub fn adapter(&self, name: &str) -> Option<Arc<AdapterEntry>> {
        self.adapters.read().get(name).cloned()
    }

    pub fn adapters(&self) -> Vec<Arc<AdapterEntry>> {
        self.adapters.read().values().cloned().collect()
    }

    fn table(&self, src: DataSrc) -> Arc<SourceTable> {
        if let Some(t) = self.tables.read().get(&src) {
            return t.clone();
        }
        self.tables.write().entry(src).or_default().clone()
    }

    /// Route selection: `security.id % adapters.len()` within the routed
    /// set (stable sharding), default adapter when unrouted.
    fn route(&self, sec: &Security, src: DataSrc) -> Option<Arc<AdapterEntry>> {
        let routes = self.routes.read();
        if let Some(entries) = routes.get(&(src, sec.exchange.id)) {
            if !entries.is_empty() {
                return Some(entries[sec.id as usize % entries.len()].clone());
            }
        }
        self.default_entry.read().clone()
    }

    /// Subscribe `sec` on the routed feed; returns the serving entry.
    pub fn subscribe(&self, sec: &Security, src: DataSrc) -> Option<Arc<AdapterEntry>> {
        let entry = self.route(sec, src)?;
        entry.subscribe(sec);
        Some(entry)
    }

    /// Most-recent snapshot; zeroed when the source or security is unknown.
    pub fn get(&self, id: SecurityId, src: DataSrc) -> MarketData {
        let Some(table) = self.tables.read().get(&src).cloned() else {
            return MarketData::default();
        };
        let value = table.read().get(&id).copied().unwrap_or_default();
        value
    }

    /// Snapshot through the routing table, subscribing on first touch.
    /// This is what the client port and `current_price` read.
    pub fn get_routed(&self, sec: &Security, src: DataSrc) -> MarketData {
        let Some(entry) = self.route(sec, src) else {
            return MarketData::default();
        };
        let table = self.table(entry.src);
        if let Some(md) = table.read().get(&sec.id) {
            return *md;
        }
        entry.subscribe(sec);
        MarketData::default()
    }

    /// Latest close on the default route, falling back to the reference
    /// close price.
    pub fn current_price(&self, sec: &Security) -> f64 {
        let px = self.get_routed(sec, DataSrc::DEFAULT).trade.close;
        if px > 0.0 {
            px
        } else {
            sec.close_price
        }
    }

    fn notify(&self, src: DataSrc, id: SecurityId) {
        if let Some(algos) = self.algos.get() {
            if algos.is_subscribed(src, id) {
                algos.update(src, id);
            }
        }
    }

    fn mutate(&self, src: DataSrc, id: SecurityId, f: impl FnOnce(&mut MarketData)) {
        let table = self.table(src);
        {
            let mut table = table.write();
            f(table.entry(id).or_default());
        }
        self.notify(src, id);
    }

    /// Cumulative last-trade update.
    pub fn update_trade(&self, src: DataSrc, id: SecurityId, px: f64, qty: f64) {
        self.mutate(src, id, |md| {
            md.tm = unix_now();
            if px > 0.0 {
                md.trade.update_px(px);
            }
            if qty > 0.0 {
                md.trade.update_volume(qty);
            }
        });
    }

    /// Whole-level depth replace. Levels beyond the book depth are
    /// dropped; only top-of-book wakes subscribers.
    pub fn update_quote(&self, src: DataSrc, id: SecurityId, quote: Quote, level: usize) {
        if level >= DEPTH_SIZE {
            return;
        }
        let table = self.table(src);
        {
            let mut table = table.write();
            let md = table.entry(id).or_default();
            md.tm = unix_now();
            md.depth[level] = quote;
        }
        if level == 0 {
            self.forex_mid(src, id);
            self.notify(src, id);
        }
    }

    pub fn update_bid(&self, src: DataSrc, id: SecurityId, price: f64, size: f64, level: usize) {
        if level >= DEPTH_SIZE {
            return;
        }
        let table = self.table(src);
        {
            let mut table = table.write();
            let md = table.entry(id).or_default();
            md.tm = unix_now();
            md.depth[level].bid_price = price;
            md.depth[level].bid_size = size;
        }
        if level == 0 {
            self.forex_mid(src, id);
            self.notify(src, id);
        }
    }

    pub fn update_ask(&self, src: DataSrc, id: SecurityId, price: f64, size: f64, level: usize) {
        if level >= DEPTH_SIZE {
            return;
        }
        let table = self.table(src);
        {
            let mut table = table.write();
            let md = table.entry(id).or_default();
            md.tm = unix_now();
            md.depth[level].ask_price = price;
            md.depth[level].ask_size = size;
        }
        if level == 0 {
            self.forex_mid(src, id);
            self.notify(src, id);
        }
    }

    pub fn update_last_price(&self, src: DataSrc, id: SecurityId, px: f64) {
        if px <= 0.0 {
            return;
        }
        self.mutate(src, id, |md| {
            md.tm = unix_now();
            md.trade.update_px(px);
        });
    }

    pub fn update_last_size(&self, src: DataSrc, id: SecurityId, qty: f64) {
        if qty <= 0.0 {
            return;
        }
        self.mutate(src, id, |md| {
            md.tm = unix_now();
            md.trade.update_volume(qty);
        });
    }

    /// Treat the mid as a zero-size last trade when both sides are live.
    pub fn update_mid_as_last(&self, src: DataSrc, id: SecurityId) {
        let table = self.table(src);
        let updated = {
            let mut table = table.write();
            let md = table.entry(id).or_default();
            let q = md.depth[0];
            if q.ask_price > q.bid_price && q.bid_price > 0.0 {
                md.trade.update_px((q.ask_price + q.bid_price) / 2.0);
                md.tm = unix_now();
                true
            } else {
                false
            }
        };
        if updated {
            self.notify(src, id);
        }
    }

    /// Forex pairs synthesise a last trade off every top-of-book change.
    fn forex_mid(&self, src: DataSrc, id: SecurityId) {
        let is_forex = self
            .cache
            .security(id)
            .map(|s| s.is_forex_pair())
            .unwrap_or(false);
        if is_forex {
            let table = self.table(src);
            let mut table = table.write();
            let md = table.entry(id).or_default();
            let q = md.depth[0];
            if q.ask_price > q.bid_price && q.bid_price > 0.0 {
                md.trade.update_px((q.ask_price + q.bid_price) / 2.0);
                md.trade.qty = 0.0;
            }
        }
    }
}

/// The hub endpoint handed to a feed adapter at construction: all pushes
/// are tagged with the adapter's source.
#[derive(Clone)]
pub struct FeedHandle {
    src: DataSrc,
    hub: Arc<MarketDataHub>,
}

impl FeedHandle {
    pub fn new(src: DataSrc, hub: Arc<MarketDataHub>) -> Self {
        Self { src, hub }
    }

    pub fn src(&self) -> DataSrc {
        self.src
    }

    pub fn update_trade(&self, id: SecurityId, px: f64, qty: f64) {
        self.hub.update_trade(self.src, id, px, qty);
    }

    pub fn update_quote(&self, id: SecurityId, quote: Quote, level: usize) {
        self.hub.update_quote(self.src, id, quote, level);
    }

    pub fn update_bid(&self, id: SecurityId, price: f64, size: f64) {
        self.hub.update_bid(self.src, id, price, size, 0);
    }

    pub fn update_ask(&self, id: SecurityId, price: f64, size: f64) {
        self.hub.update_ask(self.src, id, price, size, 0);
    }

    pub fn update_last_price(&self, id: SecurityId, px: f64) {
        self.hub.update_last_price(self.src, id, px);
    }

    pub fn update_last_size(&self, id: SecurityId, qty: f64) {
        self.hub.update_last_size(self.src, id, qty);
    }

    pub fn update_mid_as_last(&self, id: SecurityId) {
        self.hub.update_mid_as_last(self.src, id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::testkit::small_store;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFeed {
        subscribed: AtomicUsize,
    }

    impl MarketDataAdapter for CountingFeed {
        fn start(&self) {}
        fn subscribe(&self, _sec: &Security) {
            self.subscribed.fetch_add(1, Ordering::SeqCst);
        }
        fn connected(&self) -> bool {
            true
        }
    }

    fn hub_with_feed() -> (Arc<MarketDataHub>, Arc<CountingFeed>, DataSrc) {
        let cache = Arc::new(ReferenceCache::load(&small_store()).unwrap());
        let hub = Arc::new(MarketDataHub::new(cache));
        let feed = Arc::new(CountingFeed { subscribed: AtomicUsize::new(0) });
        let cfg = AdapterConfig {
            adapter: "test".into(),
            src: "SIM".into(),
            markets: "SIMEX".into(),
            ..Default::default()
        };
        hub.add("md_test", feed.clone(), &cfg).unwrap();
        (hub, feed, DataSrc::from_tag("SIM").unwrap())
    }

    #[test]
    fn duplicate_subscription_is_a_noop() {
        let (hub, feed, src) = hub_with_feed();
        let cache = Arc::new(ReferenceCache::load(&small_store()).unwrap());
        let sec = cache.security(10).unwrap();
        hub.subscribe(sec, src).unwrap();
        hub.subscribe(sec, src).unwrap();
        assert_eq!(feed.subscribed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unknown_key_reads_zeroed_snapshot() {
        let (hub, _, src) = hub_with_feed();
        assert_eq!(hub.get(999, src), MarketData::default());
        assert_eq!(hub.get(10, DataSrc::from_tag("X").unwrap()), MarketData::default());
    }

    #[test]
    fn trade_and_quote_updates_land_in_place() {
        let (hub, _, src) = hub_with_feed();
        hub.update_trade(src, 10, 10.5, 200.0);
        hub.update_bid(src, 10, 10.4, 100.0, 0);
        hub.update_ask(src, 10, 10.6, 300.0, 0);
        let md = hub.get(10, src);
        assert_eq!(md.trade.close, 10.5);
        assert_eq!(md.trade.volume, 200.0);
        assert_eq!(md.quote().bid_price, 10.4);
        assert_eq!(md.quote().ask_price, 10.6);
    }

    #[test]
    fn current_price_falls_back_to_close() {
        let (hub, _, src) = hub_with_feed();
        let cache = Arc::new(ReferenceCache::load(&small_store()).unwrap());
        let sec = cache.security(10).unwrap();
        assert_eq!(hub.current_price(sec), 10.0);
        hub.update_trade(src, 10, 11.25, 1.0);
        assert_eq!(hub.current_price(sec), 11.25);
    }

    #[test]
    fn mid_becomes_last_only_with_a_two_sided_book() {
        let (hub, _, src) = hub_with_feed();
        hub.update_bid(src, 10, 10.0, 1.0, 0);
        hub.update_mid_as_last(src, 10);
        assert_eq!(hub.get(10, src).trade.close, 0.0);
        hub.update_ask(src, 10, 10.5, 1.0, 0);
        hub.update_mid_as_last(src, 10);
        assert_eq!(hub.get(10, src).trade.close, 10.25);
    }

    #[test]
    fn forex_pairs_synthesise_last_from_the_mid() {
        let mut store = small_store();
        store.securities[0].kind = "CASH".into();
        let cache = Arc::new(ReferenceCache::load(&store).unwrap());
        let hub = Arc::new(MarketDataHub::new(cache));
        let cfg = AdapterConfig {
            adapter: "test".into(),
            src: "FX".into(),
            markets: "SIMEX".into(),
            ..Default::default()
        };
        hub.add(
            "md_fx",
            Arc::new(CountingFeed { subscribed: AtomicUsize::new(0) }),
            &cfg,
        )
        .unwrap();
        let src = DataSrc::from_tag("FX").unwrap();
        hub.update_bid(src, 10, 1.10, 5.0, 0);
        hub.update_ask(src, 10, 1.12, 5.0, 0);
        let md = hub.get(10, src);
        assert!((md.trade.close - 1.11).abs() < 1e-12);
        assert_eq!(md.trade.qty, 0.0);
    }

    #[test]
    fn last_price_and_size_setters_feed_the_trade() {
        let (hub, _, src) = hub_with_feed();
        hub.update_last_price(src, 10, 10.5);
        hub.update_last_size(src, 10, 300.0);
        let t = hub.get(10, src).trade;
        assert_eq!(t.close, 10.5);
        assert_eq!(t.volume, 300.0);
        // non-positive updates are dropped
        hub.update_last_price(src, 10, 0.0);
        assert_eq!(hub.get(10, src).trade.close, 10.5);
    }

    #[test]
    fn deep_levels_do_not_clobber_top() {
        let (hub, _, src) = hub_with_feed();
        hub.update_quote(
            src,
            10,
            Quote { bid_price: 9.0, bid_size: 1.0, ask_price: 9.5, ask_size: 1.0 },
            3,
        );
        let md = hub.get(10, src);
        assert_eq!(md.quote().bid_price, 0.0);
        assert_eq!(md.depth[3].bid_price, 9.0);
        // out-of-range level is dropped
        hub.update_quote(src, 10, Quote::default(), 7);
    }
}
