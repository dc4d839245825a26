//! Sharded algo execution runtime.
//!
//! An algo is pinned to shard `algo_id % nshards`; each shard owns a
//! strand, so every callback of one algo is serialized while distinct
//! shards run in parallel. Market-data wake-ups coalesce through a
//! per-shard dirty set: a runner is posted only on the empty-to-
//! non-empty transition and drains everything queued.

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, error, info};

use super::{Algo, AlgoCtx, AlgoId, Instrument, ParamDefs, ParamMap};
use crate::client::Publisher;
use crate::core::time::unix_now;
use crate::core::{Error, Result};
use crate::execution::ConnectivityManager;
use crate::marketdata::{DataSrc, MarketDataHub, MdKey};
use crate::orderbook::{journal::split_tokens, Confirmation, ExecTransType, OrderBook, OrderStatus};
use crate::reference::{SecurityId, User, UserId};
use crate::runtime::{TaskPool, TimerService};

pub struct AlgoInstance {
    pub ctx: Arc<AlgoCtx>,
    pub(crate) strategy: Mutex<Box<dyn Algo>>,
    pub(crate) error: Mutex<String>,
}

struct AlgoDef {
    defs: ParamDefs,
    create: Box<dyn Fn() -> Box<dyn Algo> + Send + Sync>,
}

struct Shard {
    strand: TaskPool,
    state: Mutex<ShardState>,
}

#[derive(Default)]
struct ShardState {
    dirties: HashSet<MdKey>,
    instruments: HashMap<MdKey, (crate::marketdata::MarketData, Vec<Arc<Instrument>>)>,
    md_refs: HashMap<MdKey, u32>,
}

/// One parsed algo-journal record for warm catch-up.
#[derive(Debug, Clone, Default)]
pub struct AlgoReplay {
    pub seq: u32,
    pub id: AlgoId,
    pub user_id: UserId,
    pub tm: i64,
    pub name: String,
    pub status: String,
    pub body: String,
}

pub struct AlgoManager {
    registry: RwLock<HashMap<String, Arc<AlgoDef>>>,
    algos: RwLock<HashMap<AlgoId, Arc<AlgoInstance>>>,
    by_token: RwLock<HashMap<String, Arc<AlgoInstance>>>,
    id_counter: AtomicU32,
    seq_counter: AtomicU32,
    shards: Vec<Shard>,
    md_refs: RwLock<HashMap<MdKey, u32>>,
    /// Serializes instrument exposure updates against adapter threads.
    inst_mutex: Mutex<()>,
    timers: TimerService,
    journal: Mutex<File>,
    journal_path: PathBuf,
    writer: TaskPool,
    publisher: OnceLock<Arc<Publisher>>,
    hub: Arc<MarketDataHub>,
    connectivity: Arc<ConnectivityManager>,
    book: Arc<OrderBook>,
}

impl AlgoManager {
    pub fn new(
        hub: Arc<MarketDataHub>,
        connectivity: Arc<ConnectivityManager>,
        book: Arc<OrderBook>,
        store_dir: &Path,
        nshards: usize,
    ) -> Result<Arc<AlgoManager>> {
        let nshards = nshards.max(1);
        let journal_path = store_dir.join("algos");
        let journal = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&journal_path)
            .map_err(|e| {
                Error::Journal(format!("failed to open {}: {}", journal_path.display(), e))
            })?;
        let shards = (0..nshards)
            .map(|i| Shard {
                strand: TaskPool::new(&format!("algo-shard-{}", i)),
                state: Mutex::new(ShardState::default()),
            })
            .collect();
        info!(algo_threads = nshards, "algo runtime ready");
        Ok(Arc::new(AlgoManager {
            registry: Default::default(),
            algos: Default::default(),
            by_token: Default::default(),
            id_counter: AtomicU32::new(0),
            seq_counter: AtomicU32::new(0),
            shards,
            md_refs: Default::default(),
            inst_mutex: Mutex::new(()),
            timers: TimerService::new("algo-timers"),
            journal: Mutex::new(journal),
            journal_path,
            writer: TaskPool::new("algo-writer"),
            publisher: OnceLock::new(),
            hub,
            connectivity,
            book,
        }))
    }

    pub fn set_publisher(&self, publisher: Arc<Publisher>) {
        let _ = self.publisher.set(publisher);
    }

    pub(crate) fn hub(&self) -> &Arc<MarketDataHub> {
        &self.hub
    }

    pub(crate) fn connectivity(&self) -> &Arc<ConnectivityManager> {
        &self.connectivity
    }

    pub(crate) fn order_book(&self) -> &Arc<OrderBook> {
        &self.book
    }

    fn shard(&self, id: AlgoId) -> &Shard {
        &self.shards[id as usize % self.shards.len()]
    }

    /// Register a strategy factory under its spawnable name.
    pub fn register<F>(&self, name: &str, defs: ParamDefs, create: F)
    where
        F: Fn() -> Box<dyn Algo> + Send + Sync + 'static,
    {
        self.registry.write().insert(
            name.to_string(),
            Arc::new(AlgoDef {
                defs,
                create: Box::new(create),
            }),
        );
    }

    pub fn definitions(&self) -> Vec<(String, ParamDefs)> {
        self.registry
            .read()
            .iter()
            .map(|(name, def)| (name.clone(), def.defs.clone()))
            .collect()
    }

    pub fn param_defs(&self, name: &str) -> Option<ParamDefs> {
        self.registry.read().get(name).map(|d| d.defs.clone())
    }

    pub fn algo(&self, id: AlgoId) -> Option<Arc<AlgoInstance>> {
        self.algos.read().get(&id).cloned()
    }

    pub fn by_token(&self, token: &str) -> Option<Arc<AlgoInstance>> {
        self.by_token.read().get(token).cloned()
    }

    /// Spawn a new strategy instance. A non-empty token must be unique;
    /// `on_start` runs on the algo's strand, and a startup error stops
    /// the algo immediately with a `failed` journal entry.
    pub fn spawn(
        self: &Arc<Self>,
        name: &str,
        params: ParamMap,
        params_raw: String,
        user: Arc<User>,
        token: &str,
    ) -> std::result::Result<AlgoId, String> {
        let def = self
            .registry
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| format!("unknown algo name: {}", name))?;
        let id = self.id_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let ctx = AlgoCtx::new(
            id,
            name.to_string(),
            token.to_string(),
            user,
            Arc::downgrade(self),
        );
        let instance = Arc::new(AlgoInstance {
            ctx,
            strategy: Mutex::new((def.create)()),
            error: Mutex::new(String::new()),
        });
        if !token.is_empty() {
            let mut by_token = self.by_token.write();
            if by_token.contains_key(token) {
                return Err(format!("duplicate token: {}", token));
            }
            by_token.insert(token.to_string(), instance.clone());
        }
        self.algos.write().insert(id, instance.clone());
        self.persist(&instance, "new", &params_raw);
        let mgr = self.clone();
        let a = instance;
        self.shard(id).strand.push(move || {
            let started = { a.strategy.lock().on_start(&a.ctx, &params) };
            if let Err(e) = started {
                *a.error.lock() = e;
                mgr.stop_inline(&a);
            }
        });
        Ok(id)
    }

    /// Idempotent stop, running on the algo's strand: flips the active
    /// flag, cancels every live child order, journals the terminal
    /// status, and calls `on_stop`.
    pub fn stop(self: &Arc<Self>, id: AlgoId) {
        if let Some(a) = self.algo(id) {
            let mgr = self.clone();
            self.shard(id).strand.push(move || mgr.stop_inline(&a));
        }
    }

    pub fn stop_token(self: &Arc<Self>, token: &str) {
        if let Some(a) = self.by_token(token) {
            self.stop(a.ctx.id);
        }
    }

    pub fn stop_all(self: &Arc<Self>) {
        let ids: Vec<AlgoId> = self.algos.read().keys().copied().collect();
        for id in ids {
            self.stop(id);
        }
    }

    /// Stop every algo holding an instrument on `sec_id`.
    pub fn stop_by_security(self: &Arc<Self>, sec_id: SecurityId) {
        let hits: Vec<AlgoId> = self
            .algos
            .read()
            .values()
            .filter(|a| a.ctx.instruments().iter().any(|i| i.sec.id == sec_id))
            .map(|a| a.ctx.id)
            .collect();
        for id in hits {
            self.stop(id);
        }
    }

    fn stop_inline(self: &Arc<Self>, a: &Arc<AlgoInstance>) {
        if !a.ctx.deactivate() {
            return;
        }
        for inst in a.ctx.instruments() {
            for oid in inst.active_orders() {
                if let Some(ord) = self.book.get(oid) {
                    self.connectivity.cancel(&ord);
                }
            }
        }
        let err = a.error.lock().clone();
        if err.is_empty() {
            self.persist(a, "terminated", "");
        } else {
            self.persist(a, "failed", &err);
        }
        a.strategy.lock().on_stop(&a.ctx);
        debug!(algo = a.ctx.id, name = %a.ctx.name, "algo stopped");
    }

    /// Hub-side test: does any shard hold a live subscription here?
    pub fn is_subscribed(&self, src: DataSrc, id: SecurityId) -> bool {
        self.md_refs
            .read()
            .get(&(src, id))
            .copied()
            .unwrap_or(0)
            > 0
    }

    pub(crate) fn register_instrument(&self, inst: Arc<Instrument>) {
        let key = (inst.src, inst.sec.id);
        let shard = self.shard(inst.algo_id);
        {
            let mut st = shard.state.lock();
            let entry = st.instruments.entry(key).or_default();
            if entry.1.is_empty() {
                entry.0 = self.hub.get(key.1, key.0);
            }
            entry.1.push(inst);
            *st.md_refs.entry(key).or_insert(0) += 1;
        }
        *self.md_refs.write().entry(key).or_insert(0) += 1;
    }

    /// Market-data wake-up: mark the key dirty on every shard with a
    /// subscriber and post the runner only on the idle-to-busy edge.
    pub fn update(self: &Arc<Self>, src: DataSrc, id: SecurityId) {
        let key = (src, id);
        for (idx, shard) in self.shards.iter().enumerate() {
            let should_run = {
                let mut st = shard.state.lock();
                if st.md_refs.get(&key).copied().unwrap_or(0) == 0 {
                    continue;
                }
                let was_idle = st.dirties.is_empty();
                st.dirties.insert(key);
                was_idle
            };
            if should_run {
                let mgr = self.clone();
                shard.strand.push(move || mgr.run_shard(idx));
            }
        }
    }

    /// Runner body: drain the dirty set, dispatching trade/quote
    /// callbacks for structurally changed snapshots.
    fn run_shard(self: &Arc<Self>, idx: usize) {
        let shard = &self.shards[idx];
        loop {
            let key = {
                let mut st = shard.state.lock();
                let Some(&key) = st.dirties.iter().next() else {
                    return;
                };
                st.dirties.remove(&key);
                key
            };
            let md = self.hub.get(key.1, key.0);
            let Some((md0, subscribers)) = ({
                let st = shard.state.lock();
                st.instruments
                    .get(&key)
                    .map(|(md0, subs)| (*md0, subs.clone()))
            }) else {
                continue;
            };
            let trade_update = md0.trade.differs(&md.trade);
            let quote_update = md0.quote().differs(md.quote());
            let mut dead: Vec<Arc<Instrument>> = vec![];
            for inst in &subscribers {
                let Some(a) = self.algo(inst.algo_id) else {
                    dead.push(inst.clone());
                    continue;
                };
                if !a.ctx.is_active() {
                    dead.push(inst.clone());
                    continue;
                }
                let mut strategy = a.strategy.lock();
                if trade_update {
                    strategy.on_market_trade(&a.ctx, inst, &md, &md0);
                }
                if quote_update {
                    strategy.on_market_quote(&a.ctx, inst, &md, &md0);
                }
            }
            {
                let mut st = shard.state.lock();
                if let Some(entry) = st.instruments.get_mut(&key) {
                    entry.0 = md;
                    if !dead.is_empty() {
                        entry.1.retain(|i| !dead.iter().any(|d| Arc::ptr_eq(d, i)));
                    }
                }
                if !dead.is_empty() {
                    if let Some(n) = st.md_refs.get_mut(&key) {
                        *n = n.saturating_sub(dead.len() as u32);
                    }
                }
            }
            if !dead.is_empty() {
                if let Some(n) = self.md_refs.write().get_mut(&key) {
                    *n = n.saturating_sub(dead.len() as u32);
                }
            }
        }
    }

    /// Execution callback fan-in: adjust the instrument's exposure
    /// under the global mutex, then hand the confirmation to the algo
    /// on its strand.
    pub fn handle(self: &Arc<Self>, cm: Arc<Confirmation>) {
        let Some(inst) = cm.order.inst.clone() else {
            return;
        };
        use OrderStatus::*;
        {
            let _guard = self.inst_mutex.lock();
            match cm.exec_type {
                PartiallyFilled | Filled => inst.with_state(|st| match cm.exec_trans_type {
                    ExecTransType::New => {
                        if cm.order.is_buy() {
                            st.outstanding_buy_qty -= cm.last_shares;
                            st.bought_qty += cm.last_shares;
                        } else {
                            st.outstanding_sell_qty -= cm.last_shares;
                            st.sold_qty += cm.last_shares;
                        }
                    }
                    ExecTransType::Cancel => {
                        if cm.order.is_buy() {
                            st.bought_qty -= cm.last_shares;
                        } else {
                            st.sold_qty -= cm.last_shares;
                        }
                    }
                    _ => {}
                }),
                Canceled | Rejected | Expired | Calculated | DoneForDay => inst.with_state(|st| {
                    if cm.order.is_buy() {
                        st.outstanding_buy_qty -= cm.leaves_qty;
                    } else {
                        st.outstanding_sell_qty -= cm.leaves_qty;
                    }
                }),
                PendingCancel | CancelRejected => {}
                _ => return,
            }
        }
        let mgr = self.clone();
        self.shard(cm.order.algo_id).strand.push(move || {
            let Some(a) = mgr.algo(cm.order.algo_id) else {
                return;
            };
            match cm.exec_type {
                PartiallyFilled | Filled => {
                    if !cm.order.is_live() {
                        inst.with_state(|st| {
                            st.active_orders.remove(&cm.order.id);
                        });
                    }
                }
                Canceled | Rejected | Expired | Calculated | DoneForDay => {
                    inst.with_state(|st| {
                        st.active_orders.remove(&cm.order.id);
                        if cm.order.orig_id != 0 {
                            st.active_orders.remove(&cm.order.orig_id);
                        }
                    });
                }
                _ => {}
            }
            a.strategy.lock().on_confirmation(&a.ctx, &cm);
        });
    }

    /// One-shot timer whose firing hops onto the algo's strand.
    pub fn set_timeout(self: &Arc<Self>, id: AlgoId, ms: u64) {
        let mgr = self.clone();
        self.timers.schedule(Duration::from_millis(ms), move || {
            let inner = mgr.clone();
            mgr.shard(id).strand.push(move || {
                if let Some(a) = inner.algo(id) {
                    a.strategy.lock().on_timer(&a.ctx);
                }
            });
        });
    }

    /// Journal an algo lifecycle event on the writer strand; published
    /// seq matches on-disk seq.
    fn persist(self: &Arc<Self>, a: &Arc<AlgoInstance>, status: &str, body: &str) {
        let mgr = self.clone();
        let user_id = a.ctx.user.id;
        let algo_id = a.ctx.id;
        let token = a.ctx.token.clone();
        let name = a.ctx.name.clone();
        let status = status.to_string();
        let body = body.to_string();
        self.writer.push(move || {
            let tm = unix_now();
            let line = format!("{} {} {} {}", tm, name, status, body);
            let seq = mgr.seq_counter.fetch_add(1, Ordering::Relaxed) + 1;
            if let Some(publisher) = mgr.publisher.get() {
                publisher.publish_algo(seq, algo_id, tm, &token, &name, &status, &body, user_id);
            }
            let mut record = Vec::with_capacity(14 + line.len() + 2);
            record.extend_from_slice(&seq.to_le_bytes());
            record.extend_from_slice(&(line.len() as u32).to_le_bytes());
            record.extend_from_slice(&user_id.to_le_bytes());
            record.extend_from_slice(&algo_id.to_le_bytes());
            record.extend_from_slice(line.as_bytes());
            record.push(0);
            record.push(b'\n');
            let mut file = mgr.journal.lock();
            if let Err(e) = file.write_all(&record).and_then(|_| file.flush()) {
                error!(path = %mgr.journal_path.display(), "algo journal write failed: {}", e);
            }
        });
    }

    fn scan_journal(bytes: &[u8]) -> Result<Vec<(u32, UserId, AlgoId, &str)>> {
        const HEADER: usize = 4 + 4 + 2 + 4;
        let mut out = vec![];
        let mut pos = 0usize;
        while pos < bytes.len() {
            if bytes.len() - pos < HEADER {
                return Err(Error::Journal(format!(
                    "truncated algo record header at offset {}",
                    pos
                )));
            }
            let seq = u32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap());
            let len = u32::from_le_bytes(bytes[pos + 4..pos + 8].try_into().unwrap()) as usize;
            let user_id = u16::from_le_bytes(bytes[pos + 8..pos + 10].try_into().unwrap());
            let algo_id = u32::from_le_bytes(bytes[pos + 10..pos + 14].try_into().unwrap());
            let end = pos + HEADER + len + 2;
            if end > bytes.len() {
                return Err(Error::Journal(format!(
                    "truncated algo record body at offset {}",
                    pos
                )));
            }
            let body = std::str::from_utf8(&bytes[pos + HEADER..end - 2])
                .map_err(|_| Error::Journal(format!("non-utf8 algo body at offset {}", pos)))?;
            out.push((seq, user_id, algo_id, body));
            pos = end;
        }
        Ok(out)
    }

    /// Cold recovery: advance the seq and id counters past everything
    /// journaled, so replayed and new records never collide.
    pub fn recover(&self) -> Result<()> {
        let bytes = match std::fs::read(&self.journal_path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => vec![],
            Err(e) => return Err(e.into()),
        };
        let records = Self::scan_journal(&bytes)
            .map_err(|e| Error::Journal(format!("{}: {}", self.journal_path.display(), e)))?;
        for (seq, _user, algo_id, _body) in &records {
            self.seq_counter.store(*seq, Ordering::Relaxed);
            if *algo_id > self.id_counter.load(Ordering::Relaxed) {
                self.id_counter.store(*algo_id, Ordering::Relaxed);
            }
        }
        self.id_counter.fetch_add(100, Ordering::Relaxed);
        self.seq_counter.fetch_add(100, Ordering::Relaxed);
        info!(
            records = records.len(),
            next_algo_id = self.id_counter.load(Ordering::Relaxed) + 1,
            "algo journal replayed"
        );
        Ok(())
    }

    /// Warm catch-up over the algo journal, filtered by ownership.
    pub fn replay_since(
        &self,
        seq0: u32,
        user: &User,
        mut send: impl FnMut(AlgoReplay),
    ) -> Result<()> {
        let bytes = match std::fs::read(&self.journal_path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => vec![],
            Err(e) => return Err(e.into()),
        };
        for (seq, user_id, algo_id, body) in Self::scan_journal(&bytes)? {
            if seq <= seq0 {
                continue;
            }
            if !user.is_admin && user.id != user_id {
                continue;
            }
            let Some((tokens, rest)) = split_tokens(body, 3) else {
                error!(seq, "failed to parse algo journal record");
                continue;
            };
            let Ok(tm) = tokens[0].parse::<i64>() else {
                continue;
            };
            send(AlgoReplay {
                seq,
                id: algo_id,
                user_id,
                tm,
                name: tokens[1].to_string(),
                status: tokens[2].to_string(),
                body: rest.to_string(),
            });
        }
        Ok(())
    }
}
