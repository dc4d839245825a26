//! Order lifecycle state machine and the durable confirmation journal.

pub mod journal;

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{error, info, warn};

use crate::algo::{AlgoId, AlgoManager, Instrument};
use crate::client::Publisher;
use crate::core::{Error, Result};
use crate::position::PositionManager;
use crate::reference::{
    BrokerAccount, BrokerAccountId, ReferenceCache, Security, SecurityId, SubAccount, SubAccountId,
    User, UserId,
};
use crate::runtime::TaskPool;

pub type OrderId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Side {
    Buy = b'1',
    Sell = b'2',
    Short = b'5',
}

impl Side {
    pub fn is_buy(self) -> bool {
        self == Side::Buy
    }

    pub fn from_char(c: u8) -> Option<Side> {
        match c {
            b'1' => Some(Side::Buy),
            b'2' => Some(Side::Sell),
            b'5' => Some(Side::Short),
            _ => None,
        }
    }

    /// Case-insensitive client-side spelling.
    pub fn parse(s: &str) -> Option<Side> {
        match s.to_ascii_lowercase().as_str() {
            "buy" => Some(Side::Buy),
            "sell" => Some(Side::Sell),
            "short" | "short sell" | "sell short" => Some(Side::Short),
            _ => None,
        }
    }

    pub fn wire_name(self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
            Side::Short => "short",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OrdType {
    Market = b'1',
    Limit = b'2',
    Stop = b'3',
    StopLimit = b'4',
    Otc = b'o',
}

impl OrdType {
    pub fn from_char(c: u8) -> Option<OrdType> {
        match c {
            b'1' => Some(OrdType::Market),
            b'2' => Some(OrdType::Limit),
            b'3' => Some(OrdType::Stop),
            b'4' => Some(OrdType::StopLimit),
            b'o' => Some(OrdType::Otc),
            _ => None,
        }
    }

    pub fn parse(s: &str) -> OrdType {
        match s.to_ascii_lowercase().as_str() {
            "market" => OrdType::Market,
            "stop" => OrdType::Stop,
            "stop limit" | "stop_limit" => OrdType::StopLimit,
            "otc" => OrdType::Otc,
            _ => OrdType::Limit,
        }
    }

    pub fn wire_name(self) -> &'static str {
        match self {
            OrdType::Market => "market",
            OrdType::Limit => "limit",
            OrdType::Stop => "stop",
            OrdType::StopLimit => "stop_limit",
            OrdType::Otc => "otc",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Tif {
    Day = b'0',
    Gtc = b'1',
    Opg = b'2',
    Ioc = b'3',
    Fok = b'4',
    Gtx = b'5',
    Gtd = b'6',
}

impl Tif {
    pub fn from_char(c: u8) -> Option<Tif> {
        match c {
            b'0' => Some(Tif::Day),
            b'1' => Some(Tif::Gtc),
            b'2' => Some(Tif::Opg),
            b'3' => Some(Tif::Ioc),
            b'4' => Some(Tif::Fok),
            b'5' => Some(Tif::Gtx),
            b'6' => Some(Tif::Gtd),
            _ => None,
        }
    }

    pub fn parse(s: &str) -> Tif {
        match s.to_ascii_uppercase().as_str() {
            "GTC" => Tif::Gtc,
            "OPG" => Tif::Opg,
            "IOC" => Tif::Ioc,
            "FOK" => Tif::Fok,
            "GTX" => Tif::Gtx,
            _ => Tif::Day,
        }
    }

    pub fn wire_name(self) -> &'static str {
        match self {
            Tif::Day => "Day",
            Tif::Gtc => "GTC",
            Tif::Opg => "OPG",
            Tif::Ioc => "IOC",
            Tif::Fok => "FOK",
            Tif::Gtx => "GTX",
            Tif::Gtd => "GTD",
        }
    }
}

/// Order status doubles as the exec-type written into the journal; the
/// discriminants are the FIX exec-type character codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OrderStatus {
    New = b'0',
    PartiallyFilled = b'1',
    Filled = b'2',
    DoneForDay = b'3',
    Canceled = b'4',
    Replaced = b'5',
    PendingCancel = b'6',
    Stopped = b'7',
    Rejected = b'8',
    Suspended = b'9',
    PendingNew = b'A',
    Calculated = b'B',
    Expired = b'C',
    AcceptedForBidding = b'D',
    PendingReplace = b'E',
    RiskRejected = b'a',
    UnconfirmedNew = b'b',
    UnconfirmedCancel = b'c',
    UnconfirmedReplace = b'd',
    CancelRejected = b'e',
}

impl OrderStatus {
    pub fn from_char(c: u8) -> Option<OrderStatus> {
        use OrderStatus::*;
        Some(match c {
            b'0' => New,
            b'1' => PartiallyFilled,
            b'2' => Filled,
            b'3' => DoneForDay,
            b'4' => Canceled,
            b'5' => Replaced,
            b'6' => PendingCancel,
            b'7' => Stopped,
            b'8' => Rejected,
            b'9' => Suspended,
            b'A' => PendingNew,
            b'B' => Calculated,
            b'C' => Expired,
            b'D' => AcceptedForBidding,
            b'E' => PendingReplace,
            b'a' => RiskRejected,
            b'b' => UnconfirmedNew,
            b'c' => UnconfirmedCancel,
            b'd' => UnconfirmedReplace,
            b'e' => CancelRejected,
            _ => return None,
        })
    }

    pub fn is_live(self) -> bool {
        matches!(
            self,
            OrderStatus::UnconfirmedNew
                | OrderStatus::PendingNew
                | OrderStatus::New
                | OrderStatus::PartiallyFilled
        )
    }

    /// Terminal failures that release outstanding exposure.
    pub fn releases_exposure(self) -> bool {
        matches!(
            self,
            OrderStatus::RiskRejected
                | OrderStatus::Canceled
                | OrderStatus::Rejected
                | OrderStatus::Expired
                | OrderStatus::Calculated
                | OrderStatus::DoneForDay
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExecTransType {
    New = b'0',
    Cancel = b'1',
    Correct = b'2',
    Status = b'3',
}

impl ExecTransType {
    pub fn from_char(c: u8) -> Option<ExecTransType> {
        match c {
            b'0' => Some(ExecTransType::New),
            b'1' => Some(ExecTransType::Cancel),
            b'2' => Some(ExecTransType::Correct),
            b'3' => Some(ExecTransType::Status),
            _ => None,
        }
    }
}

/// What a caller asks to trade; the connectivity manager turns one of
/// these into a live order.
#[derive(Clone)]
pub struct OrderDraft {
    pub sec: Arc<Security>,
    pub sub_account: Arc<SubAccount>,
    pub side: Side,
    pub kind: OrdType,
    pub tif: Tif,
    pub qty: f64,
    pub price: f64,
    pub stop_price: f64,
}

/// Mutable order state, guarded by the order's own lock; everything
/// else on an order is immutable once placed.
#[derive(Debug, Clone, Copy)]
pub struct OrderState {
    pub status: OrderStatus,
    pub avg_px: f64,
    pub cum_qty: f64,
    pub leaves_qty: f64,
}

pub struct Order {
    pub id: OrderId,
    /// Cancel-reference: the order this cancel targets, zero otherwise.
    pub orig_id: OrderId,
    pub algo_id: AlgoId,
    pub user: Arc<User>,
    pub sub_account: Arc<SubAccount>,
    /// Resolved by the connectivity manager; absent only on orders
    /// rejected before broker lookup.
    pub broker_account: Option<Arc<BrokerAccount>>,
    pub sec: Arc<Security>,
    pub side: Side,
    pub kind: OrdType,
    pub tif: Tif,
    pub qty: f64,
    pub price: f64,
    pub stop_price: f64,
    /// Creation time, microseconds UTC.
    pub tm: i64,
    pub inst: Option<Arc<Instrument>>,
    state: Mutex<OrderState>,
}

impl Order {
    pub fn new(
        draft: OrderDraft,
        user: Arc<User>,
        broker_account: Option<Arc<BrokerAccount>>,
        algo_id: AlgoId,
        inst: Option<Arc<Instrument>>,
    ) -> Order {
        Order {
            id: 0,
            orig_id: 0,
            algo_id,
            user,
            sub_account: draft.sub_account,
            broker_account,
            sec: draft.sec,
            side: draft.side,
            kind: draft.kind,
            tif: draft.tif,
            qty: draft.qty,
            price: draft.price,
            stop_price: draft.stop_price,
            tm: 0,
            inst,
            state: Mutex::new(OrderState {
                status: OrderStatus::UnconfirmedNew,
                avg_px: 0.0,
                cum_qty: 0.0,
                leaves_qty: 0.0,
            }),
        }
    }

    /// Shadow order a cancel travels on: clones the original's identity
    /// with `orig_id` pointing back at it.
    pub fn cancel_shadow(orig: &Order, id: OrderId, tm: i64) -> Order {
        Order {
            id,
            orig_id: orig.id,
            algo_id: orig.algo_id,
            user: orig.user.clone(),
            sub_account: orig.sub_account.clone(),
            broker_account: orig.broker_account.clone(),
            sec: orig.sec.clone(),
            side: orig.side,
            kind: orig.kind,
            tif: orig.tif,
            qty: orig.qty,
            price: orig.price,
            stop_price: orig.stop_price,
            tm,
            inst: orig.inst.clone(),
            state: Mutex::new(OrderState {
                status: OrderStatus::UnconfirmedCancel,
                ..*orig.state.lock()
            }),
        }
    }

    pub fn is_buy(&self) -> bool {
        self.side.is_buy()
    }

    pub fn broker_id(&self) -> BrokerAccountId {
        self.broker_account.as_ref().map(|b| b.id).unwrap_or(0)
    }

    pub fn state(&self) -> OrderState {
        *self.state.lock()
    }

    pub fn status(&self) -> OrderStatus {
        self.state.lock().status
    }

    pub fn is_live(&self) -> bool {
        self.status().is_live()
    }

    pub fn set_leaves(&self, leaves: f64) {
        self.state.lock().leaves_qty = leaves;
    }
}

/// One normalized execution event flowing from the adapter callback
/// through journal, positions, algo runtime, and the client stream.
pub struct Confirmation {
    pub order: Arc<Order>,
    pub exec_type: OrderStatus,
    pub exec_trans_type: ExecTransType,
    pub last_shares: f64,
    pub last_px: f64,
    /// Released quantity, filled in when a terminal event is handled.
    pub leaves_qty: f64,
    pub exec_id: String,
    pub venue_order_id: String,
    pub text: String,
    /// Microseconds UTC.
    pub transaction_time: i64,
}

impl Confirmation {
    pub fn status(order: Arc<Order>, exec_type: OrderStatus, text: &str, tm: i64) -> Confirmation {
        let mut cm = Confirmation {
            order,
            exec_type,
            exec_trans_type: ExecTransType::New,
            last_shares: 0.0,
            last_px: 0.0,
            leaves_qty: 0.0,
            exec_id: String::new(),
            venue_order_id: String::new(),
            text: String::new(),
            transaction_time: tm,
        };
        if exec_type == OrderStatus::New {
            cm.venue_order_id = text.to_string();
        } else {
            cm.text = text.to_string();
        }
        cm
    }

    pub fn fill(
        order: Arc<Order>,
        qty: f64,
        px: f64,
        exec_id: &str,
        is_partial: bool,
        trans: ExecTransType,
        tm: i64,
    ) -> Confirmation {
        Confirmation {
            order,
            exec_type: if is_partial {
                OrderStatus::PartiallyFilled
            } else {
                OrderStatus::Filled
            },
            exec_trans_type: trans,
            last_shares: qty,
            last_px: px,
            leaves_qty: 0.0,
            exec_id: exec_id.to_string(),
            venue_order_id: String::new(),
            text: String::new(),
            transaction_time: tm,
        }
    }
}

/// One parsed journal record, the shape warm catch-up hands to the
/// client port.
#[derive(Debug, Clone)]
pub struct OrderReplay {
    pub seq: u32,
    pub exec_type: OrderStatus,
    pub sub_account_id: SubAccountId,
    pub id: OrderId,
    pub tm: i64,
    pub orig_id: OrderId,
    pub algo_id: AlgoId,
    pub qty: f64,
    pub price: f64,
    pub stop_price: f64,
    pub side: Side,
    pub kind: OrdType,
    pub tif: Tif,
    pub sec_id: SecurityId,
    pub user_id: UserId,
    pub broker_account_id: BrokerAccountId,
    pub last_shares: f64,
    pub last_px: f64,
    pub exec_trans_type: ExecTransType,
    pub exec_id: String,
    pub venue_order_id: String,
    pub text: String,
}

impl Default for OrderReplay {
    fn default() -> Self {
        OrderReplay {
            seq: 0,
            exec_type: OrderStatus::UnconfirmedNew,
            sub_account_id: 0,
            id: 0,
            tm: 0,
            orig_id: 0,
            algo_id: 0,
            qty: 0.0,
            price: 0.0,
            stop_price: 0.0,
            side: Side::Buy,
            kind: OrdType::Limit,
            tif: Tif::Day,
            sec_id: 0,
            user_id: 0,
            broker_account_id: 0,
            last_shares: 0.0,
            last_px: 0.0,
            exec_trans_type: ExecTransType::New,
            exec_id: String::new(),
            venue_order_id: String::new(),
            text: String::new(),
        }
    }
}

/// Process-wide map of live and historical orders plus the confirmation
/// journal. Reads are lock-light; journal writes are serialized on a
/// dedicated single-writer strand so the emitting thread never blocks
/// on the file.
pub struct OrderBook {
    orders: RwLock<HashMap<OrderId, Arc<Order>>>,
    order_id_counter: AtomicU32,
    seq_counter: AtomicU32,
    exec_ids: Mutex<HashSet<String>>,
    journal: Mutex<File>,
    path: PathBuf,
    writer: TaskPool,
    positions: Arc<PositionManager>,
    algos: OnceLock<Arc<AlgoManager>>,
    publisher: OnceLock<Arc<Publisher>>,
}

impl OrderBook {
    pub fn open(path: impl AsRef<Path>, positions: Arc<PositionManager>) -> Result<Arc<OrderBook>> {
        let path = path.as_ref().to_path_buf();
        let journal = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::Journal(format!("failed to open {}: {}", path.display(), e)))?;
        Ok(Arc::new(OrderBook {
            orders: Default::default(),
            order_id_counter: AtomicU32::new(0),
            seq_counter: AtomicU32::new(0),
            exec_ids: Default::default(),
            journal: Mutex::new(journal),
            path,
            writer: TaskPool::new("confirmation-writer"),
            positions,
            algos: OnceLock::new(),
            publisher: OnceLock::new(),
        }))
    }

    pub fn set_algo_manager(&self, algos: Arc<AlgoManager>) {
        let _ = self.algos.set(algos);
    }

    pub fn set_publisher(&self, publisher: Arc<Publisher>) {
        let _ = self.publisher.set(publisher);
    }

    pub fn new_order_id(&self) -> OrderId {
        self.order_id_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn get(&self, id: OrderId) -> Option<Arc<Order>> {
        self.orders.read().get(&id).cloned()
    }

    pub fn orders(&self) -> Vec<Arc<Order>> {
        self.orders.read().values().cloned().collect()
    }

    pub fn live_orders(&self) -> Vec<Arc<Order>> {
        self.orders
            .read()
            .values()
            .filter(|o| o.is_live())
            .cloned()
            .collect()
    }

    /// Tests and inserts in one step, so a losing racer observes `true`.
    pub fn is_dup_exec_id(&self, exec_id: &str) -> bool {
        !self.exec_ids.lock().insert(exec_id.to_string())
    }

    /// Apply one confirmation: mutate order state, feed positions and
    /// the algo runtime, then (unless replaying) publish and journal on
    /// the writer strand.
    pub fn handle(self: &Arc<Self>, mut cm: Confirmation, offline: bool) {
        if cm.order.id == 0 {
            // rejected before an id was allocated: publish only
            let cm = Arc::new(cm);
            if let Some(publisher) = self.publisher.get() {
                publisher.publish_confirmation(0, &cm);
            }
            return;
        }
        self.update_order(&mut cm);
        let cm = Arc::new(cm);
        self.positions.handle(&cm, offline);
        if cm.order.inst.is_some() {
            if let Some(algos) = self.algos.get() {
                algos.handle(cm.clone());
            }
        }
        if offline {
            return;
        }
        let book = self.clone();
        self.writer.push(move || book.write_record(&cm));
    }

    fn update_order(&self, cm: &mut Confirmation) {
        let ord = cm.order.clone();
        match cm.exec_type {
            OrderStatus::UnconfirmedNew | OrderStatus::UnconfirmedCancel => {
                self.orders.write().insert(ord.id, ord.clone());
            }
            OrderStatus::PartiallyFilled | OrderStatus::Filled => {
                let mut st = ord.state.lock();
                match cm.exec_trans_type {
                    ExecTransType::New => {
                        st.avg_px = (st.avg_px * st.cum_qty + cm.last_px * cm.last_shares)
                            / (st.cum_qty + cm.last_shares);
                        st.cum_qty += cm.last_shares;
                        st.leaves_qty -= cm.last_shares;
                        if st.cum_qty >= ord.qty {
                            st.status = OrderStatus::Filled;
                        } else if st.status.is_live() {
                            st.status = OrderStatus::PartiallyFilled;
                        }
                    }
                    ExecTransType::Cancel => {
                        // bust: reverse against the original fill, clamped at zero
                        if st.cum_qty <= cm.last_shares {
                            st.avg_px = 0.0;
                            st.cum_qty = 0.0;
                        } else {
                            st.avg_px = (st.avg_px * st.cum_qty - cm.last_px * cm.last_shares)
                                / (st.cum_qty - cm.last_shares);
                            st.cum_qty -= cm.last_shares;
                        }
                    }
                    _ => {
                        warn!(order = ord.id, "unsupported exec trans type, ignored");
                    }
                }
            }
            OrderStatus::New | OrderStatus::PendingNew | OrderStatus::PendingCancel => {
                ord.state.lock().status = cm.exec_type;
            }
            s if s.releases_exposure() => {
                let mut st = ord.state.lock();
                cm.leaves_qty = st.leaves_qty;
                st.leaves_qty = 0.0;
                st.status = cm.exec_type;
            }
            _ => {}
        }
    }

    /// Runs on the writer strand: the published seq always matches the
    /// on-disk seq.
    fn write_record(&self, cm: &Arc<Confirmation>) {
        let seq = self.seq_counter.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(publisher) = self.publisher.get() {
            publisher.publish_confirmation(seq, cm);
        }
        let body = Self::record_body(cm);
        if body.is_empty() {
            return;
        }
        let bytes = journal::encode(
            seq,
            cm.order.sub_account.id,
            cm.exec_type as u8,
            &body,
        );
        let mut journal = self.journal.lock();
        if let Err(e) = journal.write_all(&bytes).and_then(|_| journal.flush()) {
            error!(path = %self.path.display(), "journal write failed: {}", e);
        }
    }

    fn record_body(cm: &Confirmation) -> String {
        let ord = &cm.order;
        match cm.exec_type {
            OrderStatus::New => format!(
                "{} {} {}",
                ord.id, cm.transaction_time, cm.venue_order_id
            ),
            OrderStatus::PartiallyFilled | OrderStatus::Filled => format!(
                "{} {} {} {} {} {}",
                ord.id,
                cm.transaction_time,
                cm.last_shares,
                cm.last_px,
                cm.exec_trans_type as u8 as char,
                cm.exec_id
            ),
            OrderStatus::PendingNew
            | OrderStatus::PendingCancel
            | OrderStatus::CancelRejected
            | OrderStatus::Canceled
            | OrderStatus::Rejected
            | OrderStatus::Expired
            | OrderStatus::Calculated
            | OrderStatus::DoneForDay => {
                format!("{} {} {}", ord.id, cm.transaction_time, cm.text)
            }
            OrderStatus::UnconfirmedNew => format!(
                "{} {} {} {} {} {} {} {} {} {} {} {}",
                ord.id,
                cm.transaction_time,
                ord.algo_id,
                ord.qty,
                ord.price,
                ord.stop_price,
                ord.side as u8 as char,
                ord.kind as u8 as char,
                ord.tif as u8 as char,
                ord.sec.id,
                ord.user.id,
                ord.broker_id()
            ),
            OrderStatus::UnconfirmedCancel => {
                format!("{} {} {}", ord.id, cm.transaction_time, ord.orig_id)
            }
            OrderStatus::RiskRejected => format!("{} {}", ord.id, cm.text),
            _ => String::new(),
        }
    }

    fn parse_record(rec: &journal::RawRecord<'_>) -> Option<OrderReplay> {
        let exec_type = OrderStatus::from_char(rec.exec_type)?;
        let mut out = OrderReplay {
            seq: rec.seq,
            exec_type,
            sub_account_id: rec.sub_account_id,
            ..Default::default()
        };
        match exec_type {
            OrderStatus::New => {
                let (tokens, rest) = journal::split_tokens(rec.body, 2)?;
                out.id = tokens[0].parse().ok()?;
                out.tm = tokens[1].parse().ok()?;
                out.venue_order_id = rest.to_string();
            }
            OrderStatus::PartiallyFilled | OrderStatus::Filled => {
                let (tokens, rest) = journal::split_tokens(rec.body, 5)?;
                out.id = tokens[0].parse().ok()?;
                out.tm = tokens[1].parse().ok()?;
                out.last_shares = tokens[2].parse().ok()?;
                out.last_px = tokens[3].parse().ok()?;
                out.exec_trans_type = ExecTransType::from_char(*tokens[4].as_bytes().first()?)?;
                out.exec_id = rest.to_string();
            }
            OrderStatus::PendingNew
            | OrderStatus::PendingCancel
            | OrderStatus::CancelRejected
            | OrderStatus::Canceled
            | OrderStatus::Rejected
            | OrderStatus::Expired
            | OrderStatus::Calculated
            | OrderStatus::DoneForDay => {
                let (tokens, rest) = journal::split_tokens(rec.body, 2)?;
                out.id = tokens[0].parse().ok()?;
                out.tm = tokens[1].parse().ok()?;
                out.text = rest.to_string();
            }
            OrderStatus::UnconfirmedNew => {
                let (tokens, _) = journal::split_tokens(rec.body, 12)?;
                out.id = tokens[0].parse().ok()?;
                out.tm = tokens[1].parse().ok()?;
                out.algo_id = tokens[2].parse().ok()?;
                out.qty = tokens[3].parse().ok()?;
                out.price = tokens[4].parse().ok()?;
                out.stop_price = tokens[5].parse().ok()?;
                out.side = Side::from_char(*tokens[6].as_bytes().first()?)?;
                out.kind = OrdType::from_char(*tokens[7].as_bytes().first()?)?;
                out.tif = Tif::from_char(*tokens[8].as_bytes().first()?)?;
                out.sec_id = tokens[9].parse().ok()?;
                out.user_id = tokens[10].parse().ok()?;
                out.broker_account_id = tokens[11].parse().ok()?;
            }
            OrderStatus::UnconfirmedCancel => {
                let (tokens, _) = journal::split_tokens(rec.body, 3)?;
                out.id = tokens[0].parse().ok()?;
                out.tm = tokens[1].parse().ok()?;
                out.orig_id = tokens[2].parse().ok()?;
            }
            OrderStatus::RiskRejected => {
                let (tokens, rest) = journal::split_tokens(rec.body, 1)?;
                out.id = tokens[0].parse().ok()?;
                out.text = rest.to_string();
            }
            _ => return None,
        }
        Some(out)
    }

    /// Cold recovery: rebuild orders and positions by re-dispatching
    /// every record through the normal handle path with journaling and
    /// publishing disabled, then bootstrap the id counters so ids are
    /// never reused across restarts on the same day.
    pub fn recover(self: &Arc<Self>, cache: &ReferenceCache) -> Result<()> {
        let bytes = match std::fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => vec![],
            Err(e) => return Err(e.into()),
        };
        let records = journal::scan(&bytes)
            .map_err(|e| Error::Journal(format!("{}: {}", self.path.display(), e)))?;
        let mut max_id: OrderId = 0;
        for (ln, rec) in records.iter().enumerate() {
            self.seq_counter.store(rec.seq, Ordering::Relaxed);
            let Some(ev) = Self::parse_record(rec) else {
                error!(line = ln + 1, "failed to parse confirmation record");
                continue;
            };
            self.apply_replayed(cache, ev, ln + 1, &mut max_id);
        }
        let weekday = chrono::Datelike::weekday(&chrono::Local::now())
            .num_days_from_sunday();
        let secs = {
            use chrono::Timelike;
            let now = chrono::Local::now();
            now.hour() * 3600 + now.minute() * 60 + now.second()
        };
        let min_counter = weekday * 10_000_000 + secs * 50;
        let mut counter = max_id + 100_000;
        if counter < min_counter {
            counter = min_counter;
        }
        self.order_id_counter.store(counter, Ordering::Relaxed);
        self.seq_counter.fetch_add(1000, Ordering::Relaxed);
        info!(
            orders = self.orders.read().len(),
            next_order_id = counter + 1,
            "confirmation journal replayed"
        );
        Ok(())
    }

    fn apply_replayed(
        self: &Arc<Self>,
        cache: &ReferenceCache,
        ev: OrderReplay,
        ln: usize,
        max_id: &mut OrderId,
    ) {
        match ev.exec_type {
            OrderStatus::UnconfirmedNew => {
                let Some(sec) = cache.security(ev.sec_id) else {
                    error!(line = ln, id = ev.sec_id, "unknown security id in journal");
                    return;
                };
                let Some(user) = cache.user(ev.user_id) else {
                    error!(line = ln, id = ev.user_id, "unknown user id in journal");
                    return;
                };
                let Some(sub_account) = cache.sub_account(ev.sub_account_id) else {
                    error!(line = ln, id = ev.sub_account_id, "unknown sub account id in journal");
                    return;
                };
                let Some(broker) = cache.broker_account(ev.broker_account_id) else {
                    error!(line = ln, id = ev.broker_account_id, "unknown broker account id in journal");
                    return;
                };
                let mut ord = Order::new(
                    OrderDraft {
                        sec: sec.clone(),
                        sub_account: sub_account.clone(),
                        side: ev.side,
                        kind: ev.kind,
                        tif: ev.tif,
                        qty: ev.qty,
                        price: ev.price,
                        stop_price: ev.stop_price,
                    },
                    user.clone(),
                    Some(broker.clone()),
                    ev.algo_id,
                    None,
                );
                ord.id = ev.id;
                ord.tm = ev.tm;
                ord.set_leaves(ev.qty);
                let cm = Confirmation::status(
                    Arc::new(ord),
                    OrderStatus::UnconfirmedNew,
                    "",
                    ev.tm,
                );
                if ev.id > *max_id {
                    *max_id = ev.id;
                }
                self.handle(cm, true);
            }
            OrderStatus::UnconfirmedCancel => {
                let Some(orig) = self.get(ev.orig_id) else {
                    error!(line = ln, orig_id = ev.orig_id, "unknown orig id in journal");
                    return;
                };
                let shadow = Order::cancel_shadow(&orig, ev.id, ev.tm);
                let cm = Confirmation::status(
                    Arc::new(shadow),
                    OrderStatus::UnconfirmedCancel,
                    "",
                    ev.tm,
                );
                if ev.id > *max_id {
                    *max_id = ev.id;
                }
                self.handle(cm, true);
            }
            OrderStatus::PartiallyFilled | OrderStatus::Filled => {
                if self.is_dup_exec_id(&ev.exec_id) {
                    error!(line = ln, exec_id = %ev.exec_id, "duplicate exec id in journal");
                    return;
                }
                let Some(ord) = self.get(ev.id) else {
                    error!(line = ln, id = ev.id, "unknown order id in journal");
                    return;
                };
                let cm = Confirmation::fill(
                    ord,
                    ev.last_shares,
                    ev.last_px,
                    &ev.exec_id,
                    ev.exec_type == OrderStatus::PartiallyFilled,
                    ev.exec_trans_type,
                    ev.tm,
                );
                self.handle(cm, true);
            }
            _ => {
                let Some(ord) = self.get(ev.id) else {
                    error!(line = ln, id = ev.id, "unknown order id in journal");
                    return;
                };
                let text = if ev.exec_type == OrderStatus::New {
                    ev.venue_order_id.clone()
                } else {
                    ev.text.clone()
                };
                let cm = Confirmation::status(ord, ev.exec_type, &text, ev.tm);
                self.handle(cm, true);
            }
        }
    }

    /// Warm catch-up: stream records after `seq0` the caller is
    /// permissioned to see, without touching book state.
    pub fn replay_since(
        &self,
        seq0: u32,
        user: &User,
        mut send: impl FnMut(OrderReplay),
    ) -> Result<()> {
        let bytes = match std::fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => vec![],
            Err(e) => return Err(e.into()),
        };
        for rec in journal::scan(&bytes)? {
            if rec.seq <= seq0 {
                continue;
            }
            if !user.is_admin && !user.permissioned(rec.sub_account_id) {
                continue;
            }
            if let Some(ev) = Self::parse_record(&rec) {
                send(ev);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub mod testkit {
    use super::*;
    use crate::marketdata::MarketDataHub;
    use crate::reference::testkit::{small_store, MemStore};

    pub struct Fixture {
        pub store: Arc<MemStore>,
        pub cache: Arc<ReferenceCache>,
        pub hub: Arc<MarketDataHub>,
        pub positions: Arc<PositionManager>,
        pub book: Arc<OrderBook>,
        pub dir: PathBuf,
    }

    static COUNTER: AtomicU32 = AtomicU32::new(0);

    pub fn fixture(tag: &str) -> Fixture {
        let dir = std::env::temp_dir().join(format!(
            "meridian-book-{}-{}-{}",
            tag,
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        fixture_in(small_store(), dir)
    }

    pub fn fixture_in(store: MemStore, dir: PathBuf) -> Fixture {
        let store = Arc::new(store);
        let cache = Arc::new(ReferenceCache::load(store.as_ref()).unwrap());
        let hub = Arc::new(MarketDataHub::new(cache.clone()));
        let positions = PositionManager::new(
            store.clone() as Arc<dyn crate::reference::ReferenceStore>,
            cache.clone(),
            hub.clone(),
            &dir,
        )
        .unwrap();
        let book = OrderBook::open(dir.join("confirmations"), positions.clone()).unwrap();
        Fixture {
            store,
            cache,
            hub,
            positions,
            book,
            dir,
        }
    }

    pub fn draft(fx: &Fixture, qty: f64, price: f64) -> OrderDraft {
        OrderDraft {
            sec: fx.cache.security(10).unwrap().clone(),
            sub_account: fx.cache.sub_account(2).unwrap().clone(),
            side: Side::Buy,
            kind: OrdType::Limit,
            tif: Tif::Day,
            qty,
            price,
            stop_price: 0.0,
        }
    }

    pub fn new_order(fx: &Fixture, id: OrderId, qty: f64, price: f64) -> Arc<Order> {
        let mut ord = Order::new(
            draft(fx, qty, price),
            fx.cache.user(1).unwrap().clone(),
            Some(fx.cache.broker_account(3).unwrap().clone()),
            0,
            None,
        );
        ord.id = id;
        ord.tm = 1;
        ord.set_leaves(qty);
        Arc::new(ord)
    }
}

#[cfg(test)]
mod tests {
    use super::testkit::*;
    use super::*;

    fn drain_writer(book: &Arc<OrderBook>) {
        // journal writes are strand-serialized; a barrier task flushes them
        let (tx, rx) = flume::bounded(1);
        book.writer.push(move || {
            let _ = tx.send(());
        });
        rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn fill_then_terminal_zeroes_leaves() {
        let fx = fixture("fill");
        let ord = new_order(&fx, 7, 200.0, 5.0);
        fx.book.handle(
            Confirmation::status(ord.clone(), OrderStatus::UnconfirmedNew, "", 1),
            false,
        );
        fx.book
            .handle(Confirmation::status(ord.clone(), OrderStatus::New, "V1", 2), false);
        fx.book.handle(
            Confirmation::fill(ord.clone(), 80.0, 5.0, "E1", true, ExecTransType::New, 3),
            false,
        );
        let st = ord.state();
        assert_eq!(st.status, OrderStatus::PartiallyFilled);
        assert_eq!(st.cum_qty, 80.0);
        assert_eq!(st.leaves_qty, 120.0);
        assert_eq!(st.avg_px, 5.0);

        fx.book.handle(
            Confirmation::status(ord.clone(), OrderStatus::Canceled, "", 4),
            false,
        );
        let st = ord.state();
        assert_eq!(st.status, OrderStatus::Canceled);
        assert_eq!(st.leaves_qty, 0.0);
        assert!(st.cum_qty + st.leaves_qty <= ord.qty);
    }

    #[test]
    fn full_fill_sets_filled_and_average() {
        let fx = fixture("full");
        let ord = new_order(&fx, 8, 100.0, 10.0);
        fx.book.handle(
            Confirmation::status(ord.clone(), OrderStatus::UnconfirmedNew, "", 1),
            false,
        );
        fx.book.handle(
            Confirmation::fill(ord.clone(), 100.0, 10.0, "E1", false, ExecTransType::New, 2),
            false,
        );
        let st = ord.state();
        assert_eq!(st.status, OrderStatus::Filled);
        assert_eq!(st.cum_qty, 100.0);
        assert_eq!(st.avg_px, 10.0);
        assert_eq!(st.leaves_qty, 0.0);
    }

    #[test]
    fn bust_reverses_fill_but_not_status() {
        let fx = fixture("bust");
        let ord = new_order(&fx, 9, 100.0, 10.0);
        fx.book.handle(
            Confirmation::status(ord.clone(), OrderStatus::UnconfirmedNew, "", 1),
            false,
        );
        fx.book.handle(
            Confirmation::fill(ord.clone(), 100.0, 10.0, "E1", false, ExecTransType::New, 2),
            false,
        );
        fx.book.handle(
            Confirmation::fill(ord.clone(), 100.0, 10.0, "E2", false, ExecTransType::Cancel, 3),
            false,
        );
        let st = ord.state();
        // the state machine does not un-terminate
        assert_eq!(st.status, OrderStatus::Filled);
        assert_eq!(st.cum_qty, 0.0);
        assert_eq!(st.avg_px, 0.0);
    }

    #[test]
    fn dup_exec_id_inserts_once() {
        let fx = fixture("dup");
        assert!(!fx.book.is_dup_exec_id("E1"));
        assert!(fx.book.is_dup_exec_id("E1"));
        assert!(!fx.book.is_dup_exec_id("E2"));
    }

    #[test]
    fn journal_replay_rebuilds_book_and_positions() {
        let fx = fixture("replay");
        let ord = new_order(&fx, 7, 200.0, 5.0);
        fx.book.handle(
            Confirmation::status(ord.clone(), OrderStatus::UnconfirmedNew, "", 1),
            false,
        );
        fx.book
            .handle(Confirmation::status(ord.clone(), OrderStatus::New, "V7", 2), false);
        fx.book.handle(
            Confirmation::fill(ord.clone(), 80.0, 5.0, "E3", true, ExecTransType::New, 3),
            false,
        );
        drain_writer(&fx.book);

        // fresh book over the same journal
        let fx2 = fixture_in(crate::reference::testkit::small_store(), fx.dir.clone());
        fx2.book.recover(&fx2.cache).unwrap();
        let ord = fx2.book.get(7).expect("order rebuilt");
        let st = ord.state();
        assert_eq!(st.status, OrderStatus::PartiallyFilled);
        assert_eq!(st.cum_qty, 80.0);
        assert_eq!(st.leaves_qty, 120.0);
        assert_eq!(st.avg_px, 5.0);
        let pos = fx2.positions.user_position(1, 10);
        assert_eq!(pos.qty, 80.0);
        assert_eq!(pos.avg_price, 5.0);

        // warm catch-up from the seq of New(7) yields only the fill
        let new_seq = {
            let bytes = std::fs::read(fx.dir.join("confirmations")).unwrap();
            journal::scan(&bytes)
                .unwrap()
                .iter()
                .find(|r| r.exec_type == b'0')
                .unwrap()
                .seq
        };
        let user = fx2.cache.user(1).unwrap().clone();
        let mut seen = vec![];
        fx2.book
            .replay_since(new_seq, &user, |ev| seen.push(ev))
            .unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].exec_type, OrderStatus::PartiallyFilled);
        assert_eq!(seen[0].last_shares, 80.0);
        assert_eq!(seen[0].exec_id, "E3");
    }

    #[test]
    fn order_id_counter_never_decreases_across_restart() {
        let fx = fixture("counter");
        let ord = new_order(&fx, 42, 10.0, 1.0);
        fx.book.handle(
            Confirmation::status(ord, OrderStatus::UnconfirmedNew, "", 1),
            false,
        );
        drain_writer(&fx.book);
        let fx2 = fixture_in(crate::reference::testkit::small_store(), fx.dir.clone());
        fx2.book.recover(&fx2.cache).unwrap();
        assert!(fx2.book.new_order_id() > 42 + 100_000);
    }

    #[test]
    fn unknown_replay_ids_are_skipped() {
        let fx = fixture("unknown");
        // hand-craft a fill for an order that was never journaled
        let bytes = journal::encode(1, 2, b'2', "999 5 10 1.5 0 EX");
        std::fs::write(fx.dir.join("confirmations"), bytes).unwrap();
        let fx2 = fixture_in(crate::reference::testkit::small_store(), fx.dir.clone());
        fx2.book.recover(&fx2.cache).unwrap();
        assert!(fx2.book.get(999).is_none());
    }
}
