//! Client port: authenticated connections with reference snapshot,
//! live market-data/order/P&L streams, and journal catch-up.

pub mod server;

use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io::BufRead;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::algo::{parse_param_map, AlgoReplay, ParamKind, ParamValue};
use crate::core::time::{sha1_hex, unix_now};
use crate::engine::Platform;
use crate::marketdata::{DataSrc, MarketData, DEPTH_SIZE};
use crate::orderbook::{
    Confirmation, ExecTransType, OrdType, OrderDraft, OrderReplay, OrderStatus, Side, Tif,
};
use crate::reference::{SecurityId, SubAccountId, User, UserId};

/// Fan-out of confirmations and algo events to every attached
/// connection; each connection applies its own permission filter.
pub struct Publisher {
    conns: RwLock<HashMap<u64, Arc<Connection>>>,
    next_id: AtomicU64,
}

impl Publisher {
    pub fn new() -> Arc<Publisher> {
        Arc::new(Publisher {
            conns: Default::default(),
            next_id: AtomicU64::new(0),
        })
    }

    fn attach(&self, conn: Arc<Connection>) {
        self.conns.write().insert(conn.id, conn);
    }

    fn detach(&self, id: u64) {
        self.conns.write().remove(&id);
    }

    pub fn publish_confirmation(&self, seq: u32, cm: &Arc<Confirmation>) {
        for conn in self.conns.read().values() {
            conn.send_confirmation(seq, cm);
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn publish_algo(
        &self,
        seq: u32,
        algo_id: crate::algo::AlgoId,
        tm: i64,
        token: &str,
        name: &str,
        status: &str,
        body: &str,
        user_id: UserId,
    ) {
        for conn in self.conns.read().values() {
            conn.send_algo(seq, algo_id, tm, token, name, status, body, user_id, false);
        }
    }
}

#[derive(Default)]
struct ConnState {
    user: Option<Arc<User>>,
    /// security -> (last published snapshot, refcount)
    subs: HashMap<SecurityId, (MarketData, i32)>,
    sub_pnl: bool,
    ec_status: HashMap<String, bool>,
    md_status: HashMap<String, bool>,
    pnls: HashMap<SubAccountId, (f64, f64)>,
    single_pnls: HashMap<(SubAccountId, SecurityId), (f64, f64)>,
}

/// One client session. Message handling and the one-second publish tick
/// both run on the connection's own serial task, so state needs no
/// finer locking than the single mutex.
pub struct Connection {
    pub id: u64,
    peer: String,
    platform: Arc<Platform>,
    out: flume::Sender<String>,
    closed: AtomicBool,
    state: Mutex<ConnState>,
}

impl Connection {
    pub fn attach(
        platform: Arc<Platform>,
        peer: String,
        out: flume::Sender<String>,
    ) -> Arc<Connection> {
        let id = platform.publisher.next_id.fetch_add(1, Ordering::Relaxed);
        let conn = Arc::new(Connection {
            id,
            peer,
            platform,
            out,
            closed: AtomicBool::new(false),
            state: Mutex::new(ConnState::default()),
        });
        conn.platform.publisher.attach(conn.clone());
        info!(peer = %conn.peer, "client connected");
        conn
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.platform.publisher.detach(self.id);
            info!(peer = %self.peer, "client disconnected");
        }
    }

    fn send(&self, msg: String) {
        if !self.closed.load(Ordering::SeqCst) {
            let _ = self.out.send(msg);
        }
    }

    fn send_json(&self, value: Value) {
        self.send(value.to_string());
    }

    fn error(&self, what: &str, detail: &str, message: &str) {
        debug!(peer = %self.peer, what, message, "client request error");
        self.send_json(json!(["error", what, detail, message]));
    }

    fn user(&self) -> Option<Arc<User>> {
        self.state.lock().user.clone()
    }

    /// Dispatch one inbound message; `"h"` is the heartbeat.
    pub fn on_message(&self, msg: &str) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if msg == "h" {
            self.send("h".into());
            return;
        }
        let parsed: Value = match serde_json::from_str(msg) {
            Ok(v) => v,
            Err(_) => {
                self.error("json", msg, "invalid json string");
                return;
            }
        };
        let action = parsed
            .get(0)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if action.is_empty() {
            return;
        }
        if action != "login" && action != "validate_user" && self.user().is_none() {
            return;
        }
        match action.as_str() {
            "login" | "validate_user" => self.handle_login(&action, &parsed),
            "securities" => self.handle_securities(),
            "bod" => self.handle_bod(),
            "sub" => self.handle_sub(&parsed),
            "unsub" => self.handle_unsub(&parsed),
            "order" => self.handle_order(&parsed),
            "cancel" => self.handle_cancel(&parsed),
            "algo" => self.handle_algo(&parsed),
            "offline" => self.handle_offline(&parsed),
            "pnl" => self.handle_pnl(&parsed),
            "reconnect" => self.handle_reconnect(&parsed),
            "shutdown" => self.handle_shutdown(&parsed),
            other => debug!(peer = %self.peer, action = other, "unknown action"),
        }
    }

    fn handle_login(&self, action: &str, j: &Value) {
        let name = j.get(1).and_then(Value::as_str).unwrap_or_default();
        let password = sha1_hex(j.get(2).and_then(Value::as_str).unwrap_or_default());
        let user = self.platform.cache.user_by_name(name);
        let status = match user {
            None => "unknown user",
            Some(u) if u.password != password => "wrong password",
            Some(u) if u.is_disabled => "disabled",
            Some(_) => "ok",
        };
        if action == "validate_user" {
            let token = j.get(3).cloned().unwrap_or(Value::Null);
            let id = if status == "ok" {
                user.map(|u| u.id).unwrap_or(0)
            } else {
                0
            };
            self.send_json(json!(["user_validation", id, token]));
            return;
        }
        if status != "ok" {
            self.send_json(json!(["connection", status]));
            return;
        }
        let Some(user) = user.cloned() else { return };
        self.send_json(json!([
            "connection",
            status,
            {
                "session": self.platform.positions.session(),
                "userId": user.id,
                "startTime": self.platform.start_time,
                "securitiesCheckSum": self.platform.cache.checksum(),
            }
        ]));
        let first_login = {
            let mut st = self.state.lock();
            if st.user.is_none() {
                st.user = Some(user.clone());
                true
            } else {
                false
            }
        };
        if !first_login {
            return;
        }
        for acc_id in &user.sub_accounts {
            if let Some(acc) = self.platform.cache.sub_account(*acc_id) {
                self.send_json(json!(["sub_account", acc.id, acc.name]));
            }
        }
        if user.is_admin {
            for other in self.platform.cache.users() {
                for acc_id in &other.sub_accounts {
                    if let Some(acc) = self.platform.cache.sub_account(*acc_id) {
                        self.send_json(json!([
                            "user_sub_account",
                            other.id,
                            acc.id,
                            acc.name
                        ]));
                    }
                }
            }
        }
        for broker in self.platform.cache.broker_accounts() {
            self.send_json(json!(["broker_account", broker.id, broker.name]));
        }
        for (name, defs) in self.platform.algos.definitions() {
            let mut rows = vec![json!("algo_def"), json!(name)];
            for def in defs {
                let mut entry = vec![json!(def.name), json!(def.kind.type_name())];
                match (&def.default, def.kind) {
                    (_, ParamKind::Choice) => {
                        entry.push(json!(def.choices));
                    }
                    (Some(ParamValue::Bool(v)), _) => entry.push(json!(v)),
                    (Some(ParamValue::Int(v)), _) => entry.push(json!(v)),
                    (Some(ParamValue::Float(v)), _) => entry.push(json!(v)),
                    (Some(ParamValue::Str(v)), _) => entry.push(json!(v)),
                    _ => {}
                }
                entry.push(json!(def.required));
                entry.push(json!(def.min));
                entry.push(json!(def.max));
                entry.push(json!(def.precision));
                rows.push(Value::Array(entry));
            }
            self.send_json(Value::Array(rows));
        }
    }

    fn handle_securities(&self) {
        let Some(user) = self.user() else { return };
        debug!(peer = %self.peer, "securities requested");
        for sec in self.platform.cache.securities() {
            if user.is_admin {
                self.send_json(json!([
                    "security",
                    sec.id,
                    sec.symbol,
                    sec.exchange.name,
                    sec.kind,
                    sec.multiplier,
                    sec.close_price,
                    sec.rate,
                    sec.currency,
                    sec.local_symbol,
                    sec.lot_size,
                ]));
            } else {
                self.send_json(json!([
                    "security",
                    sec.id,
                    sec.symbol,
                    sec.exchange.name,
                    sec.kind,
                    sec.lot_size,
                    sec.multiplier,
                ]));
            }
        }
        self.send_json(json!(["securities", "complete"]));
    }

    fn handle_bod(&self) {
        let Some(user) = self.user() else { return };
        for ((acc, sec_id), bod) in self.platform.positions.bods() {
            if !user.is_admin && !user.permissioned(acc) {
                continue;
            }
            self.send_json(json!([
                "bod",
                acc,
                sec_id,
                bod.qty,
                bod.avg_price,
                bod.realized_pnl,
                bod.broker_account_id,
                bod.tm,
            ]));
        }
    }

    fn handle_sub(&self, j: &Value) {
        let Some(items) = j.as_array() else { return };
        let mut deltas = vec![];
        {
            let mut st = self.state.lock();
            for item in &items[1..] {
                let Some(id) = item.as_u64().map(|v| v as SecurityId) else {
                    continue;
                };
                let Some(sec) = self.platform.cache.security(id) else {
                    continue;
                };
                let md = self.platform.hub.get_routed(sec, DataSrc::DEFAULT);
                let entry = st.subs.entry(id).or_insert((MarketData::default(), 0));
                if let Some(delta) = md_delta(id, &md, &entry.0) {
                    deltas.push(delta);
                }
                entry.0 = md;
                entry.1 += 1;
            }
        }
        if !deltas.is_empty() {
            let mut out = vec![json!("md")];
            out.extend(deltas);
            self.send_json(Value::Array(out));
        }
    }

    fn handle_unsub(&self, j: &Value) {
        let Some(items) = j.as_array() else { return };
        let mut st = self.state.lock();
        for item in &items[1..] {
            let Some(id) = item.as_u64().map(|v| v as SecurityId) else {
                continue;
            };
            if let Some(entry) = st.subs.get_mut(&id) {
                entry.1 -= 1;
                if entry.1 <= 0 {
                    st.subs.remove(&id);
                }
            }
        }
    }

    fn handle_order(&self, j: &Value) {
        let Some(user) = self.user() else { return };
        let sec_id = j.get(1).and_then(Value::as_u64).unwrap_or(0) as SecurityId;
        let Some(sec) = self.platform.cache.security(sec_id) else {
            self.error("order", "security id", &format!("Invalid security id: {}", sec_id));
            return;
        };
        let acc_name = j.get(2).and_then(Value::as_str).unwrap_or_default();
        let Some(acc) = self.platform.cache.sub_account_by_name(acc_name) else {
            self.error("order", "sub_account", &format!("Invalid sub_account: {}", acc_name));
            return;
        };
        let side_str = j.get(3).and_then(Value::as_str).unwrap_or_default();
        let Some(side) = Side::parse(side_str) else {
            self.error("order", "side", &format!("Invalid side: {}", side_str));
            return;
        };
        let kind = OrdType::parse(j.get(4).and_then(Value::as_str).unwrap_or_default());
        let tif = Tif::parse(j.get(5).and_then(Value::as_str).unwrap_or_default());
        let qty = j.get(6).and_then(Value::as_f64).unwrap_or(0.0);
        let price = j.get(7).and_then(Value::as_f64).unwrap_or(0.0);
        let stop_price = j.get(8).and_then(Value::as_f64).unwrap_or(0.0);
        if stop_price <= 0.0 && matches!(kind, OrdType::Stop | OrdType::StopLimit) {
            self.error("order", "stop price", "Miss stop price for stop order");
            return;
        }
        self.platform.connectivity.place(
            OrderDraft {
                sec: sec.clone(),
                sub_account: acc.clone(),
                side,
                kind,
                tif,
                qty,
                price,
                stop_price,
            },
            user,
            0,
            None,
        );
    }

    fn handle_cancel(&self, j: &Value) {
        let id = j.get(1).and_then(Value::as_u64).unwrap_or(0) as u32;
        let Some(ord) = self.platform.book.get(id) else {
            self.error("cancel", "order id", &format!("Invalid order id: {}", id));
            return;
        };
        self.platform.connectivity.cancel(&ord);
    }

    fn handle_algo(&self, j: &Value) {
        let Some(user) = self.user() else { return };
        let sub_action = j.get(1).and_then(Value::as_str).unwrap_or_default();
        if sub_action == "cancel" {
            match j.get(2) {
                Some(Value::String(token)) => self.platform.algos.stop_token(token),
                Some(v) => {
                    if let Some(id) = v.as_u64() {
                        self.platform.algos.stop(id as u32);
                    }
                }
                None => {}
            }
            return;
        }
        let name = j.get(2).and_then(Value::as_str).unwrap_or_default();
        let token = j.get(3).and_then(Value::as_str).unwrap_or_default();
        if !token.is_empty() && self.platform.algos.by_token(token).is_some() {
            self.error("algo", "duplicate token", token);
            return;
        }
        let Some(defs) = self.platform.algos.param_defs(name) else {
            self.error("algo", "invalid params", &format!("Unknown algo name: {}", name));
            return;
        };
        let raw = j.get(4).cloned().unwrap_or(Value::Null);
        let params = match parse_param_map(&defs, &raw, &self.platform.cache) {
            Ok(p) => p,
            Err(e) => {
                self.error("algo", "invalid params", &e);
                return;
            }
        };
        for value in params.values() {
            if let ParamValue::Security(st) = value {
                if !user.permissioned(st.sub_account.id) {
                    self.error(
                        "algo",
                        "invalid params",
                        &format!("No permission to trade with account: {}", st.sub_account.name),
                    );
                    return;
                }
            }
        }
        if let Err(e) = self
            .platform
            .algos
            .spawn(name, params, raw.to_string(), user, token)
        {
            self.error("algo", "invalid params", &e);
        }
    }

    fn handle_offline(&self, j: &Value) {
        let Some(user) = self.user() else { return };
        if let Some(seq_algo) = j.get(2).and_then(Value::as_u64) {
            debug!(peer = %self.peer, seq_algo, "offline algos requested");
            let result = self.platform.algos.replay_since(seq_algo as u32, &user, |ev| {
                self.send_algo_replay(&ev);
            });
            if let Err(e) = result {
                warn!("algo replay failed: {}", e);
            }
            self.send_json(json!(["offline_algos", "complete"]));
        }
        let seq0 = j.get(1).and_then(Value::as_u64).unwrap_or(0) as u32;
        debug!(peer = %self.peer, seq0, "offline confirmations requested");
        let result = self.platform.book.replay_since(seq0, &user, |ev| {
            if let Some(msg) = replay_json(&ev) {
                self.send_json(msg);
            }
        });
        if let Err(e) = result {
            warn!("confirmation replay failed: {}", e);
        }
        self.send_json(json!(["offline_orders", "complete"]));
        self.send_json(json!(["offline", "complete"]));
    }

    fn handle_pnl(&self, j: &Value) {
        let Some(user) = self.user() else { return };
        let mut tm0 = j.get(1).and_then(Value::as_i64).unwrap_or(0);
        tm0 = tm0.max(unix_now() - 24 * 3600);
        for (acc, _) in self.platform.positions.pnls() {
            if !user.permissioned(acc) {
                continue;
            }
            let path = self.platform.positions.store_dir().join(format!("pnl-{}", acc));
            let Ok(file) = std::fs::File::open(&path) else {
                continue;
            };
            let mut rows = vec![];
            for line in std::io::BufReader::new(file).lines().map_while(|l| l.ok()) {
                let mut it = line.split_whitespace();
                let (Some(tm), Some(r), Some(u)) = (it.next(), it.next(), it.next()) else {
                    continue;
                };
                let (Ok(tm), Ok(r), Ok(u)) =
                    (tm.parse::<i64>(), r.parse::<f64>(), u.parse::<f64>())
                else {
                    continue;
                };
                if tm > tm0 {
                    rows.push(json!([tm, r, u]));
                }
            }
            if !rows.is_empty() {
                self.send_json(json!(["Pnl", acc, rows]));
            }
        }
        self.state.lock().sub_pnl = true;
    }

    fn handle_reconnect(&self, j: &Value) {
        let name = j.get(1).and_then(Value::as_str).unwrap_or_default();
        if let Some(entry) = self.platform.hub.adapter(name) {
            entry.adapter.reconnect();
            return;
        }
        if let Some(adapter) = self.platform.connectivity.adapter(name) {
            adapter.reconnect();
        }
    }

    fn handle_shutdown(&self, j: &Value) {
        let Some(user) = self.user() else { return };
        if !user.is_admin {
            return;
        }
        let seconds = j.get(1).and_then(Value::as_f64).unwrap_or(0.0).max(3.0);
        let mut interval = 1.0;
        if let Some(n) = j.get(2).and_then(Value::as_f64) {
            if n > interval && n < seconds {
                interval = n;
            }
        }
        let platform = self.platform.clone();
        std::thread::spawn(move || platform.shutdown(seconds, interval));
    }

    /// The one-second publish tick: adapter status transitions, market
    /// data deltas, and (when subscribed) P&L increments.
    pub fn tick(&self) {
        if self.closed.load(Ordering::SeqCst) || self.user().is_none() {
            return;
        }
        self.publish_market_status();
        self.publish_marketdata();
        self.publish_pnl();
    }

    fn publish_market_status(&self) {
        let mut changes = vec![];
        {
            let mut st = self.state.lock();
            for (name, adapter) in self.platform.connectivity.adapters() {
                let up = adapter.connected();
                if st.ec_status.insert(name.clone(), up) != Some(up) {
                    changes.push(json!(["market", "exchange", name, up]));
                }
            }
            for entry in self.platform.hub.adapters() {
                let up = entry.adapter.connected();
                if st.md_status.insert(entry.name.clone(), up) != Some(up) {
                    changes.push(json!(["market", "data", entry.name, up]));
                }
            }
        }
        for msg in changes {
            self.send_json(msg);
        }
    }

    fn publish_marketdata(&self) {
        let mut deltas = vec![];
        {
            let mut st = self.state.lock();
            let subs: Vec<SecurityId> = st.subs.keys().copied().collect();
            for id in subs {
                let Some(sec) = self.platform.cache.security(id) else {
                    continue;
                };
                let md = self.platform.hub.get_routed(sec, DataSrc::DEFAULT);
                if let Some(entry) = st.subs.get_mut(&id) {
                    if let Some(delta) = md_delta(id, &md, &entry.0) {
                        deltas.push(delta);
                    }
                    entry.0 = md;
                }
            }
        }
        if !deltas.is_empty() {
            let mut out = vec![json!("md")];
            out.extend(deltas);
            self.send_json(Value::Array(out));
        }
    }

    fn publish_pnl(&self) {
        let Some(user) = self.user() else { return };
        if !self.state.lock().sub_pnl {
            return;
        }
        let mut messages = vec![];
        {
            let mut st = self.state.lock();
            for ((acc, sec_id), pos) in self.platform.positions.sub_positions() {
                if !user.permissioned(acc) {
                    continue;
                }
                let prev = st.single_pnls.entry((acc, sec_id)).or_default();
                let realized_changed = pos.realized_pnl != prev.0;
                if realized_changed || pos.unrealized_pnl != prev.1 {
                    *prev = (pos.realized_pnl, pos.unrealized_pnl);
                    let mut msg = vec![
                        json!("pnl"),
                        json!(acc),
                        json!(sec_id),
                        json!(pos.unrealized_pnl),
                    ];
                    if realized_changed {
                        msg.push(json!(pos.realized_pnl));
                    }
                    messages.push(Value::Array(msg));
                }
            }
            for (acc, (realized, unrealized)) in self.platform.positions.pnls() {
                if !user.permissioned(acc) {
                    continue;
                }
                let prev = st.pnls.entry(acc).or_default();
                if *prev != (realized, unrealized) {
                    *prev = (realized, unrealized);
                    messages.push(json!(["Pnl", acc, unix_now(), realized, unrealized]));
                }
            }
        }
        for msg in messages {
            self.send_json(msg);
        }
    }

    /// Live confirmation stream, filtered by sub-account permission.
    pub fn send_confirmation(&self, seq: u32, cm: &Arc<Confirmation>) {
        let Some(user) = self.user() else { return };
        if !user.is_admin && !user.permissioned(cm.order.sub_account.id) {
            return;
        }
        if let Some(msg) = confirmation_json(seq, cm, false) {
            self.send_json(msg);
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn send_algo(
        &self,
        seq: u32,
        algo_id: crate::algo::AlgoId,
        tm: i64,
        token: &str,
        name: &str,
        status: &str,
        body: &str,
        user_id: UserId,
        offline: bool,
    ) {
        let Some(user) = self.user() else { return };
        if !user.is_admin && user.id != user_id {
            return;
        }
        let tag = if offline { "Algo" } else { "algo" };
        self.send_json(json!([tag, seq, algo_id, tm, token, name, status, body]));
    }

    fn send_algo_replay(&self, ev: &AlgoReplay) {
        self.send_json(json!([
            "Algo", ev.seq, ev.id, ev.tm, "", ev.name, ev.status, ev.body
        ]));
    }
}

/// Changed-fields-only market data delta: `[sec_id, {..}]` with depth
/// keys `a0..a4`, `A0..A4`, `b0..b4`, `B0..B4`.
fn md_delta(id: SecurityId, md: &MarketData, prev: &MarketData) -> Option<Value> {
    let mut fields = serde_json::Map::new();
    if md.trade.open != prev.trade.open {
        fields.insert("o".into(), json!(md.trade.open));
    }
    if md.trade.high != prev.trade.high {
        fields.insert("h".into(), json!(md.trade.high));
    }
    if md.trade.low != prev.trade.low {
        fields.insert("l".into(), json!(md.trade.low));
    }
    if md.trade.close != prev.trade.close {
        fields.insert("c".into(), json!(md.trade.close));
    }
    if md.trade.qty != prev.trade.qty {
        fields.insert("q".into(), json!(md.trade.qty));
    }
    if md.trade.volume != prev.trade.volume {
        fields.insert("v".into(), json!(md.trade.volume));
    }
    if md.trade.vwap != prev.trade.vwap {
        fields.insert("V".into(), json!(md.trade.vwap));
    }
    for level in 0..DEPTH_SIZE {
        let (d, d0) = (&md.depth[level], &prev.depth[level]);
        if d.ask_price != d0.ask_price {
            fields.insert(format!("a{}", level), json!(d.ask_price));
        }
        if d.ask_size != d0.ask_size {
            fields.insert(format!("A{}", level), json!(d.ask_size));
        }
        if d.bid_price != d0.bid_price {
            fields.insert(format!("b{}", level), json!(d.bid_price));
        }
        if d.bid_size != d0.bid_size {
            fields.insert(format!("B{}", level), json!(d.bid_size));
        }
    }
    if fields.is_empty() {
        return None;
    }
    fields.insert("t".into(), json!(md.tm));
    Some(json!([id, Value::Object(fields)]))
}

fn trans_name(t: ExecTransType) -> Option<&'static str> {
    match t {
        ExecTransType::New => Some("new"),
        ExecTransType::Cancel => Some("cancel"),
        _ => None,
    }
}

/// Live confirmation message; `Order` (capitalised) marks replays.
fn confirmation_json(seq: u32, cm: &Arc<Confirmation>, offline: bool) -> Option<Value> {
    let ord = &cm.order;
    let tag = if offline { "Order" } else { "order" };
    let mut msg = vec![
        json!(tag),
        json!(ord.id),
        json!(cm.transaction_time / 1_000_000),
        json!(seq),
    ];
    match cm.exec_type {
        OrderStatus::UnconfirmedNew => {
            msg.push(json!("unconfirmed"));
            msg.push(json!(ord.sec.id));
            msg.push(json!(ord.algo_id));
            msg.push(json!(ord.user.id));
            msg.push(json!(ord.sub_account.id));
            msg.push(json!(ord.broker_id()));
            msg.push(json!(ord.qty));
            msg.push(json!(ord.price));
            msg.push(json!(ord.side.wire_name()));
            msg.push(json!(ord.kind.wire_name()));
            msg.push(json!(ord.tif.wire_name()));
        }
        OrderStatus::UnconfirmedCancel => {
            msg.push(json!("unconfirmed_cancel"));
            msg.push(json!(ord.orig_id));
        }
        OrderStatus::PendingNew
        | OrderStatus::PendingCancel
        | OrderStatus::New
        | OrderStatus::Canceled => {
            msg.push(json!(status_name(cm.exec_type)?));
            if cm.exec_type == OrderStatus::New {
                msg.push(json!(cm.venue_order_id));
            }
            if !cm.text.is_empty() {
                msg.push(json!(cm.text));
            }
        }
        OrderStatus::Filled | OrderStatus::PartiallyFilled => {
            msg.push(json!(status_name(cm.exec_type)?));
            msg.push(json!(cm.last_shares));
            msg.push(json!(cm.last_px));
            msg.push(json!(cm.exec_id));
            msg.push(json!(trans_name(cm.exec_trans_type)?));
        }
        OrderStatus::Rejected | OrderStatus::CancelRejected | OrderStatus::RiskRejected => {
            msg.push(json!(status_name(cm.exec_type)?));
            msg.push(json!(cm.text));
            if cm.exec_type == OrderStatus::RiskRejected {
                msg.push(json!(ord.sec.id));
                msg.push(json!(ord.algo_id));
                msg.push(json!(ord.user.id));
                msg.push(json!(ord.sub_account.id));
                msg.push(json!(ord.qty));
                msg.push(json!(ord.price));
                msg.push(json!(ord.side.wire_name()));
                msg.push(json!(ord.kind.wire_name()));
                msg.push(json!(ord.tif.wire_name()));
                if ord.orig_id != 0 {
                    msg.push(json!(ord.orig_id));
                }
            }
        }
        _ => return None,
    }
    Some(Value::Array(msg))
}

/// Replayed (historical) confirmation message built from a parsed
/// journal record.
fn replay_json(ev: &OrderReplay) -> Option<Value> {
    let mut msg = vec![
        json!("Order"),
        json!(ev.id),
        json!(ev.tm / 1_000_000),
        json!(ev.seq),
    ];
    match ev.exec_type {
        OrderStatus::UnconfirmedNew => {
            msg.push(json!("unconfirmed"));
            msg.push(json!(ev.sec_id));
            msg.push(json!(ev.algo_id));
            msg.push(json!(ev.user_id));
            msg.push(json!(ev.sub_account_id));
            msg.push(json!(ev.broker_account_id));
            msg.push(json!(ev.qty));
            msg.push(json!(ev.price));
            msg.push(json!(ev.side.wire_name()));
            msg.push(json!(ev.kind.wire_name()));
            msg.push(json!(ev.tif.wire_name()));
        }
        OrderStatus::UnconfirmedCancel => {
            msg.push(json!("unconfirmed_cancel"));
            msg.push(json!(ev.orig_id));
        }
        OrderStatus::PendingNew
        | OrderStatus::PendingCancel
        | OrderStatus::New
        | OrderStatus::Canceled => {
            msg.push(json!(status_name(ev.exec_type)?));
            if ev.exec_type == OrderStatus::New {
                msg.push(json!(ev.venue_order_id));
            }
            if !ev.text.is_empty() {
                msg.push(json!(ev.text));
            }
        }
        OrderStatus::Filled | OrderStatus::PartiallyFilled => {
            msg.push(json!(status_name(ev.exec_type)?));
            msg.push(json!(ev.last_shares));
            msg.push(json!(ev.last_px));
            msg.push(json!(ev.exec_id));
            msg.push(json!(trans_name(ev.exec_trans_type)?));
        }
        OrderStatus::Rejected | OrderStatus::CancelRejected | OrderStatus::RiskRejected => {
            msg.push(json!(status_name(ev.exec_type)?));
            msg.push(json!(ev.text));
        }
        _ => return None,
    }
    Some(Value::Array(msg))
}

fn status_name(s: OrderStatus) -> Option<&'static str> {
    Some(match s {
        OrderStatus::PendingNew => "pending",
        OrderStatus::PendingCancel => "pending_cancel",
        OrderStatus::New => "new",
        OrderStatus::Canceled => "cancelled",
        OrderStatus::Filled => "filled",
        OrderStatus::PartiallyFilled => "partial",
        OrderStatus::Rejected => "new_rejected",
        OrderStatus::CancelRejected => "cancel_rejected",
        OrderStatus::RiskRejected => "risk_rejected",
        _ => return None,
    })
}
