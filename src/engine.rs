//! Platform assembly: construction order, adapter loading, recovery,
//! start, and the admin shutdown sweep.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use crate::algo::AlgoManager;
use crate::client::Publisher;
use crate::core::time::unix_now;
use crate::core::{ConfigFile, Error, Opts, Result};
use crate::execution::{sim::SimExecutionAdapter, ConnectivityManager};
use crate::marketdata::{FeedHandle, MarketDataHub};
use crate::orderbook::OrderBook;
use crate::position::PositionManager;
use crate::reference::{ReferenceCache, ReferenceStore, TomlStore};
use crate::risk::RiskManager;

pub struct PlatformOptions {
    pub algo_threads: usize,
    pub disable_rms: bool,
}

pub struct Platform {
    pub store: Arc<dyn ReferenceStore>,
    pub cache: Arc<ReferenceCache>,
    pub hub: Arc<MarketDataHub>,
    pub positions: Arc<PositionManager>,
    pub book: Arc<OrderBook>,
    pub risk: Arc<RiskManager>,
    pub connectivity: Arc<ConnectivityManager>,
    pub algos: Arc<AlgoManager>,
    pub publisher: Arc<Publisher>,
    pub store_dir: PathBuf,
    pub start_time: i64,
}

impl Platform {
    /// Build everything from CLI options: the reference store behind
    /// `--db_url`, the `./store` journal directory, and the adapter
    /// sections of the config file.
    pub fn build(opts: &Opts) -> Result<Arc<Platform>> {
        let Some(db_url) = &opts.db_url else {
            return Err(Error::Config("db_url not configured".into()));
        };
        let store_dir = PathBuf::from("store");
        std::fs::create_dir_all(&store_dir)?;
        let cfg = ConfigFile::load(&opts.config_file)?;
        let store = Arc::new(TomlStore::open(db_url, opts.db_create_tables)?);
        Self::assemble(
            store,
            &store_dir,
            &cfg,
            PlatformOptions {
                algo_threads: opts.algo_threads,
                disable_rms: opts.disable_rms,
            },
        )
    }

    /// Wire the managers in dependency order, register configured
    /// adapters, and replay both journals.
    pub fn assemble(
        store: Arc<dyn ReferenceStore>,
        store_dir: &Path,
        cfg: &ConfigFile,
        options: PlatformOptions,
    ) -> Result<Arc<Platform>> {
        let cache = Arc::new(ReferenceCache::load(store.as_ref())?);
        let hub = Arc::new(MarketDataHub::new(cache.clone()));
        let positions =
            PositionManager::new(store.clone(), cache.clone(), hub.clone(), store_dir)?;
        let book = OrderBook::open(store_dir.join("confirmations"), positions.clone())?;
        let risk = RiskManager::new(positions.clone(), options.disable_rms);
        let connectivity =
            ConnectivityManager::new(cache.clone(), book.clone(), risk.clone(), hub.clone());
        let algos = AlgoManager::new(
            hub.clone(),
            connectivity.clone(),
            book.clone(),
            store_dir,
            options.algo_threads,
        )?;
        crate::strategies::register_builtin(&algos);
        let publisher = Publisher::new();
        hub.set_algo_manager(algos.clone());
        book.set_algo_manager(algos.clone());
        book.set_publisher(publisher.clone());
        algos.set_publisher(publisher.clone());

        for (name, section) in cfg.market_data_sections() {
            let src = crate::marketdata::DataSrc::from_tag(&section.src).ok_or_else(|| {
                Error::Config(format!("invalid market data src '{}'", section.src))
            })?;
            let handle = FeedHandle::new(src, hub.clone());
            let adapter = crate::feeds::create(section, handle)?;
            hub.add(name, adapter, section)?;
        }
        for (name, section) in cfg.execution_sections() {
            let adapter = match section.adapter.as_str() {
                "sim" => SimExecutionAdapter::new(section, connectivity.clone()),
                other => {
                    return Err(Error::Config(format!(
                        "unknown execution adapter '{}'",
                        other
                    )))
                }
            };
            connectivity.add(name, adapter);
        }

        algos.recover()?;
        book.recover(&cache)?;

        Ok(Arc::new(Platform {
            store,
            cache,
            hub,
            positions,
            book,
            risk,
            connectivity,
            algos,
            publisher,
            store_dir: store_dir.to_path_buf(),
            start_time: unix_now(),
        }))
    }

    /// Start adapters and the mark-to-market loop.
    pub fn start(&self) {
        for entry in self.hub.adapters() {
            entry.adapter.start();
        }
        for (_, adapter) in self.connectivity.adapters() {
            adapter.start();
        }
        self.positions.start_mark_to_market();
        info!("platform started");
    }

    /// Admin shutdown: stop every algo, sweep live orders until the
    /// grace period expires, then hard-kill the process.
    pub fn shutdown(&self, grace_seconds: f64, interval: f64) {
        info!(grace_seconds, "shutting down");
        self.algos.stop_all();
        let mut left = grace_seconds;
        while left > 0.0 {
            info!(seconds_left = left);
            left -= interval;
            std::thread::sleep(std::time::Duration::from_millis((interval * 1000.0) as u64));
            self.connectivity.cancel_all();
        }
        std::thread::sleep(std::time::Duration::from_secs(1));
        let _ = std::process::Command::new("kill")
            .arg("-9")
            .arg(std::process::id().to_string())
            .status();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algo::parse_param_map;
    use crate::client::Connection;
    use crate::marketdata::DataSrc;
    use crate::orderbook::{OrderStatus, Side};
    use crate::reference::testkit::{small_store, MemStore};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    static COUNTER: AtomicU32 = AtomicU32::new(0);

    fn test_platform(tag: &str, tweak: impl FnOnce(&mut MemStore)) -> Arc<Platform> {
        let dir = std::env::temp_dir().join(format!(
            "meridian-platform-{}-{}-{}",
            tag,
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let mut store = small_store();
        tweak(&mut store);
        let cfg = ConfigFile::parse(
            r#"
            [md_sim]
            adapter = "sim"
            src = "SIM"
            markets = "SIMEX"
            interval_ms = 600000

            [ec_sim]
            adapter = "sim"
            markets = "SIMEX"
            "#,
        )
        .unwrap();
        Platform::assemble(
            Arc::new(store),
            &dir,
            &cfg,
            PlatformOptions {
                algo_threads: 2,
                disable_rms: false,
            },
        )
        .unwrap()
    }

    fn wait_until(what: &str, f: impl Fn() -> bool) {
        for _ in 0..1000 {
            if f() {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("timed out waiting for {}", what);
    }

    #[test]
    fn twap_places_first_child_then_stops_clean() {
        let p = test_platform("twap", |_| {});
        let src = DataSrc::from_tag("SIM").unwrap();
        p.hub.update_bid(src, 10, 10.00, 500.0, 0);
        p.hub.update_ask(src, 10, 10.02, 500.0, 0);
        let user = p.cache.user(1).unwrap().clone();
        let params_json = json!({
            "Security": ["SIM", 10, "book-a", "Buy", 1000.0],
            "ValidSeconds": 60,
            "Aggression": "Low",
        });
        let defs = p.algos.param_defs("twap").unwrap();
        let params = parse_param_map(&defs, &params_json, &p.cache).unwrap();
        let id = p
            .algos
            .spawn("twap", params, params_json.to_string(), user.clone(), "t-1")
            .unwrap();

        // schedule ratio 1/60 of 1000 rounds up to one lot at the bid
        wait_until("first child order", || {
            p.book.orders().iter().any(|o| o.algo_id == id)
        });
        let child = p
            .book
            .orders()
            .into_iter()
            .find(|o| o.algo_id == id && o.orig_id == 0)
            .unwrap();
        assert_eq!(child.side, Side::Buy);
        assert_eq!(child.qty, 100.0);
        assert_eq!(child.price, 10.00);

        // the sim venue fills at the submitted price
        wait_until("child filled", || {
            child.status() == OrderStatus::Filled
        });
        assert_eq!(child.state().avg_px, 10.00);
        assert_eq!(child.state().leaves_qty, 0.0);
        let pos = p.positions.sub_position(2, 10);
        assert!(pos.qty >= 100.0);

        p.algos.stop(id);
        wait_until("algo stopped", || {
            !p.algos.algo(id).unwrap().ctx.is_active()
        });
        wait_until("no live child orders", || {
            !p.book
                .orders()
                .iter()
                .any(|o| o.algo_id == id && o.is_live())
        });
        wait_until("terminal journal entry", || {
            let mut statuses = vec![];
            p.algos
                .replay_since(0, &user, |ev| statuses.push(ev.status))
                .unwrap();
            statuses.contains(&"new".to_string()) && statuses.contains(&"terminated".to_string())
        });
        let st = child.state();
        assert!(st.cum_qty <= 1000.0);
        assert_eq!(st.leaves_qty, 0.0);
    }

    fn recv_match(
        rx: &flume::Receiver<String>,
        what: &str,
        pred: impl Fn(&serde_json::Value) -> bool,
    ) -> serde_json::Value {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while std::time::Instant::now() < deadline {
            match rx.recv_timeout(Duration::from_millis(200)) {
                Ok(text) => {
                    if text == "h" {
                        continue;
                    }
                    let v: serde_json::Value = serde_json::from_str(&text).unwrap();
                    if pred(&v) {
                        return v;
                    }
                }
                Err(flume::RecvTimeoutError::Timeout) => {}
                Err(e) => panic!("connection channel closed: {}", e),
            }
        }
        panic!("timed out waiting for {}", what);
    }

    fn tagged(v: &serde_json::Value, tag: &str) -> bool {
        v.get(0).and_then(serde_json::Value::as_str) == Some(tag)
    }

    #[test]
    fn client_login_snapshot_and_order_stream() {
        let p = test_platform("client", |_| {});
        let (tx, rx) = flume::unbounded();
        let conn = Connection::attach(p.clone(), "test-peer".into(), tx);

        conn.on_message("h");
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), "h");

        // bad password is refused
        conn.on_message(&json!(["login", "trader", "nope"]).to_string());
        let refused = recv_match(&rx, "refusal", |v| tagged(v, "connection"));
        assert_eq!(refused[1], "wrong password");

        conn.on_message(&json!(["login", "trader", "pw"]).to_string());
        let ok = recv_match(&rx, "login ok", |v| {
            tagged(v, "connection") && v[1] == "ok"
        });
        assert_eq!(ok[2]["securitiesCheckSum"], p.cache.checksum());
        recv_match(&rx, "sub_account row", |v| tagged(v, "sub_account"));
        recv_match(&rx, "broker_account row", |v| tagged(v, "broker_account"));
        recv_match(&rx, "algo_def row", |v| {
            tagged(v, "algo_def") && v[1] == "twap"
        });

        conn.on_message(&json!(["securities"]).to_string());
        let sec = recv_match(&rx, "security row", |v| tagged(v, "security"));
        assert_eq!(sec[3], "SIMEX");
        recv_match(&rx, "securities complete", |v| {
            tagged(v, "securities") && v[1] == "complete"
        });

        // subscribe, then a tick publishes the delta
        let src = DataSrc::from_tag("SIM").unwrap();
        p.hub.update_bid(src, 10, 9.99, 100.0, 0);
        conn.on_message(&json!(["sub", 10]).to_string());
        let md = recv_match(&rx, "md delta", |v| tagged(v, "md"));
        assert_eq!(md[1][0], 10);
        assert_eq!(md[1][1]["b0"], 9.99);

        // place an order and watch the confirmation stream
        conn.on_message(
            &json!(["order", 10, "book-a", "Buy", "limit", "Day", 100.0, 10.0, 0.0]).to_string(),
        );
        let unconfirmed = recv_match(&rx, "unconfirmed", |v| {
            tagged(v, "order") && v[4] == "unconfirmed"
        });
        assert_eq!(unconfirmed[5], 10); // security id
        recv_match(&rx, "fill", |v| tagged(v, "order") && v[4] == "filled");

        // warm catch-up replays the same events with the Order tag
        conn.on_message(&json!(["offline", 0, 0]).to_string());
        recv_match(&rx, "replayed unconfirmed", |v| {
            tagged(v, "Order") && v[4] == "unconfirmed"
        });
        recv_match(&rx, "offline complete", |v| {
            tagged(v, "offline") && v[1] == "complete"
        });

        conn.close();
    }

    #[test]
    fn client_order_errors_are_reported() {
        let p = test_platform("client-err", |_| {});
        let (tx, rx) = flume::unbounded();
        let conn = Connection::attach(p.clone(), "test-peer".into(), tx);
        conn.on_message(&json!(["login", "trader", "pw"]).to_string());
        recv_match(&rx, "login ok", |v| tagged(v, "connection") && v[1] == "ok");

        conn.on_message(
            &json!(["order", 999, "book-a", "Buy", "limit", "Day", 1, 1, 0]).to_string(),
        );
        let err = recv_match(&rx, "security error", |v| tagged(v, "error"));
        assert_eq!(err[1], "order");

        conn.on_message(&json!(["cancel", 12345]).to_string());
        let err = recv_match(&rx, "cancel error", |v| tagged(v, "error"));
        assert_eq!(err[1], "cancel");
        conn.close();
    }

    #[test]
    fn build_requires_db_url() {
        use clap::Parser;
        let opts = crate::core::Opts::parse_from(["meridian"]);
        assert!(Platform::build(&opts).is_err());
    }
}
