//! Simulated feed: random-walks every subscribed security off its
//! reference close and publishes a one-level book plus prints.

use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

use crate::core::AdapterConfig;
use crate::marketdata::{FeedHandle, MarketDataAdapter};
use crate::reference::{Security, SecurityId};

struct WalkState {
    px: f64,
    tick: f64,
    lot: f64,
}

pub struct SimFeed {
    handle: FeedHandle,
    interval_ms: u64,
    walks: Arc<Mutex<HashMap<SecurityId, WalkState>>>,
    started: AtomicBool,
}

impl SimFeed {
    pub fn new(cfg: &AdapterConfig, handle: FeedHandle) -> Arc<SimFeed> {
        let interval_ms = cfg.param_i64("interval_ms").unwrap_or(1000).max(10) as u64;
        Arc::new(SimFeed {
            handle,
            interval_ms,
            walks: Arc::new(Mutex::new(HashMap::new())),
            started: AtomicBool::new(false),
        })
    }
}

impl MarketDataAdapter for SimFeed {
    fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let walks = self.walks.clone();
        let handle = self.handle.clone();
        let interval = std::time::Duration::from_millis(self.interval_ms);
        std::thread::Builder::new()
            .name("md-sim".into())
            .spawn(move || {
                let mut rng = rand::thread_rng();
                loop {
                    std::thread::sleep(interval);
                    let mut walks = walks.lock();
                    for (id, walk) in walks.iter_mut() {
                        let step = rng.gen_range(-2i64..=2) as f64;
                        walk.px = (walk.px + step * walk.tick).max(walk.tick);
                        let spread = walk.tick.max(walk.px * 0.0002);
                        handle.update_bid(*id, walk.px - spread, walk.lot * 10.0);
                        handle.update_ask(*id, walk.px + spread, walk.lot * 10.0);
                        if rng.gen_bool(0.5) {
                            handle.update_trade(*id, walk.px, walk.lot);
                        }
                    }
                }
            })
            .expect("failed to spawn sim feed thread");
        info!(interval_ms = self.interval_ms, "sim feed started");
    }

    fn subscribe(&self, sec: &Security) {
        let px = if sec.close_price > 0.0 { sec.close_price } else { 100.0 };
        let tick = {
            let t = sec.tick_size(px);
            if t > 0.0 {
                t
            } else {
                0.01
            }
        };
        self.walks.lock().insert(
            sec.id,
            WalkState {
                px,
                tick,
                lot: f64::from(sec.lot_size.max(1)),
            },
        );
    }

    fn connected(&self) -> bool {
        true
    }
}
