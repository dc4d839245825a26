//! Simulated execution venue: acknowledges and fills against the
//! submitted price on its own worker thread, the way a real adapter's
//! callbacks land from its io thread.

use std::sync::Arc;
use uuid::Uuid;

use super::{ConnectivityManager, ExecutionAdapter};
use crate::core::AdapterConfig;
use crate::orderbook::{ExecTransType, Order};
use crate::runtime::TaskPool;

pub struct SimExecutionAdapter {
    ecm: Arc<ConnectivityManager>,
    worker: TaskPool,
    /// Fraction of the order filled per fill event; 1.0 fills in one shot.
    fill_ratio: f64,
}

impl SimExecutionAdapter {
    pub fn new(cfg: &AdapterConfig, ecm: Arc<ConnectivityManager>) -> Arc<SimExecutionAdapter> {
        let fill_ratio = cfg.param_f64("fill_ratio").unwrap_or(1.0).clamp(0.1, 1.0);
        Arc::new(SimExecutionAdapter {
            ecm,
            worker: TaskPool::new("ec-sim"),
            fill_ratio,
        })
    }
}

impl ExecutionAdapter for SimExecutionAdapter {
    fn start(&self) {}

    fn connected(&self) -> bool {
        true
    }

    fn place(&self, ord: &Order) -> Result<(), String> {
        let ecm = self.ecm.clone();
        let id = ord.id;
        let qty = ord.qty;
        let px = ord.price;
        let ratio = self.fill_ratio;
        self.worker.push(move || {
            ecm.handle_new(id, &format!("SIM-{}", id), 0);
            let mut left = qty;
            while left > 0.0 {
                let fill = (qty * ratio).min(left);
                left -= fill;
                ecm.handle_fill(
                    id,
                    fill,
                    px,
                    &Uuid::new_v4().to_string(),
                    0,
                    left > 0.0,
                    ExecTransType::New,
                );
            }
        });
        Ok(())
    }

    fn cancel(&self, ord: &Order) -> Result<(), String> {
        let ecm = self.ecm.clone();
        let id = ord.id;
        let orig_id = ord.orig_id;
        self.worker.push(move || {
            ecm.handle_canceled(id, orig_id, "", 0);
        });
        Ok(())
    }
}
