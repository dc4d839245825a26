//! Built-in strategies.

pub mod twap;

use crate::algo::AlgoManager;

/// Register every built-in strategy factory.
pub fn register_builtin(mgr: &AlgoManager) {
    mgr.register("twap", twap::param_defs(), || Box::<twap::Twap>::default());
}
