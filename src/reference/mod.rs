//! Reference cache - immutable snapshot of securities, exchanges, and
//! accounts, loaded once at startup from the reference store.

pub mod account;
pub mod security;
pub mod store;

pub use account::{
    AccountRisk, BrokerAccount, BrokerAccountId, Limits, PositionValue, SubAccount, SubAccountId,
    Throttle, User, UserId,
};
pub use security::{Exchange, ExchangeId, Security, SecurityId, TickSizeRule};
pub use store::{PositionRow, ReferenceStore, TomlStore};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::info;

use crate::core::time::sha1_hex;
use crate::core::{Error, Result};

/// Read-only lookup over the loaded reference data. Fails fast at load
/// when a row references a missing parent.
pub struct ReferenceCache {
    exchanges: HashMap<ExchangeId, Arc<Exchange>>,
    exchange_by_name: HashMap<String, Arc<Exchange>>,
    securities: HashMap<SecurityId, Arc<Security>>,
    users: HashMap<UserId, Arc<User>>,
    user_by_name: HashMap<String, Arc<User>>,
    sub_accounts: HashMap<SubAccountId, Arc<SubAccount>>,
    sub_account_by_name: HashMap<String, Arc<SubAccount>>,
    broker_accounts: HashMap<BrokerAccountId, Arc<BrokerAccount>>,
    checksum: String,
}

impl ReferenceCache {
    pub fn load(store: &dyn ReferenceStore) -> Result<Self> {
        let mut exchanges = HashMap::new();
        let mut exchange_by_name = HashMap::new();
        for row in store.exchanges()? {
            let mut table: Vec<TickSizeRule> = vec![];
            for item in row
                .tick_size_table
                .split(|c| c == ';' || c == ',' || c == '|' || c == '\n')
            {
                let mut parts = item.split_whitespace();
                let (Some(lo), Some(up), Some(v)) = (parts.next(), parts.next(), parts.next())
                else {
                    continue;
                };
                let (Ok(lower), Ok(upper), Ok(value)) =
                    (lo.parse::<f64>(), up.parse::<f64>(), v.parse::<f64>())
                else {
                    continue;
                };
                table.push(TickSizeRule { lower, upper, value });
            }
            table.sort_by(|a, b| a.lower.total_cmp(&b.lower));
            let (trade_start, trade_end) = Exchange::decode_period(row.trade_period);
            let (break_start, break_end) = Exchange::decode_period(row.break_period);
            let exchange = Arc::new(Exchange {
                id: row.id,
                name: row.name.clone(),
                mic: row.mic,
                country: row.country,
                tz: row.tz,
                desc: row.desc,
                utc_offset: row.utc_offset,
                odd_lot_allowed: row.odd_lot_allowed,
                tick_size_table: table,
                trade_start,
                trade_end,
                break_start,
                break_end,
            });
            exchange_by_name.insert(row.name.to_uppercase(), exchange.clone());
            exchanges.insert(row.id, exchange);
        }

        let mut securities = HashMap::new();
        for row in store.securities()? {
            let exchange = exchanges
                .get(&row.exchange_id)
                .cloned()
                .ok_or_else(|| {
                    Error::Store(format!(
                        "security {} references unknown exchange {}",
                        row.id, row.exchange_id
                    ))
                })?;
            let sec = Security {
                id: row.id,
                symbol: row.symbol,
                local_symbol: row.local_symbol,
                kind: row.kind,
                currency: row.currency,
                exchange,
                underlying: (row.underlying_id > 0).then_some(row.underlying_id),
                rate: if row.rate > 0.0 { row.rate } else { 1.0 },
                multiplier: if row.multiplier > 0.0 { row.multiplier } else { 1.0 },
                tick_size: row.tick_size,
                lot_size: row.lot_size,
                close_price: row.close_price,
                strike_price: row.strike_price,
                maturity_date: row.maturity_date,
                put_or_call: row.put_or_call,
                opt_attribute: row.opt_attribute.chars().next(),
            };
            securities.insert(sec.id, Arc::new(sec));
        }

        let mut sub_accounts_raw: HashMap<SubAccountId, (String, Limits)> = HashMap::new();
        for row in store.sub_accounts()? {
            sub_accounts_raw.insert(row.id, (row.name, Limits::parse(&row.limits)));
        }

        let mut broker_accounts = HashMap::new();
        for row in store.broker_accounts()? {
            let acc = BrokerAccount {
                id: row.id,
                name: row.name,
                adapter_name: row.adapter,
                params: account::parse_params(&row.params),
                risk: AccountRisk {
                    limits: Limits::parse(&row.limits),
                    ..Default::default()
                },
            };
            broker_accounts.insert(row.id, Arc::new(acc));
        }

        let mut broker_map: HashMap<SubAccountId, HashMap<ExchangeId, BrokerAccountId>> =
            HashMap::new();
        for row in store.sub_account_broker_account_map()? {
            if !sub_accounts_raw.contains_key(&row.sub_account_id) {
                return Err(Error::Store(format!(
                    "broker map references unknown sub account {}",
                    row.sub_account_id
                )));
            }
            if !broker_accounts.contains_key(&row.broker_account_id) {
                return Err(Error::Store(format!(
                    "broker map references unknown broker account {}",
                    row.broker_account_id
                )));
            }
            broker_map
                .entry(row.sub_account_id)
                .or_default()
                .insert(row.exchange_id, row.broker_account_id);
        }

        let mut sub_accounts = HashMap::new();
        let mut sub_account_by_name = HashMap::new();
        for (id, (name, limits)) in sub_accounts_raw {
            let acc = Arc::new(SubAccount {
                id,
                name: name.clone(),
                broker_accounts: broker_map.remove(&id).unwrap_or_default(),
                risk: AccountRisk { limits, ..Default::default() },
            });
            sub_account_by_name.insert(name, acc.clone());
            sub_accounts.insert(id, acc);
        }

        let mut user_subs: HashMap<UserId, HashSet<SubAccountId>> = HashMap::new();
        for row in store.user_sub_account_map()? {
            if !sub_accounts.contains_key(&row.sub_account_id) {
                return Err(Error::Store(format!(
                    "user map references unknown sub account {}",
                    row.sub_account_id
                )));
            }
            user_subs
                .entry(row.user_id)
                .or_default()
                .insert(row.sub_account_id);
        }

        let mut users = HashMap::new();
        let mut user_by_name = HashMap::new();
        for row in store.users()? {
            let user = Arc::new(User {
                id: row.id,
                name: row.name.clone(),
                password: row.password,
                is_admin: row.is_admin,
                is_disabled: row.is_disabled,
                sub_accounts: user_subs.remove(&row.id).unwrap_or_default(),
                risk: AccountRisk {
                    limits: Limits::parse(&row.limits),
                    ..Default::default()
                },
            });
            user_by_name.insert(row.name.clone(), user.clone());
            users.insert(row.id, user);
        }

        let checksum = Self::compute_checksum(&securities);
        info!(
            securities = securities.len(),
            exchanges = exchanges.len(),
            users = users.len(),
            "reference cache loaded"
        );

        Ok(Self {
            exchanges,
            exchange_by_name,
            securities,
            users,
            user_by_name,
            sub_accounts,
            sub_account_by_name,
            broker_accounts,
            checksum,
        })
    }

    /// SHA-1 over the identifying security fields in id order, so
    /// reconnecting clients can detect a stale cache.
    fn compute_checksum(securities: &HashMap<SecurityId, Arc<Security>>) -> String {
        let mut ids: Vec<_> = securities.keys().copied().collect();
        ids.sort_unstable();
        let mut buf = String::new();
        for id in ids {
            let s = &securities[&id];
            buf.push_str(&format!(
                "{}{}{}{}{}{}",
                s.id, s.symbol, s.exchange.name, s.kind, s.lot_size, s.multiplier
            ));
        }
        sha1_hex(&buf)
    }

    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn security(&self, id: SecurityId) -> Option<&Arc<Security>> {
        self.securities.get(&id)
    }

    pub fn securities(&self) -> impl Iterator<Item = &Arc<Security>> {
        self.securities.values()
    }

    pub fn exchange(&self, id: ExchangeId) -> Option<&Arc<Exchange>> {
        self.exchanges.get(&id)
    }

    pub fn exchange_by_name(&self, name: &str) -> Option<&Arc<Exchange>> {
        self.exchange_by_name.get(&name.trim().to_uppercase())
    }

    pub fn user(&self, id: UserId) -> Option<&Arc<User>> {
        self.users.get(&id)
    }

    pub fn user_by_name(&self, name: &str) -> Option<&Arc<User>> {
        self.user_by_name.get(name)
    }

    pub fn users(&self) -> impl Iterator<Item = &Arc<User>> {
        self.users.values()
    }

    pub fn sub_account(&self, id: SubAccountId) -> Option<&Arc<SubAccount>> {
        self.sub_accounts.get(&id)
    }

    pub fn sub_account_by_name(&self, name: &str) -> Option<&Arc<SubAccount>> {
        self.sub_account_by_name.get(name)
    }

    pub fn sub_accounts(&self) -> impl Iterator<Item = &Arc<SubAccount>> {
        self.sub_accounts.values()
    }

    pub fn broker_account(&self, id: BrokerAccountId) -> Option<&Arc<BrokerAccount>> {
        self.broker_accounts.get(&id)
    }

    pub fn broker_accounts(&self) -> impl Iterator<Item = &Arc<BrokerAccount>> {
        self.broker_accounts.values()
    }
}

#[cfg(test)]
pub mod testkit {
    //! In-memory store fixtures shared by unit tests across the crate.

    use super::store::*;
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    pub struct MemStore {
        pub exchanges: Vec<ExchangeRow>,
        pub securities: Vec<SecurityRow>,
        pub users: Vec<UserRow>,
        pub sub_accounts: Vec<SubAccountRow>,
        pub broker_accounts: Vec<BrokerAccountRow>,
        pub user_map: Vec<UserSubAccountRow>,
        pub broker_map: Vec<SubAccountBrokerRow>,
        pub positions: Mutex<Vec<PositionRow>>,
    }

    impl ReferenceStore for MemStore {
        fn exchanges(&self) -> Result<Vec<ExchangeRow>> {
            Ok(self.exchanges.clone())
        }
        fn securities(&self) -> Result<Vec<SecurityRow>> {
            Ok(self.securities.clone())
        }
        fn users(&self) -> Result<Vec<UserRow>> {
            Ok(self.users.clone())
        }
        fn sub_accounts(&self) -> Result<Vec<SubAccountRow>> {
            Ok(self.sub_accounts.clone())
        }
        fn broker_accounts(&self) -> Result<Vec<BrokerAccountRow>> {
            Ok(self.broker_accounts.clone())
        }
        fn user_sub_account_map(&self) -> Result<Vec<UserSubAccountRow>> {
            Ok(self.user_map.clone())
        }
        fn sub_account_broker_account_map(&self) -> Result<Vec<SubAccountBrokerRow>> {
            Ok(self.broker_map.clone())
        }
        fn latest_positions(&self, before_tm: i64) -> Result<Vec<PositionRow>> {
            let mut latest: HashMap<(u16, u32), PositionRow> = HashMap::new();
            for row in self.positions.lock().iter() {
                if row.tm < before_tm {
                    latest.insert((row.sub_account_id, row.security_id), row.clone());
                }
            }
            Ok(latest.into_values().collect())
        }
        fn insert_position(&self, row: &PositionRow) -> Result<()> {
            self.positions.lock().push(row.clone());
            Ok(())
        }
    }

    /// One exchange, two securities, one user/sub/broker wiring.
    pub fn small_store() -> MemStore {
        MemStore {
            exchanges: vec![ExchangeRow {
                id: 1,
                name: "SIMEX".into(),
                tz: "UTC".into(),
                ..Default::default()
            }],
            securities: vec![
                SecurityRow {
                    id: 10,
                    symbol: "AAA".into(),
                    exchange_id: 1,
                    tick_size: 0.01,
                    lot_size: 100,
                    close_price: 10.0,
                    rate: 1.0,
                    multiplier: 1.0,
                    kind: "STK".into(),
                    ..Default::default()
                },
                SecurityRow {
                    id: 11,
                    symbol: "BBB".into(),
                    exchange_id: 1,
                    tick_size: 0.01,
                    lot_size: 1,
                    close_price: 50.0,
                    rate: 1.0,
                    multiplier: 1.0,
                    kind: "STK".into(),
                    ..Default::default()
                },
            ],
            users: vec![UserRow {
                id: 1,
                name: "trader".into(),
                password: crate::core::time::sha1_hex("pw"),
                ..Default::default()
            }],
            sub_accounts: vec![SubAccountRow {
                id: 2,
                name: "book-a".into(),
                ..Default::default()
            }],
            broker_accounts: vec![BrokerAccountRow {
                id: 3,
                name: "sim".into(),
                adapter: "ec_sim".into(),
                ..Default::default()
            }],
            user_map: vec![UserSubAccountRow {
                user_id: 1,
                sub_account_id: 2,
            }],
            broker_map: vec![SubAccountBrokerRow {
                sub_account_id: 2,
                exchange_id: 0,
                broker_account_id: 3,
            }],
            positions: Mutex::new(vec![]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testkit::small_store;
    use super::*;

    #[test]
    fn cache_loads_and_links() {
        let cache = ReferenceCache::load(&small_store()).unwrap();
        let sec = cache.security(10).unwrap();
        assert_eq!(sec.symbol, "AAA");
        assert_eq!(sec.exchange.name, "SIMEX");
        let user = cache.user_by_name("trader").unwrap();
        assert!(user.permissioned(2));
        assert!(!user.permissioned(9));
        let sub = cache.sub_account(2).unwrap();
        assert_eq!(sub.broker_for(1), Some(3));
    }

    #[test]
    fn checksum_is_stable_and_sensitive() {
        let store = small_store();
        let a = ReferenceCache::load(&store).unwrap();
        let b = ReferenceCache::load(&store).unwrap();
        assert_eq!(a.checksum(), b.checksum());
        let mut store2 = small_store();
        store2.securities[0].lot_size = 200;
        let c = ReferenceCache::load(&store2).unwrap();
        assert_ne!(a.checksum(), c.checksum());
    }

    #[test]
    fn missing_exchange_fails_fast() {
        let mut store = small_store();
        store.securities[0].exchange_id = 99;
        assert!(ReferenceCache::load(&store).is_err());
    }
}
