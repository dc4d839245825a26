//! The reference-store port and its file-backed implementation.
//!
//! The relational schema of the upstream system is one acceptable
//! instantiation of this port, not a binding one. `TomlStore` reads the
//! static tables from a single `reference.toml` and appends position
//! rows to a JSON-lines log next to it.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::core::{Error, Result};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExchangeRow {
    pub id: u16,
    pub name: String,
    #[serde(default)]
    pub mic: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub tz: String,
    #[serde(default)]
    pub desc: String,
    #[serde(default)]
    pub utc_offset: i32,
    #[serde(default)]
    pub odd_lot_allowed: bool,
    /// `"lower upper tick"` triples separated by `;`, `,`, `|` or newlines.
    #[serde(default)]
    pub tick_size_table: String,
    /// `HHMMHHMM` local session window, zero for open-ended.
    #[serde(default)]
    pub trade_period: i32,
    #[serde(default)]
    pub break_period: i32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SecurityRow {
    pub id: u32,
    pub symbol: String,
    #[serde(default)]
    pub local_symbol: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub currency: String,
    pub exchange_id: u16,
    #[serde(default)]
    pub underlying_id: u32,
    #[serde(default = "one")]
    pub rate: f64,
    #[serde(default = "one")]
    pub multiplier: f64,
    #[serde(default)]
    pub tick_size: f64,
    #[serde(default)]
    pub lot_size: i32,
    #[serde(default)]
    pub close_price: f64,
    #[serde(default)]
    pub strike_price: f64,
    #[serde(default)]
    pub maturity_date: i32,
    #[serde(default)]
    pub put_or_call: bool,
    #[serde(default)]
    pub opt_attribute: String,
}

fn default_kind() -> String {
    "STK".into()
}

fn one() -> f64 {
    1.0
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserRow {
    pub id: u16,
    pub name: String,
    /// SHA-1 hex digest.
    pub password: String,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub is_disabled: bool,
    #[serde(default)]
    pub limits: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubAccountRow {
    pub id: u16,
    pub name: String,
    #[serde(default)]
    pub limits: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BrokerAccountRow {
    pub id: u16,
    pub name: String,
    pub adapter: String,
    /// `key=value` per line.
    #[serde(default)]
    pub params: String,
    #[serde(default)]
    pub limits: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserSubAccountRow {
    pub user_id: u16,
    pub sub_account_id: u16,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubAccountBrokerRow {
    pub sub_account_id: u16,
    pub exchange_id: u16,
    pub broker_account_id: u16,
}

/// One position journal row; also the write-port payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PositionRow {
    pub user_id: u16,
    pub sub_account_id: u16,
    pub security_id: u32,
    pub broker_account_id: u16,
    pub qty: f64,
    pub avg_price: f64,
    pub realized_pnl: f64,
    /// Epoch seconds UTC.
    pub tm: i64,
    #[serde(default)]
    pub desc: String,
}

/// Read port over the static reference tables plus the position history.
pub trait ReferenceStore: Send + Sync {
    fn exchanges(&self) -> Result<Vec<ExchangeRow>>;
    fn securities(&self) -> Result<Vec<SecurityRow>>;
    fn users(&self) -> Result<Vec<UserRow>>;
    fn sub_accounts(&self) -> Result<Vec<SubAccountRow>>;
    fn broker_accounts(&self) -> Result<Vec<BrokerAccountRow>>;
    fn user_sub_account_map(&self) -> Result<Vec<UserSubAccountRow>>;
    fn sub_account_broker_account_map(&self) -> Result<Vec<SubAccountBrokerRow>>;
    /// Latest row per (sub_account, security) strictly before `tm`.
    fn latest_positions(&self, before_tm: i64) -> Result<Vec<PositionRow>>;
    /// Write port: append one position row.
    fn insert_position(&self, row: &PositionRow) -> Result<()>;
}

#[derive(Debug, Default, Deserialize)]
struct ReferenceFile {
    #[serde(default)]
    exchange: Vec<ExchangeRow>,
    #[serde(default)]
    security: Vec<SecurityRow>,
    #[serde(default)]
    user: Vec<UserRow>,
    #[serde(default)]
    sub_account: Vec<SubAccountRow>,
    #[serde(default)]
    broker_account: Vec<BrokerAccountRow>,
    #[serde(default)]
    user_sub_account: Vec<UserSubAccountRow>,
    #[serde(default)]
    sub_account_broker_account: Vec<SubAccountBrokerRow>,
}

/// File-backed reference store: `<dir>/reference.toml` for the static
/// tables, `<dir>/positions.jsonl` for the position history.
pub struct TomlStore {
    tables: ReferenceFile,
    positions_path: PathBuf,
    log: Mutex<File>,
}

impl TomlStore {
    pub fn open(dir: impl AsRef<Path>, create: bool) -> Result<Self> {
        let dir = dir.as_ref();
        let reference_path = dir.join("reference.toml");
        let positions_path = dir.join("positions.jsonl");
        if create {
            std::fs::create_dir_all(dir)?;
            if !reference_path.exists() {
                std::fs::write(&reference_path, "")?;
            }
        }
        let content = std::fs::read_to_string(&reference_path).map_err(|e| {
            Error::Store(format!("failed to read {}: {}", reference_path.display(), e))
        })?;
        let tables: ReferenceFile = toml::from_str(&content)
            .map_err(|e| Error::Store(format!("bad reference file: {}", e)))?;
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&positions_path)
            .map_err(|e| {
                Error::Store(format!("failed to open {}: {}", positions_path.display(), e))
            })?;
        Ok(Self {
            tables,
            positions_path,
            log: Mutex::new(log),
        })
    }
}

impl ReferenceStore for TomlStore {
    fn exchanges(&self) -> Result<Vec<ExchangeRow>> {
        Ok(self.tables.exchange.clone())
    }

    fn securities(&self) -> Result<Vec<SecurityRow>> {
        Ok(self.tables.security.clone())
    }

    fn users(&self) -> Result<Vec<UserRow>> {
        Ok(self.tables.user.clone())
    }

    fn sub_accounts(&self) -> Result<Vec<SubAccountRow>> {
        Ok(self.tables.sub_account.clone())
    }

    fn broker_accounts(&self) -> Result<Vec<BrokerAccountRow>> {
        Ok(self.tables.broker_account.clone())
    }

    fn user_sub_account_map(&self) -> Result<Vec<UserSubAccountRow>> {
        Ok(self.tables.user_sub_account.clone())
    }

    fn sub_account_broker_account_map(&self) -> Result<Vec<SubAccountBrokerRow>> {
        Ok(self.tables.sub_account_broker_account.clone())
    }

    fn latest_positions(&self, before_tm: i64) -> Result<Vec<PositionRow>> {
        let file = match File::open(&self.positions_path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };
        let mut latest: std::collections::HashMap<(u16, u32), PositionRow> = Default::default();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let row: PositionRow = serde_json::from_str(&line)
                .map_err(|e| Error::Store(format!("bad position row: {}", e)))?;
            if row.tm >= before_tm {
                continue;
            }
            latest.insert((row.sub_account_id, row.security_id), row);
        }
        Ok(latest.into_values().collect())
    }

    fn insert_position(&self, row: &PositionRow) -> Result<()> {
        let mut log = self.log.lock();
        serde_json::to_writer(&mut *log, row)?;
        log.write_all(b"\n")?;
        log.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "meridian-store-{}-{}",
            tag,
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn round_trips_reference_tables() {
        let dir = temp_dir("tables");
        std::fs::write(
            dir.join("reference.toml"),
            r#"
            [[exchange]]
            id = 1
            name = "SIMEX"
            tz = "UTC"

            [[security]]
            id = 10
            symbol = "AAA"
            exchange_id = 1
            lot_size = 100
            close_price = 10.0

            [[user]]
            id = 1
            name = "trader"
            password = "deadbeef"

            [[sub_account]]
            id = 2
            name = "book-a"

            [[broker_account]]
            id = 3
            name = "sim"
            adapter = "ec_sim"

            [[user_sub_account]]
            user_id = 1
            sub_account_id = 2

            [[sub_account_broker_account]]
            sub_account_id = 2
            exchange_id = 0
            broker_account_id = 3
            "#,
        )
        .unwrap();
        let store = TomlStore::open(&dir, false).unwrap();
        assert_eq!(store.exchanges().unwrap().len(), 1);
        assert_eq!(store.securities().unwrap()[0].lot_size, 100);
        assert_eq!(store.broker_accounts().unwrap()[0].adapter, "ec_sim");
        assert_eq!(store.sub_account_broker_account_map().unwrap()[0].exchange_id, 0);
    }

    #[test]
    fn latest_positions_keep_last_row_per_key_before_cutoff() {
        let dir = temp_dir("positions");
        std::fs::write(dir.join("reference.toml"), "").unwrap();
        let store = TomlStore::open(&dir, false).unwrap();
        for (qty, tm) in [(100.0, 10), (250.0, 20), (300.0, 99)] {
            store
                .insert_position(&PositionRow {
                    user_id: 1,
                    sub_account_id: 2,
                    security_id: 10,
                    broker_account_id: 3,
                    qty,
                    avg_price: 10.0,
                    realized_pnl: 0.0,
                    tm,
                    desc: String::new(),
                })
                .unwrap();
        }
        let rows = store.latest_positions(50).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].qty, 250.0);
    }
}
