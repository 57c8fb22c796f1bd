//! Position store and instrument catalog
//!
//! The store is the durable side of the engine: one account record per user
//! and one position per (user, symbol). Writes are partial patches that are
//! validated before they are committed, so an illegal position (a sell order
//! while flat, holdings without fills) never reaches storage.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::errors::{EngineError, EngineResult};
use super::types::{Account, AccountId, AccountUpdate, InstrumentSpec, Position, PositionUpdate};

/// Durable account and position records
#[async_trait]
pub trait PositionStore: Send + Sync {
    async fn load_account(&self, account_id: AccountId) -> EngineResult<Account>;

    /// Apply a partial account write and return the updated record
    async fn update_account(&self, account_id: AccountId, update: AccountUpdate) -> EngineResult<Account>;

    async fn list_accounts(&self) -> EngineResult<Vec<Account>>;

    /// Symbols configured for an account
    async fn list_symbols(&self, account_id: AccountId) -> EngineResult<Vec<String>>;

    async fn load_position(&self, account_id: AccountId, symbol: &str) -> EngineResult<Position>;

    /// All positions of an account; a possibly stale snapshot across pairs
    async fn list_positions(&self, account_id: AccountId) -> EngineResult<Vec<Position>> {
        let mut positions = Vec::new();
        for symbol in self.list_symbols(account_id).await? {
            positions.push(self.load_position(account_id, &symbol).await?);
        }
        Ok(positions)
    }

    /// Partial upsert: only the fields set in `update` are overwritten.
    /// The merged position is validated before it is committed.
    async fn save_position(
        &self,
        account_id: AccountId,
        symbol: &str,
        update: PositionUpdate,
    ) -> EngineResult<Position>;

    /// Append a realized-income entry for a closed cycle
    async fn record_income(&self, account_id: AccountId, symbol: &str, income: f64, quantity: f64) -> EngineResult<()>;
}

/// Read-only per-symbol trading constraints
pub trait InstrumentCatalog: Send + Sync {
    fn instrument(&self, symbol: &str) -> EngineResult<InstrumentSpec>;
}

// ============================================================================
// Snapshot
// ============================================================================

/// One realized-income entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomeRecord {
    pub account_id: AccountId,
    pub symbol: String,
    pub income: f64,
    pub quantity: f64,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AccountRecord {
    account: Account,
    #[serde(default)]
    positions: BTreeMap<String, Position>,
}

/// Everything the store holds, as written to disk
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreSnapshot {
    #[serde(default)]
    accounts: BTreeMap<AccountId, AccountRecord>,
    #[serde(default)]
    income: Vec<IncomeRecord>,
}

impl StoreSnapshot {
    fn record(&self, account_id: AccountId) -> EngineResult<&AccountRecord> {
        self.accounts
            .get(&account_id)
            .ok_or(EngineError::AccountNotFound(account_id))
    }

    fn record_mut(&mut self, account_id: AccountId) -> EngineResult<&mut AccountRecord> {
        self.accounts
            .get_mut(&account_id)
            .ok_or(EngineError::AccountNotFound(account_id))
    }

    fn load_from_file(path: &Path) -> EngineResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Write to a temp file, then rename over the target
    fn save_to_file_atomic(&self, path: &Path) -> EngineResult<()> {
        let temp_path = path.with_extension("tmp");
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&temp_path, content)?;
        std::fs::rename(&temp_path, path)?;
        Ok(())
    }
}

// ============================================================================
// In-memory store with optional JSON persistence
// ============================================================================

/// `PositionStore` held in memory, optionally mirrored to a JSON file after
/// every write.
pub struct MemoryStore {
    data: RwLock<StoreSnapshot>,
    save_path: Option<PathBuf>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(StoreSnapshot::default()),
            save_path: None,
        }
    }

    /// Open a file-backed store, starting empty if the file does not exist
    pub fn load_or_create(path: impl Into<PathBuf>) -> EngineResult<Self> {
        let path = path.into();
        let snapshot = if path.exists() {
            let snapshot = StoreSnapshot::load_from_file(&path)?;
            info!(
                "Loaded store from {:?}: {} accounts, {} income records",
                path,
                snapshot.accounts.len(),
                snapshot.income.len()
            );
            snapshot
        } else {
            info!("No store file at {:?}, starting empty", path);
            StoreSnapshot::default()
        };
        Ok(Self {
            data: RwLock::new(snapshot),
            save_path: Some(path),
        })
    }

    /// Register an account with its symbols. An existing account keeps its
    /// positions and trading flag; missing symbols get zero positions.
    pub async fn insert_account(&self, account: Account, symbols: &[String]) -> EngineResult<()> {
        self.commit(|data| {
            let record = data
                .accounts
                .entry(account.id)
                .and_modify(|existing| {
                    existing.account.risk_percent = account.risk_percent;
                    existing.account.auto_rebuy_after_sell = account.auto_rebuy_after_sell;
                    existing.account.credentials = account.credentials.clone();
                })
                .or_insert_with(|| AccountRecord {
                    account: account.clone(),
                    positions: BTreeMap::new(),
                });
            for symbol in symbols {
                record
                    .positions
                    .entry(symbol.clone())
                    .or_insert_with(|| Position::new(symbol.clone()));
            }
            Ok(())
        })
        .await
    }

    pub async fn income_history(&self, account_id: AccountId) -> Vec<IncomeRecord> {
        self.data
            .read()
            .await
            .income
            .iter()
            .filter(|r| r.account_id == account_id)
            .cloned()
            .collect()
    }

    /// Apply `change` under the write lock. With a backing file the change is
    /// made on a copy that replaces the live snapshot only once it is on disk,
    /// so a failed write leaves memory untouched.
    async fn commit<T>(&self, change: impl FnOnce(&mut StoreSnapshot) -> EngineResult<T>) -> EngineResult<T> {
        let mut data = self.data.write().await;
        let Some(path) = &self.save_path else {
            return change(&mut *data);
        };

        let mut next = data.clone();
        let out = change(&mut next)?;
        next.save_to_file_atomic(path)
            .map_err(|e| EngineError::Store(format!("failed to save {:?}: {}", path, e)))?;
        debug!("Store saved to {:?}", path);
        *data = next;
        Ok(out)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PositionStore for MemoryStore {
    async fn load_account(&self, account_id: AccountId) -> EngineResult<Account> {
        Ok(self.data.read().await.record(account_id)?.account.clone())
    }

    async fn update_account(&self, account_id: AccountId, update: AccountUpdate) -> EngineResult<Account> {
        self.commit(|data| {
            let record = data.record_mut(account_id)?;
            update.apply(&mut record.account);
            Ok(record.account.clone())
        })
        .await
    }

    async fn list_accounts(&self) -> EngineResult<Vec<Account>> {
        Ok(self
            .data
            .read()
            .await
            .accounts
            .values()
            .map(|r| r.account.clone())
            .collect())
    }

    async fn list_symbols(&self, account_id: AccountId) -> EngineResult<Vec<String>> {
        Ok(self
            .data
            .read()
            .await
            .record(account_id)?
            .positions
            .keys()
            .cloned()
            .collect())
    }

    async fn load_position(&self, account_id: AccountId, symbol: &str) -> EngineResult<Position> {
        self.data
            .read()
            .await
            .record(account_id)?
            .positions
            .get(symbol)
            .cloned()
            .ok_or_else(|| EngineError::PositionNotFound {
                account_id,
                symbol: symbol.to_string(),
            })
    }

    async fn list_positions(&self, account_id: AccountId) -> EngineResult<Vec<Position>> {
        Ok(self
            .data
            .read()
            .await
            .record(account_id)?
            .positions
            .values()
            .cloned()
            .collect())
    }

    async fn save_position(
        &self,
        account_id: AccountId,
        symbol: &str,
        update: PositionUpdate,
    ) -> EngineResult<Position> {
        self.commit(|data| {
            let record = data.record_mut(account_id)?;

            let mut merged = record
                .positions
                .get(symbol)
                .cloned()
                .unwrap_or_else(|| Position::new(symbol));
            update.apply(&mut merged);
            if let Err(e) = merged.validate() {
                warn!("[user={} symbol={}] rejected position write: {}", account_id, symbol, e);
                return Err(e);
            }

            record.positions.insert(symbol.to_string(), merged.clone());
            Ok(merged)
        })
        .await
    }

    async fn record_income(&self, account_id: AccountId, symbol: &str, income: f64, quantity: f64) -> EngineResult<()> {
        self.commit(|data| {
            data.record(account_id)?;
            data.income.push(IncomeRecord {
                account_id,
                symbol: symbol.to_string(),
                income,
                quantity,
                recorded_at: Utc::now(),
            });
            Ok(())
        })
        .await
    }
}

// ============================================================================
// Static catalog
// ============================================================================

/// Instrument catalog loaded once from configuration
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    specs: HashMap<String, InstrumentSpec>,
}

impl StaticCatalog {
    pub fn new(specs: impl IntoIterator<Item = InstrumentSpec>) -> Self {
        Self {
            specs: specs.into_iter().map(|s| (s.symbol.clone(), s)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

impl InstrumentCatalog for StaticCatalog {
    fn instrument(&self, symbol: &str) -> EngineResult<InstrumentSpec> {
        self.specs
            .get(symbol)
            .cloned()
            .ok_or_else(|| EngineError::InstrumentNotFound(symbol.to_string()))
    }
}
