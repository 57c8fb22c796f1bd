use std::path::PathBuf;
use std::time::Duration;

use config::{Config, File};
pub use config::ConfigError;
use serde::Deserialize;

use crate::engine::{Account, AccountId, Credentials, EngineError, EngineResult, InstrumentSpec};

/// Main configuration struct
#[derive(Debug, Deserialize)]
pub struct Settings {
    /// Reconciliation loop tuning
    #[serde(default)]
    pub engine: EngineConfig,
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
    /// Where positions are persisted
    #[serde(default)]
    pub store: StoreConfig,
    /// Paper exchange settings
    #[serde(default)]
    pub paper: PaperConfig,
    /// Instrument catalog
    #[serde(default)]
    pub instruments: Vec<InstrumentSpec>,
    /// Seed accounts
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Delay between two reconciliation steps of one pair
    #[serde(default = "default_step_interval_ms")]
    pub step_interval_ms: u64,
    /// First backoff after a failed step; doubles per consecutive failure
    #[serde(default = "default_error_backoff_base_ms")]
    pub error_backoff_base_ms: u64,
    #[serde(default = "default_error_backoff_max_ms")]
    pub error_backoff_max_ms: u64,
    /// Bound on every exchange call
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    /// Per-account notification queue size
    #[serde(default = "default_notification_queue_capacity")]
    pub notification_queue_capacity: usize,
    /// Share of equity that may be deployed before new buys stop
    #[serde(default = "default_capacity_threshold")]
    pub capacity_threshold: f64,
    /// Share of equity spent on a cycle's first rung
    #[serde(default = "default_initial_buy_equity_fraction")]
    pub initial_buy_equity_fraction: f64,
    #[serde(default = "default_liquidation_poll_interval_ms")]
    pub liquidation_poll_interval_ms: u64,
    #[serde(default = "default_liquidation_poll_attempts")]
    pub liquidation_poll_attempts: u32,
}

fn default_step_interval_ms() -> u64 {
    2000
}

fn default_error_backoff_base_ms() -> u64 {
    500
}

fn default_error_backoff_max_ms() -> u64 {
    60_000
}

fn default_call_timeout_secs() -> u64 {
    30
}

fn default_notification_queue_capacity() -> usize {
    64
}

fn default_capacity_threshold() -> f64 {
    0.95
}

fn default_initial_buy_equity_fraction() -> f64 {
    0.015
}

fn default_liquidation_poll_interval_ms() -> u64 {
    1000
}

fn default_liquidation_poll_attempts() -> u32 {
    30
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            step_interval_ms: default_step_interval_ms(),
            error_backoff_base_ms: default_error_backoff_base_ms(),
            error_backoff_max_ms: default_error_backoff_max_ms(),
            call_timeout_secs: default_call_timeout_secs(),
            notification_queue_capacity: default_notification_queue_capacity(),
            capacity_threshold: default_capacity_threshold(),
            initial_buy_equity_fraction: default_initial_buy_equity_fraction(),
            liquidation_poll_interval_ms: default_liquidation_poll_interval_ms(),
            liquidation_poll_attempts: default_liquidation_poll_attempts(),
        }
    }
}

impl EngineConfig {
    pub fn step_interval(&self) -> Duration {
        Duration::from_millis(self.step_interval_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    /// Exponential backoff for the given number of consecutive failures
    pub fn error_backoff(&self, consecutive_errors: u32) -> Duration {
        let exponent = consecutive_errors.saturating_sub(1).min(16);
        let delay = self.error_backoff_base_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.error_backoff_max_ms))
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.step_interval_ms == 0 {
            return Err(EngineError::InvalidConfig("step_interval_ms must be positive".into()));
        }
        if self.error_backoff_base_ms == 0 || self.error_backoff_max_ms < self.error_backoff_base_ms {
            return Err(EngineError::InvalidConfig(format!(
                "error backoff must satisfy 0 < base ({}) <= max ({})",
                self.error_backoff_base_ms, self.error_backoff_max_ms
            )));
        }
        if self.call_timeout_secs == 0 {
            return Err(EngineError::InvalidConfig("call_timeout_secs must be positive".into()));
        }
        if self.notification_queue_capacity == 0 {
            return Err(EngineError::InvalidConfig(
                "notification_queue_capacity must be positive".into(),
            ));
        }
        if !(self.capacity_threshold > 0.0 && self.capacity_threshold <= 1.0) {
            return Err(EngineError::InvalidConfig(format!(
                "capacity_threshold ({}) must be in (0, 1]",
                self.capacity_threshold
            )));
        }
        if !(self.initial_buy_equity_fraction > 0.0 && self.initial_buy_equity_fraction < 1.0) {
            return Err(EngineError::InvalidConfig(format!(
                "initial_buy_equity_fraction ({}) must be in (0, 1)",
                self.initial_buy_equity_fraction
            )));
        }
        if self.liquidation_poll_interval_ms == 0 || self.liquidation_poll_attempts == 0 {
            return Err(EngineError::InvalidConfig(
                "liquidation polling needs a positive interval and attempt count".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
pub struct LogConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct StoreConfig {
    /// JSON file for positions; in-memory only when unset
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaperConfig {
    /// Taker/maker fee charged on simulated fills
    #[serde(default = "default_fee_rate")]
    pub fee_rate: f64,
    /// Public ticker endpoint
    #[serde(default = "default_ticker_url")]
    pub ticker_url: String,
    /// Starting USDT balance of every paper wallet
    #[serde(default = "default_initial_cash")]
    pub initial_cash: f64,
}

fn default_fee_rate() -> f64 {
    0.001
}

fn default_ticker_url() -> String {
    "https://api.bybit.com".to_string()
}

fn default_initial_cash() -> f64 {
    10_000.0
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            fee_rate: default_fee_rate(),
            ticker_url: default_ticker_url(),
            initial_cash: default_initial_cash(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    pub id: AccountId,
    pub risk_percent: f64,
    #[serde(default = "default_auto_rebuy")]
    pub auto_rebuy_after_sell: bool,
    #[serde(default)]
    pub trading_enabled: bool,
    #[serde(default)]
    pub symbols: Vec<String>,
    /// Paper wallets are keyed by this value
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
}

fn default_auto_rebuy() -> bool {
    true
}

impl AccountConfig {
    pub fn to_account(&self) -> Account {
        let mut account = Account::new(
            self.id,
            self.risk_percent,
            Credentials::new(self.api_key.clone(), self.api_secret.clone()),
        )
        .with_auto_rebuy(self.auto_rebuy_after_sell);
        account.trading_enabled = self.trading_enabled;
        account
    }
}

impl Settings {
    /// Load settings from a configuration file
    pub fn new(config_path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(config_path))
            // e.g. APP__ENGINE__STEP_INTERVAL_MS=5000
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        s.try_deserialize()
    }

    /// Check engine tuning, accounts and catalog coverage
    pub fn validate(&self) -> EngineResult<()> {
        self.engine.validate()?;

        for account in &self.accounts {
            if !(account.risk_percent > 0.0 && account.risk_percent < 1.0) {
                return Err(EngineError::InvalidConfig(format!(
                    "account {}: risk_percent ({}) must be in (0, 1)",
                    account.id, account.risk_percent
                )));
            }
            for symbol in &account.symbols {
                if !self.instruments.iter().any(|i| &i.symbol == symbol) {
                    return Err(EngineError::InvalidConfig(format!(
                        "account {}: no instrument entry for {}",
                        account.id, symbol
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_error_backoff_doubles_and_caps() {
        let config = EngineConfig::default();
        assert_eq!(config.error_backoff(1), Duration::from_millis(500));
        assert_eq!(config.error_backoff(2), Duration::from_millis(1000));
        assert_eq!(config.error_backoff(4), Duration::from_millis(4000));
        assert_eq!(config.error_backoff(100), Duration::from_millis(60_000));
    }

    #[test]
    fn test_engine_config_validation() {
        assert!(EngineConfig::default().validate().is_ok());

        let config = EngineConfig {
            capacity_threshold: 1.5,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());

        let config = EngineConfig {
            notification_queue_capacity: 0,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());

        let config = EngineConfig {
            step_interval_ms: 0,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_settings_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            r#"
[engine]
step_interval_ms = 500

[store]
path = "positions.json"

[[instruments]]
symbol = "BTCUSDT"
qty_decimals = 6
price_decimals = 2
min_order_qty = 0.000048

[[accounts]]
id = 42
risk_percent = 0.02
symbols = ["BTCUSDT"]
"#
        )
        .unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let settings = Settings::new(&path).unwrap();

        assert_eq!(settings.engine.step_interval_ms, 500);
        assert_eq!(settings.engine.capacity_threshold, 0.95);
        assert_eq!(settings.log.level, "info");
        assert_eq!(settings.store.path, Some(PathBuf::from("positions.json")));
        assert_eq!(settings.paper.fee_rate, 0.001);
        assert_eq!(settings.instruments[0].qty_decimals, 6);

        let account = settings.accounts[0].to_account();
        assert_eq!(account.id, 42);
        assert!(account.auto_rebuy_after_sell);
        assert!(!account.trading_enabled);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_settings_reject_unknown_symbol() {
        let settings = Settings {
            engine: EngineConfig::default(),
            log: LogConfig::default(),
            store: StoreConfig::default(),
            paper: PaperConfig::default(),
            instruments: vec![],
            accounts: vec![AccountConfig {
                id: 1,
                risk_percent: 0.02,
                auto_rebuy_after_sell: true,
                trading_enabled: true,
                symbols: vec!["BTCUSDT".into()],
                api_key: String::new(),
                api_secret: String::new(),
            }],
        };
        assert!(matches!(settings.validate(), Err(EngineError::InvalidConfig(_))));
    }
}
