use std::path::Path;
use std::sync::Arc;

use log::{error, info, warn};
use tokio::sync::mpsc;

use crate::config::Settings;
use crate::engine::{
    AccountId, CoinReconciler, EngineResult, Message, MemoryStore, PositionStore, ReconcilerPolicy, StaticCatalog,
    TimedGateway, WorkerSupervisor,
};
use crate::market::{BybitTicker, PaperExchange};

type PaperGateway = TimedGateway<PaperExchange<BybitTicker>>;

/// Process bootstrap for a paper trading run
pub struct EngineRunner {
    config: Settings,
}

impl EngineRunner {
    /// Create a new runner from a configuration file
    pub fn new(config_path: impl AsRef<Path>) -> EngineResult<Self> {
        let config = Settings::new(&config_path.as_ref().to_string_lossy())?;
        Ok(Self { config })
    }

    /// Run until Ctrl-C, then stop every worker without liquidating
    pub async fn run(self) -> EngineResult<()> {
        // 1. Setup Logging
        if std::env::var("RUST_LOG").is_err() {
            std::env::set_var("RUST_LOG", &self.config.log.level);
        }
        env_logger::try_init().ok();

        info!("Starting EngineRunner...");
        self.config.validate()?;

        // 2. Store and catalog
        let store = match &self.config.store.path {
            Some(path) => {
                info!("Using position file {}", path.display());
                MemoryStore::load_or_create(path.clone())?
            }
            None => {
                warn!("No [store] path configured, positions live in memory only");
                MemoryStore::new()
            }
        };
        for account in &self.config.accounts {
            store.insert_account(account.to_account(), &account.symbols).await?;
        }
        let store = Arc::new(store);
        let catalog = Arc::new(StaticCatalog::new(self.config.instruments.iter().cloned()));
        info!("Loaded {} instruments", catalog.len());

        // 3. Paper exchange behind the call timeout
        let paper = &self.config.paper;
        info!(
            "Initializing PAPER exchange (ticker {}, fee {}, cash {})",
            paper.ticker_url, paper.fee_rate, paper.initial_cash
        );
        let exchange = PaperExchange::new(BybitTicker::new(paper.ticker_url.clone()), paper);
        let gateway: Arc<PaperGateway> = Arc::new(TimedGateway::new(exchange, self.config.engine.call_timeout()));

        // 4. Engine
        let policy = ReconcilerPolicy::from(&self.config.engine);
        let reconciler = CoinReconciler::new(gateway, store.clone(), catalog, policy);
        let supervisor = WorkerSupervisor::new(reconciler, self.config.engine.clone());

        // 5. Notification sinks
        let accounts = store.list_accounts().await?;
        for account in &accounts {
            spawn_log_sink(account.id, supervisor.subscribe(account.id).await);
        }
        spawn_operator_sink(supervisor.subscribe_operator().await);

        // 6. Resume accounts that were trading
        for account in accounts.iter().filter(|a| a.trading_enabled) {
            match supervisor.start_trading(account.id).await {
                Ok(symbols) => info!("[user={}] resumed {} pairs", account.id, symbols.len()),
                Err(e) => error!("[user={}] could not start trading: {}", account.id, e),
            }
        }

        info!("Engine running. Press Ctrl-C to stop.");
        tokio::signal::ctrl_c().await?;

        info!("Shutdown requested");
        supervisor.shutdown().await;
        Ok(())
    }
}

fn spawn_log_sink(account_id: AccountId, mut rx: mpsc::Receiver<Message>) {
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            info!("[user={}] {}", account_id, message.render());
        }
    });
}

fn spawn_operator_sink(mut rx: mpsc::Receiver<Message>) {
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            warn!("Operator alert: {}", message.render());
        }
    });
}
