//! Worker supervisor - one long-running task per live (account, symbol) pair
//!
//! The supervisor owns the worker table. Workers only see their own
//! cancellation token; they remove themselves from the table on exit, and a
//! generation number keeps a late exit from removing a newer worker of the
//! same pair.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::FutureExt;
use log::{error, info, warn};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;

use super::errors::{EngineError, EngineResult, Origin, StepFailure};
use super::gateway::ExchangeGateway;
use super::notify::Notifier;
use super::reconciler::{CoinReconciler, StepOutcome};
use super::store::{InstrumentCatalog, PositionStore};
use super::types::{AccountId, AccountUpdate, Message};

type WorkerKey = (AccountId, String);

struct WorkerHandle {
    token: CancellationToken,
    alive: Arc<AtomicBool>,
    generation: u64,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

struct Shared<G, S, C> {
    reconciler: CoinReconciler<G, S, C>,
    notifier: Notifier,
    workers: Mutex<HashMap<WorkerKey, WorkerHandle>>,
    config: EngineConfig,
    next_generation: AtomicU64,
}

impl<G, S, C> Shared<G, S, C> {
    async fn deregister(&self, account_id: AccountId, symbol: &str, generation: u64) {
        let mut workers = self.workers.lock().await;
        let key = (account_id, symbol.to_string());
        if workers.get(&key).map(|h| h.generation) == Some(generation) {
            workers.remove(&key);
        }
    }
}

/// Starts, stops and liquidates per-pair workers
pub struct WorkerSupervisor<G, S, C> {
    shared: Arc<Shared<G, S, C>>,
}

impl<G, S, C> Clone for WorkerSupervisor<G, S, C> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<G, S, C> WorkerSupervisor<G, S, C>
where
    G: ExchangeGateway + 'static,
    S: PositionStore + 'static,
    C: InstrumentCatalog + 'static,
{
    pub fn new(reconciler: CoinReconciler<G, S, C>, config: EngineConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                reconciler,
                notifier: Notifier::new(config.notification_queue_capacity),
                workers: Mutex::new(HashMap::new()),
                config,
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Message stream for one account
    pub async fn subscribe(&self, account_id: AccountId) -> mpsc::Receiver<Message> {
        self.shared.notifier.subscribe(account_id).await
    }

    /// Copies of every Error message, for the operator channel
    pub async fn subscribe_operator(&self) -> mpsc::Receiver<Message> {
        self.shared.notifier.subscribe_operator().await
    }

    /// Spawn a worker for every configured symbol of the account that has no
    /// live worker. Returns the symbols that were started.
    pub async fn start_trading(&self, account_id: AccountId) -> EngineResult<Vec<String>> {
        let store = self.shared.reconciler.store();
        let symbols = store.list_symbols(account_id).await?;
        store
            .update_account(account_id, AccountUpdate::trading_enabled(true))
            .await?;

        let mut started = Vec::new();
        let mut workers = self.shared.workers.lock().await;
        for symbol in symbols {
            let key = (account_id, symbol.clone());
            if workers.get(&key).map(WorkerHandle::is_alive).unwrap_or(false) {
                continue;
            }
            let handle = self.spawn_worker(account_id, symbol.clone());
            workers.insert(key, handle);
            started.push(symbol);
        }

        info!("[user={}] trading started for {:?}", account_id, started);
        Ok(started)
    }

    /// Disable trading and liquidate every live pair of the account.
    ///
    /// Every pair is attempted; the first failure is returned.
    pub async fn stop_trading(&self, account_id: AccountId) -> Result<(), StepFailure> {
        self.shared
            .reconciler
            .store()
            .update_account(account_id, AccountUpdate::trading_enabled(false))
            .await
            .map_err(|e| StepFailure::new(Origin::new(account_id, "*", "stop_trading"), e))?;

        let mut first_failure = None;
        for symbol in self.live_symbols(account_id).await {
            if let Err(failure) = self.delete_coin(account_id, &symbol).await {
                first_failure.get_or_insert(failure);
            }
        }

        info!("[user={}] trading stopped", account_id);
        first_failure.map_or(Ok(()), Err)
    }

    /// Stop the pair's worker if one is live, then cancel its orders,
    /// market-sell its holdings and reset it to flat.
    pub async fn delete_coin(&self, account_id: AccountId, symbol: &str) -> Result<(), StepFailure> {
        let handle = self
            .shared
            .workers
            .lock()
            .await
            .remove(&(account_id, symbol.to_string()));
        if let Some(handle) = handle {
            handle.token.cancel();
            // the in-flight step finishes before the liquidation starts
            if let Err(e) = handle.task.await {
                warn!("[user={} symbol={}] worker join failed: {}", account_id, symbol, e);
            }
        }

        match self.shared.reconciler.liquidate(account_id, symbol).await {
            Ok(messages) => {
                for message in messages {
                    self.shared.notifier.deliver(message).await;
                }
                Ok(())
            }
            Err(failure) => {
                error!("[user={} symbol={}] liquidation failed: {}", account_id, symbol, failure);
                self.shared.notifier.deliver(Message::error(&failure)).await;
                Err(failure)
            }
        }
    }

    /// Cancel every worker without liquidating; positions resume on restart
    pub async fn shutdown(&self) {
        let handles: Vec<(WorkerKey, WorkerHandle)> = self.shared.workers.lock().await.drain().collect();
        for (_, handle) in &handles {
            handle.token.cancel();
        }
        for ((account_id, symbol), handle) in handles {
            if let Err(e) = handle.task.await {
                warn!("[user={} symbol={}] worker join failed: {}", account_id, symbol, e);
            }
        }
        info!("All workers stopped");
    }

    /// Symbols with a running worker, sorted
    pub async fn live_symbols(&self, account_id: AccountId) -> Vec<String> {
        let mut symbols: Vec<String> = self
            .shared
            .workers
            .lock()
            .await
            .iter()
            .filter(|((id, _), handle)| *id == account_id && handle.is_alive())
            .map(|((_, symbol), _)| symbol.clone())
            .collect();
        symbols.sort();
        symbols
    }

    fn spawn_worker(&self, account_id: AccountId, symbol: String) -> WorkerHandle {
        let token = CancellationToken::new();
        let alive = Arc::new(AtomicBool::new(true));
        let generation = self.shared.next_generation.fetch_add(1, Ordering::SeqCst);

        let task = tokio::spawn(run_worker(
            self.shared.clone(),
            account_id,
            symbol,
            token.clone(),
            alive.clone(),
            generation,
        ));

        WorkerHandle {
            token,
            alive,
            generation,
            task,
        }
    }
}

async fn run_worker<G, S, C>(
    shared: Arc<Shared<G, S, C>>,
    account_id: AccountId,
    symbol: String,
    token: CancellationToken,
    alive: Arc<AtomicBool>,
    generation: u64,
) where
    G: ExchangeGateway + 'static,
    S: PositionStore + 'static,
    C: InstrumentCatalog + 'static,
{
    info!("[user={} symbol={}] worker started", account_id, symbol);
    let mut consecutive_errors: u32 = 0;

    loop {
        if token.is_cancelled() {
            break;
        }

        let result = AssertUnwindSafe(shared.reconciler.step(account_id, &symbol))
            .catch_unwind()
            .await;

        let delay = match result {
            Ok(Ok(report)) => {
                consecutive_errors = 0;
                let retire = report.outcome == StepOutcome::Retire;
                if let Some(message) = report.message {
                    shared.notifier.deliver(message).await;
                }
                if retire {
                    info!("[user={} symbol={}] cycle closed without rebuy, worker retiring", account_id, symbol);
                    break;
                }
                shared.config.step_interval()
            }
            Ok(Err(failure)) => {
                consecutive_errors += 1;
                if failure.error.is_transient() {
                    warn!("[user={} symbol={}] step failed: {}", account_id, symbol, failure);
                } else {
                    error!("[user={} symbol={}] step failed: {}", account_id, symbol, failure);
                }
                shared.notifier.deliver(Message::error(&failure)).await;
                shared.config.error_backoff(consecutive_errors)
            }
            Err(panic) => {
                consecutive_errors += 1;
                let text = panic_text(panic.as_ref());
                error!("[user={} symbol={}] step panicked: {}", account_id, symbol, text);
                let failure = StepFailure::new(
                    Origin::new(account_id, symbol.as_str(), "worker"),
                    EngineError::Panicked(text),
                );
                shared.notifier.deliver(Message::error(&failure)).await;
                shared.config.error_backoff(consecutive_errors)
            }
        };

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    alive.store(false, Ordering::SeqCst);
    shared.deregister(account_id, &symbol, generation).await;
    info!("[user={} symbol={}] worker stopped", account_id, symbol);
}

fn panic_text(panic: &(dyn Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
