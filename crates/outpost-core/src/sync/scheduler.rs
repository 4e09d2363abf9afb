//! Background task that runs sync cycles on a timer or on demand.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::orchestrator::{CycleOutcome, SyncOrchestrator};
use super::transport::SyncTransport;

/// Handle to a running sync loop.
pub struct SyncScheduler {
    trigger: Arc<Notify>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl SyncScheduler {
    /// Start the loop; the first cycle runs immediately.
    pub fn spawn<T>(orchestrator: Arc<SyncOrchestrator<T>>, interval: Duration) -> Self
    where
        T: SyncTransport + 'static,
    {
        let trigger = Arc::new(Notify::new());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_loop(
            orchestrator,
            interval,
            Arc::clone(&trigger),
            cancel.clone(),
        ));
        tracing::info!(interval_secs = interval.as_secs(), "Sync scheduler started");
        Self {
            trigger,
            cancel,
            handle,
        }
    }

    /// Run a cycle as soon as the current one (if any) finishes.
    pub fn trigger_now(&self) {
        self.trigger.notify_one();
    }

    /// Token that stops the loop and cancels a running cycle.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop the loop and wait for it to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(error) = self.handle.await {
            tracing::error!("Sync scheduler task failed: {error}");
        }
        tracing::info!("Sync scheduler stopped");
    }
}

async fn run_loop<T: SyncTransport>(
    orchestrator: Arc<SyncOrchestrator<T>>,
    interval: Duration,
    trigger: Arc<Notify>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
            () = trigger.notified() => tracing::debug!("Manual sync trigger"),
        }

        match orchestrator.run_cycle(&cancel).await {
            Ok(CycleOutcome::Completed(_) | CycleOutcome::Skipped) => {}
            Ok(CycleOutcome::Cancelled) => break,
            Err(error) if error.is_blocking() => {
                tracing::error!("Sync blocked until the local schema is upgraded: {error}");
            }
            Err(error) => tracing::warn!("Scheduled sync failed: {error}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::config::SyncSettings;
    use crate::models::{NodeRole, SchemaRegistry};
    use crate::services::DatabaseService;
    use crate::sync::hub::{LocalTransport, SyncHub};
    use crate::sync::protocol::{ExchangeRequest, ExchangeResponse, RegisterRequest, RegisterResponse};
    use crate::sync::registry::{TokenIssuer, DEFAULT_TOKEN_TTL};
    use crate::sync::transport::TransportError;
    use crate::sync::SyncContext;

    const SECRET: &str = "scheduler-test-secret-0123456789abcdef";

    struct CountingTransport {
        inner: LocalTransport,
        exchanges: Arc<AtomicUsize>,
    }

    impl SyncTransport for CountingTransport {
        async fn register(
            &self,
            request: &RegisterRequest,
        ) -> Result<RegisterResponse, TransportError> {
            self.inner.register(request).await
        }

        async fn exchange(
            &self,
            token: &str,
            request: &ExchangeRequest,
        ) -> Result<ExchangeResponse, TransportError> {
            self.exchanges.fetch_add(1, Ordering::SeqCst);
            self.inner.exchange(token, request).await
        }
    }

    async fn orchestrator(exchanges: Arc<AtomicUsize>) -> Arc<SyncOrchestrator<CountingTransport>> {
        let server_ctx = SyncContext::new(
            DatabaseService::open_in_memory().await.unwrap(),
            SchemaRegistry::new(1),
            SyncSettings::default(),
            NodeRole::Server,
        );
        let hub = SyncHub::start(
            server_ctx,
            TokenIssuer::new(SECRET, DEFAULT_TOKEN_TTL).unwrap(),
            "hq",
            "Head office",
        )
        .await
        .unwrap();

        let client_ctx = SyncContext::new(
            DatabaseService::open_in_memory().await.unwrap(),
            SchemaRegistry::new(1),
            SyncSettings::default(),
            NodeRole::Client,
        );
        let transport = CountingTransport {
            inner: LocalTransport::new(hub),
            exchanges,
        };
        let orchestrator = SyncOrchestrator::new(client_ctx, transport).await.unwrap();
        orchestrator.register("desk-01", "Desk", None).await.unwrap();
        Arc::new(orchestrator)
    }

    async fn wait_for_exchanges(exchanges: &AtomicUsize, at_least: usize) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while exchanges.load(Ordering::SeqCst) < at_least {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn first_cycle_runs_immediately() {
        let exchanges = Arc::new(AtomicUsize::new(0));
        let orchestrator = orchestrator(Arc::clone(&exchanges)).await;

        let scheduler = SyncScheduler::spawn(Arc::clone(&orchestrator), Duration::from_secs(3600));
        wait_for_exchanges(&exchanges, 1).await;
        scheduler.shutdown().await;

        assert!(!orchestrator.state().is_blocked());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn manual_trigger_runs_another_cycle() {
        let exchanges = Arc::new(AtomicUsize::new(0));
        let orchestrator = orchestrator(Arc::clone(&exchanges)).await;

        let scheduler = SyncScheduler::spawn(Arc::clone(&orchestrator), Duration::from_secs(3600));
        wait_for_exchanges(&exchanges, 1).await;
        // Let the first cycle finish so the trigger starts a fresh one.
        let mut states = orchestrator.subscribe();
        tokio::time::timeout(
            Duration::from_secs(10),
            states.wait_for(|state| *state == crate::state::SyncState::Idle),
        )
        .await
        .unwrap()
        .unwrap();
        let before = exchanges.load(Ordering::SeqCst);

        scheduler.trigger_now();
        wait_for_exchanges(&exchanges, before + 1).await;
        scheduler.shutdown().await;
    }
}
