use crate::store::EntityStore;
use crate::{BoxOfficeError, Result};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{error, info, warn};

/// Graceful shutdown coordinator
#[derive(Clone)]
pub struct ShutdownCoordinator {
    shutdown_tx: broadcast::Sender<()>,
    shutdown_rx: Arc<Mutex<broadcast::Receiver<()>>>,
    components: Arc<Mutex<Vec<Box<dyn ShutdownComponent + Send + Sync>>>>,
    shutdown_timeout: Duration,
}

/// Trait for components that need graceful shutdown
#[async_trait::async_trait]
pub trait ShutdownComponent {
    async fn shutdown(&self) -> Result<()>;
    fn name(&self) -> &str;
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl ShutdownCoordinator {
    pub fn new(shutdown_timeout: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        Self {
            shutdown_tx,
            shutdown_rx: Arc::new(Mutex::new(shutdown_rx)),
            components: Arc::new(Mutex::new(Vec::new())),
            shutdown_timeout,
        }
    }

    /// Register a component for graceful shutdown
    pub async fn register_component(&self, component: Box<dyn ShutdownComponent + Send + Sync>) {
        let mut components = self.components.lock().await;
        info!("Registering component '{}' for graceful shutdown", component.name());
        components.push(component);
    }

    /// Get a shutdown signal receiver
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Tell every subscriber to stop, without waiting for components
    pub fn trigger(&self) {
        if self.shutdown_tx.send(()).is_err() {
            warn!("No subscriber left for the shutdown signal");
        }
    }

    /// Signal subscribers, then shut every registered component down in
    /// registration order
    pub async fn shutdown(&self) -> Result<()> {
        info!("Initiating graceful shutdown...");
        self.trigger();

        let components = self.components.lock().await;
        let shutdown_all = async {
            let mut failures = 0usize;
            for component in components.iter() {
                info!("Shutting down component '{}'", component.name());
                match component.shutdown().await {
                    Ok(()) => info!("Component '{}' shutdown successfully", component.name()),
                    Err(e) => {
                        failures += 1;
                        error!("Component '{}' shutdown failed: {}", component.name(), e);
                    }
                }
            }
            failures
        };

        match tokio::time::timeout(self.shutdown_timeout, shutdown_all).await {
            Ok(0) => {
                info!("All components shutdown successfully");
                Ok(())
            }
            Ok(failures) => Err(BoxOfficeError::StorageUnavailable(format!(
                "{} components failed to shut down",
                failures
            ))),
            Err(_) => {
                error!("Shutdown timeout exceeded");
                Err(BoxOfficeError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "shutdown timeout exceeded",
                )))
            }
        }
    }

    /// Wait for shutdown signal
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.shutdown_rx.lock().await;
        let _ = rx.recv().await;
    }
}

/// Flushes the record store on the way out
pub struct StoreShutdown {
    store: EntityStore,
}

impl StoreShutdown {
    pub fn new(store: EntityStore) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl ShutdownComponent for StoreShutdown {
    async fn shutdown(&self) -> Result<()> {
        info!("Flushing {} store...", self.store.backend().name());
        self.store.flush()?;
        info!("Store flushed successfully");
        Ok(())
    }

    fn name(&self) -> &str {
        "entity-store"
    }
}

/// Waits for a background task that listens to the shutdown signal
pub struct TaskShutdown {
    name: String,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TaskShutdown {
    pub fn new(name: &str, handle: JoinHandle<()>) -> Self {
        Self {
            name: name.to_string(),
            handle: Mutex::new(Some(handle)),
        }
    }
}

#[async_trait::async_trait]
impl ShutdownComponent for TaskShutdown {
    async fn shutdown(&self) -> Result<()> {
        if let Some(handle) = self.handle.lock().await.take() {
            if let Err(e) = handle.await {
                warn!("Task '{}' ended abnormally: {}", self.name, e);
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Triggers the coordinator on SIGTERM or Ctrl+C
pub fn setup_signal_handlers(coordinator: ShutdownCoordinator) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    error!("Failed to setup SIGTERM handler: {}", e);
                    return;
                }
            };

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown");
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
                }
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
                return;
            }
            info!("Received Ctrl+C, initiating graceful shutdown");
        }

        coordinator.trigger();
    });
}

/// Runs `service_future` until it ends or a shutdown signal arrives, then
/// shuts the registered components down
pub async fn run_with_graceful_shutdown<F, Fut>(
    service_name: &str,
    service_future: F,
    shutdown_coordinator: ShutdownCoordinator,
) -> Result<()>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    info!("Starting service '{}'", service_name);

    setup_signal_handlers(shutdown_coordinator.clone());

    let service_result = tokio::select! {
        result = service_future() => {
            info!("Service '{}' completed", service_name);
            result
        }
        _ = shutdown_coordinator.wait_for_shutdown() => {
            info!("Service '{}' received shutdown signal", service_name);
            Ok(())
        }
    };

    if let Err(e) = shutdown_coordinator.shutdown().await {
        error!("Failed to shutdown service '{}': {}", service_name, e);
        return Err(e);
    }

    service_result
}
