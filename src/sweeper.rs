use crate::orchestrator::{LifecycleEngine, RefundState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// What one sweep did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub refunded: usize,
}

/// Expires stale holds and retries pending refunds once
pub async fn sweep_once(engine: &LifecycleEngine) -> SweepReport {
    let mut report = SweepReport::default();

    match engine.expire_stale_holds(engine.now()).await {
        Ok(expired) => report.expired = expired.len(),
        Err(e) => warn!("Hold sweep failed: {}", e),
    }

    match engine.pending_refunds() {
        Ok(payments) => {
            for payment in payments {
                match engine.retry_refund(&payment.reservation_id).await {
                    Ok(result) if result.refund == RefundState::Refunded => report.refunded += 1,
                    Ok(_) => debug!("Refund of payment {} still pending", payment.payment_id),
                    Err(e) => warn!("Refund retry for payment {} failed: {}", payment.payment_id, e),
                }
            }
        }
        Err(e) => warn!("Could not list pending refunds: {}", e),
    }

    report
}

/// Runs [`sweep_once`] every `interval` until the shutdown signal fires
pub fn spawn_hold_sweeper(
    engine: Arc<LifecycleEngine>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Hold sweeper started (every {:?})", interval);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = sweep_once(&engine).await;
                    if report != SweepReport::default() {
                        info!(
                            "Sweep expired {} holds and completed {} refunds",
                            report.expired, report.refunded
                        );
                    }
                }
                _ = shutdown.recv() => {
                    info!("Hold sweeper stopping");
                    break;
                }
            }
        }
    })
}
