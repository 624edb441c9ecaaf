//! Periodic sweep loop.

use chrono::{Duration, Utc};
use std::sync::Arc;

use crate::orchestrator::{Dispatcher, SweepReport};

/// Sweep every `interval_secs` until the dispatcher's token is cancelled.
/// Returns the number of completed sweeps.
pub async fn spawn_sweeper(dispatcher: Arc<Dispatcher>, interval_secs: u64, stale_after_secs: u64) -> usize {
    tracing::info!("⏰ Sweeper started (every {interval_secs}s)");

    let cancel = dispatcher.cancel_token();
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs.max(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let stale_after = Duration::seconds(i64::try_from(stale_after_secs).unwrap_or(i64::MAX).min(i64::MAX / 1000));
    let mut sweeps = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        match dispatcher.run_sweep(Utc::now()).await {
            Ok(report) => {
                sweeps += 1;
                log_report(&report);
            }
            Err(e) => tracing::error!("❌ Sweep failed: {e}"),
        }

        match dispatcher.stale_reservations(Utc::now() - stale_after).await {
            Ok(stale) if !stale.is_empty() => {
                tracing::warn!("⚠️ {} reservation(s) never finalized; they stay blocked until reviewed", stale.len());
                for record in &stale {
                    tracing::warn!("   ↳ #{} {} since {}", record.id, record.key, record.created_at);
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("⚠️ Stale reservation check failed: {e}"),
        }
    }

    tracing::info!("🛑 Sweeper stopped after {sweeps} sweep(s)");
    sweeps
}

fn log_report(report: &SweepReport) {
    if report.failed > 0 {
        tracing::warn!("📊 Sweep: {} sent, {} failed", report.sent, report.failed);
    } else {
        tracing::debug!(
            "📊 Sweep: {} sent, {} duplicates, {} outside window, {} capped",
            report.sent,
            report.duplicates,
            report.outside_window,
            report.cap_exceeded
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Harness, ScriptedChannel};

    #[tokio::test]
    async fn test_sweeper_stops_on_cancel() {
        let h = Harness::new(ScriptedChannel::new());
        let token = h.dispatcher.cancel_token();
        let dispatcher = Arc::new(h.dispatcher);

        let handle = tokio::spawn(spawn_sweeper(dispatcher, 3600, 900));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        token.cancel();

        // The first tick fires immediately, then the loop waits for the next one.
        let sweeps = tokio::time::timeout(std::time::Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert_eq!(sweeps, 1);
    }
}
