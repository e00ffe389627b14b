//! Liveness announcements shared by every grain.

use core::time::Duration;
use std::collections::BTreeMap;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::warn;
use uuid::Uuid;

use avalon_types::{GrainKind, GrainUpdate, UpdateKind, topics};

use crate::bus::{EventBus, publish_logged};

/// Shortest ticker period.
pub(crate) const MIN_PERIOD: Duration = Duration::from_secs(1);

/// Publish one liveness update to the admin topic. Failures are logged.
pub(crate) async fn announce(
    bus: &dyn EventBus,
    update_kind: UpdateKind,
    grain_kind: GrainKind,
    identity: Uuid,
    address: &str,
    context: BTreeMap<String, String>,
) {
    let update = GrainUpdate {
        update_kind,
        grain_kind,
        identity,
        address: address.to_owned(),
        timestamp: Utc::now(),
        context,
    };
    publish_logged(bus, topics::GRAIN_LIVENESS, &update).await;
}

/// Send `make()` into a grain's mailbox every `period`, first tick after
/// one full period. Stops once the mailbox is gone.
///
/// A zero period is raised to [`MIN_PERIOD`].
pub(crate) fn spawn_ticker<M: Send + 'static>(
    mailbox: mpsc::WeakSender<M>,
    period: Duration,
    make: fn() -> M,
) -> JoinHandle<()> {
    if period.is_zero() {
        warn!(min_period = ?MIN_PERIOD, "zero ticker period raised to minimum");
    }
    let period = period.max(MIN_PERIOD);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(tx) = mailbox.upgrade() else { break };
            if tx.send(make()).await.is_err() {
                break;
            }
        }
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn zero_period_ticks_at_the_minimum() {
        let (tx, mut rx) = mpsc::channel::<()>(4);
        let task = spawn_ticker(tx.downgrade(), Duration::ZERO, || ());

        tokio::time::sleep(MIN_PERIOD.saturating_mul(2)).await;
        rx.recv().await.unwrap();
        assert!(!task.is_finished());
        task.abort();
    }
}
