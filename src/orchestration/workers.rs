//! Background worker loops.
//!
//! Each loop ticks on a fixed interval and stops when the shutdown channel
//! flips to `true`. A failing tick is logged and the loop carries on.

use crate::config::Config;
use crate::domain::{QueueName, TimeMs};
use crate::orchestration::Services;
use chrono::{NaiveDate, Utc};
use chrono_tz::Tz;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

/// Upper bound of messages drained from one queue per poll tick.
const MAX_MESSAGES_PER_TICK: usize = 100;

/// Start every worker loop. The handles finish after shutdown is signalled.
pub fn spawn_workers(
    services: &Services,
    config: &Config,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let tz = services.tz;

    let ingestion = services.ingestion.clone();
    let poller = spawn_loop("poller", config.poll_interval, shutdown.clone(), move || {
        let ingestion = ingestion.clone();
        async move {
            for queue in QueueName::ALL {
                if let Err(e) = ingestion
                    .poll_until_empty(queue, MAX_MESSAGES_PER_TICK, TimeMs::now())
                    .await
                {
                    error!(queue = %queue, error = %e, "queue poll failed");
                }
            }
        }
    });

    let processes = services.processes.clone();
    let effectuation = spawn_loop(
        "effectuation",
        config.effectuation_interval,
        shutdown.clone(),
        move || {
            let processes = processes.clone();
            async move {
                if let Err(e) = processes
                    .run_effectuation_tick(local_today(tz), TimeMs::now())
                    .await
                {
                    error!(error = %e, "effectuation tick failed");
                }
            }
        },
    );

    let settlement = services.settlement.clone();
    let corrections = services.corrections.clone();
    let settler = spawn_loop(
        "settlement",
        config.settlement_interval,
        shutdown.clone(),
        move || {
            let settlement = settlement.clone();
            let corrections = corrections.clone();
            async move {
                if let Err(e) = settlement
                    .run_settlement_tick(local_today(tz), TimeMs::now())
                    .await
                {
                    error!(error = %e, "settlement tick failed");
                }
                if let Err(e) = corrections.run_auto_correction_scan(TimeMs::now()).await {
                    error!(error = %e, "correction scan failed");
                }
            }
        },
    );

    let billing = services.billing.clone();
    let biller = spawn_loop("billing", config.billing_interval, shutdown, move || {
        let billing = billing.clone();
        async move {
            if let Err(e) = billing
                .run_billing_tick(local_today(tz), TimeMs::now())
                .await
            {
                error!(error = %e, "billing tick failed");
            }
        }
    });

    vec![poller, effectuation, settler, biller]
}

fn spawn_loop<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(worker = name, interval_ms = period.as_millis() as u64, "worker started");
        loop {
            tokio::select! {
                _ = ticker.tick() => tick().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!(worker = name, "worker stopped");
    })
}

/// Calendar date in the market time zone.
pub fn local_today(tz: Tz) -> NaiveDate {
    Utc::now().with_timezone(&tz).date_naive()
}
