//! Polling backstop for views whose data must stay fresh even when a push
//! event is missed.

use std::{sync::Arc, time::Duration};

use serde_json::json;
use storefront_core::{InvalidationEvent, InvalidationSink};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Periodically invalidates one resource tag until stopped or dropped.
pub struct PollingFallback {
    resource_tag: String,
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl PollingFallback {
    pub fn start(
        sink: Arc<dyn InvalidationSink>,
        resource_tag: impl Into<String>,
        interval: Duration,
    ) -> Self {
        let resource_tag = resource_tag.into();
        let stop = CancellationToken::new();
        let task = tokio::spawn(poll_loop(
            sink,
            resource_tag.clone(),
            interval,
            stop.clone(),
        ));
        debug!(resource_tag = %resource_tag, ?interval, "polling fallback started");

        Self {
            resource_tag,
            stop,
            task: Some(task),
        }
    }

    pub fn resource_tag(&self) -> &str {
        &self.resource_tag
    }

    pub fn is_running(&self) -> bool {
        !self.stop.is_cancelled()
    }

    pub fn stop(&mut self) {
        if self.stop.is_cancelled() {
            return;
        }
        self.stop.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
        debug!(resource_tag = %self.resource_tag, "polling fallback stopped");
    }
}

impl Drop for PollingFallback {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn poll_loop(
    sink: Arc<dyn InvalidationSink>,
    resource_tag: String,
    interval: Duration,
    stop: CancellationToken,
) {
    // First tick one interval out; the view has just loaded.
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => return,
            _ = ticker.tick() => {
                trace!(resource_tag = %resource_tag, "poll tick");
                sink.invalidate(InvalidationEvent::new(
                    resource_tag.clone(),
                    json!({"source": "poll"}),
                ));
            }
        }
    }
}
