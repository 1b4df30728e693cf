use std::{future::Future, sync::Arc, time::Duration};

use storefront_core::{ChannelSubscription, InvalidationSink};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    bridge::{BridgeHandle, SubscriptionHandle},
    polling::PollingFallback,
};

/// Realtime resources owned by one mounted view.
///
/// Unmounting (explicitly or by drop) stops the view's polls and releases its
/// subscriptions. Work wrapped with [`ViewScope::guard`] may still finish, but
/// its output is discarded once the view is gone.
pub struct ViewScope {
    bridge: BridgeHandle,
    handles: Vec<SubscriptionHandle>,
    polls: Vec<PollingFallback>,
    unmounted: CancellationToken,
}

impl ViewScope {
    pub fn new(bridge: BridgeHandle) -> Self {
        Self {
            bridge,
            handles: Vec::new(),
            polls: Vec::new(),
            unmounted: CancellationToken::new(),
        }
    }

    /// Register a subscription for the lifetime of this view.
    ///
    /// Returns whether it is live; failures are logged, never raised.
    pub async fn subscribe(&mut self, subscription: ChannelSubscription) -> bool {
        if !self.is_mounted() {
            return false;
        }
        let channel = subscription.channel_name.clone();
        match self.bridge.subscribe(subscription).await {
            Ok(handle) => {
                let active = handle.is_active();
                if active {
                    self.handles.push(handle);
                }
                active
            }
            Err(err) => {
                warn!(channel = %channel, error = %err, "view subscription failed");
                false
            }
        }
    }

    pub fn poll(
        &mut self,
        sink: Arc<dyn InvalidationSink>,
        resource_tag: impl Into<String>,
        interval: Duration,
    ) {
        if self.is_mounted() {
            self.polls
                .push(PollingFallback::start(sink, resource_tag, interval));
        }
    }

    /// Wrap in-flight work so its result is dropped if the view unmounts first.
    pub fn guard<F>(&self, work: F) -> impl Future<Output = Option<F::Output>> + use<F>
    where
        F: Future,
    {
        let unmounted = self.unmounted.clone();
        async move {
            let output = work.await;
            if unmounted.is_cancelled() {
                debug!("discarding result for unmounted view");
                None
            } else {
                Some(output)
            }
        }
    }

    pub fn is_mounted(&self) -> bool {
        !self.unmounted.is_cancelled()
    }

    pub fn unmount(&mut self) {
        if self.unmounted.is_cancelled() {
            return;
        }
        self.unmounted.cancel();
        for mut poll in self.polls.drain(..) {
            poll.stop();
        }
        for handle in self.handles.drain(..) {
            self.bridge.release(&handle);
        }
        debug!("view scope unmounted");
    }
}

impl Drop for ViewScope {
    fn drop(&mut self) {
        self.unmount();
    }
}
