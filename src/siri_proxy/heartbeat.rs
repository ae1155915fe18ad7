//! Per-consumer heartbeat emitters. Each consumer address with live
//! subscriptions gets one task ticking at the minimum interval across its
//! subscriptions, bounded by the latest termination time across them. When
//! the bound fires, the emitter removes itself.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use crate::proxy::ProxyState;

pub struct HeartbeatEntry {
    pub interval: Duration,
    pub termination_time: DateTime<Utc>,
    handle: JoinHandle<()>,
}

impl HeartbeatEntry {
    fn stop(self) {
        self.handle.abort();
    }
}

/// The minimum heartbeat interval and latest termination time across a
/// consumer address's live subscriptions, or None when it has none.
pub fn aggregate_for(
    state: &ProxyState,
    consumer_address: &str,
) -> Option<(Duration, DateTime<Utc>)> {
    let subscriptions = state.subscriptions.lock().expect("subscriptions lock");

    let mut minimum_interval: Option<Duration> = None;
    let mut latest_termination: Option<DateTime<Utc>> = None;

    for subscription in subscriptions
        .iter()
        .filter(|s| s.consumer_address == consumer_address)
    {
        if latest_termination.is_none()
            || Some(subscription.initial_termination_time) > latest_termination
        {
            latest_termination = Some(subscription.initial_termination_time);
        }

        if minimum_interval.is_none() || Some(subscription.heartbeat_interval) < minimum_interval {
            minimum_interval = Some(subscription.heartbeat_interval);
        }
    }

    match (minimum_interval, latest_termination) {
        (Some(interval), Some(termination)) => Some((interval, termination)),
        _ => None,
    }
}

/// Cancels any existing emitter for the consumer address and starts a
/// fresh one from the current aggregate. With no live subscriptions the
/// replacement emitter expires immediately.
pub fn initialise_heartbeat_notifications(state: Arc<ProxyState>, consumer_address: String) {
    let (interval, termination_time) = aggregate_for(&state, &consumer_address)
        .unwrap_or((state.default_heartbeat_interval, Utc::now()));

    // The lock is held across remove/spawn/insert so an emitter that
    // expires instantly cannot observe the map before its entry exists.
    let mut heartbeats = state.heartbeats.lock().expect("heartbeats lock");

    if let Some(entry) = heartbeats.remove(&consumer_address) {
        entry.stop();
    }

    let handle = tokio::spawn(run_emitter(
        Arc::clone(&state),
        consumer_address.clone(),
        interval,
        termination_time,
    ));

    heartbeats.insert(
        consumer_address,
        HeartbeatEntry {
            interval,
            termination_time,
            handle,
        },
    );
}

/// After subscriptions are removed, every emitter either disappears (no
/// subscriptions left at its address) or restarts when its aggregate
/// changed.
pub fn reconcile_heartbeats(state: &Arc<ProxyState>) {
    let addresses: Vec<String> = state
        .heartbeats
        .lock()
        .expect("heartbeats lock")
        .keys()
        .cloned()
        .collect();

    for address in addresses {
        match aggregate_for(state, &address) {
            None => {
                if let Some(entry) = state
                    .heartbeats
                    .lock()
                    .expect("heartbeats lock")
                    .remove(&address)
                {
                    entry.stop();
                }
            }
            Some((interval, termination_time)) => {
                let changed = state
                    .heartbeats
                    .lock()
                    .expect("heartbeats lock")
                    .get(&address)
                    .map(|entry| {
                        entry.interval != interval || entry.termination_time != termination_time
                    })
                    .unwrap_or(false);

                if changed {
                    initialise_heartbeat_notifications(Arc::clone(state), address);
                }
            }
        }
    }
}

async fn run_emitter(
    state: Arc<ProxyState>,
    consumer_address: String,
    interval: Duration,
    termination_time: DateTime<Utc>,
) {
    log::debug!("initialise heartbeat notification ticker to {consumer_address}");

    let until = (termination_time - Utc::now()).to_std().unwrap_or_default();
    let deadline = tokio::time::sleep(until);
    tokio::pin!(deadline);

    let mut ticker =
        tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);

    loop {
        tokio::select! {
            _ = &mut deadline => {
                log::debug!("terminate heartbeat notification ticker to {consumer_address}");
                state
                    .heartbeats
                    .lock()
                    .expect("heartbeats lock")
                    .remove(&consumer_address);
                return;
            }
            _ = ticker.tick() => {
                send_heartbeat_notification(&state, &consumer_address).await;
            }
        }
    }
}

async fn send_heartbeat_notification(state: &ProxyState, consumer_address: &str) {
    let body = state
        .latest_heartbeat
        .lock()
        .expect("latest heartbeat lock")
        .clone();

    let Some(body) = body else {
        log::info!("no heartbeat notification stored from target server");
        return;
    };

    let result = state
        .client
        .post(consumer_address)
        .header("Content-Type", "application/xml")
        .body(body)
        .send()
        .await;

    if result.is_err() {
        log::warn!("cannot send HeartbeatNotification request to client {consumer_address}");
    }
}
