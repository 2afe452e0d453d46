//! Connection health monitoring.
//!
//! Devices stream state continuously while connected, so prolonged silence
//! means the connection is dead even if TCP has not noticed yet. The
//! [`HealthMonitor`] checks the time since the last recorded activity on
//! every heartbeat. Once it exceeds the stale timeout the connection is
//! marked unhealthy and, if a reconnect callback is registered, a bounded
//! number of reconnection attempts is made.
//!
//! # States
//!
//! ```text
//!            stale timeout                      attempts exhausted
//! Healthy ─────────────────▶ Reconnecting(n) ─────────────────────▶ Unhealthy
//!    ▲                            │                                     │
//!    └────── success / activity ──┴────────────── activity / force ─────┘
//! ```

use std::{
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use futures_util::{future::BoxFuture, FutureExt};
use tokio::{sync::mpsc, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{config::Config, error::Result, events::Listeners};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum HealthEvent {
    /// No activity for longer than the stale timeout.
    Stale,
    Reconnecting { attempt: u32 },
    Reconnected,
    /// Every attempt failed. No further attempts are made until activity is
    /// recorded or a reconnect is forced.
    ReconnectFailed,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ConnectionHealthStatus {
    pub is_healthy: bool,
    pub last_activity: Instant,
    pub missed_heartbeats: u32,
    pub reconnect_attempt: u32,
}

type ReconnectFn = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

struct State {
    status: ConnectionHealthStatus,
    /// Bumped whenever a running reconnect cycle must stop.
    generation: u64,
}

struct Shared {
    heartbeat_interval: Duration,
    stale_timeout: Duration,
    max_reconnect_attempts: u32,
    reconnect_delay: Duration,
    state: Mutex<State>,
    reconnect: Mutex<Option<ReconnectFn>>,
    events: Listeners<HealthEvent>,
    cancel: CancellationToken,
}

/// Heartbeat and reconnect supervisor for one device connection.
///
/// Cloning yields another handle to the same monitor.
#[derive(Clone)]
pub struct HealthMonitor {
    shared: Arc<Shared>,
}

impl HealthMonitor {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            shared: Arc::new(Shared {
                heartbeat_interval: config.heartbeat_interval,
                stale_timeout: config.stale_timeout,
                max_reconnect_attempts: config.max_reconnect_attempts,
                reconnect_delay: config.reconnect_delay,
                state: Mutex::new(State {
                    status: ConnectionHealthStatus {
                        is_healthy: true,
                        last_activity: Instant::now(),
                        missed_heartbeats: 0,
                        reconnect_attempt: 0,
                    },
                    generation: 0,
                }),
                reconnect: Mutex::new(None),
                events: Listeners::new(),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Registers the callback that re-establishes the connection.
    pub fn on_reconnect<F, Fut>(&self, reconnect: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let reconnect: ReconnectFn = Arc::new(move || reconnect().boxed());
        *self
            .shared
            .reconnect
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(reconnect);
    }

    #[must_use]
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<HealthEvent> {
        self.shared.events.subscribe()
    }

    /// Starts the heartbeat timer.
    pub fn start(&self) {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval(shared.heartbeat_interval);
            heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            heartbeat.tick().await;

            loop {
                tokio::select! {
                    () = shared.cancel.cancelled() => break,
                    _ = heartbeat.tick() => check(&shared),
                }
            }
            trace!("heartbeat stopped");
        });
    }

    /// Stops the heartbeat and any reconnect in progress.
    pub fn stop(&self) {
        self.shared.cancel.cancel();
    }

    /// Notes that the connection is alive.
    ///
    /// An unhealthy monitor becomes healthy again and abandons its
    /// reconnect cycle.
    pub fn record_activity(&self) {
        let mut state = self.shared.lock();
        state.status.last_activity = Instant::now();
        state.status.missed_heartbeats = 0;
        if !state.status.is_healthy {
            state.status.is_healthy = true;
            state.status.reconnect_attempt = 0;
            state.generation += 1;
            debug!("connection is healthy again");
        }
    }

    /// Starts a new reconnect cycle right away, superseding any running one.
    pub fn force_reconnect(&self) {
        let generation = {
            let mut state = self.shared.lock();
            state.status.is_healthy = false;
            state.generation += 1;
            state.generation
        };

        info!("forcing reconnect");
        spawn_reconnect(&self.shared, generation);
    }

    #[must_use]
    pub fn status(&self) -> ConnectionHealthStatus {
        self.shared.lock().status
    }

    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.status().is_healthy
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.lock().generation == generation
    }

    fn reconnect_fn(&self) -> Option<ReconnectFn> {
        self.reconnect
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

fn check(shared: &Arc<Shared>) {
    let stale = {
        let mut state = shared.lock();
        let elapsed = state.status.last_activity.elapsed();
        if elapsed > shared.heartbeat_interval {
            state.status.missed_heartbeats += 1;
            trace!(
                "missed heartbeat {} ({elapsed:?} since last activity)",
                state.status.missed_heartbeats
            );
        }

        if elapsed > shared.stale_timeout && state.status.is_healthy {
            state.status.is_healthy = false;
            Some(state.generation)
        } else {
            None
        }
    };

    if let Some(generation) = stale {
        warn!("connection is stale");
        shared.events.publish(&HealthEvent::Stale);
        spawn_reconnect(shared, generation);
    }
}

fn spawn_reconnect(shared: &Arc<Shared>, generation: u64) {
    let Some(reconnect) = shared.reconnect_fn() else {
        debug!("no reconnect callback registered");
        return;
    };

    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        tokio::select! {
            () = shared.cancel.cancelled() => {}
            () = reconnect_cycle(&shared, reconnect, generation) => {}
        }
    });
}

async fn reconnect_cycle(shared: &Shared, reconnect: ReconnectFn, generation: u64) {
    for attempt in 1..=shared.max_reconnect_attempts {
        if !shared.is_current(generation) {
            debug!("reconnect superseded");
            return;
        }

        shared.lock().status.reconnect_attempt = attempt;
        info!(
            "reconnecting, attempt {attempt} of {}",
            shared.max_reconnect_attempts
        );
        shared
            .events
            .publish(&HealthEvent::Reconnecting { attempt });

        tokio::time::sleep(shared.reconnect_delay).await;
        if !shared.is_current(generation) {
            debug!("reconnect superseded");
            return;
        }

        match reconnect().await {
            Ok(()) => {
                {
                    let mut state = shared.lock();
                    state.status = ConnectionHealthStatus {
                        is_healthy: true,
                        last_activity: Instant::now(),
                        missed_heartbeats: 0,
                        reconnect_attempt: 0,
                    };
                }
                info!("reconnected");
                shared.events.publish(&HealthEvent::Reconnected);
                return;
            }
            Err(e) => warn!("reconnect attempt {attempt} failed: {e}"),
        }
    }

    if shared.is_current(generation) {
        error!(
            "giving up after {} reconnect attempts",
            shared.max_reconnect_attempts
        );
        shared.events.publish(&HealthEvent::ReconnectFailed);
    }
}
