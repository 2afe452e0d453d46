//! Session owner.
//!
//! A [`StageLinq`] session announces this client on the network, listens for
//! devices and keeps one [`Device`] connection per device token. Everything
//! that happens is published as an [`Event`].
//!
//! # Device lifecycle
//!
//! * A token seen for the first time is reported as
//!   [`Discovered`](Event::Discovered) and connected in the background.
//! * Repeated announcements with the same port are ignored. An announcement
//!   with a different port supersedes the known one and the device is
//!   connected again.
//! * Connecting is attempted up to `max_connection_attempts` times with
//!   exponential backoff. Giving up is reported as
//!   [`DeviceFailed`](Event::DeviceFailed).
//! * Once connected, the device's [`HealthMonitor`] watches it and
//!   re-establishes the device connection when it goes stale or drops.
//! * A logout announcement disconnects the device.
//!
//! # Example
//!
//! ```rust
//! use stagelinq::{config::Config, stagelinq::StageLinq};
//!
//! async fn follow() -> stagelinq::error::Result<()> {
//!     let session = StageLinq::new(Config::default());
//!     let mut events = session.subscribe();
//!     session.connect().await?;
//!     while let Some(event) = events.recv().await {
//!         println!("{event:?}");
//!     }
//!     Ok(())
//! }
//! ```

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use exponential_backoff::Backoff;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    device::Device,
    discovery::{Action, ConnectionInfo, Discovery},
    error::{Error, Result},
    events::{Event, Listeners},
    health::HealthMonitor,
    token::Token,
};

/// A followed device.
struct Entry {
    info: ConnectionInfo,
    /// Bumped whenever `info` is superseded, invalidating work in flight.
    generation: u64,
    device: Option<Arc<Device>>,
    health: Option<HealthMonitor>,
}

struct Shared {
    config: Arc<Config>,
    events: Listeners<Event>,
    devices: Mutex<HashMap<Token, Entry>>,
    discovery: Mutex<Option<Arc<Discovery>>>,
    cancel: Mutex<Option<CancellationToken>>,
}

pub struct StageLinq {
    shared: Arc<Shared>,
}

impl StageLinq {
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            shared: Arc::new(Shared {
                config: Arc::new(config),
                events: Listeners::new(),
                devices: Mutex::new(HashMap::new()),
                discovery: Mutex::new(None),
                cancel: Mutex::new(None),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Subscribes to every event of this session.
    #[must_use]
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Event> {
        self.shared.events.subscribe()
    }

    /// Starts announcing and following devices.
    ///
    /// # Errors
    ///
    /// Returns `FailedPrecondition` when the session is already connected,
    /// or an error when the discovery port cannot be bound or the first
    /// announcement cannot be sent.
    pub async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Err(Error::failed_precondition("session is already connected"));
        }

        let discovery = Arc::new(Discovery::bind(Arc::clone(&self.shared.config)).await?);
        discovery.announce().await?;

        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let listener = Arc::clone(&discovery);
        let stop = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = stop.cancelled() => {}
                result = listener.listen(|info| {
                    // The receiver only goes away when the session stops.
                    let _ = tx.send(info);
                }) => {
                    if let Err(e) = result {
                        error!("discovery listener stopped: {e}");
                    }
                }
            }
        });

        let shared = Arc::clone(&self.shared);
        let stop = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = stop.cancelled() => break,
                    info = rx.recv() => match info {
                        Some(info) => shared.handle_discovery(info).await,
                        None => break,
                    },
                }
            }
        });

        *lock(&self.shared.discovery) = Some(discovery);
        *lock(&self.shared.cancel) = Some(cancel);
        info!("following devices on port {}", self.shared.config.discovery_port);
        Ok(())
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        lock(&self.shared.cancel).is_some()
    }

    /// Stops announcing and disconnects every device.
    ///
    /// Calling this on a session that is not connected only disconnects
    /// devices added through [`handle_discovery`](Self::handle_discovery).
    pub async fn disconnect(&self) {
        if let Some(cancel) = lock(&self.shared.cancel).take() {
            cancel.cancel();
        }

        let discovery = lock(&self.shared.discovery).take();
        if let Some(discovery) = discovery {
            if let Err(e) = discovery.unannounce().await {
                warn!("could not announce logout: {e}");
            }
        }

        let entries: Vec<(Token, Entry)> = self.shared.lock_devices().drain().collect();
        for (token, entry) in entries {
            self.shared.release(token, entry).await;
        }
    }

    /// Handles one accepted discovery message.
    ///
    /// This is what the discovery listener of a connected session calls. It
    /// is public so that devices can be followed from another source of
    /// discovery messages.
    pub async fn handle_discovery(&self, info: ConnectionInfo) {
        self.shared.handle_discovery(info).await;
    }

    /// The connected device with `token`, if any.
    #[must_use]
    pub fn device(&self, token: Token) -> Option<Arc<Device>> {
        self.shared
            .lock_devices()
            .get(&token)
            .and_then(|entry| entry.device.clone())
    }

    /// Every known device, connected or not.
    #[must_use]
    pub fn devices(&self) -> Vec<ConnectionInfo> {
        self.shared
            .lock_devices()
            .values()
            .map(|entry| entry.info.clone())
            .collect()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn lock_devices(&self) -> MutexGuard<'_, HashMap<Token, Entry>> {
        lock(&self.devices)
    }

    fn is_current(&self, token: Token, generation: u64) -> bool {
        self.lock_devices()
            .get(&token)
            .is_some_and(|entry| entry.generation == generation)
    }

    async fn handle_discovery(self: &Arc<Self>, info: ConnectionInfo) {
        let token = info.token;

        if info.action == Action::Logout {
            let entry = self.lock_devices().remove(&token);
            if let Some(entry) = entry {
                info!("{} logged out", entry.info);
                self.release(token, entry).await;
            }
            return;
        }

        let (generation, superseded) = {
            let mut devices = self.lock_devices();
            if let Some(entry) = devices.get_mut(&token) {
                if entry.info.port == info.port {
                    return;
                }

                debug!("{} moved to port {}", entry.info, info.port);
                entry.info = info;
                entry.generation += 1;
                let superseded = (entry.device.take(), entry.health.take());
                (entry.generation, Some(superseded))
            } else {
                info!("discovered {info}");
                self.events.publish(&Event::Discovered(info.clone()));
                devices.insert(
                    token,
                    Entry {
                        info,
                        generation: 0,
                        device: None,
                        health: None,
                    },
                );
                (0, None)
            }
        };

        if let Some((device, health)) = superseded {
            if let Some(health) = health {
                health.stop();
            }
            if let Some(device) = device {
                device.disconnect().await;
                self.events.publish(&Event::Disconnected(token));
            }
        }

        let shared = Arc::clone(self);
        tokio::spawn(async move { shared.connect_with_retry(token, generation).await });
    }

    /// Connects a device, retrying with exponential backoff.
    async fn connect_with_retry(self: Arc<Self>, token: Token, generation: u64) {
        let backoff = Backoff::new(
            self.config.max_connection_attempts,
            self.config.min_connection_backoff,
            self.config.max_connection_backoff,
        );

        let mut attempt = 0;
        for delay in &backoff {
            let Some(info) = self.current_info(token, generation) else {
                return;
            };

            attempt += 1;
            let health = HealthMonitor::new(&self.config);
            match Device::connect(
                info,
                Arc::clone(&self.config),
                self.events.clone(),
                health.clone(),
            )
            .await
            {
                Ok(device) => {
                    self.install(token, generation, Arc::new(device), health)
                        .await;
                    return;
                }
                Err(e) => {
                    warn!("connection attempt {attempt} to {token} failed: {e}");
                    match delay {
                        Some(delay) => tokio::time::sleep(delay).await,
                        None => break,
                    }
                }
            }
        }

        if self.is_current(token, generation) {
            error!("giving up on {token} after {attempt} attempts");
            self.events.publish(&Event::DeviceFailed(token));
        }
    }

    fn current_info(&self, token: Token, generation: u64) -> Option<ConnectionInfo> {
        self.lock_devices()
            .get(&token)
            .filter(|entry| entry.generation == generation)
            .map(|entry| entry.info.clone())
    }

    /// Stores a freshly connected device and starts supervising it.
    async fn install(
        self: &Arc<Self>,
        token: Token,
        generation: u64,
        device: Arc<Device>,
        health: HealthMonitor,
    ) {
        let info = {
            let mut devices = self.lock_devices();
            match devices.get_mut(&token) {
                Some(entry) if entry.generation == generation => {
                    entry.device = Some(Arc::clone(&device));
                    entry.health = Some(health.clone());
                    Some(entry.info.clone())
                }
                _ => None,
            }
        };

        let Some(info) = info else {
            debug!("dropping superseded connection to {token}");
            device.disconnect().await;
            return;
        };

        let mut health_rx = health.subscribe();
        let events = self.events.clone();
        tokio::spawn(async move {
            while let Some(event) = health_rx.recv().await {
                events.publish(&Event::Health(token, event));
            }
        });

        let session = Arc::downgrade(self);
        health.on_reconnect(move || {
            let session = Weak::clone(&session);
            async move {
                let shared = session
                    .upgrade()
                    .ok_or_else(|| Error::cancelled("session has ended"))?;
                shared.reconnect(token, generation).await
            }
        });
        health.start();

        self.events.publish(&Event::Connected(info));
    }

    /// Replaces the device connection of a supervised device.
    async fn reconnect(&self, token: Token, generation: u64) -> Result<()> {
        let (info, previous, health) = {
            let mut devices = self.lock_devices();
            let entry = devices
                .get_mut(&token)
                .filter(|entry| entry.generation == generation)
                .ok_or_else(|| Error::cancelled(format!("{token} is no longer followed")))?;
            let health = entry
                .health
                .clone()
                .ok_or_else(|| Error::failed_precondition(format!("{token} is not supervised")))?;
            (entry.info.clone(), entry.device.take(), health)
        };

        if let Some(previous) = previous {
            previous.disconnect().await;
        }

        let device = Arc::new(
            Device::connect(
                info,
                Arc::clone(&self.config),
                self.events.clone(),
                health,
            )
            .await?,
        );

        let stale = {
            let mut devices = self.lock_devices();
            match devices.get_mut(&token) {
                Some(entry) if entry.generation == generation => {
                    entry.device = Some(Arc::clone(&device));
                    false
                }
                _ => true,
            }
        };

        if stale {
            device.disconnect().await;
            return Err(Error::cancelled(format!("{token} is no longer followed")));
        }

        Ok(())
    }

    async fn release(&self, token: Token, entry: Entry) {
        if let Some(health) = entry.health {
            health.stop();
        }
        if let Some(device) = entry.device {
            device.disconnect().await;
            self.events.publish(&Event::Disconnected(token));
        }
    }
}
