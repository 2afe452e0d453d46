//! A connected device.
//!
//! Connecting a device means opening its control connection, learning its
//! service ports and connecting the services this client uses. StateMap is
//! required; FileTransfer and BeatInfo are used when offered.
//!
//! Background tasks then feed StateMap traffic into a [`PlayerAggregator`],
//! republish service traffic as [`Event`]s, record activity with the
//! device's [`HealthMonitor`] and force a reconnect when a connection drops.

use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    discovery::ConnectionInfo,
    error::{Error, Result},
    events::{Event, Listeners},
    health::HealthMonitor,
    player::{Layer, PlayerAggregator, PlayerStatus},
    service::{
        beat_info::{BeatData, BeatInfo}, directory::Directory, file_transfer::FileTransfer,
        state_map::{StateData, StateMap}, ServiceConnection, ServiceKind, ServiceMessage,
    },
    token::Token,
};

/// A connected service of a device.
#[derive(Clone)]
pub enum ServiceHandle {
    StateMap(Arc<ServiceConnection<StateMap>>),
    FileTransfer(Arc<ServiceConnection<FileTransfer>>),
    BeatInfo(Arc<ServiceConnection<BeatInfo>>),
}

impl ServiceHandle {
    #[must_use]
    pub fn kind(&self) -> ServiceKind {
        match self {
            Self::StateMap(_) => ServiceKind::StateMap,
            Self::FileTransfer(_) => ServiceKind::FileTransfer,
            Self::BeatInfo(_) => ServiceKind::BeatInfo,
        }
    }

    async fn disconnect(&self) {
        match self {
            Self::StateMap(connection) => connection.disconnect().await,
            Self::FileTransfer(connection) => connection.disconnect().await,
            Self::BeatInfo(connection) => connection.disconnect().await,
        }
    }

    async fn closed(&self) {
        match self {
            Self::StateMap(connection) => connection.closed().await,
            Self::FileTransfer(connection) => connection.closed().await,
            Self::BeatInfo(connection) => connection.closed().await,
        }
    }
}

pub struct Device {
    info: ConnectionInfo,
    directory: Arc<Directory>,
    services: HashMap<ServiceKind, ServiceHandle>,
    aggregator: Arc<PlayerAggregator>,
    cancel: CancellationToken,
}

impl Device {
    /// Connects to the device described by `info`.
    ///
    /// # Errors
    ///
    /// Returns an error when the control connection or the StateMap service
    /// cannot be established. Optional services that fail to connect are
    /// logged and skipped.
    pub async fn connect(
        info: ConnectionInfo,
        config: Arc<Config>,
        events: Listeners<Event>,
        health: HealthMonitor,
    ) -> Result<Self> {
        debug!("connecting to {info}");
        let directory = Arc::new(Directory::connect(info.directory_address(), &config).await?);
        let ports = directory.ports().clone();
        let address = |port| SocketAddr::new(info.address, port);

        let port = ports.port(ServiceKind::StateMap).ok_or_else(|| {
            Error::not_found(format!("{} does not offer {}", info.address, ServiceKind::StateMap))
        })?;
        let states = Listeners::new();
        let state_rx = states.subscribe();
        let state_map = Arc::new(
            ServiceConnection::connect_with_listeners(
                address(port),
                StateMap::new(),
                &config,
                states,
            )
            .await?,
        );

        let mut services = HashMap::new();
        services.insert(
            ServiceKind::StateMap,
            ServiceHandle::StateMap(Arc::clone(&state_map)),
        );

        if let Some(port) = ports.port(ServiceKind::FileTransfer) {
            match ServiceConnection::connect(address(port), FileTransfer, &config).await {
                Ok(connection) => {
                    services.insert(
                        ServiceKind::FileTransfer,
                        ServiceHandle::FileTransfer(Arc::new(connection)),
                    );
                }
                Err(e) => warn!("{}: {e}", ServiceKind::FileTransfer),
            }
        }

        let beats = Listeners::new();
        let beat_rx = beats.subscribe();
        if let Some(port) = ports.port(ServiceKind::BeatInfo) {
            let service = BeatInfo::new(config.beat_every_n);
            match ServiceConnection::connect_with_listeners(address(port), service, &config, beats)
                .await
            {
                Ok(connection) => {
                    services.insert(
                        ServiceKind::BeatInfo,
                        ServiceHandle::BeatInfo(Arc::new(connection)),
                    );
                }
                Err(e) => warn!("{}: {e}", ServiceKind::BeatInfo),
            }
        }

        let aggregator = Arc::new(PlayerAggregator::new(
            info.token,
            info.address,
            config.debounce_window,
            events.clone(),
        ));

        let device = Self {
            info,
            directory,
            services,
            aggregator,
            cancel: CancellationToken::new(),
        };

        device.spawn_state_pump(state_rx, &events, &health);
        device.spawn_beat_pump(beat_rx, &events, &health);
        device.spawn_activity_pump(&health);
        device.spawn_watchdog(&health);
        if config.download_databases {
            device.spawn_downloads(&config, &events);
        }

        info!("connected to {}", device.info);
        Ok(device)
    }

    #[must_use]
    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    #[must_use]
    pub fn token(&self) -> Token {
        self.info.token
    }

    #[must_use]
    pub fn service(&self, kind: ServiceKind) -> Option<&ServiceHandle> {
        self.services.get(&kind)
    }

    #[must_use]
    pub fn file_transfer(&self) -> Option<Arc<ServiceConnection<FileTransfer>>> {
        match self.services.get(&ServiceKind::FileTransfer) {
            Some(ServiceHandle::FileTransfer(connection)) => Some(Arc::clone(connection)),
            _ => None,
        }
    }

    /// Last published status of a deck.
    #[must_use]
    pub fn player_status(&self, layer: Layer) -> Option<PlayerStatus> {
        self.aggregator.status(layer)
    }

    /// Stops all background work and closes every connection.
    pub async fn disconnect(&self) {
        self.cancel.cancel();
        self.aggregator.stop();
        for service in self.services.values() {
            service.disconnect().await;
        }
        self.directory.disconnect().await;
        info!("disconnected from {}", self.info);
    }

    fn spawn_state_pump(
        &self,
        mut rx: mpsc::UnboundedReceiver<ServiceMessage<StateData>>,
        events: &Listeners<Event>,
        health: &HealthMonitor,
    ) {
        let token = self.token();
        let aggregator = Arc::clone(&self.aggregator);
        let events = events.clone();
        let health = health.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    () = cancel.cancelled() => break,
                    message = rx.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                };

                health.record_activity();
                aggregator.handle(&message.payload);
                events.publish(&Event::State(token, message.payload));
            }
        });
    }

    fn spawn_beat_pump(
        &self,
        mut rx: mpsc::UnboundedReceiver<ServiceMessage<BeatData>>,
        events: &Listeners<Event>,
        health: &HealthMonitor,
    ) {
        if self.service(ServiceKind::BeatInfo).is_none() {
            return;
        }

        let token = self.token();
        let events = events.clone();
        let health = health.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    message = rx.recv() => match message {
                        Some(message) => {
                            health.record_activity();
                            events.publish(&Event::Beat(token, message.payload));
                        }
                        None => break,
                    },
                }
            }
        });
    }

    fn spawn_activity_pump(&self, health: &HealthMonitor) {
        let mut rx = self.directory.subscribe();
        let health = health.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    message = rx.recv() => match message {
                        Some(_) => health.record_activity(),
                        None => break,
                    },
                }
            }
        });
    }

    /// Forces a reconnect once any connection of the device drops.
    fn spawn_watchdog(&self, health: &HealthMonitor) {
        let directory = Arc::clone(&self.directory);
        let services: Vec<ServiceHandle> = self.services.values().cloned().collect();
        let health = health.clone();
        let cancel = self.cancel.clone();
        let address = self.info.address;

        tokio::spawn(async move {
            let any_closed = async {
                let services = services.iter().map(|service| Box::pin(service.closed()));
                tokio::select! {
                    () = directory.closed() => {}
                    _ = futures_util::future::select_all(services) => {}
                }
            };

            tokio::select! {
                // Disconnecting cancels before closing the connections.
                biased;

                () = cancel.cancelled() => {}
                () = any_closed => {
                    warn!("lost connection to {address}");
                    health.force_reconnect();
                }
            }
        });
    }

    fn spawn_downloads(&self, config: &Config, events: &Listeners<Event>) {
        let Some(file_transfer) = self.file_transfer() else {
            warn!("{} does not offer {}", self.info.address, ServiceKind::FileTransfer);
            return;
        };

        let token = self.token();
        let dir = config.database_dir.join(token.to_string());
        let timeout = config.download_timeout;
        let events = events.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let download = async {
                for source in file_transfer.get_sources().await? {
                    let path = file_transfer
                        .download_database(&source, &dir, timeout, |progress| {
                            events.publish(&Event::FileTransferProgress(token, progress));
                        })
                        .await?;
                    events.publish(&Event::DatabaseDownloaded {
                        token,
                        source: source.name,
                        path,
                    });
                }
                Ok::<_, Error>(())
            };

            tokio::select! {
                () = cancel.cancelled() => {}
                result = download => {
                    if let Err(e) = result {
                        error!("database download failed: {e}");
                    }
                }
            }
        });
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
