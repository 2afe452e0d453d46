//! UDP peer discovery.
//!
//! Devices announce themselves by broadcasting discovery messages on a
//! shared UDP port. This client does the same so that devices will talk to
//! it, and listens for everybody else's announcements.
//!
//! # Wire Format
//!
//! ```text
//! ┌──────────┬───────────┬────────┬────────┬──────────┬──────────┬──────────┐
//! │ "airD"   │ token     │ source │ action │ sw name  │ sw vers. │ port     │
//! │ 4 ASCII  │ 16 bytes  │ netstr │ netstr │ netstr   │ netstr   │ u16 BE   │
//! └──────────┴───────────┴────────┴────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! A datagram that does not start with the marker is foreign traffic and is
//! ignored. A datagram that does but is not consumed exactly by the layout
//! above is malformed and is dropped as well; neither is reported as an
//! error to the listener's caller.

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    str::FromStr,
    sync::{Arc, Mutex},
};

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    error::{Error, Result},
    token::Token,
    wire::{ReadContext, WriteContext},
};

/// Marker opening every discovery datagram.
pub const DISCOVERY_MARKER: &str = "airD";

/// Largest datagram the listener accepts.
const MAX_DATAGRAM_SIZE: usize = 8192;

/// Whether a device joins or leaves the network.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Action {
    Login,
    Logout,
}

impl Action {
    const LOGIN: &'static str = "DISCOVERER_HOWDY_";
    const LOGOUT: &'static str = "DISCOVERER_EXIT_";
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Login => write!(f, "{}", Self::LOGIN),
            Self::Logout => write!(f, "{}", Self::LOGOUT),
        }
    }
}

impl FromStr for Action {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            Self::LOGIN => Ok(Self::Login),
            Self::LOGOUT => Ok(Self::Logout),
            _ => Err(Error::invalid_argument(format!(
                "unknown discovery action `{s}`"
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Software {
    pub name: String,
    pub version: String,
}

/// One discovery datagram.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DiscoveryMessage {
    pub token: Token,
    pub source: String,
    pub action: Action,
    pub software: Software,
    /// TCP port of the device's directory service.
    pub port: u16,
}

impl DiscoveryMessage {
    /// Builds the message this client announces itself with.
    #[must_use]
    pub fn announcement(config: &Config, action: Action) -> Self {
        Self {
            token: config.token,
            source: config.source_name.clone(),
            action,
            software: Software {
                name: config.software_name.clone(),
                version: config.software_version.clone(),
            },
            port: 0,
        }
    }

    /// Encodes the message into a datagram.
    ///
    /// # Errors
    ///
    /// Returns an error if a string cannot be encoded.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut ctx = WriteContext::new();
        ctx.write_fixed_string(DISCOVERY_MARKER)?;
        ctx.write(self.token.as_bytes())?;
        ctx.write_network_string(&self.source)?;
        ctx.write_network_string(&self.action.to_string())?;
        ctx.write_network_string(&self.software.name)?;
        ctx.write_network_string(&self.software.version)?;
        ctx.write_u16(self.port)?;
        Ok(ctx.into_inner())
    }

    /// Decodes a datagram.
    ///
    /// # Returns
    ///
    /// * `Ok(None)` - The datagram is not a discovery message
    /// * `Ok(Some(message))` - A well-formed discovery message
    ///
    /// # Errors
    ///
    /// Returns an error for a datagram that carries the marker but is
    /// truncated, has an unknown action, or has trailing bytes.
    pub fn decode(datagram: &[u8]) -> Result<Option<Self>> {
        let mut ctx = ReadContext::new(datagram);
        if ctx.size_left() < DISCOVERY_MARKER.len()
            || ctx.get_string(DISCOVERY_MARKER.len())? != DISCOVERY_MARKER
        {
            return Ok(None);
        }

        let message = Self {
            token: Token::from_bytes(ctx.read(Token::LENGTH)?)?,
            source: ctx.read_network_string()?,
            action: ctx.read_network_string()?.parse()?,
            software: Software {
                name: ctx.read_network_string()?,
                version: ctx.read_network_string()?,
            },
            port: ctx.read_u16()?,
        };

        if !ctx.is_eof() {
            return Err(Error::data_loss(format!(
                "discovery message has {} trailing bytes",
                ctx.size_left()
            )));
        }

        Ok(Some(message))
    }
}

/// A discovery message together with the address it was received from.
///
/// A newer announcement for the same token supersedes an older one; the
/// value itself is never mutated.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionInfo {
    pub token: Token,
    pub source: String,
    pub action: Action,
    pub software: Software,
    pub port: u16,
    pub address: IpAddr,
}

impl ConnectionInfo {
    #[must_use]
    pub fn new(message: DiscoveryMessage, address: IpAddr) -> Self {
        Self {
            token: message.token,
            source: message.source,
            action: message.action,
            software: message.software,
            port: message.port,
            address,
        }
    }

    /// Address of the device's directory service.
    #[must_use]
    pub fn directory_address(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} ({}) at {}:{}",
            self.software.name, self.software.version, self.token, self.address, self.port
        )
    }
}

/// Discovery listener and announcer sharing one UDP socket.
pub struct Discovery {
    socket: Arc<UdpSocket>,
    config: Arc<Config>,
    announcer: Mutex<Option<CancellationToken>>,
}

impl Discovery {
    /// Binds the discovery port on all interfaces.
    ///
    /// # Errors
    ///
    /// Returns an error when the port cannot be bound.
    pub async fn bind(config: Arc<Config>) -> Result<Self> {
        let address = SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), config.discovery_port);
        Self::bind_to(address, config).await
    }

    /// Binds a specific address.
    ///
    /// # Errors
    ///
    /// Returns an error when the address cannot be bound or broadcasting
    /// cannot be enabled.
    pub async fn bind_to(address: SocketAddr, config: Arc<Config>) -> Result<Self> {
        let socket = UdpSocket::bind(address).await?;
        socket.set_broadcast(true)?;
        debug!("discovery bound to {}", socket.local_addr()?);

        Ok(Self {
            socket: Arc::new(socket),
            config,
            announcer: Mutex::new(None),
        })
    }

    /// Local address of the discovery socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().map_err(Into::into)
    }

    /// Receives datagrams forever, calling `callback` for every accepted
    /// discovery message.
    ///
    /// No deduplication happens here: a device announcing once per second is
    /// reported once per second.
    ///
    /// # Errors
    ///
    /// Returns an error when receiving from the socket fails.
    pub async fn listen<F>(&self, mut callback: F) -> Result<()>
    where
        F: FnMut(ConnectionInfo),
    {
        let mut buffer = vec![0; MAX_DATAGRAM_SIZE];
        loop {
            let (len, from) = self.socket.recv_from(&mut buffer).await?;
            if let Some(info) = Self::accept(&self.config, &buffer[..len], from.ip()) {
                callback(info);
            }
        }
    }

    /// Decodes and filters one datagram.
    ///
    /// Foreign traffic, malformed datagrams, ignored device classes and our
    /// own looped-back announcements all yield `None`.
    #[must_use]
    pub fn accept(config: &Config, datagram: &[u8], address: IpAddr) -> Option<ConnectionInfo> {
        let message = match DiscoveryMessage::decode(datagram) {
            Ok(Some(message)) => message,
            Ok(None) => {
                trace!("ignoring {} byte datagram from {address}", datagram.len());
                return None;
            }
            Err(e) => {
                trace!("dropping malformed discovery message from {address}: {e}");
                return None;
            }
        };

        if message.source == config.source_name || message.token == config.token {
            trace!("ignoring own announcement from {address}");
            return None;
        }

        if config.is_ignored_software(&message.software.name) {
            trace!(
                "ignoring {} announcement from {address}",
                message.software.name
            );
            return None;
        }

        Some(ConnectionInfo::new(message, address))
    }

    /// Starts announcing this client on every IPv4 broadcast address.
    ///
    /// The first broadcast happens before this returns; it is repeated on
    /// the configured interval until [`unannounce`](Self::unannounce).
    /// Calling this while already announcing does nothing.
    ///
    /// # Errors
    ///
    /// Returns an error when the first broadcast fails or times out.
    pub async fn announce(&self) -> Result<()> {
        self.announce_to(broadcast_addresses(self.config.discovery_port))
            .await
    }

    /// Announces to `targets` instead of the interface broadcast addresses.
    pub(crate) async fn announce_to(&self, targets: Vec<SocketAddr>) -> Result<()> {
        if self.lock_announcer().is_some() {
            debug!("already announcing");
            return Ok(());
        }

        let message = DiscoveryMessage::announcement(&self.config, Action::Login).encode()?;
        self.broadcast(&message, &targets).await?;

        let cancel = CancellationToken::new();
        {
            let mut announcer = self.lock_announcer();
            if announcer.is_some() {
                return Ok(());
            }
            *announcer = Some(cancel.clone());
        }
        info!("announcing as {} on {targets:?}", self.config.token);

        let socket = Arc::clone(&self.socket);
        let interval = self.config.announce_interval;
        let timeout = self.config.connect_timeout;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately and was broadcast above.
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = send_all(&socket, &message, &targets, timeout).await {
                            warn!("announcement failed: {e}");
                        }
                    }
                }
            }
            trace!("announcer stopped");
        });

        Ok(())
    }

    /// Stops announcing and broadcasts a single logout message.
    ///
    /// # Errors
    ///
    /// Returns an error when the logout broadcast fails or times out.
    pub async fn unannounce(&self) -> Result<()> {
        self.unannounce_to(&broadcast_addresses(self.config.discovery_port))
            .await
    }

    pub(crate) async fn unannounce_to(&self, targets: &[SocketAddr]) -> Result<()> {
        if let Some(cancel) = self.lock_announcer().take() {
            cancel.cancel();
        }

        let message = DiscoveryMessage::announcement(&self.config, Action::Logout).encode()?;
        self.broadcast(&message, targets).await?;
        info!("unannounced {}", self.config.token);
        Ok(())
    }

    #[must_use]
    pub fn is_announcing(&self) -> bool {
        self.lock_announcer().is_some()
    }

    async fn broadcast(&self, message: &[u8], targets: &[SocketAddr]) -> Result<()> {
        send_all(&self.socket, message, targets, self.config.connect_timeout).await
    }

    fn lock_announcer(&self) -> std::sync::MutexGuard<'_, Option<CancellationToken>> {
        self.announcer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        if let Some(cancel) = self.lock_announcer().take() {
            cancel.cancel();
        }
    }
}

async fn send_all(
    socket: &UdpSocket,
    message: &[u8],
    targets: &[SocketAddr],
    timeout: std::time::Duration,
) -> Result<()> {
    for target in targets {
        tokio::time::timeout(timeout, socket.send_to(message, target))
            .await
            .map_err(|_| Error::deadline_exceeded(format!("failed to send announcement to {target}")))??;
    }
    Ok(())
}

/// Broadcast addresses of every IPv4, non-loopback interface.
///
/// Falls back to the limited broadcast address when no interface qualifies.
#[must_use]
pub fn broadcast_addresses(port: u16) -> Vec<SocketAddr> {
    let networks = sysinfo::Networks::new_with_refreshed_list();
    let mut addresses: Vec<SocketAddr> = networks
        .list()
        .values()
        .flat_map(sysinfo::NetworkData::ip_networks)
        .filter_map(|network| match network.addr {
            IpAddr::V4(addr) if !addr.is_loopback() => {
                Some(broadcast_address(addr, network.prefix))
            }
            _ => None,
        })
        .map(|addr| SocketAddr::new(addr.into(), port))
        .collect();

    addresses.sort_unstable();
    addresses.dedup();

    if addresses.is_empty() {
        warn!("no IPv4 interface found, using limited broadcast");
        addresses.push(SocketAddr::new(Ipv4Addr::BROADCAST.into(), port));
    }
    addresses
}

/// Directed broadcast address of `addr` within a network of `prefix` bits.
#[must_use]
pub fn broadcast_address(addr: Ipv4Addr, prefix: u8) -> Ipv4Addr {
    let mask = match prefix {
        0 => 0,
        p if p >= 32 => u32::MAX,
        p => u32::MAX << (32 - u32::from(p)),
    };
    Ipv4Addr::from(u32::from(addr) | !mask)
}
