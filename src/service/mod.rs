//! Service transport.
//!
//! After discovery, every device sub-protocol runs over its own TCP
//! connection. A [`ServiceConnection`] opens that connection, sends the
//! handshake, lets the service queue its initial requests and then
//! reassembles incoming frames, parses them with the service and publishes
//! the resulting [`ServiceMessage`]s to subscribers.
//!
//! Concrete services implement the [`Service`] trait; the transport never
//! needs to know which one it carries.

pub mod beat_info;
pub mod directory;
pub mod file_transfer;
pub mod framer;
pub mod state_map;

use std::{fmt, future::Future, net::SocketAddr, str::FromStr, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::{mpsc, Mutex},
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    error::{Error, Result},
    events::Listeners,
    token::Token,
    wire::{ReadContext, WriteContext},
};

use self::framer::Framer;

/// Size of the socket read buffer.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// The sub-protocols a device can offer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ServiceKind {
    /// The primary control connection announcing all other services.
    Directory,
    StateMap,
    FileTransfer,
    BeatInfo,
    TimeSynchronization,
}

impl ServiceKind {
    /// Name of the service in service announcements.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Directory => "DirectoryService",
            Self::StateMap => "StateMap",
            Self::FileTransfer => "FileTransfer",
            Self::BeatInfo => "BeatInfo",
            Self::TimeSynchronization => "TimeSynchronization",
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for ServiceKind {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        [
            Self::Directory,
            Self::StateMap,
            Self::FileTransfer,
            Self::BeatInfo,
            Self::TimeSynchronization,
        ]
        .into_iter()
        .find(|kind| kind.name() == s)
        .ok_or_else(|| Error::not_found(format!("unknown service `{s}`")))
    }
}

/// One decoded message of a service.
#[derive(Clone, Debug, PartialEq)]
pub struct ServiceMessage<T> {
    pub id: u32,
    pub payload: T,
}

/// The capabilities a sub-protocol provides to the transport.
pub trait Service: Send + 'static {
    type Message: Clone + fmt::Debug + Send + Sync + 'static;

    const KIND: ServiceKind;

    /// Decodes one frame, without its length prefix.
    ///
    /// # Errors
    ///
    /// Returns an error when the frame violates the protocol. The frame is
    /// then dropped.
    fn parse_data(&mut self, ctx: &mut ReadContext<'_>) -> Result<ServiceMessage<Self::Message>>;

    /// Inspects a decoded message before it is published, returning whether
    /// subscribers should receive it.
    fn message_handler(&mut self, message: &ServiceMessage<Self::Message>) -> bool {
        let _ = message;
        true
    }

    /// Frames to send right after the handshake, already length-prefixed.
    ///
    /// # Errors
    ///
    /// Returns an error when a request cannot be encoded.
    fn init(&mut self) -> Result<Vec<Vec<u8>>> {
        Ok(Vec::new())
    }
}

/// Encodes the frame that opens every service connection.
///
/// # Errors
///
/// Returns an error when the service name cannot be encoded.
pub fn handshake(token: Token, kind: ServiceKind, local_port: u16) -> Result<Vec<u8>> {
    let mut ctx = WriteContext::new();
    ctx.write_u32(directory::MessageId::ServicesAnnouncement as u32)?;
    ctx.write(token.as_bytes())?;
    ctx.write_network_string(kind.name())?;
    ctx.write_u16(local_port)?;
    Ok(ctx.into_inner())
}

/// A TCP connection carrying one service.
///
/// Reading happens on a background task that exclusively owns the framing
/// state and the service, so frames are parsed strictly in arrival order.
pub struct ServiceConnection<S: Service> {
    address: SocketAddr,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    listeners: Listeners<ServiceMessage<S::Message>>,
    message_timeout: Duration,
    cancel: CancellationToken,
    closed: CancellationToken,
}

impl<S: Service> ServiceConnection<S> {
    /// Connects to `address`, performs the handshake and starts reading.
    ///
    /// # Errors
    ///
    /// Returns an error when the connection cannot be opened, or the
    /// handshake and initial requests cannot be sent, within the connect
    /// timeout.
    pub async fn connect(address: SocketAddr, service: S, config: &Config) -> Result<Self> {
        Self::connect_with_listeners(address, service, config, Listeners::new()).await
    }

    /// Like [`connect`](Self::connect), publishing to an existing registry.
    ///
    /// Subscribing to `listeners` beforehand guarantees that no message is
    /// missed, including the replies to the service's initial requests.
    ///
    /// # Errors
    ///
    /// See [`connect`](Self::connect).
    pub async fn connect_with_listeners(
        address: SocketAddr,
        mut service: S,
        config: &Config,
        listeners: Listeners<ServiceMessage<S::Message>>,
    ) -> Result<Self> {
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| {
                Error::deadline_exceeded(format!("could not connect to {} at {address}", S::KIND))
            })??;
        stream.set_nodelay(true)?;

        let local_port = stream.local_addr()?.port();
        let (reader, mut writer) = stream.into_split();

        let greeting = handshake(config.token, S::KIND, local_port)?;
        let requests = service.init()?;
        tokio::time::timeout(config.connect_timeout, async {
            writer.write_all(&greeting).await?;
            for frame in &requests {
                writer.write_all(frame).await?;
            }
            Ok::<_, Error>(())
        })
        .await
        .map_err(|_| {
            Error::deadline_exceeded(format!("{} handshake with {address} timed out", S::KIND))
        })??;
        debug!("{} connected to {address}", S::KIND);

        let cancel = CancellationToken::new();
        let closed = CancellationToken::new();

        tokio::spawn({
            let listeners = listeners.clone();
            let cancel = cancel.clone();
            let closed = closed.clone();
            async move {
                match read_loop(reader, service, &listeners, &cancel).await {
                    Ok(()) => debug!("{} connection to {address} closed", S::KIND),
                    Err(e) => warn!("{} connection to {address} lost: {e}", S::KIND),
                }
                closed.cancel();
            }
        });

        Ok(Self {
            address,
            writer: Arc::new(Mutex::new(writer)),
            listeners,
            message_timeout: config.message_timeout,
            cancel,
            closed,
        })
    }

    #[must_use]
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Sends an already framed request.
    ///
    /// # Errors
    ///
    /// Returns an error when the connection is closed or the write fails.
    pub async fn send(&self, frame: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(Error::failed_precondition(format!(
                "{} connection to {} is closed",
                S::KIND,
                self.address
            )));
        }

        let mut writer = self.writer.lock().await;
        writer.write_all(frame).await.map_err(Into::into)
    }

    /// Receives every message published after this call.
    #[must_use]
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ServiceMessage<S::Message>> {
        self.listeners.subscribe()
    }

    /// Waits for the next message with `id`.
    ///
    /// The subscription is made when this is called, not when the returned
    /// future is first polled, so a request may be sent in between without
    /// losing a fast reply.
    ///
    /// # Errors
    ///
    /// The future fails with a deadline-exceeded error if no such message
    /// arrives within the message timeout, or with an aborted error if the
    /// connection goes away first.
    pub fn wait_for_message(
        &self,
        id: u32,
    ) -> impl Future<Output = Result<ServiceMessage<S::Message>>> + Send + 'static {
        let mut rx = self.listeners.subscribe();
        let timeout = self.message_timeout;
        let closed = self.closed.clone();

        async move {
            let wait = async {
                loop {
                    tokio::select! {
                        message = rx.recv() => match message {
                            Some(message) if message.id == id => return Ok(message),
                            Some(_) => {}
                            None => break,
                        },
                        () = closed.cancelled() => break,
                    }
                }
                Err(Error::aborted(format!(
                    "{} connection closed while waiting for message {id}",
                    S::KIND
                )))
            };

            tokio::time::timeout(timeout, wait).await.map_err(|_| {
                Error::deadline_exceeded(format!(
                    "no {} message {id} within {timeout:?}",
                    S::KIND
                ))
            })?
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the reading task has stopped for whatever reason.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Stops reading and shuts the socket down.
    pub async fn disconnect(&self) {
        self.cancel.cancel();
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            trace!("{} shutdown: {e}", S::KIND);
        }
        debug!("{} disconnected from {}", S::KIND, self.address);
    }
}

impl<S: Service> Drop for ServiceConnection<S> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn read_loop<S: Service>(
    mut reader: OwnedReadHalf,
    mut service: S,
    listeners: &Listeners<ServiceMessage<S::Message>>,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut framer = Framer::new();
    let mut buffer = vec![0; READ_BUFFER_SIZE];

    loop {
        let len = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            read = reader.read(&mut buffer) => read?,
        };
        if len == 0 {
            if framer.pending() > 0 {
                warn!(
                    "{}: discarding {} bytes of an incomplete frame",
                    S::KIND,
                    framer.pending()
                );
            }
            return Err(Error::aborted("connection closed by peer"));
        }

        for frame in framer.push(&buffer[..len])? {
            let mut ctx = ReadContext::new(&frame);
            match service.parse_data(&mut ctx) {
                Ok(message) => {
                    if service.message_handler(&message) {
                        listeners.publish(&message);
                    }
                }
                Err(e) => error!("{}: dropping message: {e}", S::KIND),
            }
        }
    }
}
