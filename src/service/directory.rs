//! The primary control connection.
//!
//! Discovery announces a single TCP port per device. On that connection the
//! device tells which port every other service listens on. Unlike the other
//! services, messages here carry no length prefix; each one starts with its
//! message id and the sender's token.
//!
//! # Exchange
//!
//! 1. The device sends `ServicesRequest` (or starts announcing right away)
//! 2. We answer with `ServicesRequest` and our own token
//! 3. The device sends one `ServicesAnnouncement` per service
//!
//! `TimeStamp` messages keep arriving for as long as the connection is open
//! and serve as a liveness signal.

use std::{collections::HashMap, net::SocketAddr};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::{mpsc, Mutex},
};
use tokio_util::sync::CancellationToken;

use super::ServiceKind;
use crate::{
    config::Config,
    error::{Error, ErrorKind, Result},
    events::Listeners,
    token::Token,
    wire::{ReadContext, WriteContext},
};

const READ_BUFFER_SIZE: usize = 8192;

/// Message ids of the control connection.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageId {
    ServicesAnnouncement = 0,
    TimeStamp = 1,
    ServicesRequest = 2,
}

impl TryFrom<u32> for MessageId {
    type Error = Error;

    fn try_from(id: u32) -> Result<Self> {
        match id {
            0 => Ok(Self::ServicesAnnouncement),
            1 => Ok(Self::TimeStamp),
            2 => Ok(Self::ServicesRequest),
            _ => Err(Error::unimplemented(format!(
                "unknown directory message id {id}"
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DirectoryMessage {
    ServicesAnnouncement {
        token: Token,
        service: String,
        port: u16,
    },
    TimeStamp {
        token: Token,
        peer: Token,
        timestamp: u64,
    },
    ServicesRequest {
        token: Token,
    },
}

impl DirectoryMessage {
    /// Decodes one message at the cursor.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::DataLoss`] when the message is incomplete, and
    /// [`ErrorKind::Unimplemented`] for an unknown message id.
    pub fn decode(ctx: &mut ReadContext<'_>) -> Result<Self> {
        let id = MessageId::try_from(ctx.read_u32()?)?;
        let token = Token::from_bytes(ctx.read(Token::LENGTH)?)?;

        let message = match id {
            MessageId::ServicesAnnouncement => Self::ServicesAnnouncement {
                token,
                service: ctx.read_network_string()?,
                port: ctx.read_u16()?,
            },
            MessageId::TimeStamp => Self::TimeStamp {
                token,
                peer: Token::from_bytes(ctx.read(Token::LENGTH)?)?,
                timestamp: ctx.read_u64()?,
            },
            MessageId::ServicesRequest => Self::ServicesRequest { token },
        };
        Ok(message)
    }

    /// Encodes the message.
    ///
    /// # Errors
    ///
    /// Returns an error when a string cannot be encoded.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut ctx = WriteContext::new();
        match self {
            Self::ServicesAnnouncement {
                token,
                service,
                port,
            } => {
                ctx.write_u32(MessageId::ServicesAnnouncement as u32)?;
                ctx.write(token.as_bytes())?;
                ctx.write_network_string(service)?;
                ctx.write_u16(*port)?;
            }
            Self::TimeStamp {
                token,
                peer,
                timestamp,
            } => {
                ctx.write_u32(MessageId::TimeStamp as u32)?;
                ctx.write(token.as_bytes())?;
                ctx.write(peer.as_bytes())?;
                ctx.write_u64(*timestamp)?;
            }
            Self::ServicesRequest { token } => {
                ctx.write_u32(MessageId::ServicesRequest as u32)?;
                ctx.write(token.as_bytes())?;
            }
        }
        Ok(ctx.into_inner())
    }

    #[must_use]
    pub fn token(&self) -> Token {
        match self {
            Self::ServicesAnnouncement { token, .. }
            | Self::TimeStamp { token, .. }
            | Self::ServicesRequest { token } => *token,
        }
    }
}

/// Decodes every complete message in `buffer`.
///
/// Returns the messages and the number of bytes they took; an incomplete
/// trailing message is left for the next read.
///
/// # Errors
///
/// Returns an error for anything other than an incomplete message.
pub fn decode_stream(buffer: &[u8]) -> Result<(Vec<DirectoryMessage>, usize)> {
    let mut ctx = ReadContext::new(buffer);
    let mut messages = Vec::new();

    while !ctx.is_eof() {
        let start = ctx.tell();
        match DirectoryMessage::decode(&mut ctx) {
            Ok(message) => messages.push(message),
            Err(e) if e.kind == ErrorKind::DataLoss => return Ok((messages, start)),
            Err(e) => return Err(e),
        }
    }

    Ok((messages, ctx.tell()))
}

/// Ports of the services a device offers, by announced name.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServicePorts(HashMap<String, u16>);

impl ServicePorts {
    /// Records an announcement; a repeated name keeps the latest port.
    pub fn insert(&mut self, service: String, port: u16) {
        self.0.insert(service, port);
    }

    #[must_use]
    pub fn get(&self, service: &str) -> Option<u16> {
        self.0.get(service).copied()
    }

    #[must_use]
    pub fn port(&self, kind: ServiceKind) -> Option<u16> {
        self.get(kind.name())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether enough services have been announced to stop waiting.
    ///
    /// Without an expected count, more than three announcements count as
    /// complete. Devices do not say how many services they will announce.
    #[must_use]
    pub fn is_complete(&self, expected: Option<usize>) -> bool {
        match expected {
            Some(expected) => self.len() >= expected,
            None => self.len() > 3,
        }
    }
}

/// An open control connection whose service ports are known.
pub struct Directory {
    address: SocketAddr,
    ports: ServicePorts,
    writer: Mutex<OwnedWriteHalf>,
    messages: Listeners<DirectoryMessage>,
    cancel: CancellationToken,
    closed: CancellationToken,
}

impl Directory {
    /// Connects to a device and exchanges service ports.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::DeadlineExceeded`] when the device cannot be
    /// reached within the connect timeout or does not announce its services
    /// within the listen timeout, or any error from the connection itself.
    pub async fn connect(address: SocketAddr, config: &Config) -> Result<Self> {
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| Error::deadline_exceeded(format!("could not connect to {address}")))??;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();

        let messages = Listeners::new();
        let mut rx = messages.subscribe();
        let cancel = CancellationToken::new();
        let closed = CancellationToken::new();

        tokio::spawn({
            let messages = messages.clone();
            let cancel = cancel.clone();
            let closed = closed.clone();
            async move {
                match read_loop(reader, &messages, &cancel).await {
                    Ok(()) => debug!("directory connection to {address} closed"),
                    Err(e) => warn!("directory connection to {address} lost: {e}"),
                }
                closed.cancel();
            }
        });

        let mut directory = Self {
            address,
            ports: ServicePorts::default(),
            writer: Mutex::new(writer),
            messages,
            cancel,
            closed,
        };

        let ports = tokio::time::timeout(
            config.listen_timeout,
            directory.request_services(&mut rx, config),
        )
        .await
        .map_err(|_| {
            Error::deadline_exceeded(format!("no service ports announced by {address}"))
        })??;

        info!("{address} offers {} services", ports.len());
        directory.ports = ports;
        Ok(directory)
    }

    async fn request_services(
        &self,
        rx: &mut mpsc::UnboundedReceiver<DirectoryMessage>,
        config: &Config,
    ) -> Result<ServicePorts> {
        let mut ports = ServicePorts::default();
        let mut requested = false;

        loop {
            let message = tokio::select! {
                message = rx.recv() => message,
                () = self.closed.cancelled() => None,
            };

            match message {
                Some(DirectoryMessage::ServicesAnnouncement { service, port, .. }) => {
                    debug!("{service} on port {port} of {}", self.address);
                    ports.insert(service, port);
                }
                Some(DirectoryMessage::ServicesRequest { .. }) => {}
                Some(DirectoryMessage::TimeStamp { .. }) => continue,
                None => {
                    return Err(Error::aborted(format!(
                        "{} closed the connection before announcing services",
                        self.address
                    )))
                }
            }

            if !requested {
                let request = DirectoryMessage::ServicesRequest {
                    token: config.token,
                };
                self.writer
                    .lock()
                    .await
                    .write_all(&request.encode()?)
                    .await?;
                requested = true;
            }

            if ports.is_complete(config.expected_service_count) {
                return Ok(ports);
            }
        }
    }

    #[must_use]
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    #[must_use]
    pub fn ports(&self) -> &ServicePorts {
        &self.ports
    }

    /// Receives every message read after this call.
    #[must_use]
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<DirectoryMessage> {
        self.messages.subscribe()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    pub async fn disconnect(&self) {
        self.cancel.cancel();
        if let Err(e) = self.writer.lock().await.shutdown().await {
            trace!("directory shutdown: {e}");
        }
    }
}

impl Drop for Directory {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    messages: &Listeners<DirectoryMessage>,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut queue = Vec::new();
    let mut buffer = vec![0; READ_BUFFER_SIZE];

    loop {
        let len = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            read = reader.read(&mut buffer) => read?,
        };
        if len == 0 {
            return Err(Error::aborted("connection closed by peer"));
        }

        queue.extend_from_slice(&buffer[..len]);
        let (decoded, consumed) = decode_stream(&queue)?;
        queue.drain(..consumed);

        for message in &decoded {
            trace!("directory: {message:?}");
            messages.publish(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::TcpListener;

    use super::*;

    fn device_token() -> Token {
        "52fdfc07-2182-654f-163f-5f0f9a621d72".parse().unwrap()
    }

    fn announcements(token: Token, services: &[(&str, u16)]) -> Vec<u8> {
        services
            .iter()
            .flat_map(|(service, port)| {
                DirectoryMessage::ServicesAnnouncement {
                    token,
                    service: (*service).to_owned(),
                    port: *port,
                }
                .encode()
                .unwrap()
            })
            .collect()
    }

    #[test]
    fn incomplete_tail_is_kept() {
        let token = device_token();
        let mut stream = DirectoryMessage::ServicesRequest { token }.encode().unwrap();
        stream.extend(
            DirectoryMessage::TimeStamp {
                token,
                peer: token,
                timestamp: 42,
            }
            .encode()
            .unwrap(),
        );
        stream.extend(announcements(token, &[("StateMap", 50020)]));

        for split in 0..=stream.len() {
            let (mut messages, consumed) = decode_stream(&stream[..split]).unwrap();
            let rest = &stream[consumed..];
            let (more, consumed_rest) = decode_stream(rest).unwrap();
            messages.extend(more);
            assert_eq!(consumed_rest, rest.len(), "split at {split}");
            assert_eq!(messages.len(), 3, "split at {split}");
        }
    }

    #[test]
    fn unknown_message_id_is_fatal() {
        let mut bytes = 7u32.to_be_bytes().to_vec();
        bytes.extend_from_slice(device_token().as_bytes());
        assert_eq!(
            decode_stream(&bytes).unwrap_err().kind,
            ErrorKind::Unimplemented
        );
    }

    #[test]
    fn odd_service_name_length_is_fatal() {
        let token = device_token();
        let mut bytes = (MessageId::ServicesAnnouncement as u32).to_be_bytes().to_vec();
        bytes.extend_from_slice(token.as_bytes());
        bytes.extend_from_slice(&3u32.to_be_bytes());
        bytes.extend_from_slice(&[0, 0x53, 0, 0xc3, 0x50]);

        // A corrupt stream must not be mistaken for one that is still
        // arriving, no matter how much follows it.
        assert_eq!(
            decode_stream(&bytes).unwrap_err().kind,
            ErrorKind::InvalidArgument
        );
        bytes.extend(announcements(token, &[("StateMap", 50020)]));
        assert_eq!(
            decode_stream(&bytes).unwrap_err().kind,
            ErrorKind::InvalidArgument
        );
    }

    #[test]
    fn completion_heuristic() {
        let mut ports = ServicePorts::default();
        for (i, name) in ["StateMap", "FileTransfer", "BeatInfo"].iter().enumerate() {
            ports.insert((*name).to_owned(), 50000 + u16::try_from(i).unwrap());
        }
        assert!(!ports.is_complete(None));
        assert!(ports.is_complete(Some(3)));

        ports.insert(String::from("TimeSynchronization"), 50010);
        assert!(ports.is_complete(None));
        assert_eq!(ports.port(ServiceKind::FileTransfer), Some(50001));
    }

    #[tokio::test]
    async fn exchanges_service_ports() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = server.local_addr().unwrap();
        let config = Config {
            expected_service_count: Some(2),
            ..Config::default()
        };
        let own_token = config.token;

        let device = tokio::spawn(async move {
            let (mut socket, _) = server.accept().await.unwrap();
            let token = device_token();
            socket
                .write_all(&DirectoryMessage::ServicesRequest { token }.encode().unwrap())
                .await
                .unwrap();

            let mut request = [0; 20];
            socket.read_exact(&mut request).await.unwrap();
            assert_eq!(&request[..4], &[0, 0, 0, 2]);
            assert_eq!(&request[4..], own_token.as_bytes());

            socket
                .write_all(&announcements(
                    token,
                    &[("StateMap", 50020), ("FileTransfer", 50030)],
                ))
                .await
                .unwrap();
            socket
        });

        let directory = Directory::connect(address, &config).await.unwrap();
        assert_eq!(directory.ports().port(ServiceKind::StateMap), Some(50020));
        assert_eq!(directory.ports().port(ServiceKind::FileTransfer), Some(50030));
        drop(device.await.unwrap());
        directory.closed().await;
    }

    #[tokio::test]
    async fn silent_device_times_out() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = server.local_addr().unwrap();
        let config = Config {
            listen_timeout: Duration::from_millis(50),
            ..Config::default()
        };

        let device = tokio::spawn(async move { server.accept().await.unwrap() });
        let error = Directory::connect(address, &config).await.err().unwrap();
        assert_eq!(error.kind, ErrorKind::DeadlineExceeded);
        drop(device.await.unwrap());
    }
}
