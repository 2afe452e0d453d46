//! FileTransfer: remote file access.
//!
//! Used to enumerate the data sources of a device (USB sticks, SD cards)
//! and to download their Engine Library databases in 4 KiB chunks.
//!
//! Every frame starts with the `fltx` marker. Requests continue with a zero
//! `u32` and a request code; replies continue with a zero `u32` and a
//! message id. A non-zero value instead of that zero marks a time code
//! frame, which carries nothing of interest.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use super::{Service, ServiceConnection, ServiceKind, ServiceMessage};
use crate::{
    error::{Error, Result},
    wire::{ReadContext, WriteContext},
};

pub const MAGIC_MARKER: &str = "fltx";

/// Largest payload of a single chunk.
pub const CHUNK_SIZE: u32 = 4096;

const TIMECODE_MARKER: u32 = 0x7d2;
const FILE_STAT_SIZE: usize = 53;
const SOURCE_SENTINEL: [u8; 3] = [1, 1, 1];

const REQUEST_FILE_TRANSFER_ID: u32 = 0x7d1;
const REQUEST_SOURCES: u32 = 0x7d2;
const REQUEST_CHUNK_RANGE: u32 = 0x7d3;
const REQUEST_STAT: u32 = 0x7d4;
const SIGNAL_TRANSFER_COMPLETE: u32 = 0x7d5;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageId {
    /// Not on the wire: assigned to time code frames.
    TimeCode = 0,
    FileStat = 1,
    EndOfMessage = 2,
    SourceLocations = 3,
    FileTransferId = 4,
    FileTransferChunk = 5,
    Unknown = 8,
}

impl TryFrom<u32> for MessageId {
    type Error = Error;

    fn try_from(id: u32) -> Result<Self> {
        match id {
            1 => Ok(Self::FileStat),
            2 => Ok(Self::EndOfMessage),
            3 => Ok(Self::SourceLocations),
            4 => Ok(Self::FileTransferId),
            5 => Ok(Self::FileTransferChunk),
            8 => Ok(Self::Unknown),
            _ => Err(Error::unimplemented(format!(
                "unhandled FileTransfer message id {id}"
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FileTransferMessage {
    TimeCode(u32),
    FileStat { size: u32 },
    EndOfMessage,
    SourceLocations(Vec<String>),
    FileTransferId { size: u32, txid: u32 },
    FileTransferChunk { offset: u32, data: Vec<u8> },
    Unknown,
}

/// Download progress, reported after every chunk.
#[derive(Clone, Debug, PartialEq)]
pub struct FileTransferProgress {
    pub size_left: usize,
    pub total: usize,
    pub bytes_downloaded: usize,
    pub percent_complete: f64,
}

impl FileTransferProgress {
    #[must_use]
    #[expect(clippy::cast_precision_loss)]
    pub fn new(total: usize, size_left: usize) -> Self {
        let bytes_downloaded = total - size_left;
        let percent_complete = if total == 0 {
            100.0
        } else {
            bytes_downloaded as f64 / total as f64 * 100.0
        };

        Self {
            size_left,
            total,
            bytes_downloaded,
            percent_complete,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatabaseInfo {
    pub location: String,
    pub size: u32,
}

/// A data source offered by a device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileTransferSource {
    pub name: String,
    pub database: DatabaseInfo,
}

/// Location of the Engine Library database of `source`.
#[must_use]
pub fn database_location(source: &str) -> String {
    format!("/{source}/Engine Library/m.db")
}

fn request(code: u32) -> Result<WriteContext> {
    let mut ctx = WriteContext::new();
    ctx.write_fixed_string(MAGIC_MARKER)?;
    ctx.write_u32(0)?;
    ctx.write_u32(code)?;
    Ok(ctx)
}

/// # Errors
///
/// Returns an error when the request cannot be encoded.
pub fn request_sources() -> Result<Vec<u8>> {
    let mut ctx = request(REQUEST_SOURCES)?;
    ctx.write_u32(0)?;
    ctx.into_length_prefixed()
}

/// # Errors
///
/// Returns an error when the path cannot be encoded.
pub fn request_stat(path: &str) -> Result<Vec<u8>> {
    let mut ctx = request(REQUEST_STAT)?;
    ctx.write_network_string(path)?;
    ctx.into_length_prefixed()
}

/// # Errors
///
/// Returns an error when the path cannot be encoded.
pub fn request_file_transfer_id(path: &str) -> Result<Vec<u8>> {
    let mut ctx = request(REQUEST_FILE_TRANSFER_ID)?;
    ctx.write_network_string(path)?;
    ctx.into_length_prefixed()
}

/// Requests chunks `first..=last` of transfer `txid`.
///
/// # Errors
///
/// Returns an error when the request cannot be encoded.
pub fn request_chunk_range(txid: u32, first: u32, last: u32) -> Result<Vec<u8>> {
    let mut ctx = request(REQUEST_CHUNK_RANGE)?;
    for value in [0, txid, 0, first, 0, last] {
        ctx.write_u32(value)?;
    }
    ctx.into_length_prefixed()
}

/// # Errors
///
/// Returns an error when the request cannot be encoded.
pub fn signal_transfer_complete() -> Result<Vec<u8>> {
    request(SIGNAL_TRANSFER_COMPLETE)?.into_length_prefixed()
}

/// Fails with a data loss error unless `condition` holds.
fn ensure(condition: bool, what: impl FnOnce() -> String) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(Error::data_loss(what()))
    }
}

#[derive(Clone, Debug, Default)]
pub struct FileTransfer;

impl Service for FileTransfer {
    type Message = FileTransferMessage;
    const KIND: ServiceKind = ServiceKind::FileTransfer;

    fn parse_data(
        &mut self,
        ctx: &mut ReadContext<'_>,
    ) -> Result<ServiceMessage<FileTransferMessage>> {
        let marker = ctx.get_string(MAGIC_MARKER.len())?;
        if marker != MAGIC_MARKER {
            return Err(Error::invalid_argument(format!(
                "expected FileTransfer marker but got `{marker}`"
            )));
        }

        let code = ctx.read_u32()?;
        if code > 0 {
            ensure(ctx.size_left() == 8, || {
                format!("time code frame has {} bytes left", ctx.size_left())
            })?;
            let marker = ctx.read_u32()?;
            ensure(marker == TIMECODE_MARKER, || {
                format!("unexpected time code marker {marker:#x}")
            })?;
            let trailer = ctx.read_u32()?;
            ensure(trailer == 0, || format!("unexpected time code trailer {trailer}"))?;

            return Ok(ServiceMessage {
                id: MessageId::TimeCode as u32,
                payload: FileTransferMessage::TimeCode(code),
            });
        }

        let id = MessageId::try_from(ctx.read_u32()?)?;
        let payload = match id {
            MessageId::SourceLocations => {
                let count = ctx.read_u32()?;
                let sources = (0..count)
                    .map(|_| ctx.read_network_string())
                    .collect::<Result<Vec<_>>>()?;
                let sentinel = ctx.read(SOURCE_SENTINEL.len())?;
                ensure(sentinel == SOURCE_SENTINEL, || {
                    format!("unexpected source list trailer {sentinel:?}")
                })?;
                ensure(ctx.is_eof(), || {
                    format!("source list has {} trailing bytes", ctx.size_left())
                })?;
                FileTransferMessage::SourceLocations(sources)
            }
            MessageId::FileStat => {
                ensure(ctx.size_left() == FILE_STAT_SIZE, || {
                    format!("file stat has {} bytes", ctx.size_left())
                })?;
                ctx.seek(49)?;
                FileTransferMessage::FileStat {
                    size: ctx.read_u32()?,
                }
            }
            MessageId::EndOfMessage => FileTransferMessage::EndOfMessage,
            MessageId::FileTransferId => {
                ctx.seek(12)?;
                FileTransferMessage::FileTransferId {
                    size: ctx.read_u32()?,
                    txid: ctx.read_u32()?,
                }
            }
            MessageId::FileTransferChunk => {
                ctx.seek(4)?;
                let offset = ctx.read_u32()?;
                let size = ctx.read_u32()? as usize;
                ensure(size == ctx.size_left(), || {
                    format!("chunk of {size} bytes has {} bytes", ctx.size_left())
                })?;
                ensure(size <= CHUNK_SIZE as usize, || {
                    format!("chunk of {size} bytes exceeds {CHUNK_SIZE}")
                })?;
                FileTransferMessage::FileTransferChunk {
                    offset,
                    data: ctx.read_remaining().to_vec(),
                }
            }
            MessageId::Unknown => FileTransferMessage::Unknown,
            MessageId::TimeCode => {
                return Err(Error::internal("time code message id read from the wire"))
            }
        };

        Ok(ServiceMessage {
            id: id as u32,
            payload,
        })
    }

    fn message_handler(&mut self, message: &ServiceMessage<FileTransferMessage>) -> bool {
        match &message.payload {
            FileTransferMessage::TimeCode(_) => false,
            FileTransferMessage::FileTransferChunk { offset, data } => {
                trace!("chunk of {} bytes at {offset}", data.len());
                true
            }
            other => {
                trace!("{other:?}");
                true
            }
        }
    }
}

/// Requests on a FileTransfer connection.
///
/// Replies are matched by message id only, so callers must not run two of
/// these concurrently on the same connection.
impl ServiceConnection<FileTransfer> {
    /// Lists the data sources of the device with the size of their
    /// databases.
    ///
    /// # Errors
    ///
    /// Returns an error when a request fails or a reply times out.
    pub async fn get_sources(&self) -> Result<Vec<FileTransferSource>> {
        let reply = self.wait_for_message(MessageId::SourceLocations as u32);
        self.send(&request_sources()?).await?;
        let FileTransferMessage::SourceLocations(names) = reply.await?.payload else {
            return Err(Error::internal("expected source locations"));
        };

        let mut sources = Vec::with_capacity(names.len());
        for name in names {
            let location = database_location(&name);
            let reply = self.wait_for_message(MessageId::FileStat as u32);
            self.send(&request_stat(&location)?).await?;
            let FileTransferMessage::FileStat { size } = reply.await?.payload else {
                return Err(Error::internal("expected file stat"));
            };

            debug!("source {name}: {location} has {size} bytes");
            sources.push(FileTransferSource {
                name,
                database: DatabaseInfo { location, size },
            });
        }

        Ok(sources)
    }

    /// Downloads the file at `location`, calling `on_progress` after every
    /// chunk.
    ///
    /// The returned buffer has exactly the size the device announced.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::DeadlineExceeded`](crate::error::ErrorKind::DeadlineExceeded)
    /// when the transfer does not complete within `download_timeout`, and
    /// [`ErrorKind::OutOfRange`](crate::error::ErrorKind::OutOfRange) when
    /// the device sends more data than announced.
    pub async fn get_file<F>(
        &self,
        location: &str,
        download_timeout: Duration,
        mut on_progress: F,
    ) -> Result<Vec<u8>>
    where
        F: FnMut(FileTransferProgress),
    {
        let mut messages = self.subscribe();
        let reply = self.wait_for_message(MessageId::FileTransferId as u32);
        self.send(&request_file_transfer_id(location)?).await?;
        let FileTransferMessage::FileTransferId { size, txid } = reply.await?.payload else {
            return Err(Error::internal("expected file transfer id"));
        };
        debug!("downloading {location}: {size} bytes as transfer {txid}");

        let total = size as usize;
        let mut file = WriteContext::with_size(total);

        if size > 0 {
            let chunks = size.div_ceil(CHUNK_SIZE);
            self.send(&request_chunk_range(txid, 0, chunks - 1)?).await?;

            let receive = async {
                while !file.is_eof() {
                    let message = tokio::select! {
                        message = messages.recv() => message,
                        () = self.closed() => None,
                    };
                    match message.map(|message| message.payload) {
                        Some(FileTransferMessage::FileTransferChunk { data, .. }) => {
                            file.write(&data)?;
                            on_progress(FileTransferProgress::new(total, file.size_left()));
                        }
                        Some(_) => {}
                        None => {
                            return Err(Error::aborted(format!(
                                "connection closed while downloading {location}"
                            )))
                        }
                    }
                }
                Ok(())
            };

            tokio::time::timeout(download_timeout, receive)
                .await
                .map_err(|_| {
                    Error::deadline_exceeded(format!(
                        "download of {location} did not complete within {download_timeout:?}"
                    ))
                })??;
        }

        self.send(&signal_transfer_complete()?).await?;
        Ok(file.into_inner())
    }

    /// Downloads the database of `source` into `dir` and returns its path.
    ///
    /// # Errors
    ///
    /// Returns an error when the download fails or the file cannot be
    /// written.
    pub async fn download_database<F>(
        &self,
        source: &FileTransferSource,
        dir: &Path,
        download_timeout: Duration,
        on_progress: F,
    ) -> Result<PathBuf>
    where
        F: FnMut(FileTransferProgress),
    {
        let bytes = self
            .get_file(&source.database.location, download_timeout, on_progress)
            .await?;

        tokio::fs::create_dir_all(dir).await?;
        let file_name: String = source
            .name
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        let path = dir.join(format!("{file_name}.db"));
        tokio::fs::write(&path, &bytes).await?;

        info!(
            "downloaded {} ({} bytes) to {}",
            source.database.location,
            bytes.len(),
            path.display()
        );
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    use super::*;
    use crate::{config::Config, error::ErrorKind, service::framer::Framer};

    fn reply(id: u32) -> WriteContext {
        let mut ctx = WriteContext::new();
        ctx.write_fixed_string(MAGIC_MARKER).unwrap();
        ctx.write_u32(0).unwrap();
        ctx.write_u32(id).unwrap();
        ctx
    }

    fn parse(bytes: &[u8]) -> Result<ServiceMessage<FileTransferMessage>> {
        FileTransfer.parse_data(&mut ReadContext::new(bytes))
    }

    fn transfer_id(size: u32, txid: u32) -> Vec<u8> {
        let mut ctx = reply(MessageId::FileTransferId as u32);
        ctx.write(&[0; 12]).unwrap();
        ctx.write_u32(size).unwrap();
        ctx.write_u32(txid).unwrap();
        ctx.into_length_prefixed().unwrap()
    }

    fn chunk(offset: u32, data: &[u8]) -> Vec<u8> {
        let mut ctx = reply(MessageId::FileTransferChunk as u32);
        ctx.write(&[0; 4]).unwrap();
        ctx.write_u32(offset).unwrap();
        ctx.write_u32(u32::try_from(data.len()).unwrap()).unwrap();
        ctx.write(data).unwrap();
        ctx.into_length_prefixed().unwrap()
    }

    #[test]
    fn parses_file_stat() {
        let mut ctx = reply(MessageId::FileStat as u32);
        ctx.write(&[0; 49]).unwrap();
        ctx.write_u32(123_456).unwrap();
        let message = parse(&ctx.into_inner()).unwrap();
        assert_eq!(message.payload, FileTransferMessage::FileStat { size: 123_456 });
    }

    #[test]
    fn parses_source_locations() {
        let mut ctx = reply(MessageId::SourceLocations as u32);
        ctx.write_u32(2).unwrap();
        ctx.write_network_string("USB 1").unwrap();
        ctx.write_network_string("SD").unwrap();
        ctx.write(&[1, 1, 1]).unwrap();
        let message = parse(ctx.as_bytes()).unwrap();
        assert_eq!(
            message.payload,
            FileTransferMessage::SourceLocations(vec![String::from("USB 1"), String::from("SD")])
        );

        ctx.write_u8(0).unwrap();
        assert_eq!(parse(ctx.as_bytes()).unwrap_err().kind, ErrorKind::DataLoss);
    }

    #[test]
    fn time_codes_are_inert() {
        let mut ctx = WriteContext::new();
        ctx.write_fixed_string(MAGIC_MARKER).unwrap();
        ctx.write_u32(0x1234).unwrap();
        ctx.write_u32(0x7d2).unwrap();
        ctx.write_u32(0).unwrap();
        let message = parse(&ctx.into_inner()).unwrap();
        assert_eq!(message.id, MessageId::TimeCode as u32);
        assert!(!FileTransfer.message_handler(&message));
    }

    #[test]
    fn rejects_oversized_and_inconsistent_chunks() {
        let framed = chunk(0, &[7; 4097]);
        assert_eq!(parse(&framed[4..]).unwrap_err().kind, ErrorKind::DataLoss);

        let mut ctx = reply(MessageId::FileTransferChunk as u32);
        ctx.write(&[0; 4]).unwrap();
        ctx.write_u32(0).unwrap();
        ctx.write_u32(10).unwrap();
        ctx.write(&[0; 4]).unwrap();
        assert_eq!(parse(ctx.as_bytes()).unwrap_err().kind, ErrorKind::DataLoss);
    }

    #[test]
    fn unknown_message_id_is_fatal() {
        let ctx = reply(6);
        assert_eq!(
            parse(ctx.as_bytes()).unwrap_err().kind,
            ErrorKind::Unimplemented
        );
    }

    #[test]
    fn chunk_range_request_layout() {
        let frame = request_chunk_range(9, 0, 2).unwrap();
        let mut ctx = ReadContext::new(&frame[4..]);
        assert_eq!(ctx.get_string(4).unwrap(), "fltx");
        let values: Vec<u32> = (0..8).map(|_| ctx.read_u32().unwrap()).collect();
        assert_eq!(values, [0, 0x7d3, 0, 9, 0, 0, 0, 2]);
        assert!(ctx.is_eof());
    }

    #[test]
    fn progress_percentages() {
        let progress = FileTransferProgress::new(8192, 4096);
        assert_eq!(progress.bytes_downloaded, 4096);
        assert!((progress.percent_complete - 50.0).abs() < f64::EPSILON);
        assert!((FileTransferProgress::new(0, 0).percent_complete - 100.0).abs() < f64::EPSILON);
    }

    /// Serves one file of `content` over a fake FileTransfer connection.
    async fn serve(server: TcpListener, content: Vec<u8>) {
        let (mut socket, _) = server.accept().await.unwrap();
        let mut framer = Framer::new();
        let mut buffer = vec![0; 4096];
        let mut handshake = vec![0; 50];
        socket.read_exact(&mut handshake).await.unwrap();

        loop {
            let len = socket.read(&mut buffer).await.unwrap();
            if len == 0 {
                return;
            }
            for frame in framer.push(&buffer[..len]).unwrap() {
                let mut ctx = ReadContext::new(&frame);
                assert_eq!(ctx.get_string(4).unwrap(), "fltx");
                assert_eq!(ctx.read_u32().unwrap(), 0);
                match ctx.read_u32().unwrap() {
                    REQUEST_FILE_TRANSFER_ID => {
                        assert_eq!(ctx.read_network_string().unwrap(), "/USB 1/Engine Library/m.db");
                        let size = u32::try_from(content.len()).unwrap();
                        socket.write_all(&transfer_id(size, 1)).await.unwrap();
                    }
                    REQUEST_CHUNK_RANGE => {
                        for (i, data) in content.chunks(CHUNK_SIZE as usize).enumerate() {
                            let offset = u32::try_from(i).unwrap() * CHUNK_SIZE;
                            socket.write_all(&chunk(offset, data)).await.unwrap();
                        }
                    }
                    SIGNAL_TRANSFER_COMPLETE => return,
                    code => panic!("unexpected request {code:#x}"),
                }
            }
        }
    }

    #[tokio::test]
    async fn downloads_exact_length() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = server.local_addr().unwrap();
        let content: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let device = tokio::spawn(serve(server, content.clone()));

        let connection = ServiceConnection::connect(address, FileTransfer, &Config::default())
            .await
            .unwrap();

        let mut progress = Vec::new();
        let file = connection
            .get_file(
                &database_location("USB 1"),
                Duration::from_secs(5),
                |p| progress.push(p),
            )
            .await
            .unwrap();

        assert_eq!(file.len(), 10_000);
        assert_eq!(file, content);
        assert_eq!(progress.len(), 3);
        assert_eq!(progress.last().unwrap().size_left, 0);
        device.await.unwrap();
    }

    /// Answers a source listing and one stat per source, then hangs up.
    async fn serve_sources(server: TcpListener, sources: Vec<(&'static str, u32)>) {
        let (mut socket, _) = server.accept().await.unwrap();
        let mut framer = Framer::new();
        let mut buffer = vec![0; 4096];
        let mut handshake = vec![0; 50];
        socket.read_exact(&mut handshake).await.unwrap();

        let mut unanswered = sources.len();
        while unanswered > 0 {
            let len = socket.read(&mut buffer).await.unwrap();
            assert_ne!(len, 0, "client hung up with {unanswered} stats unanswered");
            for frame in framer.push(&buffer[..len]).unwrap() {
                let mut ctx = ReadContext::new(&frame);
                assert_eq!(ctx.get_string(4).unwrap(), "fltx");
                assert_eq!(ctx.read_u32().unwrap(), 0);
                let answer = match ctx.read_u32().unwrap() {
                    REQUEST_SOURCES => {
                        let mut answer = reply(MessageId::SourceLocations as u32);
                        answer.write_u32(u32::try_from(sources.len()).unwrap()).unwrap();
                        for (name, _) in &sources {
                            answer.write_network_string(name).unwrap();
                        }
                        answer.write(&SOURCE_SENTINEL).unwrap();
                        answer
                    }
                    REQUEST_STAT => {
                        let location = ctx.read_network_string().unwrap();
                        let (_, size) = sources
                            .iter()
                            .find(|(name, _)| database_location(name) == location)
                            .unwrap();
                        let mut answer = reply(MessageId::FileStat as u32);
                        answer.write(&[0; 49]).unwrap();
                        answer.write_u32(*size).unwrap();
                        unanswered -= 1;
                        answer
                    }
                    code => panic!("unexpected request {code:#x}"),
                };
                let framed = answer.into_length_prefixed().unwrap();
                socket.write_all(&framed).await.unwrap();
            }
        }
    }

    #[tokio::test]
    async fn lists_sources_with_database_sizes() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = server.local_addr().unwrap();
        let device = tokio::spawn(serve_sources(server, vec![("USB 1", 1_048_576), ("SD", 4096)]));

        let connection = ServiceConnection::connect(address, FileTransfer, &Config::default())
            .await
            .unwrap();
        let sources = connection.get_sources().await.unwrap();

        let summary: Vec<_> = sources
            .iter()
            .map(|source| {
                (
                    source.name.as_str(),
                    source.database.location.as_str(),
                    source.database.size,
                )
            })
            .collect();
        assert_eq!(
            summary,
            [
                ("USB 1", "/USB 1/Engine Library/m.db", 1_048_576),
                ("SD", "/SD/Engine Library/m.db", 4096),
            ]
        );
        device.await.unwrap();
    }
}
