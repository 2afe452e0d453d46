//! Byte cursors for the StageLinq wire format.
//!
//! All discovery and service traffic is big-endian. Two string encodings
//! are in use:
//! * Fixed-size ASCII strings without any prefix, where the reader knows the
//!   length (magic markers such as `airD`, `smaa` and `fltx`)
//! * Network strings: a big-endian `u32` byte length followed by that many
//!   bytes of UTF-16 code units, each one big-endian
//!
//! Reading or seeking outside the buffer is an invariant violation. It
//! signals a corrupted stream and returns an error instead of truncating.
//!
//! # Example
//!
//! ```rust
//! use stagelinq::wire::{ReadContext, WriteContext};
//!
//! let mut writer = WriteContext::new();
//! writer.write_fixed_string("smaa")?;
//! writer.write_network_string("/Engine/Deck1/Play")?;
//!
//! let bytes = writer.into_inner();
//! let mut reader = ReadContext::new(&bytes);
//! assert_eq!(reader.get_string(4)?, "smaa");
//! assert_eq!(reader.read_network_string()?, "/Engine/Deck1/Play");
//! assert!(reader.is_eof());
//! ```

use crate::error::{Error, Result};

macro_rules! read_number {
    ($name:ident, $typ:ty) => {
        #[doc = concat!("Reads a `", stringify!($typ), "` in the cursor's byte order.")]
        pub fn $name(&mut self) -> Result<$typ> {
            const SIZE: usize = std::mem::size_of::<$typ>();
            let bytes: [u8; SIZE] = self.read(SIZE)?.try_into().map_err(|_| {
                Error::internal(concat!("slice length mismatch for ", stringify!($typ)))
            })?;
            Ok(if self.little_endian {
                <$typ>::from_le_bytes(bytes)
            } else {
                <$typ>::from_be_bytes(bytes)
            })
        }
    };
}

macro_rules! write_number {
    ($name:ident, $typ:ty) => {
        #[doc = concat!("Writes a `", stringify!($typ), "` in the cursor's byte order.")]
        pub fn $name(&mut self, value: $typ) -> Result<()> {
            if self.little_endian {
                self.write(&value.to_le_bytes())
            } else {
                self.write(&value.to_be_bytes())
            }
        }
    };
}

/// A read cursor over a borrowed byte buffer.
#[derive(Clone, Debug)]
pub struct ReadContext<'a> {
    buffer: &'a [u8],
    pos: usize,
    little_endian: bool,
}

impl<'a> ReadContext<'a> {
    /// Creates a big-endian cursor at the start of `buffer`.
    #[must_use]
    pub fn new(buffer: &'a [u8]) -> Self {
        Self::with_endianness(buffer, false)
    }

    /// Creates a cursor with an explicit byte order.
    #[must_use]
    pub fn with_endianness(buffer: &'a [u8], little_endian: bool) -> Self {
        Self {
            buffer,
            pos: 0,
            little_endian,
        }
    }

    /// Reads exactly `len` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::data_loss`] when fewer than `len` bytes remain.
    pub fn read(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.size_left() {
            return Err(Error::data_loss(format!(
                "cannot read {len} bytes at offset {} with {} bytes left",
                self.pos,
                self.size_left()
            )));
        }

        let bytes = &self.buffer[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    /// Reads everything up to the end of the buffer.
    pub fn read_remaining(&mut self) -> &'a [u8] {
        let bytes = &self.buffer[self.pos..];
        self.pos = self.buffer.len();
        bytes
    }

    /// Peeks a fixed-width string field without advancing.
    ///
    /// The field is `len` bytes wide; decoding stops at the first NUL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::data_loss`] when fewer than `len` bytes remain.
    pub fn peek_string(&self, len: usize) -> Result<String> {
        let mut peek = self.clone();
        let bytes = peek.read(len)?;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }

    /// Reads a fixed-size string of `len` bytes and advances past it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::data_loss`] when fewer than `len` bytes remain.
    pub fn get_string(&mut self, len: usize) -> Result<String> {
        let value = self.peek_string(len)?;
        self.pos += len;
        Ok(value)
    }

    /// Reads a length-prefixed UTF-16BE network string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::data_loss`] when the declared length runs past the
    /// buffer, and [`Error::invalid_argument`] when it is odd or the code
    /// units are not valid UTF-16.
    pub fn read_network_string(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        if len % 2 != 0 {
            return Err(Error::invalid_argument(format!(
                "network string length {len} is not a whole number of code units"
            )));
        }

        let bytes = self.read(len)?;
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();

        String::from_utf16(&units).map_err(Into::into)
    }

    read_number!(read_u8, u8);
    read_number!(read_u16, u16);
    read_number!(read_u32, u32);
    read_number!(read_u64, u64);
    read_number!(read_i32, i32);
    read_number!(read_f64, f64);

    /// Moves the cursor by `offset` bytes relative to the current position.
    ///
    /// # Errors
    ///
    /// Returns [`Error::out_of_range`] when the target lies before the start
    /// or past the end of the buffer.
    pub fn seek(&mut self, offset: isize) -> Result<()> {
        match self.pos.checked_add_signed(offset) {
            Some(pos) if pos <= self.buffer.len() => {
                self.pos = pos;
                Ok(())
            }
            _ => Err(Error::out_of_range(format!(
                "cannot seek by {offset} from offset {} in buffer of {} bytes",
                self.pos,
                self.buffer.len()
            ))),
        }
    }

    #[must_use]
    pub fn tell(&self) -> usize {
        self.pos
    }

    #[must_use]
    pub fn size_left(&self) -> usize {
        self.buffer.len() - self.pos
    }

    #[must_use]
    pub fn is_eof(&self) -> bool {
        self.pos >= self.buffer.len()
    }
}

/// A write cursor over an owned byte buffer.
///
/// Growable by default. A cursor created with [`WriteContext::with_size`]
/// is fixed-size and refuses to write past its end, which is how downloads
/// assert that a peer sent no more than it announced.
#[derive(Clone, Debug, Default)]
pub struct WriteContext {
    buffer: Vec<u8>,
    pos: usize,
    little_endian: bool,
    fixed: bool,
}

impl WriteContext {
    /// Creates an empty, growable, big-endian cursor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a fixed-size, zero-filled, big-endian cursor.
    #[must_use]
    pub fn with_size(size: usize) -> Self {
        Self {
            buffer: vec![0; size],
            pos: 0,
            little_endian: false,
            fixed: true,
        }
    }

    /// Sets the byte order for subsequent numeric writes.
    #[must_use]
    pub fn little_endian(mut self, little_endian: bool) -> Self {
        self.little_endian = little_endian;
        self
    }

    /// Writes raw bytes at the cursor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::out_of_range`] when a fixed-size cursor would be
    /// written past its end.
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let end = self.pos + bytes.len();
        if end > self.buffer.len() {
            if self.fixed {
                return Err(Error::out_of_range(format!(
                    "cannot write {} bytes at offset {} into buffer of {} bytes",
                    bytes.len(),
                    self.pos,
                    self.buffer.len()
                )));
            }
            self.buffer.resize(end, 0);
        }

        self.buffer[self.pos..end].copy_from_slice(bytes);
        self.pos = end;
        Ok(())
    }

    /// Writes `value` as ASCII without any prefix or terminator.
    ///
    /// # Errors
    ///
    /// Returns [`Error::invalid_argument`] for non-ASCII input.
    pub fn write_fixed_string(&mut self, value: &str) -> Result<()> {
        if !value.is_ascii() {
            return Err(Error::invalid_argument(format!(
                "fixed-size string `{value}` is not ASCII"
            )));
        }
        self.write(value.as_bytes())
    }

    /// Writes a length-prefixed UTF-16BE network string.
    ///
    /// # Errors
    ///
    /// Returns an error when the encoded string does not fit a `u32` length
    /// or a fixed-size cursor overflows.
    pub fn write_network_string(&mut self, value: &str) -> Result<()> {
        let units: Vec<u16> = value.encode_utf16().collect();
        let len = u32::try_from(units.len() * 2).map_err(|_| {
            Error::out_of_range(format!("network string of {} units", units.len()))
        })?;

        // Always big-endian, whatever the cursor's byte order.
        self.write(&len.to_be_bytes())?;
        for unit in units {
            self.write(&unit.to_be_bytes())?;
        }
        Ok(())
    }

    write_number!(write_u8, u8);
    write_number!(write_u16, u16);
    write_number!(write_u32, u32);
    write_number!(write_u64, u64);
    write_number!(write_i32, i32);
    write_number!(write_f64, f64);

    #[must_use]
    pub fn tell(&self) -> usize {
        self.pos
    }

    #[must_use]
    pub fn size_left(&self) -> usize {
        self.buffer.len() - self.pos
    }

    /// Whether a fixed-size cursor has been filled completely.
    #[must_use]
    pub fn is_eof(&self) -> bool {
        self.pos >= self.buffer.len()
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.buffer
    }

    /// Returns the buffer prefixed with its big-endian `u32` length.
    ///
    /// # Errors
    ///
    /// Returns [`Error::out_of_range`] for buffers longer than `u32::MAX`.
    pub fn into_length_prefixed(self) -> Result<Vec<u8>> {
        let len = u32::try_from(self.buffer.len())
            .map_err(|_| Error::out_of_range("message too large for length prefix"))?;
        let mut framed = Vec::with_capacity(4 + self.buffer.len());
        framed.extend_from_slice(&len.to_be_bytes());
        framed.extend_from_slice(&self.buffer);
        Ok(framed)
    }
}
