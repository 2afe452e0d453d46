//! Length-prefixed frame reassembly.
//!
//! Every service message after the handshake is preceded by its length as a
//! big-endian `u32`. TCP delivers bytes in arbitrary chunks, so one read can
//! hold half a frame or several frames. The [`Framer`] keeps whatever it
//! could not use yet and prepends it to the next chunk.

use crate::{
    error::{Error, Result},
    wire::ReadContext,
};

/// Size of the length prefix.
pub const LENGTH_SIZE: usize = 4;

/// Largest frame a device is believed to send. File chunks are 4 KiB and
/// state updates are small JSON documents.
pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

#[derive(Clone, Debug, Default)]
pub struct Framer {
    queue: Vec<u8>,
}

impl Framer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk read from the socket and returns every frame it
    /// completes, in order, without their length prefixes.
    ///
    /// # Errors
    ///
    /// Returns a data-loss error when a length prefix exceeds
    /// [`MAX_FRAME_SIZE`]. The stream cannot be resynchronized after that.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Vec<u8>>> {
        let buffer = if self.queue.is_empty() {
            chunk.to_vec()
        } else {
            let mut buffer = std::mem::take(&mut self.queue);
            buffer.extend_from_slice(chunk);
            buffer
        };

        let mut frames = Vec::new();
        let mut ctx = ReadContext::new(&buffer);
        while !ctx.is_eof() {
            if ctx.size_left() < LENGTH_SIZE {
                break;
            }

            let len = ctx.read_u32()? as usize;
            if len > MAX_FRAME_SIZE {
                return Err(Error::data_loss(format!(
                    "frame of {len} bytes exceeds the limit of {MAX_FRAME_SIZE}"
                )));
            }
            if ctx.size_left() >= len {
                frames.push(ctx.read(len)?.to_vec());
            } else {
                #[expect(clippy::cast_possible_wrap)]
                ctx.seek(-(LENGTH_SIZE as isize))?;
                break;
            }
        }

        self.queue = ctx.read_remaining().to_vec();
        Ok(frames)
    }

    /// Number of buffered bytes waiting for the rest of their frame.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}
