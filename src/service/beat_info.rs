//! BeatInfo: beat grid position of every deck.
//!
//! After a single start request the device streams one frame per update:
//!
//! ```text
//! id u32 | clock u64 | deck count u32 | deck count × (beat, total beats, bpm) f64
//!                                     | deck count × timeline f64
//! ```

use super::{Service, ServiceKind, ServiceMessage};
use crate::{
    error::Result,
    wire::{ReadContext, WriteContext},
};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DeckBeat {
    pub beat: f64,
    pub total_beats: f64,
    pub bpm: f64,
    pub timeline: f64,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct BeatData {
    pub clock: u64,
    pub decks: Vec<DeckBeat>,
}

/// Encodes the request that starts the beat stream.
///
/// # Errors
///
/// Returns an error when the request cannot be encoded.
pub fn start_request() -> Result<Vec<u8>> {
    let mut ctx = WriteContext::new();
    ctx.write_u32(0)?;
    ctx.into_length_prefixed()
}

/// The BeatInfo service.
///
/// With `every_n` above one, only updates in which some deck moved into
/// another group of `every_n` beats are published.
#[derive(Clone, Debug)]
pub struct BeatInfo {
    every_n: u32,
    previous: Option<BeatData>,
}

impl Default for BeatInfo {
    fn default() -> Self {
        Self::new(1)
    }
}

impl BeatInfo {
    #[must_use]
    pub fn new(every_n: u32) -> Self {
        Self {
            every_n,
            previous: None,
        }
    }

    /// Whether `current` crossed a group boundary relative to `previous`.
    ///
    /// Compares `floor(beat / n)` per deck, so a seek or loop that jumps
    /// back over a boundary counts as a crossing too.
    #[expect(clippy::float_cmp)]
    fn crossed(&self, previous: &BeatData, current: &BeatData) -> bool {
        let n = f64::from(self.every_n);
        current
            .decks
            .iter()
            .zip(&previous.decks)
            .any(|(cur, prev)| (prev.beat / n).floor() != (cur.beat / n).floor())
    }
}

impl Service for BeatInfo {
    type Message = BeatData;
    const KIND: ServiceKind = ServiceKind::BeatInfo;

    fn parse_data(&mut self, ctx: &mut ReadContext<'_>) -> Result<ServiceMessage<BeatData>> {
        let id = ctx.read_u32()?;
        let clock = ctx.read_u64()?;
        let deck_count = ctx.read_u32()? as usize;

        let mut decks = Vec::with_capacity(deck_count.min(8));
        for _ in 0..deck_count {
            decks.push(DeckBeat {
                beat: ctx.read_f64()?,
                total_beats: ctx.read_f64()?,
                bpm: ctx.read_f64()?,
                timeline: 0.0,
            });
        }
        for deck in &mut decks {
            deck.timeline = ctx.read_f64()?;
        }

        Ok(ServiceMessage {
            id,
            payload: BeatData { clock, decks },
        })
    }

    fn message_handler(&mut self, message: &ServiceMessage<BeatData>) -> bool {
        let current = &message.payload;
        let emit = match &self.previous {
            Some(previous) if self.every_n > 1 => self.crossed(previous, current),
            _ => true,
        };
        self.previous = Some(current.clone());
        emit
    }

    fn init(&mut self) -> Result<Vec<Vec<u8>>> {
        Ok(vec![start_request()?])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(beats: &[f64]) -> Vec<u8> {
        let mut ctx = WriteContext::new();
        ctx.write_u32(2).unwrap();
        ctx.write_u64(123).unwrap();
        ctx.write_u32(u32::try_from(beats.len()).unwrap()).unwrap();
        for beat in beats {
            ctx.write_f64(*beat).unwrap();
            ctx.write_f64(256.0).unwrap();
            ctx.write_f64(124.0).unwrap();
        }
        for beat in beats {
            ctx.write_f64(beat * 1000.0).unwrap();
        }
        ctx.into_inner()
    }

    fn handle(service: &mut BeatInfo, beats: &[f64]) -> bool {
        let bytes = frame(beats);
        let message = service.parse_data(&mut ReadContext::new(&bytes)).unwrap();
        service.message_handler(&message)
    }

    #[test]
    fn parses_all_decks() {
        let bytes = frame(&[1.5, 2.5]);
        let mut ctx = ReadContext::new(&bytes);
        let message = BeatInfo::default().parse_data(&mut ctx).unwrap();
        assert!(ctx.is_eof());
        assert_eq!(message.payload.clock, 123);
        assert_eq!(message.payload.decks.len(), 2);
        assert_eq!(message.payload.decks[1].beat, 2.5);
        assert_eq!(message.payload.decks[1].timeline, 2500.0);
    }

    #[test]
    fn start_request_is_a_framed_zero() {
        assert_eq!(start_request().unwrap(), [0, 0, 0, 4, 0, 0, 0, 0]);
    }

    #[test]
    fn every_beat_by_default() {
        let mut service = BeatInfo::default();
        assert!(handle(&mut service, &[1.0]));
        assert!(handle(&mut service, &[1.1]));
    }

    #[test]
    fn every_fourth_beat() {
        let mut service = BeatInfo::new(4);
        assert!(handle(&mut service, &[1.0]));
        assert!(!handle(&mut service, &[2.0]));
        assert!(!handle(&mut service, &[3.9]));
        assert!(handle(&mut service, &[4.0]));
        assert!(!handle(&mut service, &[5.0]));
        // Looping back over the boundary fires again.
        assert!(handle(&mut service, &[3.0]));
    }
}
