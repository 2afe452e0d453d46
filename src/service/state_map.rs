//! StateMap: subscription to named device state.
//!
//! On connect we subscribe to a fixed list of state paths. The device then
//! pushes a JSON document whenever one of them changes, and echoes the
//! interval of every accepted subscription.
//!
//! Every frame starts with the `smaa` marker followed by a type:
//!
//! | Type    | Direction | Body                                         |
//! |---------|-----------|----------------------------------------------|
//! | `0`     | in        | netstring path, netstring JSON               |
//! | `0x7d2` | out       | netstring path, `u32` interval (0: on change)|
//! | `0x7d2` | in        | netstring path, `i32` interval               |

use serde::{Deserialize, Serialize};

use super::{Service, ServiceKind, ServiceMessage};
use crate::{
    error::{Error, Result},
    wire::{ReadContext, WriteContext},
};

pub const MAGIC_MARKER: &str = "smaa";

/// Type of a state change notification.
pub const MAGIC_MARKER_JSON: u32 = 0;

/// Type of a subscription and of its echo.
pub const MAGIC_MARKER_INTERVAL: u32 = 0x7d2;

/// Number of decks a device can report.
pub const DECK_COUNT: usize = 4;

const DEVICE_STATES: &[&str] = &[
    "/Client/Preferences/Player",
    "/Client/Preferences/PlayerJogColorA",
    "/Client/Preferences/PlayerJogColorB",
    "/Engine/Master/MasterTempo",
    "/Engine/Sync/Network/MasterStatus",
    "/Mixer/CH1faderPosition",
    "/Mixer/CH2faderPosition",
    "/Mixer/CH3faderPosition",
    "/Mixer/CH4faderPosition",
    "/Mixer/CrossfaderPosition",
    "/Mixer/ChannelAssignment1",
    "/Mixer/ChannelAssignment2",
    "/Mixer/ChannelAssignment3",
    "/Mixer/ChannelAssignment4",
];

const DECK_STATES: &[&str] = &[
    "Play",
    "PlayState",
    "PlayStatePath",
    "CurrentBPM",
    "DeckIsMaster",
    "ExternalMixerVolume",
    "Speed",
    "SyncMode",
    "Track/ArtistName",
    "Track/CurrentBPM",
    "Track/SongAnalyzed",
    "Track/SongLoaded",
    "Track/SongName",
    "Track/SoundSwitchGuid",
    "Track/TrackLength",
    "Track/TrackName",
    "Track/TrackNetworkPath",
];

/// All state paths subscribed to on connect: device-wide ones first, then
/// every per-deck field for each deck.
#[must_use]
pub fn state_paths() -> Vec<String> {
    let decks = (1..=DECK_COUNT).flat_map(|deck| {
        DECK_STATES
            .iter()
            .map(move |field| format!("/Engine/Deck{deck}/{field}"))
    });

    DEVICE_STATES
        .iter()
        .map(|path| (*path).to_owned())
        .chain(decks)
        .collect()
}

/// Encodes a subscription to `path`, length-prefixed.
///
/// # Errors
///
/// Returns an error when the path cannot be encoded.
pub fn subscribe_request(path: &str, interval: u32) -> Result<Vec<u8>> {
    let mut ctx = WriteContext::new();
    ctx.write_fixed_string(MAGIC_MARKER)?;
    ctx.write_u32(MAGIC_MARKER_INTERVAL)?;
    ctx.write_network_string(path)?;
    ctx.write_u32(interval)?;
    ctx.into_length_prefixed()
}

/// The JSON document of a state change.
///
/// Devices put booleans in `state`, text in `string` and numbers in `value`;
/// `type` tells which, but is not needed to read them.
#[serde_with::skip_serializing_none]
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StateValue {
    #[serde(rename = "type")]
    pub kind: Option<u32>,
    pub state: Option<bool>,
    pub string: Option<String>,
    pub value: Option<f64>,
}

impl StateValue {
    #[must_use]
    pub fn from_bool(state: bool) -> Self {
        Self {
            kind: Some(1),
            state: Some(state),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn from_string(string: impl Into<String>) -> Self {
        Self {
            kind: Some(8),
            string: Some(string.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn from_number(value: f64) -> Self {
        Self {
            kind: Some(0),
            value: Some(value),
            ..Self::default()
        }
    }
}

/// A decoded StateMap message.
///
/// Notifications carry `json`, subscription echoes carry `interval`.
#[derive(Clone, Debug, PartialEq)]
pub struct StateData {
    pub name: String,
    pub json: Option<StateValue>,
    pub interval: Option<i32>,
}

impl StateData {
    #[must_use]
    pub fn new(name: impl Into<String>, json: StateValue) -> Self {
        Self {
            name: name.into(),
            json: Some(json),
            interval: None,
        }
    }

    /// Encodes the message as a device would send it, length-prefixed.
    ///
    /// # Errors
    ///
    /// Returns an error when the JSON document or a string cannot be
    /// encoded.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut ctx = WriteContext::new();
        ctx.write_fixed_string(MAGIC_MARKER)?;
        match (&self.json, self.interval) {
            (Some(json), _) => {
                ctx.write_u32(MAGIC_MARKER_JSON)?;
                ctx.write_network_string(&self.name)?;
                ctx.write_network_string(&serde_json::to_string(json)?)?;
            }
            (None, Some(interval)) => {
                ctx.write_u32(MAGIC_MARKER_INTERVAL)?;
                ctx.write_network_string(&self.name)?;
                ctx.write_i32(interval)?;
            }
            (None, None) => {
                return Err(Error::invalid_argument(format!(
                    "state `{}` has neither value nor interval",
                    self.name
                )))
            }
        }
        ctx.into_length_prefixed()
    }
}

/// The StateMap service.
#[derive(Clone, Debug)]
pub struct StateMap {
    paths: Vec<String>,
}

impl Default for StateMap {
    fn default() -> Self {
        Self::with_paths(state_paths())
    }
}

impl StateMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to `paths` instead of the default list.
    #[must_use]
    pub fn with_paths(paths: Vec<String>) -> Self {
        Self { paths }
    }
}

impl Service for StateMap {
    type Message = StateData;
    const KIND: ServiceKind = ServiceKind::StateMap;

    fn parse_data(&mut self, ctx: &mut ReadContext<'_>) -> Result<ServiceMessage<StateData>> {
        let marker = ctx.get_string(MAGIC_MARKER.len())?;
        if marker != MAGIC_MARKER {
            return Err(Error::invalid_argument(format!(
                "expected StateMap marker but got `{marker}`"
            )));
        }

        let id = ctx.read_u32()?;
        let payload = match id {
            MAGIC_MARKER_JSON => {
                let name = ctx.read_network_string()?;
                let json = serde_json::from_str(&ctx.read_network_string()?)?;
                StateData {
                    name,
                    json: Some(json),
                    interval: None,
                }
            }
            MAGIC_MARKER_INTERVAL => StateData {
                name: ctx.read_network_string()?,
                json: None,
                interval: Some(ctx.read_i32()?),
            },
            _ => {
                return Err(Error::unimplemented(format!(
                    "unhandled StateMap type {id:#x}"
                )))
            }
        };

        Ok(ServiceMessage { id, payload })
    }

    fn message_handler(&mut self, message: &ServiceMessage<StateData>) -> bool {
        let data = &message.payload;
        match (&data.json, data.interval) {
            (Some(json), _) => trace!("{} => {json:?}", data.name),
            (None, Some(interval)) => trace!("{} subscribed at interval {interval}", data.name),
            (None, None) => {}
        }
        true
    }

    fn init(&mut self) -> Result<Vec<Vec<u8>>> {
        debug!("subscribing to {} states", self.paths.len());
        self.paths
            .iter()
            .map(|path| subscribe_request(path, 0))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn parse(frame: &[u8]) -> Result<ServiceMessage<StateData>> {
        // Strip the length prefix the way the framer does.
        let mut ctx = ReadContext::new(&frame[4..]);
        StateMap::new().parse_data(&mut ctx)
    }

    #[test]
    fn subscribe_request_layout() {
        let frame = subscribe_request("/Engine/Deck1/Play", 0).unwrap();
        let mut ctx = ReadContext::new(&frame);
        assert_eq!(ctx.read_u32().unwrap() as usize, frame.len() - 4);
        assert_eq!(ctx.get_string(4).unwrap(), "smaa");
        assert_eq!(ctx.read_u32().unwrap(), 0x7d2);
        assert_eq!(ctx.read_network_string().unwrap(), "/Engine/Deck1/Play");
        assert_eq!(ctx.read_u32().unwrap(), 0);
        assert!(ctx.is_eof());
    }

    #[test]
    fn subscribes_to_every_deck() {
        let paths = state_paths();
        assert_eq!(paths.len(), DEVICE_STATES.len() + DECK_COUNT * DECK_STATES.len());
        assert!(paths.contains(&String::from("/Engine/Deck4/Track/TrackNetworkPath")));
        assert_eq!(StateMap::new().init().unwrap().len(), paths.len());
    }

    #[test]
    fn decodes_json_notifications() {
        let frame = StateData::new("/Engine/Deck1/Track/SongName", StateValue::from_string("Song"))
            .encode()
            .unwrap();
        let message = parse(&frame).unwrap();
        assert_eq!(message.id, MAGIC_MARKER_JSON);
        assert_eq!(
            message.payload.json.unwrap().string.as_deref(),
            Some("Song")
        );
    }

    #[test]
    fn decodes_device_json() {
        let mut ctx = WriteContext::new();
        ctx.write_fixed_string("smaa").unwrap();
        ctx.write_u32(0).unwrap();
        ctx.write_network_string("/Engine/Deck2/Play").unwrap();
        ctx.write_network_string(r#"{"state":true,"type":1}"#).unwrap();
        let bytes = ctx.into_inner();

        let message = StateMap::new()
            .parse_data(&mut ReadContext::new(&bytes))
            .unwrap();
        assert_eq!(message.payload.json, Some(StateValue::from_bool(true)));
    }

    #[test]
    fn decodes_interval_echo() {
        let frame = StateData {
            name: String::from("/Mixer/CrossfaderPosition"),
            json: None,
            interval: Some(-1),
        }
        .encode()
        .unwrap();
        let message = parse(&frame).unwrap();
        assert_eq!(message.id, MAGIC_MARKER_INTERVAL);
        assert_eq!(message.payload.interval, Some(-1));
    }

    #[test]
    fn unknown_type_is_a_protocol_violation() {
        let mut ctx = WriteContext::new();
        ctx.write_fixed_string("smaa").unwrap();
        ctx.write_u32(0x7d1).unwrap();
        let bytes = ctx.into_inner();
        let error = StateMap::new()
            .parse_data(&mut ReadContext::new(&bytes))
            .unwrap_err();
        assert_eq!(error.kind, ErrorKind::Unimplemented);
    }

    #[test]
    fn wrong_marker_is_rejected() {
        let bytes = b"fltx\0\0\0\0";
        let error = StateMap::new()
            .parse_data(&mut ReadContext::new(bytes))
            .unwrap_err();
        assert_eq!(error.kind, ErrorKind::InvalidArgument);
    }
}
