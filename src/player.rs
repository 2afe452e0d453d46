//! Player state aggregation.
//!
//! A device reports each deck field as a separate StateMap notification, in
//! no particular order. Loading a track, for example, produces a burst of
//! `SongLoaded`, `TrackNetworkPath`, `SongName` and `ArtistName` updates.
//! The [`PlayerAggregator`] collects these per deck during a debounce
//! window and then emits one coherent [`PlayerStatus`].
//!
//! # Merging
//!
//! All deltas buffered during a window are merged in arrival order, later
//! values winning. The result is merged into the deck's previous status,
//! unless it reports a newly loaded song: then it replaces the previous
//! status so that fields of the old track do not carry over.
//!
//! # Events
//!
//! After every window the aggregator publishes, in order:
//! * [`Event::TrackLoaded`] if a song was loaded and its network path is known
//! * [`Event::NowPlaying`] if the deck is playing
//! * [`Event::StateChanged`] always

use std::{
    collections::HashMap,
    fmt,
    net::IpAddr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio_util::sync::CancellationToken;

use crate::{
    events::{Event, Listeners},
    service::state_map::{StateData, StateValue},
    token::Token,
};

const DECK_PREFIX: &str = "/Engine/Deck";
const PLAYER_PATH: &str = "/Client/Preferences/Player";
const MASTER_TEMPO_PATH: &str = "/Engine/Master/MasterTempo";
const MASTER_STATUS_PATH: &str = "/Engine/Sync/Network/MasterStatus";

const ENGINE_LIBRARY: &str = "Engine Library";
const NETWORK_SCHEME: &str = "net://";

/// One of the four decks of a player.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Layer {
    A,
    B,
    C,
    D,
}

impl Layer {
    /// Maps deck numbers 1 to 4 onto layers.
    #[must_use]
    pub fn from_deck(deck: u8) -> Option<Self> {
        match deck {
            1 => Some(Self::A),
            2 => Some(Self::B),
            3 => Some(Self::C),
            4 => Some(Self::D),
            _ => None,
        }
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let letter = match self {
            Self::A => 'A',
            Self::B => 'B',
            Self::C => 'C',
            Self::D => 'D',
        };
        write!(f, "{letter}")
    }
}

/// Deck fields reported by a device. Every field is optional: a delta
/// carries only what one notification changed.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PlayerLayerState {
    pub play: Option<bool>,
    pub play_state: Option<bool>,
    pub play_state_path: Option<bool>,
    pub current_bpm: Option<f64>,
    pub deck_is_master: Option<bool>,
    pub external_mixer_volume: Option<f64>,
    pub speed: Option<f64>,
    pub sync_mode: Option<f64>,
    pub artist: Option<String>,
    pub title: Option<String>,
    pub song_loaded: Option<bool>,
    pub track_bpm: Option<f64>,
    pub track_length: Option<f64>,
    pub track_network_path: Option<String>,
    pub sound_switch_guid: Option<String>,
}

macro_rules! merge_fields {
    ($target:ident, $other:ident, $($field:ident),+ $(,)?) => {
        $(
            if $other.$field.is_some() {
                $target.$field.clone_from(&$other.$field);
            }
        )+
    };
}

impl PlayerLayerState {
    /// Builds the delta for one deck field, or `None` for fields that are
    /// not interpreted or carry no usable value.
    #[must_use]
    pub fn from_field(field: &str, json: &StateValue) -> Option<Self> {
        let mut delta = Self::default();
        match field {
            "Play" => delta.play = json.state,
            "PlayState" => delta.play_state = json.state,
            "PlayStatePath" => delta.play_state_path = json.state,
            "CurrentBPM" => delta.current_bpm = json.value,
            "DeckIsMaster" => delta.deck_is_master = json.state,
            "ExternalMixerVolume" => delta.external_mixer_volume = json.value,
            "Speed" => delta.speed = json.value,
            "SyncMode" => delta.sync_mode = json.value,
            "Track/ArtistName" => delta.artist.clone_from(&json.string),
            "Track/SongName" => delta.title.clone_from(&json.string),
            "Track/SongLoaded" => delta.song_loaded = json.state,
            "Track/CurrentBPM" => delta.track_bpm = json.value,
            "Track/TrackLength" => delta.track_length = json.value,
            "Track/TrackNetworkPath" => delta.track_network_path.clone_from(&json.string),
            "Track/SoundSwitchGuid" => delta.sound_switch_guid.clone_from(&json.string),
            _ => return None,
        }

        (delta != Self::default()).then_some(delta)
    }

    /// Overwrites every field that `other` sets.
    pub fn merge(&mut self, other: &Self) {
        merge_fields!(
            self,
            other,
            play,
            play_state,
            play_state_path,
            current_bpm,
            deck_is_master,
            external_mixer_volume,
            speed,
            sync_mode,
            artist,
            title,
            song_loaded,
            track_bpm,
            track_length,
            track_network_path,
            sound_switch_guid,
        );
    }
}

/// Where a loaded track lives, derived from its network path.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TrackLocation {
    /// Name of the data source, such as `USB 1`.
    pub source: Option<String>,
    /// Path relative to the source's Engine Library.
    pub track_path: Option<String>,
    /// Key of the source's database, `net://{token}/{source}`.
    pub db_source_name: Option<String>,
    /// Whether the track comes from a streaming service rather than a
    /// database on the device.
    pub streaming: bool,
}

impl TrackLocation {
    /// Derives the location of `track_network_path` on the device `token`.
    ///
    /// `net://<token>/<source>/Engine Library/<path>` has `<path>` as its
    /// track path. Files outside the Engine Library get a path relative to
    /// it, starting with `../`.
    #[must_use]
    pub fn parse(token: Token, track_network_path: Option<&str>) -> Self {
        let streaming = Self {
            streaming: true,
            ..Self::default()
        };

        let Some(path) = track_network_path.filter(|path| path.starts_with(NETWORK_SCHEME))
        else {
            return streaming;
        };

        let parts: Vec<&str> = path.split('/').collect();
        let Some(source) = parts.get(3).copied() else {
            return streaming;
        };
        if source.is_empty() || source == "Unknown" || source == "(Unknown)" {
            return streaming;
        }

        let track_path = match parts.get(4) {
            Some(&ENGINE_LIBRARY) => parts[5..].join("/"),
            Some(_) => format!("../{}", parts[4..].join("/")),
            None => String::new(),
        };

        Self {
            source: Some(source.to_owned()),
            track_path: Some(track_path),
            db_source_name: Some(format!("{NETWORK_SCHEME}{token}/{source}")),
            streaming: false,
        }
    }
}

/// The merged state of one deck.
#[derive(Clone, Debug, PartialEq)]
pub struct PlayerStatus {
    pub token: Token,
    pub address: IpAddr,
    /// Player number of the device.
    pub player: u32,
    pub layer: Layer,
    /// Player number and layer, such as `1A`.
    pub deck: String,
    pub master_tempo: Option<f64>,
    pub master_status: Option<bool>,
    pub state: PlayerLayerState,
    pub location: TrackLocation,
}

#[derive(Debug, Default)]
struct Deck {
    queue: Vec<PlayerLayerState>,
    state: Option<PlayerLayerState>,
}

#[derive(Debug)]
struct Inner {
    player: u32,
    master_tempo: Option<f64>,
    master_status: Option<bool>,
    decks: HashMap<Layer, Deck>,
}

/// Reconstructs per-deck status of one device from StateMap notifications.
pub struct PlayerAggregator {
    token: Token,
    address: IpAddr,
    window: Duration,
    inner: Arc<Mutex<Inner>>,
    events: Listeners<Event>,
    cancel: CancellationToken,
}

impl PlayerAggregator {
    #[must_use]
    pub fn new(token: Token, address: IpAddr, window: Duration, events: Listeners<Event>) -> Self {
        Self {
            token,
            address,
            window,
            inner: Arc::new(Mutex::new(Inner {
                player: 1,
                master_tempo: None,
                master_status: None,
                decks: HashMap::new(),
            })),
            events,
            cancel: CancellationToken::new(),
        }
    }

    /// Routes one StateMap message.
    ///
    /// Device-wide values are stored immediately. Deck fields are queued
    /// and published once the debounce window of their deck elapses.
    pub fn handle(&self, data: &StateData) {
        let Some(json) = &data.json else {
            return;
        };

        match data.name.as_str() {
            PLAYER_PATH => {
                if let Some(player) = player_number(json) {
                    debug!("{} is player {player}", self.address);
                    self.lock().player = player;
                }
            }
            MASTER_TEMPO_PATH => self.lock().master_tempo = json.value,
            MASTER_STATUS_PATH => self.lock().master_status = json.state,
            name => {
                let Some((layer, field)) = parse_deck_path(name) else {
                    return;
                };
                if let Some(delta) = PlayerLayerState::from_field(field, json) {
                    self.push(layer, delta);
                }
            }
        }
    }

    /// Queues a delta, starting the debounce window if the queue was empty.
    pub fn push(&self, layer: Layer, delta: PlayerLayerState) {
        let first = {
            let mut inner = self.lock();
            let deck = inner.decks.entry(layer).or_default();
            deck.queue.push(delta);
            deck.queue.len() == 1
        };
        if !first {
            return;
        }

        let inner = Arc::clone(&self.inner);
        let events = self.events.clone();
        let cancel = self.cancel.clone();
        let window = self.window;
        let (token, address) = (self.token, self.address);
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(window) => {
                    for event in flush(&inner, token, address, layer) {
                        events.publish(&event);
                    }
                }
            }
        });
    }

    /// Last published status of `layer`.
    #[must_use]
    pub fn status(&self, layer: Layer) -> Option<PlayerStatus> {
        let inner = self.lock();
        inner
            .decks
            .get(&layer)
            .and_then(|deck| deck.state.as_ref())
            .map(|state| status(&inner, self.token, self.address, layer, state.clone()))
    }

    /// Drops pending windows. Nothing is published afterwards.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        lock(&self.inner)
    }
}

impl Drop for PlayerAggregator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Player numbers arrive as text on some firmware and as numbers on other.
#[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn player_number(json: &StateValue) -> Option<u32> {
    json.string
        .as_deref()
        .and_then(|s| s.trim().parse().ok())
        .or_else(|| {
            json.value
                .filter(|v| v.fract() == 0.0 && *v >= 0.0 && *v <= f64::from(u32::MAX))
                .map(|v| v as u32)
        })
}

/// Splits `/Engine/Deck<n>/<field>` into layer and field.
fn parse_deck_path(path: &str) -> Option<(Layer, &str)> {
    let (deck, field) = path.strip_prefix(DECK_PREFIX)?.split_once('/')?;
    Some((Layer::from_deck(deck.parse().ok()?)?, field))
}

fn status(
    inner: &Inner,
    token: Token,
    address: IpAddr,
    layer: Layer,
    state: PlayerLayerState,
) -> PlayerStatus {
    PlayerStatus {
        token,
        address,
        player: inner.player,
        layer,
        deck: format!("{}{layer}", inner.player),
        master_tempo: inner.master_tempo,
        master_status: inner.master_status,
        location: TrackLocation::parse(token, state.track_network_path.as_deref()),
        state,
    }
}

/// Applies the queued deltas of `layer` and returns the events to publish.
fn flush(inner: &Mutex<Inner>, token: Token, address: IpAddr, layer: Layer) -> Vec<Event> {
    let mut inner = lock(inner);
    let Some(deck) = inner.decks.get_mut(&layer) else {
        return Vec::new();
    };

    let queue = std::mem::take(&mut deck.queue);
    let Some((first, rest)) = queue.split_first() else {
        return Vec::new();
    };
    let mut delta = first.clone();
    for next in rest {
        delta.merge(next);
    }

    let loaded = delta.song_loaded == Some(true);
    let state = match deck.state.take() {
        Some(mut state) if !loaded => {
            state.merge(&delta);
            state
        }
        _ => delta,
    };
    deck.state = Some(state.clone());

    let status = status(&inner, token, address, layer, state);
    trace!("{} deck {}: {:?}", address, status.deck, status.state);

    let mut events = Vec::with_capacity(3);
    if loaded
        && status
            .state
            .track_network_path
            .as_deref()
            .is_some_and(|path| !path.is_empty())
    {
        info!(
            "deck {} loaded {}",
            status.deck,
            status.state.title.as_deref().unwrap_or("unknown track")
        );
        events.push(Event::TrackLoaded(status.clone()));
    }
    if status.state.play_state == Some(true) {
        events.push(Event::NowPlaying(status.clone()));
    }
    events.push(Event::StateChanged(status));
    events
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;

    const WINDOW: Duration = Duration::from_millis(1500);

    fn token() -> Token {
        "52fdfc07-2182-654f-163f-5f0f9a621d72".parse().unwrap()
    }

    fn aggregator() -> (PlayerAggregator, UnboundedReceiver<Event>) {
        let events = Listeners::new();
        let rx = events.subscribe();
        let aggregator =
            PlayerAggregator::new(token(), Ipv4Addr::LOCALHOST.into(), WINDOW, events);
        (aggregator, rx)
    }

    fn state(name: &str, json: StateValue) -> StateData {
        StateData::new(name, json)
    }

    async fn settle() {
        tokio::time::sleep(WINDOW + Duration::from_millis(1)).await;
    }

    #[test]
    fn derives_database_location() {
        let path = "net://52fdfc07-2182-654f-163f-5f0f9a621d72/USB 1/Engine Library/Music/a.mp3";
        let location = TrackLocation::parse(token(), Some(path));
        assert_eq!(location.source.as_deref(), Some("USB 1"));
        assert_eq!(location.track_path.as_deref(), Some("Music/a.mp3"));
        assert_eq!(
            location.db_source_name.as_deref(),
            Some("net://52fdfc07-2182-654f-163f-5f0f9a621d72/USB 1")
        );
        assert!(!location.streaming);
    }

    #[test]
    fn paths_outside_engine_library_are_relative() {
        let path = "net://52fdfc07-2182-654f-163f-5f0f9a621d72/USB 1/Contents/b.mp3";
        let location = TrackLocation::parse(token(), Some(path));
        assert_eq!(location.track_path.as_deref(), Some("../Contents/b.mp3"));
    }

    #[test]
    fn missing_or_unknown_paths_are_streaming() {
        for path in [
            None,
            Some(""),
            Some("streaming://beatport/123"),
            Some("net://52fdfc07-2182-654f-163f-5f0f9a621d72/(Unknown)/x"),
        ] {
            let location = TrackLocation::parse(token(), path);
            assert!(location.streaming, "{path:?}");
            assert_eq!(location.db_source_name, None);
        }
    }

    #[test]
    fn routes_deck_paths() {
        assert_eq!(
            parse_deck_path("/Engine/Deck3/Track/SongName"),
            Some((Layer::C, "Track/SongName"))
        );
        assert_eq!(parse_deck_path("/Engine/Deck5/Play"), None);
        assert_eq!(parse_deck_path("/Mixer/CrossfaderPosition"), None);
        assert_eq!(
            PlayerLayerState::from_field("Track/LoopEnableState", &StateValue::from_bool(true)),
            None
        );
    }

    #[tokio::test(start_paused = true)]
    async fn merges_deltas_within_window() {
        let (aggregator, mut rx) = aggregator();
        aggregator.handle(&state("/Engine/Deck1/PlayState", StateValue::from_bool(true)));
        aggregator.handle(&state("/Engine/Deck1/CurrentBPM", StateValue::from_number(128.0)));
        settle().await;

        let Event::NowPlaying(playing) = rx.recv().await.unwrap() else {
            panic!("expected now playing");
        };
        let Event::StateChanged(status) = rx.recv().await.unwrap() else {
            panic!("expected state change");
        };
        assert_eq!(playing, status);
        assert_eq!(status.state.play_state, Some(true));
        assert_eq!(status.state.current_bpm, Some(128.0));
        assert_eq!(status.deck, "1A");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn loading_a_song_replaces_previous_state() {
        let (aggregator, mut rx) = aggregator();
        aggregator.handle(&state("/Engine/Deck2/Track/SongName", StateValue::from_string("Old")));
        aggregator.handle(&state("/Engine/Deck2/Track/ArtistName", StateValue::from_string("Someone")));
        settle().await;
        assert!(matches!(rx.recv().await, Some(Event::StateChanged(_))));

        aggregator.handle(&state("/Engine/Deck2/Track/SongLoaded", StateValue::from_bool(true)));
        aggregator.handle(&state("/Engine/Deck2/Track/SongName", StateValue::from_string("New")));
        settle().await;

        let Some(Event::StateChanged(status)) = rx.recv().await else {
            panic!("expected state change");
        };
        assert_eq!(status.state.title.as_deref(), Some("New"));
        assert_eq!(status.state.artist, None);
        assert_eq!(aggregator.status(Layer::B), Some(status));
    }

    #[tokio::test(start_paused = true)]
    async fn emits_track_loaded_with_network_path() {
        let (aggregator, mut rx) = aggregator();
        aggregator.handle(&state("/Client/Preferences/Player", StateValue::from_string("2")));
        aggregator.handle(&state("/Engine/Deck1/Track/SongLoaded", StateValue::from_bool(true)));
        aggregator.handle(&state(
            "/Engine/Deck1/Track/TrackNetworkPath",
            StateValue::from_string(
                "net://52fdfc07-2182-654f-163f-5f0f9a621d72/USB 1/Engine Library/Music/a.mp3",
            ),
        ));
        settle().await;

        let Some(Event::TrackLoaded(status)) = rx.recv().await else {
            panic!("expected track loaded");
        };
        assert_eq!(status.deck, "2A");
        assert_eq!(status.location.track_path.as_deref(), Some("Music/a.mp3"));
        assert!(matches!(rx.recv().await, Some(Event::StateChanged(_))));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn decks_debounce_independently() {
        let (aggregator, mut rx) = aggregator();
        aggregator.handle(&state("/Engine/Deck1/Speed", StateValue::from_number(1.0)));
        tokio::time::sleep(Duration::from_millis(1000)).await;
        aggregator.handle(&state("/Engine/Deck2/Speed", StateValue::from_number(0.5)));

        tokio::time::sleep(Duration::from_millis(501)).await;
        let Some(Event::StateChanged(first)) = rx.recv().await else {
            panic!("expected state change");
        };
        assert_eq!(first.layer, Layer::A);
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(1000)).await;
        let Some(Event::StateChanged(second)) = rx.recv().await else {
            panic!("expected state change");
        };
        assert_eq!(second.layer, Layer::B);
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_aggregator_publishes_nothing() {
        let (aggregator, mut rx) = aggregator();
        aggregator.handle(&state("/Engine/Deck1/Play", StateValue::from_bool(true)));
        aggregator.stop();
        settle().await;
        assert!(rx.try_recv().is_err());
    }
}
