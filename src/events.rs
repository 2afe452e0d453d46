//! Events emitted while following StageLinq devices.
//!
//! Each component publishes to its own [`Listeners`] registry instead of a
//! global bus. Subscribers receive an unbounded channel, so a slow consumer
//! never makes a publisher lose messages or block the protocol engine.
//!
//! # Example
//!
//! ```rust
//! use stagelinq::events::Event;
//!
//! fn handle_event(event: Event) {
//!     match event {
//!         Event::TrackLoaded(status) => println!("{} loaded {:?}", status.deck, status.state.title),
//!         Event::Connected(info) => println!("connected to {}", info.software.name),
//!         // ... handle other events ...
//!         _ => {}
//!     }
//! }
//! ```

use std::{
    fmt,
    path::PathBuf,
    sync::{Arc, Mutex},
};

use tokio::sync::mpsc;

use crate::{
    discovery::ConnectionInfo,
    health::HealthEvent,
    player::PlayerStatus,
    service::{beat_info::BeatData, file_transfer::FileTransferProgress, state_map::StateData},
    token::Token,
};

/// Events that can be emitted by a [`StageLinq`](crate::stagelinq::StageLinq) session.
///
/// Events fall into three categories:
///
/// Device Events:
/// * [`Discovered`](Self::Discovered) - A new device announced itself
/// * [`Connected`](Self::Connected) - All services of a device are connected
/// * [`Disconnected`](Self::Disconnected) - A device logged out or was dropped
/// * [`DeviceFailed`](Self::DeviceFailed) - Connecting was given up on
/// * [`Health`](Self::Health) - Staleness and reconnection of a device
///
/// Player Events:
/// * [`TrackLoaded`](Self::TrackLoaded) - A deck loaded a new track
/// * [`NowPlaying`](Self::NowPlaying) - A deck is playing
/// * [`StateChanged`](Self::StateChanged) - Any deck status update
///
/// Service Events:
/// * [`State`](Self::State), [`Beat`](Self::Beat) - Raw service traffic
/// * [`FileTransferProgress`](Self::FileTransferProgress),
///   [`DatabaseDownloaded`](Self::DatabaseDownloaded) - Database downloads
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    Discovered(ConnectionInfo),
    Connected(ConnectionInfo),
    Disconnected(Token),
    DeviceFailed(Token),
    Health(Token, HealthEvent),

    TrackLoaded(PlayerStatus),
    NowPlaying(PlayerStatus),
    StateChanged(PlayerStatus),

    State(Token, StateData),
    Beat(Token, BeatData),
    FileTransferProgress(Token, FileTransferProgress),
    DatabaseDownloaded {
        token: Token,
        source: String,
        path: PathBuf,
    },
}

/// Registry of subscribers to one stream of values.
///
/// Cloning yields another handle to the same registry.
pub struct Listeners<T> {
    senders: Arc<Mutex<Vec<mpsc::UnboundedSender<T>>>>,
}

impl<T> Clone for Listeners<T> {
    fn clone(&self) -> Self {
        Self {
            senders: Arc::clone(&self.senders),
        }
    }
}

impl<T> Default for Listeners<T> {
    fn default() -> Self {
        Self {
            senders: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<T> fmt::Debug for Listeners<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners")
            .field("count", &self.len())
            .finish()
    }
}

impl<T> Listeners<T> {
    /// Number of registered subscribers, including closed ones not yet pruned.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::UnboundedSender<T>>> {
        // A panicking subscriber cannot leave the vector half-updated.
        self.senders
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl<T: Clone> Listeners<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new subscriber.
    ///
    /// Only values published after this call are received. Dropping the
    /// receiver unsubscribes.
    #[must_use]
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push(tx);
        rx
    }

    /// Delivers `value` to every live subscriber and prunes closed ones.
    pub fn publish(&self, value: &T) {
        self.lock().retain(|tx| tx.send(value.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publishes_to_every_subscriber() {
        let listeners = Listeners::new();
        let mut first = listeners.subscribe();
        let mut second = listeners.subscribe();

        listeners.publish(&7);
        assert_eq!(first.try_recv().unwrap(), 7);
        assert_eq!(second.try_recv().unwrap(), 7);
    }

    #[test]
    fn prunes_dropped_subscribers() {
        let listeners = Listeners::new();
        let kept = listeners.subscribe();
        drop(listeners.subscribe());
        assert_eq!(listeners.len(), 2);

        listeners.publish(&"hello");
        assert_eq!(listeners.len(), 1);
        drop(kept);
    }

    #[test]
    fn late_subscribers_miss_earlier_values() {
        let listeners = Listeners::new();
        listeners.publish(&1);
        let mut late = listeners.subscribe();
        listeners.publish(&2);
        assert_eq!(late.try_recv().unwrap(), 2);
        assert!(late.try_recv().is_err());
    }

    #[test]
    fn debug_shows_subscriber_count_for_any_value_type() {
        struct Opaque;

        let listeners = Listeners::<Opaque>::default();
        assert!(listeners.is_empty());
        assert_eq!(format!("{listeners:?}"), "Listeners { count: 0 }");
    }
}
