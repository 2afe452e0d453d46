//! Client for StageLinq, the LAN protocol networked DJ hardware uses to
//! find peers, share playback state and serve track databases.
//!
//! The usual entry point is a [`stagelinq::StageLinq`] session: it announces
//! this client, connects every device it hears from and reports what those
//! devices do as [`events::Event`]s. The lower layers are public as well, for
//! tools that only need part of the protocol:
//!
//! * [`wire`]: byte cursors for the big-endian wire format
//! * [`discovery`]: UDP announcements
//! * [`service`]: per-service TCP connections and the service protocols
//! * [`player`]: per-deck status built from state updates
//! * [`health`]: staleness detection and reconnection
#![deny(clippy::all)]
#![warn(clippy::pedantic)]

#[macro_use]
extern crate log;

pub mod config;
pub mod device;
pub mod discovery;
pub mod error;
pub mod events;
pub mod health;
pub mod player;
pub mod service;
pub mod stagelinq;
pub mod token;
pub mod wire;
