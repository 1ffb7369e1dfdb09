//! Shared model for the stash radio daemon and its clients: station
//! collections, the playback and form sessions, persistence, the observable
//! state container and the wire protocol.
pub mod config;
pub mod error;
pub mod form;
pub mod persistence;
pub mod platform;
pub mod playback;
pub mod protocol;
pub mod state;
pub mod stations;

pub use error::{Result, StashError};
