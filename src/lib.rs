//! Playback analytics engine for Emby, Plex and Jellyfin media servers.
//!
//! The service observes currently playing sessions across configured media
//! servers (push stream where available, periodic polling everywhere),
//! converts the observation stream into a durable ledger of play sessions
//! and play intervals, and answers aggregate watch-time queries on top of
//! that ledger while fanning live snapshots out to realtime subscribers.

pub mod cache;
pub mod config;
pub mod database;
pub mod errors;
pub mod intervalizer;
pub mod models;
pub mod poller;
pub mod push;
pub mod scheduler;
pub mod sources;
pub mod stats;
pub mod sync;
pub mod utils;
pub mod web;

mod assets;
