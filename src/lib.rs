//! Mood-driven music player: Spotify login, AI track recommendations and an
//! embedded playback widget kept in sync with an external playback device.

pub mod auth;
pub mod bus;
pub mod commands;
pub mod config;
pub mod handle;
pub mod recommend;
pub mod sidecar;
pub mod state;
pub mod synchronizer;
pub mod ticker;
pub mod types;
pub mod view;
