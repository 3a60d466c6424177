pub mod cli;
pub mod config;
pub mod delivery;
pub mod discovery;
pub mod engine;
pub mod protocol;
pub mod registry;
pub mod transfer;
pub mod verification;
pub mod webrtc;
pub mod websocket;
