//! Beacon Common - Shared types for the Beacon agent protocol.
//!
//! This crate provides:
//! - The error taxonomy every component reports through
//! - Configuration types and loading
//! - Logging setup

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod logging;

pub use config::{
    BottubeConfig, ClawNewsConfig, Config, DiscordConfig, DispatchConfig, HttpPolicyConfig,
    InboxConfig, ObservabilityConfig, RateLimitRule, RustChainConfig, UdpConfig, MAX_RETRY_DELAY_S,
    MAX_UDP_WINDOW_S,
};
pub use error::{Error, Result, ResultExt};
