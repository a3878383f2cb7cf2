//! Gatewrap - a setup-gated reverse proxy in front of a CLI-driven gateway
//!
//! This library provides a deployment wrapper that:
//! - Redirects traffic to a password-protected setup namespace until the
//!   gateway has been onboarded
//! - Spawns the gateway process on demand and waits for its port to answer
//! - Shares one startup attempt between concurrent requests
//! - Proxies HTTP and WebSocket traffic to the gateway's loopback port
//! - Runs allow-listed CLI commands and backup export/import for the setup UI

pub mod archive;
pub mod config;
pub mod error;
pub mod gateway;
pub mod pool;
pub mod proxy;
pub mod redact;
pub mod runner;
pub mod setup;
pub mod setup_page;
