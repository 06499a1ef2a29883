#![deny(missing_docs)]
//! Telegram transport adapter for Lurkwarden.

/// Telegram-specific bot/transport implementation.
pub mod bot;
/// Telegram transport configuration.
pub mod config;
/// Bot API implementation of the engine's gateway.
pub mod gateway;
/// Telegram runtime entrypoint.
pub mod runner;
