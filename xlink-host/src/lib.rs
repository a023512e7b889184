//! # xlink-host
//!
//! Command-line host for devices speaking the xlink protocol: lists devices
//! on every configured transport, boots firmware, and drives the bootloader
//! to flash images and edit its persistent configuration.
//!
//! The binary is a thin clap front end; [`commands`] holds the logic and
//! [`config`] the TOML configuration it is built from.

pub mod commands;
pub mod config;
