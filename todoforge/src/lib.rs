//! # todoforge
//!
//! Command-line client for Microsoft To Do.
//!
//! Tokens come from [`todoforge_auth`] (device-code or redirect sign-in with a file-backed
//! cache) and every request goes through [`todoforge_graph::TodoApi`].
//!
//! ## Configuration
//!
//! Read from `$XDG_CONFIG_HOME/todoforge/config.toml`; see [`config::Config`].

pub mod cli;
pub mod commands;
pub mod config;
