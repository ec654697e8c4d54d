//! Keel mod protocol.
//!
//! A mod is a separate executable the host spawns once per step. The host
//! drives it over newline-delimited JSON on stdin/stdout ([`protocol`]); while
//! a run is in flight the mod reaches back into the host's request through
//! broker calls. [`ModExecutor`] is the host side, [`serve_stdio`] the mod side.

#![forbid(unsafe_code)]

pub mod client;
pub mod executor;
pub mod protocol;
pub mod server;

pub use client::{ModClient, ModOptions};
pub use executor::{ModExecutor, ModInfo};
pub use protocol::{MAGIC_COOKIE_KEY, PROTOCOL_VERSION, PROTOCOL_VERSION_KEY};
pub use server::{check_launch_env, serve, serve_stdio};
