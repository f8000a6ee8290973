//! `rn-domain` — types shared by every graph-node crate: the error enum,
//! node configuration and graph-name handling.

pub mod config;
pub mod error;
pub mod names;

pub use error::{Error, Result};
