//! # Flick Files
//!
//! File-system side of a Flick transfer.
//!
//! This crate provides:
//! - [`IncomingDir`]: the [`flick_core::ContentStore`] used by the CLI and
//!   tests. Sources are opened read-only; destinations are created under an
//!   incoming directory and never overwrite an existing file.
//! - [`sanitize_file_name`]: turns an advertised name into a safe single path
//!   component.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod incoming;
pub mod names;

pub use incoming::IncomingDir;
pub use names::{candidate_name, sanitize_file_name};

/// Name of the directory received files are collected in
pub const INCOMING_DIR_NAME: &str = "FlickShare";

/// Longest file name produced by [`sanitize_file_name`], in bytes
pub const MAX_NAME_LEN: usize = 255;
