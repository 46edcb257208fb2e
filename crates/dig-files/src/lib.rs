//! # dig-files
//!
//! Content hashing for store artifacts. This crate knows nothing about
//! peers, sessions, or the network: it hashes whole files and chunks with
//! BLAKE3, shared by the node runtime's store server (verifying ranges as
//! it serves `GET_FILE_RANGE`) and its downloader (verifying the
//! reassembled file on finalize).

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod hasher;

/// Default chunk size (256 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;
