//! Backup image kernel.
//!
//! This crate implements the core of a database backup subsystem: it
//! produces a single self-describing archive file (the *image*) from a
//! set of snapshot drivers running concurrently, and restores such an
//! archive by routing its data chunks back to restore drivers.
//!
//! # Image format
//!
//! An image is a byte stream, optionally wrapped in a gzip container.
//! The uncompressed stream starts with a fixed eight byte magic prefix
//! and a little-endian format version. The rest of the stream is a
//! sequence of CRC-protected, length-prefixed chunks grouped into
//! sections: header, catalogue, metadata, table data and summary (see
//! [`stream`]).
//!
//! # Components
//!
//! * [`stream`] - the framed codec and the section-level serializer.
//! * [`catalog`] - the typed inventory of databases, tablespaces,
//!   tables and per-database objects stored in an image.
//! * [`kernel`] - the driver contract, the backup scheduler which
//!   multiplexes driver output into one stream, the restore
//!   demultiplexer and the operation contexts.
//! * [`drivers`] - the built-in drivers: the trivial no-data driver and
//!   the physical-log driver for engines without native snapshots.
//!
//! A backup run builds a [`catalog::Catalog`], opens an output stream,
//! writes the preamble (header + catalogue + metadata), lets the
//! scheduler interleave data chunks from all drivers, and finishes with
//! a summary. Restore reverses the process.

pub mod tools;

pub mod error;

pub mod stream;

pub mod catalog;

pub mod kernel;

pub mod drivers;

pub use error::{Error, Result};
