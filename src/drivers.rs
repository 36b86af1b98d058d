//! Built-in snapshot drivers.
//!
//! [`nodata`] is the trivial driver pair for engines whose tables
//! store no data. [`physlog`] is the online driver for engines
//! without native snapshots: it copies table files dirtily while every
//! concurrent write is mirrored into an idempotent physical log,
//! replayed at restore to make the copy consistent.

pub mod nodata;

pub mod physlog;
