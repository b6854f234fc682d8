//! Low-level primitives for building the storage engine.
//!
//! Includes the arena contract, byte utilities and the write-role lock.

/// Growable byte region addressed by blob offsets.
pub mod arena;

/// Byte-level utilities and encoding/decoding.
pub mod bytes;

/// Concurrency primitives and synchronization.
///
/// The reentrant single-writer role every structural mutation requires.
pub mod concurrency;
