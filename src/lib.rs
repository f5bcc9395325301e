#![warn(missing_docs)]
#![doc = include_str!("../README.md")]
#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub(crate) mod bits;
pub(crate) mod load_factor;

/// A hash map backed by the 16-slot-cluster flat table.
///
/// This module provides a `FlatMap` that wraps the `FlatTable` and provides
/// a standard key-value map interface with configurable hashers.
pub mod flat_map;

pub mod flat_table;

/// A hash map backed by the 32-slot-group Robin Hood table.
///
/// This module provides a `RobinMap` that wraps the `RobinTable` and
/// provides a standard key-value map interface with configurable hashers.
pub mod robin_map;

pub mod robin_table;

pub use flat_map::FlatMap;
pub use flat_table::FlatTable;
pub use robin_map::RobinMap;
pub use robin_table::RobinTable;

use core::alloc::Layout;
use core::fmt;

/// The error returned by the fallible reservation methods when an allocation
/// cannot be satisfied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TryReserveError {
    /// The computed capacity exceeded the address space.
    CapacityOverflow,
    /// The allocator refused the request.
    AllocError {
        /// The layout that could not be allocated.
        layout: Layout,
    },
}

impl fmt::Display for TryReserveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TryReserveError::CapacityOverflow => {
                f.write_str("requested capacity exceeds the address space")
            }
            TryReserveError::AllocError { layout } => {
                write!(f, "allocation of {} bytes failed", layout.size())
            }
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for TryReserveError {}
