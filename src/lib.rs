//! The concurrent in-memory write path of a log-structured key-value
//! storage engine.
//!
//! ##### NOTE
//!
//! > This crate only provides the volatile half of an LSM engine: the
//! > memtable and the write admission controller. It ships no write-ahead
//! > log and no flush-to-disk machinery; durability and compaction are the
//! > host engine's job.
//!
//! ##### About
//!
//! Writes land in a [`MemTable`], which keeps every record in key order
//! inside a lock-free multi-level probabilistic list. Multiple writer
//! threads may insert concurrently while any number of readers iterate,
//! without a global lock. Records are versioned by sequence number, so
//! point reads against a snapshot see a consistent history including
//! tombstones, merge operands and range deletions.
//!
//! A shared [`WriteController`] paces the whole write path: background
//! pressure acquires stop/delay/compaction-pressure tokens, and every
//! write asks for its sleep quota before touching the memtable.
//!
//! # Example usage
//!
//! ```
//! use silt::{LookupKey, LookupResult, MemTable, MergeContext, Options, ReadOptions, ValueKind};
//!
//! let memtable = MemTable::new(Options::default(), 0);
//!
//! // Writers assign monotonically increasing sequence numbers
//! memtable.add(1, ValueKind::Value, b"planet", b"ocean", false, None)?;
//! memtable.add(2, ValueKind::Deletion, b"moon", b"", false, None)?;
//!
//! let mut merge_context = MergeContext::default();
//! let mut tombstone_seq = 0;
//!
//! let result = memtable.get(
//!     &LookupKey::new(b"planet", silt::MAX_SEQNO),
//!     &mut merge_context,
//!     &mut tombstone_seq,
//!     &ReadOptions::default(),
//! )?;
//! assert!(matches!(result, LookupResult::Found { .. }));
//!
//! // Deletions shadow older values
//! let result = memtable.get(
//!     &LookupKey::new(b"moon", silt::MAX_SEQNO),
//!     &mut merge_context,
//!     &mut tombstone_seq,
//!     &ReadOptions::default(),
//! )?;
//! assert!(matches!(result, LookupResult::Deleted { .. }));
//! #
//! # Ok::<(), silt::Error>(())
//! ```
//!
//! Write admission:
//!
//! ```
//! use silt::{ManualClock, WriteController};
//! use std::sync::Arc;
//!
//! let controller = Arc::new(WriteController::new(false, /* 1 MiB/s */ 1_048_576));
//! let clock = ManualClock::default();
//!
//! // No tokens held: writes are admitted immediately
//! assert_eq!(0, controller.get_delay(&clock, 4_096));
//!
//! // While a delay token is held, writers sleep what they are told
//! let _token = controller.get_delay_token(1_048_576);
//! let micros = controller.get_delay(&clock, 8 * 1_048_576);
//! assert!(micros > 0);
//! ```

#![deny(clippy::all, missing_docs, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]

mod arena;
mod bloom;
mod checksum;
mod clock;
mod coding;
mod error;
mod index;
mod memtable;
mod merge;
mod options;
mod range_tombstone;
mod value;
mod write_controller;

pub use {
    clock::{Clock, ManualClock, MonotonicClock},
    error::{Error, Result},
    memtable::{
        LookupResult, MemTable, MemTableIter, MultiGetEntry, PostWriteInfo, ReadOptions,
        TableStats, UpdateOutcome,
    },
    merge::{MergeContext, MergeOperator},
    options::{FixedPrefixExtractor, InplaceCallback, InplaceDecision, Options, PrefixExtractor},
    range_tombstone::{
        FragmentedRangeTombstoneIterator, FragmentedRangeTombstoneList, RangeTombstone,
    },
    value::{LookupKey, ParsedEntry, SeqNo, UserKey, UserValue, ValueKind, MAX_SEQNO},
    write_controller::{
        CompactionPressureToken, DelayToken, ErrorSignal, RegistrantId, SourceId, StopToken,
        WriteController,
    },
};
