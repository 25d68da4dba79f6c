//! The stop-the-world mark-compact collector.
//!
//! One entry point — [`collector::MarkCompactCollector::collect`] — runs the
//! five-phase pipeline: prepare, mark, sweep large objects, then either the
//! compacting branch (encode forwarding addresses, update pointers, relocate
//! objects, rebuild remembered sets) or the in-place sweep, and finish.

/// Orchestration, phase sequencing, and the compaction decision.
pub mod collector;
/// Collection telemetry counters.
pub mod tracer;

/// Phase 4a-1: forwarding-address encoding and free-region sentinels.
pub(crate) mod encoding;
/// Phase 2: tri-color marking with overflow recovery.
pub(crate) mod marking;
/// Phase 4a-3: sliding relocation and space commits.
pub(crate) mod relocating;
/// Phase 4b: the non-compacting sweeper.
pub(crate) mod sweeping;
/// Phase 4a-2: pointer rewriting through encoded headers.
pub(crate) mod updating;
