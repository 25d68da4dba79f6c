//! Collector configuration flags.

/// Per-collection configuration, passed to the collector by reference.
///
/// `always_compact` and `never_compact` are mutually exclusive; the collector
/// asserts this in its prepare phase.
#[derive(Debug, Clone, Copy)]
pub struct CollectorFlags {
    /// Perform compaction on every full collection.
    pub always_compact: bool,
    /// Never perform compaction on a full collection (testing only).
    pub never_compact: bool,
    /// Flush inline-cache stubs while marking, dropping their references.
    pub cleanup_ics_at_gc: bool,
    /// Flush code caches in maps while marking.
    pub cleanup_caches_in_maps_at_gc: bool,
    /// Treat the collection as whole-heap; forces compaction because young
    /// objects are only promoted out of new space on compacting collections.
    pub gc_global: bool,
    /// Log every forwarded and relocated object.
    pub gc_verbose: bool,
}

impl Default for CollectorFlags {
    fn default() -> Self {
        Self {
            always_compact: false,
            never_compact: false,
            cleanup_ics_at_gc: true,
            cleanup_caches_in_maps_at_gc: true,
            gc_global: false,
            gc_verbose: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_flags_clean_caches_but_do_not_force_compaction() {
        let flags = CollectorFlags::default();
        assert!(flags.cleanup_ics_at_gc);
        assert!(flags.cleanup_caches_in_maps_at_gc);
        assert!(!flags.always_compact);
        assert!(!flags.never_compact);
        assert!(!flags.gc_global);
    }
}
