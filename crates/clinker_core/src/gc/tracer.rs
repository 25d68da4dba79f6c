//! Collection telemetry: the per-cycle tracer and global counters.

/// Gauges surfaced to the embedder.
#[derive(Debug, Default, Clone, Copy)]
pub struct Counters {
    /// Live global objects observed by the most recent marking phase.
    pub global_objects: usize,
}

/// Per-collection telemetry handle.
///
/// `marked_count` is incremented once per object marked and decremented once
/// per mark bit cleared; a completed collection always returns it to zero.
pub struct GcTracer {
    marked_count: usize,
    compacting: bool,
    marking_stack_overflows: usize,
    /// Counter gauges updated during marking.
    pub counters: Counters,
}

impl GcTracer {
    pub fn new() -> Self {
        Self {
            marked_count: 0,
            compacting: false,
            marking_stack_overflows: 0,
            counters: Counters::default(),
        }
    }

    /// Record that the collection decided to compact.
    pub fn set_is_compacting(&mut self) {
        self.compacting = true;
    }

    pub fn is_compacting(&self) -> bool {
        self.compacting
    }

    pub fn marked_count(&self) -> usize {
        self.marked_count
    }

    pub fn increment_marked_count(&mut self) {
        self.marked_count += 1;
    }

    pub fn decrement_marked_count(&mut self) {
        debug_assert!(self.marked_count > 0, "marked count underflow");
        self.marked_count -= 1;
    }

    pub fn decrement_marked_count_by(&mut self, n: usize) {
        debug_assert!(self.marked_count >= n, "marked count underflow");
        self.marked_count -= n;
    }

    /// Record marking-stack overflow episodes recovered from this cycle.
    pub fn add_marking_stack_overflows(&mut self, n: usize) {
        self.marking_stack_overflows += n;
    }

    /// Number of overflow episodes the marker recovered from.
    pub fn marking_stack_overflows(&self) -> usize {
        self.marking_stack_overflows
    }
}

impl Default for GcTracer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marked_count_balances_to_zero() {
        let mut tracer = GcTracer::new();
        tracer.increment_marked_count();
        tracer.increment_marked_count();
        tracer.decrement_marked_count();
        tracer.decrement_marked_count_by(1);
        assert_eq!(tracer.marked_count(), 0);
    }

    #[test]
    fn compacting_bit_latches() {
        let mut tracer = GcTracer::new();
        assert!(!tracer.is_compacting());
        tracer.set_is_compacting();
        assert!(tracer.is_compacting());
    }
}
