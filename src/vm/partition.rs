//! Empirical memory probing and spawn budgets.
//!
//! There is no way to ask this platform how much contiguous memory is left,
//! so the partitioner measures it: starting from a large power-of-two step
//! it tries to hold an allocation of the accumulated size plus the step,
//! keeping the step on success and halving it on failure, until a bounded
//! number of refinements or the step floor. The answer is approximate by
//! design: exhaustiveness is not worth its cost.
//!
//! The same probe routine backs two callers with different parameters: the
//! spawn budget decision and the user-facing `free` report.

/// Source of "could an allocation of this size be satisfied right now".
///
/// The real implementation asks the heap; tests substitute a deterministic
/// capacity so budget properties can be asserted exactly.
pub trait AllocProbe {
    /// True when `bytes` contiguous bytes could be obtained at this moment.
    /// The probe must not hold on to the memory.
    fn can_hold(&mut self, bytes: u64) -> bool;
}

/// Probe backed by the process heap. Each trial reserves and immediately
/// releases the block.
#[derive(Debug, Default)]
pub struct HeapProbe;

impl AllocProbe for HeapProbe {
    fn can_hold(&mut self, bytes: u64) -> bool {
        let Ok(len) = usize::try_from(bytes) else {
            return false;
        };
        let mut block: Vec<u8> = Vec::new();
        block.try_reserve_exact(len).is_ok()
    }
}

/// Search bounds for one probe run.
#[derive(Debug, Clone, Copy)]
pub struct ProbeParams {
    /// The search starts at a step of `2^high_bit` bytes.
    pub high_bit: u32,
    /// The search stops once the step falls below `2^low_bit` bytes.
    pub low_bit: u32,
    /// Refinement budget: the run stops after this many successful steps.
    pub max_refine: usize,
}

impl ProbeParams {
    /// Parameters used for spawn budget decisions: a coarse floor keeps the
    /// probe cheap.
    pub fn for_spawn() -> Self {
        Self { high_bit: 48, low_bit: 16, max_refine: 5 }
    }

    /// Parameters used for the `free` report: a fine floor gives a tighter
    /// estimate at the cost of more trials.
    pub fn for_report() -> Self {
        Self { high_bit: 48, low_bit: 1, max_refine: 5 }
    }
}

/// Measure the largest additional contiguous block obtainable right now,
/// without claiming it permanently.
pub fn probe_largest_chunk(probe: &mut dyn AllocProbe, params: &ProbeParams) -> u64 {
    let mut base: u64 = 0;
    let mut refine = 0usize;
    let mut bit = params.high_bit;
    loop {
        let step = 1u64 << bit;
        if probe.can_hold(base + step) {
            base += step;
            if refine >= params.max_refine {
                break;
            }
            refine += 1;
        }
        if bit <= params.low_bit {
            break;
        }
        bit -= 1;
    }
    base
}

/// Fraction of measured free memory a root-level spawn may consume. The
/// rest is headroom for the always-resident shell services, which nested
/// spawns can never starve because their worlds only shrink.
pub const ROOT_FRACTION: u64 = 4;

/// Budget policy for one spawn invocation.
///
/// The fractioning applies exactly once, at the root: a spawn performed by
/// an already-spawned child runs its own probe against its own smaller
/// world (the lent region) and is not fractioned again.
#[derive(Debug, Clone, Copy)]
pub struct Partitioner {
    fraction: u64,
    ceiling: Option<u64>,
}

impl Partitioner {
    /// Policy for a spawn issued by the resident shell itself.
    pub fn root() -> Self {
        Self { fraction: ROOT_FRACTION, ceiling: None }
    }

    /// Policy for a spawn issued from within a lent region of `limit` bytes.
    pub fn nested(limit: u64) -> Self {
        Self { fraction: 1, ceiling: Some(limit) }
    }

    /// Decide the budget: probe, clamp to the lent region, fraction.
    pub fn budget(&self, probe: &mut dyn AllocProbe, params: &ProbeParams) -> u64 {
        let mut measured = probe_largest_chunk(probe, params);
        if let Some(limit) = self.ceiling {
            measured = measured.min(limit);
        }
        let budget = measured / self.fraction;
        log::debug!("partitioner measured {} bytes, budget {} bytes", measured, budget);
        budget
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deterministic probe: succeeds for any request up to a fixed capacity.
    struct FixedProbe {
        capacity: u64,
        trials: usize,
    }

    impl FixedProbe {
        fn new(capacity: u64) -> Self {
            Self { capacity, trials: 0 }
        }
    }

    impl AllocProbe for FixedProbe {
        fn can_hold(&mut self, bytes: u64) -> bool {
            self.trials += 1;
            bytes <= self.capacity
        }
    }

    #[test]
    fn test_probe_never_exceeds_capacity() {
        let mut probe = FixedProbe::new(0x1234_5678);
        let params = ProbeParams { high_bit: 40, low_bit: 1, max_refine: 64 };
        let measured = probe_largest_chunk(&mut probe, &params);
        assert!(measured <= 0x1234_5678);
        // With an unbounded refinement budget and floor 2^1 the estimate is
        // tight to the last bit above the floor.
        assert!(measured >= 0x1234_5678 - 2);
    }

    #[test]
    fn test_probe_approximates_from_below() {
        let mut probe = FixedProbe::new(1 << 30);
        let measured =
            probe_largest_chunk(&mut probe, &ProbeParams { high_bit: 48, low_bit: 16, max_refine: 5 });
        assert_eq!(measured, 1 << 30);
    }

    #[test]
    fn test_larger_refinement_budget_never_measures_less() {
        let capacity = 0x0fed_cba9;
        for (small, large) in [(1usize, 3usize), (2, 5), (5, 32)] {
            let coarse = probe_largest_chunk(
                &mut FixedProbe::new(capacity),
                &ProbeParams { high_bit: 40, low_bit: 4, max_refine: small },
            );
            let fine = probe_largest_chunk(
                &mut FixedProbe::new(capacity),
                &ProbeParams { high_bit: 40, low_bit: 4, max_refine: large },
            );
            assert!(fine >= coarse, "refine {} -> {}, refine {} -> {}", small, coarse, large, fine);
        }
    }

    #[test]
    fn test_zero_capacity_measures_zero() {
        let mut probe = FixedProbe::new(0);
        let params = ProbeParams::for_spawn();
        assert_eq!(probe_largest_chunk(&mut probe, &params), 0);
    }

    #[test]
    fn test_root_budget_is_quarter_of_measured() {
        let capacity = 1u64 << 32;
        let measured = probe_largest_chunk(
            &mut FixedProbe::new(capacity),
            &ProbeParams::for_spawn(),
        );
        let budget = Partitioner::root()
            .budget(&mut FixedProbe::new(capacity), &ProbeParams::for_spawn());
        assert_eq!(budget, measured / ROOT_FRACTION);
    }

    #[test]
    fn test_nested_budget_capped_by_parent_quarter() {
        let parent_capacity = 1u64 << 32;
        let params = ProbeParams::for_spawn();
        let parent_measured =
            probe_largest_chunk(&mut FixedProbe::new(parent_capacity), &params);
        let root_budget =
            Partitioner::root().budget(&mut FixedProbe::new(parent_capacity), &params);

        // The nested spawn probes the full heap but its world is the lease.
        let nested_budget = Partitioner::nested(root_budget)
            .budget(&mut FixedProbe::new(parent_capacity), &params);

        assert!(nested_budget <= parent_measured / ROOT_FRACTION);
        assert_eq!(nested_budget, root_budget);
    }

    #[test]
    fn test_nested_budget_not_fractioned_again() {
        // A small world: the nested spawn may use all of it.
        let lease = 1u64 << 20;
        let budget =
            Partitioner::nested(lease).budget(&mut FixedProbe::new(1 << 40), &ProbeParams::for_spawn());
        assert_eq!(budget, lease);
    }

    #[test]
    fn test_heap_probe_handles_modest_requests() {
        let mut probe = HeapProbe;
        assert!(probe.can_hold(4096));
        assert!(!probe.can_hold(u64::MAX));
    }
}
