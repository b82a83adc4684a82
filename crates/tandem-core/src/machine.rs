//! The per-CPU machine bundle: frames, clock, counters, trace.

use crate::clock::{InstructionClock, MAX_INSTRUCTION};
use crate::frame::FrameAllocator;
use crate::stats::{PeCounters, TraceRing};

/// Configuration for a [`Machine`].
#[derive(Debug, Clone)]
pub struct MachineConfig {
    /// Number of physical frames in the arena.
    pub frames: usize,
    /// Retired-instruction budget of one processing element.
    pub budget: u64,
    /// PMI delivery lag, in instructions, for the first and second run.
    /// Real counters overshoot by a few instructions, and not
    /// necessarily by the same amount in both runs.
    pub pmi_skid: [u64; 2],
    /// Depth of the diagnostic trace ring.
    pub trace_depth: usize,
}

impl Default for MachineConfig {
    fn default() -> Self {
        MachineConfig {
            frames: 512,
            budget: MAX_INSTRUCTION,
            pmi_skid: [0, 0],
            trace_depth: 64,
        }
    }
}

/// Everything one CPU owns: physical memory, the instruction clock,
/// counters, the trace ring, and the fast-string toggle.
pub struct Machine {
    pub frames: FrameAllocator,
    pub clock: InstructionClock,
    pub counters: PeCounters,
    pub trace: TraceRing,
    /// Fast-string mode; disabled while a REP-prefixed instruction
    /// straddles a run boundary.
    pub fast_string: bool,
    /// Monotonic virtual timestamp handed out by RDTSC.
    pub virtual_tsc: u64,
    pub config: MachineConfig,
}

impl Machine {
    pub fn new(config: MachineConfig) -> Self {
        Machine {
            frames: FrameAllocator::new(config.frames),
            clock: InstructionClock::with_budget(config.budget),
            counters: PeCounters::default(),
            trace: TraceRing::new(config.trace_depth),
            fast_string: true,
            virtual_tsc: 0,
            config,
        }
    }
}
