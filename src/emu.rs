//! The emulator as seen by the schedulers.
//!
//! Instruction translation, device models and board setup live on the other
//! side of this trait. Implementations must be shareable between cpu threads,
//! `exec` is always called with the global lock released.

use crate::access::RegisterFile;
use crate::sched::VirtualCpu;

/// Why `exec` returned control to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecExit {
    /// Breakpoint or watchpoint, handed to the debug stub.
    Debug,
    /// Exclusive region that must run with every other cpu stopped.
    Atomic,
    /// The cpu executed a halt/wfi.
    Halted,
    /// Fuzzing entry address reached.
    EntryHit,
    /// Exit request honored (kick, queued work, interrupt).
    Interrupted,
    /// End of one replay reached in a forked child.
    ReplayEnd,
}

pub trait Emulator: Send + Sync {
    /// Run guest code on `cpu` until it traps. `entry` is the address that
    /// reports [`ExecExit::EntryHit`], `None` once the handoff happened.
    fn exec(&self, cpu: &VirtualCpu, entry: Option<u64>) -> ExecExit;

    /// Execute one atomic region of `cpu` uninterrupted.
    fn step_atomic(&self, cpu: &VirtualCpu);

    fn handle_debug(&self, cpu: &VirtualCpu);

    fn read_regs(&self, cpu: &VirtualCpu) -> RegisterFile;

    fn write_regs(&self, cpu: &VirtualCpu, regs: &RegisterFile);
}
