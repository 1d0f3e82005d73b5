//! One host thread per cpu.

use std::sync::Arc;

use super::{LoopExit, SchedContext, SchedError, VirtualCpu};
use crate::emu::{Emulator, ExecExit};

/// Body of a "CPU n/TCG" thread.
pub fn mttcg_cpu_loop(
    ctx: &SchedContext,
    emu: &dyn Emulator,
    cpu: Arc<VirtualCpu>,
) -> Result<LoopExit, SchedError> {
    let mut list = ctx.lock();
    cpu.claim();

    loop {
        if let Some(why) = ctx.leave_reason() {
            cpu.release();
            log::debug!("cpu {} thread leaving: {:?}", cpu.index(), why);
            return Ok(why);
        }

        if cpu.can_run() {
            drop(list);
            let exit = emu.exec(&cpu, ctx.entry_watch());
            list = ctx.lock();
            cpu.clear_exit_request();

            match exit {
                ExecExit::Debug => emu.handle_debug(&cpu),
                ExecExit::Atomic => {
                    drop(list);
                    emu.step_atomic(&cpu);
                    list = ctx.lock();
                }
                ExecExit::EntryHit if ctx.is_fork_child() => {}
                ExecExit::EntryHit => return ctx.enter_handoff(list),
                ExecExit::ReplayEnd => {
                    ctx.leave_with(&list, LoopExit::ReplayEnd);
                    cpu.release();
                    return Ok(LoopExit::ReplayEnd);
                }
                ExecExit::Halted | ExecExit::Interrupted => {}
            }
        }

        list = ctx.wait_cpu_io_event(list, &cpu);
        if cpu.unplug_requested() && !cpu.can_run() {
            list.remove(&cpu);
            cpu.release();
            log::info!("cpu {} unplugged", cpu.index());
            return Ok(LoopExit::Unplugged);
        }
    }
}
