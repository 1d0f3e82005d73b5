//! Single threaded round-robin over every cpu.

use std::sync::{Arc, MutexGuard};

use super::{CpuList, LoopExit, SchedContext, SchedError, VirtualCpu};
use crate::emu::{Emulator, ExecExit};

/// Body of the "ALL CPUs/TCG" thread. Returns once a leave reason is set,
/// the entry point is hit or every cpu is gone.
pub fn rr_cpu_loop(ctx: &SchedContext, emu: &dyn Emulator) -> Result<LoopExit, SchedError> {
    let mut list = ctx.lock();
    for cpu in list.iter() {
        cpu.claim();
    }

    // a forked child restarts right after the entry point, already running
    if !ctx.is_fork_child() {
        while let Some(first) = list.first() {
            if !first.is_stopped() || ctx.leave_reason().is_some() {
                break;
            }
            list = ctx.wait_halt(list);
        }
    }
    ctx.start_kick(&list);

    let mut cpu: Option<Arc<VirtualCpu>> = None;
    loop {
        if let Some(why) = ctx.leave_reason() {
            return Ok(leave(ctx, list, why));
        }
        if cpu.as_ref().map_or(true, |c| !list.contains(c)) {
            cpu = list.first();
        }

        while let Some(c) = cpu.clone() {
            if c.has_work() || c.exit_requested() || ctx.leave_reason().is_some() {
                break;
            }
            ctx.set_current(Some(Arc::clone(&c)));

            if c.can_run() {
                drop(list);
                let exit = emu.exec(&c, ctx.entry_watch());
                list = ctx.lock();
                c.clear_exit_request();

                match exit {
                    ExecExit::Debug => {
                        emu.handle_debug(&c);
                        break;
                    }
                    ExecExit::Atomic => {
                        drop(list);
                        emu.step_atomic(&c);
                        list = ctx.lock();
                        break;
                    }
                    ExecExit::EntryHit if ctx.is_fork_child() => {
                        log::debug!("cpu {}: entry point hit again in child, ignored", c.index());
                    }
                    ExecExit::EntryHit => return ctx.enter_handoff(list),
                    ExecExit::ReplayEnd => {
                        ctx.leave_with(&list, LoopExit::ReplayEnd);
                        return Ok(leave(ctx, list, LoopExit::ReplayEnd));
                    }
                    ExecExit::Halted | ExecExit::Interrupted => {}
                }
            } else if c.stop_requested() {
                if c.unplug_requested() {
                    cpu = list.next_after(&c);
                }
                break;
            }

            cpu = list.next_after(&c);
        }

        ctx.set_current(None);
        if let Some(c) = cpu.as_ref() {
            c.clear_exit_request();
        }

        list = ctx.wait_io_event(list);
        ctx.deal_with_unplugged(&mut list);
        if list.is_empty() && ctx.leave_reason().is_none() {
            log::info!("every cpu unplugged, round-robin loop done");
            return Ok(LoopExit::Unplugged);
        }
    }
}

fn leave(ctx: &SchedContext, list: MutexGuard<'_, CpuList>, why: LoopExit) -> LoopExit {
    ctx.set_current(None);
    for cpu in list.iter() {
        cpu.release();
    }
    log::debug!("round-robin loop leaving: {:?}", why);
    why
}
