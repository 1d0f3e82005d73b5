//! Descriptor-driven strategy.
//!
//! The first input byte picks an option row of the loaded descriptor, the
//! row then decides slot by slot how the remaining bytes are spent.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use super::{Harness, HarnessOptions, MutationPolicy, ScratchLayout, Trace};
use crate::access::{AccessSurface, RegisterFile, NUM_ARG_REGS};
use crate::descriptor::{ArgDesc, ArgKind, HarnessDescriptor};
use crate::input::FuzzInput;

/// Bytes copied into a slot's scratch region for a memory reference.
pub const SYNTHESIS_BUF_LEN: usize = 16;

pub struct SynthesisHarness {
    desc: HarnessDescriptor,
    layout: ScratchLayout,
    mutation: MutationPolicy,
    print_testcases: bool,
    selection_log: Option<PathBuf>,
}

impl SynthesisHarness {
    pub fn new(desc: HarnessDescriptor, opts: HarnessOptions) -> Self {
        Self {
            desc,
            layout: opts.layout,
            mutation: opts.mutation,
            print_testcases: opts.print_testcases,
            selection_log: opts.selection_log,
        }
    }

    pub fn descriptor(&self) -> &HarnessDescriptor {
        &self.desc
    }

    fn log_selection(&self, idx: usize) {
        if let Some(path) = self.selection_log.as_ref() {
            // a missing log file must not disturb the replay
            if let Ok(mut f) = OpenOptions::new().create(true).append(true).open(path) {
                let _ = write!(f, "{}, ", idx);
            }
        }
    }

    /// Value for a slot that carries a fixed constant.
    fn constant(&self, slot: usize, c: u64, input: &mut FuzzInput<'_>) -> u64 {
        if slot == 0 {
            u64::from(self.mutation.mutate_id(c as u32, input))
        } else {
            match input.take_u64() {
                Some(v) => c ^ v,
                None => c,
            }
        }
    }

    fn fill(
        &self,
        slot: usize,
        arg: &ArgDesc,
        regs: &mut RegisterFile,
        input: &mut FuzzInput<'_>,
        guest: &AccessSurface,
        trace: &Trace<'_>,
    ) {
        let kind = if arg.slot == slot {
            if let Some(c) = arg.constant {
                let val = self.constant(slot, c, input);
                regs.set(slot, val);
                trace.value(slot, val);
                return;
            }
            arg.kind
        } else {
            ArgKind::default_for(slot)
        };

        match kind {
            ArgKind::MemoryRef => {
                if let Some(buf) = input.take_bytes(SYNTHESIS_BUF_LEN) {
                    let addr = self.layout.slot_addr(slot);
                    regs.set(slot, addr);
                    guest.write_phys(addr, buf);
                    trace.memref(slot, addr, buf);
                }
            }
            ArgKind::SizeValue => {
                if let Some(size) = input.take_u64() {
                    let val = self.mutation.mutate_size(size, self.layout.slot_size, input);
                    regs.set(slot, val);
                    trace.value(slot, val);
                }
            }
            ArgKind::Skip => (),
            scalar => {
                let width = scalar.width().unwrap_or(8);
                if let Some(val) = input.take_scalar(width) {
                    regs.set(slot, val);
                    trace.value(slot, val);
                }
            }
        }
    }
}

impl Harness for SynthesisHarness {
    fn name(&self) -> &'static str {
        "synthesis"
    }

    fn apply(&self, regs: &mut RegisterFile, input: &mut FuzzInput<'_>, guest: &AccessSurface) {
        let trace = Trace::begin(guest, self.print_testcases);
        let (idx, row) = self.desc.select(input.take_u8().unwrap_or(0));
        self.log_selection(idx);
        log::trace!("replay uses option {}", idx);

        for (slot, arg) in row.iter().enumerate().take(NUM_ARG_REGS) {
            // leave the rest of the input for whatever runs after us
            if arg.kind == ArgKind::Skip {
                break;
            }
            self.fill(slot, arg, regs, input, guest, &trace);
        }
    }
}
