//! Bitmask strategy.
//!
//! Byte 0 is a mask: bit `n` set means slot `n` receives an 8 byte buffer in
//! its scratch region, clear means a 4 byte big-endian scalar. Slots are
//! filled in order until the input runs out.

use super::{Harness, HarnessOptions, ScratchLayout, Trace};
use crate::access::{AccessSurface, RegisterFile};
use crate::input::FuzzInput;

/// Slots covered by the mask.
pub const GENERIC_SLOTS: usize = 6;
/// Bytes copied per buffer slot.
pub const GENERIC_BUF_LEN: usize = 8;

pub struct GenericHarness {
    layout: ScratchLayout,
    print_testcases: bool,
}

impl GenericHarness {
    pub fn new(opts: HarnessOptions) -> Self {
        Self {
            layout: opts.layout,
            print_testcases: opts.print_testcases,
        }
    }
}

impl Harness for GenericHarness {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn apply(&self, regs: &mut RegisterFile, input: &mut FuzzInput<'_>, guest: &AccessSurface) {
        let mask = match input.take_u8() {
            Some(m) => m,
            None => return,
        };
        let trace = Trace::begin(guest, self.print_testcases);

        let mut slot = 0;
        while input.remaining() != 0 && slot < GENERIC_SLOTS {
            if (mask >> slot) & 0x1 == 1 {
                if let Some(buf) = input.take_bytes(GENERIC_BUF_LEN) {
                    let addr = self.layout.slot_addr(slot);
                    regs.set(slot, addr);
                    guest.write_phys(addr, buf);
                    trace.memref(slot, addr, buf);
                }
            } else if let Some(val) = input.take_u32() {
                regs.set(slot, u64::from(val));
                trace.value(slot, u64::from(val));
            }
            slot += 1;
        }
    }
}
