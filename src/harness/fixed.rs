//! Hand written mappings for a few known secure monitor interfaces.

use super::{generic::GenericHarness, Harness, HarnessOptions, ScratchLayout, Trace};
use crate::access::{AccessSurface, PhysAddr, RegisterFile};
use crate::input::FuzzInput;

/// Parameter registers after the function id (x1 - x7).
const PARTEMU_PARAMS: usize = 7;
const PARTEMU_BUF_LEN: usize = 16;

/// TA-style mapping: a type word whose first byte marks each parameter as
/// value (bit set) or memory reference (bit clear), the function id, then one
/// 8 byte value or 16 byte buffer per parameter.
pub struct PartemuHarness {
    layout: ScratchLayout,
    print_testcases: bool,
}

impl PartemuHarness {
    pub fn new(opts: HarnessOptions) -> Self {
        Self {
            layout: opts.layout,
            print_testcases: opts.print_testcases,
        }
    }
}

impl Harness for PartemuHarness {
    fn name(&self) -> &'static str {
        "partemu"
    }

    fn apply(&self, regs: &mut RegisterFile, input: &mut FuzzInput<'_>, guest: &AccessSurface) {
        let trace = Trace::begin(guest, self.print_testcases);
        let types = match input.take_bytes(4) {
            Some(t) => t[0],
            None => return,
        };
        if let Some(id) = input.take_u32() {
            regs.set(0, u64::from(id));
            trace.value(0, u64::from(id));
        }

        for i in 0..PARTEMU_PARAMS {
            let slot = i + 1;
            if (types >> i) & 0x1 == 1 {
                if let Some(val) = input.take_u64() {
                    regs.set(slot, val);
                    trace.value(slot, val);
                }
            } else if let Some(buf) = input.take_bytes(PARTEMU_BUF_LEN) {
                let addr = self.layout.slot_addr(i);
                regs.set(slot, addr);
                guest.write_phys(addr, buf);
                trace.memref(slot, addr, buf);
            }
        }
    }
}

/// Takes the first 4 bytes as function id, used to probe which ids the
/// monitor dispatches at all.
pub struct ProbingHarness;

impl Harness for ProbingHarness {
    fn name(&self) -> &'static str {
        "probing"
    }

    fn apply(&self, regs: &mut RegisterFile, input: &mut FuzzInput<'_>, _guest: &AccessSurface) {
        if let Some(id) = input.take_u32() {
            regs.set(0, u64::from(id));
        }
    }
}

pub const EFUSE_FID_BASE: u64 = 0xc500_0000;
pub const EFUSE_DATA_ADDR: PhysAddr = 0x34a2_1900;
pub const EFUSE_DATA_LEN: usize = 0x40;
pub const EFUSE_MAX_SIZE: u64 = 0x300;
pub const EFUSE_TIMEOUT: u64 = 1000;
/// Status register polled by the monitor while waiting for the fuse block.
pub const EFUSE_STATE_REG: PhysAddr = 0xfff0_3004;
const EFUSE_STATE_READY: u32 = 0x2;
const EFUSE_MIN_INPUT: usize = 1 + EFUSE_DATA_LEN + 2;

/// eFuse driver interface: id offset, 64 byte request struct, size, timeout.
pub struct EfuseHarness;

impl Harness for EfuseHarness {
    fn name(&self) -> &'static str {
        "efuse"
    }

    fn apply(&self, regs: &mut RegisterFile, input: &mut FuzzInput<'_>, guest: &AccessSurface) {
        let raw = match input.take_bytes(EFUSE_MIN_INPUT) {
            Some(r) => r,
            None => return,
        };
        regs.set(0, EFUSE_FID_BASE + u64::from(raw[0]));

        regs.set(1, EFUSE_DATA_ADDR);
        guest.write_phys(EFUSE_DATA_ADDR, &raw[1..=EFUSE_DATA_LEN]);

        let size = ((u64::from(raw[0x41]) << 8) | u64::from(raw[0x42])) % EFUSE_MAX_SIZE;
        regs.set(2, size);
        regs.set(3, EFUSE_TIMEOUT);

        guest.write_phys(EFUSE_STATE_REG, &EFUSE_STATE_READY.to_le_bytes());
    }
}

/// Function id ranges of the RPMB service, picked by a class byte.
pub const RPMB_FID_CLASSES: [u64; 3] = [0xc600_0000, 0xc600_ff00, 0xc600_fff0];
/// The only id that takes a request buffer.
pub const RPMB_REQUEST_FID: u64 = 0xc600_ff04;
pub const RPMB_REQUEST_ADDR: PhysAddr = 0x34a2_9000;

/// RPMB driver interface: class byte, id offset, rest of the input is the
/// request buffer.
pub struct RpmbHarness;

impl Harness for RpmbHarness {
    fn name(&self) -> &'static str {
        "rpmb"
    }

    fn apply(&self, regs: &mut RegisterFile, input: &mut FuzzInput<'_>, guest: &AccessSurface) {
        let (class, off) = match input.take_bytes(2) {
            Some(b) => (b[0], b[1]),
            None => return,
        };
        // unknown classes keep the snapshot's x0
        if let Some(base) = RPMB_FID_CLASSES.get(class as usize) {
            regs.set(0, base + u64::from(off));
        }
        if regs.get(0) == Some(RPMB_REQUEST_FID) {
            let rest = input.rest();
            regs.set(1, RPMB_REQUEST_ADDR);
            guest.write_phys(RPMB_REQUEST_ADDR, rest);
            input.skip(rest.len());
        }
    }
}

/// Picks one of the generic, eFuse and RPMB mappings by a leading byte
/// (1, 2 and 3). Other values leave the cpu untouched.
pub struct DispatchHarness {
    generic: GenericHarness,
}

impl DispatchHarness {
    pub fn new(opts: HarnessOptions) -> Self {
        Self {
            generic: GenericHarness::new(opts),
        }
    }
}

impl Harness for DispatchHarness {
    fn name(&self) -> &'static str {
        "dispatch"
    }

    fn apply(&self, regs: &mut RegisterFile, input: &mut FuzzInput<'_>, guest: &AccessSurface) {
        match input.take_u8() {
            Some(1) => self.generic.apply(regs, input, guest),
            Some(2) => EfuseHarness.apply(regs, input, guest),
            Some(3) => RpmbHarness.apply(regs, input, guest),
            Some(d) => log::trace!("no mapping for discriminator {}", d),
            None => (),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::GuestMemory;
    use crate::harness::DEFAULT_SHM_BASE;

    fn run<H: Harness>(h: &H, data: &[u8]) -> (RegisterFile, GuestMemory) {
        let mem = GuestMemory::new();
        let mut regs = RegisterFile::new();
        h.apply(&mut regs, &mut FuzzInput::new(data), &mem.surface());
        (regs, mem)
    }

    #[test]
    fn partemu_mapping() {
        let mut data = vec![0b0000_0010, 0, 0, 0];
        data.extend(&0x8200_0011u32.to_be_bytes());
        data.extend(&[0xab; 16]);
        data.extend(&0x1122_3344_5566_7788u64.to_be_bytes());
        let (regs, mem) = run(&PartemuHarness::new(HarnessOptions::default()), &data);
        assert_eq!(regs.get(0), Some(0x8200_0011));
        assert_eq!(regs.get(1), Some(DEFAULT_SHM_BASE));
        assert_eq!(regs.get(2), Some(0x1122_3344_5566_7788));
        assert_eq!(regs.get(3), Some(0));
        assert_eq!(mem.writes(), vec![(DEFAULT_SHM_BASE, vec![0xab; 16])]);
    }

    #[test]
    fn probing_takes_function_id() {
        let (regs, _) = run(&ProbingHarness, &[0xc2, 0, 0, 0x0a, 0xff]);
        assert_eq!(regs.get(0), Some(0xc200_000a));
        let (regs, _) = run(&ProbingHarness, &[0xc2, 0]);
        assert_eq!(regs.get(0), Some(0));
    }

    #[test]
    fn efuse_request() {
        let mut data = vec![0x07];
        data.extend(&[0x5a; EFUSE_DATA_LEN]);
        data.extend(&[0x03, 0x10]);
        let (regs, mem) = run(&EfuseHarness, &data);
        assert_eq!(regs.get(0), Some(0xc500_0007));
        assert_eq!(regs.get(1), Some(EFUSE_DATA_ADDR));
        assert_eq!(regs.get(2), Some(0x310 % 0x300));
        assert_eq!(regs.get(3), Some(1000));
        assert_eq!(
            mem.writes(),
            vec![
                (EFUSE_DATA_ADDR, vec![0x5a; EFUSE_DATA_LEN]),
                (EFUSE_STATE_REG, vec![2, 0, 0, 0]),
            ]
        );

        let (regs, mem) = run(&EfuseHarness, &data[..0x42]);
        assert_eq!(regs, RegisterFile::new());
        assert!(mem.writes().is_empty());
    }

    #[test]
    fn rpmb_classes() {
        let (regs, mem) = run(&RpmbHarness, &[0, 3]);
        assert_eq!(regs.get(0), Some(0xc600_0003));
        assert!(mem.writes().is_empty());

        let (regs, mem) = run(&RpmbHarness, &[1, 4, 0xde, 0xad]);
        assert_eq!(regs.get(0), Some(RPMB_REQUEST_FID));
        assert_eq!(regs.get(1), Some(RPMB_REQUEST_ADDR));
        assert_eq!(mem.writes(), vec![(RPMB_REQUEST_ADDR, vec![0xde, 0xad])]);

        let (regs, _) = run(&RpmbHarness, &[9, 4]);
        assert_eq!(regs.get(0), Some(0));
    }

    #[test]
    fn rpmb_request_consumes_rest() {
        let mem = GuestMemory::new();
        let mut regs = RegisterFile::new();
        let data = [1, 4, 0xde, 0xad, 0xbe];
        let mut input = FuzzInput::new(&data);
        RpmbHarness.apply(&mut regs, &mut input, &mem.surface());
        assert_eq!(input.remaining(), 0);
        assert_eq!(mem.writes(), vec![(RPMB_REQUEST_ADDR, vec![0xde, 0xad, 0xbe])]);
    }

    #[test]
    fn dispatch_by_first_byte() {
        let h = DispatchHarness::new(HarnessOptions::default());
        let (regs, _) = run(&h, &[3, 2, 1]);
        assert_eq!(regs.get(0), Some(0xc600_fff1));
        let (regs, _) = run(&h, &[1, 0, 0, 0, 0, 5]);
        assert_eq!(regs.get(0), Some(5));
        let (regs, mem) = run(&h, &[7, 1, 2, 3, 4, 5]);
        assert_eq!(regs, RegisterFile::new());
        assert!(mem.writes().is_empty());
    }
}
