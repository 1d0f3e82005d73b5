//! Input injection: map one fuzz input onto guest registers and memory before
//! a replay resumes.
//!
//! Every strategy is a pure function of (input bytes, loaded descriptor): the
//! same bytes always produce the same register and memory writes. Running out
//! of input is not an error, the slot is skipped and whatever the snapshot
//! held stays in place.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

use crate::access::{AccessSurface, PhysAddr, RegisterFile};
use crate::descriptor::HarnessDescriptor;
use crate::input::FuzzInput;
use crate::utils::hex_string;

pub mod fixed;
pub mod generic;
pub mod synthesis;

pub use fixed::{DispatchHarness, EfuseHarness, PartemuHarness, ProbingHarness, RpmbHarness};
pub use generic::GenericHarness;
pub use synthesis::SynthesisHarness;

/// Platform specific normal-world shared memory used for buffer arguments.
pub const DEFAULT_SHM_BASE: PhysAddr = 0x490000;
/// Size of one slot's scratch region.
pub const DEFAULT_SHM_SIZE: u64 = 0x10000;

pub trait Harness: Send + Sync {
    fn name(&self) -> &'static str;

    /// Populate `regs` and guest memory from `input`.
    fn apply(&self, regs: &mut RegisterFile, input: &mut FuzzInput<'_>, guest: &AccessSurface);
}

/// Scratch regions, one per argument slot, laid out back to back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScratchLayout {
    pub base: PhysAddr,
    pub slot_size: u64,
}

impl Default for ScratchLayout {
    fn default() -> Self {
        Self {
            base: DEFAULT_SHM_BASE,
            slot_size: DEFAULT_SHM_SIZE,
        }
    }
}

impl ScratchLayout {
    #[inline]
    pub fn slot_addr(&self, slot: usize) -> PhysAddr {
        self.base + self.slot_size * slot as u64
    }

    /// Whether `[addr, addr + len)` lies inside the region of `slot`.
    pub fn contains(&self, slot: usize, addr: PhysAddr, len: usize) -> bool {
        let start = self.slot_addr(slot);
        addr >= start && addr + len as u64 <= start + self.slot_size
    }
}

/// Probability knobs of the bounded constant mutation.
///
/// Both thresholds are compared against a 4 bit nibble taken from the input,
/// so `13` mutates with chance 3/16 and `16` never mutates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationPolicy {
    pub id_threshold: u8,
    pub size_threshold: u8,
}

impl Default for MutationPolicy {
    fn default() -> Self {
        Self {
            id_threshold: 13,
            size_threshold: 8,
        }
    }
}

impl MutationPolicy {
    pub const NEVER: MutationPolicy = MutationPolicy {
        id_threshold: 16,
        size_threshold: 16,
    };

    /// Scramble a 32 bit function id. The control byte's low nibble decides,
    /// its high nibble replaces bits 24..28 and a 16 bit value is xored into
    /// the low half.
    pub fn mutate_id(&self, id: u32, input: &mut FuzzInput<'_>) -> u32 {
        let ctl = match input.take_u8() {
            Some(c) => c,
            None => return id,
        };
        let low = input.take_u16().unwrap_or(0);
        if ctl & 0x0f < self.id_threshold {
            return id;
        }
        let upper_service = u32::from(ctl & 0xf0) << 20;
        (id & 0xf000_0000)
            .wrapping_add(upper_service)
            .wrapping_add((id & 0xffff) ^ u32::from(low))
    }

    /// Bring a size argument in range: bit 0 of the control byte reduces it
    /// modulo the scratch slot size, bit 1 aligns it down to 32 bytes.
    pub fn mutate_size(&self, size: u64, slot_size: u64, input: &mut FuzzInput<'_>) -> u64 {
        let ctl = match input.take_u8() {
            Some(c) => c,
            None => return size,
        };
        if ctl & 0x0f < self.size_threshold {
            return size;
        }
        let mut ret = size;
        if ctl & 0x1 != 0 && slot_size != 0 {
            ret %= slot_size;
        }
        if ctl & 0x2 != 0 {
            ret -= ret % 32;
        }
        ret
    }
}

/// Options shared by every strategy.
#[derive(Debug, Clone, Default)]
pub struct HarnessOptions {
    pub layout: ScratchLayout,
    pub mutation: MutationPolicy,
    /// Dump each testcase as CSV through the guest log sink.
    pub print_testcases: bool,
    /// Append the picked descriptor option of every replay to this file.
    pub selection_log: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarnessKind {
    Generic,
    Synthesis,
    Partemu,
    Probing,
    Efuse,
    Rpmb,
    /// Leading byte picks generic, efuse or rpmb.
    Dispatch,
}

impl HarnessKind {
    pub const ALL: [HarnessKind; 7] = [
        HarnessKind::Generic,
        HarnessKind::Synthesis,
        HarnessKind::Partemu,
        HarnessKind::Probing,
        HarnessKind::Efuse,
        HarnessKind::Rpmb,
        HarnessKind::Dispatch,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            HarnessKind::Generic => "generic",
            HarnessKind::Synthesis => "synthesis",
            HarnessKind::Partemu => "partemu",
            HarnessKind::Probing => "probing",
            HarnessKind::Efuse => "efuse",
            HarnessKind::Rpmb => "rpmb",
            HarnessKind::Dispatch => "dispatch",
        }
    }

    pub fn needs_descriptor(self) -> bool {
        self == HarnessKind::Synthesis
    }
}

impl fmt::Display for HarnessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown harness '{0}'")]
pub struct UnknownHarness(pub String);

impl FromStr for HarnessKind {
    type Err = UnknownHarness;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        HarnessKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| UnknownHarness(s.to_string()))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("harness '{0}' needs a descriptor")]
pub struct MissingDescriptor(pub HarnessKind);

/// Instantiate the strategy selected by `kind`.
pub fn build_harness(
    kind: HarnessKind,
    opts: HarnessOptions,
    descriptor: Option<HarnessDescriptor>,
) -> Result<Box<dyn Harness>, MissingDescriptor> {
    let h: Box<dyn Harness> = match kind {
        HarnessKind::Generic => Box::new(GenericHarness::new(opts)),
        HarnessKind::Synthesis => {
            let desc = descriptor.ok_or(MissingDescriptor(kind))?;
            Box::new(SynthesisHarness::new(desc, opts))
        }
        HarnessKind::Partemu => Box::new(PartemuHarness::new(opts)),
        HarnessKind::Probing => Box::new(ProbingHarness),
        HarnessKind::Efuse => Box::new(EfuseHarness),
        HarnessKind::Rpmb => Box::new(RpmbHarness),
        HarnessKind::Dispatch => Box::new(DispatchHarness::new(opts)),
    };
    Ok(h)
}

/// CSV dump of one testcase: `RegIdx,Type,Value,MemValue`.
pub(crate) struct Trace<'a> {
    guest: &'a AccessSurface,
    enabled: bool,
}

impl<'a> Trace<'a> {
    pub(crate) fn begin(guest: &'a AccessSurface, enabled: bool) -> Self {
        if enabled {
            guest.log("### NEW TESTCASE ###\n");
            guest.log("RegIdx,Type,Value,MemValue\n");
        }
        Self { guest, enabled }
    }

    pub(crate) fn value(&self, slot: usize, val: u64) {
        if self.enabled {
            self.guest.log(&format!("{},const,{:x}, \n", slot, val));
        }
    }

    pub(crate) fn memref(&self, slot: usize, addr: PhysAddr, data: &[u8]) {
        if self.enabled {
            self.guest
                .log(&format!("{},memref,{:x},{}\n", slot, addr, hex_string(data)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_mutation() {
        let p = MutationPolicy::default();
        // low nibble 0xd >= 13: mutate
        let data = [0x5d, 0x12, 0x34];
        let mut input = FuzzInput::new(&data);
        let id = p.mutate_id(0xc200_0001, &mut input);
        assert_eq!(id, 0xc000_0000 + (0x50 << 20) + (0x0001 ^ 0x1234));
        assert_eq!(input.remaining(), 0);

        // low nibble 0xc < 13: untouched but bytes consumed
        let data = [0x5c, 0x12, 0x34];
        let mut input = FuzzInput::new(&data);
        assert_eq!(p.mutate_id(0xc200_0001, &mut input), 0xc200_0001);
        assert_eq!(input.remaining(), 0);

        let mut input = FuzzInput::new(&[]);
        assert_eq!(p.mutate_id(0x8400_0000, &mut input), 0x8400_0000);

        let mut input = FuzzInput::new(&[0xff, 0xff, 0xff]);
        assert_eq!(MutationPolicy::NEVER.mutate_id(7, &mut input), 7);
    }

    #[test]
    fn size_mutation() {
        let p = MutationPolicy::default();
        let slot = DEFAULT_SHM_SIZE;
        let mut input = FuzzInput::new(&[0x09]);
        assert_eq!(p.mutate_size(0x12345, slot, &mut input), 0x2345);
        let mut input = FuzzInput::new(&[0x0a]);
        assert_eq!(p.mutate_size(0x12345, slot, &mut input), 0x12340);
        let mut input = FuzzInput::new(&[0x0b]);
        assert_eq!(p.mutate_size(0x12345, slot, &mut input), 0x2340);
        let mut input = FuzzInput::new(&[0x07]);
        assert_eq!(p.mutate_size(0x12345, slot, &mut input), 0x12345);
        let mut input = FuzzInput::new(&[]);
        assert_eq!(p.mutate_size(0x12345, slot, &mut input), 0x12345);
    }

    #[test]
    fn layout_regions() {
        let l = ScratchLayout::default();
        assert_eq!(l.slot_addr(0), 0x490000);
        assert_eq!(l.slot_addr(3), 0x4c0000);
        assert!(l.contains(1, 0x4a0000, 0x10000));
        assert!(!l.contains(1, 0x4a0000, 0x10001));
        assert!(!l.contains(1, 0x490000, 8));
    }

    #[test]
    fn kind_names() {
        for k in HarnessKind::ALL.iter() {
            assert_eq!(k.as_str().parse::<HarnessKind>(), Ok(*k));
        }
        assert_eq!(
            "smc".parse::<HarnessKind>(),
            Err(UnknownHarness("smc".to_string()))
        );
    }

    #[test]
    fn synthesis_needs_descriptor() {
        let err = build_harness(HarnessKind::Synthesis, HarnessOptions::default(), None)
            .err()
            .unwrap();
        assert_eq!(err, MissingDescriptor(HarnessKind::Synthesis));
        let h = build_harness(HarnessKind::Generic, HarnessOptions::default(), None).unwrap();
        assert_eq!(h.name(), "generic");
    }
}
