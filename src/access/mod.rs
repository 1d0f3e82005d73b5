//! Narrow view of the emulator used by the injection strategies.
//!
//! The emulator hands over three callbacks once at initialization: guest
//! physical memory write, guest physical memory read and a logging sink.
//! Registers are exchanged as a [`RegisterFile`] snapshot.

use std::fmt;

use thiserror::Error;

pub mod mem;

pub use mem::GuestMemory;

/// Number of argument registers the strategies may populate (x0 - x7).
pub const NUM_ARG_REGS: usize = 8;

/// Guest physical address.
pub type PhysAddr = u64;

pub type PhysWriteFn = Box<dyn Fn(PhysAddr, &[u8]) + Send + Sync>;
pub type PhysReadFn = Box<dyn Fn(PhysAddr, &mut [u8]) + Send + Sync>;
pub type LogFn = Box<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AccessError {
    #[error("missing access callback: {0}")]
    MissingCallback(&'static str),
}

/// General purpose argument registers of the guest cpu.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegisterFile {
    regs: [u64; NUM_ARG_REGS],
}

impl RegisterFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_slice(vals: &[u64]) -> Self {
        let mut regs = [0; NUM_ARG_REGS];
        for (r, v) in regs.iter_mut().zip(vals) {
            *r = *v;
        }
        Self { regs }
    }

    #[inline]
    pub fn get(&self, idx: usize) -> Option<u64> {
        self.regs.get(idx).copied()
    }

    /// Set `x<idx>`, indexes out of range are ignored.
    #[inline]
    pub fn set(&mut self, idx: usize, val: u64) {
        if let Some(r) = self.regs.get_mut(idx) {
            *r = val;
        }
    }

    pub fn as_slice(&self) -> &[u64] {
        &self.regs[..]
    }
}

impl fmt::Display for RegisterFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, r) in self.regs.iter().enumerate() {
            if i != 0 {
                writeln!(f)?;
            }
            write!(f, "x{}: {:#018x}", i, r)?;
        }
        Ok(())
    }
}

/// Memory and logging callbacks supplied by the emulator.
pub struct AccessSurface {
    write: PhysWriteFn,
    read: PhysReadFn,
    log: LogFn,
}

impl AccessSurface {
    pub fn builder() -> SurfaceBuilder {
        SurfaceBuilder::default()
    }

    #[inline]
    pub fn write_phys(&self, addr: PhysAddr, data: &[u8]) {
        (self.write)(addr, data)
    }

    #[inline]
    pub fn read_phys(&self, addr: PhysAddr, buf: &mut [u8]) {
        (self.read)(addr, buf)
    }

    #[inline]
    pub fn log(&self, msg: &str) {
        (self.log)(msg)
    }
}

impl fmt::Debug for AccessSurface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessSurface").finish()
    }
}

/// Collects the three callbacks, all of them are mandatory.
#[derive(Default)]
pub struct SurfaceBuilder {
    write: Option<PhysWriteFn>,
    read: Option<PhysReadFn>,
    log: Option<LogFn>,
}

impl SurfaceBuilder {
    pub fn phys_write<F>(mut self, f: F) -> Self
    where
        F: Fn(PhysAddr, &[u8]) + Send + Sync + 'static,
    {
        self.write = Some(Box::new(f));
        self
    }

    pub fn phys_read<F>(mut self, f: F) -> Self
    where
        F: Fn(PhysAddr, &mut [u8]) + Send + Sync + 'static,
    {
        self.read = Some(Box::new(f));
        self
    }

    pub fn log_sink<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.log = Some(Box::new(f));
        self
    }

    /// Route the logging sink to the `log` facade.
    pub fn default_log_sink(self) -> Self {
        self.log_sink(|msg| log::info!(target: "guest", "{}", msg.trim_end()))
    }

    pub fn build(self) -> Result<AccessSurface, AccessError> {
        Ok(AccessSurface {
            write: self.write.ok_or(AccessError::MissingCallback("phys_write"))?,
            read: self.read.ok_or(AccessError::MissingCallback("phys_read"))?,
            log: self.log.ok_or(AccessError::MissingCallback("log_sink"))?,
        })
    }
}
