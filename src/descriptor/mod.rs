//! Harness descriptor: candidate mappings from argument slot to fixed value
//! or semantic type, produced offline by the type recovery tool.

use std::fmt;
use std::fs::read_to_string;
use std::path::Path;

use thiserror::Error;

use crate::access::NUM_ARG_REGS;

mod parse;

pub use parse::parse_descriptor;

/// Upper bound of option rows in one descriptor.
pub const MAX_OPTIONS: usize = 1000;

/// Line that opens a new option group in the descriptor file.
pub const GROUP_MARKER: &str = "BasicBlock";

/// Type tag that stops processing of a row.
pub const DO_NOT_FILL: &str = "donotfill";

#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("failed to read descriptor {path}: {err}")]
    Read { path: String, err: std::io::Error },
    #[error("descriptor contains no option rows")]
    Empty,
    #[error("descriptor exceeds {} option rows", MAX_OPTIONS)]
    TooManyOptions,
    #[error("line {line}: bad constant '{value}'")]
    BadConstant { line: usize, value: String },
}

/// Semantic kind of an argument slot, resolved once from the type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgKind {
    Scalar8,
    Scalar16,
    Scalar32,
    Scalar64,
    /// Pointer to a buffer, filled through the slot's scratch region.
    MemoryRef,
    /// Length argument, 64 bit with bounded size mutation.
    SizeValue,
    /// Stop filling this row here, keep the remaining input.
    Skip,
}

impl ArgKind {
    /// Default kind for slots without usable type information: slot 0 holds a
    /// 32 bit function id, everything else is a 64 bit register.
    pub fn default_for(slot: usize) -> Self {
        if slot == 0 {
            ArgKind::Scalar32
        } else {
            ArgKind::Scalar64
        }
    }

    /// Resolve a type tag by substring match. Explicit bit widths win over C
    /// type names, so `uint16_t` is 16 bit even though it contains `int`.
    pub fn from_tag(tag: &str, slot: usize) -> Self {
        let tag = tag.trim();
        let has = |pats: &[&str]| pats.iter().any(|p| tag.contains(p));

        if tag == DO_NOT_FILL {
            ArgKind::Skip
        } else if has(&["phys", "buf", "addr", "mem"]) {
            ArgKind::MemoryRef
        } else if has(&["size"]) {
            ArgKind::SizeValue
        } else if has(&["64"]) {
            ArgKind::Scalar64
        } else if has(&["32"]) {
            ArgKind::Scalar32
        } else if has(&["16"]) {
            ArgKind::Scalar16
        } else if has(&["8"]) {
            ArgKind::Scalar8
        } else if has(&["long"]) {
            ArgKind::Scalar64
        } else if has(&["int"]) {
            ArgKind::Scalar32
        } else if has(&["short"]) {
            ArgKind::Scalar16
        } else if has(&["char"]) {
            ArgKind::Scalar8
        } else {
            ArgKind::default_for(slot)
        }
    }

    /// Bytes taken from the input for scalar kinds.
    pub fn width(self) -> Option<usize> {
        match self {
            ArgKind::Scalar8 => Some(1),
            ArgKind::Scalar16 => Some(2),
            ArgKind::Scalar32 => Some(4),
            ArgKind::Scalar64 | ArgKind::SizeValue => Some(8),
            ArgKind::MemoryRef | ArgKind::Skip => None,
        }
    }
}

impl fmt::Display for ArgKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ArgKind::Scalar8 => "u8",
            ArgKind::Scalar16 => "u16",
            ArgKind::Scalar32 => "u32",
            ArgKind::Scalar64 => "u64",
            ArgKind::MemoryRef => "memref",
            ArgKind::SizeValue => "size",
            ArgKind::Skip => DO_NOT_FILL,
        };
        write!(f, "{}", s)
    }
}

/// One argument of an option row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgDesc {
    /// Register slot this entry was recorded for.
    pub slot: usize,
    pub constant: Option<u64>,
    pub kind: ArgKind,
}

impl ArgDesc {
    pub fn skip(slot: usize) -> Self {
        Self {
            slot,
            constant: None,
            kind: ArgKind::Skip,
        }
    }
}

/// A full row, always `NUM_ARG_REGS` entries long.
pub type OptionRow = [ArgDesc; NUM_ARG_REGS];

/// Option table loaded once at startup, read-only afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessDescriptor {
    rows: Vec<OptionRow>,
}

impl HarnessDescriptor {
    pub fn new(rows: Vec<OptionRow>) -> Result<Self, DescriptorError> {
        if rows.is_empty() {
            return Err(DescriptorError::Empty);
        }
        if rows.len() > MAX_OPTIONS {
            return Err(DescriptorError::TooManyOptions);
        }
        Ok(Self { rows })
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, DescriptorError> {
        let path = path.as_ref();
        let content = read_to_string(path).map_err(|err| DescriptorError::Read {
            path: path.display().to_string(),
            err,
        })?;
        let rows = parse_descriptor(&content)?;
        log::info!(
            "descriptor {}: {} harness options",
            path.display(),
            rows.len()
        );
        Self::new(rows)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[OptionRow] {
        &self.rows
    }

    /// Option picked by a selector byte.
    pub fn select(&self, selector: u8) -> (usize, &OptionRow) {
        let idx = selector as usize % self.rows.len();
        (idx, &self.rows[idx])
    }
}

impl fmt::Display for HarnessDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, row) in self.rows.iter().enumerate() {
            write!(f, "option {:>4}:", i)?;
            for arg in row.iter() {
                if arg.kind == ArgKind::Skip {
                    break;
                }
                match arg.constant {
                    Some(c) => write!(f, " x{}={:#x}", arg.slot, c)?,
                    None => write!(f, " x{}:{}", arg.slot, arg.kind)?,
                }
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
