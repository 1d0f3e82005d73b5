//! Runtime configuration, gathered from defaults, the environment and the
//! command line, in that order of precedence.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::access::NUM_ARG_REGS;
use crate::descriptor::{DescriptorError, HarnessDescriptor};
use crate::harness::{
    build_harness, Harness, HarnessKind, HarnessOptions, MissingDescriptor, MutationPolicy,
    ScratchLayout,
};
use crate::input::InputSource;
use crate::sched::{SchedMode, SchedOptions, DEFAULT_KICK_PERIOD};
use crate::utils::parse_hex_u64;

pub const DEFAULT_DESCRIPTOR_PATH: &str = "/in/harnessdata.csv";

pub const ENV_HARNESS: &str = "SMFUZZ_HARNESS";
pub const ENV_DESCRIPTOR: &str = "SMFUZZ_HARNESSDATA_PATH";
pub const ENV_SELECTION_LOG: &str = "SMFUZZ_LOGFILE_PATH";
pub const ENV_PRINT_TESTCASES: &str = "SMFUZZ_PRINT_TESTCASES";
pub const ENV_ENTRY: &str = "AFL_ENTRY";
pub const ENV_SHM_BASE: &str = "SMFUZZ_SHM_BASE";
pub const ENV_SHM_SIZE: &str = "SMFUZZ_SHM_SIZE";
pub const ENV_ID_MUTATION: &str = "SMFUZZ_ID_MUTATION";
pub const ENV_SIZE_MUTATION: &str = "SMFUZZ_SIZE_MUTATION";
pub const ENV_SCHED: &str = "SMFUZZ_SCHED";

/// Mutation thresholds are compared with a 4 bit nibble.
const MAX_THRESHOLD: u8 = 16;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {var}: {reason}")]
    BadValue {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("descriptor file not found: {0}")]
    MissingDescriptorFile(String),
    #[error("{name} threshold {val} out of range [0-16]")]
    Threshold { name: &'static str, val: u8 },
    #[error("scratch slot size must not be zero")]
    ZeroSlotSize,
    #[error("scratch regions overflow: base {base:#x}, slot size {slot_size:#x}")]
    LayoutOverflow { base: u64, slot_size: u64 },
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
    #[error(transparent)]
    Harness(#[from] MissingDescriptor),
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Injection strategy.
    pub harness: HarnessKind,
    /// Descriptor table, only read by the synthesis strategy.
    pub descriptor: PathBuf,
    pub selection_log: Option<PathBuf>,
    pub print_testcases: bool,
    /// Guest address triggering the fork handoff. Without one the machine
    /// runs without ever forking.
    pub entry: Option<u64>,
    pub layout: ScratchLayout,
    pub mutation: MutationPolicy,
    pub kick_period: Duration,
    pub sched_mode: SchedMode,
    /// Where a forked child reads its input from.
    pub input: InputSource,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            harness: HarnessKind::Synthesis,
            descriptor: PathBuf::from(DEFAULT_DESCRIPTOR_PATH),
            selection_log: None,
            print_testcases: false,
            entry: None,
            layout: ScratchLayout::default(),
            mutation: MutationPolicy::default(),
            kick_period: DEFAULT_KICK_PERIOD,
            sched_mode: SchedMode::default(),
            input: InputSource::default(),
        }
    }
}

impl Config {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut conf = Config::default();

        if let Some(v) = lookup(ENV_HARNESS) {
            conf.harness = v.parse().map_err(|e| bad_value(ENV_HARNESS, &v, e))?;
        }
        if let Some(v) = lookup(ENV_DESCRIPTOR) {
            conf.descriptor = PathBuf::from(v);
        }
        conf.selection_log = lookup(ENV_SELECTION_LOG).map(PathBuf::from);
        conf.print_testcases = lookup(ENV_PRINT_TESTCASES).is_some();
        if let Some(v) = lookup(ENV_ENTRY) {
            conf.entry = Some(hex(ENV_ENTRY, &v)?);
        }
        if let Some(v) = lookup(ENV_SHM_BASE) {
            conf.layout.base = hex(ENV_SHM_BASE, &v)?;
        }
        if let Some(v) = lookup(ENV_SHM_SIZE) {
            conf.layout.slot_size = hex(ENV_SHM_SIZE, &v)?;
        }
        if let Some(v) = lookup(ENV_ID_MUTATION) {
            conf.mutation.id_threshold = threshold(ENV_ID_MUTATION, &v)?;
        }
        if let Some(v) = lookup(ENV_SIZE_MUTATION) {
            conf.mutation.size_threshold = threshold(ENV_SIZE_MUTATION, &v)?;
        }
        if let Some(v) = lookup(ENV_SCHED) {
            conf.sched_mode = v.parse().map_err(|e| bad_value(ENV_SCHED, &v, e))?;
        }
        Ok(conf)
    }

    pub fn check(&self) -> Result<(), ConfigError> {
        if self.harness.needs_descriptor() && !self.descriptor.is_file() {
            return Err(ConfigError::MissingDescriptorFile(
                self.descriptor.to_string_lossy().into_owned(),
            ));
        }
        if self.mutation.id_threshold > MAX_THRESHOLD {
            return Err(ConfigError::Threshold {
                name: "id",
                val: self.mutation.id_threshold,
            });
        }
        if self.mutation.size_threshold > MAX_THRESHOLD {
            return Err(ConfigError::Threshold {
                name: "size",
                val: self.mutation.size_threshold,
            });
        }
        if self.layout.slot_size == 0 {
            return Err(ConfigError::ZeroSlotSize);
        }
        let span = self.layout.slot_size.checked_mul(NUM_ARG_REGS as u64);
        if span.and_then(|s| self.layout.base.checked_add(s)).is_none() {
            return Err(ConfigError::LayoutOverflow {
                base: self.layout.base,
                slot_size: self.layout.slot_size,
            });
        }
        Ok(())
    }

    pub fn harness_options(&self) -> HarnessOptions {
        HarnessOptions {
            layout: self.layout,
            mutation: self.mutation,
            print_testcases: self.print_testcases,
            selection_log: self.selection_log.clone(),
        }
    }

    pub fn sched_options(&self) -> SchedOptions {
        SchedOptions {
            mode: self.sched_mode,
            kick_period: self.kick_period,
            entry: self.entry,
        }
    }

    /// Descriptor table, if the selected strategy needs one.
    pub fn load_descriptor(&self) -> Result<Option<HarnessDescriptor>, ConfigError> {
        if !self.harness.needs_descriptor() {
            return Ok(None);
        }
        Ok(Some(HarnessDescriptor::load(&self.descriptor)?))
    }

    /// Check the configuration and instantiate the selected strategy.
    pub fn build_harness(&self) -> Result<Box<dyn Harness>, ConfigError> {
        self.check()?;
        let desc = self.load_descriptor()?;
        Ok(build_harness(self.harness, self.harness_options(), desc)?)
    }
}

fn bad_value<E: ToString>(var: &'static str, value: &str, err: E) -> ConfigError {
    ConfigError::BadValue {
        var,
        value: value.to_string(),
        reason: err.to_string(),
    }
}

fn hex(var: &'static str, value: &str) -> Result<u64, ConfigError> {
    parse_hex_u64(value).map_err(|e| bad_value(var, value, e))
}

fn threshold(var: &'static str, value: &str) -> Result<u8, ConfigError> {
    value.trim().parse().map_err(|e| bad_value(var, value, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        move |k| vars.get(k).cloned()
    }

    #[test]
    fn defaults() {
        let conf = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(conf.harness, HarnessKind::Synthesis);
        assert_eq!(conf.descriptor, PathBuf::from(DEFAULT_DESCRIPTOR_PATH));
        assert_eq!(conf.layout.base, 0x490000);
        assert_eq!(conf.layout.slot_size, 0x10000);
        assert_eq!(conf.mutation.id_threshold, 13);
        assert_eq!(conf.mutation.size_threshold, 8);
        assert_eq!(conf.sched_mode, SchedMode::RoundRobin);
        assert_eq!(conf.kick_period, Duration::from_millis(100));
        assert!(conf.entry.is_none());
        assert!(!conf.print_testcases);
    }

    #[test]
    fn environment_overrides() {
        let conf = Config::from_lookup(lookup(&[
            (ENV_HARNESS, "generic"),
            (ENV_ENTRY, "0x0e0a1000"),
            (ENV_SHM_BASE, "500000"),
            (ENV_SHM_SIZE, "0x1000"),
            (ENV_ID_MUTATION, "16"),
            (ENV_PRINT_TESTCASES, ""),
            (ENV_SCHED, "mttcg"),
            (ENV_SELECTION_LOG, "/tmp/sel.log"),
        ]))
        .unwrap();
        assert_eq!(conf.harness, HarnessKind::Generic);
        assert_eq!(conf.entry, Some(0x0e0a_1000));
        assert_eq!(conf.layout.base, 0x500000);
        assert_eq!(conf.layout.slot_size, 0x1000);
        assert_eq!(conf.mutation, MutationPolicy {
            id_threshold: 16,
            size_threshold: 8,
        });
        assert!(conf.print_testcases);
        assert_eq!(conf.sched_mode, SchedMode::MultiThread);
        assert_eq!(conf.selection_log, Some(PathBuf::from("/tmp/sel.log")));

        let sched = conf.sched_options();
        assert_eq!(sched.entry, Some(0x0e0a_1000));
        assert_eq!(conf.harness_options().layout, conf.layout);
    }

    #[test]
    fn bad_values() {
        let err = Config::from_lookup(lookup(&[(ENV_HARNESS, "afl")])).unwrap_err();
        assert!(matches!(err, ConfigError::BadValue { var: ENV_HARNESS, .. }));
        let err = Config::from_lookup(lookup(&[(ENV_ENTRY, "entry")])).unwrap_err();
        assert!(matches!(err, ConfigError::BadValue { var: ENV_ENTRY, .. }));
        let err = Config::from_lookup(lookup(&[(ENV_SIZE_MUTATION, "-1")])).unwrap_err();
        assert!(matches!(err, ConfigError::BadValue { .. }));
    }

    #[test]
    fn check_rejects() {
        let mut conf = Config {
            harness: HarnessKind::Generic,
            ..Default::default()
        };
        conf.check().unwrap();

        conf.mutation.size_threshold = 17;
        assert!(matches!(conf.check(), Err(ConfigError::Threshold { name: "size", .. })));
        conf.mutation.size_threshold = 8;

        conf.layout.slot_size = 0;
        assert!(matches!(conf.check(), Err(ConfigError::ZeroSlotSize)));
        conf.layout = ScratchLayout {
            base: u64::MAX - 0x100,
            slot_size: 0x100,
        };
        assert!(matches!(conf.check(), Err(ConfigError::LayoutOverflow { .. })));

        let conf = Config {
            descriptor: PathBuf::from("/nonexistent/harnessdata.csv"),
            ..Default::default()
        };
        assert!(matches!(conf.check(), Err(ConfigError::MissingDescriptorFile(_))));
    }

    #[test]
    fn synthesis_harness_from_file() {
        let path = env::temp_dir().join(format!("smfuzz-conf-{}.csv", std::process::id()));
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "BasicBlock").unwrap();
        writeln!(f, "0,,u32").unwrap();
        writeln!(f, "1,100,").unwrap();
        drop(f);

        let conf = Config {
            descriptor: path.clone(),
            ..Default::default()
        };
        let h = conf.build_harness().unwrap();
        assert_eq!(h.name(), "synthesis");
        assert_eq!(conf.load_descriptor().unwrap().unwrap().len(), 1);
        std::fs::remove_file(&path).unwrap();
    }
}
