//! Snapshot fork-server fuzzing of firmware running in an emulator.
//!
//! The emulator runs the machine until a configured entry address, the cpu
//! scheduler then hands over to the io thread, which serves forks to a
//! fuzzing engine. Every child injects one input into registers and guest
//! memory and replays from the snapshot.

use thiserror::Error;

pub mod utils;

pub mod access;
pub mod config;
pub mod descriptor;
pub mod emu;
pub mod fork;
pub mod harness;
pub mod input;
pub mod runtime;
pub mod sched;

pub use config::Config;
pub use runtime::{start, RunOutcome, Runtime};

#[derive(Debug, Error)]
pub enum Error {
    #[error("config: {0}")]
    Config(#[from] config::ConfigError),
    #[error("access surface: {0}")]
    Access(#[from] access::AccessError),
    #[error("descriptor: {0}")]
    Descriptor(#[from] descriptor::DescriptorError),
    #[error("scheduler: {0}")]
    Sched(#[from] sched::SchedError),
    #[error("handoff: {0}")]
    Handoff(#[from] fork::HandoffError),
    #[error("fork server: {0}")]
    ForkServer(#[from] fork::ForkServerError),
    #[error("failed to read input: {0}")]
    Input(std::io::Error),
}
