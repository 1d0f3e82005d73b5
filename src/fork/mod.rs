//! Transition from continuous emulation to fork-per-input replay.
//!
//! The lifecycle is `Armed -> HandoffRequested -> ChildResumed` and every
//! step checks the state it starts from:
//!
//! 1. the cpu thread hits the entry point, moves the cpu list into the
//!    restart slot and calls [`Handoff::request`], which sends `FORK` once;
//! 2. the io thread joins the cpu threads, takes the restart cpus from
//!    [`Handoff::wait_request`] and runs the fork server;
//! 3. each forked child calls [`Handoff::resume_child`] before the restart
//!    cpus go back into the scheduler.

use std::fmt;
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::sched::VirtualCpu;

pub mod channel;
pub mod server;

pub use channel::{ChannelError, ControlChannel, FORK_MSG};
pub use server::{
    install_signal_handler, AflLink, EngineLink, ForkPrimitive, ForkRole, ForkServer,
    ForkServerError, Forked, NixFork,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandoffState {
    Armed,
    HandoffRequested,
    ChildResumed,
}

impl fmt::Display for HandoffState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HandoffState::Armed => "armed",
            HandoffState::HandoffRequested => "handoff requested",
            HandoffState::ChildResumed => "child resumed",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Error)]
pub enum HandoffError {
    #[error("handoff already requested (state: {0})")]
    AlreadyRequested(HandoffState),
    #[error("fork requested with no pending snapshot (state: {0})")]
    NoPendingSnapshot(HandoffState),
    #[error("entry point reached with an empty cpu list")]
    NoRestartCpu,
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

struct Inner {
    state: HandoffState,
    restart: Vec<Arc<VirtualCpu>>,
}

pub struct Handoff {
    inner: Mutex<Inner>,
    channel: ControlChannel,
}

impl Handoff {
    pub fn new() -> Result<Self, HandoffError> {
        Ok(Self::with_channel(ControlChannel::new()?))
    }

    pub fn with_channel(channel: ControlChannel) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: HandoffState::Armed,
                restart: Vec::new(),
            }),
            channel,
        }
    }

    pub fn state(&self) -> HandoffState {
        self.inner.lock().unwrap().state
    }

    /// Cpu thread side: park `restart` and notify the io thread. Must be
    /// called with the global lock held, right after the cpu list was
    /// drained.
    pub fn request(&self, restart: Vec<Arc<VirtualCpu>>) -> Result<(), HandoffError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != HandoffState::Armed {
            return Err(HandoffError::AlreadyRequested(inner.state));
        }
        if restart.is_empty() {
            return Err(HandoffError::NoRestartCpu);
        }
        log::info!(
            "entry point hit, handing {} cpu(s) over to the fork server",
            restart.len()
        );
        inner.restart = restart;
        inner.state = HandoffState::HandoffRequested;
        // the state moved first, a failed write is fatal either way
        self.channel.notify()?;
        Ok(())
    }

    /// Io thread side: block until the cpu thread asks for the fork, then
    /// hand out the restart cpus.
    pub fn wait_request(&self) -> Result<Vec<Arc<VirtualCpu>>, HandoffError> {
        self.channel.recv()?;
        let inner = self.inner.lock().unwrap();
        if inner.state != HandoffState::HandoffRequested || inner.restart.is_empty() {
            return Err(HandoffError::NoPendingSnapshot(inner.state));
        }
        log::debug!("fork request received, pid {}", std::process::id());
        Ok(inner.restart.clone())
    }

    /// Child side: reset the restart cpus for the replay.
    pub fn resume_child(&self) -> Result<Vec<Arc<VirtualCpu>>, HandoffError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != HandoffState::HandoffRequested {
            return Err(HandoffError::NoPendingSnapshot(inner.state));
        }
        for cpu in inner.restart.iter() {
            cpu.reset_for_resume();
        }
        inner.state = HandoffState::ChildResumed;
        Ok(std::mem::take(&mut inner.restart))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpus(n: usize) -> Vec<Arc<VirtualCpu>> {
        (0..n).map(|i| Arc::new(VirtualCpu::new(i))).collect()
    }

    #[test]
    fn lifecycle() {
        let h = Handoff::new().unwrap();
        assert_eq!(h.state(), HandoffState::Armed);
        let restart = cpus(1);
        restart[0].kick();
        restart[0].request_stop();
        h.request(restart).unwrap();
        assert_eq!(h.state(), HandoffState::HandoffRequested);

        let got = h.wait_request().unwrap();
        assert_eq!(got.len(), 1);

        let resumed = h.resume_child().unwrap();
        assert_eq!(h.state(), HandoffState::ChildResumed);
        assert!(resumed[0].can_run());
        assert!(!resumed[0].exit_requested());
    }

    #[test]
    fn child_keeps_halted_secondary() {
        let h = Handoff::new().unwrap();
        let restart = cpus(2);
        restart[1].set_halted(true);
        h.request(restart).unwrap();
        h.wait_request().unwrap();

        let resumed = h.resume_child().unwrap();
        assert!(!resumed[0].is_halted());
        assert!(resumed[1].is_halted());
        assert!(resumed.iter().all(|c| c.can_run()));
    }

    #[test]
    fn second_request_is_rejected() {
        let h = Handoff::new().unwrap();
        h.request(cpus(1)).unwrap();
        assert!(matches!(
            h.request(cpus(1)),
            Err(HandoffError::AlreadyRequested(HandoffState::HandoffRequested))
        ));
    }

    #[test]
    fn resume_without_request() {
        let h = Handoff::new().unwrap();
        assert!(matches!(
            h.resume_child(),
            Err(HandoffError::NoPendingSnapshot(HandoffState::Armed))
        ));
        assert!(matches!(h.request(Vec::new()), Err(HandoffError::NoRestartCpu)));
        assert_eq!(h.state(), HandoffState::Armed);
    }

    #[test]
    fn stray_message_without_snapshot() {
        let ch = ControlChannel::new().unwrap();
        ch.notify().unwrap();
        let h = Handoff::with_channel(ch);
        assert!(matches!(
            h.wait_request(),
            Err(HandoffError::NoPendingSnapshot(HandoffState::Armed))
        ));
    }
}
