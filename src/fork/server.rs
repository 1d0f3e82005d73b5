//! Fork server: block for the engine, fork one child per input, report how
//! the child ended, repeat. Only children return from [`ForkServer::run`]
//! into the replay path.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::{FromRawFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};

use nix::sys::signal::{kill, signal, SigHandler, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use thiserror::Error;

use crate::utils::{setup_signal_handler, stop_soon};

/// Engine side control descriptor, the status descriptor is the next one.
pub const FORKSRV_FD: RawFd = 198;

/// Pid of the child currently running, 0 if none.
static CHILD_PID: AtomicI32 = AtomicI32::new(0);

#[derive(Debug, Error)]
pub enum ForkServerError {
    #[error("engine link: {0}")]
    Link(#[from] io::Error),
    #[error("fork: {0}")]
    Sys(#[from] nix::Error),
}

/// Wire protocol towards the fuzzing engine.
pub trait EngineLink {
    /// Announce the fork server. An error means no engine is attached.
    fn hello(&mut self) -> io::Result<()>;

    /// Block until the engine wants the next run. `None` once the engine
    /// went away.
    fn next_run(&mut self) -> io::Result<Option<u32>>;

    fn report_pid(&mut self, pid: i32) -> io::Result<()>;

    fn report_status(&mut self, status: i32) -> io::Result<()>;

    /// Called in the child, which must not keep the engine descriptors.
    fn close(&mut self) {}
}

/// AFL fork server protocol on descriptors 198 and 199, native endian
/// 32 bit words.
pub struct AflLink {
    ctl: Option<File>,
    st: Option<File>,
}

impl AflLink {
    pub fn new() -> Self {
        Self::with_fds(FORKSRV_FD, FORKSRV_FD + 1)
    }

    pub fn with_fds(ctl: RawFd, st: RawFd) -> Self {
        // Safety: both descriptors are handed to us by the engine and owned
        // by this link from now on.
        let (ctl, st) = unsafe { (File::from_raw_fd(ctl), File::from_raw_fd(st)) };
        Self {
            ctl: Some(ctl),
            st: Some(st),
        }
    }

    fn write_word(&mut self, val: i32) -> io::Result<()> {
        match self.st.as_mut() {
            Some(st) => st.write_all(&val.to_ne_bytes()),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }
}

impl Default for AflLink {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineLink for AflLink {
    fn hello(&mut self) -> io::Result<()> {
        self.write_word(0)
    }

    fn next_run(&mut self) -> io::Result<Option<u32>> {
        let ctl = match self.ctl.as_mut() {
            Some(c) => c,
            None => return Ok(None),
        };
        let mut buf = [0u8; 4];
        match ctl.read_exact(&mut buf) {
            Ok(()) => Ok(Some(u32::from_ne_bytes(buf))),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn report_pid(&mut self, pid: i32) -> io::Result<()> {
        self.write_word(pid)
    }

    fn report_status(&mut self, status: i32) -> io::Result<()> {
        self.write_word(status)
    }

    fn close(&mut self) {
        self.ctl = None;
        self.st = None;
    }
}

pub enum Forked {
    Parent(i32),
    Child,
}

/// Process creation, so the loop can be driven without forking.
pub trait ForkPrimitive {
    fn fork(&mut self) -> Result<Forked, ForkServerError>;

    /// Wait for `child`, returning its raw wait status.
    fn wait(&mut self, child: i32) -> Result<i32, ForkServerError>;
}

pub struct NixFork;

impl ForkPrimitive for NixFork {
    fn fork(&mut self) -> Result<Forked, ForkServerError> {
        // Safety: the cpu threads were joined and the kick timer stopped. The
        // signal watcher from `install_signal_handler` is still alive and may
        // hold the logger lock, but only once a termination signal arrived,
        // at which point the server stops forking and kills the running child.
        #[allow(unused_unsafe)]
        let forked = unsafe { fork() }?;
        match forked {
            ForkResult::Parent { child } => Ok(Forked::Parent(child.as_raw())),
            ForkResult::Child => {
                // the parent's signal handling thread did not survive the fork
                for sig in [Signal::SIGTERM, Signal::SIGINT, Signal::SIGQUIT].iter() {
                    let _ = unsafe { signal(*sig, SigHandler::SigDfl) };
                }
                Ok(Forked::Child)
            }
        }
    }

    fn wait(&mut self, child: i32) -> Result<i32, ForkServerError> {
        let status = waitpid(Pid::from_raw(child), None)?;
        Ok(raw_status(status))
    }
}

/// Encode a wait status the way `waitpid(2)` reports it.
pub fn raw_status(status: WaitStatus) -> i32 {
    match status {
        WaitStatus::Exited(_, code) => (code & 0xff) << 8,
        WaitStatus::Signaled(_, sig, core) => (sig as i32) | (if core { 0x80 } else { 0 }),
        WaitStatus::Stopped(_, sig) => ((sig as i32) << 8) | 0x7f,
        _ => 0,
    }
}

/// Stop serving on a termination signal and take the running child down.
pub fn install_signal_handler() -> io::Result<()> {
    setup_signal_handler(|| {
        let pid = CHILD_PID.load(Ordering::SeqCst);
        if pid > 0 {
            let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
        }
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkRole {
    /// The server stopped, after `runs` children.
    Parent { runs: u64 },
    /// This process is a fresh child and should run one replay.
    Child,
}

pub struct ForkServer<L, F> {
    link: L,
    forker: F,
    runs: u64,
}

impl<L: EngineLink, F: ForkPrimitive> ForkServer<L, F> {
    pub fn new(link: L, forker: F) -> Self {
        Self {
            link,
            forker,
            runs: 0,
        }
    }

    pub fn runs(&self) -> u64 {
        self.runs
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn run(&mut self) -> Result<ForkRole, ForkServerError> {
        if let Err(e) = self.link.hello() {
            log::warn!("no fuzzing engine attached ({}), running a single replay", e);
            return Ok(ForkRole::Child);
        }
        log::info!("fork server up, pid {}", std::process::id());

        loop {
            if stop_soon() {
                break;
            }
            if self.link.next_run()?.is_none() {
                log::info!("engine closed the control descriptor");
                break;
            }
            match self.forker.fork()? {
                Forked::Child => {
                    self.link.close();
                    return Ok(ForkRole::Child);
                }
                Forked::Parent(pid) => {
                    CHILD_PID.store(pid, Ordering::SeqCst);
                    self.link.report_pid(pid)?;
                    let status = self.forker.wait(pid);
                    CHILD_PID.store(0, Ordering::SeqCst);
                    let status = status?;
                    self.link.report_status(status)?;
                    self.runs += 1;
                    log::trace!("child {} done, status {:#x}", pid, status);
                }
            }
        }
        log::info!("fork server done after {} runs", self.runs);
        Ok(ForkRole::Parent { runs: self.runs })
    }
}
