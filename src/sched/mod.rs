//! Cpu scheduling: the round-robin loop multiplexing every cpu on one host
//! thread, or one thread per cpu.
//!
//! [`SchedContext`] owns what the loops share. Its cpu list mutex doubles as
//! the global lock, cpu threads drop it around guest execution only.

use std::fmt;
use std::io;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;

use crate::emu::Emulator;
use crate::fork::{Handoff, HandoffError};

pub mod cpu;
pub mod kick;
pub mod mttcg;
pub mod rr;

pub use cpu::{CpuList, VirtualCpu};
pub use kick::{CurrentCpu, KickTimer, DEFAULT_KICK_PERIOD};

#[derive(Debug, Error)]
pub enum SchedError {
    #[error(transparent)]
    Handoff(#[from] HandoffError),
    #[error("failed to spawn cpu thread: {0}")]
    Spawn(io::Error),
    #[error("cpu thread '{0}' panicked")]
    Panicked(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedMode {
    /// Every cpu on a single host thread, switched by the kick timer.
    RoundRobin,
    /// One host thread per cpu.
    MultiThread,
}

impl Default for SchedMode {
    fn default() -> Self {
        SchedMode::RoundRobin
    }
}

impl fmt::Display for SchedMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedMode::RoundRobin => write!(f, "rr"),
            SchedMode::MultiThread => write!(f, "mttcg"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown scheduler '{0}', expected rr or mttcg")]
pub struct UnknownSchedMode(pub String);

impl FromStr for SchedMode {
    type Err = UnknownSchedMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rr" => Ok(SchedMode::RoundRobin),
            "mttcg" => Ok(SchedMode::MultiThread),
            _ => Err(UnknownSchedMode(s.to_string())),
        }
    }
}

/// Why a cpu loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoopExit {
    Shutdown,
    /// The entry point was hit, the io thread takes over.
    Handoff,
    /// A forked child finished its replay.
    ReplayEnd,
    /// The cpu owned by this thread was unplugged.
    Unplugged,
}

#[derive(Debug, Clone)]
pub struct SchedOptions {
    pub mode: SchedMode,
    pub kick_period: Duration,
    /// Guest address that triggers the fork handoff.
    pub entry: Option<u64>,
}

impl Default for SchedOptions {
    fn default() -> Self {
        Self {
            mode: SchedMode::default(),
            kick_period: DEFAULT_KICK_PERIOD,
            entry: None,
        }
    }
}

type CpuThread = JoinHandle<Result<LoopExit, SchedError>>;

pub struct SchedContext {
    cpus: Mutex<CpuList>,
    halt: Condvar,
    current: Arc<CurrentCpu>,
    kick: KickTimer,
    handoff: Handoff,
    opts: SchedOptions,
    fork_child: AtomicBool,
    leave: Mutex<Option<LoopExit>>,
    threads: Mutex<Vec<(String, CpuThread)>>,
}

impl SchedContext {
    pub fn new(cpus: Vec<Arc<VirtualCpu>>, opts: SchedOptions) -> Result<Arc<Self>, SchedError> {
        Ok(Self::with_handoff(cpus, opts, Handoff::new()?))
    }

    pub fn with_handoff(
        cpus: Vec<Arc<VirtualCpu>>,
        opts: SchedOptions,
        handoff: Handoff,
    ) -> Arc<Self> {
        let current = Arc::new(CurrentCpu::default());
        let current1 = Arc::clone(&current);
        let kick = KickTimer::new(opts.kick_period, move || current1.kick());
        Arc::new(Self {
            cpus: Mutex::new(CpuList::new(cpus)),
            halt: Condvar::new(),
            current,
            kick,
            handoff,
            opts,
            fork_child: AtomicBool::new(false),
            leave: Mutex::new(None),
            threads: Mutex::new(Vec::new()),
        })
    }

    /// Take the global lock.
    pub fn lock(&self) -> MutexGuard<'_, CpuList> {
        self.cpus.lock().unwrap()
    }

    pub fn handoff(&self) -> &Handoff {
        &self.handoff
    }

    pub fn kick_timer(&self) -> &KickTimer {
        &self.kick
    }

    pub fn current(&self) -> Option<Arc<VirtualCpu>> {
        self.current.get()
    }

    pub fn mode(&self) -> SchedMode {
        self.opts.mode
    }

    pub fn is_fork_child(&self) -> bool {
        self.fork_child.load(Ordering::SeqCst)
    }

    /// Entry address to watch for, none once running as a forked child.
    pub fn entry_watch(&self) -> Option<u64> {
        if self.is_fork_child() {
            None
        } else {
            self.opts.entry
        }
    }

    /// Set when the cpu loops should return.
    pub fn leave_reason(&self) -> Option<LoopExit> {
        *self.leave.lock().unwrap()
    }

    /// Release every cpu after machine setup.
    pub fn machine_start(&self) {
        let list = self.lock();
        for cpu in list.iter() {
            cpu.resume();
        }
        self.halt.notify_all();
    }

    /// Mark `cpu` runnable again, e.g. after an interrupt was raised.
    pub fn wake_cpu(&self, cpu: &VirtualCpu) {
        let _list = self.lock();
        cpu.set_halted(false);
        cpu.kick();
        self.halt.notify_all();
    }

    /// Hot-unplug `cpu`. Its thread, or the round-robin sweep, removes it
    /// from the list once it stopped.
    pub fn unplug_cpu(&self, cpu: &VirtualCpu) {
        let _list = self.lock();
        cpu.request_unplug();
        self.halt.notify_all();
    }

    /// Ask every cpu loop to return at its next scheduling boundary.
    pub fn request_shutdown(&self) {
        let list = self.lock();
        self.leave_with(&list, LoopExit::Shutdown);
    }

    /// Record `why` unless a reason is already set, and kick every cpu out.
    pub(crate) fn leave_with(&self, list: &CpuList, why: LoopExit) {
        self.leave.lock().unwrap().get_or_insert(why);
        for cpu in list.iter() {
            cpu.kick();
        }
        self.kick.disarm();
        self.halt.notify_all();
    }

    pub(crate) fn start_kick(&self, list: &CpuList) {
        if list.len() > 1 {
            self.kick.arm();
        }
    }

    pub(crate) fn set_current(&self, cpu: Option<Arc<VirtualCpu>>) {
        self.current.set(cpu);
    }

    pub(crate) fn wait_halt<'a>(
        &'a self,
        list: MutexGuard<'a, CpuList>,
    ) -> MutexGuard<'a, CpuList> {
        self.halt.wait(list).unwrap()
    }

    /// Sleep while every cpu is idle, then process pending work of all cpus.
    pub(crate) fn wait_io_event<'a>(
        &'a self,
        mut list: MutexGuard<'a, CpuList>,
    ) -> MutexGuard<'a, CpuList> {
        while list.all_idle() && self.leave_reason().is_none() {
            self.kick.disarm();
            list = self.halt.wait(list).unwrap();
        }
        self.start_kick(&list);
        for cpu in list.iter() {
            cpu.process_io_event();
        }
        list
    }

    /// Per-cpu flavour of [`SchedContext::wait_io_event`].
    pub(crate) fn wait_cpu_io_event<'a>(
        &'a self,
        mut list: MutexGuard<'a, CpuList>,
        cpu: &VirtualCpu,
    ) -> MutexGuard<'a, CpuList> {
        while cpu.is_idle() && self.leave_reason().is_none() {
            list = self.halt.wait(list).unwrap();
        }
        cpu.process_io_event();
        list
    }

    /// Tear down the first cpu that is unplugged and done running.
    pub(crate) fn deal_with_unplugged(&self, list: &mut CpuList) {
        let gone = list
            .iter()
            .find(|c| c.unplug_requested() && !c.can_run())
            .cloned();
        if let Some(cpu) = gone {
            list.remove(&cpu);
            cpu.release();
            log::info!("cpu {} unplugged", cpu.index());
        }
    }

    /// Entry point reached on a cpu thread: move the cpu list into the
    /// restart slot, notify the io thread and make every cpu loop return.
    pub(crate) fn enter_handoff(
        &self,
        mut list: MutexGuard<'_, CpuList>,
    ) -> Result<LoopExit, SchedError> {
        if let Some(why) = self.leave_reason() {
            return Ok(why);
        }
        let restart = list.drain();
        self.current.set(None);
        self.leave_with(&CpuList::new(restart.clone()), LoopExit::Handoff);
        for cpu in restart.iter() {
            cpu.release();
        }
        self.handoff.request(restart)?;
        Ok(LoopExit::Handoff)
    }

    /// Start the cpu threads for the configured mode.
    pub fn spawn_cpus(self: &Arc<Self>, emu: Arc<dyn Emulator>) -> Result<(), SchedError> {
        let mut threads = self.threads.lock().unwrap();
        match self.opts.mode {
            SchedMode::RoundRobin => {
                self.kick.start();
                let name = "ALL CPUs/TCG".to_string();
                let ctx = Arc::clone(self);
                let h = thread::Builder::new()
                    .name(name.clone())
                    .spawn(move || rr::rr_cpu_loop(&ctx, &*emu))
                    .map_err(SchedError::Spawn)?;
                threads.push((name, h));
            }
            SchedMode::MultiThread => {
                let cpus = self.lock().iter().cloned().collect::<Vec<_>>();
                for cpu in cpus {
                    let name = format!("CPU {}/TCG", cpu.index());
                    let ctx = Arc::clone(self);
                    let emu = Arc::clone(&emu);
                    let h = thread::Builder::new()
                        .name(name.clone())
                        .spawn(move || mttcg::mttcg_cpu_loop(&ctx, &*emu, cpu))
                        .map_err(SchedError::Spawn)?;
                    threads.push((name, h));
                }
            }
        }
        log::debug!("{} cpu thread(s) started ({})", threads.len(), self.opts.mode);
        Ok(())
    }

    /// Join every cpu thread started so far.
    pub fn join_cpus(&self) -> Vec<Result<LoopExit, SchedError>> {
        let threads = std::mem::take(&mut *self.threads.lock().unwrap());
        threads
            .into_iter()
            .map(|(name, h)| match h.join() {
                Ok(r) => r,
                Err(_) => Err(SchedError::Panicked(name)),
            })
            .collect()
    }

    /// Make the process safe to fork: no thread but the caller may hold a
    /// lock at that point.
    pub fn prepare_fork(&self) -> Vec<Result<LoopExit, SchedError>> {
        let exits = self.join_cpus();
        self.kick.stop();
        exits
    }

    /// Child side of the fork: reinstall the restart cpus and clear the
    /// handoff's leave request so new cpu threads can run them. The kick
    /// timer comes back with [`SchedContext::spawn_cpus`].
    pub fn resume_after_fork(&self, restart: Vec<Arc<VirtualCpu>>) {
        self.fork_child.store(true, Ordering::SeqCst);
        let mut list = self.lock();
        let stale = list.replace(restart);
        debug_assert!(stale.is_empty());
        *self.leave.lock().unwrap() = None;
        self.halt.notify_all();
    }
}
