//! Io thread side of the fuzzing run: start the machine, take over at the
//! entry point, serve forks and drive one replay per child.

use std::sync::Arc;

use crate::access::AccessSurface;
use crate::config::Config;
use crate::emu::Emulator;
use crate::fork::{
    install_signal_handler, AflLink, EngineLink, ForkPrimitive, ForkRole, ForkServer, NixFork,
};
use crate::harness::Harness;
use crate::input::{FuzzInput, InputSource};
use crate::sched::{LoopExit, SchedContext, SchedError, VirtualCpu};
use crate::utils::fatal;
use crate::Error;

/// How [`Runtime::run`] ended in this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The cpu loops returned without ever reaching the entry point.
    NoHandoff(Vec<LoopExit>),
    /// Fork server parent, done after `runs` children.
    Served { runs: u64 },
    /// Forked child, its replay ended.
    Replayed(LoopExit),
}

pub struct Runtime {
    ctx: Arc<SchedContext>,
    emu: Arc<dyn Emulator>,
    harness: Box<dyn Harness>,
    guest: AccessSurface,
    input: InputSource,
}

impl Runtime {
    pub fn new(
        conf: &Config,
        emu: Arc<dyn Emulator>,
        cpus: Vec<Arc<VirtualCpu>>,
        guest: AccessSurface,
    ) -> Result<Self, Error> {
        let harness = conf.build_harness()?;
        log::info!(
            "harness: {}, scheduler: {}, entry: {}",
            harness.name(),
            conf.sched_mode,
            conf.entry
                .map(|e| format!("{:#x}", e))
                .unwrap_or_else(|| "none".to_string())
        );
        let ctx = SchedContext::new(cpus, conf.sched_options())?;
        Ok(Self::with_parts(ctx, emu, harness, guest, conf.input.clone()))
    }

    pub fn with_parts(
        ctx: Arc<SchedContext>,
        emu: Arc<dyn Emulator>,
        harness: Box<dyn Harness>,
        guest: AccessSurface,
        input: InputSource,
    ) -> Self {
        Self {
            ctx,
            emu,
            harness,
            guest,
            input,
        }
    }

    pub fn context(&self) -> &Arc<SchedContext> {
        &self.ctx
    }

    /// Run the machine until the entry point, then serve forks through
    /// `server`. Returns in the parent once the engine is gone, and in a
    /// child once its replay ended.
    pub fn run<L: EngineLink, F: ForkPrimitive>(
        &self,
        server: &mut ForkServer<L, F>,
    ) -> Result<RunOutcome, Error> {
        self.ctx.machine_start();
        self.ctx.spawn_cpus(Arc::clone(&self.emu))?;

        // cpu threads are gone and the kick timer is stopped past this point,
        // only the io thread and the signal watcher remain
        let exits = collect(self.ctx.prepare_fork())?;
        if !exits.contains(&LoopExit::Handoff) {
            return Ok(RunOutcome::NoHandoff(exits));
        }
        let restart = self.ctx.handoff().wait_request()?;
        log::debug!("snapshot taken with {} cpu(s)", restart.len());

        match server.run()? {
            ForkRole::Parent { runs } => Ok(RunOutcome::Served { runs }),
            ForkRole::Child => self.replay().map(RunOutcome::Replayed),
        }
    }

    /// Child side: inject the input into the restart cpu, then let the
    /// scheduler run it until the replay ends.
    fn replay(&self) -> Result<LoopExit, Error> {
        let restart = self.ctx.handoff().resume_child()?;
        let data = self.input.read().map_err(Error::Input)?;
        if let Some(cpu) = restart.first() {
            self.inject(cpu, &data);
        }

        self.ctx.resume_after_fork(restart);
        self.ctx.spawn_cpus(Arc::clone(&self.emu))?;
        let exits = collect(self.ctx.join_cpus())?;
        Ok(if exits.contains(&LoopExit::ReplayEnd) {
            LoopExit::ReplayEnd
        } else {
            exits.first().copied().unwrap_or(LoopExit::Unplugged)
        })
    }

    /// Apply the harness to `cpu`'s registers and guest memory.
    pub fn inject(&self, cpu: &VirtualCpu, data: &[u8]) {
        let mut regs = self.emu.read_regs(cpu);
        let mut input = FuzzInput::new(data);
        self.harness.apply(&mut regs, &mut input, &self.guest);
        log::trace!(
            "cpu {}: {} of {} input bytes used",
            cpu.index(),
            input.cursor(),
            input.len()
        );
        self.emu.write_regs(cpu, &regs);
    }
}

fn collect(exits: Vec<Result<LoopExit, SchedError>>) -> Result<Vec<LoopExit>, SchedError> {
    exits.into_iter().collect()
}

/// Process entry for an emulator embedding the fuzzer: never returns into
/// the emulator once a fork server ran.
///
/// Configuration and handoff errors are fatal. A child whose replay ended
/// exits with status 0 right away, skipping destructors, so the parent sees
/// a plain exit.
pub fn start(
    conf: Config,
    emu: Arc<dyn Emulator>,
    cpus: Vec<Arc<VirtualCpu>>,
    guest: AccessSurface,
) {
    let rt = match Runtime::new(&conf, emu, cpus, guest) {
        Ok(rt) => rt,
        Err(e) => fatal("failed to set up", e),
    };
    if conf.entry.is_some() {
        if let Err(e) = install_signal_handler() {
            log::warn!("failed to watch termination signals: {}", e);
        }
    }

    let mut server = ForkServer::new(AflLink::new(), NixFork);
    match rt.run(&mut server) {
        Ok(RunOutcome::Replayed(why)) => {
            log::trace!("replay done: {:?}", why);
            std::process::exit(0)
        }
        Ok(RunOutcome::Served { runs }) => log::info!("fork server stopped after {} runs", runs),
        Ok(RunOutcome::NoHandoff(exits)) => log::info!("machine stopped: {:?}", exits),
        Err(e) => fatal("fuzzing run aborted", e),
    }
}
