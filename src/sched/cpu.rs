use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

/// Work queued for a cpu, run on its owning thread at the next io event.
pub type CpuWork = Box<dyn FnOnce(&VirtualCpu) + Send>;

/// One emulated execution context.
///
/// Flags are atomics so a kick can land from any thread; everything else is
/// only touched with the global lock held.
pub struct VirtualCpu {
    index: usize,
    exit_request: AtomicBool,
    halted: AtomicBool,
    stop: AtomicBool,
    stopped: AtomicBool,
    unplug: AtomicBool,
    owner: Mutex<Option<ThreadId>>,
    work: Mutex<VecDeque<CpuWork>>,
}

impl VirtualCpu {
    /// A new cpu starts stopped, the machine start releases it.
    pub fn new(index: usize) -> Self {
        Self {
            index,
            exit_request: AtomicBool::new(false),
            halted: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            stopped: AtomicBool::new(true),
            unplug: AtomicBool::new(false),
            owner: Mutex::new(None),
            work: Mutex::new(VecDeque::new()),
        }
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Ask the cpu to leave guest code at the next opportunity.
    pub fn kick(&self) {
        self.exit_request.store(true, Ordering::SeqCst);
    }

    pub fn exit_requested(&self) -> bool {
        self.exit_request.load(Ordering::SeqCst)
    }

    pub fn clear_exit_request(&self) {
        self.exit_request.store(false, Ordering::SeqCst);
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub fn set_halted(&self, halted: bool) {
        self.halted.store(halted, Ordering::SeqCst);
    }

    /// Let a stopped cpu run, as the machine start does.
    pub fn resume(&self) {
        self.stop.store(false, Ordering::SeqCst);
        self.stopped.store(false, Ordering::SeqCst);
    }

    /// Request a stop. Acknowledged by the owning thread at the next io
    /// event.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.kick();
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn request_unplug(&self) {
        self.unplug.store(true, Ordering::SeqCst);
        self.request_stop();
    }

    pub fn unplug_requested(&self) -> bool {
        self.unplug.load(Ordering::SeqCst)
    }

    pub fn can_run(&self) -> bool {
        !self.stop_requested() && !self.is_stopped()
    }

    pub fn has_work(&self) -> bool {
        !self.work.lock().unwrap().is_empty()
    }

    /// Nothing to do until something external wakes the cpu.
    pub fn is_idle(&self) -> bool {
        if self.stop_requested() || self.has_work() {
            return false;
        }
        self.is_stopped() || self.is_halted()
    }

    pub fn queue_work<F>(&self, f: F)
    where
        F: FnOnce(&VirtualCpu) + Send + 'static,
    {
        self.work.lock().unwrap().push_back(Box::new(f));
        self.kick();
    }

    /// Acknowledge a stop request and drain queued work. Runs on the owning
    /// thread with the global lock held.
    pub fn process_io_event(&self) {
        if self.stop.swap(false, Ordering::SeqCst) {
            self.stopped.store(true, Ordering::SeqCst);
        }
        loop {
            let w = self.work.lock().unwrap().pop_front();
            match w {
                Some(w) => w(self),
                None => break,
            }
        }
    }

    pub fn owner(&self) -> Option<ThreadId> {
        *self.owner.lock().unwrap()
    }

    /// Record the calling thread as the cpu's owner.
    pub fn claim(&self) {
        *self.owner.lock().unwrap() = Some(thread::current().id());
    }

    pub fn release(&self) {
        *self.owner.lock().unwrap() = None;
    }

    /// Clear the bookkeeping inherited across a fork, so the scheduler picks
    /// the cpu up right after the entry point. Halt is guest state and stays
    /// as snapshotted, only [`super::SchedContext::wake_cpu`] clears it.
    pub fn reset_for_resume(&self) {
        self.clear_exit_request();
        self.stop.store(false, Ordering::SeqCst);
        self.stopped.store(false, Ordering::SeqCst);
        self.release();
    }
}

impl fmt::Debug for VirtualCpu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualCpu")
            .field("index", &self.index)
            .field("exit_request", &self.exit_requested())
            .field("halted", &self.is_halted())
            .field("stop", &self.stop_requested())
            .field("stopped", &self.is_stopped())
            .field("unplug", &self.unplug_requested())
            .finish()
    }
}

/// Ordered cpu list, guarded by the global lock of [`super::SchedContext`].
#[derive(Debug, Default)]
pub struct CpuList {
    cpus: Vec<Arc<VirtualCpu>>,
}

impl CpuList {
    pub fn new(cpus: Vec<Arc<VirtualCpu>>) -> Self {
        Self { cpus }
    }

    pub fn len(&self) -> usize {
        self.cpus.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cpus.is_empty()
    }

    pub fn push(&mut self, cpu: Arc<VirtualCpu>) {
        self.cpus.push(cpu);
    }

    pub fn first(&self) -> Option<Arc<VirtualCpu>> {
        self.cpus.first().cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<VirtualCpu>> {
        self.cpus.iter()
    }

    pub fn contains(&self, cpu: &Arc<VirtualCpu>) -> bool {
        self.cpus.iter().any(|c| Arc::ptr_eq(c, cpu))
    }

    /// Entry after `cpu`, `None` at the end of the list or if `cpu` is gone.
    pub fn next_after(&self, cpu: &Arc<VirtualCpu>) -> Option<Arc<VirtualCpu>> {
        let pos = self.cpus.iter().position(|c| Arc::ptr_eq(c, cpu))?;
        self.cpus.get(pos + 1).cloned()
    }

    /// Take every entry out, leaving the list empty.
    pub fn drain(&mut self) -> Vec<Arc<VirtualCpu>> {
        std::mem::take(&mut self.cpus)
    }

    /// Swap in a new set of cpus, returning the old one.
    pub fn replace(&mut self, cpus: Vec<Arc<VirtualCpu>>) -> Vec<Arc<VirtualCpu>> {
        std::mem::replace(&mut self.cpus, cpus)
    }

    pub fn remove(&mut self, cpu: &Arc<VirtualCpu>) -> bool {
        let before = self.cpus.len();
        self.cpus.retain(|c| !Arc::ptr_eq(c, cpu));
        before != self.cpus.len()
    }

    pub fn all_idle(&self) -> bool {
        self.cpus.iter().all(|c| c.is_idle())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn stop_and_resume() {
        let cpu = VirtualCpu::new(0);
        assert!(!cpu.can_run());
        assert!(cpu.is_idle());
        cpu.resume();
        assert!(cpu.can_run());
        assert!(!cpu.is_idle());

        cpu.request_stop();
        assert!(!cpu.can_run());
        assert!(cpu.exit_requested());
        cpu.process_io_event();
        assert!(cpu.is_stopped());
        assert!(!cpu.stop_requested());

        cpu.reset_for_resume();
        assert!(cpu.can_run());
        assert!(!cpu.exit_requested());
    }

    #[test]
    fn halted_is_idle() {
        let cpu = VirtualCpu::new(0);
        cpu.resume();
        cpu.set_halted(true);
        assert!(cpu.is_idle());
        cpu.queue_work(|_| {});
        assert!(!cpu.is_idle());
    }

    #[test]
    fn halt_survives_resume_reset() {
        let cpu = VirtualCpu::new(1);
        cpu.resume();
        cpu.set_halted(true);
        cpu.request_stop();
        cpu.process_io_event();

        cpu.reset_for_resume();
        assert!(cpu.can_run());
        assert!(!cpu.exit_requested());
        assert!(cpu.is_halted());
        assert!(cpu.is_idle());
    }

    #[test]
    fn queued_work_runs_once() {
        let cpu = VirtualCpu::new(3);
        let hits = Arc::new(AtomicUsize::new(0));
        let hits1 = Arc::clone(&hits);
        cpu.queue_work(move |c| {
            assert_eq!(c.index(), 3);
            hits1.fetch_add(1, Ordering::SeqCst);
        });
        assert!(cpu.exit_requested());
        cpu.process_io_event();
        cpu.process_io_event();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!cpu.has_work());
    }

    #[test]
    fn list_order() {
        let a = Arc::new(VirtualCpu::new(0));
        let b = Arc::new(VirtualCpu::new(1));
        let mut list = CpuList::new(vec![Arc::clone(&a), Arc::clone(&b)]);
        assert!(Arc::ptr_eq(&list.next_after(&a).unwrap(), &b));
        assert!(list.next_after(&b).is_none());

        let old = list.replace(vec![Arc::clone(&b)]);
        assert_eq!(old.len(), 2);
        assert!(list.next_after(&a).is_none());
        assert!(list.remove(&b));
        assert!(!list.remove(&b));
        assert!(list.is_empty());
        assert!(list.all_idle());
    }

    #[test]
    fn ownership() {
        let cpu = VirtualCpu::new(0);
        assert_eq!(cpu.owner(), None);
        cpu.claim();
        assert_eq!(cpu.owner(), Some(thread::current().id()));
        cpu.reset_for_resume();
        assert_eq!(cpu.owner(), None);
    }
}
