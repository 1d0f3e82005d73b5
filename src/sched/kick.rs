//! Periodic kick that moves single threaded emulation on to the next cpu.
//!
//! The timer is disarmed while every cpu is idle and rearmed once one of
//! them has work again.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::cpu::VirtualCpu;

pub const DEFAULT_KICK_PERIOD: Duration = Duration::from_millis(100);

/// The cpu the round-robin loop is currently running. Read without the
/// global lock, a stale value only costs a redundant kick.
#[derive(Debug, Default)]
pub struct CurrentCpu {
    cpu: Mutex<Option<Arc<VirtualCpu>>>,
}

impl CurrentCpu {
    pub fn set(&self, cpu: Option<Arc<VirtualCpu>>) {
        *self.cpu.lock().unwrap() = cpu;
    }

    pub fn get(&self) -> Option<Arc<VirtualCpu>> {
        self.cpu.lock().unwrap().clone()
    }

    /// Kick whatever cpu is current, retrying if it changed meanwhile.
    pub fn kick(&self) {
        loop {
            let cpu = self.get();
            if let Some(c) = cpu.as_ref() {
                c.kick();
            }
            let now = self.get();
            let same = match (cpu.as_ref(), now.as_ref()) {
                (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                (None, None) => true,
                _ => false,
            };
            if same {
                break;
            }
        }
    }
}

struct TimerState {
    deadline: Option<Instant>,
    shutdown: bool,
}

struct Shared {
    state: Mutex<TimerState>,
    cond: Condvar,
    period: Duration,
    kicks: AtomicU64,
}

pub struct KickTimer {
    shared: Arc<Shared>,
    on_kick: Arc<dyn Fn() + Send + Sync>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl KickTimer {
    /// Timer calling `on_kick` every `period` while armed. No thread runs
    /// until [`KickTimer::start`].
    pub fn new<F>(period: Duration, on_kick: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(TimerState {
                    deadline: None,
                    shutdown: false,
                }),
                cond: Condvar::new(),
                period,
                kicks: AtomicU64::new(0),
            }),
            on_kick: Arc::new(on_kick),
            handle: Mutex::new(None),
        }
    }

    pub fn spawn<F>(period: Duration, on_kick: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let t = Self::new(period, on_kick);
        t.start();
        t
    }

    /// Start the timer thread, disarmed.
    pub fn start(&self) {
        let mut handle = self.handle.lock().unwrap();
        if handle.is_some() {
            return;
        }
        self.shared.state.lock().unwrap().shutdown = false;
        let shared = Arc::clone(&self.shared);
        let on_kick = Arc::clone(&self.on_kick);
        *handle = thread::Builder::new()
            .name("kick-timer".into())
            .spawn(move || timer_loop(&shared, &*on_kick))
            .map_err(|e| log::warn!("failed to spawn kick timer: {}", e))
            .ok();
    }

    /// Stop and join the timer thread, e.g. before the process forks.
    pub fn stop(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.shutdown = true;
            state.deadline = None;
            self.shared.cond.notify_all();
        }
        if let Some(h) = self.handle.lock().unwrap().take() {
            let _ = h.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.lock().unwrap().is_some()
    }

    pub fn period(&self) -> Duration {
        self.shared.period
    }

    /// Arm one period from now, unless already pending.
    pub fn arm(&self) {
        let mut state = self.shared.state.lock().unwrap();
        if state.deadline.is_none() && !state.shutdown {
            state.deadline = Some(Instant::now() + self.shared.period);
            self.shared.cond.notify_all();
        }
    }

    pub fn disarm(&self) {
        let mut state = self.shared.state.lock().unwrap();
        if state.deadline.take().is_some() {
            self.shared.cond.notify_all();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.shared.state.lock().unwrap().deadline.is_some()
    }

    /// Number of kicks delivered so far.
    pub fn kicks(&self) -> u64 {
        self.shared.kicks.load(Ordering::SeqCst)
    }
}

impl Drop for KickTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn timer_loop(shared: &Shared, on_kick: &(dyn Fn() + Send + Sync)) {
    let mut state = shared.state.lock().unwrap();
    loop {
        if state.shutdown {
            return;
        }
        match state.deadline {
            None => state = shared.cond.wait(state).unwrap(),
            Some(d) => {
                let now = Instant::now();
                if now < d {
                    state = shared.cond.wait_timeout(state, d - now).unwrap().0;
                    continue;
                }
                // rearm before kicking, as a periodic timer
                state.deadline = Some(now + shared.period);
                drop(state);
                on_kick();
                shared.kicks.fetch_add(1, Ordering::SeqCst);
                state = shared.state.lock().unwrap();
            }
        }
    }
}
