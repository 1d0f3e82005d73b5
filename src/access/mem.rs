//! In-memory guest backend, used for offline replay and in tests.

use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;

use super::{AccessSurface, PhysAddr};

const PAGE_SHIFT: u64 = 12;
const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

type Page = Box<[u8; PAGE_SIZE]>;

#[derive(Default)]
struct Inner {
    pages: FxHashMap<u64, Page>,
    writes: Vec<(PhysAddr, Vec<u8>)>,
    log: Vec<String>,
}

/// Sparse guest physical memory, zero filled on first touch.
///
/// Every write issued through [`GuestMemory::surface`] is also recorded in
/// order, which is what `smfuzz replay` prints.
#[derive(Clone, Default)]
pub struct GuestMemory {
    inner: Arc<Mutex<Inner>>,
}

impl GuestMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&self, addr: PhysAddr, data: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        inner.writes.push((addr, data.to_vec()));
        for (i, b) in data.iter().enumerate() {
            let a = addr.wrapping_add(i as u64);
            let page = inner
                .pages
                .entry(a >> PAGE_SHIFT)
                .or_insert_with(|| Box::new([0; PAGE_SIZE]));
            page[(a as usize) & (PAGE_SIZE - 1)] = *b;
        }
    }

    pub fn read(&self, addr: PhysAddr, buf: &mut [u8]) {
        let inner = self.inner.lock().unwrap();
        for (i, b) in buf.iter_mut().enumerate() {
            let a = addr.wrapping_add(i as u64);
            *b = inner
                .pages
                .get(&(a >> PAGE_SHIFT))
                .map(|p| p[(a as usize) & (PAGE_SIZE - 1)])
                .unwrap_or(0);
        }
    }

    /// Writes in issue order.
    pub fn writes(&self) -> Vec<(PhysAddr, Vec<u8>)> {
        self.inner.lock().unwrap().writes.clone()
    }

    /// Messages passed to the logging sink.
    pub fn log_lines(&self) -> Vec<String> {
        self.inner.lock().unwrap().log.clone()
    }

    pub fn clear_record(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.writes.clear();
        inner.log.clear();
    }

    /// Access surface backed by this memory. Log messages are kept and
    /// forwarded to the `log` facade at debug level.
    pub fn surface(&self) -> AccessSurface {
        let w = self.clone();
        let r = self.clone();
        let l = self.clone();
        AccessSurface::builder()
            .phys_write(move |addr, data| w.write(addr, data))
            .phys_read(move |addr, buf| r.read(addr, buf))
            .log_sink(move |msg| {
                log::debug!(target: "guest", "{}", msg.trim_end());
                l.inner.lock().unwrap().log.push(msg.to_string());
            })
            .build()
            .expect("all callbacks set")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_back_across_pages() {
        let mem = GuestMemory::new();
        let addr = 0x490000 + PAGE_SIZE as u64 - 2;
        mem.write(addr, &[1, 2, 3, 4]);
        let mut buf = [0xff; 6];
        mem.read(addr - 1, &mut buf);
        assert_eq!(buf, [0, 1, 2, 3, 4, 0]);
        assert_eq!(mem.writes(), vec![(addr, vec![1, 2, 3, 4])]);
    }

    #[test]
    fn surface_records() {
        let mem = GuestMemory::new();
        let s = mem.surface();
        s.write_phys(0x10, b"abc");
        s.log("line\n");
        let mut buf = [0; 3];
        s.read_phys(0x10, &mut buf);
        assert_eq!(&buf, b"abc");
        assert_eq!(mem.log_lines(), vec!["line\n".to_string()]);
        mem.clear_record();
        assert!(mem.writes().is_empty());
    }
}
