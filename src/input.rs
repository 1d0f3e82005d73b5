//! Fuzz input consumed by the injection strategies.

use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;

use bytes::Buf;

/// Immutable input bytes plus a read cursor, scoped to one replay.
///
/// Every `take_*` either consumes exactly the requested amount or nothing.
#[derive(Debug, Clone)]
pub struct FuzzInput<'a> {
    data: &'a [u8],
    cursor: usize,
}

impl<'a> FuzzInput<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, cursor: 0 }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.cursor
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.data
    }

    /// Unconsumed tail.
    pub fn rest(&self) -> &'a [u8] {
        &self.data[self.cursor..]
    }

    pub fn take_bytes(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.remaining() >= n {
            let ret = &self.data[self.cursor..self.cursor + n];
            self.cursor += n;
            Some(ret)
        } else {
            None
        }
    }

    /// Consume up to `n` bytes without looking at them, returns how many.
    pub fn skip(&mut self, n: usize) -> usize {
        let n = n.min(self.remaining());
        self.cursor += n;
        n
    }

    pub fn take_u8(&mut self) -> Option<u8> {
        self.take_bytes(1).map(|mut b| b.get_u8())
    }

    pub fn take_u16(&mut self) -> Option<u16> {
        self.take_bytes(2).map(|mut b| b.get_u16())
    }

    pub fn take_u32(&mut self) -> Option<u32> {
        self.take_bytes(4).map(|mut b| b.get_u32())
    }

    pub fn take_u64(&mut self) -> Option<u64> {
        self.take_bytes(8).map(|mut b| b.get_u64())
    }

    /// Big-endian scalar of `width` bytes (1, 2, 4 or 8).
    pub fn take_scalar(&mut self, width: usize) -> Option<u64> {
        match width {
            1 => self.take_u8().map(u64::from),
            2 => self.take_u16().map(u64::from),
            4 => self.take_u32().map(u64::from),
            8 => self.take_u64(),
            _ => None,
        }
    }
}

/// Where a forked child reads its input from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSource {
    Stdin,
    File(PathBuf),
}

impl Default for InputSource {
    fn default() -> Self {
        InputSource::Stdin
    }
}

impl InputSource {
    pub fn read(&self) -> io::Result<Vec<u8>> {
        match self {
            InputSource::Stdin => {
                let mut buf = Vec::new();
                io::stdin().lock().read_to_end(&mut buf)?;
                Ok(buf)
            }
            InputSource::File(p) => fs::read(p),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_big_endian() {
        let data = [0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc, 0xde, 0xf0, 0x01];
        let mut input = FuzzInput::new(&data);
        assert_eq!(input.take_u8(), Some(0x12));
        assert_eq!(input.take_u16(), Some(0x3456));
        assert_eq!(input.take_u32(), Some(0x789a_bcde));
        assert_eq!(input.remaining(), 2);
        assert_eq!(input.take_u64(), None);
        assert_eq!(input.cursor(), 7);
        assert_eq!(input.rest(), &[0xf0, 0x01]);
    }

    #[test]
    fn short_take_does_not_move_cursor() {
        let data = [1, 2, 3];
        let mut input = FuzzInput::new(&data);
        assert_eq!(input.take_u32(), None);
        assert_eq!(input.cursor(), 0);
        assert_eq!(input.take_bytes(3), Some(&data[..]));
        assert_eq!(input.take_bytes(0), Some(&[][..]));
        assert_eq!(input.take_u8(), None);
        assert_eq!(input.cursor(), input.len());
    }

    #[test]
    fn skip_stops_at_end() {
        let data = [1, 2, 3, 4];
        let mut input = FuzzInput::new(&data);
        assert_eq!(input.skip(3), 3);
        assert_eq!(input.skip(3), 1);
        assert_eq!(input.skip(1), 0);
        assert_eq!(input.cursor(), 4);
    }

    #[test]
    fn scalar_widths() {
        let data = [0xff; 8];
        let mut input = FuzzInput::new(&data);
        assert_eq!(input.take_scalar(3), None);
        assert_eq!(input.take_scalar(2), Some(0xffff));
        assert_eq!(input.take_scalar(8), None);
        assert_eq!(input.take_scalar(4), Some(0xffff_ffff));
    }

    #[test]
    fn read_from_file() {
        let p = std::env::temp_dir().join(format!("smfuzz-input-{}", std::process::id()));
        fs::write(&p, b"\x01\x02").unwrap();
        let src = InputSource::File(p.clone());
        assert_eq!(src.read().unwrap(), vec![1, 2]);
        fs::remove_file(&p).unwrap();
    }
}
