//! One-shot notification pipe from the cpu thread to the io thread.

use std::os::unix::io::RawFd;
use std::sync::Mutex;

use nix::errno::Errno;
use nix::unistd::{close, pipe, read, write};
use thiserror::Error;

/// The only message ever sent over the channel.
pub const FORK_MSG: &[u8; 4] = b"FORK";

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("control channel already notified")]
    AlreadyNotified,
    #[error("short write on control channel: {0} of 4 bytes")]
    ShortWrite(usize),
    #[error("control channel closed before a message arrived")]
    Closed,
    #[error("unexpected control message {0:02x?}")]
    BadMessage([u8; 4]),
    #[error("control channel: {0}")]
    Sys(#[from] nix::Error),
}

pub struct ControlChannel {
    rfd: RawFd,
    wfd: Mutex<Option<RawFd>>,
}

impl ControlChannel {
    pub fn new() -> Result<Self, ChannelError> {
        let (rfd, wfd) = pipe()?;
        Ok(Self {
            rfd,
            wfd: Mutex::new(Some(wfd)),
        })
    }

    /// Whether the write end is still open.
    pub fn is_armed(&self) -> bool {
        self.wfd.lock().unwrap().is_some()
    }

    /// Send [`FORK_MSG`] and close the write end. Any later call fails with
    /// [`ChannelError::AlreadyNotified`].
    pub fn notify(&self) -> Result<(), ChannelError> {
        let wfd = self
            .wfd
            .lock()
            .unwrap()
            .take()
            .ok_or(ChannelError::AlreadyNotified)?;
        let ret = write_all(wfd, FORK_MSG);
        close_fd(wfd);
        ret
    }

    /// Block until the notification arrives.
    pub fn recv(&self) -> Result<(), ChannelError> {
        let mut buf = [0u8; 4];
        let mut got = 0;
        while got < buf.len() {
            match read(self.rfd, &mut buf[got..]) {
                Ok(0) => return Err(ChannelError::Closed),
                Ok(n) => got += n,
                Err(e) if e.as_errno() == Some(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        if &buf != FORK_MSG {
            return Err(ChannelError::BadMessage(buf));
        }
        Ok(())
    }
}

fn close_fd(fd: RawFd) {
    if let Err(e) = close(fd) {
        log::warn!("failed to close control pipe fd {}: {}", fd, e);
    }
}

fn write_all(fd: RawFd, msg: &[u8]) -> Result<(), ChannelError> {
    let mut sent = 0;
    while sent < msg.len() {
        match write(fd, &msg[sent..]) {
            Ok(0) => return Err(ChannelError::ShortWrite(sent)),
            Ok(n) => sent += n,
            Err(e) if e.as_errno() == Some(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        if let Some(wfd) = self.wfd.lock().unwrap().take() {
            close_fd(wfd);
        }
        close_fd(self.rfd);
    }
}
