//! Byte-pipe transport between the control core and the X11 worker.
//!
//! Three anonymous pipes connect the two threads: Request (control → worker),
//! Response (worker → control) and Error (worker → control, carrying
//! asynchronous X11 error reports). Framing is fixed-width: native-endian
//! machine words, single bytes, and length-prefixed byte strings.

use std::os::fd::{AsFd, AsRawFd, OwnedFd};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use thiserror::Error;

/// Transport failure on the control channel.
///
/// Transient conditions (`EINTR`, `EAGAIN`) are retried inside the full
/// read/write loops and never escape; anything returned here is fatal for
/// the channel. `Closed` means the peer end is gone.
#[derive(Debug, Error)]
pub enum PipeError {
    #[error("peer closed the pipe")]
    Closed,
    #[error("pipe I/O error: {0}")]
    Os(#[from] Errno),
}

/// One unidirectional pipe.
pub struct Pipe {
    pub read: OwnedFd,
    pub write: OwnedFd,
}

pub fn create() -> Result<Pipe, PipeError> {
    let (read, write) = nix::unistd::pipe()?;
    Ok(Pipe { read, write })
}

/// Read exactly `buf.len()` bytes, looping over short reads.
pub fn read_full(fd: &OwnedFd, buf: &mut [u8]) -> Result<(), PipeError> {
    let mut done = 0;
    while done < buf.len() {
        match nix::unistd::read(fd.as_raw_fd(), &mut buf[done..]) {
            Ok(0) => return Err(PipeError::Closed),
            Ok(n) => done += n,
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => continue,
            Err(e) => return Err(PipeError::Os(e)),
        }
    }
    Ok(())
}

/// Write all of `buf`, looping over short writes.
pub fn write_full(fd: &OwnedFd, buf: &[u8]) -> Result<(), PipeError> {
    let mut done = 0;
    while done < buf.len() {
        match nix::unistd::write(fd, &buf[done..]) {
            Ok(0) => return Err(PipeError::Closed),
            Ok(n) => done += n,
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => continue,
            Err(Errno::EPIPE) => return Err(PipeError::Closed),
            Err(e) => return Err(PipeError::Os(e)),
        }
    }
    Ok(())
}

pub fn write_word(fd: &OwnedFd, value: u64) -> Result<(), PipeError> {
    write_full(fd, &value.to_ne_bytes())
}

pub fn read_word(fd: &OwnedFd) -> Result<u64, PipeError> {
    let mut buf = [0u8; 8];
    read_full(fd, &mut buf)?;
    Ok(u64::from_ne_bytes(buf))
}

pub fn write_byte(fd: &OwnedFd, value: u8) -> Result<(), PipeError> {
    write_full(fd, &[value])
}

pub fn read_byte(fd: &OwnedFd) -> Result<u8, PipeError> {
    let mut buf = [0u8; 1];
    read_full(fd, &mut buf)?;
    Ok(buf[0])
}

pub fn write_u32(fd: &OwnedFd, value: u32) -> Result<(), PipeError> {
    write_full(fd, &value.to_ne_bytes())
}

pub fn read_u32(fd: &OwnedFd) -> Result<u32, PipeError> {
    let mut buf = [0u8; 4];
    read_full(fd, &mut buf)?;
    Ok(u32::from_ne_bytes(buf))
}

pub fn write_i32(fd: &OwnedFd, value: i32) -> Result<(), PipeError> {
    write_full(fd, &value.to_ne_bytes())
}

pub fn read_i32(fd: &OwnedFd) -> Result<i32, PipeError> {
    let mut buf = [0u8; 4];
    read_full(fd, &mut buf)?;
    Ok(i32::from_ne_bytes(buf))
}

/// Length-prefixed byte string.
pub fn write_bytes(fd: &OwnedFd, bytes: &[u8]) -> Result<(), PipeError> {
    write_word(fd, bytes.len() as u64)?;
    if !bytes.is_empty() {
        write_full(fd, bytes)?;
    }
    Ok(())
}

pub fn read_bytes(fd: &OwnedFd) -> Result<Vec<u8>, PipeError> {
    let len = read_word(fd)? as usize;
    let mut buf = vec![0u8; len];
    if len > 0 {
        read_full(fd, &mut buf)?;
    }
    Ok(buf)
}

/// Poll a read end for readability within `timeout_ms` milliseconds.
pub fn poll_readable(fd: &OwnedFd, timeout_ms: u16) -> Result<bool, PipeError> {
    let mut fds = [PollFd::new(fd.as_fd(), PollFlags::POLLIN)];
    loop {
        match poll(&mut fds, PollTimeout::from(timeout_ms)) {
            Ok(0) => return Ok(false),
            Ok(_) => {
                let revents = fds[0].revents().unwrap_or(PollFlags::empty());
                return Ok(revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP));
            }
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(PipeError::Os(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_and_bytes_round_trip() {
        let pipe = create().unwrap();
        write_word(&pipe.write, 0xdead_beef_cafe).unwrap();
        write_bytes(&pipe.write, b"Control+Alt+T").unwrap();
        write_byte(&pipe.write, 0x2a).unwrap();

        assert_eq!(read_word(&pipe.read).unwrap(), 0xdead_beef_cafe);
        assert_eq!(read_bytes(&pipe.read).unwrap(), b"Control+Alt+T");
        assert_eq!(read_byte(&pipe.read).unwrap(), 0x2a);
    }

    #[test]
    fn empty_byte_string() {
        let pipe = create().unwrap();
        write_bytes(&pipe.write, b"").unwrap();
        assert_eq!(read_bytes(&pipe.read).unwrap(), b"");
    }

    #[test]
    fn read_after_peer_close_reports_closed() {
        let pipe = create().unwrap();
        drop(pipe.write);
        let mut buf = [0u8; 1];
        assert!(matches!(
            read_full(&pipe.read, &mut buf),
            Err(PipeError::Closed)
        ));
    }

    #[test]
    fn poll_times_out_on_empty_pipe() {
        let pipe = create().unwrap();
        assert!(!poll_readable(&pipe.read, 10).unwrap());
        write_byte(&pipe.write, 1).unwrap();
        assert!(poll_readable(&pipe.read, 10).unwrap());
    }
}
