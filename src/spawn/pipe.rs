//! Spawn-time synchronization pipes
//!
//! Two close-on-exec pipes coordinate the three processes involved in a
//! launch. The spawn pipe flows from the processes under construction to
//! the supervisor and carries exactly one PID word followed, on failure,
//! by a serialized error record. The sync pipe flows from the
//! intermediate to the grandchild and carries a single zero word once
//! host-side setup is finished; the grandchild does nothing before it
//! arrives.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use log::error;
use nix::fcntl::OFlag;
use nix::unistd::pipe2;

use crate::errors::{ErrorKind, Result, TaskError};

fn write_all(fd: RawFd, mut bytes: &[u8]) -> std::io::Result<()> {
    while !bytes.is_empty() {
        let n = unsafe { libc::write(fd, bytes.as_ptr() as *const libc::c_void, bytes.len()) };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        bytes = &bytes[n as usize..];
    }
    Ok(())
}

fn read_exact(fd: RawFd, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let remaining = &mut buf[total..];
        let n = unsafe {
            libc::read(
                fd,
                remaining.as_mut_ptr() as *mut libc::c_void,
                remaining.len(),
            )
        };
        match n {
            0 => break,
            n if n < 0 => {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            n => total += n as usize,
        }
    }
    Ok(total)
}

fn read_to_end(fd: RawFd) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = unsafe { libc::read(fd, chunk.as_mut_ptr() as *mut libc::c_void, chunk.len()) };
        match n {
            0 => return Ok(out),
            n if n < 0 => {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            n => out.extend_from_slice(&chunk[..n as usize]),
        }
    }
}

/// Result channel from the intermediate and grandchild to the supervisor
#[derive(Debug)]
pub struct SpawnPipe {
    read: Option<OwnedFd>,
    write: Option<OwnedFd>,
}

impl SpawnPipe {
    pub fn new() -> Result<Self> {
        let (read, write) = pipe2(OFlag::O_CLOEXEC)
            .map_err(|e| TaskError::from_nix("pipe2(spawn pipe)", e))?;
        Ok(Self {
            read: Some(read),
            write: Some(write),
        })
    }

    /// Drop the end this process does not use
    pub fn close_read(&mut self) {
        self.read = None;
    }

    pub fn close_write(&mut self) {
        self.write = None;
    }

    pub fn write_fd(&self) -> Option<RawFd> {
        self.write.as_ref().map(|fd| fd.as_raw_fd())
    }

    /// Write the PID word. Always called exactly once per launch attempt,
    /// with -1 when clone never produced a PID. A partial write is a
    /// protocol violation and is logged, not raised: the writer is about
    /// to exit anyway.
    pub fn report_pid(&self, pid: libc::pid_t) {
        let Some(fd) = &self.write else {
            error!("pid report on closed spawn pipe");
            return;
        };
        if let Err(e) = write_all(fd.as_raw_fd(), &pid.to_ne_bytes()) {
            error!("partial write of pid {}: {}", pid, e);
        }
    }

    /// Serialize an error record after the PID word
    pub fn send_error(&self, error: &TaskError) -> Result<()> {
        let Some(fd) = &self.write else {
            return Err(TaskError::unknown("error report on closed spawn pipe"));
        };
        let bytes = bincode::serialize(error)
            .map_err(|e| TaskError::unknown(format!("serialize error record: {}", e)))?;
        write_all(fd.as_raw_fd(), &bytes)
            .map_err(|e| TaskError::unknown(format!("write error record: {}", e)))?;
        Ok(())
    }

    /// Read the PID word; fails when the writers exited without reporting
    pub fn read_pid(&self) -> Result<libc::pid_t> {
        let Some(fd) = &self.read else {
            return Err(TaskError::unknown("pid read on closed spawn pipe"));
        };
        let mut buf = [0u8; size_of::<libc::pid_t>()];
        let n = read_exact(fd.as_raw_fd(), &mut buf)
            .map_err(|e| TaskError::unknown(format!("read pid word: {}", e)))?;
        if n != buf.len() {
            return Err(TaskError::new(
                ErrorKind::InvalidValue,
                libc::ENODATA,
                "task could not be started due to resource limits",
            ));
        }
        Ok(libc::pid_t::from_ne_bytes(buf))
    }

    /// Read the error record following the PID word. EOF without bytes
    /// means the launch succeeded.
    pub fn read_error(&self) -> Result<Option<TaskError>> {
        let Some(fd) = &self.read else {
            return Err(TaskError::unknown("error read on closed spawn pipe"));
        };
        let bytes = read_to_end(fd.as_raw_fd())
            .map_err(|e| TaskError::unknown(format!("read error record: {}", e)))?;
        TaskError::deserialize_from(&bytes[..])
    }
}

/// One-shot gate from the intermediate to the grandchild
#[derive(Debug)]
pub struct SyncPipe {
    read: Option<OwnedFd>,
    write: Option<OwnedFd>,
}

impl SyncPipe {
    pub fn new() -> Result<Self> {
        let (read, write) =
            pipe2(OFlag::O_CLOEXEC).map_err(|e| TaskError::from_nix("pipe2(sync pipe)", e))?;
        Ok(Self {
            read: Some(read),
            write: Some(write),
        })
    }

    pub fn close_read(&mut self) {
        self.read = None;
    }

    pub fn close_write(&mut self) {
        self.write = None;
    }

    /// Unblock the grandchild
    pub fn signal(&self) -> Result<()> {
        let Some(fd) = &self.write else {
            return Err(TaskError::unknown("signal on closed sync pipe"));
        };
        let word: i32 = 0;
        write_all(fd.as_raw_fd(), &word.to_ne_bytes())
            .map_err(|e| TaskError::unknown(format!("partial write to child sync pipe: {}", e)))
    }

    /// Block until the intermediate signals; EOF means it aborted first
    pub fn wait(&self) -> Result<()> {
        let Some(fd) = &self.read else {
            return Err(TaskError::unknown("wait on closed sync pipe"));
        };
        let mut buf = [0u8; size_of::<i32>()];
        let n = read_exact(fd.as_raw_fd(), &mut buf)
            .map_err(|e| TaskError::unknown(format!("read from child sync pipe: {}", e)))?;
        if n != buf.len() {
            return Err(TaskError::new(
                ErrorKind::Unknown,
                libc::ENODATA,
                "partial read from child sync pipe",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    #[test]
    fn test_spawn_pipe_carries_pid_then_success_eof() {
        let mut pipe = SpawnPipe::new().unwrap();
        pipe.report_pid(4321);
        pipe.close_write();

        assert_eq!(pipe.read_pid().unwrap(), 4321);
        assert!(pipe.read_error().unwrap().is_none());
    }

    #[test]
    fn test_spawn_pipe_carries_pid_then_error() {
        let mut pipe = SpawnPipe::new().unwrap();
        pipe.report_pid(-1);
        pipe.send_error(&TaskError::new(
            ErrorKind::ResourceNotAvailable,
            libc::ENOMEM,
            "clone()",
        ))
        .unwrap();
        pipe.close_write();

        assert_eq!(pipe.read_pid().unwrap(), -1);
        let error = pipe.read_error().unwrap().unwrap();
        assert_eq!(error.kind, ErrorKind::ResourceNotAvailable);
        assert_eq!(error.errno, libc::ENOMEM);
        assert_eq!(error.message, "clone()");
    }

    #[test]
    fn test_spawn_pipe_eof_before_pid_is_an_error() {
        let mut pipe = SpawnPipe::new().unwrap();
        pipe.close_write();
        let err = pipe.read_pid().unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidValue);
    }

    #[test]
    fn test_sync_pipe_signal_unblocks_wait() {
        let mut pipe = SyncPipe::new().unwrap();
        pipe.signal().unwrap();
        pipe.close_write();
        assert!(pipe.wait().is_ok());
    }

    #[test]
    fn test_sync_pipe_eof_is_partial_read() {
        let mut pipe = SyncPipe::new().unwrap();
        pipe.close_write();
        let err = pipe.wait().unwrap_err();
        assert!(err.message.contains("partial read from child sync pipe"));
    }
}
