use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;

use super::Memory;

const PAGE_SIZE: u64 = 4096;

/// Reads another process's memory through `process_vm_readv`.
///
/// Reads are split at page boundaries so that a partly unmapped request
/// still returns the readable prefix.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRemote {
    pid: libc::pid_t,
}

impl MemoryRemote {
    pub fn new(pid: libc::pid_t) -> Self {
        Self { pid }
    }

    pub fn pid(&self) -> libc::pid_t {
        self.pid
    }

    fn read_chunk(&self, addr: u64, dst: &mut [u8]) -> usize {
        let local = libc::iovec {
            iov_base: dst.as_mut_ptr() as *mut libc::c_void,
            iov_len: dst.len(),
        };
        let remote = libc::iovec {
            iov_base: addr as usize as *mut libc::c_void,
            iov_len: dst.len(),
        };
        // Safety: `local` describes exactly the writable buffer `dst`.
        // The kernel validates the remote range.
        let rc = unsafe { libc::process_vm_readv(self.pid, &local, 1, &remote, 1, 0) };
        if rc < 0 {
            0
        } else {
            rc as usize
        }
    }
}

impl Memory for MemoryRemote {
    fn read(&self, addr: u64, dst: &mut [u8]) -> usize {
        let mut total = 0;
        while total < dst.len() {
            let cur = match addr.checked_add(total as u64) {
                Some(cur) => cur,
                None => break,
            };
            let to_page_end = PAGE_SIZE - (cur % PAGE_SIZE);
            let len = ((dst.len() - total) as u64).min(to_page_end) as usize;
            let n = self.read_chunk(cur, &mut dst[total..total + len]);
            total += n;
            if n < len {
                break;
            }
        }
        total
    }
}

/// Reads another process's memory through its `/proc/<pid>/mem` file.
#[derive(Debug)]
pub struct MemoryProcFile {
    file: File,
}

impl MemoryProcFile {
    pub fn open_pid(pid: libc::pid_t) -> io::Result<Self> {
        Self::open(format!("/proc/{pid}/mem"))
    }

    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self {
            file: File::open(path)?,
        })
    }
}

impl Memory for MemoryProcFile {
    fn read(&self, addr: u64, dst: &mut [u8]) -> usize {
        let mut total = 0;
        while total < dst.len() {
            match self.file.read_at(&mut dst[total..], addr.wrapping_add(total as u64)) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        total
    }
}
