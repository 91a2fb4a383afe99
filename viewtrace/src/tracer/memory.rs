use std::{ffi::OsString, mem::MaybeUninit, os::unix::ffi::OsStringExt, path::PathBuf};

use lazy_static::lazy_static;
use nix::errno::Errno;

use crate::error::{Error, Result};

use super::{Handle, Tracer};

lazy_static! {
    pub static ref PAGESIZE: usize = procfs::page_size() as _;
}

pub const PATH_MAX: usize = 4096;

/// Largest transfer the kernel performs in one read or write call.
pub const MAX_RW_COUNT: usize = 0x7fff_f000;

/// Access to the address space of the process a syscall is handled for.
pub trait CallerMemory {
    fn read_into(&mut self, addr: usize, buf: &mut [u8]) -> Result<usize>;

    fn write_from(&mut self, addr: usize, data: &[u8]) -> Result<usize>;
}

pub trait CallerMemoryExt: CallerMemory {
    /// Reads exactly `len` bytes. A short read is reported as `EFAULT`.
    /// The buffer grows one page at a time, so a bogus length fails at the
    /// first unmapped page instead of allocating it up front.
    fn read_bytes(&mut self, addr: usize, len: usize) -> Result<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        if addr == 0 || addr.checked_add(len).is_none() {
            return Err(Error::Nix(Errno::EFAULT));
        }

        let mut buf = Vec::new();
        let mut cur = addr;

        while buf.len() < len {
            let start = buf.len();
            let chunk = (*PAGESIZE - cur % *PAGESIZE).min(len - start);
            buf.resize(start + chunk, 0);

            if self.read_into(cur, &mut buf[start..])? != chunk {
                return Err(Error::Nix(Errno::EFAULT));
            }
            cur += chunk;
        }

        Ok(buf)
    }

    fn write_bytes(&mut self, addr: usize, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        if addr == 0 {
            return Err(Error::Nix(Errno::EFAULT));
        }

        if self.write_from(addr, data)? != data.len() {
            return Err(Error::Nix(Errno::EFAULT));
        }

        Ok(())
    }

    fn read_value<T: Copy>(&mut self, addr: usize) -> Result<T> {
        let bytes = self.read_bytes(addr, std::mem::size_of::<T>())?;
        let mut value = MaybeUninit::<T>::uninit();

        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                value.as_mut_ptr() as *mut u8,
                bytes.len(),
            );
            Ok(value.assume_init())
        }
    }

    fn write_value<T: Copy>(&mut self, addr: usize, value: &T) -> Result<()> {
        let bytes = unsafe {
            std::slice::from_raw_parts(value as *const T as *const u8, std::mem::size_of::<T>())
        };
        self.write_bytes(addr, bytes)
    }

    /// Reads a NUL-terminated string of at most `max` bytes, without the
    /// terminator. Reads never cross a page boundary in one go, so a string
    /// ending right before an unmapped page is still readable.
    fn read_cstring(&mut self, addr: usize, max: usize) -> Result<Vec<u8>> {
        if addr == 0 {
            return Err(Error::Nix(Errno::EFAULT));
        }

        let mut out = Vec::new();
        let mut cur = addr;

        loop {
            let to_page_end = *PAGESIZE - (cur % *PAGESIZE);
            let mut chunk = vec![0u8; to_page_end.min(max + 1 - out.len())];
            let n = self.read_into(cur, &mut chunk)?;

            if n == 0 {
                return Err(Error::Nix(Errno::EFAULT));
            }

            if let Some(end) = chunk[..n].iter().position(|&b| b == 0) {
                out.extend_from_slice(&chunk[..end]);
                return Ok(out);
            }

            out.extend_from_slice(&chunk[..n]);
            cur += n;

            if out.len() > max {
                return Err(Error::Nix(Errno::ENAMETOOLONG));
            }
        }
    }

    fn read_path(&mut self, addr: usize) -> Result<PathBuf> {
        let bytes = self.read_cstring(addr, PATH_MAX - 1)?;
        Ok(PathBuf::from(OsString::from_vec(bytes)))
    }
}

impl<M: CallerMemory + ?Sized> CallerMemoryExt for M {}

/// [`CallerMemory`] of one traced task.
pub struct TracedMemory<'t, T: Tracer + ?Sized> {
    tracer: &'t mut T,
    handle: Handle,
}

impl<'t, T: Tracer + ?Sized> TracedMemory<'t, T> {
    pub fn new(tracer: &'t mut T, handle: Handle) -> Self {
        Self { tracer, handle }
    }
}

impl<'t, T: Tracer + ?Sized> CallerMemory for TracedMemory<'t, T> {
    fn read_into(&mut self, addr: usize, buf: &mut [u8]) -> Result<usize> {
        self.tracer.read_memory(self.handle, addr, buf)
    }

    fn write_from(&mut self, addr: usize, data: &[u8]) -> Result<usize> {
        self.tracer.write_memory(self.handle, addr, data)
    }
}

/// Memory of a process that cannot be accessed (gone, or not stopped).
pub struct NoMemory;

impl CallerMemory for NoMemory {
    fn read_into(&mut self, _addr: usize, _buf: &mut [u8]) -> Result<usize> {
        Err(Error::Nix(Errno::EFAULT))
    }

    fn write_from(&mut self, _addr: usize, _data: &[u8]) -> Result<usize> {
        Err(Error::Nix(Errno::EFAULT))
    }
}
