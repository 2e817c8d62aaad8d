// src/segment.rs

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr::NonNull;

use crate::error::ShmError;

/// Granularity the backing object's length is rounded to.
const PAGE: u64 = 4096;

/// One process's handle to a named POSIX shared-memory object.
///
/// A `Segment` owns a file descriptor and (when the object is non-empty)
/// one mapping of the object's full length. The handle tracks the length
/// *it* has mapped, which is not necessarily the authoritative object
/// length — another process may have grown the object since. Callers that
/// share a segment use that asymmetry as their cache-invalidation signal
/// and call [`resize`](Self::resize) to catch up.
///
/// Dropping a `Segment` unmaps and closes it but leaves the name in the
/// shared-memory namespace; [`unlink`](Self::unlink) removes the name.
pub struct Segment {
    fd: OwnedFd,
    base: Option<NonNull<u8>>,
    len: u64,
    name: CString,
}

// Safety: the mapping is plain shared memory. All cross-handle
// coordination happens through atomics that callers place inside it.
unsafe impl Send for Segment {}

impl Segment {
    /// Open or create the named object and map its current length, if any.
    ///
    /// A freshly created object has length zero and stays unmapped until
    /// the first [`resize`](Self::resize).
    pub fn open(name: &str) -> Result<Self, ShmError> {
        Self::open_flags(name, libc::O_RDWR | libc::O_CREAT)
    }

    /// Like [`open`](Self::open), but fails if the name already exists.
    ///
    /// Callers that must be the sole initializer of a queue gate creation
    /// on this instead of racing on open-or-create.
    pub fn open_excl(name: &str) -> Result<Self, ShmError> {
        Self::open_flags(name, libc::O_RDWR | libc::O_CREAT | libc::O_EXCL)
    }

    fn open_flags(name: &str, flags: libc::c_int) -> Result<Self, ShmError> {
        let c_name = CString::new(name).map_err(|_| ShmError::InvalidName)?;

        let fd = unsafe { libc::shm_open(c_name.as_ptr(), flags, 0o644) };
        if fd < 0 {
            return Err(ShmError::Segment(io::Error::last_os_error()));
        }
        // Safety: shm_open returned a fresh, valid descriptor.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        // Safety: fstat only writes into the stat buffer we hand it.
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd.as_raw_fd(), &mut st) } < 0 {
            return Err(ShmError::Segment(io::Error::last_os_error()));
        }

        let mut seg = Segment {
            fd,
            base: None,
            len: 0,
            name: c_name,
        };
        if st.st_size != 0 {
            seg.map(st.st_size as u64)?;
        }
        Ok(seg)
    }

    fn map(&mut self, len: u64) -> Result<(), ShmError> {
        // Safety: mapping a shared object we hold the fd for; length is
        // within the object because callers pass the ftruncate'd size.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.fd.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(ShmError::Segment(io::Error::last_os_error()));
        }
        self.base = NonNull::new(ptr as *mut u8);
        self.len = len;
        Ok(())
    }

    fn unmap(&mut self) {
        if let Some(base) = self.base.take() {
            // Safety: base/len describe the live mapping created by map().
            unsafe {
                libc::munmap(base.as_ptr() as *mut libc::c_void, self.len as usize);
            }
            self.len = 0;
        }
    }

    /// Set the backing object's length to `new_len` rounded up to a page,
    /// then re-map it at that length.
    ///
    /// Every pointer previously derived from this segment is invalid
    /// afterwards: the mapping address has very likely changed. When
    /// another process grew the object, calling `resize` with the same
    /// length sets the object length again (without effect) and adjusts
    /// this handle's mapping.
    pub fn resize(&mut self, new_len: u64) -> Result<(), ShmError> {
        let new_len = (new_len + (PAGE - 1)) & !(PAGE - 1);
        if new_len == self.len {
            return Ok(());
        }
        if unsafe { libc::ftruncate(self.fd.as_raw_fd(), new_len as libc::off_t) } < 0 {
            return Err(ShmError::Segment(io::Error::last_os_error()));
        }
        self.unmap();
        self.map(new_len)
    }

    /// Base address of the current mapping.
    ///
    /// # Panics
    /// Panics if the segment is unmapped.
    pub fn ptr(&self) -> *mut u8 {
        match self.base {
            Some(p) => p.as_ptr(),
            None => panic!("segment {:?} is not mapped", self.name),
        }
    }

    /// Pointer `off` bytes into the mapping. Same precondition as
    /// [`ptr`](Self::ptr).
    pub fn ptr_at(&self, off: u64) -> *mut u8 {
        debug_assert!(off <= self.len);
        // Safety: off is within the mapping.
        unsafe { self.ptr().add(off as usize) }
    }

    /// Length currently mapped by this handle. Another process may have
    /// grown the object since; see the type-level docs.
    pub fn size(&self) -> u64 {
        self.len
    }

    /// Unmap, close, and remove the name from the shared-memory namespace.
    pub fn unlink(mut self) -> Result<(), ShmError> {
        self.unmap();
        if unsafe { libc::shm_unlink(self.name.as_ptr()) } < 0 {
            return Err(ShmError::Segment(io::Error::last_os_error()));
        }
        Ok(())
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        self.unmap();
        // OwnedFd closes the descriptor; the name stays in the namespace.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique(tag: &str) -> String {
        format!("/shmq-seg-{}-{}", std::process::id(), tag)
    }

    #[test]
    fn fresh_object_is_unmapped() {
        let name = unique("fresh");
        let seg = Segment::open(&name).unwrap();
        assert_eq!(seg.size(), 0);
        seg.unlink().unwrap();
    }

    #[test]
    fn resize_rounds_to_page() {
        let name = unique("round");
        let mut seg = Segment::open(&name).unwrap();
        seg.resize(100).unwrap();
        assert_eq!(seg.size(), 4096);
        seg.resize(4097).unwrap();
        assert_eq!(seg.size(), 8192);
        seg.unlink().unwrap();
    }

    #[test]
    fn contents_survive_resize() {
        let name = unique("grow");
        let mut seg = Segment::open(&name).unwrap();
        seg.resize(4096).unwrap();
        unsafe {
            *seg.ptr() = 0xAB;
            *seg.ptr_at(4095) = 0xCD;
        }
        seg.resize(64 * 1024).unwrap();
        unsafe {
            assert_eq!(*seg.ptr(), 0xAB);
            assert_eq!(*seg.ptr_at(4095), 0xCD);
        }
        seg.unlink().unwrap();
    }

    #[test]
    fn second_open_sees_authoritative_length() {
        let name = unique("reopen");
        let mut a = Segment::open(&name).unwrap();
        a.resize(8192).unwrap();
        unsafe { *a.ptr() = 7 };

        let b = Segment::open(&name).unwrap();
        assert_eq!(b.size(), 8192);
        unsafe { assert_eq!(*b.ptr(), 7) };

        b.unlink().unwrap();
    }

    #[test]
    fn open_excl_refuses_existing_name() {
        let name = unique("excl");
        let seg = Segment::open(&name).unwrap();
        assert!(Segment::open_excl(&name).is_err());
        seg.unlink().unwrap();
        // Name is free again.
        let seg = Segment::open_excl(&name).unwrap();
        seg.unlink().unwrap();
    }

    #[test]
    fn interior_nul_is_rejected() {
        assert!(matches!(
            Segment::open("/bad\0name"),
            Err(ShmError::InvalidName)
        ));
    }
}
