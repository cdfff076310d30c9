//! Shared memory segments backing ring channels.
//!
//! Named segments live in the POSIX shm namespace (`shm_open`). The creating
//! side owns the name and unlinks it on drop; the opening side only maps it.
//! Anonymous segments (`MAP_SHARED | MAP_ANONYMOUS`) are used when both ends
//! live in one process or are inherited across `fork`.

use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::ptr::NonNull;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{MapFlags, ProtFlags, mmap, mmap_anonymous, munmap, shm_open, shm_unlink};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;

pub(crate) struct Segment {
    base: NonNull<c_void>,
    len: usize,
    owned_name: Option<String>,
}

// SAFETY: the mapping is plain shared memory. Every concurrent access goes
// through the atomics in the ring header or is serialized by the endpoint
// locks in `RingProducer` / `RingConsumer`.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    pub(crate) fn create(name: &str, len: usize) -> nix::Result<Self> {
        let length = NonZeroUsize::new(len).ok_or(Errno::EINVAL)?;
        let fd = shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )?;

        let mapped = ftruncate(&fd, len as nix::libc::off_t).and_then(|()| {
            // SAFETY: fresh mapping of a descriptor we just sized; nothing else
            // aliases it yet.
            unsafe {
                mmap(
                    None,
                    length,
                    ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                    MapFlags::MAP_SHARED,
                    &fd,
                    0,
                )
            }
        });

        match mapped {
            Ok(base) => {
                tracing::debug!(name, len, "Created shared segment");
                Ok(Self {
                    base,
                    len,
                    owned_name: Some(name.to_string()),
                })
            }
            Err(e) => {
                let _ = shm_unlink(name);
                Err(e)
            }
        }
    }

    pub(crate) fn open(name: &str, len: usize) -> nix::Result<Self> {
        let length = NonZeroUsize::new(len).ok_or(Errno::EINVAL)?;
        let fd = shm_open(name, OFlag::O_RDWR, Mode::empty())?;
        // SAFETY: maps an existing segment; the creator sized it to `len`
        // (checked against the header magic/capacity by the caller).
        let base = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &fd,
                0,
            )?
        };
        tracing::debug!(name, len, "Opened shared segment");
        Ok(Self {
            base,
            len,
            owned_name: None,
        })
    }

    pub(crate) fn anonymous(len: usize) -> nix::Result<Self> {
        let length = NonZeroUsize::new(len).ok_or(Errno::EINVAL)?;
        // SAFETY: fresh anonymous mapping, zero-filled by the kernel.
        let base = unsafe {
            mmap_anonymous(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
            )?
        };
        Ok(Self {
            base,
            len,
            owned_name: None,
        })
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr().cast()
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        // SAFETY: `base`/`len` describe a mapping created in one of the
        // constructors and never handed out beyond the owning ring.
        if let Err(e) = unsafe { munmap(self.base, self.len) } {
            tracing::warn!(error = %e, "Failed to unmap shared segment");
        }
        if let Some(name) = self.owned_name.take() {
            match shm_unlink(name.as_str()) {
                Ok(()) | Err(Errno::ENOENT) => {
                    tracing::debug!(%name, "Unlinked shared segment");
                }
                Err(e) => tracing::warn!(%name, error = %e, "Failed to unlink shared segment"),
            }
        }
    }
}
