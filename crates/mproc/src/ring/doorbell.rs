//! Cross-process wait/wake on a 32-bit word inside a shared segment.
//!
//! Waiters sample the word, re-check their condition, then sleep only while
//! the word still holds the sampled value. Wakers bump the word before waking,
//! so a wake between sample and sleep is never lost. Every sleep is a bounded
//! slice; callers loop and re-check.

use std::sync::atomic::AtomicU32;
use std::time::Duration;

#[cfg(target_os = "linux")]
pub(crate) fn wait(word: &AtomicU32, expected: u32, slice: Duration) {
    let timeout = libc::timespec {
        tv_sec: slice.as_secs() as libc::time_t,
        tv_nsec: slice.subsec_nanos() as libc::c_long,
    };
    // Not FUTEX_PRIVATE: the word is shared with another process.
    // SAFETY: `word` lives in a mapping that outlives this call. EAGAIN,
    // ETIMEDOUT and EINTR all mean "re-check", so the result is ignored.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT,
            expected,
            &timeout as *const libc::timespec,
            std::ptr::null::<u32>(),
            0u32,
        );
    }
}

#[cfg(target_os = "linux")]
pub(crate) fn wake_all(word: &AtomicU32) {
    // SAFETY: see `wait`.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAKE,
            i32::MAX,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null::<u32>(),
            0u32,
        );
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn wait(word: &AtomicU32, expected: u32, slice: Duration) {
    use std::sync::atomic::Ordering;

    if word.load(Ordering::Acquire) == expected {
        std::thread::sleep(slice.min(Duration::from_micros(500)));
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn wake_all(_word: &AtomicU32) {}
