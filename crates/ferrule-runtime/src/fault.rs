//! Fault barrier
//!
//! [`guarded`] wraps an operation touching foreign memory. Best-effort
//! native handlers are installed before the call and restored afterwards; a
//! segmentation violation or abort raised strictly inside the guarded call
//! is converted into [`Error::SegmentViolation`] / [`Error::Aborted`]
//! instead of terminating the process. Faults outside a barrier keep their
//! default, fatal behavior.
//!
//! This is containment at a boundary, not a safety proof: after a caught
//! fault the process is degraded but structurally valid — stack frames of
//! the guarded call are abandoned, not unwound, so resources they held may
//! leak. Nothing stronger than "did not silently crash" is guaranteed.
//! A Rust panic must not cross the barrier; the guarded closure is expected
//! to return normally or fault.

use crate::error::{Error, Result};

#[cfg(unix)]
mod imp {
    use super::*;
    use std::cell::Cell;
    use std::os::raw::c_int;

    // Opaque, oversized sigjmp_buf. The largest platform buffer (glibc
    // aarch64) is well under 512 bytes.
    #[repr(C, align(16))]
    struct JmpBuf([u8; 512]);

    impl JmpBuf {
        fn zeroed() -> JmpBuf {
            JmpBuf([0u8; 512])
        }
    }

    // glibc only exports sigsetjmp under its internal name; the public name
    // is a header macro.
    #[cfg(target_os = "linux")]
    extern "C" {
        #[link_name = "__sigsetjmp"]
        fn sigsetjmp(env: *mut JmpBuf, savemask: c_int) -> c_int;
        fn siglongjmp(env: *mut JmpBuf, val: c_int) -> !;
    }

    #[cfg(not(target_os = "linux"))]
    extern "C" {
        fn sigsetjmp(env: *mut JmpBuf, savemask: c_int) -> c_int;
        fn siglongjmp(env: *mut JmpBuf, val: c_int) -> !;
    }

    const GUARDED_SIGNALS: [c_int; 3] = [libc::SIGSEGV, libc::SIGBUS, libc::SIGABRT];

    // Jump target of the innermost active barrier on this thread. The
    // snapshot begins with its jump buffer, so this doubles as the snapshot
    // address on the fault path.
    thread_local! {
        static CURRENT: Cell<*mut JmpBuf> = const { Cell::new(std::ptr::null_mut()) };
    }

    #[repr(C)]
    struct Snapshot {
        buf: JmpBuf,
        prev: *mut JmpBuf,
        saved: [libc::sigaction; 3],
    }

    extern "C" fn fault_handler(sig: c_int) {
        let buf = CURRENT.with(|c| c.get());
        if !buf.is_null() {
            unsafe { siglongjmp(buf, sig) }
        }
        // No barrier active on this thread: make the fault fatal again.
        unsafe {
            libc::signal(sig, libc::SIG_DFL);
            libc::raise(sig);
        }
    }

    unsafe fn install_handlers() -> [libc::sigaction; 3] {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = fault_handler as usize;
        action.sa_flags = libc::SA_NODEFER;
        libc::sigemptyset(&mut action.sa_mask);

        let mut saved: [libc::sigaction; 3] = std::mem::zeroed();
        for (i, sig) in GUARDED_SIGNALS.iter().enumerate() {
            libc::sigaction(*sig, &action, &mut saved[i]);
        }
        saved
    }

    unsafe fn restore_handlers(saved: &[libc::sigaction; 3]) {
        for (i, sig) in GUARDED_SIGNALS.iter().enumerate() {
            libc::sigaction(*sig, &saved[i], std::ptr::null_mut());
        }
    }

    pub fn guarded<T, F: FnOnce() -> T>(f: F) -> Result<T> {
        unsafe {
            let snapshot = Box::new(Snapshot {
                buf: JmpBuf::zeroed(),
                prev: CURRENT.with(|c| c.get()),
                saved: install_handlers(),
            });
            // The snapshot lives behind a raw pointer so that no stack value
            // with a destructor straddles the non-local jump.
            let snap = Box::into_raw(snapshot);
            CURRENT.with(|c| c.set(snap as *mut JmpBuf));

            let sig = sigsetjmp(snap as *mut JmpBuf, 1);
            if sig != 0 {
                // Second return: a fault was trapped inside the call.
                // Recover the snapshot address from thread-local state, not
                // from stack locals the jump may have clobbered.
                let snap = CURRENT.with(|c| c.get()) as *mut Snapshot;
                let snapshot = Box::from_raw(snap);
                CURRENT.with(|c| c.set(snapshot.prev));
                restore_handlers(&snapshot.saved);
                return Err(if sig == libc::SIGABRT {
                    Error::Aborted
                } else {
                    Error::SegmentViolation
                });
            }

            let result = f();

            let snap = CURRENT.with(|c| c.get()) as *mut Snapshot;
            let snapshot = Box::from_raw(snap);
            CURRENT.with(|c| c.set(snapshot.prev));
            restore_handlers(&snapshot.saved);
            Ok(result)
        }
    }
}

#[cfg(not(unix))]
mod imp {
    use super::*;

    /// No native trap conversion on this platform; the call runs unguarded.
    pub fn guarded<T, F: FnOnce() -> T>(f: F) -> Result<T> {
        Ok(f())
    }
}

/// Run `f` with native faults converted to errors. See the module docs for
/// the containment caveats.
pub fn guarded<T, F: FnOnce() -> T>(f: F) -> Result<T> {
    imp::guarded(f)
}
