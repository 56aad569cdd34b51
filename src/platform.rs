//! Per-thread platform tweaks applied once when a worker starts.
//!
//! Neither hook affects correctness, only latency of floating-point heavy
//! or time-critical tasks.

use std::fmt;


pub trait PlatformHooks: Send + Sync + fmt::Debug {
    /// Best-effort scheduling priority boost for the calling thread.
    fn elevate_priority(&self) {}

    /// Flush denormal floats to zero on the calling thread.
    fn flush_denormals(&self) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl PlatformHooks for NoopHooks {}

/// Flushes denormals through the FPU control register on x86_64 and
/// aarch64. Priority elevation asks the OS for round-robin real-time
/// scheduling at the highest priority; it usually needs privileges and is
/// skipped with a debug log when refused.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeHooks;

impl PlatformHooks for NativeHooks {
    fn elevate_priority(&self) {
        set_realtime_priority();
    }

    fn flush_denormals(&self) {
        set_flush_to_zero();
    }
}

/// Returns whether the calling thread now runs under `SCHED_RR`.
#[cfg(any(target_os = "linux", target_os = "macos", target_os = "freebsd"))]
fn set_realtime_priority() -> bool {
    unsafe {
        let policy = libc::SCHED_RR;
        let max = libc::sched_get_priority_max(policy);
        if max < 0 {
            tracing::debug!("no priority range for SCHED_RR");
            return false;
        }

        let mut param: libc::sched_param = std::mem::zeroed();
        param.sched_priority = max;
        let result = libc::pthread_setschedparam(libc::pthread_self(), policy, &param);
        if result != 0 {
            tracing::debug!(
                thread = std::thread::current().name().unwrap_or("unknown"),
                errno = result,
                "real-time scheduling refused, keeping default priority"
            );
            return false;
        }
    }
    true
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "freebsd")))]
fn set_realtime_priority() -> bool {
    tracing::debug!("thread priority elevation is not supported on this platform");
    false
}

#[cfg(target_arch = "x86_64")]
fn set_flush_to_zero() {
    // FTZ (bit 15) | DAZ (bit 6)
    const FTZ_DAZ: u32 = 0x8040;
    let mut csr: u32 = 0;
    // SAFETY: MXCSR only controls floating-point behaviour of this thread.
    unsafe {
        std::arch::asm!("stmxcsr dword ptr [{}]", in(reg) std::ptr::addr_of_mut!(csr), options(nostack, preserves_flags));
        csr |= FTZ_DAZ;
        std::arch::asm!("ldmxcsr dword ptr [{}]", in(reg) std::ptr::addr_of!(csr), options(nostack, preserves_flags));
    }
}

#[cfg(target_arch = "aarch64")]
fn set_flush_to_zero() {
    const FZ: u64 = 1 << 24;
    let mut fpcr: u64;
    // SAFETY: FPCR only controls floating-point behaviour of this thread.
    unsafe {
        std::arch::asm!("mrs {}, fpcr", out(reg) fpcr, options(nomem, nostack, preserves_flags));
        fpcr |= FZ;
        std::arch::asm!("msr fpcr, {}", in(reg) fpcr, options(nomem, nostack, preserves_flags));
    }
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn set_flush_to_zero() {
    tracing::debug!("denormal flushing is not supported on this platform");
}
