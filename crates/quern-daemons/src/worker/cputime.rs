//! Per-thread CPU time measurement
//!
//! Python-style per-process CPU accounting is useless for a thread pool, so
//! the watcher reads each task thread's own CPU clock. On Linux this is
//! `pthread_getcpuclockid` + `clock_gettime`; elsewhere CPU deadlines are
//! reported as unavailable and only wall-clock deadlines fire.

use std::time::Duration;

/// Handle to one OS thread's CPU-time clock
///
/// Obtained on the thread itself; readable from any thread afterwards.
#[derive(Debug, Clone, Copy)]
pub struct ThreadCpuClock {
    #[cfg(target_os = "linux")]
    clock_id: libc::clockid_t,
}

#[cfg(target_os = "linux")]
impl ThreadCpuClock {
    /// Capture the calling thread's CPU clock
    pub fn for_current_thread() -> Option<Self> {
        let mut clock_id: libc::clockid_t = 0;
        let rc = unsafe { libc::pthread_getcpuclockid(libc::pthread_self(), &mut clock_id) };
        (rc == 0).then_some(Self { clock_id })
    }

    /// CPU time consumed by the owning thread so far
    ///
    /// Returns None once the thread has exited and its clock is gone.
    pub fn elapsed(&self) -> Option<Duration> {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        let rc = unsafe { libc::clock_gettime(self.clock_id, &mut ts) };
        (rc == 0).then(|| Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32))
    }
}

#[cfg(not(target_os = "linux"))]
impl ThreadCpuClock {
    pub fn for_current_thread() -> Option<Self> {
        None
    }

    pub fn elapsed(&self) -> Option<Duration> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(target_os = "linux")]
    fn test_cpu_clock_advances_under_load() {
        let clock = ThreadCpuClock::for_current_thread().expect("thread cpu clock");
        let before = clock.elapsed().expect("readable clock");

        // Burn a little CPU on this thread
        let mut acc: u64 = 0;
        for i in 0..5_000_000u64 {
            acc = acc.wrapping_mul(31).wrapping_add(i);
        }
        std::hint::black_box(acc);

        let after = clock.elapsed().expect("readable clock");
        assert!(after >= before);
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_cpu_clock_ignores_sleep() {
        let clock = ThreadCpuClock::for_current_thread().expect("thread cpu clock");
        let before = clock.elapsed().expect("readable clock");

        std::thread::sleep(Duration::from_millis(50));

        let after = clock.elapsed().expect("readable clock");
        // Sleeping consumes no measurable CPU time
        assert!(after - before < Duration::from_millis(40));
    }
}
