// Note on unsafe usage.
//
// This module uses unsafe code to interact with the system calls that are
// used to read and set the current time of the clock. It is constructed in
// such a way that use of the public functions is safe regardless of given
// arguments.

use std::fmt::Display;
use std::io;
use std::time::{Duration, UNIX_EPOCH};

use sntp_proto::{NtpClock, NtpDuration, NtpTimestamp};

#[derive(Debug)]
pub struct ClockError(io::Error);

impl Display for ClockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "could not access the system clock: {}", self.0)
    }
}

impl std::error::Error for ClockError {}

fn cerr(t: libc::c_int) -> Result<(), ClockError> {
    match t {
        -1 => Err(ClockError(io::Error::last_os_error())),
        _ => Ok(()),
    }
}

/// Clock that reads and steps one of the unix clocks.
// Implementation note: this is intentionally a bare struct, the unix
// realtime clock is unique and no state is needed to interact with it.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnixClock {
    clock: libc::clockid_t,
}

impl UnixClock {
    pub fn realtime() -> Self {
        Self {
            clock: libc::CLOCK_REALTIME,
        }
    }

    fn clock_gettime(&self) -> Result<libc::timespec, ClockError> {
        let mut timespec = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };

        cerr(unsafe { libc::clock_gettime(self.clock, &mut timespec) })?;
        Ok(timespec)
    }

    fn clock_settime(&self, timespec: libc::timespec) -> Result<(), ClockError> {
        // clock_settime fails with EPERM unless the caller may set this
        // clock; the error is reported, not escalated.
        cerr(unsafe { libc::clock_settime(self.clock, &timespec) })
    }
}

impl NtpClock for UnixClock {
    type Error = ClockError;

    fn now(&self) -> Result<NtpTimestamp, Self::Error> {
        let timespec = self.clock_gettime()?;
        let time = UNIX_EPOCH + Duration::new(timespec.tv_sec as u64, timespec.tv_nsec as u32);
        Ok(NtpTimestamp::from_system_time(time))
    }

    fn step_clock(&self, offset: NtpDuration) -> Result<(), Self::Error> {
        let current = self.clock_gettime()?;

        let nanos = current.tv_sec as i128 * 1_000_000_000 + current.tv_nsec as i128
            + offset.as_ticks() as i128 * 100;
        let timespec = libc::timespec {
            tv_sec: nanos.div_euclid(1_000_000_000) as libc::time_t,
            tv_nsec: nanos.rem_euclid(1_000_000_000) as libc::c_long,
        };

        self.clock_settime(timespec)
    }
}
