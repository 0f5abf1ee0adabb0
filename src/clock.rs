//! Clock object: tick<->timespec<->calendar conversions
//! with an adjustable epoch.
//!
//! Ported from `lib/copperplate/clockobj.c`. The source supports two
//! backends behind the same `ticks_t` arithmetic: Cobalt's TSC-based
//! clock, and Mercury's plain `CLOCK_MONOTONIC` reading plus a
//! settable offset for the wall-clock "date". A single-kernel POSIX
//! host only ever has the Mercury path, so this is a direct port of
//! that side, with [`std::time::Instant`] standing in for
//! `clock_gettime(CLOCK_COPPERPLATE, ...)`.
//!
//! The civil-date decomposition (`caltime_to_ticks`/`ticks_to_caltime`)
//! is carried over tick for tick from the source's own from-scratch
//! arithmetic (it pulls in no calendar library either) — including the
//! same "we don't care about DST" shortcut.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

pub type Ticks = u64;

const SEC_PER_MIN: i64 = 60;
const SEC_PER_HOUR: i64 = SEC_PER_MIN * 60;
const SEC_PER_DAY: i64 = SEC_PER_HOUR * 24;
const MDAYS: [i64; 12] = [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];

/// A broken-down calendar time: the port's equivalent of `struct tm`,
/// restricted to the fields the conversions actually use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalendarTime {
    /// Full year, e.g. 2026 (the source's `tm_year` is 1900-based; we
    /// don't carry that historical offset forward).
    pub year: i64,
    /// 0-based, matching `tm_mon`.
    pub month: u32,
    /// 1-based, matching `tm_mday`.
    pub day: u32,
    pub hour: u32,
    pub minute: u32,
    pub second: u32,
}

/// Converts a calendar time plus sub-second `sub_ticks` into ticks
/// since the Unix epoch, at `frequency` ticks/second. Ported from
/// `clockobj_caltime_to_ticks`.
pub fn caltime_to_ticks(cal: &CalendarTime, sub_ticks: u64, frequency: u64) -> Ticks {
    let mut t: i64 = 0;
    for n in 1970..cal.year {
        t += if n % 4 != 0 { 365 } else { 366 };
    }
    if cal.year % 4 == 0 && cal.month >= 2 {
        t += 1;
    }
    for n in (0..cal.month as i64).rev() {
        t += MDAYS[n as usize];
    }
    t += cal.day as i64 - 1;
    t *= 24;
    t += cal.hour as i64;
    t *= 60;
    t += cal.minute as i64;
    t *= 60;
    t += cal.second as i64;
    t as Ticks * frequency + sub_ticks
}

/// Inverse of [`caltime_to_ticks`], ported from
/// `clockobj_ticks_to_caltime`.
pub fn ticks_to_caltime(ticks: Ticks, frequency: u64) -> (CalendarTime, u64) {
    let mut secs = (ticks / frequency) as i64;
    let sub_ticks = ticks % frequency;

    let mut year = 1970i64;
    loop {
        let ysecs = (if year % 4 != 0 { 365 } else { 366 }) * SEC_PER_DAY;
        if ysecs > secs {
            break;
        }
        secs -= ysecs;
        year += 1;
    }

    let mut month = 0u32;
    loop {
        let mut sec_by_month = MDAYS[month as usize] * SEC_PER_DAY;
        if month == 1 && year % 4 == 0 {
            sec_by_month += SEC_PER_DAY;
        }
        if sec_by_month > secs {
            break;
        }
        secs -= sec_by_month;
        month += 1;
    }

    let day = secs / SEC_PER_DAY;
    secs -= day * SEC_PER_DAY;
    let hour = secs / SEC_PER_HOUR;
    secs -= hour * SEC_PER_HOUR;
    let minute = secs / SEC_PER_MIN;
    secs -= minute * SEC_PER_MIN;
    let second = secs;

    (
        CalendarTime {
            year,
            month,
            day: day as u32 + 1,
            hour: hour as u32,
            minute: minute as u32,
            second: second as u32,
        },
        sub_ticks,
    )
}

struct ClockState {
    /// Signed nanosecond offset from the monotonic anchor to the
    /// current wall-clock epoch, set by [`ClockObj::set_date`].
    offset_ns: i128,
}

/// A named clock with a configurable tick resolution and a settable
/// wall-clock date, matching `struct clockobj`.
pub struct ClockObj {
    name: String,
    resolution_ns: u64,
    frequency: u64,
    anchor: Instant,
    state: Mutex<ClockState>,
}

impl ClockObj {
    /// `resolution_ns` must be non-zero; `1` means nanosecond
    /// resolution (`frequency` saturates to 1_000_000_000), matching
    /// `clockobj_init`'s rejection of a zero resolution.
    pub fn new(name: &str, resolution_ns: u32) -> Self {
        assert!(resolution_ns > 0, "clock resolution must be non-zero");
        ClockObj {
            name: name.to_string(),
            resolution_ns: resolution_ns as u64,
            frequency: 1_000_000_000 / resolution_ns as u64,
            anchor: Instant::now(),
            state: Mutex::new(ClockState { offset_ns: 0 }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn resolution_ns(&self) -> u64 {
        self.resolution_ns
    }

    pub fn frequency(&self) -> u64 {
        self.frequency
    }

    fn elapsed_ns(&self) -> i128 {
        self.anchor.elapsed().as_nanos() as i128
    }

    fn ns_to_ticks(&self, ns: i128) -> Ticks {
        (ns.max(0) as u128 / self.resolution_ns as u128) as Ticks
    }

    /// Monotonic tick count since this clock was created, with no
    /// wall-clock offset applied; matches `clockobj_get_time`.
    pub fn get_time(&self) -> Ticks {
        self.ns_to_ticks(self.elapsed_ns())
    }

    /// Current wall-clock tick count, i.e. monotonic time plus the
    /// offset established by [`ClockObj::set_date`]; matches
    /// `clockobj_get_date`.
    pub fn get_date(&self) -> Ticks {
        let offset_ns = self.state.lock().offset_ns;
        self.ns_to_ticks(self.elapsed_ns() + offset_ns)
    }

    /// Rebases the wall-clock epoch so that [`ClockObj::get_date`]
    /// reads `ticks` right now; matches `clockobj_set_date`.
    pub fn set_date(&self, ticks: Ticks) {
        let epoch_ns = ticks as i128 * self.resolution_ns as i128;
        let mut state = self.state.lock();
        state.offset_ns = epoch_ns - self.elapsed_ns();
    }

    /// Sets the wall-clock date from a calendar time, matching
    /// `clockobj_set_date` composed with `clockobj_caltime_to_ticks`.
    pub fn set_caltime(&self, cal: &CalendarTime, sub_ticks: u64) {
        self.set_date(caltime_to_ticks(cal, sub_ticks, self.frequency));
    }

    /// Reads the current wall-clock date broken down into calendar
    /// fields, matching `clockobj_ticks_to_caltime` applied to
    /// `clockobj_get_date`'s result.
    pub fn get_caltime(&self) -> (CalendarTime, u64) {
        ticks_to_caltime(self.get_date(), self.frequency)
    }

    /// Converts a tick-denominated delay into an absolute [`Instant`]
    /// deadline, the port's equivalent of
    /// `__clockobj_ticks_to_timeout`.
    pub fn ticks_to_deadline(&self, ticks: Ticks) -> Instant {
        Instant::now() + Duration::from_nanos(ticks * self.resolution_ns)
    }

    /// Converts a tick count to a [`Duration`], matching
    /// `__clockobj_ticks_to_timespec`.
    pub fn ticks_to_duration(&self, ticks: Ticks) -> Duration {
        Duration::from_nanos(ticks * self.resolution_ns)
    }

    /// Converts a [`Duration`] to ticks at this clock's resolution,
    /// matching `clockobj_ns_to_ticks`.
    pub fn duration_to_ticks(&self, d: Duration) -> Ticks {
        d.as_nanos() as Ticks / self.resolution_ns
    }
}
