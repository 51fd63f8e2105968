//! Package energy measurement in microjoules.
//!
//! The preferred source is the kernel's RAPL PMU (the `power` event
//! source): one ungrouped perf counter whose raw value, multiplied by the
//! sysfs-reported scale, yields joules. Unlike the hardware counters this
//! one keeps `exclude_kernel` at 0: package energy is a machine-level
//! quantity and carving out kernel execution would make it meaningless.
//!
//! When the PMU is unavailable (no RAPL driver, insufficient perms) the
//! powercap sysfs tree serves as a fallback; it wraps at a reported
//! maximum, so the reader accumulates deltas across wraps. A separate
//! sensor-rail source covers boards that expose energy only through i2c
//! power monitors.

use std::fs::{self, File};
use std::io::Read;
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::path::{Path, PathBuf};

use perf_event_open_sys as sys;
use sys::bindings::perf_event_attr;

use crate::check_errno_syscall;
use crate::error::Error;

const POWER_PMU_TYPE: &str = "/sys/bus/event_source/devices/power/type";
const ENERGY_PKG_EVENT: &str = "/sys/bus/event_source/devices/power/events/energy-pkg";
const ENERGY_PKG_SCALE: &str = "/sys/bus/event_source/devices/power/events/energy-pkg.scale";

const POWERCAP_ENERGY: &str = "/sys/devices/virtual/powercap/intel-rapl/intel-rapl:0/energy_uj";
const POWERCAP_MAX: &str =
    "/sys/devices/virtual/powercap/intel-rapl/intel-rapl:0/max_energy_range_uj";

fn read_sysfs(path: &str) -> Result<String, Error> {
    fs::read_to_string(path).map_err(|e| Error::sysfs(path, e))
}

/// Parse the `event=<hex>` line of a PMU event description.
fn parse_event_code(raw: &str) -> Option<u64> {
    let hex = raw.trim().strip_prefix("event=0x")?;
    u64::from_str_radix(hex, 16).ok()
}

/// Scale a raw RAPL count to whole microjoules. `scale` is the
/// sysfs-reported size of one count in joules.
fn scale_to_microjoules(raw: u64, scale: f64) -> u64 {
    (raw as f64 * scale * 1e6) as u64
}

/// The delta between two powercap readings of a counter that wraps at
/// `max`.
fn wrap_delta(last: u64, current: u64, max: u64) -> u64 {
    if current < last {
        (max - last) + current
    } else {
        current - last
    }
}

/// The package energy counter behind the kernel's RAPL PMU.
pub struct RaplCounter {
    file: File,
    scale: f64,
}

impl RaplCounter {
    pub fn open() -> Result<RaplCounter, Error> {
        let type_raw = read_sysfs(POWER_PMU_TYPE)?;
        let type_: u32 = type_raw
            .trim()
            .parse()
            .map_err(|_| Error::parse(POWER_PMU_TYPE, &type_raw))?;

        let event_raw = read_sysfs(ENERGY_PKG_EVENT)?;
        let config =
            parse_event_code(&event_raw).ok_or_else(|| Error::parse(ENERGY_PKG_EVENT, &event_raw))?;

        let scale_raw = read_sysfs(ENERGY_PKG_SCALE)?;
        let scale: f64 = scale_raw
            .trim()
            .parse()
            .map_err(|_| Error::parse(ENERGY_PKG_SCALE, &scale_raw))?;
        log::debug!("RAPL counts are {:e} J each", scale);

        let mut attrs = perf_event_attr {
            size: std::mem::size_of::<perf_event_attr>() as u32,
            type_,
            config,
            ..perf_event_attr::default()
        };
        attrs.set_disabled(1);
        // exclude_kernel stays 0: the package burns energy no matter who is
        // executing.

        let fd = check_errno_syscall(|| unsafe {
            // The power PMU only supports machine-wide counters, so this is
            // pid -1 (everyone) on cpu 0.
            sys::perf_event_open(&mut attrs, -1, 0, -1, 0)
        })?;
        let file = unsafe { File::from_raw_fd(fd) };

        check_errno_syscall(|| unsafe { sys::ioctls::RESET(file.as_raw_fd(), 0) })?;
        check_errno_syscall(|| unsafe { sys::ioctls::ENABLE(file.as_raw_fd(), 0) })?;

        Ok(RaplCounter { file, scale })
    }

    /// Current energy since open, in microjoules. A failed read is logged
    /// and reported as 0.
    pub fn read(&mut self) -> u64 {
        let mut buf = [0_u64; 1];
        match self.file.read(crate::as_byte_slice_mut(&mut buf)) {
            Ok(n) if n >= std::mem::size_of::<u64>() => scale_to_microjoules(buf[0], self.scale),
            Ok(_) => {
                log::error!("short read from the RAPL counter");
                0
            }
            Err(e) => {
                log::error!("failed to read the RAPL counter: {}", e);
                0
            }
        }
    }
}

/// Fallback energy source: the powercap sysfs node, which reports
/// cumulative microjoules directly but wraps at a maximum.
pub struct PowercapReader {
    energy_path: PathBuf,
    max_path: PathBuf,
    last: u64,
    total: u64,
}

impl PowercapReader {
    pub fn open() -> Result<PowercapReader, Error> {
        Self::open_at(Path::new(POWERCAP_ENERGY), Path::new(POWERCAP_MAX))
    }

    pub fn open_at(energy_path: &Path, max_path: &Path) -> Result<PowercapReader, Error> {
        let last = read_u64_node(energy_path)?;
        Ok(PowercapReader {
            energy_path: energy_path.to_path_buf(),
            max_path: max_path.to_path_buf(),
            last,
            total: 0,
        })
    }

    /// Accumulated energy since open, in microjoules, carried across
    /// counter wraps.
    pub fn read(&mut self) -> u64 {
        let current = match read_u64_node(&self.energy_path) {
            Ok(v) => v,
            Err(e) => {
                log::error!("failed to read powercap energy: {}", e);
                return self.total;
            }
        };

        if current < self.last {
            match read_u64_node(&self.max_path) {
                Ok(max) => self.total += wrap_delta(self.last, current, max),
                Err(e) => log::error!("failed to read powercap range: {}", e),
            }
        } else {
            self.total += current - self.last;
        }

        self.last = current;
        self.total
    }
}

fn read_u64_node(path: &Path) -> Result<u64, Error> {
    let display = path.display().to_string();
    let raw = fs::read_to_string(path).map_err(|e| Error::sysfs(&display, e))?;
    raw.trim().parse().map_err(|_| Error::parse(&display, &raw))
}

/// Energy source for boards whose power monitors sit on an i2c bus
/// (big cluster, DRAM, little cluster). Each sensor reports cumulative
/// joules once its `enable` node is written.
pub struct SensorRails {
    rails: Vec<PathBuf>,
    baseline: Vec<f64>,
}

/// The three power-monitor rails of the supported boards.
pub const I2C_RAILS: [&str; 3] = [
    "/sys/bus/i2c/devices/0-0040", // big
    "/sys/bus/i2c/devices/0-0041", // dram
    "/sys/bus/i2c/devices/0-0045", // little
];

impl SensorRails {
    pub fn open() -> Result<SensorRails, Error> {
        Self::open_at(&I2C_RAILS.map(PathBuf::from))
    }

    pub fn open_at(rails: &[PathBuf]) -> Result<SensorRails, Error> {
        let mut baseline = Vec::with_capacity(rails.len());
        for rail in rails {
            let enable = rail.join("enable");
            fs::write(&enable, "1")
                .map_err(|e| Error::sysfs(&enable.display().to_string(), e))?;
            baseline.push(Self::read_joules(rail)?);
        }
        Ok(SensorRails {
            rails: rails.to_vec(),
            baseline,
        })
    }

    fn read_joules(rail: &Path) -> Result<f64, Error> {
        let path = rail.join("sensor_J");
        let display = path.display().to_string();
        let raw = fs::read_to_string(&path).map_err(|e| Error::sysfs(&display, e))?;
        raw.trim().parse().map_err(|_| Error::parse(&display, &raw))
    }

    /// Summed energy across all rails since open, in microjoules.
    pub fn read(&mut self) -> u64 {
        let mut total = 0.0;
        for (rail, base) in self.rails.iter().zip(&self.baseline) {
            match Self::read_joules(rail) {
                Ok(joules) => total += (joules - base) * 1e6,
                Err(e) => log::error!("failed to read power sensor: {}", e),
            }
        }
        total.max(0.0) as u64
    }
}

impl Drop for SensorRails {
    fn drop(&mut self) {
        for rail in &self.rails {
            let _ = fs::write(rail.join("enable"), "0");
        }
    }
}

/// Whichever energy source the machine offers. Exactly one is active per
/// process.
pub enum EnergyCounter {
    Rapl(RaplCounter),
    Powercap(PowercapReader),
    Rails(SensorRails),
    /// Nothing opened; reads are always 0 and the pipeline keeps running.
    Disabled,
}

impl EnergyCounter {
    /// Pick a source: the RAPL PMU if it opens, else powercap, else none.
    pub fn open() -> EnergyCounter {
        match RaplCounter::open() {
            Ok(counter) => return EnergyCounter::Rapl(counter),
            Err(e) => log::error!("cannot use the RAPL PMU for energy: {}", e),
        }
        match PowercapReader::open() {
            Ok(reader) => {
                log::info!("falling back to powercap for energy");
                EnergyCounter::Powercap(reader)
            }
            Err(e) => {
                log::error!("cannot use powercap for energy: {}", e);
                EnergyCounter::Disabled
            }
        }
    }

    /// Energy since open, in microjoules.
    pub fn read(&mut self) -> u64 {
        match self {
            EnergyCounter::Rapl(c) => c.read(),
            EnergyCounter::Powercap(r) => r.read(),
            EnergyCounter::Rails(s) => s.read(),
            EnergyCounter::Disabled => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn event_code_parses_from_sysfs_format() {
        assert_eq!(parse_event_code("event=0x02\n"), Some(2));
        assert_eq!(parse_event_code("event=0x1a"), Some(26));
        assert_eq!(parse_event_code("umask=0x02"), None);
    }

    #[test]
    fn raw_counts_scale_to_microjoules() {
        // A typical RAPL scale: 2^-32 joules per count.
        let scale = 2.3283064365386962890625e-10;
        assert_eq!(scale_to_microjoules(1 << 32, scale), 1_000_000);
        assert_eq!(scale_to_microjoules(0, scale), 0);
    }

    #[test]
    fn wrap_delta_carries_across_the_wrap() {
        let max = 262_143_328_850;
        assert_eq!(wrap_delta(max - 1, 2, max), 3);
        assert_eq!(wrap_delta(100, 350, max), 250);
    }

    #[test]
    fn powercap_accumulates_across_wraps() {
        let dir = tempfile::tempdir().unwrap();
        let energy = dir.path().join("energy_uj");
        let max = dir.path().join("max_energy_range_uj");
        fs::write(&energy, "990\n").unwrap();
        fs::write(&max, "1000\n").unwrap();

        let mut reader = PowercapReader::open_at(&energy, &max).unwrap();
        fs::write(&energy, "995\n").unwrap();
        assert_eq!(reader.read(), 5);

        // wrap: 995 -> 1000 is 5 more, then 3 past zero
        fs::write(&energy, "3\n").unwrap();
        assert_eq!(reader.read(), 13);
    }

    #[test]
    fn sensor_rails_sum_their_deltas() {
        let dir = tempfile::tempdir().unwrap();
        let mut rails = Vec::new();
        for (name, joules) in [("big", "1.5"), ("dram", "0.25")] {
            let rail = dir.path().join(name);
            fs::create_dir(&rail).unwrap();
            fs::write(rail.join("sensor_J"), joules).unwrap();
            rails.push(rail);
        }

        let mut sensors = SensorRails::open_at(&rails).unwrap();
        assert_eq!(fs::read_to_string(rails[0].join("enable")).unwrap(), "1");

        fs::write(rails[0].join("sensor_J"), "2.0").unwrap();
        fs::write(rails[1].join("sensor_J"), "0.75").unwrap();
        assert_eq!(sensors.read(), 1_000_000);

        drop(sensors);
        assert_eq!(fs::read_to_string(rails[0].join("enable")).unwrap(), "0");
    }
}
