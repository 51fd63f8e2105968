//! CPU PMU discovery.
//!
//! On a homogeneous machine the kernel exposes a single generic
//! `/sys/devices/cpu` event source and hardware events can be opened with
//! `PERF_TYPE_HARDWARE` directly. Heterogeneous machines (big.LITTLE and
//! friends) expose one event source per core cluster instead
//! (`/sys/devices/cpu_atom`, `/sys/devices/cpu_core`, ...), and a counter
//! must be opened against every one of them to observe the whole process.

use std::fs;
use std::path::Path;

use crate::error::Error;

const SYS_DEVICES: &str = "/sys/devices";

/// One CPU performance monitoring unit on a heterogeneous machine.
#[derive(Debug, Clone)]
pub struct Pmu {
    name: String,
    type_: u32,
}

impl Pmu {
    /// Read a PMU description from its sysfs directory.
    pub fn from_sysfs(path: &Path) -> Result<Pmu, Error> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let type_path = path.join("type");
        let display = type_path.display().to_string();
        let raw = fs::read_to_string(&type_path).map_err(|e| Error::sysfs(&display, e))?;
        let type_ = parse_pmu_type(&raw).ok_or_else(|| Error::parse(&display, &raw))?;

        log::debug!("found CPU PMU '{}' with type {}", name, type_);
        Ok(Pmu { name, type_ })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Encode a generic hardware event for this specific PMU: the PMU type
    /// goes in the high 32 bits of the event config.
    pub fn extended_config(&self, event: u64) -> u64 {
        ((self.type_ as u64) << 32) | event
    }
}

/// Which counter-opening strategy the machine requires.
#[derive(Debug)]
pub enum Topology {
    /// One generic CPU PMU; open events with `PERF_TYPE_HARDWARE`.
    SinglePmu,
    /// One PMU per core cluster; open every event on every PMU.
    MultiPmu(Vec<Pmu>),
}

/// Detect the machine's PMU layout from the sysfs device tree.
pub fn detect() -> Topology {
    detect_under(Path::new(SYS_DEVICES))
}

fn detect_under(devices: &Path) -> Topology {
    if devices.join("cpu").exists() {
        return Topology::SinglePmu;
    }

    let mut pmus = Vec::new();
    match fs::read_dir(devices) {
        Ok(entries) => {
            for entry in entries.flatten() {
                let name = entry.file_name();
                if !name.to_string_lossy().starts_with("cpu") {
                    continue;
                }
                match Pmu::from_sysfs(&entry.path()) {
                    Ok(pmu) => pmus.push(pmu),
                    Err(e) => log::warn!("skipping PMU {:?}: {}", name, e),
                }
            }
        }
        Err(e) => log::warn!("failed to enumerate {}: {}", devices.display(), e),
    }

    pmus.sort_by(|a, b| a.name.cmp(&b.name));
    Topology::MultiPmu(pmus)
}

fn parse_pmu_type(raw: &str) -> Option<u32> {
    raw.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn pmu_type_parses_with_trailing_newline() {
        assert_eq!(parse_pmu_type("8\n"), Some(8));
        assert_eq!(parse_pmu_type("  10  "), Some(10));
        assert_eq!(parse_pmu_type("atom"), None);
    }

    #[test]
    fn extended_config_keeps_event_in_low_bits() {
        let pmu = Pmu {
            name: "cpu_atom".into(),
            type_: 10,
        };
        assert_eq!(pmu.extended_config(1), (10 << 32) | 1);
    }

    #[test]
    fn generic_entry_means_single_pmu() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("cpu")).unwrap();
        assert!(matches!(detect_under(dir.path()), Topology::SinglePmu));
    }

    #[test]
    fn cpu_prefixed_entries_become_pmus() {
        let dir = tempfile::tempdir().unwrap();
        for (name, type_) in [("cpu_atom", "10"), ("cpu_core", "4")] {
            let pmu_dir = dir.path().join(name);
            fs::create_dir(&pmu_dir).unwrap();
            fs::write(pmu_dir.join("type"), type_).unwrap();
        }
        fs::create_dir(dir.path().join("software")).unwrap();

        match detect_under(dir.path()) {
            Topology::MultiPmu(pmus) => {
                let names: Vec<_> = pmus.iter().map(Pmu::name).collect();
                assert_eq!(names, ["cpu_atom", "cpu_core"]);
            }
            other => panic!("unexpected topology: {:?}", other),
        }
    }

    #[test]
    fn unparsable_pmu_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("cpu_core");
        fs::create_dir(&good).unwrap();
        fs::write(good.join("type"), "4\n").unwrap();
        // no `type` file at all for this one
        fs::create_dir(dir.path().join("cpu_atom")).unwrap();

        match detect_under(dir.path()) {
            Topology::MultiPmu(pmus) => {
                assert_eq!(pmus.len(), 1);
                assert_eq!(pmus[0].name(), "cpu_core");
            }
            other => panic!("unexpected topology: {:?}", other),
        }
    }
}
