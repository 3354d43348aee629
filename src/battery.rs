//! Battery and AC adapter state from the Linux power-supply sysfs.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// Kernel power_supply sysfs base path
pub const POWER_SUPPLY_ROOT: &str = "/sys/class/power_supply";

/// Common battery directory names across laptop vendors
const BATTERY_NAMES: [&str; 4] = ["BAT0", "BAT1", "BATT", "battery"];
/// Common AC adapter directory names
const AC_NAMES: [&str; 6] = ["AC", "AC0", "ADP0", "ADP1", "ACAD", "ac"];

/// Battery status values (matching kernel power_supply.h)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatteryStatus {
    Charging,
    Discharging,
    NotCharging,
    Full,
    Unknown,
}

impl BatteryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Charging => "Charging",
            Self::Discharging => "Discharging",
            Self::NotCharging => "Not charging",
            Self::Full => "Full",
            Self::Unknown => "Unknown",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "Charging" => Self::Charging,
            "Discharging" => Self::Discharging,
            "Not charging" => Self::NotCharging,
            "Full" => Self::Full,
            _ => Self::Unknown,
        }
    }
}

fn find_supply(root: &Path, candidates: &[&str], supply_type: &str) -> Option<PathBuf> {
    for name in candidates {
        let path = root.join(name);
        if path.is_dir() {
            debug!("Found {supply_type} at {}", path.display());
            return Some(path);
        }
    }

    // No well-known name matched; scan for a matching `type` file.
    let mut entries: Vec<PathBuf> = fs::read_dir(root)
        .ok()?
        .flatten()
        .map(|entry| entry.path())
        .collect();
    entries.sort();

    for entry in entries {
        let Ok(contents) = fs::read_to_string(entry.join("type")) else {
            continue;
        };
        if contents.trim() == supply_type {
            debug!("Found {supply_type} at {} (via type scan)", entry.display());
            return Some(entry);
        }
    }
    None
}

/// Reads battery percent and charging status for the engine.
///
/// Supplies are located once at construction; the percent/status files
/// are re-read on every call so the engine always sees fresh values.
pub struct BatteryReader {
    battery_path: Option<PathBuf>,
    ac_path: Option<PathBuf>,
}

impl BatteryReader {
    pub fn new(root: &Path) -> Self {
        let battery_path = find_supply(root, &BATTERY_NAMES, "Battery");
        let ac_path = find_supply(root, &AC_NAMES, "Mains");

        if battery_path.is_none() {
            warn!("No battery found under {}", root.display());
        }
        if ac_path.is_none() {
            warn!("No AC adapter found under {}", root.display());
        }

        Self {
            battery_path,
            ac_path,
        }
    }

    pub fn available(&self) -> bool {
        self.battery_path.is_some()
    }

    /// Battery charge percent (0-100), or `None` when no battery was
    /// detected or the capacity file is unreadable.
    pub fn read_percent(&self) -> Option<u8> {
        let path = self.battery_path.as_ref()?;
        fs::read_to_string(path.join("capacity"))
            .ok()?
            .trim()
            .parse()
            .ok()
    }

    pub fn read_status(&self) -> Option<BatteryStatus> {
        let path = self.battery_path.as_ref()?;
        let contents = fs::read_to_string(path.join("status")).ok()?;
        Some(BatteryStatus::parse(contents.trim()))
    }

    pub fn read_ac_online(&self) -> Option<bool> {
        let path = self.ac_path.as_ref()?;
        let contents = fs::read_to_string(path.join("online")).ok()?;
        Some(contents.trim() == "1")
    }
}

impl Default for BatteryReader {
    fn default() -> Self {
        Self::new(Path::new(POWER_SUPPLY_ROOT))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_supply(root: &Path, name: &str, files: &[(&str, &str)]) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        for (file, contents) in files {
            fs::write(dir.join(file), contents).unwrap();
        }
    }

    #[test]
    fn test_detects_well_known_names() {
        let tmp = tempfile::tempdir().unwrap();
        write_supply(
            tmp.path(),
            "BAT0",
            &[("type", "Battery\n"), ("capacity", "73\n"), ("status", "Charging\n")],
        );
        write_supply(tmp.path(), "AC", &[("type", "Mains\n"), ("online", "1\n")]);

        let reader = BatteryReader::new(tmp.path());
        assert!(reader.available());
        assert_eq!(reader.read_percent(), Some(73));
        assert_eq!(reader.read_status(), Some(BatteryStatus::Charging));
        assert_eq!(reader.read_ac_online(), Some(true));
    }

    #[test]
    fn test_detects_by_type_scan() {
        let tmp = tempfile::tempdir().unwrap();
        write_supply(
            tmp.path(),
            "CMB1",
            &[("type", "Battery\n"), ("capacity", "41\n")],
        );
        write_supply(tmp.path(), "ucsi-source-psy-2", &[("type", "USB\n")]);

        let reader = BatteryReader::new(tmp.path());
        assert_eq!(reader.read_percent(), Some(41));
        assert_eq!(reader.read_ac_online(), None);
    }

    #[test]
    fn test_missing_battery() {
        let tmp = tempfile::tempdir().unwrap();
        let reader = BatteryReader::new(tmp.path());
        assert!(!reader.available());
        assert_eq!(reader.read_percent(), None);
        assert_eq!(reader.read_status(), None);
        assert_eq!(reader.read_ac_online(), None);
    }

    #[test]
    fn test_missing_files_are_none() {
        let tmp = tempfile::tempdir().unwrap();
        write_supply(tmp.path(), "BAT0", &[("type", "Battery\n")]);
        let reader = BatteryReader::new(tmp.path());
        assert!(reader.available());
        assert_eq!(reader.read_percent(), None);
        assert_eq!(reader.read_status(), None);
    }

    #[test]
    fn test_trims_whitespace() {
        let tmp = tempfile::tempdir().unwrap();
        write_supply(
            tmp.path(),
            "BAT1",
            &[("type", "Battery\n"), ("capacity", " 88 \n"), ("status", "Not charging\n")],
        );
        let reader = BatteryReader::new(tmp.path());
        assert_eq!(reader.read_percent(), Some(88));
        assert_eq!(reader.read_status(), Some(BatteryStatus::NotCharging));
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(BatteryStatus::parse("Full"), BatteryStatus::Full);
        assert_eq!(BatteryStatus::parse("weird"), BatteryStatus::Unknown);
        assert_eq!(BatteryStatus::NotCharging.as_str(), "Not charging");
    }
}
