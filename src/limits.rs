//! Memory budget handling and compiler resource heuristics.
//!
//! The budget drives two GCC garbage-collector tuning parameters and the
//! address-space rlimit applied to the compiler child. The heuristics mirror
//! the defaults GCC itself derives from available RAM; their exact clamping
//! behavior is load-bearing and covered by tests.

use std::fmt;
use std::str::FromStr;

/// Memory budget for one compile job, in mebibytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MemoryBudget(u32);

impl MemoryBudget {
    /// Create from mebibytes (MiB).
    pub const fn from_mib(mib: u32) -> Self {
        Self(mib)
    }

    /// Get the budget in mebibytes (MiB).
    pub const fn as_mib(&self) -> u32 {
        self.0
    }

    /// Get the budget in kibibytes (KiB).
    pub const fn as_kib(&self) -> u64 {
        self.0 as u64 * 1024
    }

    /// Get the budget in bytes. Used for the `RLIMIT_AS` value.
    pub const fn as_bytes(&self) -> u64 {
        self.0 as u64 * 1024 * 1024
    }
}

impl Default for MemoryBudget {
    fn default() -> Self {
        DEFAULT_MEMORY_BUDGET
    }
}

impl fmt::Display for MemoryBudget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= 1024 && self.0 % 1024 == 0 {
            write!(f, "{} GiB", self.0 / 1024)
        } else {
            write!(f, "{} MiB", self.0)
        }
    }
}

impl FromStr for MemoryBudget {
    type Err = String;

    /// Parse a human-readable budget string.
    ///
    /// Supported formats:
    /// - Plain number: treated as MiB (e.g., "512")
    /// - With suffix: "2G", "2GiB", "512M", "512MiB", case insensitive
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty memory budget".to_string());
        }

        let num_end = s
            .chars()
            .position(|c| !c.is_ascii_digit())
            .unwrap_or(s.len());
        if num_end == 0 {
            return Err(format!("no numeric value in '{}'", s));
        }

        let value: u32 = s[..num_end]
            .parse()
            .map_err(|_| format!("invalid number: '{}'", &s[..num_end]))?;

        let mib = match s[num_end..].trim().to_lowercase().as_str() {
            "" | "m" | "mb" | "mib" => value,
            "g" | "gb" | "gib" => value
                .checked_mul(1024)
                .ok_or_else(|| format!("memory budget too large: '{}'", s))?,
            suffix => return Err(format!("unknown suffix: '{}'", suffix)),
        };

        Ok(MemoryBudget(mib))
    }
}

/// Default per-job memory budget (1 GiB).
pub const DEFAULT_MEMORY_BUDGET: MemoryBudget = MemoryBudget::from_mib(1024);

/// Heuristic for the compiler's `ggc-min-expand` parameter, in percent.
///
/// 30% + 70% * (budget / 1 GiB), so 30 at zero budget and 100 once the
/// budget reaches 1 GiB. The intermediate term is clamped before the base
/// is added, matching GCC's own derivation.
pub fn min_expand_percent(budget: MemoryBudget) -> u32 {
    let mut min_expand = budget.as_mib() as f64;
    min_expand /= 1024.0;
    min_expand *= 70.0;
    min_expand = min_expand.min(70.0);
    min_expand += 30.0;

    min_expand as u32
}

/// Heuristic for the compiler's `ggc-min-heapsize` parameter, in KiB.
///
/// budget / 8, clamped to [4 MiB, 128 MiB], then converted to kibibytes.
pub fn min_heapsize_kib(budget: MemoryBudget) -> u32 {
    let mut mib = budget.as_mib() / 8;
    mib = mib.max(4);
    mib = mib.min(128);

    mib * 1024
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_number_as_mib() {
        assert_eq!(MemoryBudget::from_str("512").unwrap().as_mib(), 512);
        assert_eq!(MemoryBudget::from_str("1024").unwrap().as_mib(), 1024);
    }

    #[test]
    fn test_parse_with_suffix() {
        assert_eq!(MemoryBudget::from_str("2G").unwrap().as_mib(), 2048);
        assert_eq!(MemoryBudget::from_str("2GiB").unwrap().as_mib(), 2048);
        assert_eq!(MemoryBudget::from_str("2gb").unwrap().as_mib(), 2048);
        assert_eq!(MemoryBudget::from_str("512M").unwrap().as_mib(), 512);
        assert_eq!(MemoryBudget::from_str("512MiB").unwrap().as_mib(), 512);
    }

    #[test]
    fn test_parse_errors() {
        assert!(MemoryBudget::from_str("").is_err());
        assert!(MemoryBudget::from_str("abc").is_err());
        assert!(MemoryBudget::from_str("512X").is_err());
        assert!(MemoryBudget::from_str("-5G").is_err());
    }

    #[test]
    fn test_units() {
        let budget = MemoryBudget::from_mib(512);
        assert_eq!(budget.as_kib(), 512 * 1024);
        assert_eq!(budget.as_bytes(), 512 * 1024 * 1024);
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", MemoryBudget::from_mib(512)), "512 MiB");
        assert_eq!(format!("{}", MemoryBudget::from_mib(2048)), "2 GiB");
        assert_eq!(format!("{}", MemoryBudget::from_mib(1536)), "1536 MiB");
    }

    #[test]
    fn test_min_expand_clamp_boundaries() {
        // Lower bound at zero budget.
        assert_eq!(min_expand_percent(MemoryBudget::from_mib(0)), 30);
        // Upper bound from 1 GiB upwards.
        assert_eq!(min_expand_percent(MemoryBudget::from_mib(1024)), 100);
        assert_eq!(min_expand_percent(MemoryBudget::from_mib(8192)), 100);
    }

    #[test]
    fn test_min_expand_midrange() {
        // 512 MiB: 30 + 70 * 0.5 = 65.
        assert_eq!(min_expand_percent(MemoryBudget::from_mib(512)), 65);
        // 256 MiB: 30 + 70 * 0.25 = 47.5, truncated.
        assert_eq!(min_expand_percent(MemoryBudget::from_mib(256)), 47);
    }

    #[test]
    fn test_min_heapsize_clamp_boundaries() {
        // Lower bound of 4 MiB.
        assert_eq!(min_heapsize_kib(MemoryBudget::from_mib(0)), 4 * 1024);
        assert_eq!(min_heapsize_kib(MemoryBudget::from_mib(16)), 4 * 1024);
        // Upper bound of 128 MiB from 1 GiB upwards.
        assert_eq!(min_heapsize_kib(MemoryBudget::from_mib(1024)), 128 * 1024);
        assert_eq!(min_heapsize_kib(MemoryBudget::from_mib(65536)), 128 * 1024);
    }

    #[test]
    fn test_min_heapsize_midrange() {
        // 512 MiB / 8 = 64 MiB.
        assert_eq!(min_heapsize_kib(MemoryBudget::from_mib(512)), 64 * 1024);
    }

    #[test]
    fn test_default() {
        assert_eq!(MemoryBudget::default().as_mib(), 1024);
    }
}
