use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Firmware version reported by the WiFi gateway.
///
/// Development builds (`dev`/`master` in the version string) have no
/// comparable number and are treated as newer than any release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareVersion {
    Release { major: u32, minor: u32, patch: u32 },
    Development,
}

impl FirmwareVersion {
    pub fn major(&self) -> Option<u32> {
        match self {
            FirmwareVersion::Release { major, .. } => Some(*major),
            FirmwareVersion::Development => None,
        }
    }

    /// Whether this firmware is at least `min`.
    pub fn satisfies(&self, min: &FirmwareVersion) -> bool {
        self.cmp_release(min) != Ordering::Less
    }

    fn cmp_release(&self, other: &FirmwareVersion) -> Ordering {
        match (self, other) {
            (FirmwareVersion::Development, FirmwareVersion::Development) => Ordering::Equal,
            (FirmwareVersion::Development, _) => Ordering::Greater,
            (_, FirmwareVersion::Development) => Ordering::Less,
            (
                FirmwareVersion::Release {
                    major: a,
                    minor: b,
                    patch: c,
                },
                FirmwareVersion::Release {
                    major: x,
                    minor: y,
                    patch: z,
                },
            ) => (a, b, c).cmp(&(x, y, z)),
        }
    }
}

impl FromStr for FirmwareVersion {
    type Err = String;

    /// Accepts strings such as `4.1.7`, `v4.1.7`, `4.1.7_modified` or
    /// `master_abc123`. The first `N.N.N` run found anywhere in the string wins.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        if lower.contains("dev") || lower.contains("master") {
            return Ok(FirmwareVersion::Development);
        }

        for token in lower.split(|c: char| !(c.is_ascii_digit() || c == '.')) {
            let parts: Vec<&str> = token.split('.').filter(|p| !p.is_empty()).collect();
            if parts.len() < 3 {
                continue;
            }
            let nums: Result<Vec<u32>, _> = parts[..3].iter().map(|p| p.parse::<u32>()).collect();
            if let Ok(nums) = nums {
                return Ok(FirmwareVersion::Release {
                    major: nums[0],
                    minor: nums[1],
                    patch: nums[2],
                });
            }
        }

        Err(format!("unrecognised firmware version '{}'", s))
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FirmwareVersion::Release {
                major,
                minor,
                patch,
            } => write!(f, "{}.{}.{}", major, minor, patch),
            FirmwareVersion::Development => write!(f, "dev"),
        }
    }
}
