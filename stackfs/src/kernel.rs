use std::sync::OnceLock;

use crate::{Error, Result};

/// How overlay stacks are composed on this kernel.
///
/// Kernels since 3.19 accept multiple `lowerdir` entries in one overlay
/// mount. Older kernels take a single lower directory, so depth has to be
/// emulated by stacking mounts recursively ([MountStrategy::Legacy]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountStrategy {
    Standard,
    Legacy,
}

/// First kernel release supporting multiple lower directories.
const MULTI_LOWER_KERNEL: (u64, u64) = (3, 19);

static DETECTED: OnceLock<MountStrategy> = OnceLock::new();

impl MountStrategy {
    /// Detects the strategy from the running kernel's release string.
    ///
    /// The decision is cached for the lifetime of the process.
    pub fn detect() -> Result<Self> {
        if let Some(strategy) = DETECTED.get() {
            return Ok(*strategy);
        }
        let uts = nix::sys::utsname::uname()?;
        let release = uts.release().to_string_lossy();
        let strategy = Self::from_release(&release)
            .ok_or_else(|| Error::UnrecognizedKernelRelease(release.to_string()))?;
        Ok(*DETECTED.get_or_init(|| strategy))
    }

    /// Selects the strategy for a `major.minor[...]` kernel release string.
    pub fn from_release(release: &str) -> Option<Self> {
        let (major, minor) = parse_release(release)?;
        if (major, minor) < MULTI_LOWER_KERNEL {
            Some(Self::Legacy)
        } else {
            Some(Self::Standard)
        }
    }
}

fn parse_release(release: &str) -> Option<(u64, u64)> {
    let mut parts = release.split('.');
    let major = leading_number(parts.next()?)?;
    let minor = leading_number(parts.next()?)?;
    Some((major, minor))
}

fn leading_number(part: &str) -> Option<u64> {
    let digits: &str = &part[..part
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(part.len())];
    digits.parse().ok()
}
