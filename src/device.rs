// src/device.rs

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::error::Error;

/// Computational device named in the settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Device {
    #[default]
    Cpu,
    Cuda(usize),
    Metal(usize),
}

impl Device {
    /// Only the `ndarray` CPU backend is compiled in.
    pub fn is_supported(&self) -> bool {
        matches!(self, Device::Cpu)
    }
}

impl FromStr for Device {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        let (kind, index) = match lowered.split_once(':') {
            Some((kind, index)) => {
                let index = index.parse::<usize>().map_err(|_| {
                    Error::invalid("device", format!("bad device index in `{}`", s))
                })?;
                (kind, index)
            }
            None => (lowered.as_str(), 0),
        };
        match kind {
            "cpu" => Ok(Device::Cpu),
            "cuda" => Ok(Device::Cuda(index)),
            "mps" | "metal" => Ok(Device::Metal(index)),
            _ => Err(Error::invalid("device", format!("unknown device `{}`", s))),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(i) => write!(f, "cuda:{}", i),
            Device::Metal(i) => write!(f, "metal:{}", i),
        }
    }
}

/// Accelerators visible on this host, whether or not they can be used.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Accelerators {
    pub cuda: bool,
    pub metal: bool,
}

impl Accelerators {
    pub fn detect() -> Self {
        Self {
            cuda: Path::new("/proc/driver/nvidia/version").exists()
                || Path::new("/dev/nvidia0").exists(),
            metal: cfg!(all(target_os = "macos", target_arch = "aarch64")),
        }
    }

    pub fn any(&self) -> bool {
        self.cuda || self.metal
    }
}
