//! Parsers for the device identity and filesystem usage scripts.

use serde::{Deserialize, Serialize};

use crate::{ParseError, Result};

/// Native code architectures indexed by the `.mpy` arch field.
const MPY_ARCHES: [&str; 12] = [
    "", "x86", "x64", "armv6", "armv6m", "armv7m", "armv7em", "armv7emsp", "armv7emdp", "xtensa",
    "xtensawin", "rv32imc",
];

/// Identity of the connected board.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[non_exhaustive]
pub struct DeviceInfo {
    /// Board description from `os.uname().machine`.
    pub machine: String,
    /// Firmware release.
    pub release: String,
    /// Port name (`esp32`, `rp2`, ...).
    pub sysname: String,
    /// Human readable firmware version.
    pub version: String,
    /// `.mpy` bytecode version, `None` when the port only runs source.
    pub mpy_version: Option<u32>,
    /// `.mpy` sub-version.
    pub mpy_sub: Option<u32>,
    /// Native architecture for `.mpy` files, if any.
    pub mpy_arch: Option<String>,
    /// Module search path.
    pub sys_path: Vec<String>,
}

impl DeviceInfo {
    /// Parses the single line printed by [`crate::script::DEVICE_INFO`].
    pub fn parse(output: &str) -> Result<Self> {
        let line = output.trim();
        // sys.path may legitimately be empty but never contains '|'.
        let fields: Vec<&str> = line.splitn(8, '|').collect();
        let &[machine, release, sysname, version, mpy, sub, arch, path] = fields.as_slice() else {
            return Err(ParseError::FieldCount {
                expected: 8,
                actual: fields.len(),
                line: line.to_owned(),
            });
        };

        let mpy_version = Some(number::<u32>(mpy)?).filter(|&v| v != 0);
        let mpy_sub = mpy_version.map(|_| number::<u32>(sub)).transpose()?;
        let mpy_arch = match number::<usize>(arch)? {
            0 => None,
            idx => Some(
                MPY_ARCHES
                    .get(idx)
                    .map_or_else(|| format!("arch{idx}"), |a| (*a).to_owned()),
            ),
        };

        Ok(Self {
            machine: machine.to_owned(),
            release: release.to_owned(),
            sysname: sysname.to_owned(),
            version: version.to_owned(),
            mpy_version,
            mpy_sub,
            mpy_arch,
            sys_path: path.split(':').map(str::to_owned).collect(),
        })
    }
}

/// Filesystem usage in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[non_exhaustive]
pub struct FsStats {
    /// Bytes in use.
    pub used: u64,
    /// Bytes available.
    pub free: u64,
    /// Filesystem size.
    pub total: u64,
}

impl FsStats {
    /// Parses the `used|free|total` line printed by [`crate::script::fs_stats`].
    pub fn parse(output: &str) -> Result<Self> {
        let line = output.trim();
        let fields: Vec<&str> = line.split('|').collect();
        let &[used, free, total] = fields.as_slice() else {
            return Err(ParseError::FieldCount {
                expected: 3,
                actual: fields.len(),
                line: line.to_owned(),
            });
        };
        Ok(Self {
            used: number(used)?,
            free: number(free)?,
            total: number(total)?,
        })
    }
}

/// Parses a decimal field.
fn number<T: std::str::FromStr>(s: &str) -> Result<T> {
    s.trim().parse().map_err(|_| ParseError::Number(s.to_owned()))
}
