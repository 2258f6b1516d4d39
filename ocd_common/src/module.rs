//! Debug module identification.

use std::fmt;

/// Vendor id of the standard (reference) debug modules.
pub const VENDOR_STANDARD: u16 = 1;

/// Snapshot of a module's identification registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleDescriptor {
    pub addr: u16,
    pub vendor: u16,
    pub module_type: u16,
    pub version: u16,
}

impl ModuleDescriptor {
    /// Standard module type, if the vendor is the standard vendor.
    pub fn std_type(&self) -> Option<StdModuleType> {
        if self.vendor != VENDOR_STANDARD {
            return None;
        }
        StdModuleType::from_id(self.module_type)
    }
}

impl fmt::Display for ModuleDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "module {} (vendor {:#06x}, type {:#06x}",
            self.addr, self.vendor, self.module_type
        )?;
        if let Some(std) = self.std_type() {
            write!(f, " [{}]", std.short_name())?;
        }
        write!(f, ", version {:#06x})", self.version)
    }
}

/// Module types defined by the standard vendor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum StdModuleType {
    Scm = 1,
    DemUart = 2,
    Mam = 3,
    Stm = 4,
    Ctm = 5,
}

impl StdModuleType {
    pub const fn from_id(id: u16) -> Option<Self> {
        match id {
            1 => Some(Self::Scm),
            2 => Some(Self::DemUart),
            3 => Some(Self::Mam),
            4 => Some(Self::Stm),
            5 => Some(Self::Ctm),
            _ => None,
        }
    }

    pub const fn id(self) -> u16 {
        self as u16
    }

    pub const fn short_name(self) -> &'static str {
        match self {
            Self::Scm => "SCM",
            Self::DemUart => "DEM_UART",
            Self::Mam => "MAM",
            Self::Stm => "STM",
            Self::Ctm => "CTM",
        }
    }

    pub const fn long_name(self) -> &'static str {
        match self {
            Self::Scm => "Subnet Control Module",
            Self::DemUart => "Device Emulation Module UART",
            Self::Mam => "Memory Access Module",
            Self::Stm => "System Trace Module",
            Self::Ctm => "Core Trace Module",
        }
    }
}

/// Short name of a standard module type, `None` for unknown ids.
pub fn type_short_name(type_id: u16) -> Option<&'static str> {
    StdModuleType::from_id(type_id).map(StdModuleType::short_name)
}

/// Long name of a standard module type, `None` for unknown ids.
pub fn type_long_name(type_id: u16) -> Option<&'static str> {
    StdModuleType::from_id(type_id).map(StdModuleType::long_name)
}
