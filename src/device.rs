//! Device identity and measured hardware facts.
//!
//! Every decision downstream of queue setup works on a `DeviceDescriptor`,
//! which is plain data captured once per device. Identification is
//! table-driven on the vendor and device-name strings; a device that is
//! not recognized keeps `Unknown` idents and everything still works.

use ocl::core::{DeviceInfo, DeviceInfoResult};
use ocl::Device;

use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeviceVendor {
    Unknown,
    Amd,
    Nvidia,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeviceFamily {
    Unknown,
    Evergreen,
    SouthernIslands,
    Fermi,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeviceChip {
    Unknown,
    Redwood,
    Juniper,
    Cypress,
    Hemlock,
    Cayman,
    Tahiti,
    GeForceGtx480,
    GeForceGtx580,
}

/// Stable identity of a device, independent of runtime handles.
///
/// Runtime device pointers change across re-initialization; the ident does
/// not, which is why the persistent store and its in-process cache key on
/// it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeviceIdent {
    pub vendor: DeviceVendor,
    pub family: DeviceFamily,
    pub chip: DeviceChip,
}

impl Default for DeviceIdent {
    fn default() -> DeviceIdent {
        DeviceIdent {
            vendor: DeviceVendor::Unknown,
            family: DeviceFamily::Unknown,
            chip: DeviceChip::Unknown,
        }
    }
}

const CHIP_TABLE: &[(&str, DeviceChip, DeviceFamily)] = &[
    ("Redwood", DeviceChip::Redwood, DeviceFamily::Evergreen),
    ("Juniper", DeviceChip::Juniper, DeviceFamily::Evergreen),
    ("Cypress", DeviceChip::Cypress, DeviceFamily::Evergreen),
    ("Hemlock", DeviceChip::Hemlock, DeviceFamily::Evergreen),
    ("Cayman", DeviceChip::Cayman, DeviceFamily::Evergreen),
    ("Tahiti", DeviceChip::Tahiti, DeviceFamily::SouthernIslands),
    ("GTX 480", DeviceChip::GeForceGtx480, DeviceFamily::Fermi),
    ("GTX 580", DeviceChip::GeForceGtx580, DeviceFamily::Fermi),
];

/// Identifies a device from its vendor and name strings.
pub fn identify_device(vendor: &str, name: &str) -> DeviceIdent {
    let mut ident = DeviceIdent::default();

    if vendor.contains("Advanced Micro Devices") || vendor.contains("AMD") {
        ident.vendor = DeviceVendor::Amd;
    } else if vendor.contains("NVIDIA") {
        ident.vendor = DeviceVendor::Nvidia;
    }

    for &(pat, chip, family) in CHIP_TABLE {
        if name.contains(pat) {
            ident.chip = chip;
            ident.family = family;
            break;
        }
    }

    ident
}

/// Hardware facts needed for tiling and kernel-shape decisions.
///
/// Created once per runtime device and immutable thereafter. All fields
/// are public so the rest of the pipeline stays testable without a device.
#[derive(Clone, Debug)]
pub struct DeviceDescriptor {
    pub ident: DeviceIdent,
    pub name: String,
    pub compute_units: u32,
    pub lds_size: u64,
    pub max_work_group_size: usize,
    pub address_bits: u32,
    pub wavefront: u32,
    pub native_double: bool,
    pub native_complex: bool,
    pub image_support: bool,
    pub alignment: u32,
    pub max_mem_alloc_size: u64,
    pub global_mem_size: u64,
    pub image2d_max_width: usize,
    pub image2d_max_height: usize,
}

fn unexpected(which: &str) -> Error {
    Error::invalid(format!(
        "unexpected device info result variant for {}",
        which
    ))
}

fn info_u32(device: &Device, kind: DeviceInfo) -> Result<u32> {
    match device.info(kind)? {
        DeviceInfoResult::MaxComputeUnits(v)
        | DeviceInfoResult::AddressBits(v)
        | DeviceInfoResult::MinDataTypeAlignSize(v)
        | DeviceInfoResult::PreferredVectorWidthDouble(v) => Ok(v),
        _ => Err(unexpected("u32 info")),
    }
}

fn info_u64(device: &Device, kind: DeviceInfo) -> Result<u64> {
    match device.info(kind)? {
        DeviceInfoResult::LocalMemSize(v)
        | DeviceInfoResult::MaxMemAllocSize(v)
        | DeviceInfoResult::GlobalMemSize(v) => Ok(v),
        _ => Err(unexpected("u64 info")),
    }
}

fn info_usize(device: &Device, kind: DeviceInfo) -> Result<usize> {
    match device.info(kind)? {
        DeviceInfoResult::MaxWorkGroupSize(v)
        | DeviceInfoResult::Image2dMaxWidth(v)
        | DeviceInfoResult::Image2dMaxHeight(v) => Ok(v),
        _ => Err(unexpected("usize info")),
    }
}

fn info_string(device: &Device, kind: DeviceInfo) -> Result<String> {
    match device.info(kind)? {
        DeviceInfoResult::Name(s) | DeviceInfoResult::Vendor(s) => Ok(s),
        _ => Err(unexpected("string info")),
    }
}

impl DeviceDescriptor {
    /// Queries the runtime once and captures everything later stages need.
    pub fn from_device(device: &Device) -> Result<DeviceDescriptor> {
        let name = info_string(device, DeviceInfo::Name)?;
        let vendor = info_string(device, DeviceInfo::Vendor)?;

        let image_support = match device.info(DeviceInfo::ImageSupport)? {
            DeviceInfoResult::ImageSupport(b) => b,
            _ => false,
        };

        // Zero preferred vector width for double means the device has no
        // native double support.
        let pref_double = info_u32(device, DeviceInfo::PreferredVectorWidthDouble)?;

        Ok(DeviceDescriptor {
            ident: identify_device(&vendor, &name),
            compute_units: info_u32(device, DeviceInfo::MaxComputeUnits)?,
            lds_size: info_u64(device, DeviceInfo::LocalMemSize)?,
            max_work_group_size: info_usize(device, DeviceInfo::MaxWorkGroupSize)?,
            address_bits: info_u32(device, DeviceInfo::AddressBits)?,
            wavefront: 64,
            native_double: pref_double != 0,
            native_complex: true,
            image_support,
            alignment: info_u32(device, DeviceInfo::MinDataTypeAlignSize)?,
            max_mem_alloc_size: info_u64(device, DeviceInfo::MaxMemAllocSize)?,
            global_mem_size: info_u64(device, DeviceInfo::GlobalMemSize)?,
            image2d_max_width: info_usize(device, DeviceInfo::Image2dMaxWidth)?,
            image2d_max_height: info_usize(device, DeviceInfo::Image2dMaxHeight)?,
            name,
        })
    }

    /// Whether the device can run problems of the given element type.
    pub fn supports_dtype(&self, dtype: crate::types::DataType) -> bool {
        if dtype.is_double_based() {
            self.native_double
        } else if dtype.is_complex() {
            self.native_complex
        } else {
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identification_is_substring_driven() {
        let ident = identify_device("Advanced Micro Devices, Inc.", "Tahiti");
        assert_eq!(ident.vendor, DeviceVendor::Amd);
        assert_eq!(ident.chip, DeviceChip::Tahiti);
        assert_eq!(ident.family, DeviceFamily::SouthernIslands);

        let ident = identify_device("NVIDIA Corporation", "GeForce GTX 580");
        assert_eq!(ident.vendor, DeviceVendor::Nvidia);
        assert_eq!(ident.chip, DeviceChip::GeForceGtx580);
    }

    #[test]
    fn unknown_devices_still_identify() {
        let ident = identify_device("Acme Silicon", "Roadrunner 9000");
        assert_eq!(ident, DeviceIdent::default());
    }
}
