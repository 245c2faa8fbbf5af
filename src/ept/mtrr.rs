//! MTRR enumeration used to build the identity-mapped EPT's memory typing.
//!
//! Grounded on `EptBuildMtrrMap` (`Ept.h`/`Ept.c`): the BIOS-programmed
//! fixed and variable-range MTRRs describe which physical ranges are
//! write-back, uncacheable, etc.; the EPT identity map copies that typing
//! so MMIO and framebuffer ranges are not cached as ordinary RAM.

use crate::{
    config::MTRR_RANGE_MAX,
    error::{HvError, HvResult},
    x86_instructions::rdmsr,
};

/// x86 memory types as encoded in `IA32_MTRR_DEF_TYPE` and EPT PTEs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MemoryType {
    /// Uncacheable.
    Uncacheable = 0,
    /// Write combining.
    WriteCombining = 1,
    /// Write through.
    WriteThrough = 4,
    /// Write protected.
    WriteProtected = 5,
    /// Write back.
    WriteBack = 6,
}

impl MemoryType {
    fn from_raw(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Uncacheable),
            1 => Some(Self::WriteCombining),
            4 => Some(Self::WriteThrough),
            5 => Some(Self::WriteProtected),
            6 => Some(Self::WriteBack),
            _ => None,
        }
    }
}

/// One physical range and the memory type the MTRRs assign it.
///
/// Mirrors `MTRR_RANGE_DESCRIPTOR`.
#[derive(Clone, Copy, Debug)]
pub struct MtrrRangeDescriptor {
    /// Inclusive start of the range.
    pub physical_base_address: u64,
    /// Inclusive end of the range.
    pub physical_end_address: u64,
    /// Memory type the range should be mapped with in EPT.
    pub memory_type: MemoryType,
}

const IA32_MTRR_CAP: u32 = 0xfe;
const IA32_MTRR_DEF_TYPE: u32 = 0x2ff;
const IA32_MTRR_PHYSBASE0: u32 = 0x200;
const IA32_MTRR_PHYSMASK0: u32 = 0x201;

/// Walks the variable-range MTRRs and returns the enabled ranges, in the
/// same order `EptBuildMtrrMap` would populate `EPT_STATE::MemoryRanges`.
///
/// # Safety
/// Must run on the current logical processor at CPL0; reads MSRs directly.
pub unsafe fn build_mtrr_map() -> HvResult<([MtrrRangeDescriptor; MTRR_RANGE_MAX], usize)> {
    let def_type = rdmsr(IA32_MTRR_DEF_TYPE);
    let mtrrs_enabled = (def_type & (1 << 11)) != 0;
    let default_type = MemoryType::from_raw((def_type & 0xff) as u8).unwrap_or(MemoryType::WriteBack);

    let mut ranges = [MtrrRangeDescriptor {
        physical_base_address: 0,
        physical_end_address: 0,
        memory_type: default_type,
    }; MTRR_RANGE_MAX];
    let mut count = 0usize;

    if !mtrrs_enabled {
        return Ok((ranges, count));
    }

    let variable_range_count = (rdmsr(IA32_MTRR_CAP) & 0xff) as u32;
    for index in 0..variable_range_count {
        let phys_base = rdmsr(IA32_MTRR_PHYSBASE0 + index * 2);
        let phys_mask = rdmsr(IA32_MTRR_PHYSMASK0 + index * 2);

        let valid = (phys_mask & (1 << 11)) != 0;
        if !valid {
            continue;
        }
        if count >= MTRR_RANGE_MAX {
            return Err(HvError::EptMtrrFailed);
        }

        let memory_type = MemoryType::from_raw((phys_base & 0xff) as u8).unwrap_or(default_type);
        let mask = phys_mask & 0x000f_ffff_ffff_f000;
        let base = phys_base & 0x000f_ffff_ffff_f000;
        let range_size = (!mask & 0x000f_ffff_ffff_ffff).wrapping_add(1);

        ranges[count] = MtrrRangeDescriptor {
            physical_base_address: base,
            physical_end_address: base + range_size - 1,
            memory_type,
        };
        count += 1;
    }

    Ok((ranges, count))
}

/// Looks up the memory type that should be applied to the 2MB-aligned page
/// starting at `page_physical_address`, falling back to write-back when no
/// range covers it (matching the original's default for plain RAM).
pub fn memory_type_for_page(
    ranges: &[MtrrRangeDescriptor],
    page_physical_address: u64,
    page_size: u64,
) -> MemoryType {
    let page_end = page_physical_address + page_size - 1;
    for range in ranges {
        if page_physical_address >= range.physical_base_address && page_end <= range.physical_end_address {
            return range.memory_type;
        }
    }
    MemoryType::WriteBack
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;

    #[test]
    fn falls_back_to_write_back_outside_every_range() {
        let ranges = [MtrrRangeDescriptor {
            physical_base_address: 0xa_0000,
            physical_end_address: 0xb_ffff,
            memory_type: MemoryType::Uncacheable,
        }];
        assert_eq!(memory_type_for_page(&ranges, 0x10_0000, 0x1000), MemoryType::WriteBack);
        assert_eq!(memory_type_for_page(&ranges, 0xa_0000, 0x1000), MemoryType::Uncacheable);
    }
}
