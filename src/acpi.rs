//! ACPI adapter (C6): a one-shot function that walks the MADT and returns the local APIC ids
//! of every processor the firmware describes.
//!
//! Everything beyond MADT walking (the AML interpreter, device enumeration, power management)
//! is out of scope; this module exists solely to feed [`crate::smp`] the ordered APIC id list
//! that determines `cpu_index` assignment. The boot environment identity-maps the first
//! megabytes of physical memory, so table addresses are dereferenced directly rather than
//! through a general phys-to-virt translation layer.

use alloc::vec::Vec;

use crate::error::{NkError, Result};

const RSDP_SIGNATURE: &[u8; 8] = b"RSD PTR ";
const RSDT_SIGNATURE: &[u8; 4] = b"RSDT";
const XSDT_SIGNATURE: &[u8; 4] = b"XSDT";
const MADT_SIGNATURE: &[u8; 4] = b"APIC";

/// MADT entry type 0: Processor Local APIC.
const MADT_TYPE_LOCAL_APIC: u8 = 0;

/// Set in a Processor Local APIC entry's flags when the CPU is usable.
const MADT_LOCAL_APIC_ENABLED: u32 = 1 << 0;

/// Design bound on the number of APIC ids this adapter will report, matching
/// [`crate::config::SMP_MAX_CPUS`].
const MAX_MADT_ENTRIES: usize = crate::config::SMP_MAX_CPUS;

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct AcpiSdtHeader {
    signature: [u8; 4],
    length: u32,
    revision: u8,
    checksum: u8,
    oem_id: [u8; 6],
    oem_table_id: [u8; 8],
    oem_revision: u32,
    creator_id: u32,
    creator_revision: u32,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct RsdpV1 {
    signature: [u8; 8],
    checksum: u8,
    oem_id: [u8; 6],
    revision: u8,
    rsdt_address: u32,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct RsdpV2 {
    v1: RsdpV1,
    length: u32,
    xsdt_address: u64,
    extended_checksum: u8,
    reserved: [u8; 3],
}

unsafe fn read_struct<T: Copy>(phys_addr: u64) -> T {
    unsafe { core::ptr::read_unaligned(phys_addr as *const T) }
}

/// Searches the BIOS read-only memory area (`0xE0000..=0xFFFFF`) for the RSDP signature, on
/// 16-byte boundaries as the ACPI specification requires.
fn find_rsdp() -> Option<u64> {
    const START: u64 = 0xE_0000;
    const END: u64 = 0xF_FFFF;
    let mut addr = START;
    while addr < END {
        let signature = unsafe { read_struct::<[u8; 8]>(addr) };
        if &signature == RSDP_SIGNATURE {
            return Some(addr);
        }
        addr += 16;
    }
    None
}

enum RootTable {
    Rsdt { address: u64 },
    Xsdt { address: u64 },
}

fn locate_root_table(rsdp_addr: u64) -> RootTable {
    let v1 = unsafe { read_struct::<RsdpV1>(rsdp_addr) };
    if v1.revision >= 2 {
        let v2 = unsafe { read_struct::<RsdpV2>(rsdp_addr) };
        if v2.xsdt_address != 0 {
            return RootTable::Xsdt {
                address: v2.xsdt_address,
            };
        }
    }
    RootTable::Rsdt {
        address: u64::from(v1.rsdt_address),
    }
}

/// Returns the physical addresses of every table referenced by the root table.
///
/// RSDT entries are 32-bit physical addresses (4-byte stride); XSDT entries are 64-bit physical
/// addresses (8-byte stride). One variant of the source this design follows used an 8-byte
/// stride for both, which walks off the end of an RSDT's entry array and misreads every
/// subsequent pointer — the stride is selected here by which root table was actually found, not
/// hardcoded to one value for both cases.
fn walk_root_table(root: &RootTable) -> Vec<u64> {
    let (header_addr, stride): (u64, usize) = match *root {
        RootTable::Rsdt { address } => (address, 4),
        RootTable::Xsdt { address } => (address, 8),
    };

    let header = unsafe { read_struct::<AcpiSdtHeader>(header_addr) };
    let expected_signature: &[u8; 4] = match *root {
        RootTable::Rsdt { .. } => RSDT_SIGNATURE,
        RootTable::Xsdt { .. } => XSDT_SIGNATURE,
    };
    if &header.signature != expected_signature {
        return Vec::new();
    }

    let entries_bytes = (header.length as usize).saturating_sub(core::mem::size_of::<AcpiSdtHeader>());
    let entry_count = entries_bytes / stride;
    let entries_start = header_addr + core::mem::size_of::<AcpiSdtHeader>() as u64;

    let mut tables = Vec::with_capacity(entry_count);
    for i in 0..entry_count {
        let entry_addr = entries_start + (i * stride) as u64;
        let phys = if stride == 4 {
            u64::from(unsafe { read_struct::<u32>(entry_addr) })
        } else {
            unsafe { read_struct::<u64>(entry_addr) }
        };
        tables.push(phys);
    }
    tables
}

fn find_madt(root: &RootTable) -> Option<u64> {
    for table_addr in walk_root_table(root) {
        let header = unsafe { read_struct::<AcpiSdtHeader>(table_addr) };
        if &header.signature == MADT_SIGNATURE {
            return Some(table_addr);
        }
    }
    None
}

/// Walks the MADT's variable-length entry list, collecting the APIC id of every *enabled*
/// Processor Local APIC entry, in table order. Table order determines `cpu_index` assignment
/// downstream in [`crate::smp`]: the first enabled entry becomes the candidate for cpu_index 0
/// (the BSP, by convention, is whichever processor is already executing this code — the
/// bootstrap coordinator matches it against its own APIC id read from the local APIC itself).
fn walk_madt_entries(madt_addr: u64) -> Vec<u8> {
    let header = unsafe { read_struct::<AcpiSdtHeader>(madt_addr) };
    let madt_end = madt_addr + header.length as u64;

    // MADT-specific header: local APIC address (u32) + flags (u32) follow the common SDT header.
    let mut cursor = madt_addr + core::mem::size_of::<AcpiSdtHeader>() as u64 + 8;

    let mut apic_ids = Vec::new();
    while cursor + 2 <= madt_end && apic_ids.len() < MAX_MADT_ENTRIES {
        let entry_type = unsafe { read_struct::<u8>(cursor) };
        let entry_len = unsafe { read_struct::<u8>(cursor + 1) };
        if entry_len == 0 {
            break;
        }

        if entry_type == MADT_TYPE_LOCAL_APIC && cursor + 8 <= madt_end {
            // Processor Local APIC entry: ACPI processor id (u8), APIC id (u8), flags (u32).
            let apic_id = unsafe { read_struct::<u8>(cursor + 3) };
            let flags = unsafe { read_struct::<u32>(cursor + 4) };
            if flags & MADT_LOCAL_APIC_ENABLED != 0 {
                apic_ids.push(apic_id);
            }
        }

        cursor += u64::from(entry_len);
    }
    apic_ids
}

/// Returns the ordered list of enabled local APIC ids described by the firmware's MADT.
///
/// Order determines `cpu_index` assignment in the bootstrap coordinator. Returns
/// [`NkError::BadArgument`] if no RSDP, root table, or MADT could be located — callers are
/// expected to fall back to a single-CPU boot in that case.
pub fn get_apic_ids() -> Result<Vec<u8>> {
    let rsdp = find_rsdp().ok_or(NkError::BadArgument("no ACPI RSDP found"))?;
    let root = locate_root_table(rsdp);
    let madt = find_madt(&root).ok_or(NkError::BadArgument("no MADT in ACPI tables"))?;
    let ids = walk_madt_entries(madt);
    if ids.is_empty() {
        return Err(NkError::BadArgument("MADT has no enabled processors"));
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_header(buf: &mut [u8], signature: &[u8; 4], length: u32) {
        buf[0..4].copy_from_slice(signature);
        buf[4..8].copy_from_slice(&length.to_le_bytes());
    }

    #[test]
    fn rsdt_stride_is_four_bytes() {
        // Header (36 bytes) + two 32-bit entries.
        let mut buf = [0u8; 44];
        write_header(&mut buf, RSDT_SIGNATURE, 44);
        buf[36..40].copy_from_slice(&0x1000_u32.to_le_bytes());
        buf[40..44].copy_from_slice(&0x2000_u32.to_le_bytes());

        let addr = buf.as_ptr() as u64;
        let root = RootTable::Rsdt { address: addr };
        let tables = walk_root_table(&root);
        assert_eq!(tables, alloc::vec![0x1000, 0x2000]);
    }

    #[test]
    fn xsdt_stride_is_eight_bytes() {
        // Header (36 bytes) + two 64-bit entries.
        let mut buf = [0u8; 52];
        write_header(&mut buf, XSDT_SIGNATURE, 52);
        buf[36..44].copy_from_slice(&0x1_0000_0000_u64.to_le_bytes());
        buf[44..52].copy_from_slice(&0x2_0000_0000_u64.to_le_bytes());

        let addr = buf.as_ptr() as u64;
        let root = RootTable::Xsdt { address: addr };
        let tables = walk_root_table(&root);
        assert_eq!(tables, alloc::vec![0x1_0000_0000, 0x2_0000_0000]);
    }

    #[test]
    fn madt_walk_skips_disabled_processors() {
        // SDT header (36) + local-apic-address/flags (8) + two Processor Local APIC entries
        // (8 bytes each): one enabled, one disabled.
        let mut buf = [0u8; 36 + 8 + 8 + 8];
        write_header(&mut buf, MADT_SIGNATURE, buf.len() as u32);
        let mut cursor = 36 + 8;
        // Entry 1: enabled, apic_id = 0.
        buf[cursor] = MADT_TYPE_LOCAL_APIC;
        buf[cursor + 1] = 8;
        buf[cursor + 3] = 0;
        buf[cursor + 4..cursor + 8].copy_from_slice(&1u32.to_le_bytes());
        cursor += 8;
        // Entry 2: disabled, apic_id = 1.
        buf[cursor] = MADT_TYPE_LOCAL_APIC;
        buf[cursor + 1] = 8;
        buf[cursor + 3] = 1;
        buf[cursor + 4..cursor + 8].copy_from_slice(&0u32.to_le_bytes());

        let addr = buf.as_ptr() as u64;
        let ids = walk_madt_entries(addr);
        assert_eq!(ids, alloc::vec![0]);
    }
}
