// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Firmware container parsing and loading.
//!
//! The container is a small sectioned format: a fixed header naming the
//! entry point, a run of `{ addr, length, bytes }` sections, and a
//! trailing table of static MMU entries describing the map the processor
//! needs before any section is reachable. All integers are little-endian.
//!
//! ```text
//! +--------+---------+-------------+--------------+--------------+
//! | magic  | version | entry_point | num_sections | num_mmu      |
//! +--------+---------+-------------+--------------+--------------+
//! | sections: addr u32, len u32, bytes[len] ...                  |
//! +--------------------------------------------------------------+
//! | mmu table: slave_virt u32, master_phys u32, size u32 ...     |
//! +--------------------------------------------------------------+
//! ```

use std::io::{Cursor, Read};

use abi::{IpcError, IpcResult};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::mmu::MmuEntry;
use crate::SlaveMemory;

pub const RPRC_MAGIC: [u8; 4] = *b"RPRC";
pub const RPRC_VERSION: u32 = 2;

/// One loadable section.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Section {
    pub addr: u32,
    pub data: Vec<u8>,
}

/// One entry of the container's static MMU table.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MmuMapEntry {
    pub slave_virt: u32,
    pub master_phys: u32,
    pub size: u32,
}

impl MmuMapEntry {
    pub fn to_mmu_entry(self) -> MmuEntry {
        MmuEntry::new(self.slave_virt, self.master_phys, self.size)
    }
}

/// A parsed firmware image.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FirmwareImage {
    pub entry_point: u32,
    pub sections: Vec<Section>,
    pub mmu_map: Vec<MmuMapEntry>,
}

impl FirmwareImage {
    /// The boot-time MMU map, converted for the MMU driver.
    pub fn boot_map(&self) -> Vec<MmuEntry> {
        self.mmu_map.iter().map(|e| e.to_mmu_entry()).collect()
    }
}

/// Parses a container. Bad magic or version is `InvalidArg`; truncation
/// anywhere is `InvalidMsg`.
pub fn parse(bytes: &[u8]) -> IpcResult<FirmwareImage> {
    let mut cur = Cursor::new(bytes);

    let mut magic = [0u8; 4];
    cur.read_exact(&mut magic).map_err(|_| IpcError::InvalidMsg)?;
    if magic != RPRC_MAGIC {
        return Err(IpcError::InvalidArg);
    }
    let version = read_u32(&mut cur)?;
    if version != RPRC_VERSION {
        return Err(IpcError::InvalidArg);
    }
    let entry_point = read_u32(&mut cur)?;
    let num_sections = read_u32(&mut cur)?;
    let num_mmu = read_u32(&mut cur)?;

    let mut sections = Vec::with_capacity(num_sections as usize);
    for _ in 0..num_sections {
        let addr = read_u32(&mut cur)?;
        let len = read_u32(&mut cur)? as usize;
        let pos = cur.position() as usize;
        let data = bytes
            .get(pos..pos + len)
            .ok_or(IpcError::InvalidMsg)?
            .to_vec();
        cur.set_position((pos + len) as u64);
        sections.push(Section { addr, data });
    }

    let mut mmu_map = Vec::with_capacity(num_mmu as usize);
    for _ in 0..num_mmu {
        mmu_map.push(MmuMapEntry {
            slave_virt: read_u32(&mut cur)?,
            master_phys: read_u32(&mut cur)?,
            size: read_u32(&mut cur)?,
        });
    }

    Ok(FirmwareImage {
        entry_point,
        sections,
        mmu_map,
    })
}

/// Serializes an image back into container form. The host-side packaging
/// counterpart of [`parse`]; tests and image tooling use it.
pub fn build(image: &FirmwareImage) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&RPRC_MAGIC);
    // Writes into a Vec cannot fail.
    let _ = out.write_u32::<LittleEndian>(RPRC_VERSION);
    let _ = out.write_u32::<LittleEndian>(image.entry_point);
    let _ = out.write_u32::<LittleEndian>(image.sections.len() as u32);
    let _ = out.write_u32::<LittleEndian>(image.mmu_map.len() as u32);
    for s in &image.sections {
        let _ = out.write_u32::<LittleEndian>(s.addr);
        let _ = out.write_u32::<LittleEndian>(s.data.len() as u32);
        out.extend_from_slice(&s.data);
    }
    for e in &image.mmu_map {
        let _ = out.write_u32::<LittleEndian>(e.slave_virt);
        let _ = out.write_u32::<LittleEndian>(e.master_phys);
        let _ = out.write_u32::<LittleEndian>(e.size);
    }
    out
}

/// Writes every section through the processor's memory interface. A
/// rejected write surfaces as `StoreEntry`.
pub fn load(image: &FirmwareImage, mem: &dyn SlaveMemory) -> IpcResult<()> {
    for s in &image.sections {
        mem.write(s.addr, &s.data)
            .map_err(|_| IpcError::StoreEntry)?;
    }
    Ok(())
}

fn read_u32(cur: &mut Cursor<&[u8]>) -> IpcResult<u32> {
    cur.read_u32::<LittleEndian>()
        .map_err(|_| IpcError::InvalidMsg)
}
