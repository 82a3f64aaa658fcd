// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::io;
use std::io::Write;

use ufdt::Ufdt;
use zerocopy::byteorder::big_endian::U32;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

use crate::Error;
use crate::Result;

pub const DT_TABLE_MAGIC: u32 = 0xd7b7ab1e;
pub const DT_TABLE_DEFAULT_PAGE_SIZE: u32 = 2048;
pub const DT_TABLE_HEADER_SIZE: usize = 32;
pub const DT_TABLE_ENTRY_SIZE: usize = 32;

/// Header at the start of a DT table image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DtTableHeader {
    pub magic: u32,
    /// Header, entries and all blobs.
    pub total_size: u32,
    pub header_size: u32,
    pub dt_entry_size: u32,
    pub dt_entry_count: u32,
    /// Offset of the first entry from the start of the header.
    pub dt_entries_offset: u32,
    pub page_size: u32,
    pub reserved: u32,
}

impl Default for DtTableHeader {
    /// Header of an image with no entries.
    fn default() -> Self {
        DtTableHeader {
            magic: DT_TABLE_MAGIC,
            total_size: DT_TABLE_HEADER_SIZE as u32,
            header_size: DT_TABLE_HEADER_SIZE as u32,
            dt_entry_size: DT_TABLE_ENTRY_SIZE as u32,
            dt_entry_count: 0,
            dt_entries_offset: DT_TABLE_HEADER_SIZE as u32,
            page_size: DT_TABLE_DEFAULT_PAGE_SIZE,
            reserved: 0,
        }
    }
}

#[derive(Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
struct RawHeader {
    magic: U32,
    total_size: U32,
    header_size: U32,
    dt_entry_size: U32,
    dt_entry_count: U32,
    dt_entries_offset: U32,
    page_size: U32,
    reserved: U32,
}

impl DtTableHeader {
    pub fn to_bytes(&self) -> [u8; DT_TABLE_HEADER_SIZE] {
        let raw = RawHeader {
            magic: U32::new(self.magic),
            total_size: U32::new(self.total_size),
            header_size: U32::new(self.header_size),
            dt_entry_size: U32::new(self.dt_entry_size),
            dt_entry_count: U32::new(self.dt_entry_count),
            dt_entries_offset: U32::new(self.dt_entries_offset),
            page_size: U32::new(self.page_size),
            reserved: U32::new(self.reserved),
        };
        zerocopy::transmute!(raw)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<DtTableHeader> {
        let (raw, _) = RawHeader::read_from_prefix(bytes)
            .map_err(|_| Error::Truncated("header".to_owned()))?;
        let magic = raw.magic.get();
        if magic != DT_TABLE_MAGIC {
            return Err(Error::BadMagic(magic));
        }
        Ok(DtTableHeader {
            magic,
            total_size: raw.total_size.get(),
            header_size: raw.header_size.get(),
            dt_entry_size: raw.dt_entry_size.get(),
            dt_entry_count: raw.dt_entry_count.get(),
            dt_entries_offset: raw.dt_entries_offset.get(),
            page_size: raw.page_size.get(),
            reserved: raw.reserved.get(),
        })
    }
}

/// Location and identification of one blob in the image.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DtTableEntry {
    pub dt_size: u32,
    /// Offset of the blob from the start of the header.
    pub dt_offset: u32,
    pub id: u32,
    pub rev: u32,
    pub custom: [u32; 4],
}

#[derive(Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
struct RawEntry {
    dt_size: U32,
    dt_offset: U32,
    id: U32,
    rev: U32,
    custom: [U32; 4],
}

impl DtTableEntry {
    pub fn to_bytes(&self) -> [u8; DT_TABLE_ENTRY_SIZE] {
        let raw = RawEntry {
            dt_size: U32::new(self.dt_size),
            dt_offset: U32::new(self.dt_offset),
            id: U32::new(self.id),
            rev: U32::new(self.rev),
            custom: self.custom.map(U32::new),
        };
        zerocopy::transmute!(raw)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<DtTableEntry> {
        let (raw, _) = RawEntry::read_from_prefix(bytes)
            .map_err(|_| Error::Truncated("entry".to_owned()))?;
        Ok(DtTableEntry {
            dt_size: raw.dt_size.get(),
            dt_offset: raw.dt_offset.get(),
            id: raw.id.get(),
            rev: raw.rev.get(),
            custom: raw.custom.map(|c| c.get()),
        })
    }
}

/// A DT table image read from memory.
pub struct DtTable<'a> {
    header: DtTableHeader,
    entries: Vec<DtTableEntry>,
    image: &'a [u8],
}

impl<'a> DtTable<'a> {
    /// Parses the header and entries of `image`. Blob ranges are checked when accessed.
    pub fn parse(image: &'a [u8]) -> Result<DtTable<'a>> {
        let header = DtTableHeader::from_bytes(image)?;
        if header.total_size as usize > image.len() {
            return Err(Error::Truncated(format!(
                "total_size {} exceeds image size {}",
                header.total_size,
                image.len()
            )));
        }
        let entries = (0..header.dt_entry_count as usize)
            .map(|index| {
                let start = (header.dt_entries_offset as usize)
                    .checked_add(index.checked_mul(header.dt_entry_size as usize)?)?;
                image.get(start..start.checked_add(DT_TABLE_ENTRY_SIZE)?)
            })
            .map(|bytes| {
                bytes
                    .ok_or_else(|| Error::Truncated("entry table".to_owned()))
                    .and_then(DtTableEntry::from_bytes)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(DtTable {
            header,
            entries,
            image,
        })
    }

    pub fn header(&self) -> &DtTableHeader {
        &self.header
    }

    pub fn entries(&self) -> &[DtTableEntry] {
        &self.entries
    }

    /// Blob of the entry at `index`.
    pub fn blob(&self, index: usize) -> Result<&'a [u8]> {
        let entry = self
            .entries
            .get(index)
            .ok_or_else(|| Error::Truncated(format!("no entry {}", index)))?;
        let start = entry.dt_offset as usize;
        start
            .checked_add(entry.dt_size as usize)
            .and_then(|end| self.image.get(start..end))
            .ok_or_else(|| Error::Truncated(format!("blob of entry {}", index)))
    }

    /// Prints the header and every entry, with the size and compatible strings of each blob.
    pub fn dump<W: Write>(&self, out: &mut W) -> io::Result<()> {
        let h = &self.header;
        writeln!(out, "dt_table_header:")?;
        writeln!(out, "{:>20} = {:08x}", "magic", h.magic)?;
        writeln!(out, "{:>20} = {}", "total_size", h.total_size)?;
        writeln!(out, "{:>20} = {}", "header_size", h.header_size)?;
        writeln!(out, "{:>20} = {}", "dt_entry_size", h.dt_entry_size)?;
        writeln!(out, "{:>20} = {}", "dt_entry_count", h.dt_entry_count)?;
        writeln!(out, "{:>20} = {}", "dt_entries_offset", h.dt_entries_offset)?;
        writeln!(out, "{:>20} = {}", "page_size", h.page_size)?;
        writeln!(out, "{:>20} = {:08x}", "reserved[0]", h.reserved)?;

        for (index, entry) in self.entries.iter().enumerate() {
            writeln!(out, "dt_table_entry[{}]:", index)?;
            writeln!(out, "{:>20} = {}", "dt_size", entry.dt_size)?;
            writeln!(out, "{:>20} = {}", "dt_offset", entry.dt_offset)?;
            writeln!(out, "{:>20} = {:08x}", "id", entry.id)?;
            writeln!(out, "{:>20} = {:08x}", "rev", entry.rev)?;
            for (i, custom) in entry.custom.iter().enumerate() {
                writeln!(out, "{:>20} = {:08x}", format!("custom[{}]", i), custom)?;
            }
            match self.blob(index).map(Ufdt::from_blob) {
                Ok(Ok(tree)) => {
                    writeln!(out, "{:>20} = {}", "(FDT)size", entry.dt_size)?;
                    let compatible: Vec<String> =
                        tree.get_prop(tree.root(), "compatible").unwrap_or_default();
                    for value in compatible {
                        writeln!(out, "{:>20} = {}", "(FDT)compatible", value)?;
                    }
                }
                Ok(Err(e)) => writeln!(out, "{:>20} = {}", "(FDT)error", e)?,
                Err(e) => writeln!(out, "{:>20} = {}", "(FDT)error", e)?,
            }
        }
        Ok(())
    }
}
