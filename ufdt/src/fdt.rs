// Copyright 2018 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This module reads and writes Flattened Devicetree blobs as defined here:
//! <https://devicetree-specification.readthedocs.io/en/stable/flattened-format.html>

use std::collections::BTreeMap;
use std::convert::TryInto;
use std::ffi::CString;

use remain::sorted;
use thiserror::Error as ThisError;

use crate::pool::NodeId;
use crate::propval::c_str_to_string;
use crate::propval::ToFdtPropval;
use crate::tree::Ufdt;

#[sorted]
#[derive(ThisError, Debug)]
pub enum Error {
    #[error("Node {} already has a parent", .0)]
    AlreadyAttached(String),
    #[error("Error applying overlay: {}", .0)]
    ApplyOverlayError(String),
    #[error("Bad FDT magic 0x{:08x}", .0)]
    BadMagic(u32),
    #[error("Parse error reading FDT: {}", .0)]
    FdtParseError(String),
    #[error("Invalid fixup {}", .0)]
    InvalidFixup(String),
    #[error("Invalid path {}", .0)]
    InvalidPath(String),
    #[error("Invalid string value {}", .0)]
    InvalidString(String),
    #[error("Fragment {} has no __overlay__ node", .0)]
    MissingOverlay(String),
    #[error("Node {} is not a subtree node", .0)]
    NotASubtree(String),
    #[error("Attempted to end a node that was not the most recent")]
    OutOfOrderEndNode,
    #[error("Phandle value overflows 32 bits")]
    PhandleOverflow,
    #[error("Properties may not be added after a node has been ended")]
    PropertyAfterEndNode,
    #[error("Property value size must fit in 32 bits")]
    PropertyValueTooLarge,
    #[error("The root node cannot be removed or moved")]
    RootNode,
    #[error("Node handle does not refer to a live node")]
    StaleNode,
    #[error("Cannot find target node for phandle 0x{:x}", .0)]
    TargetInvalid(u32),
    #[error("Cannot find target node for path {}", .0)]
    TargetPathInvalid(String),
    #[error("FDT too small: {size} bytes, need at least {min}")]
    TooSmall { size: usize, min: usize },
    #[error("FDT totalsize {header} does not match blob size {actual}")]
    TotalSizeMismatch { header: usize, actual: usize },
    #[error("Total size must fit in 32 bits")]
    TotalSizeTooLarge,
    #[error("Attempted to call finish without ending all nodes")]
    UnclosedNode,
    #[error("Cannot find symbol {} in base FDT", .0)]
    UnresolvedSymbol(String),
    #[error("Unsupported FDT version {}", .0)]
    UnsupportedVersion(u32),
}

pub type Result<T> = std::result::Result<T, Error>;

pub const FDT_HEADER_SIZE: usize = 40;
const FDT_VERSION: u32 = 17;
const FDT_LAST_COMP_VERSION: u32 = 16;
// Oldest layout that still carries `size_dt_strings`.
const FDT_FIRST_SUPPORTED_VERSION: u32 = 16;

pub const FDT_MAGIC: u32 = 0xd00dfeed;

const FDT_BEGIN_NODE: u32 = 0x00000001;
const FDT_END_NODE: u32 = 0x00000002;
const FDT_PROP: u32 = 0x00000003;
const FDT_NOP: u32 = 0x00000004;
const FDT_END: u32 = 0x00000009;

const RSVMAP_ENTRY_SIZE: usize = 16;

/// Reserved physical memory region.
///
/// This represents an area of physical memory reserved by the firmware and unusable by the OS.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FdtReserveEntry {
    /// Physical address of the beginning of the reserved region.
    pub address: u64,
    /// Size of the reserved region in bytes.
    pub size: u64,
}

impl FdtReserveEntry {
    pub fn new(address: u64, size: u64) -> Self {
        Self { address, size }
    }
}

fn be_u32(blob: &[u8], offset: usize) -> Option<u32> {
    let bytes = blob.get(offset..offset.checked_add(4)?)?;
    Some(u32::from_be_bytes(bytes.try_into().ok()?))
}

fn be_u64(blob: &[u8], offset: usize) -> Option<u64> {
    let bytes = blob.get(offset..offset.checked_add(8)?)?;
    Some(u64::from_be_bytes(bytes.try_into().ok()?))
}

/// Decoded FDT header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FdtHeader {
    pub magic: u32,
    pub totalsize: u32,
    pub off_dt_struct: u32,
    pub off_dt_strings: u32,
    pub off_mem_rsvmap: u32,
    pub version: u32,
    pub last_comp_version: u32,
    pub boot_cpuid_phys: u32,
    pub size_dt_strings: u32,
    pub size_dt_struct: u32,
}

impl FdtHeader {
    /// Reads the header at the start of `blob` and checks it against the blob.
    ///
    /// The magic must match, the version must be readable, the declared total size must equal the
    /// blob length and every block must fit inside it.
    pub fn from_blob(blob: &[u8]) -> Result<FdtHeader> {
        if blob.len() < FDT_HEADER_SIZE {
            return Err(Error::TooSmall {
                size: blob.len(),
                min: FDT_HEADER_SIZE,
            });
        }
        let field = |index: usize| be_u32(blob, index * 4).unwrap_or_default();
        let header = FdtHeader {
            magic: field(0),
            totalsize: field(1),
            off_dt_struct: field(2),
            off_dt_strings: field(3),
            off_mem_rsvmap: field(4),
            version: field(5),
            last_comp_version: field(6),
            boot_cpuid_phys: field(7),
            size_dt_strings: field(8),
            size_dt_struct: field(9),
        };

        if header.magic != FDT_MAGIC {
            return Err(Error::BadMagic(header.magic));
        }
        if header.version < FDT_FIRST_SUPPORTED_VERSION {
            return Err(Error::UnsupportedVersion(header.version));
        }
        if header.last_comp_version > FDT_VERSION {
            return Err(Error::UnsupportedVersion(header.last_comp_version));
        }
        if header.totalsize as usize != blob.len() {
            return Err(Error::TotalSizeMismatch {
                header: header.totalsize as usize,
                actual: blob.len(),
            });
        }

        header.check_block("strings", header.off_dt_strings, header.size_dt_strings)?;
        header.check_block("structure", header.off_dt_struct, header.struct_size())?;
        header.check_block("memory reservation", header.off_mem_rsvmap, 0)?;
        Ok(header)
    }

    // Version 16 blobs do not record the structure block size.
    fn struct_size(&self) -> u32 {
        if self.version >= FDT_VERSION {
            self.size_dt_struct
        } else {
            self.totalsize.saturating_sub(self.off_dt_struct)
        }
    }

    fn check_block(&self, name: &str, offset: u32, size: u32) -> Result<()> {
        let fits = offset as u64 + size as u64 <= self.totalsize as u64
            && offset as usize >= FDT_HEADER_SIZE;
        if fits {
            Ok(())
        } else {
            Err(Error::FdtParseError(format!(
                "{} block at {:#x} (+{:#x}) exceeds totalsize {:#x}",
                name, offset, size, self.totalsize
            )))
        }
    }
}

fn read_mem_rsvmap(blob: &[u8], header: &FdtHeader) -> Result<Vec<FdtReserveEntry>> {
    let mut entries = Vec::new();
    let mut offset = header.off_mem_rsvmap as usize;
    loop {
        let (address, size) = match (be_u64(blob, offset), be_u64(blob, offset + 8)) {
            (Some(address), Some(size)) => (address, size),
            _ => {
                return Err(Error::FdtParseError(
                    "unterminated memory reservation map".to_owned(),
                ))
            }
        };
        if address == 0 && size == 0 {
            return Ok(entries);
        }
        entries.push(FdtReserveEntry::new(address, size));
        offset += RSVMAP_ENTRY_SIZE;
    }
}

// Cursor over the structure block.
struct StructReader<'a> {
    structs: &'a [u8],
    strings: &'a [u8],
    pos: usize,
}

impl<'a> StructReader<'a> {
    fn new(blob: &'a [u8], header: &FdtHeader) -> Self {
        let struct_start = header.off_dt_struct as usize;
        let strings_start = header.off_dt_strings as usize;
        StructReader {
            structs: &blob[struct_start..struct_start + header.struct_size() as usize],
            strings: &blob[strings_start..strings_start + header.size_dt_strings as usize],
            pos: 0,
        }
    }

    fn error(&self, what: &str) -> Error {
        Error::FdtParseError(format!("{} at structure offset {:#x}", what, self.pos))
    }

    fn align(&mut self) {
        self.pos = (self.pos + 3) & !3;
    }

    fn read_u32(&mut self) -> Result<u32> {
        let val = be_u32(self.structs, self.pos).ok_or_else(|| self.error("truncated cell"))?;
        self.pos += 4;
        Ok(val)
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.structs.len())
            .ok_or_else(|| self.error("truncated property value"))?;
        let bytes = &self.structs[self.pos..end];
        self.pos = end;
        self.align();
        Ok(bytes)
    }

    fn read_node_name(&mut self) -> Result<String> {
        let rest = self.structs.get(self.pos..).unwrap_or_default();
        let len = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| self.error("unterminated node name"))?;
        let name = String::from_utf8(rest[..len].to_vec())
            .map_err(|_| self.error("node name is not UTF-8"))?;
        self.pos += len + 1;
        self.align();
        Ok(name)
    }

    fn string_at(&self, offset: u32) -> Result<String> {
        let rest = self
            .strings
            .get(offset as usize..)
            .ok_or_else(|| self.error("property name offset out of range"))?;
        let len = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| self.error("unterminated property name"))?;
        c_str_to_string(&rest[..=len]).ok_or_else(|| self.error("property name is not UTF-8"))
    }
}

enum WriteStep {
    Open(NodeId),
    Close(FdtWriterNode),
}

impl Ufdt {
    /// Builds a tree from a flattened device tree blob.
    ///
    /// Property values are copied out of `blob`, so the tree does not borrow it. The phandle
    /// index is filled while the tree is built.
    pub fn from_blob(blob: &[u8]) -> Result<Ufdt> {
        let header = FdtHeader::from_blob(blob)?;
        let mut tree = Ufdt::new();
        tree.reserved_memory = read_mem_rsvmap(blob, &header)?;
        tree.boot_cpuid_phys = header.boot_cpuid_phys;

        let mut reader = StructReader::new(blob, &header);
        let mut open: Vec<NodeId> = Vec::new();
        let mut seen_root = false;
        loop {
            match reader.read_u32()? {
                FDT_BEGIN_NODE => {
                    let name = reader.read_node_name()?;
                    let node = match open.last() {
                        Some(&parent) => {
                            let node = tree.construct_subnode(&name);
                            tree.append_new(parent, node)?;
                            node
                        }
                        None if !seen_root => {
                            seen_root = true;
                            tree.root()
                        }
                        None => return Err(reader.error("second root node")),
                    };
                    open.push(node);
                }
                FDT_END_NODE => {
                    open.pop().ok_or_else(|| reader.error("unbalanced END_NODE"))?;
                }
                FDT_PROP => {
                    let len = reader.read_u32()? as usize;
                    let nameoff = reader.read_u32()?;
                    let data = reader.read_bytes(len)?.to_vec();
                    let name = reader.string_at(nameoff)?;
                    let parent = *open
                        .last()
                        .ok_or_else(|| reader.error("property outside of a node"))?;
                    let prop = tree.construct_property(&name, data);
                    tree.append_new(parent, prop)?;
                }
                FDT_NOP => {}
                FDT_END => {
                    if !open.is_empty() || !seen_root {
                        return Err(reader.error("END before the root node was closed"));
                    }
                    return Ok(tree);
                }
                tag => return Err(reader.error(&format!("unknown tag {:#x}", tag))),
            }
        }
    }

    /// Serializes the tree into a flattened device tree blob.
    ///
    /// Within each node the properties are written before the subnodes.
    pub fn to_blob(&self) -> Result<Vec<u8>> {
        let mut writer = FdtWriter::new(&self.reserved_memory);
        writer.set_boot_cpuid_phys(self.boot_cpuid_phys);
        let mut pending = vec![WriteStep::Open(self.root())];
        while let Some(step) = pending.pop() {
            let id = match step {
                WriteStep::Open(id) => id,
                WriteStep::Close(handle) => {
                    writer.end_node(handle)?;
                    continue;
                }
            };
            let node = self.node(id).ok_or(Error::StaleNode)?;
            let handle = writer.begin_node(node.name())?;
            for prop in self.properties(id) {
                let prop = self.node(prop).ok_or(Error::StaleNode)?;
                writer.set_prop(prop.name(), prop.prop_data().unwrap_or_default())?;
            }
            pending.push(WriteStep::Close(handle));
            let subnodes: Vec<NodeId> = self.subnodes(id).collect();
            pending.extend(subnodes.into_iter().rev().map(WriteStep::Open));
        }
        writer.finish()
    }
}

/// Streaming writer for a Devicetree Blob (DTB).
///
/// Nodes are opened with `begin_node` and closed in reverse order with `end_node`. Properties of
/// a node must be written before any of its subnodes.
pub(crate) struct FdtWriter {
    data: Vec<u8>,
    off_mem_rsvmap: u32,
    off_dt_struct: u32,
    strings: Vec<u8>,
    string_offsets: BTreeMap<CString, u32>,
    node_depth: usize,
    node_ended: bool,
    boot_cpuid_phys: u32,
}

/// Handle to an open node created by `FdtWriter::begin_node`.
#[derive(Debug)]
pub(crate) struct FdtWriterNode {
    depth: usize,
}

impl FdtWriter {
    pub fn new(mem_reservations: &[FdtReserveEntry]) -> Self {
        let mut writer = FdtWriter {
            data: vec![0u8; FDT_HEADER_SIZE],
            off_mem_rsvmap: 0,
            off_dt_struct: 0,
            strings: Vec::new(),
            string_offsets: BTreeMap::new(),
            node_depth: 0,
            node_ended: false,
            boot_cpuid_phys: 0,
        };

        writer.align(8);
        writer.off_mem_rsvmap = writer.data.len() as u32;
        for rsv in mem_reservations {
            writer.append_u64(rsv.address);
            writer.append_u64(rsv.size);
        }
        writer.append_u64(0);
        writer.append_u64(0);

        writer.align(4);
        writer.off_dt_struct = writer.data.len() as u32;
        writer
    }

    pub fn set_boot_cpuid_phys(&mut self, boot_cpuid_phys: u32) {
        self.boot_cpuid_phys = boot_cpuid_phys;
    }

    fn align(&mut self, alignment: usize) {
        let padded = (self.data.len() + alignment - 1) / alignment * alignment;
        self.data.resize(padded, 0);
    }

    fn update_u32(&mut self, offset: usize, val: u32) {
        self.data[offset..offset + 4].copy_from_slice(&val.to_be_bytes());
    }

    fn append_u32(&mut self, val: u32) {
        self.data.extend_from_slice(&val.to_be_bytes());
    }

    fn append_u64(&mut self, val: u64) {
        self.data.extend_from_slice(&val.to_be_bytes());
    }

    pub fn begin_node(&mut self, name: &str) -> Result<FdtWriterNode> {
        let name_cstr = CString::new(name).map_err(|_| Error::InvalidString(name.into()))?;
        self.append_u32(FDT_BEGIN_NODE);
        self.data.extend(name_cstr.to_bytes_with_nul());
        self.align(4);
        self.node_depth += 1;
        self.node_ended = false;
        Ok(FdtWriterNode {
            depth: self.node_depth,
        })
    }

    pub fn end_node(&mut self, node: FdtWriterNode) -> Result<()> {
        if node.depth != self.node_depth {
            return Err(Error::OutOfOrderEndNode);
        }
        self.append_u32(FDT_END_NODE);
        self.node_depth -= 1;
        self.node_ended = true;
        Ok(())
    }

    // Returns the offset of `s` in the strings block, adding it if needed.
    fn intern_string(&mut self, s: CString) -> u32 {
        if let Some(off) = self.string_offsets.get(&s) {
            return *off;
        }
        let off = self.strings.len() as u32;
        self.strings.extend_from_slice(s.to_bytes_with_nul());
        self.string_offsets.insert(s, off);
        off
    }

    pub fn set_prop<T: ToFdtPropval>(&mut self, name: &str, val: T) -> Result<()> {
        if self.node_ended {
            return Err(Error::PropertyAfterEndNode);
        }
        let name_cstr = CString::new(name).map_err(|_| Error::InvalidString(name.into()))?;
        let val = val.to_propval()?;
        let len = val
            .len()
            .try_into()
            .map_err(|_| Error::PropertyValueTooLarge)?;

        let nameoff = self.intern_string(name_cstr);
        self.append_u32(FDT_PROP);
        self.append_u32(len);
        self.append_u32(nameoff);
        self.data.extend_from_slice(&val);
        self.align(4);
        Ok(())
    }

    /// Terminates the structure block, fills in the header and appends the strings block.
    pub fn finish(mut self) -> Result<Vec<u8>> {
        if self.node_depth > 0 {
            return Err(Error::UnclosedNode);
        }

        self.append_u32(FDT_END);
        let size_dt_struct = self.data.len() as u32 - self.off_dt_struct;
        let to_u32 = |len: usize| -> Result<u32> {
            len.try_into().map_err(|_| Error::TotalSizeTooLarge)
        };
        let totalsize = to_u32(self.data.len() + self.strings.len())?;
        let off_dt_strings = to_u32(self.data.len())?;
        let size_dt_strings = to_u32(self.strings.len())?;

        let fields = [
            FDT_MAGIC,
            totalsize,
            self.off_dt_struct,
            off_dt_strings,
            self.off_mem_rsvmap,
            FDT_VERSION,
            FDT_LAST_COMP_VERSION,
            self.boot_cpuid_phys,
            size_dt_strings,
            size_dt_struct,
        ];
        for (index, value) in fields.into_iter().enumerate() {
            self.update_u32(index * 4, value);
        }

        self.data.append(&mut self.strings);
        Ok(self.data)
    }
}
