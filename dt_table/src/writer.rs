// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Incremental DT table image writer.
//!
//! Entries are added one at a time with [`DtImageWriter::add_entry`]. An entry is completed when
//! the next one is added or when the image is finished, so entry options can be set after the
//! entry's dtb is named. Adding a dtb file that was already added reuses the earlier copy.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use log::debug;
use log::info;
use ufdt::read_cell;
use ufdt::FdtHeader;
use ufdt::Ufdt;

use crate::table::DtTableEntry;
use crate::table::DtTableHeader;
use crate::table::DT_TABLE_DEFAULT_PAGE_SIZE;
use crate::table::DT_TABLE_ENTRY_SIZE;
use crate::table::DT_TABLE_HEADER_SIZE;
use crate::Error;
use crate::Result;

const PROP_PATH_PREFIX: char = '/';
const PROP_SEP: char = ':';

/// Parses an unsigned number the way C `strtoul` does with base 0: `0x` prefixed hexadecimal,
/// `0` prefixed octal, decimal otherwise. An empty string is 0.
pub fn parse_number(value: &str) -> Result<u32> {
    if value.is_empty() {
        return Ok(0);
    }
    let (digits, radix) = if let Some(hex) = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        (hex, 16)
    } else if value.len() > 1 && value.starts_with('0') {
        (&value[1..], 8)
    } else {
        (value, 10)
    };
    u32::from_str_radix(digits, radix).map_err(|_| Error::InvalidNumber(value.to_owned()))
}

/// Unresolved `id`, `rev` and `custom0`..`custom3` values of an entry.
///
/// A value is either a number or `/path/to/node:property`, read from the entry's dtb when the
/// entry is written.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DtOptions {
    pub id: String,
    pub rev: String,
    pub custom: [String; 4],
}

impl DtOptions {
    pub fn set(&mut self, option: &str, value: &str) -> Result<()> {
        let slot = match option {
            "id" => &mut self.id,
            "rev" => &mut self.rev,
            "custom0" => &mut self.custom[0],
            "custom1" => &mut self.custom[1],
            "custom2" => &mut self.custom[2],
            "custom3" => &mut self.custom[3],
            _ => return Err(Error::InvalidOption(option.to_owned())),
        };
        *slot = value.to_owned();
        Ok(())
    }

    fn needs_tree(&self) -> bool {
        [&self.id, &self.rev]
            .into_iter()
            .chain(self.custom.iter())
            .any(|value| value.starts_with(PROP_PATH_PREFIX))
    }
}

// First cell of the property named by "/path/to/node:property".
fn value_from_prop(tree: &Ufdt, value: &str) -> Result<u32> {
    let (path, prop) = value
        .split_once(PROP_SEP)
        .ok_or_else(|| Error::InvalidValue(value.to_owned()))?;
    let node = tree
        .get_node(path)
        .ok_or_else(|| Error::MissingProperty(value.to_owned()))?;
    tree.get_prop_data(node, prop)
        .and_then(|data| read_cell(data, 0))
        .ok_or_else(|| Error::MissingProperty(value.to_owned()))
}

fn resolve_value(tree: Option<&Ufdt>, value: &str) -> Result<u32> {
    match tree {
        Some(tree) if value.starts_with(PROP_PATH_PREFIX) => value_from_prop(tree, value),
        _ => parse_number(value),
    }
}

pub struct DtImageWriter {
    page_size: u32,
    default_options: DtOptions,
    entry_options: DtOptions,
    entry_path: Option<PathBuf>,
    entry_count: u32,
    entries: Vec<DtTableEntry>,
    blobs: Vec<u8>,
    dt_offset: u32,
    // Offset of every dtb file written so far.
    past_offsets: BTreeMap<PathBuf, (u32, u32)>,
}

impl DtImageWriter {
    /// Starts an image that will hold exactly `entry_count` entries.
    pub fn start(entry_count: u32) -> Result<DtImageWriter> {
        let dt_offset = (DT_TABLE_ENTRY_SIZE as u32)
            .checked_mul(entry_count)
            .and_then(|size| size.checked_add(DT_TABLE_HEADER_SIZE as u32))
            .ok_or(Error::ImageTooLarge)?;
        Ok(DtImageWriter {
            page_size: DT_TABLE_DEFAULT_PAGE_SIZE,
            default_options: DtOptions::default(),
            entry_options: DtOptions::default(),
            entry_path: None,
            entry_count,
            entries: Vec::new(),
            blobs: Vec::new(),
            dt_offset,
            past_offsets: BTreeMap::new(),
        })
    }

    /// Sets `page_size` or the default of an entry option for the entries added afterwards.
    pub fn set_global_option(&mut self, option: &str, value: &str) -> Result<()> {
        if option == "page_size" {
            self.page_size = parse_number(value)?;
            return Ok(());
        }
        self.default_options.set(option, value)
    }

    /// Sets an option of the most recently added entry.
    pub fn set_entry_option(&mut self, option: &str, value: &str) -> Result<()> {
        if self.entry_path.is_none() {
            return Err(Error::EntryOptionWithoutEntry(option.to_owned()));
        }
        self.entry_options.set(option, value)
    }

    /// Completes the pending entry and starts a new one for the dtb at `path`.
    pub fn add_entry<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.flush_entry()?;
        self.entry_path = Some(path.as_ref().to_path_buf());
        self.entry_options = self.default_options.clone();
        Ok(())
    }

    fn flush_entry(&mut self) -> Result<()> {
        let Some(path) = self.entry_path.take() else {
            return Ok(());
        };
        if self.entries.len() >= self.entry_count as usize {
            return Err(Error::EntryCountMismatch {
                declared: self.entry_count,
                written: self.entries.len() as u32 + 1,
            });
        }

        let blob = fs::read(&path).map_err(|source| Error::ReadDtb {
            path: path.clone(),
            source,
        })?;
        let header = FdtHeader::from_blob(&blob).map_err(|source| Error::InvalidDtb {
            path: path.clone(),
            source,
        })?;
        let tree = if self.entry_options.needs_tree() {
            Some(Ufdt::from_blob(&blob).map_err(|source| Error::InvalidDtb {
                path: path.clone(),
                source,
            })?)
        } else {
            None
        };

        let options = &self.entry_options;
        let resolve = |value: &str| resolve_value(tree.as_ref(), value);
        let mut entry = DtTableEntry {
            dt_size: header.totalsize,
            dt_offset: self.dt_offset,
            id: resolve(options.id.as_str())?,
            rev: resolve(options.rev.as_str())?,
            custom: [0; 4],
        };
        for (custom, value) in entry.custom.iter_mut().zip(options.custom.iter()) {
            *custom = resolve(value.as_str())?;
        }

        let reused = self.past_offsets.get(&path).copied();
        match reused {
            Some((offset, size)) => {
                debug!("{} reuses the blob at {:#x}", path.display(), offset);
                entry.dt_offset = offset;
                entry.dt_size = size;
            }
            None => {
                self.dt_offset = self
                    .dt_offset
                    .checked_add(header.totalsize)
                    .ok_or(Error::ImageTooLarge)?;
                self.blobs.extend_from_slice(&blob);
                self.past_offsets
                    .insert(path, (entry.dt_offset, entry.dt_size));
            }
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Completes the last entry and writes the whole image to `out`.
    pub fn end<W: Write>(mut self, out: &mut W) -> Result<DtTableHeader> {
        self.flush_entry()?;
        if self.entries.len() != self.entry_count as usize {
            return Err(Error::EntryCountMismatch {
                declared: self.entry_count,
                written: self.entries.len() as u32,
            });
        }
        let header = DtTableHeader {
            total_size: self.dt_offset,
            dt_entry_count: self.entry_count,
            page_size: self.page_size,
            ..Default::default()
        };
        out.write_all(&header.to_bytes())
            .map_err(Error::WriteImage)?;
        for entry in &self.entries {
            out.write_all(&entry.to_bytes()).map_err(Error::WriteImage)?;
        }
        out.write_all(&self.blobs).map_err(Error::WriteImage)?;
        info!("Total {} entries.", self.entry_count);
        Ok(header)
    }
}
