// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! DT table images: a fixed header, an array of entries and the device tree blobs they point to.
//!
//! All header and entry fields are big-endian 32-bit words. Several entries may point at the same
//! blob when they were created from the same file.

mod config;
mod table;
mod writer;

use std::io;
use std::path::PathBuf;

use remain::sorted;
use thiserror::Error as ThisError;

pub use config::parse_option;
pub use config::EntryConfig;
pub use config::ImageConfig;
pub use table::DtTable;
pub use table::DtTableEntry;
pub use table::DtTableHeader;
pub use table::DT_TABLE_DEFAULT_PAGE_SIZE;
pub use table::DT_TABLE_ENTRY_SIZE;
pub use table::DT_TABLE_HEADER_SIZE;
pub use table::DT_TABLE_MAGIC;
pub use writer::parse_number;
pub use writer::DtImageWriter;
pub use writer::DtOptions;

#[sorted]
#[derive(ThisError, Debug)]
pub enum Error {
    #[error("Bad DT table magic 0x{:08x}", .0)]
    BadMagic(u32),
    #[error("Image declares {declared} entries but {written} were added")]
    EntryCountMismatch { declared: u32, written: u32 },
    #[error("Option {} given before any dtb", .0)]
    EntryOptionWithoutEntry(String),
    #[error("Image does not fit in 32 bits")]
    ImageTooLarge,
    #[error("Config line {line}: {reason}")]
    InvalidConfig { line: usize, reason: String },
    #[error("{}: {}", .path.display(), .source)]
    InvalidDtb { path: PathBuf, source: ufdt::Error },
    #[error("Invalid number {:?}", .0)]
    InvalidNumber(String),
    #[error("Unknown option {:?}", .0)]
    InvalidOption(String),
    #[error("Invalid option value {:?}", .0)]
    InvalidValue(String),
    #[error("Can not find property {}", .0)]
    MissingProperty(String),
    #[error("Can not read {}: {}", .path.display(), .source)]
    ReadDtb { path: PathBuf, source: io::Error },
    #[error("Image truncated: {}", .0)]
    Truncated(String),
    #[error("Failed to write image: {}", .0)]
    WriteImage(io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
