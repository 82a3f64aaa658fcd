// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Image descriptions, from a config file or from `create` arguments.
//!
//! Config file format:
//!
//! ```text
//! # Global options, before the first dtb.
//!   page_size=4096
//!   rev=0x1
//! board1.dtb
//!   id=0x100
//!   custom0=/board:variant
//! board2.dtb
//! ```
//!
//! Lines starting with whitespace are `option=value` lines. Any other non-empty line names a dtb
//! and starts a new entry. `#` starts a comment.

use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use crate::table::DtTableHeader;
use crate::writer::DtImageWriter;
use crate::Error;
use crate::Result;

const COMMENT: char = '#';
const OPTION_PREFIX: &str = "--";

/// Splits `option=value`. Whitespace around either side is dropped.
pub fn parse_option(s: &str) -> Option<(String, String)> {
    let (option, value) = s.split_once('=')?;
    let option = option.trim();
    if option.is_empty() {
        return None;
    }
    Some((option.to_owned(), value.trim().to_owned()))
}

/// A dtb of the image and the options set for it alone.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryConfig {
    pub path: PathBuf,
    pub options: Vec<(String, String)>,
}

/// Everything needed to write an image.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ImageConfig {
    pub global_options: Vec<(String, String)>,
    pub entries: Vec<EntryConfig>,
}

impl ImageConfig {
    fn push_option(&mut self, option: (String, String)) {
        match self.entries.last_mut() {
            Some(entry) => entry.options.push(option),
            None => self.global_options.push(option),
        }
    }

    fn push_entry(&mut self, path: PathBuf) {
        self.entries.push(EntryConfig {
            path,
            options: Vec::new(),
        });
    }

    /// Parses a config file. Relative dtb names are looked up in `dtb_dir` when given.
    pub fn from_cfg(text: &str, dtb_dir: Option<&Path>) -> Result<ImageConfig> {
        let mut config = ImageConfig::default();
        for (index, line) in text.lines().enumerate() {
            let line = line.split(COMMENT).next().unwrap_or_default();
            if line.trim().is_empty() {
                continue;
            }
            if line.starts_with(char::is_whitespace) {
                let option = parse_option(line).ok_or_else(|| Error::InvalidConfig {
                    line: index + 1,
                    reason: format!("expected option=value, got {:?}", line.trim()),
                })?;
                config.push_option(option);
            } else {
                let name = Path::new(line.trim_end());
                config.push_entry(match dtb_dir {
                    Some(dir) => dir.join(name),
                    None => name.to_path_buf(),
                });
            }
        }
        Ok(config)
    }

    /// Parses `create` arguments: `--option=value` items and dtb paths. Options before the first
    /// dtb are global.
    pub fn from_args<S: AsRef<str>>(args: &[S]) -> Result<ImageConfig> {
        let mut config = ImageConfig::default();
        for arg in args {
            let arg = arg.as_ref();
            match arg.strip_prefix(OPTION_PREFIX) {
                Some(option) => {
                    let option =
                        parse_option(option).ok_or_else(|| Error::InvalidValue(arg.to_owned()))?;
                    config.push_option(option);
                }
                None => config.push_entry(PathBuf::from(arg)),
            }
        }
        Ok(config)
    }

    /// Reads every dtb and writes the image to `out`.
    pub fn write_image<W: Write>(&self, out: &mut W) -> Result<DtTableHeader> {
        let entry_count = u32::try_from(self.entries.len()).map_err(|_| Error::ImageTooLarge)?;
        let mut writer = DtImageWriter::start(entry_count)?;
        for (option, value) in &self.global_options {
            writer.set_global_option(option, value)?;
        }
        for entry in &self.entries {
            writer.add_entry(&entry.path)?;
            for (option, value) in &entry.options {
                writer.set_entry_option(option, value)?;
            }
        }
        writer.end(out)
    }
}
