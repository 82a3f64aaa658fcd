// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Absolute node paths and `path:property:offset` fixup locations.

use std::fmt;
use std::str::FromStr;

use crate::fdt::Error;
use crate::fdt::Result;
use crate::propval::CELL_SIZE;

pub(crate) const PATH_SEP: &str = "/";
const FIXUP_SEP: char = ':';

/// Absolute path of a node, e.g. `/soc/i2c@0`. The root is `/`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Path(String);

fn check_segment(segment: &str, path: &str) -> Result<()> {
    if segment.is_empty() || segment.contains(FIXUP_SEP) || segment.contains('\0') {
        return Err(Error::InvalidPath(format!("bad node name in {:?}", path)));
    }
    Ok(())
}

impl Path {
    /// Node names along the path, root excluded.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.split(PATH_SEP).filter(|segment| !segment.is_empty())
    }

    /// Returns a new path with the `/`-separated `subpath` appended.
    pub fn push(&self, subpath: &str) -> Result<Path> {
        let mut path = self.0.clone();
        for segment in subpath.split(PATH_SEP) {
            check_segment(segment, subpath)?;
            if !path.ends_with(PATH_SEP) {
                path.push_str(PATH_SEP);
            }
            path.push_str(segment);
        }
        Ok(Path(path))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Path {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        let rest = value
            .strip_prefix(PATH_SEP)
            .ok_or_else(|| Error::InvalidPath(format!("{:?} is not absolute", value)))?;
        if rest.is_empty() {
            return Ok(Path(PATH_SEP.to_owned()));
        }
        Path(PATH_SEP.to_owned()).push(rest)
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<Path> for String {
    fn from(path: Path) -> String {
        path.0
    }
}

/// Location of one phandle cell: a property name and a byte offset into its value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhandlePin(pub String, pub u32);

impl PhandlePin {
    /// Byte offset as an index, rejecting offsets that do not start a cell.
    pub(crate) fn cell_offset(&self) -> Result<usize> {
        let offset = self.1 as usize;
        if offset % CELL_SIZE != 0 {
            return Err(Error::InvalidFixup(format!(
                "{}: offset {} is not cell aligned",
                self.0, self.1
            )));
        }
        Ok(offset)
    }
}

/// Splits a fixup location `"/path/to/node:property:offset"`.
///
/// The offset is a decimal byte offset and must be followed by nothing else.
pub fn parse_path_with_prop(value: &str) -> Result<(Path, PhandlePin)> {
    let invalid = || Error::InvalidFixup(value.to_owned());
    let mut parts = value.splitn(3, FIXUP_SEP);
    let path = parts.next().ok_or_else(invalid)?;
    let prop = parts.next().filter(|p| !p.is_empty()).ok_or_else(invalid)?;
    let offset = parts
        .next()
        .and_then(|o| o.parse::<u32>().ok())
        .ok_or_else(invalid)?;
    Ok((path.parse()?, PhandlePin(prop.to_owned(), offset)))
}
