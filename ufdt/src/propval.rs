// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Conversions between Rust values and raw device tree property bytes.
//!
//! Cells are stored as big-endian `u32` values. Strings are NUL-terminated and string lists are
//! stored back to back.

use crate::fdt::Error;
use crate::fdt::Result;

/// Size in bytes of one property cell.
pub const CELL_SIZE: usize = 4;

/// Conversion into a raw property value.
pub trait ToFdtPropval {
    fn to_propval(self) -> Result<Vec<u8>>;
}

/// Conversion from a raw property value. Returns `None` when the bytes do not have the expected
/// shape.
pub trait FromFdtPropval: Sized {
    fn from_propval(propval: &[u8]) -> Option<Self>;
}

/// Reads the big-endian cell starting at byte `offset`.
pub fn read_cell(bytes: &[u8], offset: usize) -> Option<u32> {
    let end = offset.checked_add(CELL_SIZE)?;
    let cell: [u8; CELL_SIZE] = bytes.get(offset..end)?.try_into().ok()?;
    Some(u32::from_be_bytes(cell))
}

/// Overwrites the big-endian cell starting at byte `offset`. Returns `None` if it does not fit.
pub fn write_cell(bytes: &mut [u8], offset: usize, value: u32) -> Option<()> {
    let end = offset.checked_add(CELL_SIZE)?;
    bytes
        .get_mut(offset..end)?
        .copy_from_slice(&value.to_be_bytes());
    Some(())
}

fn cells_to_bytes(cells: &[u32]) -> Vec<u8> {
    cells.iter().flat_map(|cell| cell.to_be_bytes()).collect()
}

fn push_string(bytes: &mut Vec<u8>, s: &str) -> Result<()> {
    // libfdt only rejects embedded NULs, so printable-ness is not checked here either.
    if s.contains('\0') {
        return Err(Error::InvalidString(s.to_owned()));
    }
    bytes.extend_from_slice(s.as_bytes());
    bytes.push(0);
    Ok(())
}

fn strings_to_bytes<S: AsRef<str>>(strings: &[S]) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    for s in strings {
        push_string(&mut bytes, s.as_ref())?;
    }
    Ok(bytes)
}

/// Converts a single NUL-terminated byte string to a `String`.
pub(crate) fn c_str_to_string(bytes: &[u8]) -> Option<String> {
    let (&last, body) = bytes.split_last()?;
    if last != 0 || body.contains(&0) {
        return None;
    }
    String::from_utf8(body.to_vec()).ok()
}

impl ToFdtPropval for () {
    fn to_propval(self) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }
}

impl ToFdtPropval for &[u8] {
    fn to_propval(self) -> Result<Vec<u8>> {
        Ok(self.to_vec())
    }
}

impl<const N: usize> ToFdtPropval for &[u8; N] {
    fn to_propval(self) -> Result<Vec<u8>> {
        Ok(self.to_vec())
    }
}

impl ToFdtPropval for Vec<u8> {
    fn to_propval(self) -> Result<Vec<u8>> {
        Ok(self)
    }
}

impl ToFdtPropval for u32 {
    fn to_propval(self) -> Result<Vec<u8>> {
        Ok(self.to_be_bytes().to_vec())
    }
}

impl ToFdtPropval for &[u32] {
    fn to_propval(self) -> Result<Vec<u8>> {
        Ok(cells_to_bytes(self))
    }
}

impl<const N: usize> ToFdtPropval for &[u32; N] {
    fn to_propval(self) -> Result<Vec<u8>> {
        Ok(cells_to_bytes(self))
    }
}

impl ToFdtPropval for Vec<u32> {
    fn to_propval(self) -> Result<Vec<u8>> {
        Ok(cells_to_bytes(&self))
    }
}

impl ToFdtPropval for &str {
    fn to_propval(self) -> Result<Vec<u8>> {
        strings_to_bytes(&[self])
    }
}

impl ToFdtPropval for String {
    fn to_propval(self) -> Result<Vec<u8>> {
        strings_to_bytes(&[self])
    }
}

impl ToFdtPropval for &[&str] {
    fn to_propval(self) -> Result<Vec<u8>> {
        strings_to_bytes(self)
    }
}

impl<const N: usize> ToFdtPropval for &[&str; N] {
    fn to_propval(self) -> Result<Vec<u8>> {
        strings_to_bytes(self)
    }
}

impl ToFdtPropval for Vec<String> {
    fn to_propval(self) -> Result<Vec<u8>> {
        strings_to_bytes(&self)
    }
}

impl FromFdtPropval for () {
    fn from_propval(propval: &[u8]) -> Option<Self> {
        propval.is_empty().then_some(())
    }
}

impl FromFdtPropval for Vec<u8> {
    fn from_propval(propval: &[u8]) -> Option<Self> {
        Some(propval.to_vec())
    }
}

impl FromFdtPropval for u32 {
    fn from_propval(propval: &[u8]) -> Option<Self> {
        if propval.len() != CELL_SIZE {
            return None;
        }
        read_cell(propval, 0)
    }
}

impl FromFdtPropval for Vec<u32> {
    fn from_propval(propval: &[u8]) -> Option<Self> {
        if propval.len() % CELL_SIZE != 0 {
            return None;
        }
        (0..propval.len())
            .step_by(CELL_SIZE)
            .map(|offset| read_cell(propval, offset))
            .collect()
    }
}

impl FromFdtPropval for String {
    fn from_propval(propval: &[u8]) -> Option<Self> {
        c_str_to_string(propval)
    }
}

impl FromFdtPropval for Vec<String> {
    fn from_propval(propval: &[u8]) -> Option<Self> {
        let body = propval.strip_suffix(&[0])?;
        body.split(|&b| b == 0)
            .map(|s| String::from_utf8(s.to_vec()).ok())
            .collect()
    }
}
