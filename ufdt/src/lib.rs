// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Unflattened device tree: parse FDT blobs into an editable tree, apply overlays to it and
//! verify the result.

mod fdt;
mod overlay;
mod path;
mod pool;
mod propval;
mod tree;
mod verify;

pub use fdt::Error;
pub use fdt::FdtHeader;
pub use fdt::FdtReserveEntry;
pub use fdt::Result;
pub use fdt::FDT_HEADER_SIZE;
pub use fdt::FDT_MAGIC;
pub use overlay::apply_overlay;
pub use overlay::apply_overlay_blob;
pub use path::parse_path_with_prop;
pub use path::Path;
pub use path::PhandlePin;
pub use pool::NodeId;
pub use pool::NodePool;
pub use propval::read_cell;
pub use propval::write_cell;
pub use propval::FromFdtPropval;
pub use propval::ToFdtPropval;
pub use propval::CELL_SIZE;
pub use tree::DetachedNode;
pub use tree::Node;
pub use tree::Tag;
pub use tree::Ufdt;
pub use tree::LINUX_PHANDLE_PROP;
pub use tree::PHANDLE_PROP;
pub use verify::verify_overlay;
pub use verify::verify_overlay_blob;
pub use verify::FragmentReport;
pub use verify::VerifyReport;
pub use verify::VerifyResult;
