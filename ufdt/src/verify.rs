// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Checks that a final tree contains everything an overlay adds.
//!
//! The final tree is never modified. The overlay goes through the same external fixups as in
//! [`apply_overlay`](crate::apply_overlay), but its own phandles are not renumbered, so property
//! cells that differ between the two trees are accepted when both resolve to nodes with the same
//! name.

use std::fmt;

use log::debug;
use log::error;
use log::warn;

use crate::fdt::Error;
use crate::fdt::Result;
use crate::overlay::apply_external_fixups;
use crate::overlay::find_fragment_target;
use crate::overlay::fixup_entries;
use crate::overlay::OVERLAY_NODE;
use crate::overlay::TARGET_PROP;
use crate::path::parse_path_with_prop;
use crate::pool::NodeId;
use crate::propval::read_cell;
use crate::propval::CELL_SIZE;
use crate::tree::Tag;
use crate::tree::Ufdt;

/// Outcome of verifying one child of the overlay root.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerifyResult {
    Ok,
    /// Neither `target` nor `target-path`. Not a fragment, so not a failure.
    MissingTarget,
    MissingOverlay,
    TargetPathInvalid,
    TargetInvalid,
    /// A `__fixups__` entry patches a property other than `target`. Such fragments cannot be
    /// combined and are not verified.
    UnsupportedFixup,
    VerifyFail,
}

impl VerifyResult {
    pub fn is_ok(self) -> bool {
        matches!(self, VerifyResult::Ok | VerifyResult::MissingTarget)
    }
}

impl fmt::Display for VerifyResult {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use self::VerifyResult::*;

        match self {
            Ok => write!(f, "ok"),
            MissingTarget => write!(f, "no target or target-path"),
            MissingOverlay => write!(f, "missing __overlay__ node"),
            TargetPathInvalid => write!(f, "target-path not found in final tree"),
            TargetInvalid => write!(f, "target phandle not found in final tree"),
            UnsupportedFixup => write!(f, "fixup of a property other than target"),
            VerifyFail => write!(f, "overlay content not found in final tree"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FragmentReport {
    pub fragment: String,
    pub result: VerifyResult,
}

/// Per-fragment results, in overlay order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VerifyReport {
    pub fragments: Vec<FragmentReport>,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.fragments.iter().all(|f| f.result.is_ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = &FragmentReport> {
        self.fragments.iter().filter(|f| !f.result.is_ok())
    }
}

// Fragments that get their target from the same label are merged into the first of them, so
// that each target is compared against the union of what was applied to it. Returns the fragments
// holding fixups of any other property.
fn combine_fragments(overlay: &mut Ufdt) -> Result<Vec<NodeId>> {
    let mut unsupported = Vec::new();
    for (label, locations) in fixup_entries(overlay)? {
        let mut first: Option<NodeId> = None;
        for location in locations {
            let (path, pin) = parse_path_with_prop(&location)?;
            if pin.0 != TARGET_PROP {
                error!("{}: unsupported fixup of {}", label, location);
                let fragment = path
                    .iter()
                    .next()
                    .and_then(|name| overlay.get_subnode_by_name(overlay.root(), name));
                if let Some(fragment) = fragment {
                    if !unsupported.contains(&fragment) {
                        unsupported.push(fragment);
                    }
                }
                continue;
            }
            let Some(fragment) = overlay.get_node_by_path(overlay.root(), path.as_str()) else {
                error!("path {} not found", path);
                continue;
            };
            match first {
                None => first = Some(fragment),
                Some(prev) if prev == fragment => {}
                Some(prev) => {
                    debug!("{}: combining {} into an earlier fragment", label, path);
                    overlay.merge_into(prev, fragment)?;
                }
            }
        }
    }
    Ok(unsupported)
}

fn same_phandle_target(final_tree: &Ufdt, actual: u32, overlay: &Ufdt, expected: u32) -> bool {
    let actual = final_tree
        .get_node_by_phandle(actual)
        .and_then(|n| final_tree.node(n));
    let expected = overlay
        .get_node_by_phandle(expected)
        .and_then(|n| overlay.node(n));
    match (actual, expected) {
        (Some(a), Some(e)) => a.name() == e.name(),
        _ => false,
    }
}

fn props_match(final_tree: &Ufdt, actual: NodeId, overlay: &Ufdt, expected: NodeId) -> bool {
    let (Some(a), Some(e)) = (
        final_tree.get_fdt_prop_data(actual),
        overlay.get_fdt_prop_data(expected),
    ) else {
        return false;
    };
    if a == e {
        return true;
    }
    if a.len() != e.len() || a.len() % CELL_SIZE != 0 {
        return false;
    }
    // Cells that differ may be phandles that were renumbered during apply.
    (0..a.len()).step_by(CELL_SIZE).all(|offset| {
        match (read_cell(a, offset), read_cell(e, offset)) {
            (Some(x), Some(y)) => x == y || same_phandle_target(final_tree, x, overlay, y),
            _ => false,
        }
    })
}

// Whether every child of `expected` has an equal counterpart under `actual`. Extra children
// under `actual` are allowed.
fn contains_subtree(final_tree: &Ufdt, actual: NodeId, overlay: &Ufdt, expected: NodeId) -> bool {
    let Some(node) = overlay.node(expected) else {
        return false;
    };
    node.children().iter().all(|&child| {
        let Some(child_node) = overlay.node(child) else {
            return false;
        };
        let name = child_node.name();
        let found = match child_node.tag() {
            Tag::BeginNode => final_tree
                .get_subnode_by_name(actual, name)
                .map_or(false, |found| contains_subtree(final_tree, found, overlay, child)),
            Tag::Prop => final_tree
                .get_property_by_name(actual, name)
                .map_or(false, |found| props_match(final_tree, found, overlay, child)),
        };
        if !found {
            warn!("{} differs or is missing in the final tree", name);
        }
        found
    })
}

fn verify_fragment(final_tree: &Ufdt, overlay: &Ufdt, fragment: NodeId) -> VerifyResult {
    let name = overlay.node(fragment).map(|n| n.name()).unwrap_or_default();
    let target = match find_fragment_target(final_tree, overlay, fragment) {
        Ok(Some(target)) => target,
        Ok(None) => return VerifyResult::MissingTarget,
        Err(Error::TargetPathInvalid(path)) => {
            error!("{}: failed to find target-path {}", name, path);
            return VerifyResult::TargetPathInvalid;
        }
        Err(e) => {
            error!("{}: failed to find target: {}", name, e);
            return VerifyResult::TargetInvalid;
        }
    };
    let Some(overlay_node) = overlay.get_subnode_by_name(fragment, OVERLAY_NODE) else {
        error!("{}: missing {} sub-node", name, OVERLAY_NODE);
        return VerifyResult::MissingOverlay;
    };
    if !contains_subtree(final_tree, target, overlay, overlay_node) {
        error!(
            "{}: failed to verify overlay node against target {}",
            name,
            final_tree.path_of(target).unwrap_or_default()
        );
        return VerifyResult::VerifyFail;
    }
    VerifyResult::Ok
}

/// Verify that `final_tree` is a result of applying `overlay`.
///
/// Fails with `Err` only when the overlay fixups cannot be resolved against `final_tree`.
/// Everything else is reported per fragment.
pub fn verify_overlay(final_tree: &Ufdt, mut overlay: Ufdt) -> Result<VerifyReport> {
    apply_external_fixups(final_tree, &mut overlay).map_err(|e| {
        error!("failed to perform fixups in overlay: {}", e);
        e
    })?;
    let unsupported = combine_fragments(&mut overlay)?;

    let fragments = overlay
        .subnodes(overlay.root())
        .map(|fragment| FragmentReport {
            fragment: overlay
                .node(fragment)
                .map(|n| n.name().to_owned())
                .unwrap_or_default(),
            result: if unsupported.contains(&fragment) {
                VerifyResult::UnsupportedFixup
            } else {
                verify_fragment(final_tree, &overlay, fragment)
            },
        })
        .collect();
    Ok(VerifyReport { fragments })
}

/// Parses both blobs and verifies `overlay` against `final_blob`.
pub fn verify_overlay_blob(final_blob: &[u8], overlay: &[u8]) -> Result<VerifyReport> {
    let final_tree = Ufdt::from_blob(final_blob)?;
    let overlay = Ufdt::from_blob(overlay)?;
    verify_overlay(&final_tree, overlay)
}
