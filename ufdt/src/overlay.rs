// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This module applies device tree overlays to a base tree.
//!
//! Applying an overlay runs in four steps:
//!
//! 1. Every phandle of the overlay is moved above the largest phandle of the base, and the
//!    references listed in `__local_fixups__` are moved with them.
//! 2. References to base labels listed in `__fixups__` are patched with the phandles found
//!    through the base `__symbols__` node.
//! 3. The target of every fragment is resolved. Nothing is merged until all targets resolve.
//! 4. The `__overlay__` node of every fragment is merged into its target, and the overlay
//!    symbols and memory reservations are carried over to the base.

use std::collections::BTreeMap;

use log::debug;
use log::error;
use log::warn;

use crate::fdt::Error;
use crate::fdt::FdtReserveEntry;
use crate::fdt::Result;
use crate::path::parse_path_with_prop;
use crate::path::Path;
use crate::path::PhandlePin;
use crate::path::PATH_SEP;
use crate::pool::NodeId;
use crate::propval::read_cell;
use crate::propval::FromFdtPropval;
use crate::tree::Ufdt;
use crate::tree::LINUX_PHANDLE_PROP;
use crate::tree::PHANDLE_PROP;

pub(crate) const TARGET_PATH_PROP: &str = "target-path";
pub(crate) const TARGET_PROP: &str = "target";
const LOCAL_FIXUPS_NODE: &str = "__local_fixups__";
pub(crate) const OVERLAY_NODE: &str = "__overlay__";
const SYMBOLS_NODE: &str = "__symbols__";
const FIXUPS_NODE: &str = "__fixups__";
const ROOT_NODE: &str = "/";

fn node_name(tree: &Ufdt, node: NodeId) -> String {
    tree.node(node)
        .map(|n| n.name().to_owned())
        .unwrap_or_default()
}

// Add the given delta to the phandle properties of all nodes in the overlay.
fn offset_phandle_values(overlay: &mut Ufdt, delta: u32) -> Result<()> {
    for node in overlay.subtree_nodes(overlay.root()) {
        for propname in [PHANDLE_PROP, LINUX_PHANDLE_PROP] {
            // Values that are not a single cell are left alone.
            let Some(phandle) = overlay.get_prop::<u32>(node, propname) else {
                continue;
            };
            let phandle = phandle.checked_add(delta).ok_or(Error::PhandleOverflow)?;
            overlay.set_prop(node, propname, phandle)?;
        }
    }
    Ok(())
}

// Returns the phandle locations listed under __local_fixups__, keyed by the path of the node
// holding the referencing property.
fn collect_local_fixup_paths(overlay: &Ufdt) -> Result<BTreeMap<Path, Vec<PhandlePin>>> {
    let mut local_phandles = BTreeMap::<Path, Vec<PhandlePin>>::new();
    let Some(local_fixups) = overlay.get_subnode_by_name(overlay.root(), LOCAL_FIXUPS_NODE) else {
        return Ok(local_phandles);
    };
    let mut pending = vec![(ROOT_NODE.parse::<Path>()?, local_fixups)];
    while let Some((path, node)) = pending.pop() {
        for prop in overlay.properties(node) {
            let name = node_name(overlay, prop);
            let offsets = overlay
                .get_fdt_prop_data(prop)
                .and_then(Vec::<u32>::from_propval)
                .ok_or_else(|| {
                    Error::ApplyOverlayError(format!(
                        "local fixup {}:{} is not an offset array",
                        path, name
                    ))
                })?;
            local_phandles
                .entry(path.clone())
                .or_default()
                .extend(offsets.into_iter().map(|o| PhandlePin(name.clone(), o)));
        }
        for child in overlay.subnodes(node) {
            pending.push((path.push(&node_name(overlay, child))?, child));
        }
    }
    Ok(local_phandles)
}

fn update_local_phandle_propvals(
    overlay: &mut Ufdt,
    paths: BTreeMap<Path, Vec<PhandlePin>>,
    delta: u32,
) -> Result<()> {
    for (path, pins) in paths {
        let node = overlay
            .get_node_by_path(overlay.root(), path.as_str())
            .ok_or_else(|| {
                Error::ApplyOverlayError(format!("cannot find node {} for local fixup", path))
            })?;
        for pin in pins {
            let prop = overlay.get_property_by_name(node, &pin.0).ok_or_else(|| {
                Error::ApplyOverlayError(format!("missing property {}:{}", path, pin.0))
            })?;
            let offset = pin.cell_offset()?;
            let phandle = overlay
                .get_fdt_prop_data(prop)
                .and_then(|data| read_cell(data, offset))
                .ok_or_else(|| {
                    Error::InvalidFixup(format!("{}:{}:{} out of range", path, pin.0, pin.1))
                })?;
            let phandle = phandle.checked_add(delta).ok_or(Error::PhandleOverflow)?;
            overlay.write_prop_cell(prop, offset, phandle)?;
        }
    }
    Ok(())
}

fn update_local_refs(overlay: &mut Ufdt, delta: u32) -> Result<()> {
    let phandle_locations = collect_local_fixup_paths(overlay)?;
    update_local_phandle_propvals(overlay, phandle_locations, delta)
}

/// Label and location list of every property of the overlay `__fixups__` node, in order.
pub(crate) fn fixup_entries(overlay: &Ufdt) -> Result<Vec<(String, Vec<String>)>> {
    let Some(fixups) = overlay.get_subnode_by_name(overlay.root(), FIXUPS_NODE) else {
        return Ok(Vec::new());
    };
    overlay
        .properties(fixups)
        .map(|prop| {
            let label = node_name(overlay, prop);
            let locations = overlay
                .get_fdt_prop_data(prop)
                .and_then(Vec::<String>::from_propval)
                .ok_or_else(|| {
                    Error::ApplyOverlayError(format!("cannot parse locations for fixup {}", label))
                })?;
            Ok((label, locations))
        })
        .collect()
}

// Given a label, find the path and phandle of the base node it names.
fn get_symbol_path_and_phandle(symbol: &str, base: &Ufdt) -> Result<(String, u32)> {
    let symbols = base
        .get_subnode_by_name(base.root(), SYMBOLS_NODE)
        .ok_or_else(|| {
            error!("base tree has no {} node", SYMBOLS_NODE);
            Error::ApplyOverlayError(format!("base tree has no {} node", SYMBOLS_NODE))
        })?;
    let path: String = base
        .get_prop(symbols, symbol)
        .ok_or_else(|| Error::UnresolvedSymbol(symbol.to_owned()))?;
    let node = base
        .get_node(&path)
        .ok_or_else(|| Error::UnresolvedSymbol(format!("{} ({})", symbol, path)))?;
    match base.get_phandle(node) {
        0 => Err(Error::ApplyOverlayError(format!(
            "symbol {} names {}, which has no phandle",
            symbol, path
        ))),
        phandle => Ok((path, phandle)),
    }
}

// Overwrite the cell at a fixup location with `phandle`.
fn write_phandle_at(tree: &mut Ufdt, location: &str, phandle: u32) -> Result<()> {
    let (path, pin) = parse_path_with_prop(location)?;
    let node = tree
        .get_node_by_path(tree.root(), path.as_str())
        .ok_or_else(|| Error::InvalidFixup(format!("{}: no such node", location)))?;
    let prop = tree
        .get_property_by_name(node, &pin.0)
        .ok_or_else(|| Error::InvalidFixup(format!("{}: no such property", location)))?;
    tree.write_prop_cell(prop, pin.cell_offset()?, phandle)
}

/// Patches every location listed under the overlay `__fixups__` node with the phandle of the
/// base node its label names.
///
/// A label that cannot be resolved fails the whole operation.
pub(crate) fn apply_external_fixups(base: &Ufdt, overlay: &mut Ufdt) -> Result<()> {
    for (label, locations) in fixup_entries(overlay)? {
        let (base_path, phandle) = get_symbol_path_and_phandle(&label, base).map_err(|e| {
            error!("cannot resolve fixup {}: {}", label, e);
            e
        })?;
        debug!("fixup {} -> {} (phandle {:#x})", label, base_path, phandle);
        for location in locations {
            write_phandle_at(overlay, &location, phandle)?;
        }
    }
    Ok(())
}

/// Resolves the base node a fragment applies to.
///
/// `target` (a phandle) takes precedence over `target-path`. Returns `Ok(None)` for a node that
/// has neither, which is not a fragment.
pub(crate) fn find_fragment_target(
    base: &Ufdt,
    overlay: &Ufdt,
    fragment: NodeId,
) -> Result<Option<NodeId>> {
    if let Some(data) = overlay.get_prop_data(fragment, TARGET_PROP) {
        let phandle = u32::from_propval(data).ok_or_else(|| {
            Error::ApplyOverlayError(format!(
                "fragment {} has a malformed target",
                node_name(overlay, fragment)
            ))
        })?;
        return base
            .get_node_by_phandle(phandle)
            .map(Some)
            .ok_or(Error::TargetInvalid(phandle));
    }
    if let Some(data) = overlay.get_prop_data(fragment, TARGET_PATH_PROP) {
        let path = String::from_propval(data)
            .ok_or_else(|| Error::TargetPathInvalid(String::from_utf8_lossy(data).into_owned()))?;
        return base
            .get_node(&path)
            .map(Some)
            .ok_or(Error::TargetPathInvalid(path));
    }
    Ok(None)
}

// Parse the location of an overlay symbol, "/fragment@X/__overlay__/path/to/subnode", into the
// fragment name and the path below `__overlay__`.
fn extract_fragment_and_subpath(path: &Path) -> Option<(&str, String)> {
    let mut path_iter = path.iter();
    let fragment_name = path_iter.next()?;
    if path_iter.next()? != OVERLAY_NODE {
        return None;
    }
    let rest = path_iter.collect::<Vec<_>>();
    if rest.is_empty() {
        return None;
    }
    Some((fragment_name, rest.join(PATH_SEP)))
}

// Translate the overlay __symbols__ into paths of the merged tree. Must run before the
// fragments are moved out of the overlay.
fn collect_overlay_symbols(
    base: &Ufdt,
    overlay: &Ufdt,
    targets: &BTreeMap<String, NodeId>,
) -> Result<Vec<(String, String)>> {
    let Some(symbols) = overlay.get_subnode_by_name(overlay.root(), SYMBOLS_NODE) else {
        return Ok(Vec::new());
    };
    let mut translated = Vec::new();
    for prop in overlay.properties(symbols) {
        let symbol = node_name(overlay, prop);
        let Some(symbol_path) = overlay
            .get_fdt_prop_data(prop)
            .and_then(String::from_propval)
            .and_then(|p| p.parse::<Path>().ok())
        else {
            warn!("overlay symbol {} is not a path, not exported", symbol);
            continue;
        };
        let Some((fragment, rest)) = extract_fragment_and_subpath(&symbol_path) else {
            warn!(
                "overlay symbol {} ({}) is not inside a fragment, not exported",
                symbol, symbol_path
            );
            continue;
        };
        let Some(&target) = targets.get(fragment) else {
            warn!(
                "overlay symbol {} ({}) is in a fragment that was not applied",
                symbol, symbol_path
            );
            continue;
        };
        // E.g. target "/node" and "/fragment@X/__overlay__/path/to/subnode" give
        // "/node/path/to/subnode".
        let new_path: String = base
            .path_of(target)
            .ok_or(Error::StaleNode)?
            .parse::<Path>()?
            .push(&rest)?
            .into();
        translated.push((symbol, new_path));
    }
    Ok(translated)
}

fn update_base_symbols(base: &mut Ufdt, symbols: Vec<(String, String)>) -> Result<()> {
    if symbols.is_empty() {
        return Ok(());
    }
    let root = base.root();
    let symbols_node = match base.get_subnode_by_name(root, SYMBOLS_NODE) {
        Some(node) => node,
        None => {
            let node = base.construct_subnode(SYMBOLS_NODE);
            base.add_child(root, node)?;
            node
        }
    };
    for (symbol, path) in symbols {
        debug!("exporting symbol {} = {}", symbol, path);
        base.set_prop(symbols_node, &symbol, path)?;
    }
    Ok(())
}

// Merge new reserved memory entries into base, coalescing overlapping and adjacent ranges.
fn merge_resvmem(base: &mut Vec<FdtReserveEntry>, new_entries: Vec<FdtReserveEntry>) {
    base.extend(new_entries);
    base.sort_by_key(|entry| entry.address);
    let mut merged: Vec<FdtReserveEntry> = Vec::with_capacity(base.len());
    for entry in base.drain(..) {
        match merged.last_mut() {
            Some(last) if entry.address <= last.address.saturating_add(last.size) => {
                let end = last
                    .address
                    .saturating_add(last.size)
                    .max(entry.address.saturating_add(entry.size));
                last.size = end - last.address;
            }
            _ => merged.push(entry),
        }
    }
    *base = merged;
}

/// Apply an overlay to the base tree.
///
/// The overlay is consumed: the content of its fragments is moved into `base`. On error `base`
/// is left as it was.
///
/// # Arguments
///
/// `base` - tree that receives the new nodes and properties.
/// `overlay` - overlay tree. Needs a `__fixups__` node when it refers to base labels, in which
///     case `base` must carry a `__symbols__` node.
pub fn apply_overlay(base: &mut Ufdt, mut overlay: Ufdt) -> Result<()> {
    // Offset phandle property values in overlay nodes, and the local references to them.
    let max_phandle = base.max_phandle();
    offset_phandle_values(&mut overlay, max_phandle)?;
    update_local_refs(&mut overlay, max_phandle)?;

    // Apply phandle values for external references.
    apply_external_fixups(base, &mut overlay)?;

    // Resolve every fragment before touching the base tree.
    let mut plan = Vec::new();
    let mut targets = BTreeMap::new();
    for fragment in overlay.subnodes(overlay.root()) {
        let name = node_name(&overlay, fragment);
        let target = match find_fragment_target(base, &overlay, fragment) {
            Ok(Some(target)) => target,
            Ok(None) => {
                debug!("{} has no target, skipped", name);
                continue;
            }
            Err(e) => {
                error!("cannot resolve target of {}: {}", name, e);
                return Err(e);
            }
        };
        let overlay_node = overlay
            .get_subnode_by_name(fragment, OVERLAY_NODE)
            .ok_or_else(|| Error::MissingOverlay(name.clone()))?;
        debug!(
            "{} targets {}",
            name,
            base.path_of(target).unwrap_or_default()
        );
        targets.insert(name, target);
        plan.push((target, overlay_node));
    }
    let symbols = collect_overlay_symbols(base, &overlay, &targets)?;

    // Merge nodes from overlay into base.
    for (target, overlay_node) in plan {
        let content = overlay.take_subtree(overlay_node)?;
        base.merge_detached(target, content)?;
    }
    update_base_symbols(base, symbols)?;

    if !overlay.reserved_memory.is_empty() {
        merge_resvmem(
            &mut base.reserved_memory,
            std::mem::take(&mut overlay.reserved_memory),
        );
    }
    Ok(())
}

/// Parses both blobs, applies `overlay` to `base` and returns the merged blob.
pub fn apply_overlay_blob(base: &[u8], overlay: &[u8]) -> Result<Vec<u8>> {
    let mut base = Ufdt::from_blob(base)?;
    let overlay = Ufdt::from_blob(overlay)?;
    apply_overlay(&mut base, overlay)?;
    base.to_blob()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add_node(tree: &mut Ufdt, parent: NodeId, name: &str) -> NodeId {
        let node = tree.construct_subnode(name);
        tree.add_child(parent, node).unwrap();
        node
    }

    // Base tree:
    // / {
    //     panel { phandle = <5>; status = "disabled"; vendor = "acme"; };
    //     soc { phandle = <2>; };
    //     aliases { display = "/panel"; };
    //     __symbols__ { panel = "/panel"; soc = "/soc"; };
    // };
    fn make_base() -> Ufdt {
        let mut base = Ufdt::new();
        let root = base.root();
        let panel = add_node(&mut base, root, "panel");
        base.set_prop(panel, "phandle", 5u32).unwrap();
        base.set_prop(panel, "status", "disabled").unwrap();
        base.set_prop(panel, "vendor", "acme").unwrap();
        let soc = add_node(&mut base, root, "soc");
        base.set_prop(soc, "phandle", 2u32).unwrap();
        let aliases = add_node(&mut base, root, "aliases");
        base.set_prop(aliases, "display", "/panel").unwrap();
        let symbols = add_node(&mut base, root, "__symbols__");
        base.set_prop(symbols, "panel", "/panel").unwrap();
        base.set_prop(symbols, "soc", "/soc").unwrap();
        base
    }

    // Adds "/<name>/__overlay__" and returns both nodes.
    fn add_fragment(overlay: &mut Ufdt, name: &str) -> (NodeId, NodeId) {
        let root = overlay.root();
        let fragment = add_node(overlay, root, name);
        let content = add_node(overlay, fragment, OVERLAY_NODE);
        (fragment, content)
    }

    #[test]
    fn fdt_merge_resvmem() {
        let mut base = vec![
            FdtReserveEntry::new(1000, 100),
            FdtReserveEntry::new(2000, 500),
            FdtReserveEntry::new(3000, 1000),
        ];
        let new_entries = vec![
            FdtReserveEntry::new(1010, 20),
            FdtReserveEntry::new(1050, 1000),
            FdtReserveEntry::new(2700, 500),
        ];
        merge_resvmem(&mut base, new_entries);
        assert_eq!(
            base,
            vec![
                FdtReserveEntry::new(1000, 1500),
                FdtReserveEntry::new(2700, 1300),
            ]
        );
    }

    #[test]
    fn fdt_offset_phandles() {
        let mut overlay = Ufdt::new();
        let root = overlay.root();
        let a = add_node(&mut overlay, root, "a");
        overlay.set_prop(a, "phandle", 1u32).unwrap();
        let b = add_node(&mut overlay, a, "b");
        overlay.set_prop(b, "linux,phandle", 2u32).unwrap();
        overlay.set_prop(b, "phandle", 2u32).unwrap();

        offset_phandle_values(&mut overlay, 10).unwrap();
        assert_eq!(overlay.get_prop::<u32>(a, "phandle"), Some(11));
        assert_eq!(overlay.get_prop::<u32>(b, "phandle"), Some(12));
        assert_eq!(overlay.get_prop::<u32>(b, "linux,phandle"), Some(12));
        assert_eq!(overlay.get_node_by_phandle(12), Some(b));
        assert_eq!(overlay.get_node_by_phandle(1), None);

        assert!(matches!(
            offset_phandle_values(&mut overlay, u32::MAX),
            Err(Error::PhandleOverflow)
        ));
    }

    #[test]
    fn fdt_offset_local_references() {
        let mut overlay = Ufdt::new();
        let root = overlay.root();
        let (_, content) = add_fragment(&mut overlay, "fragment@0");
        let clk = add_node(&mut overlay, content, "clk");
        overlay.set_prop(clk, "phandle", 1u32).unwrap();
        let dev = add_node(&mut overlay, content, "dev");
        overlay.set_prop(dev, "clocks", &[1u32, 7, 1]).unwrap();

        // __local_fixups__ { fragment@0 { __overlay__ { dev { clocks = <0 8>; }; }; }; };
        let fixups = add_node(&mut overlay, root, LOCAL_FIXUPS_NODE);
        let f0 = add_node(&mut overlay, fixups, "fragment@0");
        let f0_content = add_node(&mut overlay, f0, OVERLAY_NODE);
        let f0_dev = add_node(&mut overlay, f0_content, "dev");
        overlay.set_prop(f0_dev, "clocks", &[0u32, 8]).unwrap();

        let paths = collect_local_fixup_paths(&overlay).unwrap();
        assert_eq!(
            paths,
            BTreeMap::from([(
                "/fragment@0/__overlay__/dev".parse().unwrap(),
                vec![
                    PhandlePin("clocks".to_owned(), 0),
                    PhandlePin("clocks".to_owned(), 8)
                ]
            )])
        );

        update_local_refs(&mut overlay, 0x20).unwrap();
        assert_eq!(
            overlay.get_prop::<Vec<u32>>(dev, "clocks").unwrap(),
            [0x21, 7, 0x21]
        );
    }

    #[test]
    fn local_fixup_out_of_range() {
        let mut overlay = Ufdt::new();
        let root = overlay.root();
        let dev = add_node(&mut overlay, root, "dev");
        overlay.set_prop(dev, "clocks", 1u32).unwrap();
        let fixups = add_node(&mut overlay, root, LOCAL_FIXUPS_NODE);
        let f_dev = add_node(&mut overlay, fixups, "dev");
        overlay.set_prop(f_dev, "clocks", 4u32).unwrap();

        assert!(matches!(
            update_local_refs(&mut overlay, 1),
            Err(Error::InvalidFixup(_))
        ));
    }

    #[test]
    fn apply_with_external_fixup() {
        let mut base = make_base();
        let mut overlay = Ufdt::new();
        let root = overlay.root();
        let (fragment, content) = add_fragment(&mut overlay, "fragment@0");
        overlay.set_prop(fragment, TARGET_PROP, 0xffffffffu32).unwrap();
        overlay.set_prop(content, "status", "okay").unwrap();
        let fixups = add_node(&mut overlay, root, FIXUPS_NODE);
        overlay
            .set_prop(fixups, "panel", "/fragment@0:target:0")
            .unwrap();

        apply_overlay(&mut base, overlay).unwrap();
        let panel = base.get_node("/panel").unwrap();
        assert_eq!(base.get_prop::<String>(panel, "status").unwrap(), "okay");
        assert_eq!(base.get_prop::<String>(panel, "vendor").unwrap(), "acme");
    }

    #[test]
    fn apply_with_target_path_and_alias() {
        let mut base = make_base();
        let mut overlay = Ufdt::new();
        let (f0, c0) = add_fragment(&mut overlay, "fragment@0");
        overlay.set_prop(f0, TARGET_PATH_PROP, "/soc").unwrap();
        let gpio = add_node(&mut overlay, c0, "gpio@100");
        overlay.set_prop(gpio, "phandle", 1u32).unwrap();
        let (f1, c1) = add_fragment(&mut overlay, "fragment@1");
        overlay.set_prop(f1, TARGET_PATH_PROP, "display").unwrap();
        overlay.set_prop(c1, "rotation", 90u32).unwrap();

        apply_overlay(&mut base, overlay).unwrap();
        let gpio = base.get_node("/soc/gpio@100").unwrap();
        // Renumbered above the base maximum of 5.
        assert_eq!(base.get_phandle(gpio), 6);
        assert_eq!(base.get_node_by_phandle(6), Some(gpio));
        assert_eq!(base.get_prop::<u32>(base.get_node("/panel").unwrap(), "rotation"), Some(90));
    }

    #[test]
    fn unresolved_label_leaves_base_untouched() {
        let mut base = make_base();
        let before = base.to_blob().unwrap();
        let mut overlay = Ufdt::new();
        let root = overlay.root();
        let (fragment, content) = add_fragment(&mut overlay, "fragment@0");
        overlay.set_prop(fragment, TARGET_PROP, 0xffffffffu32).unwrap();
        overlay.set_prop(content, "status", "okay").unwrap();
        let fixups = add_node(&mut overlay, root, FIXUPS_NODE);
        overlay
            .set_prop(fixups, "backlight", "/fragment@0:target:0")
            .unwrap();

        assert!(matches!(
            apply_overlay(&mut base, overlay),
            Err(Error::UnresolvedSymbol(label)) if label == "backlight"
        ));
        assert_eq!(base.to_blob().unwrap(), before);
    }

    #[test]
    fn fixups_need_base_symbols() {
        let mut base = Ufdt::new();
        let mut overlay = Ufdt::new();
        let root = overlay.root();
        let fixups = add_node(&mut overlay, root, FIXUPS_NODE);
        overlay
            .set_prop(fixups, "panel", "/fragment@0:target:0")
            .unwrap();
        assert!(matches!(
            apply_overlay(&mut base, overlay),
            Err(Error::ApplyOverlayError(_))
        ));
    }

    #[test]
    fn bad_targets_are_reported_before_merging() {
        let mut base = make_base();
        let before = base.to_blob().unwrap();

        let mut overlay = Ufdt::new();
        let (f0, c0) = add_fragment(&mut overlay, "fragment@0");
        overlay.set_prop(f0, TARGET_PROP, 5u32).unwrap();
        overlay.set_prop(c0, "status", "okay").unwrap();
        let (f1, _) = add_fragment(&mut overlay, "fragment@1");
        overlay.set_prop(f1, TARGET_PROP, 0x42u32).unwrap();
        assert!(matches!(
            apply_overlay(&mut base, overlay),
            Err(Error::TargetInvalid(0x42))
        ));
        assert_eq!(base.to_blob().unwrap(), before);

        let mut overlay = Ufdt::new();
        let (f0, _) = add_fragment(&mut overlay, "fragment@0");
        overlay.set_prop(f0, TARGET_PATH_PROP, "/nowhere").unwrap();
        assert!(matches!(
            apply_overlay(&mut base, overlay),
            Err(Error::TargetPathInvalid(path)) if path == "/nowhere"
        ));

        let mut overlay = Ufdt::new();
        let root = overlay.root();
        let f0 = add_node(&mut overlay, root, "fragment@0");
        overlay.set_prop(f0, TARGET_PATH_PROP, "/soc").unwrap();
        assert!(matches!(
            apply_overlay(&mut base, overlay),
            Err(Error::MissingOverlay(name)) if name == "fragment@0"
        ));
        assert_eq!(base.to_blob().unwrap(), before);
    }

    #[test]
    fn nodes_without_target_are_skipped() {
        let mut base = make_base();
        let before = base.to_blob().unwrap();
        let mut overlay = Ufdt::new();
        let (_, content) = add_fragment(&mut overlay, "fragment@0");
        overlay.set_prop(content, "status", "okay").unwrap();
        apply_overlay(&mut base, overlay).unwrap();
        assert_eq!(base.to_blob().unwrap(), before);
    }

    #[test]
    fn overlay_symbols_are_exported() {
        let mut base = make_base();
        let mut overlay = Ufdt::new();
        let root = overlay.root();
        let (f0, c0) = add_fragment(&mut overlay, "fragment@0");
        overlay.set_prop(f0, TARGET_PATH_PROP, "/soc").unwrap();
        add_node(&mut overlay, c0, "i2c@0");
        let symbols = add_node(&mut overlay, root, SYMBOLS_NODE);
        overlay
            .set_prop(symbols, "i2c0", "/fragment@0/__overlay__/i2c@0")
            .unwrap();
        overlay.set_prop(symbols, "frag", "/fragment@0").unwrap();

        apply_overlay(&mut base, overlay).unwrap();
        let symbols = base.get_node("/__symbols__").unwrap();
        assert_eq!(
            base.get_prop::<String>(symbols, "i2c0").unwrap(),
            "/soc/i2c@0"
        );
        assert!(base.get_prop::<String>(symbols, "frag").is_none());
        assert_eq!(base.get_prop::<String>(symbols, "panel").unwrap(), "/panel");
    }

    #[test]
    fn resvmem_from_overlay_is_merged() {
        let mut base = make_base();
        base.set_reserved_memory(vec![FdtReserveEntry::new(0x1000, 0x1000)]);
        let mut overlay = Ufdt::new();
        overlay.set_reserved_memory(vec![FdtReserveEntry::new(0x1800, 0x1000)]);
        apply_overlay(&mut base, overlay).unwrap();
        assert_eq!(
            base.reserved_memory(),
            [FdtReserveEntry::new(0x1000, 0x1800)]
        );
    }

    #[test]
    fn extract_symbol_location() {
        let path: Path = "/fragment@2/__overlay__/a/b".parse().unwrap();
        assert_eq!(
            extract_fragment_and_subpath(&path),
            Some(("fragment@2", "a/b".to_owned()))
        );
        let path: Path = "/fragment@2/__overlay__".parse().unwrap();
        assert_eq!(extract_fragment_and_subpath(&path), None);
        let path: Path = "/fragment@2/other/a".parse().unwrap();
        assert_eq!(extract_fragment_and_subpath(&path), None);
    }
}
