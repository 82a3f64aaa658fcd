// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fs;
use std::path::Path;

use tempfile::tempdir;
use ufdt::apply_overlay;
use ufdt::apply_overlay_blob;
use ufdt::verify_overlay_blob;
use ufdt::Error;
use ufdt::NodeId;
use ufdt::Ufdt;
use ufdt::VerifyResult;

fn add_node(tree: &mut Ufdt, parent: NodeId, name: &str) -> NodeId {
    let node = tree.construct_subnode(name);
    tree.add_child(parent, node).unwrap();
    node
}

// / {
//     model = "test board";
//     panel { phandle = <0x05>; status = "disabled"; compatible = "acme,panel"; };
//     soc { phandle = <0x01>; i2c@0 { phandle = <0x02>; }; };
//     aliases { i2c0 = "/soc/i2c@0"; };
//     __symbols__ { panel = "/panel"; soc = "/soc"; };
// };
fn base_tree() -> Ufdt {
    let mut base = Ufdt::new();
    let root = base.root();
    base.set_prop(root, "model", "test board").unwrap();
    let panel = add_node(&mut base, root, "panel");
    base.set_prop(panel, "phandle", 5u32).unwrap();
    base.set_prop(panel, "status", "disabled").unwrap();
    base.set_prop(panel, "compatible", "acme,panel").unwrap();
    let soc = add_node(&mut base, root, "soc");
    base.set_prop(soc, "phandle", 1u32).unwrap();
    let i2c = add_node(&mut base, soc, "i2c@0");
    base.set_prop(i2c, "phandle", 2u32).unwrap();
    let aliases = add_node(&mut base, root, "aliases");
    base.set_prop(aliases, "i2c0", "/soc/i2c@0").unwrap();
    let symbols = add_node(&mut base, root, "__symbols__");
    base.set_prop(symbols, "panel", "/panel").unwrap();
    base.set_prop(symbols, "soc", "/soc").unwrap();
    base
}

// fragment@0 { target = <0x05>; __overlay__ { status = "okay"; brightness = <100>; }; };
fn panel_overlay() -> Ufdt {
    let mut overlay = Ufdt::new();
    let root = overlay.root();
    let fragment = add_node(&mut overlay, root, "fragment@0");
    overlay.set_prop(fragment, "target", 5u32).unwrap();
    let content = add_node(&mut overlay, fragment, "__overlay__");
    overlay.set_prop(content, "status", "okay").unwrap();
    overlay.set_prop(content, "brightness", 100u32).unwrap();
    overlay
}

// An overlay as emitted by dtc -@ for:
//
// &panel { backlight = <&bl>; };
// &{i2c0} { bl: backlight@2c { reg = <0x2c>; }; };
// &soc { status = "okay"; };
fn board_overlay() -> Ufdt {
    let mut overlay = Ufdt::new();
    let root = overlay.root();

    let f0 = add_node(&mut overlay, root, "fragment@0");
    overlay.set_prop(f0, "target", 0xffffffffu32).unwrap();
    let c0 = add_node(&mut overlay, f0, "__overlay__");
    overlay.set_prop(c0, "backlight", 1u32).unwrap();

    let f1 = add_node(&mut overlay, root, "fragment@1");
    overlay.set_prop(f1, "target-path", "i2c0").unwrap();
    let c1 = add_node(&mut overlay, f1, "__overlay__");
    let bl = add_node(&mut overlay, c1, "backlight@2c");
    overlay.set_prop(bl, "reg", 0x2cu32).unwrap();
    overlay.set_prop(bl, "phandle", 1u32).unwrap();

    let f2 = add_node(&mut overlay, root, "fragment@2");
    overlay.set_prop(f2, "target", 0xffffffffu32).unwrap();
    let c2 = add_node(&mut overlay, f2, "__overlay__");
    overlay.set_prop(c2, "status", "okay").unwrap();

    let symbols = add_node(&mut overlay, root, "__symbols__");
    overlay
        .set_prop(symbols, "bl", "/fragment@1/__overlay__/backlight@2c")
        .unwrap();

    let fixups = add_node(&mut overlay, root, "__fixups__");
    overlay
        .set_prop(fixups, "panel", "/fragment@0:target:0")
        .unwrap();
    overlay
        .set_prop(fixups, "soc", "/fragment@2:target:0")
        .unwrap();

    let local_fixups = add_node(&mut overlay, root, "__local_fixups__");
    let l0 = add_node(&mut overlay, local_fixups, "fragment@0");
    let l0_content = add_node(&mut overlay, l0, "__overlay__");
    overlay.set_prop(l0_content, "backlight", 0u32).unwrap();

    overlay
}

fn write_blob(dir: &Path, name: &str, tree: &Ufdt) -> std::path::PathBuf {
    let path = dir.join(name);
    fs::write(&path, tree.to_blob().unwrap()).unwrap();
    path
}

#[test]
fn panel_scenario() {
    let dir = tempdir().unwrap();
    let base_path = write_blob(dir.path(), "base.dtb", &base_tree());
    let overlay_path = write_blob(dir.path(), "overlay.dtbo", &panel_overlay());

    let base = fs::read(&base_path).unwrap();
    let overlay = fs::read(&overlay_path).unwrap();
    let merged = apply_overlay_blob(&base, &overlay).unwrap();
    let out_path = dir.path().join("merged.dtb");
    fs::write(&out_path, &merged).unwrap();

    let tree = Ufdt::from_blob(&fs::read(&out_path).unwrap()).unwrap();
    let panel = tree.get_node("/panel").unwrap();
    assert_eq!(tree.get_prop::<String>(panel, "status").unwrap(), "okay");
    assert_eq!(tree.get_prop::<u32>(panel, "brightness"), Some(100));
    assert_eq!(
        tree.get_prop::<String>(panel, "compatible").unwrap(),
        "acme,panel"
    );
    assert_eq!(tree.get_phandle(panel), 5);

    let report = verify_overlay_blob(&merged, &overlay).unwrap();
    assert!(report.is_ok());
    assert_eq!(report.fragments[0].result, VerifyResult::Ok);
}

#[test]
fn board_overlay_applies_and_verifies() {
    let base = base_tree().to_blob().unwrap();
    let overlay = board_overlay().to_blob().unwrap();
    let merged = apply_overlay_blob(&base, &overlay).unwrap();
    let tree = Ufdt::from_blob(&merged).unwrap();

    // The overlay node is renumbered above the base maximum of 5 and the reference follows it.
    let bl = tree.get_node("/soc/i2c@0/backlight@2c").unwrap();
    assert_eq!(tree.get_phandle(bl), 6);
    let panel = tree.get_node("/panel").unwrap();
    assert_eq!(tree.get_prop::<u32>(panel, "backlight"), Some(6));
    assert_eq!(tree.get_node_by_phandle(6), Some(bl));

    let soc = tree.get_node("/soc").unwrap();
    assert_eq!(tree.get_prop::<String>(soc, "status").unwrap(), "okay");

    let symbols = tree.get_node("/__symbols__").unwrap();
    assert_eq!(
        tree.get_prop::<String>(symbols, "bl").unwrap(),
        "/soc/i2c@0/backlight@2c"
    );
    assert_eq!(tree.get_prop::<String>(symbols, "panel").unwrap(), "/panel");

    let report = verify_overlay_blob(&merged, &overlay).unwrap();
    for fragment in &report.fragments {
        assert!(fragment.result.is_ok(), "{}: {}", fragment.fragment, fragment.result);
    }
    assert_eq!(
        report
            .fragments
            .iter()
            .filter(|f| f.result == VerifyResult::Ok)
            .count(),
        3
    );
}

#[test]
fn apply_is_deterministic() {
    let base = base_tree().to_blob().unwrap();
    let overlay = board_overlay().to_blob().unwrap();
    let first = apply_overlay_blob(&base, &overlay).unwrap();
    let second = apply_overlay_blob(&base, &overlay).unwrap();
    assert_eq!(first, second);
}

#[test]
fn merge_keeps_untouched_siblings() {
    let mut base = base_tree();
    apply_overlay(&mut base, board_overlay()).unwrap();
    let root = base.root();
    assert_eq!(
        base.get_prop::<String>(root, "model").unwrap(),
        "test board"
    );
    let i2c = base.get_node("i2c0").unwrap();
    assert_eq!(base.get_phandle(i2c), 2);
    assert!(base.get_node("/aliases").is_some());
}

#[test]
fn unresolved_label_is_fatal() {
    let mut base = base_tree();
    let before = base.to_blob().unwrap();

    let mut overlay = panel_overlay();
    let root = overlay.root();
    let fixups = add_node(&mut overlay, root, "__fixups__");
    overlay
        .set_prop(fixups, "missing_label", "/fragment@0:target:0")
        .unwrap();

    let err = apply_overlay(&mut base, overlay).unwrap_err();
    assert!(matches!(err, Error::UnresolvedSymbol(_)), "{}", err);
    assert_eq!(base.to_blob().unwrap(), before);
}

#[test]
fn corrupt_blobs_are_rejected() {
    let base = base_tree().to_blob().unwrap();
    let overlay = panel_overlay().to_blob().unwrap();

    assert!(matches!(
        apply_overlay_blob(&base[..base.len() - 4], &overlay),
        Err(Error::TotalSizeMismatch { .. })
    ));
    let mut bad = overlay.clone();
    bad[0] = 0xff;
    assert!(matches!(
        apply_overlay_blob(&base, &bad),
        Err(Error::BadMagic(_))
    ));
    assert!(verify_overlay_blob(&base, &bad).is_err());
}
