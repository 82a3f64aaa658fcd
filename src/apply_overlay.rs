// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use argh::FromArgs;
use log::error;
use log::info;
use ufdt::apply_overlay;
use ufdt::Ufdt;
use ufdt_tools::init_logging;
use ufdt_tools::read_file;
use ufdt_tools::timed;
use ufdt_tools::write_file;

#[derive(FromArgs)]
/// Apply a device tree overlay to a base device tree blob.
struct Args {
    /// print the merged tree to stdout
    #[argh(switch)]
    print: bool,

    /// base device tree blob
    #[argh(positional, arg_name = "BASE_FILE")]
    base: PathBuf,

    /// overlay blob
    #[argh(positional, arg_name = "OVERLAY_FILE")]
    overlay: PathBuf,

    /// where to write the merged blob
    #[argh(positional, arg_name = "OUT_FILE")]
    out: PathBuf,
}

fn run(args: Args) -> Result<()> {
    let mut base = Ufdt::from_blob(&read_file(&args.base)?)
        .with_context(|| format!("invalid base tree {}", args.base.display()))?;
    let overlay = Ufdt::from_blob(&read_file(&args.overlay)?)
        .with_context(|| format!("invalid overlay {}", args.overlay.display()))?;

    let (ret, elapsed) = timed(|| apply_overlay(&mut base, overlay));
    ret.context("failed to apply overlay")?;
    info!("overlay applied in {:.3} ms", elapsed.as_secs_f64() * 1000.0);

    if args.print {
        print!("{}", base.dump());
    }
    let blob = base.to_blob().context("failed to serialize merged tree")?;
    write_file(&args.out, &blob)
}

fn main() {
    init_logging();
    let args: Args = argh::from_env();
    if let Err(e) = run(args) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}
