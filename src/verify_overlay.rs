// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::path::PathBuf;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use argh::FromArgs;
use log::error;
use ufdt::verify_overlay_blob;
use ufdt_tools::init_logging;
use ufdt_tools::read_file;

#[derive(FromArgs)]
/// Check that a device tree blob is the result of applying an overlay.
struct Args {
    /// merged device tree blob
    #[argh(positional, arg_name = "FINAL_FILE")]
    final_file: PathBuf,

    /// overlay blob
    #[argh(positional, arg_name = "OVERLAY_FILE")]
    overlay: PathBuf,
}

fn run(args: Args) -> Result<()> {
    let final_blob = read_file(&args.final_file)?;
    let overlay = read_file(&args.overlay)?;
    let report = verify_overlay_blob(&final_blob, &overlay).context("failed to verify overlay")?;
    let mut failed = 0;
    for failure in report.failures() {
        eprintln!("{}: {}", failure.fragment, failure.result);
        failed += 1;
    }
    if failed > 0 {
        bail!(
            "{} of {} fragments do not match {}",
            failed,
            report.fragments.len(),
            args.final_file.display()
        );
    }
    Ok(())
}

fn main() {
    init_logging();
    let args: Args = argh::from_env();
    if let Err(e) = run(args) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}
