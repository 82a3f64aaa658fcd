// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fs;
use std::fs::File;
use std::io;
use std::io::BufWriter;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use argh::CommandInfo;
use argh::EarlyExit;
use argh::FromArgs;
use argh::SubCommand;
use dt_table::DtTable;
use dt_table::ImageConfig;
use log::error;
use log::info;
use ufdt_tools::init_logging;
use ufdt_tools::read_file;
use ufdt_tools::write_file;

const CREATE_CMD_NAME: &str = "create";
const CREATE_USAGE: &str = "\
Usage: mkdtimg create <image_file> [global_options] {<dtb_file> [entry_options]}...

Create a DT table image from dtb files.

Global options apply to every entry that does not override them. Entry options
follow the dtb they apply to:
  --page_size=<number>   page size written to the header (global only)
  --id=<value>           entry id
  --rev=<value>          entry revision
  --custom0..3=<value>   custom words

A value is a number (0x prefix for hex, 0 prefix for octal) or
/path/to/node:property to use the first cell of a property in the entry's dtb.";

/// Create a DT table image from dtb files
struct CreateCommand {
    image: PathBuf,
    config: ImageConfig,
}

impl FromArgs for CreateCommand {
    fn from_args(cmd_name: &[&str], args: &[&str]) -> std::result::Result<Self, EarlyExit> {
        if args.iter().any(|&arg| arg == "--help" || arg == "-h") {
            return Err(EarlyExit {
                output: CREATE_USAGE.to_owned(),
                status: Ok(()),
            });
        }
        let usage_error = |msg: String| EarlyExit {
            output: format!("{}\n\n{}", msg, CREATE_USAGE),
            status: Err(()),
        };
        let (image, rest) = match args.split_first() {
            Some((image, rest)) if !image.starts_with('-') => (image, rest),
            _ => {
                return Err(usage_error(format!(
                    "{}: missing image file",
                    cmd_name.join(" ")
                )))
            }
        };
        let config = ImageConfig::from_args(rest).map_err(|e| usage_error(e.to_string()))?;
        Ok(CreateCommand {
            image: PathBuf::from(image),
            config,
        })
    }
}

impl SubCommand for CreateCommand {
    const COMMAND: &'static CommandInfo = &CommandInfo {
        name: CREATE_CMD_NAME,
        description: "Create a DT table image from dtb files",
    };
}

#[derive(FromArgs)]
#[argh(subcommand, name = "cfg_create")]
/// Create a DT table image described by a config file
struct CfgCreateCommand {
    /// directory holding the dtb files named by the config file
    #[argh(option, arg_name = "DIR")]
    dtb_dir: Option<PathBuf>,

    /// image to create
    #[argh(positional, arg_name = "IMAGE_FILE")]
    image: PathBuf,

    /// config file
    #[argh(positional, arg_name = "CONFIG_FILE")]
    config: PathBuf,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "dump")]
/// Print the header and entries of a DT table image
struct DumpCommand {
    /// write each entry's blob to <DIR>/dt.<index>
    #[argh(option, arg_name = "DIR")]
    output_dir: Option<PathBuf>,

    /// image to dump
    #[argh(positional, arg_name = "IMAGE_FILE")]
    image: PathBuf,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Command {
    Create(CreateCommand),
    CfgCreate(CfgCreateCommand),
    Dump(DumpCommand),
}

#[derive(FromArgs)]
/// Create and inspect DT table images.
struct Args {
    #[argh(subcommand)]
    command: Command,
}

fn write_image(image: &Path, config: &ImageConfig) -> Result<()> {
    // Read every dtb before the image file is created.
    let mut data = Vec::new();
    let header = config
        .write_image(&mut data)
        .with_context(|| format!("failed to create {}", image.display()))?;
    write_file(image, &data)?;
    info!(
        "{}: {} entries, {} bytes",
        image.display(),
        header.dt_entry_count,
        header.total_size
    );
    Ok(())
}

fn create(cmd: CreateCommand) -> Result<()> {
    write_image(&cmd.image, &cmd.config)
}

fn cfg_create(cmd: CfgCreateCommand) -> Result<()> {
    let text = fs::read_to_string(&cmd.config)
        .with_context(|| format!("failed to read {}", cmd.config.display()))?;
    let config = ImageConfig::from_cfg(&text, cmd.dtb_dir.as_deref())
        .with_context(|| format!("invalid config file {}", cmd.config.display()))?;
    write_image(&cmd.image, &config)
}

fn dump(cmd: DumpCommand) -> Result<()> {
    let image = read_file(&cmd.image)?;
    let table = DtTable::parse(&image)
        .with_context(|| format!("invalid image {}", cmd.image.display()))?;

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    table.dump(&mut out).context("failed to print image")?;
    out.flush().context("failed to print image")?;

    if let Some(dir) = cmd.output_dir {
        for index in 0..table.entries().len() {
            let blob = table.blob(index)?;
            let path = dir.join(format!("dt.{}", index));
            let mut file = File::create(&path)
                .with_context(|| format!("failed to create {}", path.display()))?;
            file.write_all(blob)
                .with_context(|| format!("failed to write {}", path.display()))?;
        }
    }
    Ok(())
}

fn main() {
    init_logging();
    let args: Args = argh::from_env();
    let ret = match args.command {
        Command::Create(cmd) => create(cmd),
        Command::CfgCreate(cmd) => cfg_create(cmd),
        Command::Dump(cmd) => dump(cmd),
    };
    if let Err(e) = ret {
        error!("{:#}", e);
        std::process::exit(1);
    }
}
