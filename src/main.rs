// SPDX-License-Identifier: AGPL-3.0-or-later
// Stdlib
use std::error::Error;
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;

// Clap
use clap::{Arg, ArgAction, Command};

// Compression
use flate2::read::GzDecoder;

// Logging
use log::info;

use puntar_lib::unpack::{SyncUnpacker, UnpackOptions, UnpackSummary, Unpacker};

fn main() -> Result<(), Box<dyn Error>> {
    // By default emit warnings
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("warn")
    ).init();

    let args = Command::new("Parallel Untar")
        .version("2.0")
        .about("Extract a tar archive with parallel, path-reserved unpacking.")
        .arg(
            Arg::new("target")
            .value_name("TARGET")
            .help("Directory to extract into (created if missing)")
            .required(false)
            .index(1)
        )
        .arg(
            Arg::new("archive_name")
            .short('f')
            .long("file")
            .help("Path of the tar archive ('-' reads from stdin)")
            .required(true)
            .num_args(1)
        )
        .arg(
            Arg::new("num_threads")
            .short('n')
            .help("Number of parallel unpack workers")
            .required(false)
            .num_args(1)
            .value_parser(clap::value_parser!(u32))
        )
        .arg(
            Arg::new("sync")
            .long("sync")
            .help("Extract sequentially on the calling thread")
            .action(ArgAction::SetTrue)
        )
        .arg(
            Arg::new("gzip")
            .short('z')
            .long("gzip")
            .help("Decompress the archive stream with gzip")
            .action(ArgAction::SetTrue)
        )
        .arg(
            Arg::new("strip")
            .long("strip")
            .help("Strip this many leading path segments from every entry")
            .num_args(1)
            .value_parser(clap::value_parser!(u32))
        )
        .arg(
            Arg::new("max_depth")
            .long("max-depth")
            .help("Reject entries deeper than this many segments (0 = unlimited)")
            .num_args(1)
            .value_parser(clap::value_parser!(u32))
        )
        .arg(
            Arg::new("preserve_paths")
            .short('P')
            .long("preserve-paths")
            .help("Keep '..' segments and absolute paths (dangerous)")
            .action(ArgAction::SetTrue)
        )
        .arg(
            Arg::new("unlink")
            .short('U')
            .long("unlink")
            .help("Unlink existing files before creating replacements")
            .action(ArgAction::SetTrue)
        )
        .arg(
            Arg::new("keep")
            .short('k')
            .long("keep")
            .help("Never overwrite existing files")
            .action(ArgAction::SetTrue)
        )
        .arg(
            Arg::new("newer")
            .long("newer")
            .help("Skip entries older than what is already on disk")
            .action(ArgAction::SetTrue)
        )
        .arg(
            Arg::new("no_mtime")
            .short('m')
            .long("no-mtime")
            .help("Do not restore modification times")
            .action(ArgAction::SetTrue)
        )
        .arg(
            Arg::new("no_chmod")
            .long("no-chmod")
            .help("Do not restore permission bits")
            .action(ArgAction::SetTrue)
        )
        .arg(
            Arg::new("force_chown")
            .long("force-chown")
            .help("Apply ownership unconditionally")
            .action(ArgAction::SetTrue)
        )
        .arg(
            Arg::new("preserve_owner")
            .short('p')
            .long("preserve-owner")
            .help("Restore archive uid/gid (default when running as root)")
            .action(ArgAction::SetTrue)
        )
        .arg(
            Arg::new("uid")
            .long("uid")
            .help("Force this owner uid on everything extracted")
            .num_args(1)
            .value_parser(clap::value_parser!(u32))
        )
        .arg(
            Arg::new("gid")
            .long("gid")
            .help("Force this owner gid on everything extracted")
            .num_args(1)
            .value_parser(clap::value_parser!(u32))
        )
        .arg(
            Arg::new("umask")
            .long("umask")
            .help("Octal umask for computing default modes")
            .num_args(1)
        )
        .arg(
            Arg::new("win32")
            .long("win32")
            .help("Apply windows path semantics on any host")
            .action(ArgAction::SetTrue)
        )
        .arg(
            Arg::new("json")
            .long("json")
            .help("Print the extraction summary as JSON")
            .action(ArgAction::SetTrue)
        )
        .arg(
            Arg::new("strict")
            .long("strict")
            .help("Exit non-zero if any warning was recorded")
            .action(ArgAction::SetTrue)
        )
        .get_matches();

    let archive_name = args
        .get_one::<String>("archive_name")
        .ok_or("Failed to get: 'archive_name'")?;

    let mut opts = UnpackOptions::default();
    if let Some(target) = args.get_one::<String>("target") {
        opts.cwd = PathBuf::from(target);
    }
    if let Some(strip) = args.get_one::<u32>("strip") {
        opts.strip = *strip as usize;
    }
    if let Some(depth) = args.get_one::<u32>("max_depth") {
        opts.max_depth = if *depth == 0 { None } else { Some(*depth as usize) };
    }
    if let Some(n) = args.get_one::<u32>("num_threads") {
        opts.workers = *n as usize;
    }
    opts.preserve_paths = args.get_flag("preserve_paths");
    opts.unlink = args.get_flag("unlink");
    opts.keep = args.get_flag("keep");
    opts.newer = args.get_flag("newer");
    opts.no_mtime = args.get_flag("no_mtime");
    opts.no_chmod = args.get_flag("no_chmod");
    opts.force_chown = args.get_flag("force_chown");
    opts.win32 = args.get_flag("win32");
    if args.get_flag("preserve_owner") {
        opts.preserve_owner = Some(true);
    }
    opts.uid = args.get_one::<u32>("uid").copied();
    opts.gid = args.get_one::<u32>("gid").copied();
    if let Some(umask) = args.get_one::<String>("umask") {
        opts.umask = Some(
            u32::from_str_radix(umask.trim_start_matches("0o"), 8)
                .map_err(|e| format!("Invalid umask '{}': {}", umask, e))?
        );
    }

    let reader: Box<dyn Read> = if archive_name == "-" {
        info!("Reading archive from stdin");
        Box::new(std::io::stdin())
    } else {
        info!("Reading archive from: '{}'", archive_name);
        Box::new(File::open(archive_name)?)
    };
    let reader: Box<dyn Read> = if args.get_flag("gzip") {
        Box::new(GzDecoder::new(reader))
    } else {
        reader
    };

    let summary: UnpackSummary = if args.get_flag("sync") {
        SyncUnpacker::new(opts)?.extract(reader)?
    } else {
        Unpacker::new(opts)?.extract(reader)?
    };

    if args.get_flag("json") {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!(
            "Extracted: {} written, {} skipped, {} errored ({} entries, {} warnings)",
            summary.entries_written,
            summary.entries_skipped,
            summary.entries_errored,
            summary.entries_seen,
            summary.warnings.len()
        );
    }

    if args.get_flag("strict") && !summary.clean() {
        return Err("extraction completed with warnings (strict mode)".into());
    }
    Ok(())
}
