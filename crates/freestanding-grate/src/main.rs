//! A freestanding driver for the cage runtime and the IMFS grate, for offline
//! development.
//!
//! ## About
//!
//! Boots a runtime, spawns a grate cage and a program cage, attaches the
//! in-memory filesystem grate to the program and replays a JSON script of
//! syscalls from the program, printing one `op -> result` line per step.
//! Host files named with `--preload` (or in `PRELOADS`) are copied into the
//! filesystem first; files named with `--dump` are printed afterwards.
//!
//! To see verbose output of what is happening, set `RUST_LOG=info` before
//! executing.
//!
//! ## Authors
//!
//! The Veracruz Development Team.
//!
//! ## Licensing and copyright notice
//!
//! See the `LICENSE.md` file in the Veracruz root directory for
//! information on licensing and copyright.

mod script;

use anyhow::{anyhow, Result};
use cage_runtime::{Options, RegistrationPolicy, Runtime, StdioHost};
use clap::{value_parser, Arg, ArgAction};
use imfs::{FileSystem, UnlinkPolicy};
use imfs_grate::ImfsGrate;
use log::*;
use std::{
    io::{self, Write},
    path::PathBuf,
    str::FromStr,
    sync::Arc,
    time::Instant,
};

////////////////////////////////////////////////////////////////////////////////
// Constants.
////////////////////////////////////////////////////////////////////////////////

/// About freestanding-grate.
const ABOUT: &str = "Replays a script of syscalls from a cage whose file I/O is serviced by \
                     the in-memory filesystem grate.  This can be used to test and develop \
                     grates and syscall sequences offline.";
/// The name of the application.
const APPLICATION_NAME: &str = "freestanding-grate";
/// The authors list.
const AUTHORS: &str = "The Veracruz Development Team.  See the file `AUTHORS.markdown` in the \
                       Veracruz root directory for detailed authorship information.";
/// Application version number.
const VERSION: &str = "pre-alpha";

////////////////////////////////////////////////////////////////////////////////
// Command line options and parsing.
////////////////////////////////////////////////////////////////////////////////

/// A struct capturing all of the command line options passed to the program.
struct CommandLineOptions {
    /// Runtime options, from `--options` and then the flags below.
    options: Options,
    /// What unlink does to open files.
    unlink_policy: UnlinkPolicy,
    /// Host files copied into the filesystem before the run.
    preloads: Vec<PathBuf>,
    /// The script to replay, if any.
    script: Option<PathBuf>,
    /// Filesystem paths printed after the run.
    dumps: Vec<String>,
}

/// Parses the command line options, building a `CommandLineOptions` struct out
/// of them.
fn parse_command_line() -> Result<CommandLineOptions> {
    let matches = clap::Command::new(APPLICATION_NAME)
        .version(VERSION)
        .author(AUTHORS)
        .about(ABOUT)
        .arg(
            Arg::new("options")
                .long("options")
                .value_name("FILE")
                .help("A JSON file of runtime options.  The flags below override it."),
        )
        .arg(
            Arg::new("memory-size")
                .short('m')
                .long("memory-size")
                .value_name("BYTES")
                .help("Bytes of linear memory given to every cage.")
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new("policy")
                .long("policy")
                .value_name("last-writer-wins | reject-foreign")
                .help("What happens when a second grate registers for a taken syscall."),
        )
        .arg(
            Arg::new("unlink-policy")
                .long("unlink-policy")
                .value_name("posix | fail-if-open")
                .default_value("posix")
                .help("What unlink does to a file that is still open."),
        )
        .arg(
            Arg::new("strace")
                .long("strace")
                .help("Enable strace-like output for dispatched syscalls.")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("env")
                .long("env")
                .help("Specify an environment variable and value (VAR=VAL).")
                .value_name("VAR=VAL")
                .num_args(1)
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("arg")
                .long("arg")
                .help("A program argument of the cage.  Multiple --arg flags may be provided.")
                .value_name("ARG")
                .num_args(1)
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("preload")
                .short('p')
                .long("preload")
                .help("A host file to copy into the filesystem under its own path.")
                .value_name("FILE")
                .num_args(1)
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("script")
                .short('s')
                .long("script")
                .value_name("FILE")
                .help("The JSON script of syscalls to replay."),
        )
        .arg(
            Arg::new("dump")
                .short('d')
                .long("dump")
                .help("A filesystem path whose contents are printed after the run.")
                .value_name("PATH")
                .num_args(1)
                .action(ArgAction::Append),
        )
        .get_matches();

    info!("Parsed command line.");

    let mut options = match matches.get_one::<String>("options") {
        Some(path) => {
            let json = std::fs::read_to_string(path)?;
            Options::from_json(&json).map_err(|e| anyhow!("Malformed options in {}: {}", path, e))?
        }
        None => Options::default(),
    };

    if let Some(memory_size) = matches.get_one::<u64>("memory-size") {
        options.memory_size = *memory_size;
    }

    if let Some(policy) = matches.get_one::<String>("policy") {
        options.registration_policy = RegistrationPolicy::from_str(policy).map_err(|_| {
            anyhow!(
                "Expecting 'last-writer-wins' or 'reject-foreign' as registration policies, but found {}",
                policy
            )
        })?;
    }

    let unlink_policy = {
        let policy = matches
            .get_one::<String>("unlink-policy")
            .map_or("posix", |p| p.as_str());
        UnlinkPolicy::from_str(policy).map_err(|_| {
            anyhow!(
                "Expecting 'posix' or 'fail-if-open' as unlink policies, but found {}",
                policy
            )
        })?
    };

    options.enable_strace |= matches.get_flag("strace");

    if let Some(bindings) = matches.get_many::<String>("env") {
        for binding in bindings {
            let n = binding
                .find('=')
                .ok_or_else(|| anyhow!("Expecting VAR=VAL, but found {}", binding))?;
            options
                .environment
                .environment_variables
                .push((binding[..n].to_string(), binding[n + 1..].to_string()));
        }
    }

    if let Some(arguments) = matches.get_many::<String>("arg") {
        options
            .environment
            .program_arguments
            .extend(arguments.map(|a| a.to_string()));
    }

    let preloads = matches
        .get_many::<String>("preload")
        .map_or(Vec::new(), |p| p.map(PathBuf::from).collect::<Vec<_>>());

    let script = matches.get_one::<String>("script").map(PathBuf::from);

    let dumps = matches
        .get_many::<String>("dump")
        .map_or(Vec::new(), |p| p.map(|s| s.to_string()).collect::<Vec<_>>());

    Ok(CommandLineOptions {
        options,
        unlink_policy,
        preloads,
        script,
        dumps,
    })
}

/// Entry: reads the command line, provisions the runtime, the grate and the
/// program cage, then replays the script.
fn main() -> Result<()> {
    env_logger::init();
    let cmdline = parse_command_line()?;
    info!("Command line read successfully.");

    let runtime = Runtime::with_host(cmdline.options.clone(), Box::new(StdioHost));
    let grate = runtime.spawn_cage(None)?;
    let program = runtime.spawn_cage(None)?;
    let fs = Arc::new(FileSystem::new(cmdline.unlink_policy));
    let imfs = ImfsGrate::attach(&runtime, grate, program, Arc::clone(&fs))?;

    let preloaded = imfs.preload(&cmdline.preloads)? + imfs.preload_from_env()?;
    info!("Preloaded {} host files.", preloaded);

    for (syscall, entry) in runtime.registry().entries_for(program) {
        debug!(
            "Cage {}: syscall {} -> grate {} handler {}.",
            program, syscall, entry.grate, entry.handler
        );
    }

    if let Some(path) = &cmdline.script {
        let steps = script::parse(&std::fs::read_to_string(path)?)?;
        info!("Replaying {} steps from {}.", steps.len(), path.display());

        let main_time = Instant::now();
        let mut driver = script::Driver::new(&runtime, program);
        for step in steps.iter() {
            match driver.run(std::slice::from_ref(step)) {
                Ok(outcomes) => {
                    for outcome in outcomes {
                        println!("{}", outcome);
                    }
                }
                Err(e) => {
                    error!("Step {:?} could not be issued: {}", step, e);
                    return Err(e);
                }
            }
        }
        info!(
            "Time to replay {}: {} micro seconds",
            path.display(),
            main_time.elapsed().as_micros()
        );
    }

    for path in cmdline.dumps.iter() {
        let contents = fs
            .read_file_by_absolute_path(path)
            .map_err(|e| anyhow!("Cannot dump {}: {}", path, e))?;
        print!(
            "---- {} ----\n{}\n---- {} end ----\n",
            path,
            String::from_utf8_lossy(&contents),
            path
        );
    }
    io::stdout().flush()?;
    Ok(())
}
