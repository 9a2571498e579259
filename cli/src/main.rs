use std::process::exit;

use anyhow::{Context, Result};
use clap::ArgMatches;
use log::error;
use nix::unistd::geteuid;
use stackfs::{Session, StackConfig};

mod actions;
mod cli;
mod logger;

/// Commands that touch mounts and therefore require root.
const MOUNT_COMMANDS: &[&str] = &[
    "edit-image",
    "close-image",
    "mount-stackpoint",
    "umount-stackpoint",
];

type Handler = fn(&mut Session, &ArgMatches) -> Result<()>;

fn handler(command: &str) -> Option<Handler> {
    Some(match command {
        "new-image" => actions::new_image,
        "delete-image" => actions::delete_image,
        "edit-image" => actions::edit_image,
        "close-image" => actions::close_image,
        "list-images" => actions::list_images,
        "list-instances" => actions::list_instances,
        "new-stackpoint" => actions::new_stackpoint,
        "new-stackpoint-instance" => actions::new_stackpoint_instance,
        "set-stackpoint-instance" => actions::set_stackpoint_instance,
        "delete-stackpoint-instance" => actions::delete_stackpoint_instance,
        "mount-stackpoint" => actions::mount_stackpoint,
        "umount-stackpoint" => actions::umount_stackpoint,
        "list-stackpoints" => actions::list_stackpoints,
        _ => return None,
    })
}

fn main() -> Result<()> {
    if std::env::consts::OS != "linux" {
        eprintln!("Error: {}", stackfs::Error::UnsupportedPlatform);
        exit(1);
    }

    let cli = cli::build_cli();
    let mut usage = cli.clone();
    let version_string = cli.render_version();
    let args = cli.get_matches();

    if !args.get_flag("quiet") {
        logger::init()?;
    }

    let subcommand = args.subcommand();
    if let Some(("version", _)) = subcommand {
        println!("{}", version_string);
        return Ok(());
    }

    let Some((command, sub_args)) = subcommand else {
        usage.print_help()?;
        exit(1);
    };

    let work_dir = args.get_one::<String>("work-dir").unwrap();
    std::env::set_current_dir(work_dir).context("Error entering the working directory")?;

    let Some(handler) = handler(command) else {
        error!("unknown command: `{}`.", command);
        usage.print_help()?;
        exit(1);
    };

    if MOUNT_COMMANDS.contains(&command) && !geteuid().is_root() {
        println!("You need to have root privileges to mount images and stackpoints.");
        exit(1);
    }

    if let Err(err) = run(handler, sub_args) {
        error!("{:#}", err);
        exit(1);
    }
    Ok(())
}

/// One locked session: load, mutate, flush.
fn run(handler: Handler, args: &ArgMatches) -> Result<()> {
    let config = StackConfig::load_or_default(StackConfig::PATH)?;
    let mut session = Session::open(&config)?;
    handler(&mut session, args)?;
    session.commit()?;
    Ok(())
}
