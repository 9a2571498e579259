use clap::{Arg, ArgAction, Command};

/// Build the CLI instance
pub fn build_cli() -> Command {
    Command::new("stackfs")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Create and manage OverlayFS image stacks")
        .allow_external_subcommands(true)
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .action(ArgAction::SetTrue)
                .help("Don't print logs"),
        )
        .arg(
            Arg::new("work-dir")
                .short('C')
                .long("work-dir")
                .default_value(".")
                .help("Directory holding the image, mount and metadata trees"),
        )
        .subcommand(Command::new("version").about("Display the version of stackfs"))
        .subcommand(
            Command::new("new-image")
                .about("Create an image")
                .arg(Arg::new("NAME").required(true))
                .arg(Arg::new("PARENT").required(false)),
        )
        .subcommand(
            Command::new("delete-image")
                .about("Delete an image with no children and no instances")
                .arg(Arg::new("NAME").required(true)),
        )
        .subcommand(
            Command::new("edit-image")
                .about("Mount an image for editing")
                .arg(Arg::new("NAME").required(true))
                .arg(
                    Arg::new("read-only")
                        .short('r')
                        .long("read-only")
                        .action(ArgAction::SetTrue)
                        .help("Mount the image read-only"),
                ),
        )
        .subcommand(
            Command::new("close-image")
                .about("Unmount an image to stop editing")
                .arg(Arg::new("NAME").required(true)),
        )
        .subcommand(
            Command::new("list-images")
                .about("Show the existing images")
                .arg(
                    Arg::new("tree")
                        .short('t')
                        .long("tree")
                        .action(ArgAction::SetTrue)
                        .help("Render the image inheritance tree"),
                ),
        )
        .subcommand(
            Command::new("list-instances")
                .about("Show the instances of one or all images")
                .arg(Arg::new("IMAGE").required(false)),
        )
        .subcommand(
            Command::new("new-stackpoint")
                .about("Create a stackpoint bound to an image")
                .arg(Arg::new("POINT").required(true))
                .arg(Arg::new("IMAGE").required(true)),
        )
        .subcommand(
            Command::new("new-stackpoint-instance")
                .about("Record an instance of an image for a stackpoint")
                .arg(Arg::new("POINT").required(true))
                .arg(Arg::new("IMAGE").required(true)),
        )
        .subcommand(
            Command::new("set-stackpoint-instance")
                .about("Select the image a stackpoint mounts, history untouched")
                .arg(Arg::new("POINT").required(true))
                .arg(Arg::new("IMAGE").required(true)),
        )
        .subcommand(
            Command::new("delete-stackpoint-instance")
                .about("Delete a stackpoint's instance of an image")
                .arg(Arg::new("POINT").required(true))
                .arg(Arg::new("IMAGE").required(true)),
        )
        .subcommand(
            Command::new("mount-stackpoint")
                .about("Mount the stackpoint's current image at its public path")
                .arg(Arg::new("POINT").required(true)),
        )
        .subcommand(
            Command::new("umount-stackpoint")
                .about("Unmount a stackpoint")
                .arg(Arg::new("POINT").required(true)),
        )
        .subcommand(
            Command::new("list-stackpoints")
                .about("Show one or all stackpoints")
                .arg(Arg::new("POINT").required(false)),
        )
}
