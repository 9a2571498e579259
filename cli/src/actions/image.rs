use anyhow::Result;
use clap::ArgMatches;
use log::info;
use stackfs::{Manifest, Session};

pub fn new_image(session: &mut Session, args: &ArgMatches) -> Result<()> {
    let name = args.get_one::<String>("NAME").unwrap();
    let parent = args.get_one::<String>("PARENT");
    session.images.new_image(
        session.store.manifest_mut(),
        name,
        parent.map(|p| p.as_str()),
    )?;
    info!(
        "Added image: name={} parent={}",
        name,
        parent.map_or("none", |p| p.as_str())
    );
    Ok(())
}

pub fn delete_image(session: &mut Session, args: &ArgMatches) -> Result<()> {
    let name = args.get_one::<String>("NAME").unwrap();
    session.images.delete_image(session.store.manifest_mut(), name)?;
    info!("Deleted image: name={}", name);
    Ok(())
}

pub fn edit_image(session: &mut Session, args: &ArgMatches) -> Result<()> {
    let name = args.get_one::<String>("NAME").unwrap();
    let writable = !args.get_flag("read-only");
    let mount = session
        .images
        .mount_image(session.store.manifest(), name, writable)?;
    info!("Mounted image: name={} read-only={}", name, !writable);
    println!("mount-point={}", mount.display());
    Ok(())
}

pub fn close_image(session: &mut Session, args: &ArgMatches) -> Result<()> {
    let name = args.get_one::<String>("NAME").unwrap();
    session.images.umount_image(session.store.manifest(), name)?;
    info!("Umounted image: name={}", name);
    Ok(())
}

pub fn list_images(session: &mut Session, args: &ArgMatches) -> Result<()> {
    let manifest = session.store.manifest();
    if args.get_flag("tree") {
        for root in manifest.images.values().filter(|i| i.parent.is_none()) {
            println!("{}", root.name);
            let children = manifest.child_images(&root.name);
            for (idx, child) in children.iter().enumerate() {
                print_subtree(manifest, &child.name, "", idx == children.len() - 1);
            }
            println!();
        }
    } else {
        use std::io::Write;
        use tabwriter::TabWriter;

        let mut formatter = TabWriter::new(std::io::stdout());
        writeln!(&mut formatter, "NAME\tPARENT\tINSTANCES")?;
        for image in manifest.images.values() {
            writeln!(
                &mut formatter,
                "{}\t{}\t{}",
                image.name,
                image.parent.as_deref().unwrap_or("-"),
                image.instances.len()
            )?;
        }
        formatter.flush()?;
    }
    Ok(())
}

fn print_subtree(manifest: &Manifest, name: &str, padding: &str, is_last: bool) {
    if is_last {
        println!("{}└── {}", padding, name);
    } else {
        println!("{}├── {}", padding, name);
    }

    let child_padding = format!("{}{}", padding, if is_last { "    " } else { "│   " });
    let children = manifest.child_images(name);
    for (idx, child) in children.iter().enumerate() {
        print_subtree(
            manifest,
            &child.name,
            &child_padding,
            idx == children.len() - 1,
        );
    }
}

pub fn list_instances(session: &mut Session, args: &ArgMatches) -> Result<()> {
    let manifest = session.store.manifest();
    match args.get_one::<String>("IMAGE") {
        Some(name) => show_instances(manifest, name)?,
        None => {
            for name in manifest.images.keys() {
                show_instances(manifest, name)?;
            }
        }
    }
    Ok(())
}

fn show_instances(manifest: &Manifest, name: &str) -> Result<()> {
    let image = manifest.image(name)?;
    println!("{}:", name);
    for (idx, instance) in image.instances.iter().enumerate() {
        if idx == image.instances.len() - 1 {
            println!(" └── {}", instance);
        } else {
            println!(" ├── {}", instance);
        }
    }
    if image.instances.is_empty() {
        println!("    <no instances>");
    }
    Ok(())
}
