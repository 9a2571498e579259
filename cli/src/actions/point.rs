use anyhow::Result;
use clap::ArgMatches;
use log::info;
use stackfs::{Manifest, Session};

fn point_image_args(args: &ArgMatches) -> (&String, &String) {
    (
        args.get_one::<String>("POINT").unwrap(),
        args.get_one::<String>("IMAGE").unwrap(),
    )
}

pub fn new_stackpoint(session: &mut Session, args: &ArgMatches) -> Result<()> {
    let (point, image) = point_image_args(args);
    session
        .points
        .new_point(session.store.manifest_mut(), &session.images, point, image)?;
    info!("Created point: point={} image={}", point, image);
    Ok(())
}

pub fn new_stackpoint_instance(session: &mut Session, args: &ArgMatches) -> Result<()> {
    let (point, image) = point_image_args(args);
    session
        .points
        .new_instance(session.store.manifest_mut(), &session.images, point, image)?;
    info!("Created point instance: point={} image={}", point, image);
    Ok(())
}

pub fn set_stackpoint_instance(session: &mut Session, args: &ArgMatches) -> Result<()> {
    let (point, image) = point_image_args(args);
    session
        .points
        .set_instance(session.store.manifest_mut(), point, image)?;
    info!("Set point instance: point={} image={}", point, image);
    Ok(())
}

pub fn delete_stackpoint_instance(session: &mut Session, args: &ArgMatches) -> Result<()> {
    let (point, image) = point_image_args(args);
    session
        .points
        .delete_instance(session.store.manifest_mut(), &session.images, point, image)?;
    info!("Deleted point instance: point={} image={}", point, image);
    Ok(())
}

pub fn mount_stackpoint(session: &mut Session, args: &ArgMatches) -> Result<()> {
    let point = args.get_one::<String>("POINT").unwrap();
    let mount = session
        .points
        .mount(session.store.manifest(), &session.images, point)?;
    info!("Mounted stackpoint: name={}", point);
    println!("mount-point={}", mount.display());
    Ok(())
}

pub fn umount_stackpoint(session: &mut Session, args: &ArgMatches) -> Result<()> {
    let point = args.get_one::<String>("POINT").unwrap();
    session
        .points
        .umount(session.store.manifest(), &session.images, point)?;
    info!("Umounted stackpoint: name={}", point);
    Ok(())
}

pub fn list_stackpoints(session: &mut Session, args: &ArgMatches) -> Result<()> {
    let manifest = session.store.manifest();
    match args.get_one::<String>("POINT") {
        Some(name) => show_point(manifest, name)?,
        None => {
            for name in manifest.points.keys() {
                show_point(manifest, name)?;
            }
        }
    }
    Ok(())
}

fn show_point(manifest: &Manifest, name: &str) -> Result<()> {
    let point = manifest.point(name)?;
    println!("{}:", name);
    let holders = manifest.images_with_instance(name);
    for (idx, image) in holders.iter().enumerate() {
        let status = if point.current_image == image.name {
            " <--- current"
        } else {
            ""
        };
        if idx == holders.len() - 1 {
            println!(" └── {}{}", image.name, status);
        } else {
            println!(" ├── {}{}", image.name, status);
        }
    }
    if holders.is_empty() {
        println!("    <no instances>");
    }
    Ok(())
}
