use std::{
    ffi::OsString,
    fs,
    path::{self, Path, PathBuf},
    process::Command,
    sync::Arc,
};

use log::info;

use crate::{Error, Result};

/// Predicate telling whether a path is currently a mountpoint.
pub trait MountProbe {
    fn is_mounted(&self, target: &Path) -> Result<bool>;
}

pub type SharedProbe = Arc<dyn MountProbe>;

/// A [MountProbe] backed by `/proc/self/mountinfo`.
///
/// Only the mount point is matched, not the filesystem type: bind mounts
/// report the type of their source filesystem.
pub struct ProcMountProbe;

impl MountProbe for ProcMountProbe {
    fn is_mounted(&self, target: &Path) -> Result<bool> {
        let target = path::absolute(target)?;
        let mountinfo_content: Vec<u8> = fs::read("/proc/self/mountinfo")?;
        let parser = libmount::mountinfo::Parser::new(&mountinfo_content);

        for mount in parser {
            let mount = mount?;
            if mount.mount_point == target {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// The captured outcome of one external command.
#[derive(Debug)]
pub struct ExecOutput {
    /// Exit code, if the process exited normally.
    pub code: Option<i32>,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Runs an external program, capturing its status and stderr.
pub trait ExecRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<ExecOutput>;
}

/// An [ExecRunner] spawning real processes.
pub struct SystemRunner;

impl ExecRunner for SystemRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<ExecOutput> {
        let output = Command::new(program).args(args).output()?;
        Ok(ExecOutput {
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Composes and issues overlay/bind mount and unmount operations through
/// the platform `mount` and `umount` binaries.
pub struct OverlayDriver {
    runner: Box<dyn ExecRunner>,
}

impl OverlayDriver {
    pub fn new(runner: Box<dyn ExecRunner>) -> Self {
        Self { runner }
    }

    /// Mounts an overlay at `target` with the given lower stack, ordered
    /// nearest ancestor first.
    pub fn overlay_mount(
        &self,
        target: &Path,
        lower: &[PathBuf],
        upper: &Path,
        work: &Path,
        readonly: bool,
    ) -> Result<()> {
        let mut options = OsString::from("lowerdir=");
        for (i, dir) in lower.iter().enumerate() {
            if i > 0 {
                options.push(":");
            }
            options.push(dir);
        }
        options.push(",upperdir=");
        options.push(upper);
        options.push(",workdir=");
        options.push(work);
        options.push(if readonly { ",ro" } else { ",rw" });

        info!("overlay: mounting at {:?}", target);
        self.run_checked(
            "mount",
            vec![
                OsString::from("-t"),
                OsString::from("overlay"),
                OsString::from("overlay"),
                OsString::from("-o"),
                options,
                target.into(),
            ],
        )
    }

    /// Bind-mounts `src` onto `dst`.
    pub fn bind_mount(&self, src: &Path, dst: &Path, readonly: bool) -> Result<()> {
        info!("bind: mounting {:?} at {:?}", src, dst);
        self.run_checked(
            "mount",
            vec![
                OsString::from("--bind"),
                OsString::from("-o"),
                OsString::from(if readonly { "ro" } else { "rw" }),
                src.into(),
                dst.into(),
            ],
        )
    }

    pub fn unmount(&self, target: &Path) -> Result<()> {
        info!("un-mounting {:?}", target);
        self.run_checked("umount", vec![target.into()])
    }

    fn run_checked(&self, program: &str, args: Vec<OsString>) -> Result<()> {
        let output = self.runner.run(program, &args)?;
        if output.success() {
            return Ok(());
        }
        let command = std::iter::once(program.to_owned())
            .chain(args.iter().map(|a| a.to_string_lossy().into_owned()))
            .collect::<Vec<_>>()
            .join(" ");
        Err(Error::MountOperationFailed {
            command,
            stderr: output.stderr.trim().to_owned(),
        })
    }
}

#[cfg(test)]
mod test {
    use std::{ffi::OsString, path::{Path, PathBuf}};

    use test_log::test;

    use super::{ExecOutput, ExecRunner, MountProbe, OverlayDriver, ProcMountProbe};
    use crate::{
        test::{FakeMounts, TestDir},
        Error, Result,
    };

    #[test]
    fn test_overlay_mount_argv() {
        let fake = FakeMounts::new();
        let driver = fake.driver();
        driver
            .overlay_mount(
                Path::new("/stacks/mnt"),
                &[PathBuf::from("/stacks/a"), PathBuf::from("/stacks/b")],
                Path::new("/stacks/upper"),
                Path::new("/stacks/work"),
                false,
            )
            .unwrap();
        assert_eq!(
            fake.commands(),
            vec![vec![
                "mount".to_string(),
                "-t".to_string(),
                "overlay".to_string(),
                "overlay".to_string(),
                "-o".to_string(),
                "lowerdir=/stacks/a:/stacks/b,upperdir=/stacks/upper,workdir=/stacks/work,rw"
                    .to_string(),
                "/stacks/mnt".to_string(),
            ]]
        );
        assert!(fake.is_mounted(Path::new("/stacks/mnt")));
    }

    #[test]
    fn test_bind_and_unmount_argv() {
        let fake = FakeMounts::new();
        let driver = fake.driver();
        driver
            .bind_mount(Path::new("/stacks/src"), Path::new("/stacks/dst"), true)
            .unwrap();
        driver.unmount(Path::new("/stacks/dst")).unwrap();
        assert_eq!(
            fake.commands(),
            vec![
                vec![
                    "mount".to_string(),
                    "--bind".to_string(),
                    "-o".to_string(),
                    "ro".to_string(),
                    "/stacks/src".to_string(),
                    "/stacks/dst".to_string(),
                ],
                vec!["umount".to_string(), "/stacks/dst".to_string()],
            ]
        );
        assert!(!fake.is_mounted(Path::new("/stacks/dst")));
    }

    struct FailingRunner;

    impl ExecRunner for FailingRunner {
        fn run(&self, _program: &str, _args: &[OsString]) -> Result<ExecOutput> {
            Ok(ExecOutput {
                code: Some(32),
                stderr: "mount: unknown filesystem type 'overlay'\n".to_string(),
            })
        }
    }

    #[test]
    fn test_mount_failure() {
        let driver = OverlayDriver::new(Box::new(FailingRunner));
        let err = driver.unmount(Path::new("/stacks/mnt")).unwrap_err();
        match err {
            Error::MountOperationFailed { command, stderr } => {
                assert_eq!(command, "umount /stacks/mnt");
                assert_eq!(stderr, "mount: unknown filesystem type 'overlay'");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_proc_mount_probe() {
        // the root filesystem is always a mountpoint, fresh directories never are
        assert!(ProcMountProbe.is_mounted(Path::new("/")).unwrap());
        let testdir = TestDir::new();
        assert!(!ProcMountProbe.is_mounted(testdir.path()).unwrap());
    }
}
