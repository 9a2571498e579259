//! Stackfs manages a catalog of layered filesystem images and named
//! stackpoints that mount those images as unioned, possibly-writable views
//! using the kernel's `overlay` filesystem.
//!
//! Images inherit from a single parent and may host multiple named
//! instances (per-stackpoint writable upper layers). A stackpoint binds
//! one currently-selected image instance at a stable public mount path
//! while retaining a history of prior images for rollback.

pub mod config;
pub mod fs;
pub mod image;
pub mod instance;
pub mod kernel;
pub mod manifest;
pub mod point;
pub mod session;

pub use config::StackConfig;
pub use image::ImageEngine;
pub use instance::InstanceId;
pub use kernel::MountStrategy;
pub use manifest::{Image, JsonCodec, Manifest, ManifestCodec, ManifestStore, SessionLock, Stackpoint};
pub use point::StackpointEngine;
pub use session::Session;

pub type Result<T> = std::result::Result<T, Error>;

/// An error produced by stackfs.
#[non_exhaustive]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("corrupt manifest: {0}")]
    CorruptManifest(#[from] serde_json::Error),
    #[error("unable to parse mountinfo file: {0}")]
    MountInfoParseError(#[from] libmount::mountinfo::ParseError),
    #[error("invalid TOML: {0}")]
    InvalidToml(#[from] toml::de::Error),
    #[error("unable to serialize into TOML: {0}")]
    TomlSerializerError(#[from] toml::ser::Error),
    #[error(transparent)]
    SyscallError(#[from] nix::Error),

    #[error("image name already exists: {0}")]
    DuplicateImage(String),
    #[error("image does not exist: {0}")]
    UnknownImage(String),
    #[error("image instance already exists: image={image} instance={instance}")]
    DuplicateInstance { image: String, instance: String },
    #[error("image instance does not exist: image={image} instance={instance}")]
    UnknownInstance { image: String, instance: String },
    #[error("cannot modify the internal instance: .self")]
    ReservedInstance,
    #[error("image is supporting other images: {0}")]
    HasChildren(String),
    #[error("cannot delete an image that supports other instances: {0}")]
    HasInstances(String),
    #[error("cannot unmount an image that supports other mounted images: {0}")]
    ChildrenMounted(String),
    #[error("image is supporting mounted instances: {0}")]
    InstancesMounted(String),
    #[error("cannot delete a mounted instance: image={image} instance={instance}")]
    InstanceMounted { image: String, instance: String },
    #[error("image is being edited, close it before deleting: {0}")]
    EditingActive(String),
    #[error("manifest mismatch: {0}")]
    LayoutMismatch(String),
    #[error("image depth {0} exceeds kernel maximum filesystem stacking depth (2)")]
    DepthExceeded(usize),

    #[error("point already exists: {0}")]
    DuplicatePoint(String),
    #[error("point does not exist: {0}")]
    UnknownPoint(String),
    #[error("point instance does not exist: point={point} image={image}")]
    UnknownPointInstance { point: String, image: String },
    #[error("cannot delete the point's current instance, cut over to another instance before deleting: point={point} image={image}")]
    CurrentInstance { point: String, image: String },

    #[error("mount operation failed: `{command}`: {stderr}")]
    MountOperationFailed { command: String, stderr: String },
    #[error("unrecognized kernel release: {0}")]
    UnrecognizedKernelRelease(String),
    #[error("this platform is not supported")]
    UnsupportedPlatform,
}

#[cfg(test)]
pub(crate) mod test {
    use std::{
        collections::HashSet,
        ffi::OsString,
        path::{Path, PathBuf},
        sync::{Arc, Mutex},
    };

    use tempfile::TempDir;

    use crate::{
        fs::{ExecOutput, ExecRunner, MountProbe, OverlayDriver, SharedProbe},
        Result,
    };

    #[derive(Debug)]
    pub struct TestDir(TempDir);

    impl TestDir {
        pub fn new() -> Self {
            let dir = TempDir::with_prefix("stackfs-").unwrap();
            println!("test data: {:?}", dir.path());
            Self(dir)
        }

        pub fn path(&self) -> &Path {
            self.0.path()
        }
    }

    #[derive(Debug, Default)]
    struct MountTable {
        mounted: HashSet<PathBuf>,
        commands: Vec<Vec<String>>,
    }

    /// A mount table double serving as both the [ExecRunner] and the
    /// [MountProbe]: every `mount` invocation marks its target mounted,
    /// every `umount` clears it, and the full argv log is kept for
    /// composition assertions.
    #[derive(Clone, Debug, Default)]
    pub struct FakeMounts(Arc<Mutex<MountTable>>);

    impl FakeMounts {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn probe(&self) -> SharedProbe {
            Arc::new(self.clone())
        }

        pub fn driver(&self) -> Arc<OverlayDriver> {
            Arc::new(OverlayDriver::new(Box::new(self.clone())))
        }

        pub fn commands(&self) -> Vec<Vec<String>> {
            self.0.lock().unwrap().commands.clone()
        }

        pub fn command_count(&self) -> usize {
            self.0.lock().unwrap().commands.len()
        }

        pub fn is_mounted(&self, target: &Path) -> bool {
            self.0.lock().unwrap().mounted.contains(target)
        }

        pub fn insert_mounted<P: AsRef<Path>>(&self, target: P) {
            self.0
                .lock()
                .unwrap()
                .mounted
                .insert(target.as_ref().to_owned());
        }
    }

    impl MountProbe for FakeMounts {
        fn is_mounted(&self, target: &Path) -> Result<bool> {
            Ok(self.0.lock().unwrap().mounted.contains(target))
        }
    }

    impl ExecRunner for FakeMounts {
        fn run(&self, program: &str, args: &[OsString]) -> Result<ExecOutput> {
            let mut table = self.0.lock().unwrap();
            let argv: Vec<String> = std::iter::once(program.to_string())
                .chain(args.iter().map(|a| a.to_string_lossy().into_owned()))
                .collect();
            match program {
                "mount" => {
                    let target = PathBuf::from(argv.last().unwrap());
                    table.mounted.insert(target);
                }
                "umount" => {
                    let target = PathBuf::from(argv.last().unwrap());
                    table.mounted.remove(&target);
                }
                _ => {}
            }
            table.commands.push(argv);
            Ok(ExecOutput {
                code: Some(0),
                stderr: String::new(),
            })
        }
    }
}
