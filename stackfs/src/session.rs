use std::{fs, sync::Arc};

use crate::{
    config::StackConfig,
    fs::{OverlayDriver, ProcMountProbe, SharedProbe, SystemRunner},
    image::ImageEngine,
    kernel::MountStrategy,
    manifest::{JsonCodec, ManifestStore, SessionLock},
    point::StackpointEngine,
    Result,
};

/// One mutating session: lock, manifest and engines, threaded together.
///
/// The lock is taken before the manifest loads and held until the session
/// is dropped; [Session::commit] flushes the manifest first, so the scope
/// is always lock, load, mutate, flush, release. A session that is dropped
/// without committing leaves the on-disk manifest untouched.
pub struct Session {
    _lock: SessionLock,
    pub store: ManifestStore,
    pub images: ImageEngine,
    pub points: StackpointEngine,
}

impl Session {
    /// Acquires the session lock (blocking) and loads the manifest.
    ///
    /// The three data directories are created when missing, so a fresh
    /// working directory bootstraps itself.
    pub fn open(config: &StackConfig) -> Result<Self> {
        let lock = SessionLock::acquire(&config.lock_path)?;

        for dir in [&config.images_dir, &config.mounts_dir, &config.metadata_dir] {
            fs::create_dir_all(dir)?;
        }

        let store = ManifestStore::load(&config.metadata_dir, Box::new(JsonCodec))?;
        let strategy = match config.legacy {
            Some(true) => MountStrategy::Legacy,
            Some(false) => MountStrategy::Standard,
            None => MountStrategy::detect()?,
        };

        let driver = Arc::new(OverlayDriver::new(Box::new(SystemRunner)));
        let probe: SharedProbe = Arc::new(ProcMountProbe);
        let images = ImageEngine::new(&config.images_dir, strategy, driver.clone(), probe.clone())?;
        let points = StackpointEngine::new(&config.mounts_dir, driver, probe)?;

        Ok(Self {
            _lock: lock,
            store,
            images,
            points,
        })
    }

    /// Flushes the manifest. The lock is released when the session drops.
    pub fn commit(self) -> Result<()> {
        self.store.flush()
    }
}

#[cfg(test)]
mod test {
    use test_log::test;

    use super::Session;
    use crate::{config::StackConfig, test::TestDir};

    fn test_config(testdir: &TestDir) -> StackConfig {
        let mut config = StackConfig::default();
        config.images_dir = testdir.path().join("images");
        config.mounts_dir = testdir.path().join("mounts");
        config.metadata_dir = testdir.path().join("metadata");
        config.lock_path = testdir.path().join("stacksDb.lock");
        config.legacy = Some(false);
        config
    }

    #[test]
    fn test_session_bootstrap() {
        let testdir = TestDir::new();
        let config = test_config(&testdir);
        let session = Session::open(&config).unwrap();
        assert!(testdir.path().join("images").is_dir());
        assert!(testdir.path().join("mounts").is_dir());
        assert!(testdir.path().join("metadata").is_dir());
        assert!(session.store.manifest().images.is_empty());
        session.commit().unwrap();
        assert!(testdir.path().join("metadata/images.json").is_file());
    }

    #[test]
    fn test_session_persists() {
        let testdir = TestDir::new();
        let config = test_config(&testdir);

        let mut session = Session::open(&config).unwrap();
        session
            .images
            .new_image(session.store.manifest_mut(), "base", None)
            .unwrap();
        session.commit().unwrap();

        let session = Session::open(&config).unwrap();
        assert!(session.store.manifest().image("base").is_ok());
    }

    #[test]
    fn test_session_abort_leaves_manifest() {
        let testdir = TestDir::new();
        let config = test_config(&testdir);

        let mut session = Session::open(&config).unwrap();
        session
            .images
            .new_image(session.store.manifest_mut(), "base", None)
            .unwrap();
        session.commit().unwrap();

        // a session dropped without committing discards its mutations
        let mut session = Session::open(&config).unwrap();
        session
            .images
            .new_image(session.store.manifest_mut(), "app", Some("base"))
            .unwrap();
        drop(session);

        let mut session = Session::open(&config).unwrap();
        assert!(session.store.manifest().image("app").is_err());
        // ... and the next session notices the leftover directory
        assert!(matches!(
            session
                .images
                .new_image(session.store.manifest_mut(), "app", Some("base")),
            Err(crate::Error::LayoutMismatch(_))
        ));
    }
}
