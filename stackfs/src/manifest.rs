use std::{
    collections::BTreeMap,
    fs::{self, File},
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use log::info;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// An image: a named, optionally-parented base filesystem tree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Image {
    pub name: String,
    pub parent: Option<String>,
    /// Reserved. Carried through load/flush untouched.
    #[serde(default)]
    pub version: Option<serde_json::Value>,
    /// Named instances owned by this image. The reserved `.self` instance
    /// exists on disk but is never listed here.
    #[serde(default)]
    pub instances: Vec<String>,
}

/// A stackpoint: a stable public mount name with a history of the images
/// it has been set to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Stackpoint {
    pub name: String,
    /// Ordered image names, most recently set last. No duplicates.
    pub image_history: Vec<String>,
    /// The image currently bound at the public mount path. Always a member
    /// of `image_history`.
    pub current_image: String,
}

/// The in-memory manifest: the sole source of truth about images and
/// stackpoints. The on-disk directory layout must remain consistent with it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Manifest {
    pub images: BTreeMap<String, Image>,
    pub points: BTreeMap<String, Stackpoint>,
}

impl Manifest {
    pub fn image(&self, name: &str) -> Result<&Image> {
        self.images
            .get(name)
            .ok_or_else(|| Error::UnknownImage(name.to_string()))
    }

    pub fn image_mut(&mut self, name: &str) -> Result<&mut Image> {
        self.images
            .get_mut(name)
            .ok_or_else(|| Error::UnknownImage(name.to_string()))
    }

    pub fn point(&self, name: &str) -> Result<&Stackpoint> {
        self.points
            .get(name)
            .ok_or_else(|| Error::UnknownPoint(name.to_string()))
    }

    pub fn point_mut(&mut self, name: &str) -> Result<&mut Stackpoint> {
        self.points
            .get_mut(name)
            .ok_or_else(|| Error::UnknownPoint(name.to_string()))
    }

    /// All images whose parent is `name`, in name order.
    pub fn child_images(&self, name: &str) -> Vec<&Image> {
        self.images
            .values()
            .filter(|image| image.parent.as_deref() == Some(name))
            .collect()
    }

    /// All images carrying an instance with the given name, in name order.
    pub fn images_with_instance(&self, instance: &str) -> Vec<&Image> {
        self.images
            .values()
            .filter(|image| image.instances.iter().any(|i| i == instance))
            .collect()
    }
}

/// Encodes and decodes the two manifest documents.
pub trait ManifestCodec {
    fn decode_images(&self, bytes: &[u8]) -> Result<Vec<Image>>;
    fn encode_images(&self, images: &[Image]) -> Result<Vec<u8>>;
    fn decode_points(&self, bytes: &[u8]) -> Result<Vec<Stackpoint>>;
    fn encode_points(&self, points: &[Stackpoint]) -> Result<Vec<u8>>;
}

/// The JSON manifest codec: each document is an array of records.
pub struct JsonCodec;

impl ManifestCodec for JsonCodec {
    fn decode_images(&self, bytes: &[u8]) -> Result<Vec<Image>> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn encode_images(&self, images: &[Image]) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(images)?)
    }

    fn decode_points(&self, bytes: &[u8]) -> Result<Vec<Stackpoint>> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn encode_points(&self, points: &[Stackpoint]) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(points)?)
    }
}

/// Owns the in-memory [Manifest] and its persistence.
///
/// Missing documents load as empty mappings; a document that fails to
/// decode surfaces as [Error::CorruptManifest]. Flushed documents get
/// permissive mode bits, matching the layout directories.
pub struct ManifestStore {
    dir: PathBuf,
    codec: Box<dyn ManifestCodec>,
    manifest: Manifest,
}

impl ManifestStore {
    pub const IMAGES_FILE: &str = "images.json";
    pub const POINTS_FILE: &str = "points.json";

    const FILE_MODE: u32 = 0o777;

    pub fn load<P: AsRef<Path>>(dir: P, codec: Box<dyn ManifestCodec>) -> Result<Self> {
        let dir = dir.as_ref().to_owned();
        let mut manifest = Manifest::default();

        let images_path = dir.join(Self::IMAGES_FILE);
        if images_path.exists() {
            for image in codec.decode_images(&fs::read(images_path)?)? {
                manifest.images.insert(image.name.clone(), image);
            }
        }
        let points_path = dir.join(Self::POINTS_FILE);
        if points_path.exists() {
            for point in codec.decode_points(&fs::read(points_path)?)? {
                manifest.points.insert(point.name.clone(), point);
            }
        }

        Ok(Self {
            dir,
            codec,
            manifest,
        })
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn manifest_mut(&mut self) -> &mut Manifest {
        &mut self.manifest
    }

    /// Serializes both mappings and writes them out.
    pub fn flush(&self) -> Result<()> {
        let images: Vec<Image> = self.manifest.images.values().cloned().collect();
        let points: Vec<Stackpoint> = self.manifest.points.values().cloned().collect();

        self.write_document(Self::IMAGES_FILE, &self.codec.encode_images(&images)?)?;
        self.write_document(Self::POINTS_FILE, &self.codec.encode_points(&points)?)?;
        info!("manifest: flushed to {:?}", self.dir);
        Ok(())
    }

    fn write_document(&self, filename: &str, bytes: &[u8]) -> Result<()> {
        let path = self.dir.join(filename);
        fs::write(&path, bytes)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(Self::FILE_MODE))?;
        Ok(())
    }
}

/// The cross-process session lock.
///
/// Mutating sessions are serialized by a blocking advisory lock on a fixed
/// path. Two concurrent processes holding stale in-memory manifests could
/// otherwise diverge the persisted state from the filesystem, silently
/// forking history.
pub struct SessionLock(File);

impl SessionLock {
    /// Acquires the lock, blocking until the holder releases it.
    pub fn acquire<P: AsRef<Path>>(path: P) -> Result<Self> {
        let lock = File::options()
            .read(true)
            .write(true)
            .create(true)
            .open(path.as_ref())?;
        fs3::FileExt::lock_exclusive(&lock)?;
        Ok(Self(lock))
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        fs3::FileExt::unlock(&self.0).unwrap();
    }
}

#[cfg(test)]
mod test {
    use std::{
        os::unix::fs::PermissionsExt,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        time::Duration,
    };

    use test_log::test;

    use super::{Image, JsonCodec, ManifestStore, SessionLock, Stackpoint};
    use crate::{test::TestDir, Error};

    fn sample_image(name: &str, parent: Option<&str>, instances: &[&str]) -> Image {
        Image {
            name: name.to_string(),
            parent: parent.map(|p| p.to_string()),
            version: None,
            instances: instances.iter().map(|i| i.to_string()).collect(),
        }
    }

    #[test]
    fn test_load_empty() {
        let testdir = TestDir::new();
        let store = ManifestStore::load(testdir.path(), Box::new(JsonCodec)).unwrap();
        assert!(store.manifest().images.is_empty());
        assert!(store.manifest().points.is_empty());
    }

    #[test]
    fn test_round_trip() {
        let testdir = TestDir::new();
        let mut store = ManifestStore::load(testdir.path(), Box::new(JsonCodec)).unwrap();
        let base = sample_image("base", None, &["prod"]);
        let app = sample_image("app", Some("base"), &[]);
        store
            .manifest_mut()
            .images
            .insert("base".to_string(), base);
        store.manifest_mut().images.insert("app".to_string(), app);
        store.manifest_mut().points.insert(
            "prod".to_string(),
            Stackpoint {
                name: "prod".to_string(),
                image_history: vec!["base".to_string()],
                current_image: "base".to_string(),
            },
        );
        store.flush().unwrap();

        let reloaded = ManifestStore::load(testdir.path(), Box::new(JsonCodec)).unwrap();
        assert_eq!(reloaded.manifest(), store.manifest());
    }

    #[test]
    fn test_flush_permissions() {
        let testdir = TestDir::new();
        let store = ManifestStore::load(testdir.path(), Box::new(JsonCodec)).unwrap();
        store.flush().unwrap();
        for filename in [ManifestStore::IMAGES_FILE, ManifestStore::POINTS_FILE] {
            let mode = std::fs::metadata(testdir.path().join(filename))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o777);
        }
    }

    #[test]
    fn test_corrupt_manifest() {
        let testdir = TestDir::new();
        std::fs::write(
            testdir.path().join(ManifestStore::IMAGES_FILE),
            "not valid json",
        )
        .unwrap();
        assert!(matches!(
            ManifestStore::load(testdir.path(), Box::new(JsonCodec)),
            Err(Error::CorruptManifest(_))
        ));
    }

    #[test]
    fn test_version_preserved() {
        let testdir = TestDir::new();
        std::fs::write(
            testdir.path().join(ManifestStore::IMAGES_FILE),
            r#"[{"name": "base", "parent": null, "version": "42", "instances": []}]"#,
        )
        .unwrap();
        let store = ManifestStore::load(testdir.path(), Box::new(JsonCodec)).unwrap();
        assert_eq!(
            store.manifest().image("base").unwrap().version,
            Some(serde_json::Value::String("42".to_string()))
        );
        store.flush().unwrap();

        let raw: serde_json::Value = serde_json::from_slice(
            &std::fs::read(testdir.path().join(ManifestStore::IMAGES_FILE)).unwrap(),
        )
        .unwrap();
        assert_eq!(raw[0]["version"], serde_json::json!("42"));
    }

    #[test]
    fn test_manifest_queries() {
        let testdir = TestDir::new();
        let mut store = ManifestStore::load(testdir.path(), Box::new(JsonCodec)).unwrap();
        let m = store.manifest_mut();
        m.images
            .insert("base".to_string(), sample_image("base", None, &[]));
        m.images
            .insert("app".to_string(), sample_image("app", Some("base"), &["prod"]));
        m.images
            .insert("web".to_string(), sample_image("web", Some("base"), &[]));

        let children: Vec<&str> = m.child_images("base").iter().map(|i| i.name.as_str()).collect();
        assert_eq!(children, vec!["app", "web"]);
        assert!(m.child_images("app").is_empty());

        let holders: Vec<&str> = m
            .images_with_instance("prod")
            .iter()
            .map(|i| i.name.as_str())
            .collect();
        assert_eq!(holders, vec!["app"]);

        assert!(matches!(m.image("nope"), Err(Error::UnknownImage(_))));
        assert!(matches!(m.point("nope"), Err(Error::UnknownPoint(_))));
    }

    #[test]
    fn test_session_lock_reacquire() {
        let testdir = TestDir::new();
        let path = testdir.path().join("stacksDb.lock");
        let lock = SessionLock::acquire(&path).unwrap();
        drop(lock);
        let _lock = SessionLock::acquire(&path).unwrap();
    }

    #[test]
    fn test_session_lock_serializes() {
        let testdir = TestDir::new();
        let path = testdir.path().join("stacksDb.lock");
        let lock = SessionLock::acquire(&path).unwrap();

        let acquired = Arc::new(AtomicBool::new(false));
        let acquired_in_thread = acquired.clone();
        let thread_path = path.clone();
        let handle = std::thread::spawn(move || {
            let _lock = SessionLock::acquire(&thread_path).unwrap();
            acquired_in_thread.store(true, Ordering::SeqCst);
        });

        std::thread::sleep(Duration::from_millis(200));
        assert!(!acquired.load(Ordering::SeqCst));

        drop(lock);
        handle.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }
}
