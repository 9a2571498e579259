use std::{
    fs,
    path::{self, Path, PathBuf},
    sync::Arc,
};

use log::info;

use crate::{
    fs::{OverlayDriver, SharedProbe},
    image::ImageEngine,
    instance::InstanceId,
    manifest::{Manifest, Stackpoint},
    Error, Result,
};

/// Stackpoint lifecycle: the public mountpoints, the per-point image
/// history and the currently selected image.
///
/// Each stackpoint owns a directory under the mounts directory; mounting
/// binds the currently selected image instance there. The instances a
/// point has ever been set to are kept in its image history for rollback.
pub struct StackpointEngine {
    mounts_dir: PathBuf,
    driver: Arc<OverlayDriver>,
    probe: SharedProbe,
}

impl StackpointEngine {
    pub fn new<P: AsRef<Path>>(
        mounts_dir: P,
        driver: Arc<OverlayDriver>,
        probe: SharedProbe,
    ) -> Result<Self> {
        Ok(Self {
            mounts_dir: path::absolute(mounts_dir.as_ref())?,
            driver,
            probe,
        })
    }

    /// The public mountpoint of a stackpoint.
    pub fn point_dir(&self, point: &str) -> PathBuf {
        self.mounts_dir.join(point)
    }

    /// Creates a stackpoint bound to an image, creating an instance of the
    /// image named after the point.
    pub fn new_point(
        &self,
        m: &mut Manifest,
        images: &ImageEngine,
        point: &str,
        image: &str,
    ) -> Result<()> {
        if m.points.contains_key(point) {
            return Err(Error::DuplicatePoint(point.to_string()));
        }
        if !m.images.contains_key(image) {
            return Err(Error::UnknownImage(image.to_string()));
        }

        let instance_dir = images.instance_dir(image, &InstanceId::named(point));
        if instance_dir.exists() {
            return Err(Error::LayoutMismatch(format!(
                "instance directory already exists: {}",
                instance_dir.display()
            )));
        }
        let point_dir = self.point_dir(point);
        if point_dir.exists() {
            return Err(Error::LayoutMismatch(format!(
                "mount point already exists: {}",
                point_dir.display()
            )));
        }

        fs::create_dir(&point_dir)?;
        images.new_instance(m, image, &InstanceId::named(point), false)?;
        m.points.insert(
            point.to_string(),
            Stackpoint {
                name: point.to_string(),
                image_history: vec![image.to_string()],
                current_image: image.to_string(),
            },
        );

        info!("point {}: created on image {}", point, image);
        Ok(())
    }

    /// Selects which image instance the point mounts. The image must be in
    /// the point's history; the history itself is untouched.
    pub fn set_instance(&self, m: &mut Manifest, point: &str, image: &str) -> Result<()> {
        let point_obj = m.point_mut(point)?;
        if !point_obj.image_history.iter().any(|i| i == image) {
            return Err(Error::UnknownPointInstance {
                point: point.to_string(),
                image: image.to_string(),
            });
        }
        point_obj.current_image = image.to_string();
        info!("point {}: current image set to {}", point, image);
        Ok(())
    }

    /// Creates an instance of the image for this point (unless one already
    /// exists) and moves the image to the tail of the history. The current
    /// selection is not changed.
    pub fn new_instance(
        &self,
        m: &mut Manifest,
        images: &ImageEngine,
        point: &str,
        image: &str,
    ) -> Result<()> {
        m.point(point)?;

        let exists = m.image(image)?.instances.iter().any(|i| i == point);
        if !exists {
            images.new_instance(m, image, &InstanceId::named(point), false)?;
        }

        let point_obj = m.point_mut(point)?;
        point_obj.image_history.retain(|i| i != image);
        point_obj.image_history.push(image.to_string());

        info!("point {}: instance of image {} recorded", point, image);
        Ok(())
    }

    /// Deletes the point's instance of an image and drops the image from
    /// the history. The currently selected image cannot be deleted; cut
    /// over to another instance first.
    pub fn delete_instance(
        &self,
        m: &mut Manifest,
        images: &ImageEngine,
        point: &str,
        image: &str,
    ) -> Result<()> {
        let point_obj = m.point(point)?;
        if point_obj.current_image == image {
            return Err(Error::CurrentInstance {
                point: point.to_string(),
                image: image.to_string(),
            });
        }

        images.delete_instance(m, image, &InstanceId::named(point), false)?;
        m.point_mut(point)?.image_history.retain(|i| i != image);

        info!("point {}: instance of image {} deleted", point, image);
        Ok(())
    }

    /// Mounts the currently selected image instance and binds it at the
    /// public mountpoint. Returns the public path.
    ///
    /// An already-live public path is left alone, keeping the operation
    /// idempotent.
    pub fn mount(&self, m: &Manifest, images: &ImageEngine, point: &str) -> Result<PathBuf> {
        let image = m.point(point)?.current_image.clone();
        let point_dir = self.point_dir(point);

        let top_mount = images.mount_instance(m, &image, &InstanceId::named(point), true)?;
        if !self.probe.is_mounted(&point_dir)? {
            self.driver.bind_mount(&top_mount, &point_dir, false)?;
        }

        info!("point {}: mounted at {:?}", point, point_dir);
        Ok(point_dir)
    }

    /// Unmounts the public bind and the instance below it.
    pub fn umount(&self, m: &Manifest, images: &ImageEngine, point: &str) -> Result<()> {
        let image = m.point(point)?.current_image.clone();

        images.umount_instance(m, &image, &InstanceId::named(point))?;

        let point_dir = self.point_dir(point);
        if self.probe.is_mounted(&point_dir)? {
            self.driver.unmount(&point_dir)?;
        }
        info!("point {}: unmounted", point);
        Ok(())
    }
}
