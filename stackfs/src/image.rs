use std::{
    fs,
    path::{self, Path, PathBuf},
    sync::Arc,
};

use log::info;

use crate::{
    fs::{OverlayDriver, SharedProbe},
    instance::InstanceId,
    kernel::MountStrategy,
    manifest::{Image, Manifest},
    Error, Result,
};

/// Image and instance lifecycle: directory layout, manifest bookkeeping and
/// mount/umount dispatch.
///
/// Every image lives under the images directory as
/// `<name>/<instance>/{content,mount,working}`, one subdirectory per
/// instance. The reserved `.self` instance holds the image's own base
/// layer. Operations validate against the manifest first; filesystem
/// side-effects happen only after validation.
pub struct ImageEngine {
    images_dir: PathBuf,
    strategy: MountStrategy,
    driver: Arc<OverlayDriver>,
    probe: SharedProbe,
}

/// Maximum stacking depth (ancestors plus the instance itself) the legacy
/// strategy can emulate.
const MAX_LEGACY_DEPTH: usize = 2;

impl ImageEngine {
    pub const CONTENT_DIR: &str = "content";
    pub const MOUNT_DIR: &str = "mount";
    pub const WORKING_DIR: &str = "working";

    pub fn new<P: AsRef<Path>>(
        images_dir: P,
        strategy: MountStrategy,
        driver: Arc<OverlayDriver>,
        probe: SharedProbe,
    ) -> Result<Self> {
        Ok(Self {
            images_dir: path::absolute(images_dir.as_ref())?,
            strategy,
            driver,
            probe,
        })
    }

    pub fn strategy(&self) -> MountStrategy {
        self.strategy
    }

    pub fn image_dir(&self, name: &str) -> PathBuf {
        self.images_dir.join(name)
    }

    pub fn instance_dir(&self, name: &str, instance: &InstanceId) -> PathBuf {
        self.image_dir(name).join(instance.as_str())
    }

    /// The instance's writable layer (for `.self`, the image's base layer).
    pub fn content_dir(&self, name: &str, instance: &InstanceId) -> PathBuf {
        self.instance_dir(name, instance).join(Self::CONTENT_DIR)
    }

    /// The live mountpoint of the instance when it is active.
    pub fn mount_dir(&self, name: &str, instance: &InstanceId) -> PathBuf {
        self.instance_dir(name, instance).join(Self::MOUNT_DIR)
    }

    pub fn working_dir(&self, name: &str, instance: &InstanceId) -> PathBuf {
        self.instance_dir(name, instance).join(Self::WORKING_DIR)
    }

    /// Creates an image, optionally inheriting from a parent.
    pub fn new_image(&self, m: &mut Manifest, name: &str, parent: Option<&str>) -> Result<()> {
        if m.images.contains_key(name) {
            return Err(Error::DuplicateImage(name.to_string()));
        }
        if let Some(parent) = parent {
            if !m.images.contains_key(parent) {
                return Err(Error::UnknownImage(parent.to_string()));
            }
            let parent_dir = self.image_dir(parent);
            if !parent_dir.exists() {
                return Err(Error::LayoutMismatch(format!(
                    "parent image directory does not exist: {}",
                    parent_dir.display()
                )));
            }
        }

        let image_dir = self.image_dir(name);
        if image_dir.exists() {
            return Err(Error::LayoutMismatch(format!(
                "image directory already exists: {}",
                image_dir.display()
            )));
        }

        fs::create_dir(&image_dir)?;
        m.images.insert(
            name.to_string(),
            Image {
                name: name.to_string(),
                parent: parent.map(|p| p.to_string()),
                version: None,
                instances: vec![],
            },
        );
        self.new_instance(m, name, &InstanceId::Own, true)?;

        info!("image {}: created (parent: {:?})", name, parent);
        Ok(())
    }

    /// Deletes an image once nothing depends on it and none of its mounts
    /// are live.
    pub fn delete_image(&self, m: &mut Manifest, name: &str) -> Result<()> {
        let image = m.image(name)?;

        let children = m.child_images(name);
        if !children.is_empty() {
            let names: Vec<&str> = children.iter().map(|c| c.name.as_str()).collect();
            return Err(Error::HasChildren(names.join(", ")));
        }

        let mut mounted = vec![];
        for instance in &image.instances {
            if self
                .probe
                .is_mounted(&self.mount_dir(name, &InstanceId::named(instance.as_str())))?
            {
                mounted.push(instance.as_str());
            }
        }
        if !mounted.is_empty() {
            return Err(Error::InstancesMounted(mounted.join(", ")));
        }
        if !image.instances.is_empty() {
            return Err(Error::HasInstances(image.instances.join(", ")));
        }

        // the manifest says no instances are left; double-check the layout
        let mut extra = vec![];
        for entry in fs::read_dir(self.image_dir(name))? {
            let entry = entry?;
            if entry.file_name().to_string_lossy() != InstanceId::OWN_NAME {
                extra.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        if !extra.is_empty() {
            return Err(Error::LayoutMismatch(format!(
                "image may be supporting instances: {}",
                extra.join(", ")
            )));
        }

        if self.probe.is_mounted(&self.mount_dir(name, &InstanceId::Own))? {
            return Err(Error::EditingActive(name.to_string()));
        }

        fs::remove_dir_all(self.image_dir(name))?;
        m.images.remove(name);
        info!("image {}: deleted", name);
        Ok(())
    }

    /// Mounts the image's own base view, for editing.
    pub fn mount_image(&self, m: &Manifest, name: &str, writable: bool) -> Result<PathBuf> {
        self.mount_instance(m, name, &InstanceId::Own, writable)
    }

    pub fn umount_image(&self, m: &Manifest, name: &str) -> Result<()> {
        self.umount_instance(m, name, &InstanceId::Own)
    }

    /// Creates an instance of an image. Creating the reserved `.self`
    /// instance requires `force`.
    pub fn new_instance(
        &self,
        m: &mut Manifest,
        name: &str,
        instance: &InstanceId,
        force: bool,
    ) -> Result<()> {
        let image = m.image(name)?;

        if let InstanceId::Named(instance_name) = instance {
            if image.instances.contains(instance_name) {
                return Err(Error::DuplicateInstance {
                    image: name.to_string(),
                    instance: instance_name.clone(),
                });
            }
        }
        if instance.is_own() && !force {
            return Err(Error::ReservedInstance);
        }

        let instance_dir = self.instance_dir(name, instance);
        if instance_dir.exists() {
            return Err(Error::LayoutMismatch(format!(
                "image instance directory already exists: {}",
                instance_dir.display()
            )));
        }

        fs::create_dir(&instance_dir)?;
        fs::create_dir(instance_dir.join(Self::CONTENT_DIR))?;
        fs::create_dir(instance_dir.join(Self::MOUNT_DIR))?;
        fs::create_dir(instance_dir.join(Self::WORKING_DIR))?;

        // the .self instance is implicit and stays out of the manifest
        if let InstanceId::Named(instance_name) = instance {
            m.image_mut(name)?.instances.push(instance_name.clone());
        }

        info!("image {}: instance {} created", name, instance);
        Ok(())
    }

    /// Deletes an instance that is not mounted. Deleting `.self` requires
    /// `force`.
    pub fn delete_instance(
        &self,
        m: &mut Manifest,
        name: &str,
        instance: &InstanceId,
        force: bool,
    ) -> Result<()> {
        let image = m.image(name)?;

        if instance.is_own() && !force {
            return Err(Error::ReservedInstance);
        }
        if let InstanceId::Named(instance_name) = instance {
            if !image.instances.contains(instance_name) {
                return Err(Error::UnknownInstance {
                    image: name.to_string(),
                    instance: instance_name.clone(),
                });
            }
        }

        if self.probe.is_mounted(&self.mount_dir(name, instance))? {
            return Err(Error::InstanceMounted {
                image: name.to_string(),
                instance: instance.to_string(),
            });
        }

        fs::remove_dir_all(self.instance_dir(name, instance))?;
        if let InstanceId::Named(instance_name) = instance {
            m.image_mut(name)?
                .instances
                .retain(|i| i != instance_name);
        }

        info!("image {}: instance {} deleted", name, instance);
        Ok(())
    }

    /// Mounts an instance, stacking the image's ancestor chain below it.
    /// Returns the live mountpoint.
    ///
    /// Mounting is idempotent: when the mountpoint is already live the
    /// whole ancestor chain is assumed mounted and nothing is issued.
    pub fn mount_instance(
        &self,
        m: &Manifest,
        name: &str,
        instance: &InstanceId,
        writable: bool,
    ) -> Result<PathBuf> {
        let image = m.image(name)?;
        if let InstanceId::Named(instance_name) = instance {
            if !image.instances.contains(instance_name) {
                return Err(Error::UnknownInstance {
                    image: name.to_string(),
                    instance: instance_name.clone(),
                });
            }
        }

        match self.strategy {
            MountStrategy::Standard => self.mount_standard(m, name, instance, writable),
            MountStrategy::Legacy => {
                let depth = self.stack_depth(m, name)?;
                if depth > MAX_LEGACY_DEPTH {
                    return Err(Error::DepthExceeded(depth));
                }
                self.mount_legacy(m, name, instance, writable)
            }
        }
    }

    pub fn umount_instance(&self, m: &Manifest, name: &str, instance: &InstanceId) -> Result<()> {
        m.image(name)?;

        match self.strategy {
            MountStrategy::Standard => self.umount_standard(name, instance),
            MountStrategy::Legacy => self.umount_legacy(m, name, instance),
        }
    }

    /// Ancestor count plus the instance itself.
    fn stack_depth(&self, m: &Manifest, name: &str) -> Result<usize> {
        let mut depth = 1;
        let mut parent = m.image(name)?.parent.as_deref();
        while let Some(p) = parent {
            depth += 1;
            parent = m.image(p)?.parent.as_deref();
        }
        Ok(depth)
    }

    /// One overlay mount with the full lower stack, nearest ancestor first.
    ///
    /// For `.self` the image's base layer is the upper layer, so the lower
    /// stack holds the ancestors only; a root image's `.self` has no lower
    /// layer at all and is bind-mounted instead.
    fn mount_standard(
        &self,
        m: &Manifest,
        name: &str,
        instance: &InstanceId,
        writable: bool,
    ) -> Result<PathBuf> {
        let mount_dir = self.mount_dir(name, instance);
        if self.probe.is_mounted(&mount_dir)? {
            return Ok(mount_dir);
        }

        let upper = self.content_dir(name, instance);
        let work = self.working_dir(name, instance);

        let mut lower = vec![];
        if !instance.is_own() {
            lower.push(self.content_dir(name, &InstanceId::Own));
        }
        let mut parent = m.image(name)?.parent.as_deref();
        while let Some(p) = parent {
            lower.push(self.content_dir(p, &InstanceId::Own));
            parent = m.image(p)?.parent.as_deref();
        }

        if lower.is_empty() {
            self.driver.bind_mount(&upper, &mount_dir, !writable)?;
        } else {
            self.driver
                .overlay_mount(&mount_dir, &lower, &upper, &work, !writable)?;
        }
        Ok(mount_dir)
    }

    fn umount_standard(&self, name: &str, instance: &InstanceId) -> Result<()> {
        let mount_dir = self.mount_dir(name, instance);
        if self.probe.is_mounted(&mount_dir)? {
            self.driver.unmount(&mount_dir)?;
        }
        Ok(())
    }

    /// Emulates depth by stacking single-lower overlay mounts recursively.
    ///
    /// A named instance overlays the image's read-only base view, which is
    /// materialized first by mounting `.self`. `.self` in turn overlays the
    /// parent's mounted base view; a root image's base view is a plain bind
    /// mount of its content.
    fn mount_legacy(
        &self,
        m: &Manifest,
        name: &str,
        instance: &InstanceId,
        writable: bool,
    ) -> Result<PathBuf> {
        let mount_dir = self.mount_dir(name, instance);
        // if already live, the ancestor chain below is live as well
        if self.probe.is_mounted(&mount_dir)? {
            return Ok(mount_dir);
        }

        let upper = self.content_dir(name, instance);
        let work = self.working_dir(name, instance);

        if !instance.is_own() {
            self.mount_legacy(m, name, &InstanceId::Own, false)?;
            let lower = vec![self.mount_dir(name, &InstanceId::Own)];
            self.driver
                .overlay_mount(&mount_dir, &lower, &upper, &work, !writable)?;
        } else if let Some(parent) = m.image(name)?.parent.as_deref() {
            self.mount_legacy(m, parent, &InstanceId::Own, false)?;
            let lower = vec![self.mount_dir(parent, &InstanceId::Own)];
            self.driver
                .overlay_mount(&mount_dir, &lower, &upper, &work, !writable)?;
        } else {
            // root base view: no layering, expose the content directly
            self.driver.bind_mount(&upper, &mount_dir, !writable)?;
        }
        Ok(mount_dir)
    }

    /// Unmounts one instance. Ancestors are not unmounted automatically;
    /// callers unmount in leaf-first order.
    fn umount_legacy(&self, m: &Manifest, name: &str, instance: &InstanceId) -> Result<()> {
        if instance.is_own() {
            // everything stacked on this base view would be orphaned
            let mut mounted_children = vec![];
            for child in m.child_images(name) {
                if self
                    .probe
                    .is_mounted(&self.mount_dir(&child.name, &InstanceId::Own))?
                {
                    mounted_children.push(child.name.as_str());
                }
            }
            if !mounted_children.is_empty() {
                return Err(Error::ChildrenMounted(mounted_children.join(", ")));
            }

            let mut mounted_instances = vec![];
            for inst in &m.image(name)?.instances {
                if self
                    .probe
                    .is_mounted(&self.mount_dir(name, &InstanceId::named(inst.as_str())))?
                {
                    mounted_instances.push(inst.as_str());
                }
            }
            if !mounted_instances.is_empty() {
                return Err(Error::InstancesMounted(mounted_instances.join(", ")));
            }
        }

        let mount_dir = self.mount_dir(name, instance);
        if self.probe.is_mounted(&mount_dir)? {
            self.driver.unmount(&mount_dir)?;
        }
        Ok(())
    }
}
