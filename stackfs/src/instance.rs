use std::fmt;

/// Identifies one instance of an image.
///
/// Every image owns a reserved instance, `.self`, which is the image's own
/// base layer: its `content` directory is what child images and named
/// instances stack on top of. `.self` exists on disk but is never listed in
/// the manifest. All other instances are named after the stackpoint they
/// belong to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InstanceId {
    /// The reserved `.self` instance.
    Own,
    /// A named (per-stackpoint) instance.
    Named(String),
}

impl InstanceId {
    /// The on-disk directory name of the reserved instance.
    pub const OWN_NAME: &str = ".self";

    pub fn named<S: Into<String>>(name: S) -> Self {
        let name = name.into();
        if name == Self::OWN_NAME {
            Self::Own
        } else {
            Self::Named(name)
        }
    }

    pub fn is_own(&self) -> bool {
        matches!(self, Self::Own)
    }

    /// The directory name of this instance.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Own => Self::OWN_NAME,
            Self::Named(name) => name,
        }
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for InstanceId {
    fn from(value: &str) -> Self {
        Self::named(value)
    }
}
