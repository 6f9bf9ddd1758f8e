//! Output device identification type.

use std::sync::Arc;

/// Identifier of one output device (Bluetooth address, endpoint id, ...).
///
/// `DeviceId` uses `Arc<str>` internally, so cloning it into events, sync
/// bookkeeping and log fields is a pointer copy.
///
/// # Example
///
/// ```
/// use fanout_audio::DeviceId;
///
/// let speaker = DeviceId::new("00:1A:7D:DA:71:13");
/// assert_eq!(speaker, DeviceId::from("00:1A:7D:DA:71:13"));
/// assert_eq!(speaker.to_string(), "00:1A:7D:DA:71:13");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(Arc<str>);

impl DeviceId {
    /// Creates a new device ID from a string.
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    /// Returns the ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for DeviceId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl AsRef<str> for DeviceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_device_id_equality() {
        assert_eq!(DeviceId::new("headphones"), DeviceId::from("headphones"));
        assert_ne!(DeviceId::new("headphones"), DeviceId::new("speaker"));
    }

    #[test]
    fn test_device_id_hash() {
        let mut set = HashSet::new();
        set.insert(DeviceId::new("a"));
        set.insert(DeviceId::from(String::from("a")));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_device_id_clone_is_cheap() {
        let id = DeviceId::new("speaker");
        let cloned = id.clone();
        assert!(std::ptr::eq(id.as_str().as_ptr(), cloned.as_str().as_ptr()));
    }
}
