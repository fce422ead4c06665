use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable string identifier of a shared folder.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct FolderId(pub String);

impl FolderId {
    pub fn new(id: impl Into<String>) -> Self {
        FolderId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FolderId {
    fn from(id: &str) -> Self {
        FolderId(id.to_string())
    }
}

impl From<String> for FolderId {
    fn from(id: String) -> Self {
        FolderId(id)
    }
}

/// Full device identity: the digest of the device's public key.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct DeviceId(pub [u8; 32]);

impl DeviceId {
    /// Sentinel addressing the local device in index queries.
    pub const LOCAL: DeviceId = DeviceId([0xff; 32]);

    pub fn new(bytes: [u8; 32]) -> Self {
        DeviceId(bytes)
    }

    /// Compact stamp used on index entries authored by this device.
    pub fn short(&self) -> ShortDeviceId {
        ShortDeviceId(u64::from_be_bytes(
            self.0[..8].try_into().expect("device id has 32 bytes"),
        ))
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0[..7] {
            write!(f, "{b:02X}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({self})")
    }
}

/// Compact identifier of a device, stamped on index entries it modifies.
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
pub struct ShortDeviceId(pub u64);

impl ShortDeviceId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ShortDeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016X}", self.0)
    }
}
