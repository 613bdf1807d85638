//! Firmware image fixtures.

use ota_updater::image::{DESCRIPTOR_OFFSET, FirmwareDescriptor, IMAGE_MAGIC};

/// Builds firmware images laid out like real application images:
/// image header, segment header, descriptor, then payload.
#[derive(Debug, Clone)]
pub struct ImageBuilder {
    descriptor: FirmwareDescriptor,
    payload_len: usize,
    image_magic: u8,
}

impl ImageBuilder {
    /// Image carrying `version`, with an empty payload
    pub fn new(version: &str) -> Self {
        Self {
            descriptor: FirmwareDescriptor::new(version, "test-device"),
            payload_len: 0,
            image_magic: IMAGE_MAGIC,
        }
    }

    /// Append `len` bytes of deterministic payload after the descriptor
    pub fn payload(mut self, len: usize) -> Self {
        self.payload_len = len;
        self
    }

    /// Override the project name
    pub fn project(mut self, name: &str) -> Self {
        let version = self.descriptor.version_str();
        self.descriptor = FirmwareDescriptor::new(&version, name);
        self
    }

    /// Replace the leading image magic byte
    pub fn image_magic(mut self, magic: u8) -> Self {
        self.image_magic = magic;
        self
    }

    /// Descriptor embedded in the image
    pub fn descriptor(&self) -> &FirmwareDescriptor {
        &self.descriptor
    }

    /// Produce the image bytes
    pub fn build(&self) -> Vec<u8> {
        let mut out = vec![0u8; DESCRIPTOR_OFFSET];
        if let Some(first) = out.first_mut() {
            *first = self.image_magic;
        }
        out.extend_from_slice(&self.descriptor.to_bytes());
        out.extend((0..self.payload_len).map(|i| (i % 251) as u8));
        out
    }
}

/// Shorthand for a descriptor with `version`
pub fn descriptor(version: &str) -> FirmwareDescriptor {
    FirmwareDescriptor::new(version, "test-device")
}
