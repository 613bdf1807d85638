//! Image header parsing
//!
//! An application image starts with a fixed image header, followed by the
//! header of its first segment. The first segment begins with the application
//! descriptor, so the descriptor always sits at a fixed offset from the start
//! of the image:
//!
//! ```text
//! 0        24       32                                 288
//! | image  | seg    | application descriptor (256 B)   | segment data ...
//! | header | header |                                  |
//! ```
//!
//! Only the first chunk of a download is ever parsed; later chunks carry no
//! header.

use serde::{Deserialize, Serialize};

use crate::error::ImageError;

/// Size of the image header that starts every application image
pub const IMAGE_HEADER_LEN: usize = 24;

/// Size of a segment header
pub const SEGMENT_HEADER_LEN: usize = 8;

/// Size of the application descriptor
pub const APP_DESC_LEN: usize = 256;

/// Offset of the application descriptor within an image
pub const DESCRIPTOR_OFFSET: usize = IMAGE_HEADER_LEN + SEGMENT_HEADER_LEN;

/// Bytes needed at the start of an image to extract its descriptor
pub const HEADER_REGION_LEN: usize = DESCRIPTOR_OFFSET + APP_DESC_LEN;

/// First byte of every application image
pub const IMAGE_MAGIC: u8 = 0xE9;

/// Magic word opening the application descriptor
pub const APP_DESC_MAGIC: u32 = 0xABCD_5432;

/// Width of the fixed version field
pub const VERSION_LEN: usize = 32;

const SECURE_VERSION_AT: usize = 4;
const VERSION_AT: usize = 16;
const PROJECT_NAME_AT: usize = 48;
const TIME_AT: usize = 80;
const DATE_AT: usize = 96;
const IDF_VERSION_AT: usize = 112;
const ELF_SHA256_AT: usize = 144;

/// Application descriptor embedded near the start of a firmware image
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FirmwareDescriptor {
    /// Descriptor magic word
    pub magic: u32,

    /// Anti-rollback counter (informational here)
    pub secure_version: u32,

    /// NUL-padded version string
    pub version: [u8; VERSION_LEN],

    /// NUL-padded project name
    pub project_name: [u8; 32],

    /// NUL-padded build time
    pub time: [u8; 16],

    /// NUL-padded build date
    pub date: [u8; 16],

    /// NUL-padded SDK version
    pub idf_version: [u8; 32],

    /// SHA-256 of the ELF the image was built from
    pub app_elf_sha256: [u8; 32],
}

impl FirmwareDescriptor {
    /// Build a descriptor with the given version and project name.
    ///
    /// Strings longer than their field are truncated so that a terminating
    /// NUL always fits.
    pub fn new(version: &str, project_name: &str) -> Self {
        Self {
            magic: APP_DESC_MAGIC,
            secure_version: 0,
            version: fixed_str(version),
            project_name: fixed_str(project_name),
            time: [0; 16],
            date: [0; 16],
            idf_version: [0; 32],
            app_elf_sha256: [0; 32],
        }
    }

    /// Version as text, up to the first NUL
    pub fn version_str(&self) -> String {
        nul_terminated(&self.version)
    }

    /// Project name as text, up to the first NUL
    pub fn project_name_str(&self) -> String {
        nul_terminated(&self.project_name)
    }

    /// Build date and time as text
    pub fn build_stamp(&self) -> String {
        format!(
            "{} {}",
            nul_terminated(&self.date),
            nul_terminated(&self.time)
        )
    }

    /// Whether the descriptor opens with the expected magic word
    pub fn has_valid_magic(&self) -> bool {
        self.magic == APP_DESC_MAGIC
    }

    /// Lower-case hex of the ELF digest
    pub fn elf_sha256_hex(&self) -> String {
        hex::encode(self.app_elf_sha256)
    }

    /// Exact comparison over the whole fixed-width version field
    pub fn same_version(&self, other: &FirmwareDescriptor) -> bool {
        self.version == other.version
    }

    /// Serialize to the on-flash descriptor layout
    pub fn to_bytes(&self) -> [u8; APP_DESC_LEN] {
        let mut out = [0u8; APP_DESC_LEN];
        put(&mut out, 0, &self.magic.to_le_bytes());
        put(&mut out, SECURE_VERSION_AT, &self.secure_version.to_le_bytes());
        put(&mut out, VERSION_AT, &self.version);
        put(&mut out, PROJECT_NAME_AT, &self.project_name);
        put(&mut out, TIME_AT, &self.time);
        put(&mut out, DATE_AT, &self.date);
        put(&mut out, IDF_VERSION_AT, &self.idf_version);
        put(&mut out, ELF_SHA256_AT, &self.app_elf_sha256);
        out
    }
}

/// Extract the application descriptor from the leading bytes of an image.
///
/// The descriptor is copied out; `buf` is not retained.
pub fn parse_descriptor(buf: &[u8]) -> Result<FirmwareDescriptor, ImageError> {
    let desc = buf
        .get(DESCRIPTOR_OFFSET..HEADER_REGION_LEN)
        .ok_or(ImageError::InsufficientData {
            needed: HEADER_REGION_LEN,
            available: buf.len(),
        })?;

    Ok(FirmwareDescriptor {
        magic: u32::from_le_bytes(take(desc, 0)),
        secure_version: u32::from_le_bytes(take(desc, SECURE_VERSION_AT)),
        version: take(desc, VERSION_AT),
        project_name: take(desc, PROJECT_NAME_AT),
        time: take(desc, TIME_AT),
        date: take(desc, DATE_AT),
        idf_version: take(desc, IDF_VERSION_AT),
        app_elf_sha256: take(desc, ELF_SHA256_AT),
    })
}

/// Whether `buf` starts like an application image
pub fn has_image_magic(buf: &[u8]) -> bool {
    buf.first() == Some(&IMAGE_MAGIC)
}

// `desc` is always APP_DESC_LEN long and every field offset lies inside it.
fn take<const N: usize>(desc: &[u8], at: usize) -> [u8; N] {
    let mut out = [0u8; N];
    if let Some(src) = desc.get(at..at.saturating_add(N)) {
        out.copy_from_slice(src);
    }
    out
}

fn put(out: &mut [u8], at: usize, src: &[u8]) {
    if let Some(dst) = out.get_mut(at..at.saturating_add(src.len())) {
        dst.copy_from_slice(src);
    }
}

fn fixed_str<const N: usize>(s: &str) -> [u8; N] {
    let mut out = [0u8; N];
    let len = s.len().min(N.saturating_sub(1));
    if let (Some(dst), Some(src)) = (out.get_mut(..len), s.as_bytes().get(..len)) {
        dst.copy_from_slice(src);
    }
    out
}

fn nul_terminated(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(field.get(..end).unwrap_or_default()).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image_with(desc: &FirmwareDescriptor) -> Vec<u8> {
        let mut image = vec![0u8; DESCRIPTOR_OFFSET];
        image[0] = IMAGE_MAGIC;
        image.extend_from_slice(&desc.to_bytes());
        image.extend_from_slice(&[0xAA; 64]);
        image
    }

    #[test]
    fn test_header_region_matches_image_format() {
        assert_eq!(DESCRIPTOR_OFFSET, 0x20);
        assert_eq!(HEADER_REGION_LEN, 288);
    }

    #[test]
    fn test_parse_descriptor() -> Result<(), ImageError> {
        let desc = FirmwareDescriptor::new("v2.1.0", "thermostat");
        let image = image_with(&desc);

        let parsed = parse_descriptor(&image)?;
        assert_eq!(parsed, desc);
        assert_eq!(parsed.version_str(), "v2.1.0");
        assert_eq!(parsed.project_name_str(), "thermostat");
        assert!(parsed.has_valid_magic());
        Ok(())
    }

    #[test]
    fn test_parse_exact_header_region() -> Result<(), ImageError> {
        let desc = FirmwareDescriptor::new("1.0", "p");
        let image = image_with(&desc);
        let parsed = parse_descriptor(&image[..HEADER_REGION_LEN])?;
        assert_eq!(parsed.version_str(), "1.0");
        Ok(())
    }

    #[test]
    fn test_parse_short_buffer() {
        let buf = vec![IMAGE_MAGIC; HEADER_REGION_LEN - 1];
        assert_eq!(
            parse_descriptor(&buf),
            Err(ImageError::InsufficientData {
                needed: HEADER_REGION_LEN,
                available: HEADER_REGION_LEN - 1,
            })
        );
        assert!(parse_descriptor(&[]).is_err());
    }

    #[test]
    fn test_wrong_magic_still_parses() -> Result<(), ImageError> {
        let mut desc = FirmwareDescriptor::new("1.0", "p");
        desc.magic = 0xDEAD_BEEF;
        let parsed = parse_descriptor(&image_with(&desc))?;
        assert!(!parsed.has_valid_magic());
        Ok(())
    }

    #[test]
    fn test_long_version_is_truncated() {
        let long = "x".repeat(64);
        let desc = FirmwareDescriptor::new(&long, "p");
        assert_eq!(desc.version_str().len(), VERSION_LEN - 1);
        assert_eq!(desc.version[VERSION_LEN - 1], 0);
    }

    #[test]
    fn test_same_version_compares_whole_field() {
        let a = FirmwareDescriptor::new("1.0", "a");
        let b = FirmwareDescriptor::new("1.0", "b");
        let mut c = FirmwareDescriptor::new("1.0", "a");
        // same text prefix, trailing garbage after the NUL
        c.version[10] = b'z';
        assert!(a.same_version(&b));
        assert!(!a.same_version(&c));
        assert_eq!(a.version_str(), c.version_str());
    }

    #[test]
    fn test_elf_sha256_hex() {
        let mut desc = FirmwareDescriptor::new("1.0", "p");
        desc.app_elf_sha256[0] = 0xAB;
        desc.app_elf_sha256[31] = 0x01;
        let hex = desc.elf_sha256_hex();
        assert_eq!(hex.len(), 64);
        assert!(hex.starts_with("ab00"));
        assert!(hex.ends_with("01"));
    }

    #[test]
    fn test_has_image_magic() {
        assert!(has_image_magic(&[IMAGE_MAGIC, 0, 0]));
        assert!(!has_image_magic(&[0x7F, b'E', b'L', b'F']));
        assert!(!has_image_magic(&[]));
    }
}
