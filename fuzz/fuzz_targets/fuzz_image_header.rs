//! Fuzzes descriptor extraction from the first chunk of a download.
//!
//! Run with:
//!   cargo +nightly fuzz run fuzz_image_header
#![no_main]
use libfuzzer_sys::fuzz_target;
use ota_updater::image::{DESCRIPTOR_OFFSET, HEADER_REGION_LEN, has_image_magic, parse_descriptor};

fuzz_target!(|data: &[u8]| {
    let _ = has_image_magic(data);

    match parse_descriptor(data) {
        Ok(desc) => {
            assert!(data.len() >= HEADER_REGION_LEN);
            // text accessors must cope with missing NULs and invalid UTF-8
            let _ = desc.version_str();
            let _ = desc.project_name_str();
            let _ = desc.build_stamp();
            let _ = desc.elf_sha256_hex();

            let mut rebuilt = vec![0u8; DESCRIPTOR_OFFSET];
            rebuilt.extend_from_slice(&desc.to_bytes());
            assert_eq!(parse_descriptor(&rebuilt).ok(), Some(desc));
        }
        Err(_) => assert!(data.len() < HEADER_REGION_LEN),
    }
});
