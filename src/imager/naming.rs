//! Deterministic image file names.
//!
//! Names are built from the prefix, the 1-based group and image numbers and the
//! format tag: `IMAGE_2_007.fits` is the seventh image of the second group.
//! Identical group layouts always yield identical names, and no two (group, image)
//! pairs share a name.

use crate::error::{AppResult, ImagerError};

/// Prefix used when none is configured.
pub const DEFAULT_PREFIX: &str = "IMAGE";

/// Extension used when the camera reports no format.
pub const DEFAULT_EXTENSION: &str = ".fits";

/// Build the file name for a frame.
///
/// `group` and `image` are zero-based indices.
pub fn image_filename(prefix: &str, group: usize, image: u32, format: &str) -> String {
    format!(
        "{}_{}_{:03}{}",
        prefix,
        group + 1,
        u64::from(image) + 1,
        normalize_extension(format)
    )
}

/// Turn a camera format tag into a file extension with a leading dot.
///
/// Tags that are empty or could escape the output directory fall back to
/// [`DEFAULT_EXTENSION`].
pub fn normalize_extension(format: &str) -> String {
    let trimmed = format.trim().trim_start_matches('.');
    if trimmed.is_empty() || trimmed.contains(['/', '\\', '\0']) || trimmed.contains("..") {
        DEFAULT_EXTENSION.to_string()
    } else {
        format!(".{}", trimmed.to_ascii_lowercase())
    }
}

/// Check an operator-supplied prefix.
pub fn validate_prefix(prefix: &str) -> AppResult<()> {
    if prefix.is_empty() {
        return Err(ImagerError::Configuration(
            "image prefix cannot be empty".into(),
        ));
    }
    if prefix.contains(['/', '\\', '\0']) || prefix == "." || prefix == ".." {
        return Err(ImagerError::Configuration(format!(
            "image prefix '{}' must not contain path separators",
            prefix
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_filename_layout() {
        assert_eq!(image_filename("IMAGE", 0, 0, ".fits"), "IMAGE_1_001.fits");
        assert_eq!(image_filename("M31", 1, 6, "fits"), "M31_2_007.fits");
        assert_eq!(image_filename("M31", 15, 999, ".FITS"), "M31_16_1000.fits");
    }

    #[test]
    fn test_extension_fallback() {
        assert_eq!(normalize_extension(""), ".fits");
        assert_eq!(normalize_extension(" . "), ".fits");
        assert_eq!(normalize_extension(".fits.fz"), ".fits.fz");
    }

    #[test]
    fn test_extension_cannot_leave_directory() {
        assert_eq!(normalize_extension("fits/x"), ".fits");
        assert_eq!(normalize_extension("/../y"), ".fits");
        assert_eq!(normalize_extension("a\\b"), ".fits");
        assert_eq!(normalize_extension("fits..z"), ".fits");
        assert_eq!(image_filename("IMG", 0, 0, "../../etc"), "IMG_1_001.fits");
    }

    #[test]
    fn test_names_distinct_within_run() {
        let mut seen = HashSet::new();
        for group in 0..16 {
            for image in 0..120 {
                assert!(seen.insert(image_filename("IMG", group, image, ".fits")));
            }
        }
    }

    #[test]
    fn test_prefix_validation() {
        assert!(validate_prefix("NGC7000_Ha").is_ok());
        assert!(validate_prefix("").is_err());
        assert!(validate_prefix("../escape").is_err());
        assert!(validate_prefix("a\\b").is_err());
    }
}
