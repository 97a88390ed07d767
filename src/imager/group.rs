//! Capture groups.
//!
//! A batch is an ordered list of groups. Every image in a group is taken with the
//! same filter, exposure and binning; only the image count differs between phases.

use crate::error::{AppResult, ImagerError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Maximum number of groups a single batch can hold.
pub const MAX_GROUP_COUNT: usize = 16;

/// On-chip binning factors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binning {
    /// Horizontal binning factor
    pub x: u16,
    /// Vertical binning factor
    pub y: u16,
}

impl Binning {
    /// Create binning factors without validation.
    pub const fn new(x: u16, y: u16) -> Self {
        Self { x, y }
    }

    /// Whether both factors are at least 1.
    pub fn is_valid(&self) -> bool {
        self.x >= 1 && self.y >= 1
    }
}

impl Default for Binning {
    fn default() -> Self {
        Self::new(1, 1)
    }
}

impl fmt::Display for Binning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.x, self.y)
    }
}

/// One phase of a batch.
///
/// Groups are plain values owned by the sequencer. They are replaced wholesale by
/// `Imager::configure` and are never mutated while a batch runs.
///
/// # Example
///
/// ```
/// use imager_agent::imager::{Binning, Group};
/// use std::time::Duration;
///
/// let luminance = Group::new(10, Some(1), Duration::from_secs(30), Binning::new(1, 1))?;
/// assert_eq!(luminance.total_exposure(), Duration::from_secs(300));
/// # Ok::<(), imager_agent::error::ImagerError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    /// Number of exposures to take in this group
    pub image_count: u32,
    /// Filter wheel slot to select before the first exposure, if any
    #[serde(default)]
    pub filter_slot: Option<u32>,
    /// Exposure duration of every image in the group
    #[serde(with = "humantime_serde")]
    pub exposure: Duration,
    /// Binning applied to every image in the group
    #[serde(default)]
    pub binning: Binning,
}

impl Group {
    /// Create a validated group.
    ///
    /// # Errors
    /// Returns `ImagerError::Configuration` if the image count is zero, the exposure
    /// is zero or either binning factor is zero.
    pub fn new(
        image_count: u32,
        filter_slot: Option<u32>,
        exposure: Duration,
        binning: Binning,
    ) -> AppResult<Self> {
        let group = Self {
            image_count,
            filter_slot,
            exposure,
            binning,
        };
        group.validate()?;
        Ok(group)
    }

    /// Check the group parameters.
    pub fn validate(&self) -> AppResult<()> {
        if self.image_count < 1 {
            return Err(ImagerError::Configuration(
                "image count must be at least 1".into(),
            ));
        }
        if self.exposure.is_zero() {
            return Err(ImagerError::Configuration(
                "exposure duration must be positive".into(),
            ));
        }
        if !self.binning.is_valid() {
            return Err(ImagerError::Configuration(format!(
                "binning must be at least 1x1, got {}",
                self.binning
            )));
        }
        Ok(())
    }

    /// Exposure time of the whole group, ignoring readout and filter moves.
    pub fn total_exposure(&self) -> Duration {
        self.exposure.saturating_mul(self.image_count)
    }

    /// Whether the group needs the filter wheel.
    pub fn requires_filter(&self) -> bool {
        self.filter_slot.is_some()
    }
}

/// Validate a whole group list as handed to `configure`.
///
/// Errors name the offending group with a 1-based index, matching how operators
/// number groups.
pub fn validate_groups(groups: &[Group]) -> AppResult<()> {
    if groups.is_empty() {
        return Err(ImagerError::Configuration(
            "at least one group is required".into(),
        ));
    }
    if groups.len() > MAX_GROUP_COUNT {
        return Err(ImagerError::Configuration(format!(
            "group count {} exceeds maximum of {}",
            groups.len(),
            MAX_GROUP_COUNT
        )));
    }
    for (index, group) in groups.iter().enumerate() {
        group.validate().map_err(|e| match e {
            ImagerError::Configuration(msg) => {
                ImagerError::Configuration(format!("group {}: {}", index + 1, msg))
            }
            other => other,
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn test_valid_group() {
        let group = Group::new(3, Some(1), secs(1), Binning::default()).unwrap();
        assert_eq!(group.image_count, 3);
        assert!(group.requires_filter());
        assert_eq!(group.total_exposure(), secs(3));
    }

    #[test]
    fn test_rejects_zero_images() {
        let err = Group::new(0, None, secs(1), Binning::default()).unwrap_err();
        assert!(matches!(err, ImagerError::Configuration(_)));
    }

    #[test]
    fn test_rejects_zero_exposure() {
        let err = Group::new(1, None, Duration::ZERO, Binning::default()).unwrap_err();
        assert!(err.to_string().contains("exposure"));
    }

    #[test]
    fn test_rejects_zero_binning() {
        assert!(Group::new(1, None, secs(1), Binning::new(0, 1)).is_err());
        assert!(Group::new(1, None, secs(1), Binning::new(2, 0)).is_err());
        assert!(Group::new(1, None, secs(1), Binning::new(4, 4)).is_ok());
    }

    #[test]
    fn test_validate_groups_bounds() {
        assert!(validate_groups(&[]).is_err());

        let group = Group::new(1, None, secs(1), Binning::default()).unwrap();
        assert!(validate_groups(&vec![group.clone(); MAX_GROUP_COUNT]).is_ok());
        assert!(validate_groups(&vec![group; MAX_GROUP_COUNT + 1]).is_err());
    }

    #[test]
    fn test_validate_groups_names_offender() {
        let good = Group::new(1, None, secs(1), Binning::default()).unwrap();
        let bad = Group {
            image_count: 0,
            ..good.clone()
        };
        let err = validate_groups(&[good, bad]).unwrap_err();
        assert!(err.to_string().contains("group 2"), "got: {err}");
    }

    #[test]
    fn test_group_from_toml() {
        let group: Group = toml::from_str(
            r#"
            image_count = 5
            filter_slot = 2
            exposure = "1m 30s"
            binning = { x = 2, y = 2 }
            "#,
        )
        .unwrap();
        assert_eq!(group.exposure, secs(90));
        assert_eq!(group.binning, Binning::new(2, 2));

        let plain: Group = toml::from_str("image_count = 1\nexposure = \"500ms\"").unwrap();
        assert_eq!(plain.filter_slot, None);
        assert_eq!(plain.binning, Binning::default());
    }
}
