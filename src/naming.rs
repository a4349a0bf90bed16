//! Imaging Machine file and directory naming.
//!
//! Image files carry their metadata in the name, tags separated by `--`:
//!
//! ```text
//! C002--PO01--LO001--CO1--SL001--Z0179500.tif
//! ^well  ^sub  ^time  ^ch  ^slice ^Z in 0.1 µm
//! ```
//!
//! Acquisitions without an explicit save directory land in
//! `<project folder>/<YYYYMMDD_HHMMSS>_<plate id>`, where the timestamp is
//! taken when the device enters script mode.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Metadata tags set with the `SetMetadata*` commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMetadata {
    /// Well, one letter and 3 digits (`"A001"`).
    pub well_id: String,
    /// Subposition within the well, from 1.
    pub subposition: u32,
    /// Timepoint of a time-lapse, from 1.
    pub timepoint: u32,
}

impl Default for ImageMetadata {
    fn default() -> Self {
        Self {
            well_id: "A001".to_string(),
            subposition: 1,
            timepoint: 1,
        }
    }
}

/// True for a letter followed by exactly 3 digits.
pub fn is_valid_well_id(well_id: &str) -> bool {
    let bytes = well_id.as_bytes();
    bytes.len() == 4 && bytes[0].is_ascii_alphabetic() && bytes[1..].iter().all(u8::is_ascii_digit)
}

/// File name of slice `slice` (1-based) of an acquisition on `channel`.
pub fn image_file_name(meta: &ImageMetadata, channel: u32, slice: u32, z_um: f64) -> String {
    // Z is stored in tenths of a µm
    let z_tenths = (z_um * 10.0).round() as i64;
    format!(
        "{}--PO{:02}--LO{:03}--CO{}--SL{:03}--Z{:07}.tif",
        meta.well_id, meta.subposition, meta.timepoint, channel, slice, z_tenths
    )
}

/// Directory created for a plate in the default project folder.
pub fn plate_directory(session_start: NaiveDateTime, plate_id: &str) -> String {
    format!("{}_{}", session_start.format("%Y%m%d_%H%M%S"), plate_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_well_id_format() {
        assert!(is_valid_well_id("C002"));
        assert!(is_valid_well_id("a123"));
        assert!(!is_valid_well_id("C02"));
        assert!(!is_valid_well_id("C0002"));
        assert!(!is_valid_well_id("1002"));
        assert!(!is_valid_well_id("C0O2"));
        assert!(!is_valid_well_id(""));
    }

    #[test]
    fn test_image_file_name() {
        let meta = ImageMetadata {
            well_id: "C002".to_string(),
            subposition: 1,
            timepoint: 12,
        };
        assert_eq!(
            image_file_name(&meta, 1, 1, 17950.0),
            "C002--PO01--LO012--CO1--SL001--Z0179500.tif"
        );
        assert_eq!(
            image_file_name(&meta, 2, 20, 456.1),
            "C002--PO01--LO012--CO2--SL020--Z0004561.tif"
        );
    }

    #[test]
    fn test_plate_directory() {
        let start = NaiveDate::from_ymd_opt(2024, 3, 7)
            .unwrap()
            .and_hms_opt(9, 5, 1)
            .unwrap();
        assert_eq!(plate_directory(start, "test"), "20240307_090501_test");
    }
}
