//! Utility functions for timestamps and image discovery.

pub mod images;
pub mod timestamps;

pub use images::{count_images, has_images, is_image, list_images, list_with_extension, IMAGE_EXTENSIONS};
pub use timestamps::{format_iso, human_time, iso_timestamp, now_ts, Timestamp, RUN_TS_FORMAT};
