pub mod analytics;
pub mod class_records;
pub mod core;
pub mod narrative;
pub mod records;
pub mod setup;
