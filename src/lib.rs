//! Files a photo collection into category folders by comparing CLIP image
//! embeddings against per-category anchors.

pub mod anchors;
pub mod cache;
pub mod clip;
pub mod color;
pub mod config;
pub mod convert;
pub mod duplicates;
pub mod error;
pub mod logging;
pub mod matcher;
pub mod pipeline;
pub mod report;
pub mod router;
pub mod scanner;
