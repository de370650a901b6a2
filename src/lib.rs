//! drawmeta - drawing set ingestion and title-block metadata extraction.
//!
//! Renders drawing set PDFs to page images, then pulls the drawing number,
//! title, and revision out of each sheet's title block through a tiered
//! OCR pipeline.

// Model types use `from_str` methods that return Option<Self>,
// not Result<Self, Error> as std::str::FromStr requires.
#![allow(clippy::should_implement_trait)]

pub mod cli;
pub mod config;
pub mod crop;
pub mod events;
pub mod extraction;
pub mod jobs;
pub mod migrations;
pub mod models;
pub mod ocr;
pub mod render;
pub mod repository;
pub mod schema;
pub mod storage;
pub mod validation;
