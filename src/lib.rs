//! Similarity search over an event photo archive.
//!
//! Images are catalogued in SQLite, indexed incrementally with pluggable
//! embedding models, a face detector and an object detector, and queried by
//! cosine similarity or object label.

pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod export;
pub mod faces;
pub mod indexing;
pub mod ingest;
pub mod logging;
pub mod objects;
pub mod onnx;
pub mod search;
