//! Offline field-pack builder for OGC web services.
//!
//! Discovers the publishable layers of a GeoServer through WFS/WCS
//! GetCapabilities documents, filters them by regex patterns, and downloads
//! every match (GeoJSON and KML per vector layer, GeoTIFF per coverage) into
//! a directory tree with a rewritten-each-run CSV manifest. Downloads stream
//! to a temporary sibling path and are renamed into place only on full
//! completion, so re-running resumes exactly where an interrupted run left
//! off.

pub mod cancel;
pub mod capabilities;
pub mod config;
pub mod error;
pub mod manifest;
pub mod output;
pub mod plan;
pub mod run;
pub mod transfer;
