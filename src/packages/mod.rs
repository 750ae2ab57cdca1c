// src/packages/mod.rs

//! Package file support for Equo
//!
//! Equo ships binary packages as compressed tar archives carrying an
//! `image/` payload and, for standalone package files, their own metadata.

pub mod archive;

pub use archive::{CompressionFormat, PackageArchive};
