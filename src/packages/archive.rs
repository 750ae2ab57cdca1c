// src/packages/archive.rs

//! Equo package archives
//!
//! A package file is a compressed tar archive:
//!
//! ```text
//! metadata.json      PackageRecord of the package (optional for repository packages)
//! image/...          files, directories and symlinks relative to the root
//! ```
//!
//! Compression (gzip, xz or zstd) is detected from magic bytes.

use crate::db::models::PackageRecord;
use crate::error::{Error, Result};
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tar::Archive;
use tracing::debug;
use xz2::read::XzDecoder;

/// Name of the metadata member
pub const METADATA_FILE: &str = "metadata.json";

/// Directory holding the payload, inside the archive and after unpacking
pub const IMAGE_DIR: &str = "image";

/// Compression used by a package archive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionFormat {
    Gzip,
    Xz,
    Zstd,
}

impl CompressionFormat {
    /// Detect the compression from the first bytes of a file
    pub fn detect(magic: &[u8]) -> Option<Self> {
        if magic.starts_with(&[0x1F, 0x8B]) {
            Some(CompressionFormat::Gzip)
        } else if magic.starts_with(&[0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00]) {
            Some(CompressionFormat::Xz)
        } else if magic.starts_with(&[0x28, 0xB5, 0x2F, 0xFD]) {
            Some(CompressionFormat::Zstd)
        } else {
            None
        }
    }
}

/// A package file on disk
#[derive(Debug, Clone)]
pub struct PackageArchive {
    path: PathBuf,
    compression: CompressionFormat,
}

impl PackageArchive {
    /// Open a package file and detect its compression
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path).map_err(|e| {
            Error::IoError(format!("Failed to open package file {}: {}", path.display(), e))
        })?;
        let mut magic = [0u8; 6];
        let read = file.read(&mut magic)?;

        let compression = CompressionFormat::detect(&magic[..read]).ok_or_else(|| {
            Error::ParseError(format!("Unable to detect package format for: {}", path.display()))
        })?;

        Ok(Self {
            path: path.to_path_buf(),
            compression,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn compression(&self) -> CompressionFormat {
        self.compression
    }

    fn archive(&self) -> Result<Archive<Box<dyn Read>>> {
        let file = File::open(&self.path)?;
        let reader: Box<dyn Read> = match self.compression {
            CompressionFormat::Zstd => {
                let decoder = zstd::Decoder::new(file).map_err(|e| {
                    Error::ParseError(format!("Failed to create zstd decoder: {}", e))
                })?;
                Box::new(decoder)
            }
            CompressionFormat::Xz => Box::new(XzDecoder::new(file)),
            CompressionFormat::Gzip => Box::new(GzDecoder::new(file)),
        };
        Ok(Archive::new(reader))
    }

    /// Read the embedded metadata, if the archive carries any
    pub fn read_metadata(&self) -> Result<Option<PackageRecord>> {
        let mut archive = self.archive()?;
        for entry in archive.entries()? {
            let mut entry = entry?;
            let entry_path = entry.path()?.to_string_lossy().to_string();
            if entry_path.trim_start_matches("./") == METADATA_FILE {
                let mut content = String::new();
                entry.read_to_string(&mut content)?;
                let record: PackageRecord = serde_json::from_str(&content)?;
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// Extract the archive into `dest`, returning the image directory
    ///
    /// `dest` is emptied first. Members escaping `dest` are refused by `tar`.
    pub fn unpack(&self, dest: &Path) -> Result<PathBuf> {
        if dest.exists() {
            fs::remove_dir_all(dest)?;
        }
        fs::create_dir_all(dest)?;

        let mut archive = self.archive()?;
        archive.set_preserve_permissions(true);
        archive.unpack(dest).map_err(|e| {
            Error::IoError(format!(
                "Failed to unpack {} into {}: {}",
                self.path.display(),
                dest.display(),
                e
            ))
        })?;

        let image = dest.join(IMAGE_DIR);
        if !image.exists() {
            fs::create_dir_all(&image)?;
        }

        debug!("Unpacked {} into {}", self.path.display(), image.display());
        Ok(image)
    }

    /// Build a package file from an image directory
    ///
    /// # Arguments
    ///
    /// * `image` - Directory whose contents become `image/`
    /// * `record` - Metadata to embed, if any
    /// * `dest` - Output file
    /// * `compression` - Compression to apply
    pub fn create(
        image: &Path,
        record: Option<&PackageRecord>,
        dest: &Path,
        compression: CompressionFormat,
    ) -> Result<Self> {
        let file = File::create(dest)?;
        let writer: Box<dyn Write> = match compression {
            CompressionFormat::Gzip => Box::new(flate2::write::GzEncoder::new(
                file,
                flate2::Compression::default(),
            )),
            CompressionFormat::Xz => Box::new(xz2::write::XzEncoder::new(file, 6)),
            CompressionFormat::Zstd => Box::new(
                zstd::Encoder::new(file, 0)
                    .map_err(|e| Error::IoError(format!("Failed to create zstd encoder: {}", e)))?
                    .auto_finish(),
            ),
        };

        let mut builder = tar::Builder::new(writer);
        builder.follow_symlinks(false);

        if let Some(record) = record {
            let data = serde_json::to_vec_pretty(record)?;
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, METADATA_FILE, data.as_slice())?;
        }
        builder.append_dir_all(IMAGE_DIR, image)?;

        let mut writer = builder.into_inner()?;
        writer.flush()?;
        drop(writer);

        Self::open(dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_image(dir: &Path) -> PathBuf {
        let image = dir.join("src-image");
        fs::create_dir_all(image.join("usr/bin")).unwrap();
        fs::write(image.join("usr/bin/foo"), b"#!/bin/sh\n").unwrap();
        image
    }

    #[test]
    fn test_compression_detection() {
        assert_eq!(
            CompressionFormat::detect(&[0x1F, 0x8B, 0x08]),
            Some(CompressionFormat::Gzip)
        );
        assert_eq!(
            CompressionFormat::detect(&[0x28, 0xB5, 0x2F, 0xFD, 0, 0]),
            Some(CompressionFormat::Zstd)
        );
        assert_eq!(
            CompressionFormat::detect(&[0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00]),
            Some(CompressionFormat::Xz)
        );
        assert_eq!(CompressionFormat::detect(b"!<arch>"), None);
    }

    #[test]
    fn test_create_and_unpack_each_compression() {
        let dir = TempDir::new().unwrap();
        let image = sample_image(dir.path());

        for compression in [
            CompressionFormat::Gzip,
            CompressionFormat::Xz,
            CompressionFormat::Zstd,
        ] {
            let dest = dir.path().join(format!("pkg-{:?}.tbz2", compression));
            let archive = PackageArchive::create(&image, None, &dest, compression).unwrap();
            assert_eq!(archive.compression(), compression);

            let unpacked = archive.unpack(&dir.path().join("unpack")).unwrap();
            assert_eq!(
                fs::read(unpacked.join("usr/bin/foo")).unwrap(),
                b"#!/bin/sh\n"
            );
            assert!(archive.read_metadata().unwrap().is_none());
        }
    }

    #[test]
    fn test_embedded_metadata() {
        let dir = TempDir::new().unwrap();
        let image = sample_image(dir.path());
        let mut record = PackageRecord::new("app-misc", "foo", "1.0");
        record.revision = 3;

        let archive = PackageArchive::create(
            &image,
            Some(&record),
            &dir.path().join("foo.tbz2"),
            CompressionFormat::Gzip,
        )
        .unwrap();

        assert_eq!(archive.read_metadata().unwrap(), Some(record));
    }

    #[test]
    fn test_open_rejects_unknown_format() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bogus");
        fs::write(&path, b"not a package").unwrap();
        assert!(matches!(
            PackageArchive::open(&path).unwrap_err(),
            Error::ParseError(_)
        ));
    }
}
