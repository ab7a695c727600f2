//! VHD footer detection.
//!
//! A VHD image ends with a 512-byte big-endian footer starting with the
//! cookie `conectix`. Its presence is the only format signal; anything else is
//! imported as a flat raw image.

use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tracing::{debug, warn};

use crate::error::{ProviderError, Result};

pub const FOOTER_SIZE: usize = 512;
pub const COOKIE: &[u8; 8] = b"conectix";

const CHECKSUM_AT: usize = 64;

/// Upload format understood by the import endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskFormat {
    Raw,
    Vhd,
}

impl DiskFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            DiskFormat::Raw => "raw",
            DiskFormat::Vhd => "vhd",
        }
    }
}

/// Parsed hard disk footer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VhdFooter {
    pub features: u32,
    pub file_format_version: u32,
    pub data_offset: u64,
    pub timestamp: u32,
    pub creator_application: [u8; 4],
    pub creator_version: u32,
    pub creator_host_os: u32,
    /// Virtual size when the image was created.
    pub original_size: u64,
    pub current_size: u64,
    pub disk_geometry: u32,
    pub disk_type: u32,
    pub checksum: u32,
    pub unique_id: [u8; 16],
    pub saved_state: u8,
}

fn field<const N: usize>(buf: &[u8; FOOTER_SIZE], at: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&buf[at..at + N]);
    out
}

fn be_u32(buf: &[u8; FOOTER_SIZE], at: usize) -> u32 {
    u32::from_be_bytes(field(buf, at))
}

fn be_u64(buf: &[u8; FOOTER_SIZE], at: usize) -> u64 {
    u64::from_be_bytes(field(buf, at))
}

impl VhdFooter {
    /// `None` unless `buf` starts with the VHD cookie.
    pub fn parse(buf: &[u8; FOOTER_SIZE]) -> Option<Self> {
        if &buf[..COOKIE.len()] != COOKIE {
            return None;
        }
        Some(Self {
            features: be_u32(buf, 8),
            file_format_version: be_u32(buf, 12),
            data_offset: be_u64(buf, 16),
            timestamp: be_u32(buf, 24),
            creator_application: field(buf, 28),
            creator_version: be_u32(buf, 32),
            creator_host_os: be_u32(buf, 36),
            original_size: be_u64(buf, 40),
            current_size: be_u64(buf, 48),
            disk_geometry: be_u32(buf, 56),
            disk_type: be_u32(buf, 60),
            checksum: be_u32(buf, CHECKSUM_AT),
            unique_id: field(buf, 68),
            saved_state: buf[84],
        })
    }

    /// One's complement of the byte sum, with the checksum field as zero.
    pub fn compute_checksum(buf: &[u8; FOOTER_SIZE]) -> u32 {
        let sum = buf
            .iter()
            .enumerate()
            .filter(|(i, _)| !(CHECKSUM_AT..CHECKSUM_AT + 4).contains(i))
            .fold(0u32, |acc, (_, b)| acc.wrapping_add(u32::from(*b)));
        !sum
    }
}

/// What the importer needs to know about a local image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    pub path: PathBuf,
    /// Bytes on disk, sent as the upload's length.
    pub file_size: u64,
    /// Size the VDI must be created with.
    pub virtual_size: u64,
    pub format: DiskFormat,
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ProviderError + '_ {
    move |source| ProviderError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Stat and classify the image at `path`.
pub async fn inspect(path: &Path) -> Result<ImageInfo> {
    let metadata = tokio::fs::metadata(path).await.map_err(io_error(path))?;
    if metadata.is_dir() {
        return Err(ProviderError::invalid(
            "raw_vdi_path",
            path.display(),
            "path is a directory, not a file",
        ));
    }
    let file_size = metadata.len();
    if file_size == 0 {
        return Err(ProviderError::invalid("raw_vdi_path", path.display(), "file is empty"));
    }
    let raw = ImageInfo {
        path: path.to_path_buf(),
        file_size,
        virtual_size: file_size,
        format: DiskFormat::Raw,
    };
    if file_size < FOOTER_SIZE as u64 {
        return Ok(raw);
    }

    let mut file = File::open(path).await.map_err(io_error(path))?;
    file.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))
        .await
        .map_err(io_error(path))?;
    let mut buf = [0u8; FOOTER_SIZE];
    file.read_exact(&mut buf).await.map_err(io_error(path))?;

    let Some(footer) = VhdFooter::parse(&buf) else {
        debug!(path = %path.display(), size = file_size, "raw image");
        return Ok(raw);
    };
    if VhdFooter::compute_checksum(&buf) != footer.checksum {
        warn!(path = %path.display(), "VHD footer checksum does not match");
    }
    debug!(
        path = %path.display(),
        original_size = footer.original_size,
        "detected VHD footer"
    );
    Ok(ImageInfo {
        virtual_size: footer.original_size,
        format: DiskFormat::Vhd,
        ..raw
    })
}
