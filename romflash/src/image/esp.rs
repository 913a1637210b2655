//! ESP firmware image container.
//!
//! ## Layout
//!
//! ```text
//! +----------------------------+
//! | Common header (8B)         |  magic, segment count, mode, size/freq, entry
//! +----------------------------+
//! | Extended header (16B)      |  ESP32 family only
//! +----------------------------+
//! | Segment header (8B) + data |  repeated per segment
//! +----------------------------+
//! | Zero padding, checksum (1B)|  checksum ends on a 16-byte boundary
//! +----------------------------+
//! | SHA-256 (32B)              |  only when append_digest is set
//! +----------------------------+
//! ```

use crate::error::{ImageError, Result};
use crate::image::params::{FlashFreq, FlashMode};
use crate::protocol::command::{CHECKSUM_SEED, checksum_from};
use crate::target::chip::{Chip, ImageFormat};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::warn;
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::fmt;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

/// First byte of every image.
pub const ESP_IMAGE_MAGIC: u8 = 0xE9;

/// Segments a bootloader accepts.
pub const MAX_SEGMENTS: usize = 16;

/// Flash MMU page size.
pub const IROM_ALIGN: u32 = 0x10000;

/// Size of a segment sub-header.
pub const SEG_HEADER_LEN: u32 = 8;

/// `wp_pin` value meaning write-protect is not used.
pub const WP_PIN_DISABLED: u8 = 0xEE;

/// Size of the ESP32-family extended header.
pub const EXTENDED_HEADER_LEN: usize = 16;

const DIGEST_LEN: usize = 32;

/// The ESP32 second-stage bootloader does not map the last MMU page of a
/// flash segment that ends less than this many bytes into it.
const MMU_PAGE_TAIL_MIN: u32 = 0x24;

fn eof(what: &str) -> impl FnOnce(std::io::Error) -> ImageError + '_ {
    move |_| ImageError::Truncated(what.to_string())
}

/// One loadable chunk of an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSegment {
    /// Load address.
    pub addr: u32,
    /// Segment payload.
    pub data: Vec<u8>,
    /// Offset of the segment header in the file it was read from.
    pub file_offset: Option<u32>,
    /// Whether the bytes count towards the image checksum.
    pub include_in_checksum: bool,
    /// ELF section name, when the segment came from one.
    pub name: Option<String>,
}

impl ImageSegment {
    /// Create a segment. Data at a nonzero address is padded to 4 bytes.
    pub fn new(addr: u32, data: Vec<u8>, file_offset: Option<u32>) -> Self {
        let mut segment = Self {
            addr,
            data,
            file_offset,
            include_in_checksum: true,
            name: None,
        };
        if addr != 0 {
            segment.pad_to_alignment(4);
        }
        segment
    }

    /// Create a segment carrying an ELF section name.
    pub fn named(name: impl Into<String>, addr: u32, data: Vec<u8>) -> Self {
        let mut segment = Self::new(addr, data, None);
        segment.name = Some(name.into());
        segment
    }

    /// Payload length.
    #[allow(clippy::cast_possible_truncation)]
    pub fn len(&self) -> u32 {
        self.data.len() as u32
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Zero-pad the payload to a multiple of `alignment`.
    pub fn pad_to_alignment(&mut self, alignment: usize) {
        let rem = self.data.len() % alignment;
        if rem != 0 {
            self.data.resize(self.data.len() + alignment - rem, 0);
        }
    }

    /// Move the first `len` bytes into a new segment, advancing this one.
    #[allow(clippy::cast_possible_truncation)]
    pub fn split_image(&mut self, len: usize) -> Self {
        let len = len.min(self.data.len());
        let rest = self.data.split_off(len);
        let head = std::mem::replace(&mut self.data, rest);
        let split = Self {
            addr: self.addr,
            data: head,
            file_offset: None,
            include_in_checksum: self.include_in_checksum,
            name: self.name.clone(),
        };
        self.addr = self.addr.wrapping_add(len as u32);
        self.file_offset = None;
        split
    }
}

impl fmt::Display for ImageSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "len 0x{:05x} load 0x{:08x}", self.data.len(), self.addr)?;
        if let Some(offset) = self.file_offset {
            write!(f, " file_offs 0x{offset:08x}")?;
        }
        if let Some(name) = &self.name {
            write!(f, " {name}")?;
        }
        Ok(())
    }
}

/// ESP32-family extended header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtendedHeader {
    /// Write-protect pin, [`WP_PIN_DISABLED`] when unused.
    pub wp_pin: u8,
    /// Drive strengths for CLK, Q, D, CS, HD and WP, one nibble each.
    pub drive: [u8; 6],
    /// Chip the image was built for.
    pub chip_id: u16,
    /// Legacy minimum revision.
    pub min_rev: u8,
    /// Minimum revision as `major * 100 + minor`.
    pub min_rev_full: u16,
    /// Maximum revision as `major * 100 + minor`.
    pub max_rev_full: u16,
    /// Whether a SHA-256 digest follows the checksum.
    pub append_digest: bool,
}

impl ExtendedHeader {
    /// Header for `chip_id` with digest and no revision limits.
    pub fn new(chip_id: u16) -> Self {
        Self {
            wp_pin: WP_PIN_DISABLED,
            drive: [0; 6],
            chip_id,
            min_rev: 0,
            min_rev_full: 0,
            max_rev_full: 0xFFFF,
            append_digest: true,
        }
    }

    fn read(cursor: &mut Cursor<&[u8]>, chip: Chip) -> Result<Self> {
        let mut raw = [0u8; EXTENDED_HEADER_LEN];
        cursor
            .read_exact(&mut raw)
            .map_err(eof("extended header"))?;
        let mut fields = Cursor::new(&raw[..]);
        let wp_pin = fields.read_u8().map_err(eof("extended header"))?;
        let mut drive = [0u8; 6];
        for pair in drive.chunks_mut(2) {
            let byte = fields.read_u8().map_err(eof("extended header"))?;
            pair[0] = byte & 0x0F;
            pair[1] = (byte >> 4) & 0x0F;
        }
        let chip_id = fields
            .read_u16::<LittleEndian>()
            .map_err(eof("extended header"))?;
        let min_rev = fields.read_u8().map_err(eof("extended header"))?;
        let min_rev_full = fields
            .read_u16::<LittleEndian>()
            .map_err(eof("extended header"))?;
        let max_rev_full = fields
            .read_u16::<LittleEndian>()
            .map_err(eof("extended header"))?;

        let expected = chip.profile().image_chip_id;
        if expected.is_some_and(|id| id != chip_id) {
            warn!(
                "Unexpected chip id in image. Expected {} but value was {chip_id}. Is this image for a different chip model?",
                expected.unwrap_or_default()
            );
        }
        if raw[11..15].iter().any(|b| *b != 0) {
            warn!(
                "Some reserved header fields have non-zero values. This image may be from a newer tool version."
            );
        }
        let append_digest = match raw[15] {
            0 => false,
            1 => true,
            other => {
                return Err(ImageError::Invalid(format!(
                    "Invalid value for append_digest field (0x{other:02x}). Should be 0 or 1."
                ))
                .into());
            },
        };

        Ok(Self {
            wp_pin,
            drive,
            chip_id,
            min_rev,
            min_rev_full,
            max_rev_full,
            append_digest,
        })
    }

    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    fn write(&self, out: &mut Vec<u8>) {
        out.push(self.wp_pin);
        for pair in self.drive.chunks(2) {
            out.push((pair[0] & 0x0F) | ((pair[1] & 0x0F) << 4));
        }
        out.write_u16::<LittleEndian>(self.chip_id).unwrap();
        out.push(self.min_rev);
        out.write_u16::<LittleEndian>(self.min_rev_full).unwrap();
        out.write_u16::<LittleEndian>(self.max_rev_full).unwrap();
        out.extend_from_slice(&[0; 4]);
        out.push(u8::from(self.append_digest));
    }
}

/// A firmware image as the ROM bootloader consumes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    /// Chip family whose layout rules apply.
    pub chip: Chip,
    /// Segments in file order.
    pub segments: Vec<ImageSegment>,
    /// Entry address, 0 when unset.
    pub entrypoint: u32,
    /// Flash mode header byte.
    pub flash_mode: u8,
    /// Flash size (high nibble) and frequency (low nibble).
    pub flash_size_freq: u8,
    /// Checksum stored in the file, when loaded from one.
    pub checksum: Option<u8>,
    /// Extended header, ESP32 family only.
    pub extended: Option<ExtendedHeader>,
    /// Digest stored in the file.
    pub stored_digest: Option<Vec<u8>>,
    /// Digest computed over the file as loaded.
    pub calc_digest: Option<Vec<u8>>,
    /// Bytes covered by the digest, when loaded from a file with one.
    pub data_length: Option<usize>,
}

impl FirmwareImage {
    /// An empty image for `chip`.
    pub fn new(chip: Chip) -> Self {
        let profile = chip.profile();
        let extended = match profile.image_format {
            ImageFormat::Esp32 => Some(ExtendedHeader::new(
                profile.image_chip_id.unwrap_or_default(),
            )),
            ImageFormat::Esp8266 => None,
        };
        Self {
            chip,
            segments: Vec::new(),
            entrypoint: 0,
            flash_mode: FlashMode::Qio.code(),
            flash_size_freq: 0,
            checksum: None,
            extended,
            stored_digest: None,
            calc_digest: None,
            data_length: None,
        }
    }

    /// Parse an image file.
    #[allow(clippy::cast_possible_truncation)]
    pub fn from_bytes(chip: Chip, bytes: &[u8]) -> Result<Self> {
        let profile = chip.profile();
        let mut cursor = Cursor::new(bytes);

        let magic = cursor.read_u8().map_err(eof("header"))?;
        if magic != ESP_IMAGE_MAGIC {
            return Err(ImageError::BadMagic(magic).into());
        }
        let segment_count = cursor.read_u8().map_err(eof("header"))?;
        if usize::from(segment_count) > MAX_SEGMENTS {
            return Err(ImageError::SegmentCount(usize::from(segment_count)).into());
        }
        let flash_mode = cursor.read_u8().map_err(eof("header"))?;
        let flash_size_freq = cursor.read_u8().map_err(eof("header"))?;
        let entrypoint = cursor
            .read_u32::<LittleEndian>()
            .map_err(eof("header"))?;

        let extended = match profile.image_format {
            ImageFormat::Esp32 => Some(ExtendedHeader::read(&mut cursor, chip)?),
            ImageFormat::Esp8266 => None,
        };

        let mut segments = Vec::with_capacity(usize::from(segment_count));
        for _ in 0..segment_count {
            let offset = cursor.position() as u32;
            let addr = cursor
                .read_u32::<LittleEndian>()
                .map_err(eof("segment header"))?;
            let size = cursor
                .read_u32::<LittleEndian>()
                .map_err(eof("segment header"))?;
            let start = cursor.position() as usize;
            let available = bytes.len().saturating_sub(start);
            if (size as usize) > available {
                return Err(ImageError::Truncated(format!(
                    "end of file reading segment 0x{addr:x}, length {size} (actual length {available})"
                ))
                .into());
            }
            let data = bytes[start..start + size as usize].to_vec();
            cursor.set_position((start + size as usize) as u64);

            if profile.image_format == ImageFormat::Esp8266
                && (addr > 0x4020_0000 || addr < 0x3FFE_0000 || size > 65536)
            {
                warn!("Suspicious segment 0x{addr:x}, length {size}");
            }
            segments.push(ImageSegment::new(addr, data, Some(offset)));
        }

        // The checksum is the last byte of a 16-byte aligned block.
        let position = cursor.position();
        cursor.set_position(position + 15 - position % 16);
        let checksum = cursor.read_u8().map_err(eof("checksum"))?;

        let (stored_digest, calc_digest, data_length) = match extended {
            Some(ext) if ext.append_digest => {
                let end = cursor.position() as usize;
                let mut stored = vec![0u8; DIGEST_LEN];
                cursor
                    .read_exact(&mut stored)
                    .map_err(eof("SHA-256 digest"))?;
                (
                    Some(stored),
                    Some(Sha256::digest(&bytes[..end]).to_vec()),
                    Some(end),
                )
            },
            _ => (None, None, None),
        };

        let image = Self {
            chip,
            segments,
            entrypoint,
            flash_mode,
            flash_size_freq,
            checksum: Some(checksum),
            extended,
            stored_digest,
            calc_digest,
            data_length,
        };
        image.verify()?;
        Ok(image)
    }

    /// Read and parse an image file from disk.
    pub fn from_file<P: AsRef<Path>>(chip: Chip, path: P) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(chip, &bytes)
    }

    /// Guess the chip an image was built for from its extended header.
    ///
    /// Images without a known chip ID are taken to be ESP8266 images.
    pub fn guess_chip(bytes: &[u8]) -> Option<Chip> {
        if bytes.first() != Some(&ESP_IMAGE_MAGIC) {
            return None;
        }
        let id = bytes
            .get(12..14)
            .map(|b| u16::from_le_bytes([b[0], b[1]]));
        Some(
            id.and_then(Chip::from_image_chip_id)
                .unwrap_or(Chip::Esp8266),
        )
    }

    /// Structural checks a bootloader would trip over.
    pub fn verify(&self) -> Result<()> {
        if self.segments.len() > MAX_SEGMENTS {
            return Err(ImageError::SegmentCount(self.segments.len()).into());
        }
        Ok(())
    }

    /// Checksum over every checksummed segment.
    pub fn calculate_checksum(&self) -> u8 {
        self.segments
            .iter()
            .filter(|s| s.include_in_checksum)
            .fold(CHECKSUM_SEED, |acc, s| checksum_from(acc, &s.data))
    }

    /// Whether the stored digest matches the file, if one is appended.
    pub fn digest_valid(&self) -> Option<bool> {
        match (&self.stored_digest, &self.calc_digest) {
            (Some(stored), Some(calc)) => Some(stored == calc),
            _ => None,
        }
    }

    /// Merge segments that are contiguous, share a memory type and share
    /// checksum inclusion.
    pub fn merge_adjacent_segments(&mut self) {
        let profile = self.chip.profile();
        let mut remaining = std::mem::take(&mut self.segments);
        let mut merged = Vec::with_capacity(remaining.len());
        // Walk backwards so each earlier segment absorbs its already-merged
        // successor.
        while let Some(next) = remaining.pop() {
            match remaining.last_mut() {
                Some(prev)
                    if profile.memory_types(prev.addr) == profile.memory_types(next.addr)
                        && prev.include_in_checksum == next.include_in_checksum
                        && u64::from(next.addr)
                            == u64::from(prev.addr) + prev.data.len() as u64 =>
                {
                    prev.data.extend_from_slice(&next.data);
                },
                _ => merged.push(next),
            }
        }
        merged.reverse();
        self.segments = merged;
    }

    /// Serialize the image.
    ///
    /// For ESP8266 this is the file written at offset 0, holding everything
    /// except the IROM segment (see [`Self::to_esp8266_parts`]).
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        match self.chip.profile().image_format {
            ImageFormat::Esp32 => self.to_esp32_bytes(),
            ImageFormat::Esp8266 => {
                let parts = self.to_esp8266_parts()?;
                Ok(parts
                    .into_iter()
                    .find(|(offset, _)| *offset == 0)
                    .map(|(_, data)| data)
                    .unwrap_or_default())
            },
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn to_esp32_bytes(&self) -> Result<Vec<u8>> {
        self.verify()?;
        let profile = self.chip.profile();
        let extended = self.extended.unwrap_or_else(|| {
            ExtendedHeader::new(profile.image_chip_id.unwrap_or_default())
        });

        let mut out = Vec::new();
        self.write_common_header(&mut out, self.segments.len());
        extended.write(&mut out);

        let mut sorted = self.segments.clone();
        sorted.sort_by_key(|s| s.addr);
        let (flash, ram): (Vec<_>, Vec<_>) = sorted
            .into_iter()
            .partition(|s| profile.is_flash_address(s.addr));

        for pair in flash.windows(2) {
            if pair[1].addr / IROM_ALIGN == pair[0].addr / IROM_ALIGN {
                return Err(ImageError::FlashMappingOverlap {
                    first: pair[0].addr,
                    second: pair[1].addr,
                }
                .into());
            }
        }

        let mut flash: VecDeque<ImageSegment> = flash.into();
        let mut ram: VecDeque<ImageSegment> = ram.into();
        let mut checksum = CHECKSUM_SEED;
        let mut total_segments = 0usize;

        while let Some(addr) = flash.front().map(|s| s.addr) {
            if let Some(pad_len) = alignment_padding(addr, out.len()) {
                // Fill the gap with RAM data where possible so no bytes are
                // wasted on a zero segment.
                let pad = match ram.front_mut() {
                    Some(first) if pad_len > SEG_HEADER_LEN as usize => {
                        let head = first.split_image(pad_len);
                        if first.is_empty() {
                            ram.pop_front();
                        }
                        head
                    },
                    _ => ImageSegment::new(0, vec![0; pad_len], Some(out.len() as u32)),
                };
                checksum = write_segment(&mut out, &pad, checksum);
            } else if let Some(mut segment) = flash.pop_front() {
                if self.chip == Chip::Esp32 {
                    let end = (out.len() + segment.data.len()) as u32 + SEG_HEADER_LEN;
                    let tail = end % IROM_ALIGN;
                    if tail < MMU_PAGE_TAIL_MIN {
                        let padded = segment.data.len() + (MMU_PAGE_TAIL_MIN - tail) as usize;
                        segment.data.resize(padded, 0);
                    }
                }
                checksum = write_segment(&mut out, &segment, checksum);
            }
            total_segments += 1;
        }
        for segment in &ram {
            checksum = write_segment(&mut out, segment, checksum);
            total_segments += 1;
        }

        // Padding segments count against the limit too.
        if total_segments > MAX_SEGMENTS {
            return Err(ImageError::SegmentCount(total_segments).into());
        }
        append_checksum(&mut out, checksum);
        // The header count includes padding segments and is not checksummed.
        out[1] = total_segments as u8;

        if extended.append_digest {
            let digest = Sha256::digest(&out);
            out.extend_from_slice(&digest);
        }
        Ok(out)
    }

    /// ESP8266 output files as `(flash offset, contents)`.
    ///
    /// The IROM segment is written raw at its offset into flash; everything
    /// else goes into a V1 image at offset 0.
    pub fn to_esp8266_parts(&self) -> Result<Vec<(u32, Vec<u8>)>> {
        self.verify()?;
        let profile = self.chip.profile();
        let (irom, normal): (Vec<_>, Vec<_>) = self
            .segments
            .iter()
            .partition(|s| profile.is_flash_address(s.addr));
        if irom.len() > 1 {
            return Err(ImageError::Invalid(format!(
                "Found {} segments that could be irom0. Bad ELF file?",
                irom.len()
            ))
            .into());
        }

        let mut main = Vec::new();
        self.write_common_header(&mut main, normal.len());
        let mut checksum = CHECKSUM_SEED;
        for segment in &normal {
            checksum = write_segment(&mut main, segment, checksum);
        }
        append_checksum(&mut main, checksum);

        let mut parts = vec![(0, main)];
        if let Some(segment) = irom.first() {
            parts.push((segment.addr - profile.irom_map.0, segment.data.clone()));
        }
        Ok(parts)
    }

    /// Write the image to disk and return the files created.
    ///
    /// For ESP32-family chips `output` is the file name. For ESP8266 it is a
    /// prefix and one file per part is written as `<prefix>0xNNNNN.bin`.
    pub fn save<P: AsRef<Path>>(&self, output: P) -> Result<Vec<PathBuf>> {
        let output = output.as_ref();
        match self.chip.profile().image_format {
            ImageFormat::Esp32 => {
                std::fs::write(output, self.to_esp32_bytes()?)?;
                Ok(vec![output.to_path_buf()])
            },
            ImageFormat::Esp8266 => {
                let prefix = output.to_string_lossy();
                let mut written = Vec::new();
                for (offset, data) in self.to_esp8266_parts()? {
                    let path = PathBuf::from(format!("{prefix}0x{offset:05x}.bin"));
                    std::fs::write(&path, data)?;
                    written.push(path);
                }
                Ok(written)
            },
        }
    }

    /// Human-readable summary of the header, segments and integrity checks.
    pub fn info(&self) -> String {
        let profile = self.chip.profile();
        let mut lines = Vec::new();

        lines.push(format!("Image chip: {}", profile.name));
        if self.entrypoint != 0 {
            lines.push(format!("Entry point: {:08x}", self.entrypoint));
        } else {
            lines.push("Entry point not set".to_string());
        }

        let size = profile
            .flash_size_name(self.flash_size_freq & 0xF0)
            .unwrap_or("unknown");
        let freq = FlashFreq::from_code(self.flash_size_freq)
            .map_or_else(|| "unknown".to_string(), |f| f.to_string());
        let mode = FlashMode::from_code(self.flash_mode)
            .map_or_else(|| format!("0x{:02x}", self.flash_mode), |m| m.to_string());
        lines.push(format!("Flash size: {size}, freq: {freq}, mode: {mode}"));

        if let Some(ext) = &self.extended {
            lines.push(format!("Chip ID: {}", ext.chip_id));
            lines.push(format!(
                "Minimal chip revision: v{}.{}, (legacy min_rev = {})",
                ext.min_rev_full / 100,
                ext.min_rev_full % 100,
                ext.min_rev
            ));
            lines.push(format!(
                "Maximal chip revision: v{}.{}",
                ext.max_rev_full / 100,
                ext.max_rev_full % 100
            ));
            if ext.wp_pin != WP_PIN_DISABLED {
                lines.push(format!("WP pin: {}", ext.wp_pin));
            }
        }

        lines.push(format!("{} segments", self.segments.len()));
        lines.push(String::new());
        for (idx, segment) in self.segments.iter().enumerate() {
            lines.push(format!(
                "Segment {}: {} [{}]",
                idx + 1,
                segment,
                profile.memory_types(segment.addr).join(",")
            ));
        }

        let calculated = self.calculate_checksum();
        match self.checksum {
            Some(stored) if stored == calculated => {
                lines.push(format!("Checksum: {stored:02x} (valid)"));
            },
            Some(stored) => lines.push(format!(
                "Checksum: {stored:02x} (invalid - calculated {calculated:02x})"
            )),
            None => lines.push(format!("Checksum: {calculated:02x} (calculated)")),
        }

        if let Some(ext) = &self.extended {
            if !ext.append_digest {
                lines.push("Validation Hash: Not appended".to_string());
            } else if let (Some(calc), Some(valid)) = (&self.calc_digest, self.digest_valid()) {
                lines.push(format!(
                    "Validation Hash: {} ({})",
                    crate::protocol::slip::hex(calc),
                    if valid { "valid" } else { "invalid" }
                ));
            }
        }
        lines.join("\n")
    }

    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    #[allow(clippy::cast_possible_truncation)]
    fn write_common_header(&self, out: &mut Vec<u8>, segment_count: usize) {
        out.push(ESP_IMAGE_MAGIC);
        out.push(segment_count as u8);
        out.push(self.flash_mode);
        out.push(self.flash_size_freq);
        out.write_u32::<LittleEndian>(self.entrypoint).unwrap();
    }
}

/// Padding segment length needed before a flash segment loaded at `addr`,
/// given the current file position. `None` means the segment is aligned.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn alignment_padding(addr: u32, position: usize) -> Option<usize> {
    let align = i64::from(IROM_ALIGN);
    let header = i64::from(SEG_HEADER_LEN);
    let align_past = i64::from(addr % IROM_ALIGN) - header;
    let mut pad = (align - position as i64 % align) + align_past;
    if pad == 0 || pad == align {
        return None;
    }
    // The padding segment needs a header of its own.
    pad -= header;
    if pad < 0 {
        pad += align;
    }
    Some(pad as usize)
}

#[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
fn write_segment(out: &mut Vec<u8>, segment: &ImageSegment, checksum: u8) -> u8 {
    out.write_u32::<LittleEndian>(segment.addr).unwrap();
    out.write_u32::<LittleEndian>(segment.len()).unwrap();
    out.extend_from_slice(&segment.data);
    checksum_from(checksum, &segment.data)
}

fn append_checksum(out: &mut Vec<u8>, checksum: u8) {
    let padded = out.len() + 15 - out.len() % 16;
    out.resize(padded, 0);
    out.push(checksum);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn esp32_image() -> FirmwareImage {
        let mut image = FirmwareImage::new(Chip::Esp32);
        image.entrypoint = 0x4008_0400;
        image.segments = vec![
            ImageSegment::new(0x3F40_0020, vec![0x11; 0x120], None),
            ImageSegment::new(0x3FFB_0000, vec![0x22; 0x2000], None),
            ImageSegment::new(0x4008_0000, vec![0x33; 0x400], None),
            ImageSegment::new(0x400D_0020, vec![0x44; 0x800], None),
        ];
        image
    }

    #[test]
    fn test_segment_padding_and_split() {
        let mut segment = ImageSegment::new(0x4000_0000, vec![1, 2, 3, 4, 5], None);
        assert_eq!(segment.len(), 8);

        let zero = ImageSegment::new(0, vec![1, 2, 3], None);
        assert_eq!(zero.len(), 3);

        let head = segment.split_image(3);
        assert_eq!(head.addr, 0x4000_0000);
        assert_eq!(head.data, vec![1, 2, 3]);
        assert_eq!(segment.addr, 0x4000_0003);
        assert_eq!(segment.data, vec![4, 5, 0, 0, 0]);
    }

    #[test]
    fn test_merge_adjacent_sections() {
        let mut image = FirmwareImage::new(Chip::Esp32);
        image.segments = vec![
            ImageSegment::new(0x1000, vec![0xAA; 0x10], None),
            ImageSegment::new(0x1010, vec![0xBB; 0x20], None),
        ];
        image.merge_adjacent_segments();
        assert_eq!(image.segments.len(), 1);
        assert_eq!(image.segments[0].addr, 0x1000);
        assert_eq!(image.segments[0].len(), 0x30);
        assert_eq!(image.segments[0].data[0x10], 0xBB);
    }

    #[test]
    fn test_merge_keeps_gaps_and_regions_apart() {
        let mut image = FirmwareImage::new(Chip::Esp32);
        let mut excluded = ImageSegment::new(0x3FFB_0010, vec![3; 0x10], None);
        excluded.include_in_checksum = false;
        image.segments = vec![
            ImageSegment::new(0x3FFB_0000, vec![1; 0x10], None),
            excluded,
            ImageSegment::new(0x3FFB_0100, vec![2; 0x10], None),
            ImageSegment::new(0x3FFB_0110, vec![4; 0x10], None),
        ];
        image.merge_adjacent_segments();
        let layout: Vec<_> = image.segments.iter().map(|s| (s.addr, s.len())).collect();
        assert_eq!(
            layout,
            vec![(0x3FFB_0000, 0x10), (0x3FFB_0010, 0x10), (0x3FFB_0100, 0x20)]
        );
    }

    #[test]
    fn test_verify_rejects_too_many_segments() {
        let mut image = FirmwareImage::new(Chip::Esp32);
        for i in 0..17u32 {
            image
                .segments
                .push(ImageSegment::new(0x3FFB_0000 + i * 0x100, vec![0; 4], None));
        }
        assert!(matches!(
            image.verify(),
            Err(Error::Image(ImageError::SegmentCount(17)))
        ));
        image.segments.pop();
        assert!(image.verify().is_ok());
    }

    #[test]
    fn test_seventeen_segments_rejected_both_ways() {
        let mut image = FirmwareImage::new(Chip::Esp8266);
        for i in 0..17u32 {
            image
                .segments
                .push(ImageSegment::new(0x3FFE_8000 + i * 0x10, vec![0; 4], None));
        }
        assert!(matches!(
            image.to_bytes(),
            Err(Error::Image(ImageError::SegmentCount(17)))
        ));
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            image.save(dir.path().join("app")),
            Err(Error::Image(ImageError::SegmentCount(17)))
        ));
        let esp32 = FirmwareImage {
            chip: Chip::Esp32,
            ..image.clone()
        };
        assert!(matches!(
            esp32.to_bytes(),
            Err(Error::Image(ImageError::SegmentCount(17)))
        ));

        // Hand-built V1 image claiming 17 segments.
        let mut bytes = vec![ESP_IMAGE_MAGIC, 17, 0, 0];
        bytes.extend_from_slice(&0x4010_0004u32.to_le_bytes());
        for segment in &image.segments {
            bytes.extend_from_slice(&segment.addr.to_le_bytes());
            bytes.extend_from_slice(&4u32.to_le_bytes());
            bytes.extend_from_slice(&segment.data);
        }
        bytes.resize(bytes.len() + 16, 0);
        for chip in [Chip::Esp8266, Chip::Esp32] {
            assert!(matches!(
                FirmwareImage::from_bytes(chip, &bytes),
                Err(Error::Image(ImageError::SegmentCount(17)))
            ));
        }
    }

    #[test]
    fn test_save_aligns_flash_segments() {
        let image = esp32_image();
        let bytes = image.to_bytes().unwrap();
        let loaded = FirmwareImage::from_bytes(Chip::Esp32, &bytes).unwrap();
        let profile = Chip::Esp32.profile();

        let mut flash_seen = 0;
        for segment in &loaded.segments {
            if profile.is_flash_address(segment.addr) {
                let offset = segment.file_offset.unwrap();
                assert_eq!(
                    (offset + SEG_HEADER_LEN) % IROM_ALIGN,
                    segment.addr % IROM_ALIGN,
                    "segment at 0x{:08x}",
                    segment.addr
                );
                flash_seen += 1;
            }
        }
        assert_eq!(flash_seen, 2);
        assert_eq!(usize::from(bytes[1]), loaded.segments.len());
        assert_eq!(loaded.checksum, Some(loaded.calculate_checksum()));
        assert_eq!(loaded.digest_valid(), Some(true));
        assert!(loaded.verify().is_ok());
    }

    #[test]
    fn test_save_pads_short_mmu_tail() {
        let mut image = FirmwareImage::new(Chip::Esp32);
        // Header at 0x18, data at 0x20; the data ends 8 bytes into the next page.
        image.segments = vec![ImageSegment::new(0x3F40_0020, vec![0x55; 0xFFE8], None)];
        let bytes = image.to_bytes().unwrap();
        let loaded = FirmwareImage::from_bytes(Chip::Esp32, &bytes).unwrap();
        let segment = &loaded.segments[0];
        let end = segment.file_offset.unwrap() + SEG_HEADER_LEN + segment.len();
        assert!(end % IROM_ALIGN >= MMU_PAGE_TAIL_MIN);
    }

    #[test]
    fn test_flash_mapping_overlap() {
        let mut image = FirmwareImage::new(Chip::Esp32);
        image.segments = vec![
            ImageSegment::new(0x400D_0020, vec![0; 0x10], None),
            ImageSegment::new(0x400D_8000, vec![0; 0x10], None),
        ];
        assert!(matches!(
            image.to_bytes(),
            Err(Error::Image(ImageError::FlashMappingOverlap {
                first: 0x400D_0020,
                second: 0x400D_8000
            }))
        ));
    }

    #[test]
    fn test_load_detects_corruption() {
        let mut bytes = esp32_image().to_bytes().unwrap();
        let checksum_pos = bytes.len() - DIGEST_LEN - 1;
        bytes[checksum_pos] ^= 0xFF;
        let loaded = FirmwareImage::from_bytes(Chip::Esp32, &bytes).unwrap();
        assert_ne!(loaded.checksum, Some(loaded.calculate_checksum()));
        assert_eq!(loaded.digest_valid(), Some(false));
        assert!(loaded.info().contains("invalid - calculated"));
    }

    #[test]
    fn test_guess_chip() {
        let bytes = esp32_image().to_bytes().unwrap();
        assert_eq!(FirmwareImage::guess_chip(&bytes), Some(Chip::Esp32));

        let mut s3 = FirmwareImage::new(Chip::Esp32s3);
        s3.segments
            .push(ImageSegment::new(0x3FC8_8000, vec![0; 8], None));
        let bytes = s3.to_bytes().unwrap();
        assert_eq!(FirmwareImage::guess_chip(&bytes), Some(Chip::Esp32s3));

        assert_eq!(FirmwareImage::guess_chip(&[0xE9, 0, 0, 0]), Some(Chip::Esp8266));
        assert_eq!(FirmwareImage::guess_chip(b"\x7fELF"), None);
    }

    #[test]
    fn test_load_rejects_bad_input() {
        assert!(matches!(
            FirmwareImage::from_bytes(Chip::Esp32, &[0xE8, 0, 0, 0, 0, 0, 0, 0]),
            Err(Error::Image(ImageError::BadMagic(0xE8)))
        ));
        let bytes = esp32_image().to_bytes().unwrap();
        assert!(matches!(
            FirmwareImage::from_bytes(Chip::Esp32, &bytes[..40]),
            Err(Error::Image(ImageError::Truncated(_)))
        ));

        let mut bad_digest_flag = bytes.clone();
        bad_digest_flag[8 + 15] = 2;
        assert!(matches!(
            FirmwareImage::from_bytes(Chip::Esp32, &bad_digest_flag),
            Err(Error::Image(ImageError::Invalid(_)))
        ));
    }

    #[test]
    fn test_esp8266_parts() {
        let mut image = FirmwareImage::new(Chip::Esp8266);
        image.entrypoint = 0x4010_0004;
        image.segments = vec![
            ImageSegment::new(0x4010_0000, vec![0x10; 0x40], None),
            ImageSegment::new(0x3FFE_8000, vec![0x20; 0x20], None),
            ImageSegment::new(0x4021_0000, vec![0x30; 0x100], None),
        ];
        let parts = image.to_esp8266_parts().unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].0, 0);
        assert_eq!(parts[1].0, 0x10000);
        assert_eq!(parts[1].1.len(), 0x100);

        let main = FirmwareImage::from_bytes(Chip::Esp8266, &parts[0].1).unwrap();
        assert_eq!(main.segments.len(), 2);
        assert!(main.extended.is_none());
        assert_eq!(main.checksum, Some(main.calculate_checksum()));
        assert_eq!(main.entrypoint, 0x4010_0004);
    }

    #[test]
    fn test_esp8266_rejects_two_irom_segments() {
        let mut image = FirmwareImage::new(Chip::Esp8266);
        image.segments = vec![
            ImageSegment::new(0x4021_0000, vec![0; 4], None),
            ImageSegment::new(0x4022_0000, vec![0; 4], None),
        ];
        assert!(image.to_esp8266_parts().is_err());
    }

    #[test]
    fn test_save_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.bin");
        let written = esp32_image().save(&path).unwrap();
        assert_eq!(written, vec![path.clone()]);
        let loaded = FirmwareImage::from_file(Chip::Esp32, &path).unwrap();
        assert_eq!(loaded.entrypoint, 0x4008_0400);
    }

    #[test]
    fn test_info_lists_segments() {
        let bytes = esp32_image().to_bytes().unwrap();
        let info = FirmwareImage::from_bytes(Chip::Esp32, &bytes)
            .unwrap()
            .info();
        assert!(info.contains("Entry point: 40080400"));
        assert!(info.contains("[DROM]"));
        assert!(info.contains("Checksum:"));
        assert!(info.contains("(valid)"));
    }
}
