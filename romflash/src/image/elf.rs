//! ELF input and ELF to image conversion.
//!
//! Only 32-bit little-endian Xtensa and RISC-V executables are accepted.

use crate::error::{Error, ImageError, Result};
use crate::image::esp::{FirmwareImage, ImageSegment};
use crate::image::params::{FlashFreq, FlashMode};
use crate::target::chip::{Chip, ImageFormat};
use byteorder::{ByteOrder, LittleEndian};
use log::{info, warn};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

const ELF_MAGIC: &[u8; 4] = b"\x7fELF";
const LEN_FILE_HEADER: usize = 0x34;
const LEN_SEC_HEADER: usize = 0x28;
const LEN_SEG_HEADER: usize = 0x20;

const EM_XTENSA: u16 = 0x5E;
const EM_RISCV: u16 = 0xF3;

const SHT_PROGBITS: u32 = 0x01;
const SHT_STRTAB: u32 = 0x03;
const SHT_INIT_ARRAY: u32 = 0x0E;
const SHT_FINI_ARRAY: u32 = 0x0F;
const PROG_SEC_TYPES: [u32; 3] = [SHT_PROGBITS, SHT_INIT_ARRAY, SHT_FINI_ARRAY];

const PT_LOAD: u32 = 0x01;

/// A parsed ELF executable.
#[derive(Debug, Clone)]
pub struct ElfFile {
    name: String,
    /// Entry address.
    pub entrypoint: u32,
    /// Loadable sections with their names.
    pub sections: Vec<ImageSegment>,
    /// PT_LOAD program headers.
    pub segments: Vec<ImageSegment>,
    raw: Vec<u8>,
}

impl ElfFile {
    /// Read and parse an ELF file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read(path)?;
        Self::from_bytes(path.display().to_string(), raw)
    }

    /// Parse ELF bytes. `name` is used in error messages.
    pub fn from_bytes(name: impl Into<String>, raw: Vec<u8>) -> Result<Self> {
        let name = name.into();
        let elf_err = |reason: String| -> Error {
            ImageError::Elf {
                path: name.clone(),
                reason,
            }
            .into()
        };

        if raw.len() < LEN_FILE_HEADER {
            return Err(elf_err("file is too short for an ELF header".into()));
        }
        if &raw[..4] != ELF_MAGIC {
            return Err(elf_err("has invalid ELF magic header".into()));
        }
        let machine = LittleEndian::read_u16(&raw[0x12..]);
        if machine != EM_XTENSA && machine != EM_RISCV {
            return Err(elf_err(format!(
                "does not appear to be an Xtensa or an RISCV ELF file. e_machine={machine:04x}"
            )));
        }
        let entrypoint = LittleEndian::read_u32(&raw[0x18..]);
        let phoff = LittleEndian::read_u32(&raw[0x1C..]) as usize;
        let shoff = LittleEndian::read_u32(&raw[0x20..]) as usize;
        let phnum = usize::from(LittleEndian::read_u16(&raw[0x2C..]));
        let shentsize = usize::from(LittleEndian::read_u16(&raw[0x2E..]));
        let shnum = usize::from(LittleEndian::read_u16(&raw[0x30..]));
        let shstrndx = usize::from(LittleEndian::read_u16(&raw[0x32..]));

        if shentsize != LEN_SEC_HEADER {
            return Err(elf_err(format!(
                "has unexpected section header entry size 0x{shentsize:x} (not 0x{LEN_SEC_HEADER:x})"
            )));
        }
        if shnum == 0 {
            return Err(elf_err("has 0 section headers".into()));
        }

        let sections = read_sections(&raw, shoff, shnum, shstrndx).map_err(elf_err)?;
        let segments = read_segments(&raw, phoff, phnum).map_err(elf_err)?;

        Ok(Self {
            name,
            entrypoint,
            sections,
            segments,
            raw,
        })
    }

    /// Name the file was loaded under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// SHA-256 of the whole file.
    pub fn sha256(&self) -> [u8; 32] {
        Sha256::digest(&self.raw).into()
    }
}

fn slice(raw: &[u8], offset: usize, len: usize) -> Option<&[u8]> {
    raw.get(offset..offset.checked_add(len)?)
}

fn read_sections(
    raw: &[u8],
    offset: usize,
    count: usize,
    shstrndx: usize,
) -> std::result::Result<Vec<ImageSegment>, String> {
    struct Header {
        name: usize,
        kind: u32,
        addr: u32,
        offset: usize,
        size: usize,
    }

    let len = count * LEN_SEC_HEADER;
    let table = match raw.get(offset..) {
        Some(rest) if !rest.is_empty() => &rest[..rest.len().min(len)],
        _ => return Err(format!("No section header found at offset {offset:04x} in ELF file.")),
    };
    if table.len() != len {
        return Err(format!(
            "Only read 0x{:x} bytes from section header (expected 0x{len:x}.) Truncated ELF file?",
            table.len()
        ));
    }

    let headers: Vec<Header> = table
        .chunks_exact(LEN_SEC_HEADER)
        .map(|h| Header {
            name: LittleEndian::read_u32(&h[0..]) as usize,
            kind: LittleEndian::read_u32(&h[4..]),
            addr: LittleEndian::read_u32(&h[12..]),
            offset: LittleEndian::read_u32(&h[16..]) as usize,
            size: LittleEndian::read_u32(&h[20..]) as usize,
        })
        .collect();

    let strtab = headers
        .get(shstrndx)
        .ok_or_else(|| format!("ELF file has no STRTAB section at shstrndx {shstrndx}"))?;
    if strtab.kind != SHT_STRTAB {
        warn!(
            "ELF file has incorrect STRTAB section type 0x{:02x}",
            strtab.kind
        );
    }
    let strings = slice(raw, strtab.offset, strtab.size)
        .ok_or_else(|| "String table runs past the end of the file".to_string())?;
    let lookup = |offset: usize| -> String {
        let tail = strings.get(offset..).unwrap_or_default();
        let end = tail.iter().position(|b| *b == 0).unwrap_or(tail.len());
        String::from_utf8_lossy(&tail[..end]).into_owned()
    };

    headers
        .iter()
        .filter(|h| PROG_SEC_TYPES.contains(&h.kind) && h.addr != 0 && h.size > 0)
        .map(|h| {
            let name = lookup(h.name);
            let data = slice(raw, h.offset, h.size)
                .ok_or_else(|| format!("Section {name} runs past the end of the file"))?;
            Ok(ImageSegment::named(name, h.addr, data.to_vec()))
        })
        .collect()
}

fn read_segments(
    raw: &[u8],
    offset: usize,
    count: usize,
) -> std::result::Result<Vec<ImageSegment>, String> {
    if count == 0 {
        return Ok(Vec::new());
    }
    let len = count * LEN_SEG_HEADER;
    let table = slice(raw, offset, len).ok_or_else(|| {
        format!("Only read part of the segment header at 0x{offset:x} (expected 0x{len:x}.) Truncated ELF file?")
    })?;

    table
        .chunks_exact(LEN_SEG_HEADER)
        .filter_map(|h| {
            let kind = LittleEndian::read_u32(&h[0..]);
            let file_offset = LittleEndian::read_u32(&h[4..]) as usize;
            let paddr = LittleEndian::read_u32(&h[12..]);
            let size = LittleEndian::read_u32(&h[16..]) as usize;
            (kind == PT_LOAD && paddr != 0 && size > 0).then_some((file_offset, paddr, size))
        })
        .map(|(file_offset, paddr, size)| {
            let data = slice(raw, file_offset, size)
                .ok_or_else(|| format!("Segment at 0x{paddr:08x} runs past the end of the file"))?;
            Ok(ImageSegment::named("PHDR", paddr, data.to_vec()))
        })
        .collect()
}

/// Settings for [`elf2image`].
#[derive(Debug, Clone)]
pub struct Elf2ImageOptions {
    /// Target chip.
    pub chip: Chip,
    /// Flash mode written to the header.
    pub flash_mode: FlashMode,
    /// Flash frequency written to the header.
    pub flash_freq: FlashFreq,
    /// Flash size name, such as `4MB`.
    pub flash_size: String,
    /// Legacy minimum chip revision.
    pub min_rev: u8,
    /// Minimum revision as `major * 100 + minor`.
    pub min_rev_full: u16,
    /// Maximum revision as `major * 100 + minor`.
    pub max_rev_full: u16,
    /// Use program headers instead of sections.
    pub use_segments: bool,
    /// Append a SHA-256 digest (ESP32 family).
    pub append_digest: bool,
}

impl Elf2ImageOptions {
    /// Defaults for `chip`: qio, 40m, 1MB.
    pub fn new(chip: Chip) -> Self {
        Self {
            chip,
            flash_mode: FlashMode::Qio,
            flash_freq: FlashFreq::Freq40M,
            flash_size: "1MB".to_string(),
            min_rev: 0,
            min_rev_full: 0,
            max_rev_full: 0xFFFF,
            use_segments: false,
            append_digest: true,
        }
    }
}

/// Build a firmware image from an ELF file.
pub fn elf2image(elf: &ElfFile, options: &Elf2ImageOptions) -> Result<FirmwareImage> {
    let profile = options.chip.profile();
    let size_code = profile.flash_size_code(&options.flash_size).ok_or_else(|| {
        Error::Config(format!(
            "Flash size '{}' is not supported by {}",
            options.flash_size, profile.name
        ))
    })?;

    let mut image = FirmwareImage::new(options.chip);
    image.entrypoint = elf.entrypoint;
    image.flash_mode = options.flash_mode.code();
    image.flash_size_freq = size_code | options.flash_freq.code();
    if let Some(ext) = image.extended.as_mut() {
        ext.min_rev = options.min_rev;
        ext.min_rev_full = options.min_rev_full;
        ext.max_rev_full = options.max_rev_full;
        ext.append_digest = options.append_digest;
    }
    image.segments = if options.use_segments {
        elf.segments.clone()
    } else {
        elf.sections.clone()
    };

    let before = image.segments.len();
    image.merge_adjacent_segments();
    let delta = before - image.segments.len();
    if delta > 0 {
        info!(
            "Merged {delta} ELF section{}",
            if delta > 1 { "s" } else { "" }
        );
    }
    image.verify()?;
    Ok(image)
}

/// Default output location for an image built from `input`.
///
/// ESP32-family images replace the extension with `.bin`. ESP8266 output is
/// a prefix: `<input>-`.
pub fn default_output_name(chip: Chip, input: &Path) -> PathBuf {
    match chip.profile().image_format {
        ImageFormat::Esp32 => input.with_extension("bin"),
        ImageFormat::Esp8266 => {
            let mut prefix = input.as_os_str().to_owned();
            prefix.push("-");
            PathBuf::from(prefix)
        },
    }
}


#[cfg(test)]
mod tests {
    use super::testing::build_elf;
    use super::*;

    #[test]
    fn test_parse_sections_and_segments() {
        let raw = build_elf(
            EM_RISCV,
            0x4038_0080,
            &[
                (".iram0.text", 0x4038_0000, &[0x13; 0x40]),
                (".dram0.data", 0x3FC8_0000, &[0x55; 0x10]),
            ],
        );
        let elf = ElfFile::from_bytes("app.elf", raw.clone()).unwrap();
        assert_eq!(elf.entrypoint, 0x4038_0080);
        assert_eq!(elf.sections.len(), 2);
        assert_eq!(elf.sections[0].name.as_deref(), Some(".iram0.text"));
        assert_eq!(elf.sections[0].addr, 0x4038_0000);
        assert_eq!(elf.sections[1].data, vec![0x55; 0x10]);
        assert_eq!(elf.segments.len(), 2);
        assert_eq!(elf.sha256().to_vec(), Sha256::digest(&raw).to_vec());
    }

    #[test]
    fn test_rejects_foreign_elf() {
        let mut raw = build_elf(EM_XTENSA, 0, &[(".text", 0x4008_0000, &[0; 4])]);
        raw[0x12] = 0x28;
        let err = ElfFile::from_bytes("arm.elf", raw).unwrap_err();
        assert!(err.to_string().contains("Xtensa or an RISCV"));
        assert!(err.to_string().starts_with("arm.elf: "));

        let err = ElfFile::from_bytes("junk", vec![0u8; 64]).unwrap_err();
        assert!(err.to_string().contains("invalid ELF magic"));
    }

    #[test]
    fn test_rejects_truncated_section_table() {
        let raw = build_elf(EM_XTENSA, 0, &[(".text", 0x4008_0000, &[0; 4])]);
        let cut = raw[..raw.len() - 8].to_vec();
        let err = ElfFile::from_bytes("cut.elf", cut).unwrap_err();
        assert!(err.to_string().contains("Truncated ELF file?"));
    }

    #[test]
    fn test_elf2image_merges_and_sets_header() {
        let raw = build_elf(
            EM_XTENSA,
            0x4008_0400,
            &[
                (".iram0.vectors", 0x4008_0000, &[1; 0x400]),
                (".iram0.text", 0x4008_0400, &[2; 0x100]),
                (".flash.rodata", 0x3F40_0020, &[3; 0x40]),
            ],
        );
        let elf = ElfFile::from_bytes("app.elf", raw).unwrap();
        let mut options = Elf2ImageOptions::new(Chip::Esp32);
        options.flash_mode = FlashMode::Dio;
        options.flash_size = "4MB".into();
        let image = elf2image(&elf, &options).unwrap();

        assert_eq!(image.segments.len(), 2);
        assert_eq!(image.segments[0].len(), 0x500);
        assert_eq!(image.flash_mode, 2);
        assert_eq!(image.flash_size_freq, 0x20);
        assert_eq!(image.entrypoint, 0x4008_0400);

        let bytes = image.to_bytes().unwrap();
        let loaded = FirmwareImage::from_bytes(Chip::Esp32, &bytes).unwrap();
        assert_eq!(loaded.digest_valid(), Some(true));
    }

    #[test]
    fn test_elf2image_rejects_unknown_size() {
        let raw = build_elf(EM_XTENSA, 0, &[(".text", 0x4010_0000, &[0; 4])]);
        let elf = ElfFile::from_bytes("app.elf", raw).unwrap();
        let mut options = Elf2ImageOptions::new(Chip::Esp8266);
        options.flash_size = "32MB".into();
        assert!(matches!(elf2image(&elf, &options), Err(Error::Config(_))));
    }

    #[test]
    fn test_default_output_name() {
        assert_eq!(
            default_output_name(Chip::Esp32c3, Path::new("build/app.elf")),
            PathBuf::from("build/app.bin")
        );
        assert_eq!(
            default_output_name(Chip::Esp8266, Path::new("app.elf")),
            PathBuf::from("app.elf-")
        );
    }
}
