//! # PE Image Parser
//!
//! Reconstructs sections and named exports of an image that is already mapped
//! in the debuggee, reading its headers straight out of target memory.
//!
//! Header structures come from [`object::pe`]; they are read into local
//! buffers and decoded with [`object::pod::from_bytes`], so nothing here
//! depends on the file on disk.
//!
//! ## Walk
//!
//! 1. `IMAGE_DOS_HEADER`: `MZ` signature and `e_lfanew`
//! 2. `PE\0\0` signature and `IMAGE_FILE_HEADER`
//! 3. Section table (right after the optional header)
//! 4. Optional header magic (PE32 or PE32+) and the export data directory
//! 5. `IMAGE_EXPORT_DIRECTORY`, name and function RVA arrays, export names
//!
//! Every step only appends to the caller's section list, so when a step fails
//! whatever was recovered before it stays usable.

use std::mem::size_of;

use object::pe::{
    ImageDataDirectory, ImageDosHeader, ImageExportDirectory, ImageFileHeader, ImageOptionalHeader32,
    ImageOptionalHeader64, ImageSectionHeader, IMAGE_DIRECTORY_ENTRY_EXPORT, IMAGE_DOS_SIGNATURE,
    IMAGE_NT_OPTIONAL_HDR32_MAGIC, IMAGE_NT_OPTIONAL_HDR64_MAGIC, IMAGE_NT_SIGNATURE,
};
use object::pod::{from_bytes, Pod};
use object::LittleEndian as LE;
use thiserror::Error;
use tracing::trace;

use super::{Section, Symbol};
use crate::memory::TargetMemory;
use crate::types::Address;

/// Longest export name we are willing to read.
const MAX_NAME_LEN: usize = 4096;
const NAME_CHUNK: usize = 64;

/// Upper bound on export-table entries, to survive corrupt headers.
const MAX_EXPORTS: usize = 1 << 20;

/// Why an image could not be parsed (completely)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ImageError
{
    /// The image does not start with `MZ`
    #[error("bad DOS signature 0x{0:04x}")]
    BadDosSignature(u16),

    /// `e_lfanew` does not point at `PE\0\0`
    #[error("bad NT signature 0x{0:08x}")]
    BadNtSignature(u32),

    /// Optional header is neither PE32 nor PE32+
    #[error("unknown optional header magic 0x{0:04x}")]
    UnknownOptionalMagic(u16),

    /// A header or table could not be read completely
    #[error("truncated {what} at {address}")]
    Truncated
    {
        /// Structure being read
        what: &'static str,
        /// Where it was read from
        address: Address,
    },

    /// An export name has no terminator within the length limit
    #[error("unterminated export name at {0}")]
    UnterminatedName(Address),

    /// A table claims an absurd number of entries
    #[error("{what} count {count} exceeds limit")]
    TooManyEntries
    {
        /// Table name
        what: &'static str,
        /// Claimed entry count
        count: usize,
    },
}

type ImageResult<T> = Result<T, ImageError>;

/// Parser over one mapped image
pub(crate) struct ImageParser<'a>
{
    memory: &'a TargetMemory,
    base: Address,
}

impl<'a> ImageParser<'a>
{
    pub(crate) fn new(memory: &'a TargetMemory, base: Address) -> Self
    {
        Self { memory, base }
    }

    /// Parse headers, appending sections (with their symbols) to `sections`.
    pub(crate) fn parse_into(&self, sections: &mut Vec<Section>) -> ImageResult<()>
    {
        let dos: ImageDosHeader = self.read_pod(0, "DOS header")?;
        let magic = dos.e_magic.get(LE);
        if magic != IMAGE_DOS_SIGNATURE {
            return Err(ImageError::BadDosSignature(magic));
        }

        let nt_offset = u64::from(dos.e_lfanew.get(LE));
        let signature: [u8; 4] = self.read_array(nt_offset, "NT signature")?;
        let signature = u32::from_le_bytes(signature);
        if signature != IMAGE_NT_SIGNATURE {
            return Err(ImageError::BadNtSignature(signature));
        }

        let file_header_offset = nt_offset + 4;
        let file_header: ImageFileHeader = self.read_pod(file_header_offset, "file header")?;
        let optional_offset = file_header_offset + size_of::<ImageFileHeader>() as u64;
        let optional_size = u64::from(file_header.size_of_optional_header.get(LE));
        trace!(
            base = %self.base,
            sections = file_header.number_of_sections.get(LE),
            characteristics = file_header.characteristics.get(LE),
            "parsing image headers"
        );

        self.parse_sections(
            optional_offset + optional_size,
            usize::from(file_header.number_of_sections.get(LE)),
            sections,
        )?;

        if let Some(exports) = self.export_directory(optional_offset)? {
            self.parse_exports(exports, sections)?;
        }
        Ok(())
    }

    fn parse_sections(&self, table_offset: u64, count: usize, sections: &mut Vec<Section>) -> ImageResult<()>
    {
        let entry_size = size_of::<ImageSectionHeader>() as u64;
        for index in 0..count as u64 {
            let header: ImageSectionHeader = self.read_pod(table_offset + index * entry_size, "section header")?;
            let name_len = header.name.iter().position(|&b| b == 0).unwrap_or(header.name.len());
            let name = String::from_utf8_lossy(&header.name[..name_len]).into_owned();
            let base = self.base.rebase(u64::from(header.virtual_address.get(LE)));
            let size = u64::from(header.size_of_raw_data.get(LE));

            trace!(%name, %base, size, "section");
            sections.push(Section::new(name, base, size, self.memory.clone()));
        }
        Ok(())
    }

    /// Locate the export directory, if the image has one.
    fn export_directory(&self, optional_offset: u64) -> ImageResult<Option<ImageDataDirectory>>
    {
        let magic: [u8; 2] = self.read_array(optional_offset, "optional header")?;
        let (directories_offset, directory_count) = match u16::from_le_bytes(magic) {
            IMAGE_NT_OPTIONAL_HDR32_MAGIC => {
                let header: ImageOptionalHeader32 = self.read_pod(optional_offset, "PE32 optional header")?;
                (
                    optional_offset + size_of::<ImageOptionalHeader32>() as u64,
                    header.number_of_rva_and_sizes.get(LE),
                )
            }
            IMAGE_NT_OPTIONAL_HDR64_MAGIC => {
                let header: ImageOptionalHeader64 = self.read_pod(optional_offset, "PE32+ optional header")?;
                (
                    optional_offset + size_of::<ImageOptionalHeader64>() as u64,
                    header.number_of_rva_and_sizes.get(LE),
                )
            }
            other => return Err(ImageError::UnknownOptionalMagic(other)),
        };

        if directory_count as usize <= IMAGE_DIRECTORY_ENTRY_EXPORT {
            return Ok(None);
        }
        let offset = directories_offset + (IMAGE_DIRECTORY_ENTRY_EXPORT * size_of::<ImageDataDirectory>()) as u64;
        let directory: ImageDataDirectory = self.read_pod(offset, "export data directory")?;
        if directory.virtual_address.get(LE) == 0 {
            return Ok(None);
        }
        Ok(Some(directory))
    }

    fn parse_exports(&self, directory: ImageDataDirectory, sections: &mut [Section]) -> ImageResult<()>
    {
        let exports: ImageExportDirectory =
            self.read_pod(u64::from(directory.virtual_address.get(LE)), "export directory")?;

        let name_count = exports.number_of_names.get(LE) as usize;
        let function_count = exports.number_of_functions.get(LE) as usize;
        // Names and functions are paired by position, not through the ordinal table.
        let count = name_count.min(function_count);
        if count > MAX_EXPORTS {
            return Err(ImageError::TooManyEntries { what: "export", count });
        }
        if count == 0 {
            return Ok(());
        }

        let names = self.read_rva_array(u64::from(exports.address_of_names.get(LE)), count, "export name table")?;
        let functions =
            self.read_rva_array(u64::from(exports.address_of_functions.get(LE)), count, "export address table")?;

        for (name_rva, function_rva) in names.into_iter().zip(functions) {
            let name = self.read_name(u64::from(name_rva))?;
            if name.is_empty() {
                continue;
            }

            let address = self.base.rebase(u64::from(function_rva));
            match sections.iter_mut().find(|section| section.contains(address)) {
                Some(section) => {
                    trace!(%name, %address, section = section.name(), "export");
                    section.push_symbol(Symbol::new(name, address, self.memory.clone()));
                }
                None => trace!(%name, %address, "export outside every section skipped"),
            }
        }
        Ok(())
    }

    fn read_rva_array(&self, rva: u64, count: usize, what: &'static str) -> ImageResult<Vec<u32>>
    {
        let address = self.base.rebase(rva);
        let bytes = self
            .memory
            .read_vec(address, count * 4)
            .ok_or(ImageError::Truncated { what, address })?;
        Ok(bytes
            .chunks_exact(4)
            .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect())
    }

    /// Read a NUL-terminated 8-bit string.
    ///
    /// A failed read is retried with half the length, so a name ending just
    /// before unreadable memory is still found when reads are all-or-nothing.
    fn read_name(&self, rva: u64) -> ImageResult<String>
    {
        let start = self.base.rebase(rva);
        let mut name = Vec::new();
        let mut chunk = [0u8; NAME_CHUNK];
        let mut len = NAME_CHUNK;

        while name.len() < MAX_NAME_LEN {
            let read = self.memory.read(start + name.len() as u64, &mut chunk[..len]);
            if read == 0 {
                if len == 1 {
                    return Err(ImageError::Truncated {
                        what: "export name",
                        address: start,
                    });
                }
                len /= 2;
                continue;
            }
            let bytes = &chunk[..read];
            if let Some(end) = bytes.iter().position(|&b| b == 0) {
                name.extend_from_slice(&bytes[..end]);
                return Ok(String::from_utf8_lossy(&name).into_owned());
            }
            name.extend_from_slice(bytes);
        }
        Err(ImageError::UnterminatedName(start))
    }

    fn read_array<const N: usize>(&self, rva: u64, what: &'static str) -> ImageResult<[u8; N]>
    {
        let address = self.base.rebase(rva);
        let mut buffer = [0u8; N];
        if self.memory.read(address, &mut buffer) != N {
            return Err(ImageError::Truncated { what, address });
        }
        Ok(buffer)
    }

    fn read_pod<T: Pod>(&self, rva: u64, what: &'static str) -> ImageResult<T>
    {
        let address = self.base.rebase(rva);
        let bytes = self
            .memory
            .read_vec(address, size_of::<T>())
            .ok_or(ImageError::Truncated { what, address })?;
        let (value, _) = from_bytes::<T>(&bytes).map_err(|()| ImageError::Truncated { what, address })?;
        Ok(*value)
    }
}
