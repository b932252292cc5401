//! # Loaded Images
//!
//! Static description of the images (executable and DLLs) mapped into the
//! debuggee: [`Module`] → [`Section`] → [`Symbol`].
//!
//! Modules are built by the session for every create-process and load-dll
//! event. Their layout is recovered from the in-memory PE headers before the
//! module is published; a module whose headers cannot be parsed is still
//! published, just with fewer (or no) sections.

mod parser;
mod section;
mod symbol;

use std::fmt;

use once_cell::sync::OnceCell;
pub use parser::ImageError;
use parser::ImageParser;
pub use section::Section;
pub use symbol::Symbol;
use tracing::debug;

use crate::memory::TargetMemory;
use crate::types::{Address, Handle};

const LONG_PATH_PREFIX: &str = r"\\?\";

/// One image loaded in the debuggee
pub struct Module
{
    file: Handle,
    base: Address,
    path: OnceCell<String>,
    sections: Vec<Section>,
    memory: TargetMemory,
}

impl Module
{
    /// Describe the image mapped at `base`, parsing its headers from target
    /// memory.
    ///
    /// Parse errors are logged and otherwise ignored.
    pub fn load(memory: TargetMemory, file: Handle, base: Address) -> Self
    {
        let mut sections = Vec::new();
        if let Err(err) = ImageParser::new(&memory, base).parse_into(&mut sections) {
            debug!(%base, error = %err, recovered = sections.len(), "image headers not fully parsed");
        }
        Self {
            file,
            base,
            path: OnceCell::new(),
            sections,
            memory,
        }
    }

    /// Image file handle as reported by the OS (may be null).
    pub fn file(&self) -> Handle
    {
        self.file
    }

    /// Load address.
    pub fn base(&self) -> Address
    {
        self.base
    }

    /// Sections in section-table order.
    pub fn sections(&self) -> &[Section]
    {
        &self.sections
    }

    /// First section called `name`.
    pub fn section(&self, name: &str) -> Option<&Section>
    {
        self.sections.iter().find(|section| section.name() == name)
    }

    /// Every export of the image, section by section.
    pub fn symbols(&self) -> impl Iterator<Item = &Symbol>
    {
        self.sections.iter().flat_map(|section| section.symbols())
    }

    /// Export called `name`.
    pub fn symbol(&self, name: &str) -> Option<&Symbol>
    {
        self.symbols().find(|symbol| symbol.name() == name)
    }

    /// Path of the image file; empty when the OS cannot tell.
    ///
    /// Resolved on first use and cached. The `\\?\` prefix is stripped.
    pub fn path(&self) -> &str
    {
        self.path.get_or_init(|| {
            if self.file.is_null() {
                return String::new();
            }
            let path = self.memory.backend().resolve_path(self.file);
            match path.strip_prefix(LONG_PATH_PREFIX) {
                Some(stripped) => stripped.to_string(),
                None => path,
            }
        })
    }
}

impl Drop for Module
{
    /// The file handle of a load event belongs to the debugger.
    fn drop(&mut self)
    {
        if !self.file.is_null() {
            self.memory.backend().close_handle(self.file);
        }
    }
}

impl fmt::Display for Module
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let path = self.path();
        if path.is_empty() {
            write!(f, "module: <unknown 0x{:X}>", self.base.value())
        } else {
            write!(f, "module: {path}")
        }
    }
}

impl fmt::Debug for Module
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("Module")
            .field("base", &self.base)
            .field("path", &self.path.get())
            .field("sections", &self.sections)
            .finish()
    }
}
