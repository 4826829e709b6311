//! Binary machine code emission: the generic object model.
//!
//! The encoder serialises machine code into a [`GenericObjectFile`]: ordered
//! sections of raw bytes (or a fill), a symbol table, and relocations
//! recorded against code offsets. The object writer turns this into ELF or
//! COFF; nothing in here is format-specific.

use core::fmt;

/// Offset in bytes from the beginning of a section.
///
/// The compiler can be used as a cross compiler, so this is a fixed-width
/// type rather than `usize`.
pub type CodeOffset = u32;

/// Addend to add to the symbol value of a relocation.
pub type Addend = i64;

/// Relocation kinds understood by the object writer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RelocKind {
    /// 32-bit displacement relative to the end of the displacement field.
    Disp32PcRel,
    /// Absolute 32-bit displacement.
    Disp32,
}

impl fmt::Display for RelocKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Disp32PcRel => write!(f, "DISP32_PCREL"),
            Self::Disp32 => write!(f, "DISP32"),
        }
    }
}

/// What a symbol names.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SymbolKind {
    /// No particular kind.
    None,
    /// A defined function.
    Function,
    /// Object-local data or a local label.
    Static,
    /// Like static, but visible outside the object.
    Export,
    /// Defined in another object.
    External,
}

/// A symbol: a named offset within a section.
#[derive(Clone, Debug)]
pub struct Symbol {
    /// The symbol's kind.
    pub kind: SymbolKind,
    /// The symbol's name.
    pub name: String,
    /// Name of the section the symbol is associated with.
    pub section_name: String,
    /// Offset within that section where the symbol is defined.
    pub byte_offset: u64,
}

/// A deferred symbol-address fix-up recorded against a code offset.
///
/// The symbol carried here names the *target*; its `byte_offset` is the
/// location of the displacement field being patched.
#[derive(Clone, Debug)]
pub struct RelocationEntry {
    /// The relocation kind.
    pub kind: RelocKind,
    /// The referenced symbol, by name, with the patch site offset.
    pub sym: Symbol,
    /// Added to the relocated value.
    pub addend: Addend,
}

/// Section attribute: contents may be written at run time.
pub const SEC_ATTR_WRITABLE: u32 = 1 << 0;
/// Section attribute: contents are executable.
pub const SEC_ATTR_EXECUTABLE: u32 = 1 << 1;
/// Section attribute: the data is a fill (value and repetition count)
/// rather than a byte buffer.
pub const SEC_ATTR_SPAN_FILL: u32 = 1 << 31;

/// The contents of a section.
#[derive(Clone, Debug)]
pub enum SectionData {
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// `amount` copies of `value`.
    Fill {
        /// The fill byte.
        value: u8,
        /// Number of repetitions.
        amount: u64,
    },
}

/// A section of the object file.
#[derive(Clone, Debug)]
pub struct Section {
    /// Section name.
    pub name: String,
    /// Attribute bits.
    pub attributes: u32,
    /// The contents.
    pub data: SectionData,
}

impl Section {
    /// Create an empty byte-buffer section.
    pub fn new(name: impl Into<String>, attributes: u32) -> Self {
        Self {
            name: name.into(),
            attributes,
            data: SectionData::Bytes(Vec::new()),
        }
    }

    /// The current size of the section contents in bytes.
    pub fn size(&self) -> u64 {
        match &self.data {
            SectionData::Bytes(bytes) => bytes.len() as u64,
            SectionData::Fill { amount, .. } => *amount,
        }
    }

    fn bytes_mut(&mut self) -> &mut Vec<u8> {
        match &mut self.data {
            SectionData::Bytes(bytes) => bytes,
            SectionData::Fill { .. } => panic!("writing bytes into a fill section"),
        }
    }

    /// Write one byte of data to the section.
    pub fn write_u8(&mut self, value: u8) {
        self.bytes_mut().push(value);
    }

    /// Write two bytes of data to the section.
    pub fn write_2(&mut self, v0: u8, v1: u8) {
        self.bytes_mut().extend_from_slice(&[v0, v1]);
    }

    /// Write three bytes of data to the section.
    pub fn write_3(&mut self, v0: u8, v1: u8, v2: u8) {
        self.bytes_mut().extend_from_slice(&[v0, v1, v2]);
    }

    /// Write four bytes of data to the section.
    pub fn write_4(&mut self, v0: u8, v1: u8, v2: u8, v3: u8) {
        self.bytes_mut().extend_from_slice(&[v0, v1, v2, v3]);
    }

    /// Write `buffer` to the section.
    pub fn write_bytes(&mut self, buffer: &[u8]) {
        self.bytes_mut().extend_from_slice(buffer);
    }

    /// Write a little-endian 16-bit value.
    pub fn write_u16_le(&mut self, value: u16) {
        self.write_bytes(&value.to_le_bytes());
    }

    /// Write a little-endian 32-bit value.
    pub fn write_u32_le(&mut self, value: u32) {
        self.write_bytes(&value.to_le_bytes());
    }

    /// Write a little-endian 64-bit value.
    pub fn write_u64_le(&mut self, value: u64) {
        self.write_bytes(&value.to_le_bytes());
    }
}

/// A generic object file: ordered sections, symbols and relocations.
///
/// By convention the code/text section is always present at index 0.
pub struct GenericObjectFile {
    /// Sections in emission order.
    pub sections: Vec<Section>,
    /// The symbol table.
    pub symbols: Vec<Symbol>,
    /// Relocations in the order they were encountered.
    pub relocs: Vec<RelocationEntry>,
}

impl GenericObjectFile {
    /// Create an object file with an empty executable `.text` section at
    /// index 0.
    pub fn new() -> Self {
        Self {
            sections: vec![Section::new(".text", SEC_ATTR_EXECUTABLE)],
            symbols: Vec::new(),
            relocs: Vec::new(),
        }
    }

    /// The code section. Always index 0.
    pub fn code_section(&mut self) -> &mut Section {
        &mut self.sections[0]
    }

    /// The current offset into the code section.
    pub fn code_offset(&self) -> CodeOffset {
        self.sections[0].size() as CodeOffset
    }

    /// Find a section by name.
    pub fn get_section_by_name(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// Find or create a byte-buffer section by name.
    pub fn get_or_create_section(&mut self, name: &str, attributes: u32) -> &mut Section {
        if let Some(idx) = self.sections.iter().position(|s| s.name == name) {
            return &mut self.sections[idx];
        }
        self.sections.push(Section::new(name, attributes));
        self.sections.last_mut().unwrap()
    }

    /// Write one byte of machine code.
    pub fn code_u8(&mut self, value: u8) {
        self.code_section().write_u8(value);
    }

    /// Write two bytes of machine code.
    pub fn code_2(&mut self, v0: u8, v1: u8) {
        self.code_section().write_2(v0, v1);
    }

    /// Write three bytes of machine code.
    pub fn code_3(&mut self, v0: u8, v1: u8, v2: u8) {
        self.code_section().write_3(v0, v1, v2);
    }

    /// Write four bytes of machine code.
    pub fn code_4(&mut self, v0: u8, v1: u8, v2: u8, v3: u8) {
        self.code_section().write_4(v0, v1, v2, v3);
    }

    /// Write machine code bytes.
    pub fn code_bytes(&mut self, buffer: &[u8]) {
        self.code_section().write_bytes(buffer);
    }

    /// Record a relocation at the current end of the code section.
    pub fn reloc_at_code_end(&mut self, kind: RelocKind, name: &str, sym_kind: SymbolKind) {
        let section_name = self.sections[0].name.clone();
        let byte_offset = self.sections[0].size();
        self.relocs.push(RelocationEntry {
            kind,
            sym: Symbol {
                kind: sym_kind,
                name: name.to_string(),
                section_name,
                byte_offset,
            },
            addend: 0,
        });
    }

    /// Add a symbol at the current end of the code section.
    pub fn add_code_symbol(&mut self, kind: SymbolKind, name: impl Into<String>) {
        let section_name = self.sections[0].name.clone();
        let byte_offset = self.sections[0].size();
        self.symbols.push(Symbol {
            kind,
            name: name.into(),
            section_name,
            byte_offset,
        });
    }
}

impl fmt::Display for GenericObjectFile {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for section in &self.sections {
            writeln!(
                f,
                "section {} ({} bytes{}{}{})",
                section.name,
                section.size(),
                if section.attributes & SEC_ATTR_WRITABLE != 0 { ", writable" } else { "" },
                if section.attributes & SEC_ATTR_EXECUTABLE != 0 { ", executable" } else { "" },
                if section.attributes & SEC_ATTR_SPAN_FILL != 0 { ", fill" } else { "" },
            )?;
        }
        for sym in &self.symbols {
            writeln!(
                f,
                "symbol {:?} {} at {}+{:#x}",
                sym.kind, sym.name, sym.section_name, sym.byte_offset
            )?;
        }
        for reloc in &self.relocs {
            writeln!(
                f,
                "reloc {} -> {} at {}+{:#x} addend {}",
                reloc.kind, reloc.sym.name, reloc.sym.section_name, reloc.sym.byte_offset, reloc.addend
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_section_is_index_zero() {
        let mut obj = GenericObjectFile::new();
        assert_eq!(obj.code_offset(), 0);
        obj.code_2(0x0f, 0x0b);
        assert_eq!(obj.code_offset(), 2);
        assert_eq!(obj.sections[0].name, ".text");
        assert!(obj.sections[0].attributes & SEC_ATTR_EXECUTABLE != 0);
    }

    #[test]
    fn sections_by_name() {
        let mut obj = GenericObjectFile::new();
        obj.get_or_create_section(".data", SEC_ATTR_WRITABLE)
            .write_bytes(b"abc");
        assert_eq!(obj.get_section_by_name(".data").unwrap().size(), 3);
        assert!(obj.get_section_by_name(".bss").is_none());
    }
}
