//! Object write-out for the Gantry compiler.
//!
//! Takes the [`GenericObjectFile`] the encoder produced and serialises it as
//! a platform-conformant relocatable object with the `object` crate:
//! sections in input order with section 0 as executable `.text`, the symbol
//! table, and the code relocations. Declaration-only functions become
//! undefined symbols; everything `.L*`-shaped was already resolved and
//! stripped by the encoder, so no local labels reach this crate.

#![warn(missing_docs)]

use anyhow::{bail, Context as _, Result};
use gantry_codegen::binemit::{
    GenericObjectFile, RelocKind, SectionData, SymbolKind, SEC_ATTR_EXECUTABLE, SEC_ATTR_WRITABLE,
};
use object::write::{Object, Relocation, Symbol, SymbolId};
use object::{
    Architecture, BinaryFormat, Endianness, RelocationEncoding, RelocationKind, SectionKind,
    SymbolFlags, SymbolScope,
};
use std::collections::HashMap;
use std::path::Path;

fn section_kind(attributes: u32) -> SectionKind {
    if attributes & SEC_ATTR_EXECUTABLE != 0 {
        SectionKind::Text
    } else if attributes & SEC_ATTR_WRITABLE != 0 {
        SectionKind::Data
    } else {
        SectionKind::ReadOnlyData
    }
}

fn symbol_kind(kind: SymbolKind) -> object::SymbolKind {
    match kind {
        SymbolKind::Function | SymbolKind::External => object::SymbolKind::Text,
        SymbolKind::Static | SymbolKind::Export => object::SymbolKind::Data,
        SymbolKind::None => object::SymbolKind::Unknown,
    }
}

/// Serialise `gobj` with the given container format.
pub fn write_object(gobj: &GenericObjectFile, format: BinaryFormat) -> Result<Vec<u8>> {
    log::debug!(
        "writing {:?} object: {} sections, {} symbols, {} relocations",
        format,
        gobj.sections.len(),
        gobj.symbols.len(),
        gobj.relocs.len()
    );
    let mut obj = Object::new(format, Architecture::X86_64, Endianness::Little);

    // Sections, in input order. Section 0 is the code section.
    let mut section_ids = HashMap::new();
    for section in &gobj.sections {
        let kind = section_kind(section.attributes);
        let id = obj.add_section(Vec::new(), section.name.clone().into_bytes(), kind);
        match &section.data {
            SectionData::Bytes(bytes) => {
                obj.append_section_data(id, bytes, 16);
            }
            SectionData::Fill { value, amount } => {
                // A span fill materialises as repeated bytes; relocatable
                // objects have no run-length sections.
                let bytes = vec![*value; *amount as usize];
                obj.append_section_data(id, &bytes, 16);
            }
        }
        section_ids.insert(section.name.clone(), id);
    }

    // Symbols. Declaration-only functions become undefined references.
    let mut symbol_ids: HashMap<String, SymbolId> = HashMap::new();
    for sym in &gobj.symbols {
        if sym.name.starts_with(".L") {
            bail!(
                "local label '{}' survived to the object writer",
                sym.name
            );
        }
        let id = match sym.kind {
            SymbolKind::External => obj.add_symbol(Symbol {
                name: sym.name.clone().into_bytes(),
                value: 0,
                size: 0,
                kind: symbol_kind(sym.kind),
                scope: SymbolScope::Unknown,
                weak: false,
                section: object::write::SymbolSection::Undefined,
                flags: SymbolFlags::None,
            }),
            _ => {
                let section = *section_ids
                    .get(&sym.section_name)
                    .with_context(|| format!("symbol '{}' names an unknown section", sym.name))?;
                let scope = match sym.kind {
                    SymbolKind::Static => SymbolScope::Compilation,
                    _ => SymbolScope::Dynamic,
                };
                obj.add_symbol(Symbol {
                    name: sym.name.clone().into_bytes(),
                    value: sym.byte_offset,
                    size: 0,
                    kind: symbol_kind(sym.kind),
                    scope,
                    weak: false,
                    section: object::write::SymbolSection::Section(section),
                    flags: SymbolFlags::None,
                })
            }
        };
        symbol_ids.insert(sym.name.clone(), id);
    }

    // Relocations, recorded against the code section.
    for reloc in &gobj.relocs {
        if reloc.sym.name.starts_with(".L") {
            bail!(
                "relocation against local label '{}' survived to the object writer",
                reloc.sym.name
            );
        }
        let symbol = match symbol_ids.get(&reloc.sym.name) {
            Some(&id) => id,
            None => {
                // A name without a definition anywhere in the object is an
                // external reference.
                let id = obj.add_symbol(Symbol {
                    name: reloc.sym.name.clone().into_bytes(),
                    value: 0,
                    size: 0,
                    kind: object::SymbolKind::Unknown,
                    scope: SymbolScope::Unknown,
                    weak: false,
                    section: object::write::SymbolSection::Undefined,
                    flags: SymbolFlags::None,
                });
                symbol_ids.insert(reloc.sym.name.clone(), id);
                id
            }
        };

        let section = *section_ids
            .get(&reloc.sym.section_name)
            .with_context(|| "relocation against an unknown section")?;
        let (kind, addend) = match reloc.kind {
            // The displacement field is relative to its own end, which is
            // four bytes before the place the CPU measures from.
            RelocKind::Disp32PcRel => (RelocationKind::Relative, reloc.addend - 4),
            RelocKind::Disp32 => (RelocationKind::Absolute, reloc.addend),
        };
        obj.add_relocation(
            section,
            Relocation {
                offset: reloc.sym.byte_offset,
                size: 32,
                kind,
                encoding: RelocationEncoding::Generic,
                symbol,
                addend,
            },
        )?;
    }

    Ok(obj.write()?)
}

/// Pick the container format from a target triple and serialise `gobj`.
pub fn write_object_for_triple(
    gobj: &GenericObjectFile,
    triple: &target_lexicon::Triple,
) -> Result<Vec<u8>> {
    match triple.binary_format {
        target_lexicon::BinaryFormat::Elf => write_elf_x86_64(gobj),
        target_lexicon::BinaryFormat::Coff => write_coff_x86_64(gobj),
        other => bail!("unsupported binary format {other}"),
    }
}

/// Serialise `gobj` as an ELF relocatable object.
pub fn write_elf_x86_64(gobj: &GenericObjectFile) -> Result<Vec<u8>> {
    write_object(gobj, BinaryFormat::Elf)
}

/// Serialise `gobj` as a COFF object.
pub fn write_coff_x86_64(gobj: &GenericObjectFile) -> Result<Vec<u8>> {
    write_object(gobj, BinaryFormat::Coff)
}

/// Serialise `gobj` as ELF and write it to `path`.
pub fn write_elf_x86_64_to_path(gobj: &GenericObjectFile, path: impl AsRef<Path>) -> Result<()> {
    let bytes = write_elf_x86_64(gobj)?;
    std::fs::write(path.as_ref(), bytes)
        .with_context(|| format!("writing {}", path.as_ref().display()))
}

/// Serialise `gobj` as COFF and write it to `path`.
pub fn write_coff_x86_64_to_path(gobj: &GenericObjectFile, path: impl AsRef<Path>) -> Result<()> {
    let bytes = write_coff_x86_64(gobj)?;
    std::fs::write(path.as_ref(), bytes)
        .with_context(|| format!("writing {}", path.as_ref().display()))
}
