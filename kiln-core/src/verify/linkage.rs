// kiln-core/src/verify/linkage.rs
//! Reads the dynamic libraries an executable or shared object depends on.

use std::path::Path;

use kiln_common::error::{KilnError, Result};
use object::elf;
use object::macho::{MachHeader32, MachHeader64};
use object::read::elf::{Dyn, ElfFile, FileHeader};
use object::read::macho::{
    FatArch, LoadCommandVariant, MachHeader, MachOFatFile32, MachOFatFile64, MachOFile,
};
use object::{Endianness, FileKind};
use tracing::debug;

/// Install names (Mach-O) or `DT_NEEDED` entries (ELF) of `path`, in load order. Universal
/// binaries report the union over all slices.
pub fn linked_libraries(path: &Path) -> Result<Vec<String>> {
    let data = std::fs::read(path)?;
    let libraries = libraries_in(&data).map_err(|e| match e {
        KilnError::Object(err) => {
            KilnError::ValidationError(format!("cannot read {}: {err}", path.display()))
        }
        other => other,
    })?;
    debug!("{} links {:?}", path.display(), libraries);
    Ok(libraries)
}

fn libraries_in(data: &[u8]) -> Result<Vec<String>> {
    match FileKind::parse(data)? {
        FileKind::Elf64 => elf_needed(&ElfFile::<elf::FileHeader64<Endianness>>::parse(data)?, data),
        FileKind::Elf32 => elf_needed(&ElfFile::<elf::FileHeader32<Endianness>>::parse(data)?, data),
        FileKind::MachO64 => macho_dylibs(&MachOFile::<MachHeader64<Endianness>, _>::parse(data)?),
        FileKind::MachO32 => macho_dylibs(&MachOFile::<MachHeader32<Endianness>, _>::parse(data)?),
        FileKind::MachOFat32 => fat_dylibs(data, MachOFatFile32::parse(data)?.arches()),
        FileKind::MachOFat64 => fat_dylibs(data, MachOFatFile64::parse(data)?.arches()),
        other => Err(KilnError::ValidationError(format!(
            "unsupported object file kind {other:?}"
        ))),
    }
}

fn elf_needed<'data, Elf>(file: &ElfFile<'data, Elf>, data: &'data [u8]) -> Result<Vec<String>>
where
    Elf: FileHeader<Endian = Endianness>,
{
    let endian = file.endian();
    let sections = file.elf_section_table();
    let Some((entries, strtab)) = sections.dynamic(endian, data)? else {
        // Statically linked.
        return Ok(Vec::new());
    };
    let strings = sections.strings(endian, data, strtab)?;

    let mut needed = Vec::new();
    for entry in entries {
        if entry.tag32(endian) == Some(elf::DT_NEEDED) {
            let name = entry.string(endian, strings)?;
            needed.push(String::from_utf8_lossy(name).into_owned());
        }
    }
    Ok(needed)
}

fn macho_dylibs<'data, Mach>(file: &MachOFile<'data, Mach>) -> Result<Vec<String>>
where
    Mach: MachHeader<Endian = Endianness>,
{
    let endian = file.endian();
    let mut dylibs = Vec::new();
    let mut commands = file.macho_load_commands()?;
    while let Some(command) = commands.next()? {
        if let LoadCommandVariant::Dylib(dylib) = command.variant()? {
            let name = command.string(endian, dylib.dylib.name)?;
            dylibs.push(String::from_utf8_lossy(name).into_owned());
        }
    }
    Ok(dylibs)
}

fn fat_dylibs<A: FatArch>(data: &[u8], arches: &[A]) -> Result<Vec<String>> {
    let mut dylibs: Vec<String> = Vec::new();
    for arch in arches {
        let (offset, size) = arch.file_range();
        let Some(slice) = usize::try_from(offset)
            .ok()
            .zip(usize::try_from(size).ok())
            .and_then(|(start, len)| data.get(start..start.checked_add(len)?))
        else {
            return Err(KilnError::ValidationError(format!(
                "fat slice at offset {offset} (size {size}) is out of bounds"
            )));
        };
        for name in libraries_in(slice)? {
            if !dylibs.contains(&name) {
                dylibs.push(name);
            }
        }
    }
    Ok(dylibs)
}
