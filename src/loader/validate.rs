//! Module binary validation
//!
//! Reads just enough of a WebAssembly binary to link it: the type, import,
//! function and export sections. Code is never inspected.

use crate::abi::imports::ImportTable;
use crate::abi::{Signature, ValType};
use crate::error::{LoadError, LoadResult};

/// WASM magic number: \0asm
const WASM_MAGIC: [u8; 4] = [0x00, 0x61, 0x73, 0x6D];

/// WASM version 1
const WASM_VERSION: [u8; 4] = [0x01, 0x00, 0x00, 0x00];

mod section {
    pub const CUSTOM: u8 = 0;
    pub const TYPE: u8 = 1;
    pub const IMPORT: u8 = 2;
    pub const FUNCTION: u8 = 3;
    pub const EXPORT: u8 = 7;
    pub const CODE: u8 = 10;
    /// Highest known section id (data count)
    pub const LAST: u8 = 12;
}

const FUNC_TYPE: u8 = 0x60;

/// External kind byte shared by imports and exports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternKind {
    Func,
    Table,
    Memory,
    Global,
}

impl ExternKind {
    fn from_byte(byte: u8) -> LoadResult<Self> {
        match byte {
            0 => Ok(Self::Func),
            1 => Ok(Self::Table),
            2 => Ok(Self::Memory),
            3 => Ok(Self::Global),
            _ => Err(malformed(format!("unknown external kind {:#x}", byte))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportEntry {
    pub module: String,
    pub name: String,
    pub kind: ExternKind,
    /// Type index for function imports
    pub type_index: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportEntry {
    pub name: String,
    pub kind: ExternKind,
    pub index: u32,
}

/// The linkable interface of a module
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleInfo {
    pub types: Vec<Signature>,
    pub imports: Vec<ImportEntry>,
    /// Type index of each function defined by the module
    pub functions: Vec<u32>,
    pub exports: Vec<ExportEntry>,
}

impl ModuleInfo {
    /// Signature of function `index` in the combined import + defined space
    pub fn function_signature(&self, index: u32) -> Option<&Signature> {
        let type_index = self
            .imports
            .iter()
            .filter_map(|i| i.type_index)
            .chain(self.functions.iter().copied())
            .nth(index as usize)?;
        self.types.get(type_index as usize)
    }

    /// Exported functions with their signatures
    pub fn function_exports(&self) -> impl Iterator<Item = (&str, Option<&Signature>)> {
        self.exports
            .iter()
            .filter(|e| e.kind == ExternKind::Func)
            .map(|e| (e.name.as_str(), self.function_signature(e.index)))
    }
}

fn malformed(reason: impl Into<String>) -> LoadError {
    LoadError::Malformed {
        reason: reason.into(),
    }
}

/// Read an unsigned LEB128 value
fn read_leb128(bytes: &[u8]) -> LoadResult<(u32, usize)> {
    let mut result = 0u32;
    let mut shift = 0;
    let mut bytes_read = 0;

    for &byte in bytes.iter().take(5) {
        bytes_read += 1;
        result |= ((byte & 0x7F) as u32) << shift;
        if byte & 0x80 == 0 {
            return Ok((result, bytes_read));
        }
        shift += 7;
    }

    Err(malformed("invalid LEB128"))
}

/// Cursor over one section's bytes
struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    fn is_empty(&self) -> bool {
        self.offset >= self.data.len()
    }

    fn byte(&mut self) -> LoadResult<u8> {
        let byte = *self
            .data
            .get(self.offset)
            .ok_or_else(|| malformed("unexpected end of section"))?;
        self.offset += 1;
        Ok(byte)
    }

    fn leb128(&mut self) -> LoadResult<u32> {
        let (value, len) = read_leb128(&self.data[self.offset.min(self.data.len())..])?;
        self.offset += len;
        Ok(value)
    }

    fn bytes(&mut self, len: usize) -> LoadResult<&'a [u8]> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| malformed("item extends past section"))?;
        let bytes = &self.data[self.offset..end];
        self.offset = end;
        Ok(bytes)
    }

    fn name(&mut self) -> LoadResult<String> {
        let len = self.leb128()? as usize;
        let bytes = self.bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| malformed("name is not UTF-8"))
    }

    fn val_type(&mut self) -> LoadResult<ValType> {
        match self.byte()? {
            0x7F => Ok(ValType::I32),
            0x7E => Ok(ValType::I64),
            0x7C => Ok(ValType::F64),
            0x7D => Err(LoadError::Unsupported {
                what: "f32 values at the module boundary".to_string(),
            }),
            other => Err(malformed(format!("unknown value type {:#x}", other))),
        }
    }

    fn limits(&mut self) -> LoadResult<()> {
        let flags = self.byte()?;
        self.leb128()?;
        if flags & 1 != 0 {
            self.leb128()?;
        }
        Ok(())
    }

    fn finish(&self, what: &str) -> LoadResult<()> {
        if self.offset != self.data.len() {
            return Err(malformed(format!("{} section size mismatch", what)));
        }
        Ok(())
    }
}

/// Validates module binaries and resolves their imports
pub struct ModuleValidator;

impl ModuleValidator {
    /// Parse the module's interface
    ///
    /// Checks:
    /// - Valid WASM magic number and version
    /// - Every section lies within the binary and is fully consumed
    pub fn parse(bytes: &[u8]) -> LoadResult<ModuleInfo> {
        if bytes.len() < 8 {
            return Err(malformed("module too small"));
        }
        if bytes[0..4] != WASM_MAGIC {
            return Err(malformed("invalid magic number"));
        }
        if bytes[4..8] != WASM_VERSION {
            return Err(malformed("unsupported WASM version"));
        }

        let mut info = ModuleInfo::default();
        let mut offset = 8;
        while offset < bytes.len() {
            let section_id = bytes[offset];
            offset += 1;

            let (size, size_bytes) = read_leb128(&bytes[offset..])?;
            offset += size_bytes;

            let section_end = usize::try_from(size)
                .ok()
                .and_then(|size| offset.checked_add(size))
                .filter(|&end| end <= bytes.len())
                .ok_or_else(|| malformed("section extends past end of module"))?;

            let mut reader = Reader::new(&bytes[offset..section_end]);
            match section_id {
                section::TYPE => {
                    info.types = parse_type_section(&mut reader)?;
                    reader.finish("type")?;
                }
                section::IMPORT => {
                    info.imports = parse_import_section(&mut reader)?;
                    reader.finish("import")?;
                }
                section::FUNCTION => {
                    let count = reader.leb128()?;
                    info.functions = (0..count)
                        .map(|_| reader.leb128())
                        .collect::<LoadResult<_>>()?;
                    reader.finish("function")?;
                }
                section::EXPORT => {
                    info.exports = parse_export_section(&mut reader)?;
                    reader.finish("export")?;
                }
                section::CUSTOM | section::CODE => {}
                id if id <= section::LAST => {}
                id => return Err(malformed(format!("unknown section id {}", id))),
            }

            offset = section_end;
        }

        let type_count = info.types.len() as u32;
        let referenced = info
            .imports
            .iter()
            .filter_map(|i| i.type_index)
            .chain(info.functions.iter().copied());
        for index in referenced {
            if index >= type_count {
                return Err(malformed(format!("type index {} out of range", index)));
            }
        }
        Ok(info)
    }

    /// Parse `bytes` and check every import against `imports`
    pub fn validate(bytes: &[u8], imports: &ImportTable) -> LoadResult<ModuleInfo> {
        let info = Self::parse(bytes)?;
        for entry in &info.imports {
            let unresolved = || LoadError::UnresolvedImport {
                module: entry.module.clone(),
                name: entry.name.clone(),
            };
            match entry.kind {
                ExternKind::Func => {
                    let import = imports.resolve(&entry.module, &entry.name).ok_or_else(unresolved)?;
                    let declared = entry
                        .type_index
                        .and_then(|t| info.types.get(t as usize))
                        .ok_or_else(unresolved)?;
                    if *declared != import.signature {
                        return Err(LoadError::Instantiation {
                            reason: format!(
                                "import {}.{} declared as {:?}, runtime provides {:?}",
                                entry.module, entry.name, declared, import.signature
                            ),
                        });
                    }
                }
                ExternKind::Memory if imports.provides_memory(&entry.module, &entry.name) => {}
                _ => return Err(unresolved()),
            }
        }
        log::debug!(
            "validated module: {} imports, {} exports",
            info.imports.len(),
            info.exports.len()
        );
        Ok(info)
    }
}

fn parse_type_section(reader: &mut Reader<'_>) -> LoadResult<Vec<Signature>> {
    let count = reader.leb128()?;
    let mut types = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        if reader.byte()? != FUNC_TYPE {
            return Err(malformed("expected function type"));
        }
        let param_count = reader.leb128()?;
        let params = (0..param_count)
            .map(|_| reader.val_type())
            .collect::<LoadResult<Vec<_>>>()?;
        let result = match reader.leb128()? {
            0 => None,
            1 => Some(reader.val_type()?),
            _ => {
                return Err(LoadError::Unsupported {
                    what: "multi-value results".to_string(),
                });
            }
        };
        types.push(Signature { params, result });
    }
    Ok(types)
}

/// Parse import section entries
fn parse_import_section(reader: &mut Reader<'_>) -> LoadResult<Vec<ImportEntry>> {
    let count = reader.leb128()?;
    let mut imports = Vec::new();
    for _ in 0..count {
        let module = reader.name()?;
        let name = reader.name()?;
        let kind = ExternKind::from_byte(reader.byte()?)?;
        let type_index = match kind {
            ExternKind::Func => Some(reader.leb128()?),
            ExternKind::Table => {
                reader.byte()?;
                reader.limits()?;
                None
            }
            ExternKind::Memory => {
                reader.limits()?;
                None
            }
            ExternKind::Global => {
                reader.byte()?;
                reader.byte()?;
                None
            }
        };
        imports.push(ImportEntry {
            module,
            name,
            kind,
            type_index,
        });
    }
    Ok(imports)
}

/// Parse export section entries
fn parse_export_section(reader: &mut Reader<'_>) -> LoadResult<Vec<ExportEntry>> {
    let count = reader.leb128()?;
    let mut exports = Vec::new();
    for _ in 0..count {
        let name = reader.name()?;
        let kind = ExternKind::from_byte(reader.byte()?)?;
        let index = reader.leb128()?;
        exports.push(ExportEntry { name, kind, index });
    }
    Ok(exports)
}

// ============================================================================
// Encoding
// ============================================================================

/// Builds interface-only module binaries
///
/// Every defined function body is `unreachable`, so the binary describes a
/// module's imports and exports without carrying its code. Hosts that
/// implement the exports natively use it to go through the same validation
/// as a compiled module.
#[derive(Debug, Clone, Default)]
pub struct WasmBuilder {
    types: Vec<Signature>,
    imports: Vec<(String, String, Option<u32>)>,
    exports: Vec<(String, u32)>,
}

impl WasmBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn type_index(&mut self, signature: &Signature) -> u32 {
        if let Some(index) = self.types.iter().position(|t| t == signature) {
            return index as u32;
        }
        self.types.push(signature.clone());
        (self.types.len() - 1) as u32
    }

    pub fn import_func(mut self, module: &str, name: &str, signature: &Signature) -> Self {
        let index = self.type_index(signature);
        self.imports
            .push((module.to_string(), name.to_string(), Some(index)));
        self
    }

    pub fn import_memory(mut self, module: &str, name: &str) -> Self {
        self.imports.push((module.to_string(), name.to_string(), None));
        self
    }

    pub fn export_func(mut self, name: &str, signature: &Signature) -> Self {
        let index = self.type_index(signature);
        self.exports.push((name.to_string(), index));
        self
    }

    fn push_leb128(bytes: &mut Vec<u8>, mut value: u32) {
        loop {
            let byte = (value & 0x7F) as u8;
            value >>= 7;
            if value == 0 {
                bytes.push(byte);
                break;
            } else {
                bytes.push(byte | 0x80);
            }
        }
    }

    fn push_name(bytes: &mut Vec<u8>, name: &str) {
        Self::push_leb128(bytes, name.len() as u32);
        bytes.extend_from_slice(name.as_bytes());
    }

    fn val_type(ty: ValType) -> u8 {
        match ty {
            ValType::I32 => 0x7F,
            ValType::I64 => 0x7E,
            ValType::F64 => 0x7C,
        }
    }

    fn section(bytes: &mut Vec<u8>, id: u8, content: &[u8]) {
        bytes.push(id);
        Self::push_leb128(bytes, content.len() as u32);
        bytes.extend_from_slice(content);
    }

    pub fn build(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&WASM_MAGIC);
        bytes.extend_from_slice(&WASM_VERSION);

        let mut content = Vec::new();
        Self::push_leb128(&mut content, self.types.len() as u32);
        for signature in &self.types {
            content.push(FUNC_TYPE);
            Self::push_leb128(&mut content, signature.params.len() as u32);
            content.extend(signature.params.iter().map(|&t| Self::val_type(t)));
            match signature.result {
                Some(ty) => content.extend_from_slice(&[1, Self::val_type(ty)]),
                None => content.push(0),
            }
        }
        Self::section(&mut bytes, section::TYPE, &content);

        let mut content = Vec::new();
        Self::push_leb128(&mut content, self.imports.len() as u32);
        for (module, name, type_index) in &self.imports {
            Self::push_name(&mut content, module);
            Self::push_name(&mut content, name);
            match type_index {
                Some(index) => {
                    content.push(0x00);
                    Self::push_leb128(&mut content, *index);
                }
                None => content.extend_from_slice(&[0x02, 0x00, 0x01]),
            }
        }
        Self::section(&mut bytes, section::IMPORT, &content);

        let mut content = Vec::new();
        Self::push_leb128(&mut content, self.exports.len() as u32);
        for (_, type_index) in &self.exports {
            Self::push_leb128(&mut content, *type_index);
        }
        Self::section(&mut bytes, section::FUNCTION, &content);

        let imported_funcs = self.imports.iter().filter(|i| i.2.is_some()).count() as u32;
        let mut content = Vec::new();
        Self::push_leb128(&mut content, self.exports.len() as u32);
        for (i, (name, _)) in self.exports.iter().enumerate() {
            Self::push_name(&mut content, name);
            content.push(0x00);
            Self::push_leb128(&mut content, imported_funcs + i as u32);
        }
        Self::section(&mut bytes, section::EXPORT, &content);

        // 0 locals, unreachable, end
        let body = [0x00, 0x00, 0x0B];
        let mut content = Vec::new();
        Self::push_leb128(&mut content, self.exports.len() as u32);
        for _ in &self.exports {
            Self::push_leb128(&mut content, body.len() as u32);
            content.extend_from_slice(&body);
        }
        Self::section(&mut bytes, section::CODE, &content);

        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::imports::{ENV, WASI};

    fn sig(params: &[ValType], result: Option<ValType>) -> Signature {
        Signature::new(params, result)
    }

    fn fd_write_sig() -> Signature {
        sig(&[ValType::I32; 4], Some(ValType::I32))
    }

    #[test]
    fn test_parse_builder_output() {
        let run = sig(&[ValType::I32], Some(ValType::I32));
        let bytes = WasmBuilder::new()
            .import_func(WASI, "fd_write", &fd_write_sig())
            .import_memory(ENV, "memory")
            .export_func("Highs_create", &sig(&[], Some(ValType::I32)))
            .export_func("Highs_run", &run)
            .build();

        let info = ModuleValidator::parse(&bytes).unwrap();
        assert_eq!(info.imports.len(), 2);
        assert_eq!(info.imports[1].kind, ExternKind::Memory);
        assert_eq!(info.functions.len(), 2);

        let exports: Vec<_> = info.function_exports().collect();
        assert_eq!(exports[1], ("Highs_run", Some(&run)));
        assert_eq!(info.exports[0].index, 1);
    }

    #[test]
    fn test_validate_resolves_imports() {
        let imports = ImportTable::standard();
        let bytes = WasmBuilder::new()
            .import_func(WASI, "fd_write", &fd_write_sig())
            .import_memory(ENV, "memory")
            .build();
        assert!(ModuleValidator::validate(&bytes, &imports).is_ok());
    }

    #[test]
    fn test_unknown_import_rejected() {
        let imports = ImportTable::standard();
        let bytes = WasmBuilder::new()
            .import_func(ENV, "__cxa_begin_catch", &sig(&[ValType::I32], Some(ValType::I32)))
            .build();
        assert_eq!(
            ModuleValidator::validate(&bytes, &imports),
            Err(LoadError::UnresolvedImport {
                module: "env".to_string(),
                name: "__cxa_begin_catch".to_string(),
            })
        );
    }

    #[test]
    fn test_import_signature_mismatch() {
        let imports = ImportTable::standard();
        let bytes = WasmBuilder::new()
            .import_func(WASI, "fd_write", &sig(&[ValType::I32], None))
            .build();
        assert!(matches!(
            ModuleValidator::validate(&bytes, &imports),
            Err(LoadError::Instantiation { .. })
        ));
    }

    #[test]
    fn test_foreign_memory_import_rejected() {
        let imports = ImportTable::standard();
        let bytes = WasmBuilder::new().import_memory("js", "mem").build();
        assert!(matches!(
            ModuleValidator::validate(&bytes, &imports),
            Err(LoadError::UnresolvedImport { .. })
        ));
    }

    #[test]
    fn test_rejects_oversized_section_length() {
        let mut bytes = WasmBuilder::new().build();
        // Custom section claiming u32::MAX bytes
        bytes.extend_from_slice(&[0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0x0F]);
        assert!(matches!(
            ModuleValidator::parse(&bytes),
            Err(LoadError::Malformed { .. })
        ));
    }

    #[test]
    fn test_rejects_bad_header() {
        assert!(matches!(
            ModuleValidator::parse(b"\0asm"),
            Err(LoadError::Malformed { .. })
        ));
        assert!(matches!(
            ModuleValidator::parse(b"\0elf\x01\0\0\0"),
            Err(LoadError::Malformed { .. })
        ));
        assert!(matches!(
            ModuleValidator::parse(b"\0asm\x02\0\0\0"),
            Err(LoadError::Malformed { .. })
        ));
    }

    #[test]
    fn test_rejects_truncated_section() {
        let mut bytes = WasmBuilder::new()
            .export_func("f", &sig(&[], None))
            .build();
        bytes.truncate(bytes.len() - 1);
        assert_eq!(
            ModuleValidator::parse(&bytes),
            Err(LoadError::Malformed {
                reason: "section extends past end of module".to_string(),
            })
        );
    }

    #[test]
    fn test_rejects_f32_signatures() {
        let bytes = [
            0x00, 0x61, 0x73, 0x6D, 0x01, 0x00, 0x00, 0x00, // header
            0x01, 0x05, 0x01, 0x60, 0x01, 0x7D, 0x00, // type: (f32) -> ()
        ];
        assert!(matches!(
            ModuleValidator::parse(&bytes),
            Err(LoadError::Unsupported { .. })
        ));
    }

    #[test]
    fn test_rejects_dangling_type_index() {
        let bytes = [
            0x00, 0x61, 0x73, 0x6D, 0x01, 0x00, 0x00, 0x00, // header
            0x03, 0x02, 0x01, 0x04, // function section: 1 func of type 4
        ];
        assert!(matches!(
            ModuleValidator::parse(&bytes),
            Err(LoadError::Malformed { .. })
        ));
    }

    #[test]
    fn test_read_leb128() {
        assert_eq!(read_leb128(&[0x05]).unwrap(), (5, 1));
        assert_eq!(read_leb128(&[0xE5, 0x8E, 0x26]).unwrap(), (624485, 3));
        assert!(read_leb128(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x01]).is_err());
        assert!(read_leb128(&[]).is_err());
    }
}
