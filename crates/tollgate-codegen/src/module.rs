//! In-memory WASM module.
//!
//! The compiler starts from the prebuilt host-runtime module, appends
//! declarations and bodies, prunes, and encodes.  Only the sections the
//! ABI uses are modelled: types, imports (functions and one memory),
//! functions, globals, exports, start, code, data and the function-name
//! subsection of `name`.  Other custom sections pass through unchanged.
//!
//! The function index space is imports first, then defined functions, and
//! [`Module::names`] is kept in lockstep with it: a defined function has a
//! name exactly when it has code.

use std::borrow::Cow;
use std::collections::BTreeMap;

use wasm_encoder::{
    CodeSection, ConstExpr, CustomSection, DataSection, EntityType, ExportSection,
    FunctionSection, GlobalSection, GlobalType, ImportSection, MemoryType, NameMap,
    NameSection, StartSection, TypeSection, ValType,
};
use wasmparser::{KnownCustom, Name, Parser, Payload, TypeRef};

use crate::error::{CodegenError, CodegenResult};
use crate::instr::Body;

// ══════════════════════════════════════════════════════════════════════════════
// Model
// ══════════════════════════════════════════════════════════════════════════════

/// A function signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuncType {
    pub params: Vec<ValType>,
    pub results: Vec<ValType>,
}

impl FuncType {
    pub fn new(params: impl Into<Vec<ValType>>, results: impl Into<Vec<ValType>>) -> Self {
        Self {
            params: params.into(),
            results: results.into(),
        }
    }

    /// `(i32 × n) -> i32`, the shape of every planned function.
    pub fn i32s(n: usize) -> Self {
        Self::new(vec![ValType::I32; n], vec![ValType::I32])
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Import {
    pub module: String,
    pub name: String,
    pub kind: ImportKind,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ImportKind {
    /// A function with the given type index.
    Func(u32),
    Memory { minimum: u64, maximum: Option<u64> },
}

/// A mutable or immutable `i32` global.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Global {
    pub mutable: bool,
    pub init: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportKind {
    Func,
    Memory,
    Global,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Export {
    pub name: String,
    pub kind: ExportKind,
    pub index: u32,
}

/// The body of a defined function.
#[derive(Debug, Clone, PartialEq)]
pub enum Code {
    /// A structured body; an empty one is a placeholder awaiting codegen.
    Body(Body),
    /// Encoded bytes (locals and instructions, no size prefix), kept as-is.
    Raw(Vec<u8>),
}

impl Code {
    pub fn placeholder() -> Self {
        Code::Body(Body::default())
    }
}

/// An active data segment for memory 0.
#[derive(Debug, Clone, PartialEq)]
pub struct DataSegment {
    pub offset: u32,
    pub bytes: Vec<u8>,
}

impl DataSegment {
    pub fn end(&self) -> u32 {
        self.offset + self.bytes.len() as u32
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Module {
    pub types: Vec<FuncType>,
    pub imports: Vec<Import>,
    /// Type index of each defined function.
    pub funcs: Vec<u32>,
    pub code: Vec<Code>,
    pub globals: Vec<Global>,
    pub exports: Vec<Export>,
    pub start: Option<u32>,
    pub data: Vec<DataSegment>,
    /// Function names by absolute function index.
    pub names: BTreeMap<u32, String>,
    /// Custom sections other than `name`.
    pub customs: Vec<(String, Vec<u8>)>,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Index space ──────────────────────────────────────────────────────

    pub fn func_import_count(&self) -> u32 {
        self.imports
            .iter()
            .filter(|i| matches!(i.kind, ImportKind::Func(_)))
            .count() as u32
    }

    /// Total number of functions, imported and defined.
    pub fn func_count(&self) -> u32 {
        self.func_import_count() + self.funcs.len() as u32
    }

    /// Type index of a function by absolute index.
    pub fn func_type_index(&self, index: u32) -> Option<u32> {
        let imported = self.func_import_count();
        if index < imported {
            self.imports
                .iter()
                .filter_map(|i| match i.kind {
                    ImportKind::Func(ty) => Some(ty),
                    ImportKind::Memory { .. } => None,
                })
                .nth(index as usize)
        } else {
            self.funcs.get((index - imported) as usize).copied()
        }
    }

    /// Absolute index of a named function.
    pub fn func_by_name(&self, name: &str) -> Option<u32> {
        self.names
            .iter()
            .find(|(_, n)| n.as_str() == name)
            .map(|(idx, _)| *idx)
    }

    pub fn export(&self, name: &str) -> Option<&Export> {
        self.exports.iter().find(|e| e.name == name)
    }

    // ── Building ─────────────────────────────────────────────────────────

    /// Intern a function type, returning its index.  Structurally equal
    /// types share one entry.
    pub fn add_type(&mut self, ty: FuncType) -> u32 {
        if let Some(idx) = self.types.iter().position(|t| *t == ty) {
            return idx as u32;
        }
        self.types.push(ty);
        (self.types.len() - 1) as u32
    }

    /// Append a function import.  Must precede every defined function.
    pub fn add_func_import(
        &mut self,
        module: &str,
        name: &str,
        ty: FuncType,
    ) -> CodegenResult<u32> {
        if !self.funcs.is_empty() {
            return Err(CodegenError::Internal(format!(
                "import {module}.{name} after defined functions"
            )));
        }
        let type_index = self.add_type(ty);
        let index = self.func_import_count();
        self.imports.push(Import {
            module: module.to_string(),
            name: name.to_string(),
            kind: ImportKind::Func(type_index),
        });
        self.names.insert(index, name.to_string());
        Ok(index)
    }

    /// Declare a defined function with a placeholder body, register its
    /// name and optionally export it.  Returns the absolute index.
    pub fn declare_func(&mut self, name: &str, ty: FuncType, export: bool) -> u32 {
        let type_index = self.add_type(ty);
        self.funcs.push(type_index);
        self.code.push(Code::placeholder());
        let index = self.func_count() - 1;
        if export {
            self.exports.push(Export {
                name: name.to_string(),
                kind: ExportKind::Func,
                index,
            });
        }
        self.names.entry(index).or_insert_with(|| name.to_string());
        index
    }

    /// Fill in the body of a declared function.
    pub fn set_body(&mut self, index: u32, body: Body) -> CodegenResult<()> {
        let slot = index
            .checked_sub(self.func_import_count())
            .and_then(|i| self.code.get_mut(i as usize))
            .ok_or_else(|| {
                CodegenError::Internal(format!("no code slot for function {index}"))
            })?;
        *slot = Code::Body(body);
        Ok(())
    }

    pub fn add_global(&mut self, global: Global) -> u32 {
        self.globals.push(global);
        (self.globals.len() - 1) as u32
    }

    pub fn export_global(&mut self, name: &str, index: u32) {
        self.exports.push(Export {
            name: name.to_string(),
            kind: ExportKind::Global,
            index,
        });
    }

    /// First byte past every data segment.
    pub fn data_end(&self) -> u32 {
        self.data.iter().map(DataSegment::end).max().unwrap_or(0)
    }

    // ══════════════════════════════════════════════════════════════════════
    // Encoding
    // ══════════════════════════════════════════════════════════════════════

    pub fn encode(&self) -> Vec<u8> {
        let mut module = wasm_encoder::Module::new();

        let mut types = TypeSection::new();
        for ty in &self.types {
            types
                .ty()
                .function(ty.params.iter().copied(), ty.results.iter().copied());
        }
        module.section(&types);

        let mut imports = ImportSection::new();
        for import in &self.imports {
            let entity = match import.kind {
                ImportKind::Func(ty) => EntityType::Function(ty),
                ImportKind::Memory { minimum, maximum } => EntityType::Memory(MemoryType {
                    minimum,
                    maximum,
                    memory64: false,
                    shared: false,
                    page_size_log2: None,
                }),
            };
            imports.import(&import.module, &import.name, entity);
        }
        module.section(&imports);

        let mut functions = FunctionSection::new();
        for ty in &self.funcs {
            functions.function(*ty);
        }
        module.section(&functions);

        let mut globals = GlobalSection::new();
        for global in &self.globals {
            globals.global(
                GlobalType {
                    val_type: ValType::I32,
                    mutable: global.mutable,
                    shared: false,
                },
                &ConstExpr::i32_const(global.init),
            );
        }
        module.section(&globals);

        let mut exports = ExportSection::new();
        for export in &self.exports {
            let kind = match export.kind {
                ExportKind::Func => wasm_encoder::ExportKind::Func,
                ExportKind::Memory => wasm_encoder::ExportKind::Memory,
                ExportKind::Global => wasm_encoder::ExportKind::Global,
            };
            exports.export(&export.name, kind, export.index);
        }
        module.section(&exports);

        if let Some(function_index) = self.start {
            module.section(&StartSection { function_index });
        }

        let mut code = CodeSection::new();
        for entry in &self.code {
            match entry {
                Code::Body(body) => {
                    code.function(&body.to_function());
                }
                Code::Raw(bytes) => {
                    code.raw(bytes);
                }
            }
        }
        module.section(&code);

        let mut data = DataSection::new();
        for segment in &self.data {
            data.active(
                0,
                &ConstExpr::i32_const(segment.offset as i32),
                segment.bytes.iter().copied(),
            );
        }
        module.section(&data);

        if !self.names.is_empty() {
            let mut map = NameMap::new();
            for (index, name) in &self.names {
                map.append(*index, name);
            }
            let mut names = NameSection::new();
            names.functions(&map);
            module.section(&names);
        }

        for (name, bytes) in &self.customs {
            module.section(&CustomSection {
                name: Cow::Borrowed(name),
                data: Cow::Borrowed(bytes),
            });
        }

        module.finish()
    }

    // ══════════════════════════════════════════════════════════════════════
    // Decoding
    // ══════════════════════════════════════════════════════════════════════

    /// Read a binary module.  Bodies within the structured subset decode to
    /// [`Code::Body`]; anything else is kept as [`Code::Raw`].
    pub fn decode(bytes: &[u8]) -> CodegenResult<Module> {
        let mut m = Module::new();

        for payload in Parser::new(0).parse_all(bytes) {
            match payload? {
                Payload::TypeSection(reader) => {
                    for ty in reader.into_iter_err_on_gc_types() {
                        let ty = ty?;
                        m.types.push(FuncType::new(
                            val_types(ty.params())?,
                            val_types(ty.results())?,
                        ));
                    }
                }
                Payload::ImportSection(reader) => {
                    for import in reader {
                        let import = import?;
                        let kind = match import.ty {
                            TypeRef::Func(ty) => ImportKind::Func(ty),
                            TypeRef::Memory(mem) => ImportKind::Memory {
                                minimum: mem.initial,
                                maximum: mem.maximum,
                            },
                            other => {
                                return Err(CodegenError::Decode(format!(
                                    "unsupported import {}.{}: {other:?}",
                                    import.module, import.name
                                )))
                            }
                        };
                        m.imports.push(Import {
                            module: import.module.to_string(),
                            name: import.name.to_string(),
                            kind,
                        });
                    }
                }
                Payload::FunctionSection(reader) => {
                    for ty in reader {
                        m.funcs.push(ty?);
                    }
                }
                Payload::GlobalSection(reader) => {
                    for global in reader {
                        let global = global?;
                        if global.ty.content_type != wasmparser::ValType::I32 {
                            return Err(CodegenError::Decode("non-i32 global".into()));
                        }
                        m.globals.push(Global {
                            mutable: global.ty.mutable,
                            init: const_i32(&global.init_expr)?,
                        });
                    }
                }
                Payload::ExportSection(reader) => {
                    for export in reader {
                        let export = export?;
                        let kind = match export.kind {
                            wasmparser::ExternalKind::Func => ExportKind::Func,
                            wasmparser::ExternalKind::Memory => ExportKind::Memory,
                            wasmparser::ExternalKind::Global => ExportKind::Global,
                            other => {
                                return Err(CodegenError::Decode(format!(
                                    "unsupported export kind {other:?}"
                                )))
                            }
                        };
                        m.exports.push(Export {
                            name: export.name.to_string(),
                            kind,
                            index: export.index,
                        });
                    }
                }
                Payload::StartSection { func, .. } => m.start = Some(func),
                Payload::CodeSectionEntry(body) => {
                    let code = match Body::decode(&body)? {
                        Some(body) => Code::Body(body),
                        None => Code::Raw(bytes[body.range()].to_vec()),
                    };
                    m.code.push(code);
                }
                Payload::DataSection(reader) => {
                    for segment in reader {
                        let segment = segment?;
                        let offset = match segment.kind {
                            wasmparser::DataKind::Active {
                                memory_index: 0,
                                offset_expr,
                            } => const_i32(&offset_expr)? as u32,
                            _ => {
                                return Err(CodegenError::Decode(
                                    "only active segments for memory 0 are supported".into(),
                                ))
                            }
                        };
                        m.data.push(DataSegment {
                            offset,
                            bytes: segment.data.to_vec(),
                        });
                    }
                }
                Payload::CustomSection(reader) => match reader.as_known() {
                    KnownCustom::Name(names) => {
                        for name in names {
                            if let Name::Function(map) = name? {
                                for naming in map {
                                    let naming = naming?;
                                    m.names.insert(naming.index, naming.name.to_string());
                                }
                            }
                        }
                    }
                    _ => m
                        .customs
                        .push((reader.name().to_string(), reader.data().to_vec())),
                },
                Payload::MemorySection(_)
                | Payload::TableSection(_)
                | Payload::ElementSection(_)
                | Payload::TagSection(_) => {
                    return Err(CodegenError::Decode(
                        "defined memories, tables, elements and tags are not supported".into(),
                    ))
                }
                _ => {}
            }
        }

        if m.code.len() != m.funcs.len() {
            return Err(CodegenError::Decode(format!(
                "{} functions declared but {} bodies present",
                m.funcs.len(),
                m.code.len()
            )));
        }

        Ok(m)
    }
}

fn val_types(types: &[wasmparser::ValType]) -> CodegenResult<Vec<ValType>> {
    types
        .iter()
        .map(|ty| match ty {
            wasmparser::ValType::I32 => Ok(ValType::I32),
            wasmparser::ValType::I64 => Ok(ValType::I64),
            wasmparser::ValType::F32 => Ok(ValType::F32),
            wasmparser::ValType::F64 => Ok(ValType::F64),
            other => Err(CodegenError::Decode(format!("unsupported value type {other:?}"))),
        })
        .collect()
}

fn const_i32(expr: &wasmparser::ConstExpr<'_>) -> CodegenResult<i32> {
    let mut reader = expr.get_operators_reader();
    match reader.read()? {
        wasmparser::Operator::I32Const { value } => Ok(value),
        other => Err(CodegenError::Decode(format!(
            "unsupported constant expression {other:?}"
        ))),
    }
}
