// pipeline.rs — Compilation driver and build provenance
//
// Runs a session over one main module and packages everything the binary
// can emit: the lowered instruction stream, the registered definitions,
// accumulated warnings and a provenance record for cache keys.
//
// Preconditions: settings name a usable search path for implicit imports.
// Postconditions: on success the instruction stream is balanced.
// Failure modes: any `CompileError` from loading, definition or lowering;
//   an unbalanced stream is reported as an internal error.
// Side effects: reads the main file (for `compile_file`) and imports.

use std::path::Path;
use std::time::Instant;

use log::info;
use serde::Serialize;

use crate::config::Settings;
use crate::diag::{CompileError, Diagnostic, WalkResult};
use crate::ir::{check_balanced, IrBuffer};
use crate::loader::{LoadedModule, Session};
use crate::scope::FnProp;
use crate::types::Type;

// ── Provenance ─────────────────────────────────────────────────────────────

/// Provenance metadata for hermetic builds and cache-key use.
///
/// `source_hash`: SHA-256 of the main module's source text.
/// `module_fingerprint`: SHA-256 over every loaded module's canonical name
/// and source hash, in load order.
#[derive(Debug, Clone)]
pub struct Provenance {
    pub source_hash: [u8; 32],
    pub module_fingerprint: [u8; 32],
    pub compiler_version: &'static str,
}

impl Provenance {
    /// Hex string of the source hash (64 characters).
    pub fn source_hash_hex(&self) -> String {
        bytes_to_hex(&self.source_hash)
    }

    pub fn module_fingerprint_hex(&self) -> String {
        bytes_to_hex(&self.module_fingerprint)
    }

    /// Serialize provenance as a JSON string for `--emit build-info`.
    pub fn to_json(&self) -> String {
        format!(
            "{{\n  \"source_hash\": \"{}\",\n  \"module_fingerprint\": \"{}\",\n  \"compiler_version\": \"{}\"\n}}\n",
            self.source_hash_hex(),
            self.module_fingerprint_hex(),
            self.compiler_version,
        )
    }
}

fn bytes_to_hex(bytes: &[u8; 32]) -> String {
    let mut s = String::with_capacity(64);
    for b in bytes {
        use std::fmt::Write;
        let _ = write!(s, "{:02x}", b);
    }
    s
}

fn sha256(bytes: &[u8]) -> [u8; 32] {
    use sha2::{Digest, Sha256};

    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let result = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    hash
}

/// Compute provenance from the main source and the loaded modules, given
/// as `(canonical name, source)` pairs in load order.
pub fn compute_provenance<'a>(
    source: &str,
    modules: impl IntoIterator<Item = (&'a str, &'a str)>,
) -> Provenance {
    let mut listing = String::new();
    for (name, text) in modules {
        listing.push_str(name);
        listing.push('\t');
        listing.push_str(&bytes_to_hex(&sha256(text.as_bytes())));
        listing.push('\n');
    }
    Provenance {
        source_hash: sha256(source.as_bytes()),
        module_fingerprint: sha256(listing.as_bytes()),
        compiler_version: env!("CARGO_PKG_VERSION"),
    }
}

// ── Output ─────────────────────────────────────────────────────────────────

/// One registered function, as listed by `--emit defs`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Definition {
    pub name: String,
    pub module: String,
    pub signature: String,
    pub props: Vec<FnProp>,
    /// Annotated semantic traits such as `pure` or `commutative`.
    pub traits: Vec<&'static str>,
}

impl std::fmt::Display for Definition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let module = if self.module.is_empty() { "<main>" } else { &self.module };
        write!(f, "{} {} {} {:?}", module, self.name, self.signature, self.props)?;
        if !self.traits.is_empty() {
            write!(f, " {}", self.traits.join(","))?;
        }
        Ok(())
    }
}

/// Everything produced by one successful compilation.
#[derive(Debug)]
pub struct CompileOutput {
    pub ir: IrBuffer,
    pub definitions: Vec<Definition>,
    pub warnings: Vec<Diagnostic>,
    /// Canonical names of loaded modules in load order; `""` is the main
    /// module.
    pub modules: Vec<String>,
    pub provenance: Provenance,
}

// ── Driver ─────────────────────────────────────────────────────────────────

/// Compile in-memory source as the main module.
pub fn compile_source(path: &Path, source: &str, settings: Settings) -> WalkResult<CompileOutput> {
    let main = LoadedModule::main(path, source)?;
    compile_module(main, settings)
}

/// Read and compile the main module at `path`.
pub fn compile_file(path: &Path, settings: Settings) -> WalkResult<CompileOutput> {
    let source = std::fs::read_to_string(path).map_err(|source| CompileError::Io {
        path: path.display().to_string(),
        source,
    })?;
    compile_source(path, &source, settings)
}

fn compile_module(main: LoadedModule, settings: Settings) -> WalkResult<CompileOutput> {
    let start = Instant::now();
    let main_source = main.source.clone();
    let mut ir = IrBuffer::new();
    let (definitions, warnings, modules, provenance) = {
        let mut session = Session::new(settings, &mut ir);
        session.walk(main)?;
        let loaded: Vec<&LoadedModule> = session.loaded_modules().collect();
        let provenance = compute_provenance(
            &main_source,
            loaded
                .iter()
                .map(|m| (m.info.canonical.as_str(), m.source.as_str())),
        );
        let modules: Vec<String> = loaded.iter().map(|m| m.info.canonical.clone()).collect();
        (
            collect_definitions(&session),
            std::mem::take(&mut session.warnings),
            modules,
            provenance,
        )
    };
    check_balanced(&ir.instrs).map_err(CompileError::internal)?;
    info!(
        "compiled {} modules, {} instructions, {} warnings in {:.1}ms",
        modules.len(),
        ir.instrs.len(),
        warnings.len(),
        start.elapsed().as_secs_f64() * 1000.0
    );
    Ok(CompileOutput {
        ir,
        definitions,
        warnings,
        modules,
        provenance,
    })
}

fn collect_definitions(session: &Session<'_>) -> Vec<Definition> {
    session
        .globals
        .function_names()
        .into_iter()
        .filter_map(|name| session.globals.lookup_function(name))
        .map(|record| Definition {
            name: record.name.clone(),
            module: record.module.clone(),
            signature: Type::Function(record.ty.clone()).to_string(),
            props: record.props.iter().copied().collect(),
            traits: session.semantics.traits(&record.name),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare() -> Settings {
        Settings {
            implicit_imports: Vec::new(),
            ..Settings::default()
        }
    }

    #[test]
    fn compiles_and_lists_definitions() {
        let src = "(int o) id (int i) { o = i; }\nmain { int x = id(1); }";
        let out = compile_source(Path::new("m.weft"), src, bare()).unwrap();
        assert_eq!(out.modules, vec![String::new()]);
        let names: Vec<&str> = out.definitions.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["id", "main"]);
        assert_eq!(out.definitions[0].signature, "(int) <- (int)");
        assert!(out.definitions[0].props.contains(&FnProp::Composite));
        assert!(out.warnings.is_empty());
    }

    #[test]
    fn definitions_carry_semantic_traits() {
        let src = "@pure @commutative (int o) add (int a, int b) \"weft\" \"1.0\" \"add\";\nmain { }";
        let out = compile_source(Path::new("m.weft"), src, bare()).unwrap();
        let add = out.definitions.iter().find(|d| d.name == "add").unwrap();
        assert_eq!(add.traits, vec!["pure", "commutative"]);
        assert!(add.to_string().ends_with(" pure,commutative"), "{}", add);
        let main = out.definitions.iter().find(|d| d.name == "main").unwrap();
        assert!(main.traits.is_empty());
    }

    #[test]
    fn provenance_tracks_source_changes() {
        let a = compute_provenance("main { }", [("", "main { }")]);
        let b = compute_provenance("main { }", [("", "main { }")]);
        let c = compute_provenance("main { int x; }", [("", "main { int x; }")]);
        assert_eq!(a.source_hash, b.source_hash);
        assert_eq!(a.module_fingerprint, b.module_fingerprint);
        assert_ne!(a.source_hash, c.source_hash);
        assert_ne!(a.module_fingerprint, c.module_fingerprint);
        assert_eq!(a.source_hash_hex().len(), 64);
    }

    #[test]
    fn module_order_changes_fingerprint() {
        let a = compute_provenance("", [("x", "1"), ("y", "2")]);
        let b = compute_provenance("", [("y", "2"), ("x", "1")]);
        assert_ne!(a.module_fingerprint, b.module_fingerprint);
    }

    #[test]
    fn build_info_is_json() {
        let p = compute_provenance("main { }", [("", "main { }")]);
        let v: serde_json::Value = serde_json::from_str(&p.to_json()).unwrap();
        assert_eq!(v["source_hash"].as_str().unwrap(), p.source_hash_hex());
        assert_eq!(v["compiler_version"].as_str().unwrap(), env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = compile_file(&dir.path().join("nope.weft"), bare()).unwrap_err();
        assert!(matches!(err, CompileError::Io { .. }));
    }
}
