//! CLI / Orchestration Driver (§4.9): wires the eight stages together per target, with stages
//! 1-3 cached per binary and stages 4-8 run per target. Holds the `RunContext` (§3) that
//! replaces the original script's module-level globals with fields passed by reference.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{error, info, warn};

use crate::config::Config;
use crate::decompiler::{self, DecompilerInvoker, SecondaryDecompiler};
use crate::error::{Error, Result};
use crate::proto::{self, FunctionProto};
use crate::propagate::{self, FunctionDeps};
use crate::resolver::{self, ResolvedOutput};
use crate::splitter;
use crate::stub::{self, StubEntry};
use crate::symbol::{Demangler, SymbolIndex};
use crate::target::TargetRecord;
use crate::typedecl;
use crate::typeharvest;
use crate::wrapper::{self, DataDecl};

/// Stages 1-3's output, reused across every target that shares a binary within one run.
pub struct BinaryArtifacts {
    pub symbol_index: SymbolIndex,
    pub resolved_types: ResolvedOutput,
}

/// The outcome of running stages 4-8 for one target, per §4.9 and §5.
#[derive(Debug)]
pub enum TargetOutcome {
    Success { name: String },
    Partial { name: String, failed_functions: Vec<String> },
    Failure { name: String, reason: String },
}

impl TargetOutcome {
    pub fn name(&self) -> &str {
        match self {
            TargetOutcome::Success { name }
            | TargetOutcome::Partial { name, .. }
            | TargetOutcome::Failure { name, .. } => name,
        }
    }
}

/// Per-run state threaded by reference through every stage (§3 `RunContext`).
pub struct RunContext {
    pub config: Config,
    binary_cache: HashMap<PathBuf, BinaryArtifacts>,
    pub outcomes: Vec<TargetOutcome>,
}

impl RunContext {
    pub fn new(config: Config) -> RunContext {
        RunContext { config, binary_cache: HashMap::new(), outcomes: Vec::new() }
    }

    /// Runs (or reuses the cache for) the Symbol Index, Type Harvester, and Type Resolver
    /// stages for one binary.
    fn binary_artifacts(
        &mut self,
        binary: &Path,
        demangler: &dyn Demangler,
        type_dump: &str,
    ) -> Result<&BinaryArtifacts> {
        if !self.binary_cache.contains_key(binary) {
            info!("processing binary '{}'", binary.display());

            let cache_path = self.config.symbol_index_cache_path(binary);
            let symbol_index = match SymbolIndex::load_cached(&cache_path)? {
                Some(idx) => {
                    info!("symbol index cache hit for '{}'", binary.display());
                    idx
                }
                None => {
                    let listing = crate::symbol::list_symbols(binary)?;
                    let idx = SymbolIndex::build(&listing, demangler)?;
                    idx.save_cache(&cache_path)?;
                    idx
                }
            };

            let normalized = typeharvest::harvest(type_dump);
            let decls: Vec<_> = normalized
                .lines()
                .filter_map(|l| {
                    let l = l.trim();
                    if l.is_empty() {
                        None
                    } else {
                        typedecl::classify(l)
                    }
                })
                .collect();
            let resolved_types = resolver::resolve(decls);

            self.binary_cache.insert(
                binary.to_path_buf(),
                BinaryArtifacts { symbol_index, resolved_types },
            );
        }
        Ok(self.binary_cache.get(binary).expect("just inserted"))
    }

    /// Runs stages 4-8 for one target and writes its artifacts to `<outdir>/<target>/`.
    pub fn process_target(
        &mut self,
        target: &TargetRecord,
        primary: &dyn DecompilerInvoker,
        secondary: Option<&dyn SecondaryDecompiler>,
        demangler: &dyn Demangler,
        type_dump: &str,
    ) {
        info!("processing target '{}'", target.name);
        match self.try_process_target(target, primary, secondary, demangler, type_dump) {
            Ok(outcome) => self.outcomes.push(outcome),
            Err(e) => {
                error!("target '{}' failed: {e}", target.name);
                self.outcomes.push(TargetOutcome::Failure { name: target.name.clone(), reason: e.to_string() });
            }
        }
    }

    fn try_process_target(
        &mut self,
        target: &TargetRecord,
        primary: &dyn DecompilerInvoker,
        secondary: Option<&dyn SecondaryDecompiler>,
        demangler: &dyn Demangler,
        type_dump: &str,
    ) -> Result<TargetOutcome> {
        self.binary_artifacts(&target.binary_path, demangler, type_dump)?;

        let raw = decompiler::decompile_functions(
            &self.config,
            primary,
            secondary,
            &target.name,
            &target.binary_path,
            &target.functions,
        );
        let raw = match raw {
            Ok(raw) => raw,
            Err(Error::DecompilationFailed { .. }) => {
                return Ok(TargetOutcome::Failure {
                    name: target.name.clone(),
                    reason: "no function in this target produced decompiled output".to_string(),
                });
            }
            Err(e) => return Err(e),
        };

        let split = splitter::split(&raw);
        let mut prototypes: HashMap<String, FunctionProto> = split
            .prototypes
            .iter()
            .filter_map(|l| proto::parse(l))
            .map(|p| (p.name.clone(), p))
            .collect();
        for body in &split.bodies {
            if let Some(p) = body.text.lines().next().and_then(proto::parse) {
                prototypes.entry(p.name.clone()).or_insert(p);
            }
        }

        let local_names: BTreeSet<String> = split.bodies.iter().filter_map(|b| first_function_name(&b.text)).collect();

        let binary_artifacts = self.binary_cache.get(&target.binary_path).expect("populated above");
        let symbol_index = &binary_artifacts.symbol_index;

        let mut function_deps: HashMap<String, FunctionDeps> = HashMap::new();
        let mut failed_functions = Vec::new();
        for body in &split.bodies {
            let Some(name) = first_function_name(&body.text) else {
                continue;
            };
            if body.text.trim().is_empty() {
                failed_functions.push(name);
                continue;
            }
            let deps = propagate::analyze_function(&name, &body.text, symbol_index, &local_names);
            function_deps.insert(name, deps);
        }

        if failed_functions.len() == target.functions.len() {
            return Ok(TargetOutcome::Failure {
                name: target.name.clone(),
                reason: "every function in this target failed to decompile".to_string(),
            });
        }

        let entry_name = target
            .functions
            .iter()
            .find(|f| !failed_functions.contains(f))
            .ok_or_else(|| Error::DecompilationFailed { target: target.name.clone(), function: "entry".into() })?;

        let entry_proto = prototypes.get(entry_name).cloned().unwrap_or(FunctionProto {
            name: entry_name.clone(),
            return_type: "int".to_string(),
            params: Vec::new(),
            is_variadic: false,
            is_external: false,
            is_glibc: false,
            is_weak: false,
        });

        let propagated = propagate::propagate(&function_deps, std::slice::from_ref(entry_name));

        let mut resolved_stub_names = Vec::new();
        for name in &propagated.stubs {
            match symbol_index.resolve_with_heuristics(name) {
                Some(resolved) => resolved_stub_names.push(resolved),
                None => warn!("dropping unresolvable external symbol '{name}' from target '{}'", target.name),
            }
        }

        let stub_entries: Vec<StubEntry> = resolved_stub_names
            .iter()
            .map(|name| {
                let flags = symbol_index.get(name).map(|s| s.flags()).unwrap_or_default();
                let proto = prototypes.get(name).cloned().unwrap_or_else(|| placeholder_proto(name));
                stub::synthesize(&proto, flags)
            })
            .collect();

        let data_decls: Vec<DataDecl> = split
            .data_decls
            .iter()
            .filter_map(|l| wrapper::parse_data_decl(l))
            .filter(|d| propagated.data.contains(&d.name))
            .collect();

        let artifacts = wrapper::emit(target, &entry_proto, &stub_entries, &data_decls, &self.config.detour_prefix);

        self.write_target_artifacts(target, &artifacts, &prototypes, &split, &stub_entries, &data_decls)?;

        if failed_functions.is_empty() {
            Ok(TargetOutcome::Success { name: target.name.clone() })
        } else {
            Ok(TargetOutcome::Partial { name: target.name.clone(), failed_functions })
        }
    }

    fn write_target_artifacts(
        &self,
        target: &TargetRecord,
        artifacts: &wrapper::WrapperArtifacts,
        prototypes: &HashMap<String, FunctionProto>,
        split: &splitter::SplitResult,
        stubs: &[StubEntry],
        data: &[DataDecl],
    ) -> Result<()> {
        let dir = self.config.target_dir(&target.name);
        fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;

        let mut recomp = String::new();
        recomp.push_str("#include \"defs.h\"\n#include \"resolved-types.h\"\n\n");
        for stub in stubs {
            for line in &stub.typedef_lines {
                recomp.push_str(line);
                recomp.push('\n');
            }
            recomp.push_str(&stub.pointer_line);
            recomp.push('\n');
            if let Some(tramp) = &stub.trampoline {
                recomp.push_str(tramp);
            }
        }
        for d in data {
            recomp.push_str(&d.pointer_alias_line);
            recomp.push('\n');
            if let Some(def) = &d.define_accessor {
                recomp.push_str(def);
                recomp.push('\n');
            }
        }
        let local_names: BTreeSet<String> = split.bodies.iter().filter_map(|b| first_function_name(&b.text)).collect();
        recomp.push_str("// local function forward declarations\n");
        for name in &local_names {
            if let Some(p) = prototypes.get(name) {
                recomp.push_str(&format!("{} {}({});\n", p.return_type, p.name, p.arg_types()));
            }
        }
        recomp.push('\n');
        for body in &split.bodies {
            recomp.push_str(&body.text);
            recomp.push('\n');
        }
        recomp.push_str(&artifacts.entry_function);
        recomp.push('\n');
        recomp.push_str(&artifacts.main_function);

        let recomp_path = dir.join(format!("{}_recomp.c", target.name));
        fs::write(&recomp_path, &recomp).map_err(|e| Error::io(&recomp_path, e))?;

        let types_path = dir.join("resolved-types.h");
        fs::write(&types_path, self.binary_cache[&target.binary_path].resolved_types.render())
            .map_err(|e| Error::io(&types_path, e))?;

        let funcstubs_path = dir.join(format!("{}_funcstubs", target.name));
        fs::write(&funcstubs_path, format!("{}\n", artifacts.funcstubs_line)).map_err(|e| Error::io(&funcstubs_path, e))?;

        let mk_path = dir.join("prd_include.mk");
        fs::write(&mk_path, &artifacts.makefile_fragment).map_err(|e| Error::io(&mk_path, e))?;

        let json_path = dir.join("prd_info.json");
        let json = serde_json::to_string_pretty(&artifacts.json_record).map_err(Error::Serialize)?;
        fs::write(&json_path, json).map_err(|e| Error::io(&json_path, e))?;

        Ok(())
    }
}

fn placeholder_proto(name: &str) -> FunctionProto {
    FunctionProto {
        name: name.to_string(),
        return_type: "int".to_string(),
        params: Vec::new(),
        is_variadic: false,
        is_external: true,
        is_glibc: false,
        is_weak: false,
    }
}

fn first_function_name(body: &str) -> Option<String> {
    proto::parse(body.lines().next()?).map(|p| p.name)
}

/// Prints the end-of-run summary (§4.9) and computes the process exit code (§6: non-zero iff
/// any target suffered a full decompilation failure).
pub fn summarize(outcomes: &[TargetOutcome]) -> i32 {
    let succeeded: Vec<&str> = outcomes.iter().filter(|o| matches!(o, TargetOutcome::Success { .. })).map(|o| o.name()).collect();
    let partial: Vec<&str> = outcomes.iter().filter(|o| matches!(o, TargetOutcome::Partial { .. })).map(|o| o.name()).collect();
    let failed: Vec<&str> = outcomes.iter().filter(|o| matches!(o, TargetOutcome::Failure { .. })).map(|o| o.name()).collect();

    info!("{} succeeded: {:?}", succeeded.len(), succeeded);
    info!("{} partially succeeded: {:?}", partial.len(), partial);
    info!("{} failed: {:?}", failed.len(), failed);

    if failed.is_empty() {
        0
    } else {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_is_nonzero_when_any_target_fully_failed() {
        let outcomes = vec![
            TargetOutcome::Success { name: "a".into() },
            TargetOutcome::Failure { name: "b".into(), reason: "boom".into() },
        ];
        assert_eq!(summarize(&outcomes), 1);
    }

    #[test]
    fn exit_code_is_zero_when_only_partial_and_success() {
        let outcomes = vec![
            TargetOutcome::Success { name: "a".into() },
            TargetOutcome::Partial { name: "b".into(), failed_functions: vec!["f".into()] },
        ];
        assert_eq!(summarize(&outcomes), 0);
    }
}
