//! Wrapper Emitter (§4.8): synthesizes the externally-callable entry function, its `main`
//! harness, and the machine-readable artifacts (§6) that describe the detour binding.

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use crate::proto::FunctionProto;
use crate::stub::StubEntry;
use crate::target::TargetRecord;

/// A global variable referenced by decompiled code (§3). `rank` is the declared array arity;
/// rank >= 2 is flagged and passed through as an opaque pointer with no `#define` accessor,
/// per the multi-dimensional-array Non-goal (§1).
#[derive(Debug, Clone)]
pub struct DataDecl {
    pub name: String,
    pub base_type: String,
    pub rank: usize,
    pub is_two_dim: bool,
    pub original_line: String,
    pub pointer_alias_line: String,
    pub define_accessor: Option<String>,
}

fn data_decl_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(.+?)\s+(\w+)((?:\s*\[\s*\d*\s*\])*)\s*;?\s*$").unwrap())
}

/// Parses one line from the Section Splitter's data-declaration region into a [`DataDecl`].
pub fn parse_data_decl(line: &str) -> Option<DataDecl> {
    let c = data_decl_regex().captures(line.trim())?;
    let base_type = c[1].trim().to_string();
    let name = c[2].to_string();
    let rank = c[3].matches('[').count();
    let is_two_dim = rank >= 2;

    let pointer_alias_line = if is_two_dim {
        format!("void *p{name} = NULL; // rank {rank} array, passed opaque")
    } else {
        format!("{base_type} *p{name} = NULL;")
    };

    let define_accessor = if is_two_dim {
        None
    } else if rank == 1 {
        Some(format!("#define {name}(i) (p{name}[i])"))
    } else {
        Some(format!("#define {name} (*p{name})"))
    };

    Some(DataDecl {
        name,
        base_type,
        rank,
        is_two_dim,
        original_line: line.trim().to_string(),
        pointer_alias_line,
        define_accessor,
    })
}

/// Emitted artifacts for one target: the entry function, its `main` harness, the makefile
/// fragment, and the JSON record, all per §6.
pub struct WrapperArtifacts {
    pub detour_name: String,
    pub entry_function: String,
    pub main_function: String,
    pub funcstubs_line: String,
    pub makefile_fragment: String,
    pub json_record: WrapperJson,
}

#[derive(Debug, Serialize)]
pub struct WrapperJson {
    pub bin: String,
    pub detour_bin: String,
    pub mysrc: String,
    pub myrep: String,
    pub detour_prefix: String,
    pub detours: Vec<String>,
    pub funcstubs: Vec<String>,
}

fn detour_name_for(entry_name: &str, prefix: &str) -> String {
    if entry_name == "main" {
        "patchmain".to_string()
    } else {
        format!("{prefix}{entry_name}")
    }
}

fn detour_binding(entry_name: &str, detour_name: &str) -> String {
    if entry_name == "main" {
        format!("{detour_name}:main+7")
    } else {
        format!("{detour_name}:{entry_name}")
    }
}

/// Emits every artifact for one target. `stubs` and `data` must already be in the
/// deterministic order the [`crate::propagate`] stage produced (§3: "this ordering *is* the
/// wrapper's parameter ordering").
pub fn emit(
    target: &TargetRecord,
    entry_proto: &FunctionProto,
    stubs: &[StubEntry],
    data: &[DataDecl],
    detour_prefix: &str,
) -> WrapperArtifacts {
    let needs_ebx = stubs.iter().any(|s| s.is_glibc);
    let detour_name = detour_name_for(&entry_proto.name, detour_prefix);

    let bindings: Vec<_> = stubs.iter().flat_map(|s| s.bindings()).collect();

    let mut params = Vec::new();
    if needs_ebx {
        params.push("void* EBX".to_string());
    }
    for binding in &bindings {
        let ptr_ty = if binding.is_weak { "void**" } else { "void*" };
        params.push(format!("{ptr_ty} my{}", binding.symbol_name));
    }
    for d in data {
        params.push(format!("void* my{}", d.name));
    }
    for p in &entry_proto.params {
        params.push(format!("{} {}", p.ty, p.name));
    }
    if entry_proto.is_variadic {
        params.push("...".to_string());
    }

    let mut body = String::new();
    if needs_ebx {
        body.push_str("    origPLT_EBX = (unsigned int)EBX;\n");
    }
    for binding in &bindings {
        let cast_ty = if binding.is_weak { format!("{}*", binding.pointer_type) } else { binding.pointer_type.clone() };
        body.push_str(&format!(
            "    {} = ({cast_ty}) my{};\n",
            binding.pointer_var, binding.symbol_name
        ));
    }
    for d in data {
        let cast_ty = if d.is_two_dim { "void".to_string() } else { d.base_type.clone() };
        body.push_str(&format!("    p{} = ({} *) my{};\n", d.name, cast_ty, d.name));
    }
    body.push_str("    __prd_init();\n");

    let call_args = entry_proto.arg_names();
    if entry_proto.is_void() {
        body.push_str(&format!("    {}({call_args});\n", entry_proto.name));
    } else {
        body.push_str(&format!("    {} __result = {}({call_args});\n", entry_proto.return_type, entry_proto.name));
    }
    body.push_str("    __prd_exit();\n");
    body.push_str(&format!("    /* ASM STACK {} HERE */\n", entry_proto.name));
    if !entry_proto.is_void() {
        body.push_str("    return __result;\n");
    }

    let entry_function = format!(
        "{} {}({}) {{\n{body}}}\n",
        entry_proto.return_type,
        detour_name,
        params.join(", "),
    );

    let main_function = emit_main(&detour_name, entry_proto);

    let symbols: Vec<String> = bindings.iter().map(|b| b.symbol_name.clone()).collect();
    let funcstubs_line = format!("{}:{}", detour_name, symbols.join(","));

    let binary_display = target.binary_path.display().to_string();
    let detours = vec![detour_binding(&entry_proto.name, &detour_name)];

    let makefile_fragment = format!(
        "BIN = {bin}\n\
         DETOUR_BIN = {target}_patched\n\
         MYSRC = {target}_recomp.c\n\
         MYREP = {target}\n\
         DETOUR_PREFIX = {prefix}\n\
         DETOUR_DEFS = extern {ret} {detour_name}({params});\n\
         DETOUR_CALLS = {detour_name}\n\
         DETOURS = {detours}\n\
         FUNCINSERT_PARAMS = {param_count}\n",
        bin = binary_display,
        target = target.name,
        prefix = detour_prefix,
        ret = entry_proto.return_type,
        params = entry_proto.arg_types(),
        detours = detours.join(" "),
        param_count = bindings.len() + data.len() + usize::from(needs_ebx),
    );

    let json_record = WrapperJson {
        bin: binary_display,
        detour_bin: format!("{}_patched", target.name),
        mysrc: format!("{}_recomp.c", target.name),
        myrep: target.name.clone(),
        detour_prefix: detour_prefix.to_string(),
        detours,
        funcstubs: vec![funcstubs_line.clone()],
    };

    WrapperArtifacts {
        detour_name,
        entry_function,
        main_function,
        funcstubs_line,
        makefile_fragment,
        json_record,
    }
}

/// Emits a `main` that exercises the detour with all-NULL (or typed-zero) arguments,
/// allocating heap storage for by-value struct/union arguments (§4.8).
fn emit_main(detour_name: &str, entry_proto: &FunctionProto) -> String {
    let mut decls = Vec::new();
    let mut arg_exprs = Vec::new();

    for (i, p) in entry_proto.params.iter().enumerate() {
        let var = format!("__arg{i}");
        let trimmed_ty = p.ty.trim();
        let is_pointer = trimmed_ty.ends_with('*');
        let is_aggregate = trimmed_ty.starts_with("struct ") || trimmed_ty.starts_with("union ");

        if is_aggregate && !is_pointer {
            decls.push(format!(
                "    {ty} *{var} = ({ty} *) malloc(sizeof({ty}));",
                ty = trimmed_ty
            ));
            arg_exprs.push(format!("*{var}"));
        } else if is_pointer {
            decls.push(format!("    {trimmed_ty} {var} = NULL;"));
            arg_exprs.push(var);
        } else {
            decls.push(format!("    {trimmed_ty} {var} = 0;"));
            arg_exprs.push(var);
        }
    }

    format!(
        "int main(void) {{\n{decls}\n    {detour_name}({args});\n    return 0;\n}}\n",
        decls = decls.join("\n"),
        args = arg_exprs.join(", "),
    )
}
