//! Stub Synthesizer (§4.6): turns an external [`FunctionProto`] reference into one of four
//! [`StubEntry`] kinds, depending on whether it collides with a standard I/O name, is imported
//! from glibc via the PLT, or is one of the fixed variadic glibc functions.

use crate::proto::FunctionProto;
use crate::symbol::SymbolFlags;

/// Names that collide with libc's own, requiring the local pointer to be renamed so the
/// generated translation unit doesn't redeclare a real libc symbol (§4.6).
const STDIO_COLLISION_NAMES: &[&str] = &[
    "printf", "fprintf", "sprintf", "snprintf", "scanf", "sscanf", "fscanf", "fopen", "fclose",
    "fread", "fwrite", "fgets", "fputs", "fputc", "fgetc", "puts", "putchar", "getchar", "stdin",
    "stdout", "stderr",
];

/// The fixed set of variadic glibc entry points that get a `va_list`-forwarding shim, mapped to
/// their `v`-prefixed counterpart (§4.6).
const VARIADIC_GLIBC: &[(&str, &str)] = &[
    ("printf", "vprintf"),
    ("fprintf", "vfprintf"),
    ("sprintf", "vsprintf"),
    ("scanf", "vscanf"),
    ("sscanf", "vsscanf"),
    ("fscanf", "vfscanf"),
];

fn variadic_counterpart(name: &str) -> Option<&'static str> {
    VARIADIC_GLIBC.iter().find(|(n, _)| *n == name).map(|(_, v)| *v)
}

fn is_stdio_collision(name: &str) -> bool {
    STDIO_COLLISION_NAMES.contains(&name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubKind {
    PlainStub,
    StdioCollisionStub,
    GlibcEbxStub,
    ValistGlibcStub,
}

/// One synthesized stub. `typedef_lines` and `pointer_line` always precede any `trampoline`
/// body in the emitted output. `call_site_name` is what local bodies are rewritten to call.
#[derive(Debug, Clone)]
pub struct StubEntry {
    pub name: String,
    pub kind: StubKind,
    pub typedef_lines: Vec<String>,
    pub pointer_line: String,
    pub trampoline: Option<String>,
    pub call_site_name: String,
    pub is_glibc: bool,
    pub is_weak: bool,
}

/// One externally-supplied symbol pointer this stub needs bound at wrapper time: the real
/// symbol name the binary must resolve, the local pointer variable it is cast into, and that
/// variable's typedef name. Most stubs need exactly one; the `va_list` shim needs two, since
/// the plain and the `v`-prefixed entry point are two distinct PLT symbols (§4.6, §8).
pub struct Binding {
    pub symbol_name: String,
    pub pointer_var: String,
    pub pointer_type: String,
    pub is_weak: bool,
}

impl StubEntry {
    pub fn bindings(&self) -> Vec<Binding> {
        match self.kind {
            StubKind::PlainStub => vec![Binding {
                symbol_name: self.name.clone(),
                pointer_var: self.name.clone(),
                pointer_type: format!("p{}", self.name),
                is_weak: self.is_weak,
            }],
            StubKind::StdioCollisionStub => vec![Binding {
                symbol_name: self.name.clone(),
                pointer_var: format!("x__{}", self.name),
                pointer_type: format!("p{}", self.name),
                is_weak: self.is_weak,
            }],
            StubKind::GlibcEbxStub => vec![Binding {
                symbol_name: self.name.clone(),
                pointer_var: format!("z__{}", self.name),
                pointer_type: format!("p{}", self.name),
                is_weak: self.is_weak,
            }],
            StubKind::ValistGlibcStub => {
                let vcounterpart = variadic_counterpart(&self.name).expect("valist stub has a v-counterpart");
                vec![
                    Binding {
                        symbol_name: self.name.clone(),
                        pointer_var: format!("z__{}", self.name),
                        pointer_type: format!("p{}", self.name),
                        is_weak: self.is_weak,
                    },
                    Binding {
                        symbol_name: vcounterpart.to_string(),
                        pointer_var: format!("z__{vcounterpart}"),
                        pointer_type: format!("p{vcounterpart}"),
                        is_weak: self.is_weak,
                    },
                ]
            }
        }
    }
}

/// Synthesizes the stub for one externally-referenced function, given the flags its `Symbol`
/// carries in the index.
pub fn synthesize(proto: &FunctionProto, flags: SymbolFlags) -> StubEntry {
    let is_glibc = flags.contains(SymbolFlags::GLIBC);
    let is_weak = flags.contains(SymbolFlags::WEAK);
    let pointer_kw = if is_weak { "*" } else { "" };

    if is_glibc {
        if let Some(vcounterpart) = variadic_counterpart(&proto.name) {
            return synthesize_valist(proto, vcounterpart, is_weak);
        }
        return synthesize_ebx_trampoline(proto, is_weak);
    }

    if is_stdio_collision(&proto.name) {
        let name = &proto.name;
        let ptr_ty = format!("p{name}");
        return StubEntry {
            name: name.clone(),
            kind: StubKind::StdioCollisionStub,
            typedef_lines: vec![format!("typedef {} (*{ptr_ty})({});", proto.return_type, proto.arg_types())],
            pointer_line: format!("{ptr_ty}{pointer_kw} x__{name} = NULL;"),
            trampoline: None,
            call_site_name: format!("x__{name}"),
            is_glibc,
            is_weak,
        };
    }

    let name = &proto.name;
    let ptr_ty = format!("p{name}");
    StubEntry {
        name: name.clone(),
        kind: StubKind::PlainStub,
        typedef_lines: vec![format!("typedef {} (*{ptr_ty})({});", proto.return_type, proto.arg_types())],
        pointer_line: format!("{ptr_ty}{pointer_kw} {name} = NULL;"),
        trampoline: None,
        call_site_name: name.clone(),
        is_glibc,
        is_weak,
    }
}

fn synthesize_ebx_trampoline(proto: &FunctionProto, is_weak: bool) -> StubEntry {
    let name = &proto.name;
    let ptr_ty = format!("p{name}");
    let pointer_kw = if is_weak { "*" } else { "" };
    let ret = &proto.return_type;
    let call_args = proto.arg_names();
    let return_stmt = if proto.is_void() {
        format!("z__{name}({call_args});")
    } else {
        format!("{ret} __ret = z__{name}({call_args});")
    };
    let trailer = if proto.is_void() { "" } else { "    return __ret;\n" };

    let trampoline = format!(
        "static {ret} x__{name}({params}) {{\n\
         \x20   unsigned int __save_ebx;\n\
         \x20   __asm__ __volatile__(\n\
         \x20       \"mov %%ebx, %0\\n\\t\"\n\
         \x20       \"mov %1, %%ebx\"\n\
         \x20       : \"=r\"(__save_ebx)\n\
         \x20       : \"r\"(origPLT_EBX)\n\
         \x20       : \"memory\"\n\
         \x20   );\n\
         \x20   {return_stmt}\n\
         \x20   __asm__ __volatile__(\n\
         \x20       \"mov %0, %%ebx\"\n\
         \x20       :\n\
         \x20       : \"r\"(__save_ebx)\n\
         \x20       : \"memory\"\n\
         \x20   );\n\
         {trailer}}}\n",
        params = proto.params_with_names(),
    );

    StubEntry {
        name: name.clone(),
        kind: StubKind::GlibcEbxStub,
        typedef_lines: vec![format!("typedef {ret} (*{ptr_ty})({});", proto.arg_types())],
        pointer_line: format!("{ptr_ty}{pointer_kw} z__{name} = NULL;"),
        trampoline: Some(trampoline),
        call_site_name: format!("x__{name}"),
        is_glibc: true,
        is_weak,
    }
}

fn synthesize_valist(proto: &FunctionProto, vcounterpart: &str, is_weak: bool) -> StubEntry {
    let name = &proto.name;
    let ptr_ty = format!("p{name}");
    let vptr_ty = format!("p{vcounterpart}");
    let pointer_kw = if is_weak { "*" } else { "" };
    let ret = &proto.return_type;

    // The fixed-arity prefix (everything before the variadic trailer) plus a `va_list` in
    // place of it, matching the real glibc `v...` signature.
    let fixed_types: Vec<String> = proto.params.iter().map(|p| p.ty.clone()).collect();
    let mut vparams = fixed_types.clone();
    vparams.push("va_list".to_string());
    let vargs = vparams.join(", ");

    let fixed_names = proto.arg_names();
    let last_fixed = proto.params.last().map(|p| p.name.clone()).unwrap_or_default();
    let forward_args = if fixed_names.is_empty() {
        "ap".to_string()
    } else {
        format!("{fixed_names}, ap")
    };

    let call = if proto.is_void() {
        format!("z__{vcounterpart}({forward_args});")
    } else {
        format!("{ret} __ret = z__{vcounterpart}({forward_args});")
    };
    let trailer = if proto.is_void() { "" } else { "    return __ret;\n" };

    let trampoline = format!(
        "static {ret} x__{name}({params}) {{\n\
         \x20   va_list ap;\n\
         \x20   va_start(ap, {last_fixed});\n\
         \x20   {call}\n\
         \x20   va_end(ap);\n\
         {trailer}}}\n",
        params = proto.params_with_names(),
    );

    StubEntry {
        name: name.clone(),
        kind: StubKind::ValistGlibcStub,
        typedef_lines: vec![
            format!("typedef {ret} (*{ptr_ty})({});", proto.arg_types()),
            format!("typedef {ret} (*{vptr_ty})({vargs});"),
        ],
        pointer_line: format!(
            "{ptr_ty}{pk} z__{name} = NULL;\n{vptr_ty}{pk} z__{vcounterpart} = NULL;",
            pk = pointer_kw,
        ),
        trampoline: Some(trampoline),
        call_site_name: format!("x__{name}"),
        is_glibc: true,
        is_weak,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::parse;

    #[test]
    fn plain_external_gets_typedef_and_null_pointer() {
        let proto = parse("int compute(int x);").unwrap();
        let stub = synthesize(&proto, SymbolFlags::empty());
        assert_eq!(stub.kind, StubKind::PlainStub);
        assert!(stub.typedef_lines[0].contains("typedef int (*pcompute)(int)"));
        assert_eq!(stub.pointer_line, "pcompute compute = NULL;");
        assert_eq!(stub.call_site_name, "compute");
    }

    #[test]
    fn stdio_collision_renames_the_pointer() {
        let proto = parse("int fopen_helper(char *path);").unwrap();
        // force the collision path via a colliding name directly
        let mut proto = proto;
        proto.name = "fopen".to_string();
        let stub = synthesize(&proto, SymbolFlags::empty());
        assert_eq!(stub.kind, StubKind::StdioCollisionStub);
        assert_eq!(stub.call_site_name, "x__fopen");
    }

    #[test]
    fn glibc_non_variadic_gets_ebx_trampoline() {
        let proto = parse("int malloc_wrap(int size);").unwrap();
        let mut proto = proto;
        proto.name = "malloc".to_string();
        let stub = synthesize(&proto, SymbolFlags::GLIBC);
        assert_eq!(stub.kind, StubKind::GlibcEbxStub);
        let tramp = stub.trampoline.unwrap();
        assert!(tramp.contains("origPLT_EBX"));
        assert!(tramp.contains("z__malloc"));
        assert_eq!(stub.call_site_name, "x__malloc");
    }

    #[test]
    fn variadic_glibc_gets_valist_shim() {
        let proto = parse("int printf(const char *fmt, ...);").unwrap();
        let stub = synthesize(&proto, SymbolFlags::GLIBC);
        assert_eq!(stub.kind, StubKind::ValistGlibcStub);
        assert!(stub.typedef_lines.iter().any(|l| l.contains("pvprintf")));
        let tramp = stub.trampoline.unwrap();
        assert!(tramp.contains("va_start"));
        assert!(tramp.contains("z__vprintf"));
        assert_eq!(stub.call_site_name, "x__printf");
    }

    #[test]
    fn valist_stub_needs_two_external_bindings() {
        let proto = parse("int printf(const char *fmt, ...);").unwrap();
        let stub = synthesize(&proto, SymbolFlags::GLIBC);
        let bindings = stub.bindings();
        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings[0].symbol_name, "printf");
        assert_eq!(bindings[1].symbol_name, "vprintf");
        assert_eq!(bindings[1].pointer_var, "z__vprintf");
    }

    #[test]
    fn plain_stub_needs_exactly_one_binding() {
        let proto = parse("int compute(int x);").unwrap();
        let stub = synthesize(&proto, SymbolFlags::empty());
        assert_eq!(stub.bindings().len(), 1);
    }

    #[test]
    fn weak_symbol_pointer_is_emitted_as_double_pointer() {
        let proto = parse("int maybe_present(void);").unwrap();
        let stub = synthesize(&proto, SymbolFlags::WEAK);
        assert!(stub.pointer_line.contains("pmaybe_present*"));
    }
}
