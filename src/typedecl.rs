//! The `TypeDecl` entity (§3) and the classifier half of the Type Resolver (§4.3): turns one
//! normalized declaration line into a tagged-variant record with its dependency set computed.
//!
//! The ordering algorithm that consumes these lives in [`crate::resolver`].

use std::collections::BTreeSet;

use regex::Regex;
use std::sync::OnceLock;
use tracing::debug;

/// Primitive and standard-header type names that are always considered already defined, per
/// the invariant in §3 ("(a) primitives, (b) standard-header types"). Standard-header types
/// are folded into the same set here since this engine never emits a definition for them
/// either way -- only the resolver's `#include` report (§4.3) distinguishes the two for the
/// downstream preamble.
pub const PRIMITIVES: &[&str] = &[
    "void", "char", "short", "int", "long", "float", "double", "_Bool", "signed", "unsigned",
    "size_t", "ssize_t", "wchar_t", "FILE", "va_list", "int8_t", "int16_t", "int32_t", "int64_t",
    "uint8_t", "uint16_t", "uint32_t", "uint64_t", "intptr_t", "uintptr_t", "ptrdiff_t",
];

pub fn is_primitive(name: &str) -> bool {
    PRIMITIVES.contains(&name)
}

/// The recognized declaration shapes (§4.3 Classification).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclKind {
    PoundDefine,
    ForwardStruct,
    ForwardUnion,
    Enum,
    SimpleTypedef,
    Struct,
    Union,
    TypedefStruct,
    TypedefUnion,
    FnPtrTypedef,
}

impl DeclKind {
    pub fn is_struct_like(self) -> bool {
        matches!(self, DeclKind::Struct | DeclKind::TypedefStruct)
    }

    pub fn is_union_like(self) -> bool {
        matches!(self, DeclKind::Union | DeclKind::TypedefUnion)
    }

    pub fn is_forward(self) -> bool {
        matches!(self, DeclKind::ForwardStruct | DeclKind::ForwardUnion)
    }
}

/// A single parsed declaration, as described in §3.
#[derive(Debug, Clone)]
pub struct TypeDecl {
    pub kind: DeclKind,
    /// The name(s) this declaration introduces. A plain `struct`/`union`/`enum` has one; a
    /// `typedef struct TAG { .. } ALIAS;` introduces both `TAG` and `ALIAS`.
    pub names: Vec<String>,
    /// The base or return type, when the shape has one (simple typedef, enum base, fn-ptr
    /// return type).
    pub base: Option<String>,
    /// Every type name this declaration's by-value and by-reference fields mention.
    pub requires: BTreeSet<String>,
    /// The rendered source line. The resolver may rewrite this to prepend `struct`/`union`/
    /// `enum` keywords ahead of forward-declared uses (§4.3 Substitution rules).
    pub line: String,
}

impl TypeDecl {
    /// The name used to key this declaration in the dependency graph: the typedef alias if
    /// there is one, else the struct/union/enum tag.
    pub fn primary_name(&self) -> &str {
        self.names.last().map(|s| s.as_str()).unwrap_or("")
    }

    pub fn self_references(&self) -> bool {
        self.names.iter().any(|n| self.requires.contains(n))
    }
}

fn re_define() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^#define\s+(\w+)\s+(.*)$").unwrap())
}

fn re_forward() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(struct|union)\s+(\w+)\s*;$").unwrap())
}

fn re_enum() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^enum\s+(\w+)\s*(?::\s*(\w+)\s*)?\{(.*)\}\s*;$").unwrap())
}

fn re_simple_typedef() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^typedef\s+([\w\s\*]+?)\s+(\**\w+)\s*;$").unwrap())
}

fn re_struct_def() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(struct|union)\s+(\w+)\s*\{(.*)\}\s*;$").unwrap())
}

fn re_typedef_struct() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^typedef\s+(struct|union)\s+(\w+)\s*\{(.*)\}\s*(\w+)\s*;$").unwrap()
    })
}

fn re_fnptr_typedef() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^typedef\s+(.+?)\s*\(\s*\*\s*(\w+)\s*\)\s*\((.*)\)\s*;$").unwrap())
}

/// Strips pointer stars, `const`/`volatile`, and a leading `struct`/`union`/`enum` keyword,
/// leaving a bare type name (§4.3: "stripping pointer stars, const, volatile, bitfield widths,
/// and struct/union/enum prefixes").
pub fn strip_type_modifiers(raw: &str) -> String {
    let mut s = raw.trim();
    for kw in ["const", "volatile"] {
        let prefixed = format!("{kw} ");
        if let Some(rest) = s.strip_prefix(&prefixed) {
            s = rest.trim();
        }
    }
    let s = s.trim_end_matches('*').trim();
    let s = s.trim_start_matches('*').trim();
    for kw in ["struct", "union", "enum"] {
        let prefixed = format!("{kw} ");
        if let Some(rest) = s.strip_prefix(&prefixed) {
            return rest.trim().to_string();
        }
    }
    s.to_string()
}

/// Splits a struct/union body on top-level `;` and, for each field, extracts the type it
/// requires. Bitfield widths (`int flags : 4`) are dropped before extraction.
fn field_requirements(body: &str) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    for field in body.split(';') {
        let field = field.split(':').next().unwrap_or("").trim();
        if field.is_empty() {
            continue;
        }
        if let Some((ret, params)) = parse_fnptr_field(field) {
            add_type_token(&mut out, &ret);
            for p in params.split(',') {
                let p = p.trim();
                if !p.is_empty() && p != "void" {
                    add_type_token(&mut out, p);
                }
            }
            continue;
        }
        // "TYPE name" or "TYPE *name" -- the type is everything but the final identifier.
        let trimmed = field.trim_end_matches(|c: char| c == '*' || c.is_whitespace());
        if let Some(idx) = trimmed.rfind(|c: char| c.is_whitespace() || c == '*') {
            add_type_token(&mut out, &field[..=idx]);
        } else {
            add_type_token(&mut out, field);
        }
    }
    out
}

/// Recognizes `RET (*name)(PARAMS)` shaped fields, returning `(ret, params)`.
fn parse_fnptr_field(field: &str) -> Option<(String, String)> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"^(.+?)\(\s*\*\s*\w+\s*\)\s*\((.*)\)$").unwrap());
    re.captures(field).map(|c| (c[1].trim().to_string(), c[2].trim().to_string()))
}

fn add_type_token(out: &mut BTreeSet<String>, raw: &str) {
    let base = strip_type_modifiers(raw);
    if !base.is_empty() && base.chars().next().map(|c| c.is_alphabetic() || c == '_').unwrap_or(false) {
        out.insert(base);
    }
}

/// Classifies one normalized declaration line into a [`TypeDecl`].
///
/// Returns `None` for lines that match none of the fixed shapes; callers are expected to log
/// and skip those, per §4.3 ("Unmatched lines are logged and skipped").
pub fn classify(line: &str) -> Option<TypeDecl> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    if let Some(c) = re_define().captures(line) {
        return Some(TypeDecl {
            kind: DeclKind::PoundDefine,
            names: vec![c[1].to_string()],
            base: None,
            requires: BTreeSet::new(),
            line: line.to_string(),
        });
    }

    if let Some(c) = re_typedef_struct().captures(line) {
        let kw = &c[1];
        let tag = c[2].to_string();
        let body = &c[3];
        let alias = c[4].to_string();
        let mut requires = field_requirements(body);
        requires.remove(&tag);
        return Some(TypeDecl {
            kind: if kw == "struct" { DeclKind::TypedefStruct } else { DeclKind::TypedefUnion },
            names: vec![tag, alias],
            base: None,
            requires,
            line: line.to_string(),
        });
    }

    if let Some(c) = re_struct_def().captures(line) {
        let kw = &c[1];
        let tag = c[2].to_string();
        let body = &c[3];
        let mut requires = field_requirements(body);
        requires.remove(&tag);
        return Some(TypeDecl {
            kind: if kw == "struct" { DeclKind::Struct } else { DeclKind::Union },
            names: vec![tag],
            base: None,
            requires,
            line: line.to_string(),
        });
    }

    if let Some(c) = re_enum().captures(line) {
        let name = c[1].to_string();
        let base = c.get(2).map(|m| m.as_str().to_string());
        return Some(TypeDecl {
            kind: DeclKind::Enum,
            names: vec![name],
            base,
            requires: BTreeSet::new(),
            line: line.to_string(),
        });
    }

    if let Some(c) = re_forward().captures(line) {
        let kw = &c[1];
        let name = c[2].to_string();
        return Some(TypeDecl {
            kind: if kw == "struct" { DeclKind::ForwardStruct } else { DeclKind::ForwardUnion },
            names: vec![name],
            base: None,
            requires: BTreeSet::new(),
            line: line.to_string(),
        });
    }

    if let Some(c) = re_fnptr_typedef().captures(line) {
        let ret = c[1].trim().to_string();
        let name = c[2].to_string();
        let params = &c[3];
        let mut requires = BTreeSet::new();
        add_type_token(&mut requires, &ret);
        for p in params.split(',') {
            let p = p.trim();
            if !p.is_empty() && p != "void" && p != "..." {
                add_type_token(&mut requires, p);
            }
        }
        return Some(TypeDecl {
            kind: DeclKind::FnPtrTypedef,
            names: vec![name],
            base: Some(strip_type_modifiers(&ret)),
            requires,
            line: line.to_string(),
        });
    }

    if let Some(c) = re_simple_typedef().captures(line) {
        let base_raw = c[1].trim().to_string();
        let name = c[2].trim_start_matches('*').to_string();
        let base = strip_type_modifiers(&base_raw);
        let mut requires = BTreeSet::new();
        if !base.is_empty() {
            requires.insert(base.clone());
        }
        return Some(TypeDecl {
            kind: DeclKind::SimpleTypedef,
            names: vec![name],
            base: Some(base),
            requires,
            line: line.to_string(),
        });
    }

    debug!("unrecognized declaration shape: {line:?}");
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_pound_define() {
        let d = classify("#define MAX_SIZE 128").unwrap();
        assert_eq!(d.kind, DeclKind::PoundDefine);
        assert_eq!(d.names, vec!["MAX_SIZE"]);
    }

    #[test]
    fn classifies_forward_struct() {
        let d = classify("struct Node;").unwrap();
        assert_eq!(d.kind, DeclKind::ForwardStruct);
        assert_eq!(d.names, vec!["Node"]);
    }

    #[test]
    fn classifies_enum_with_base() {
        let d = classify("enum Color : int { RED, GREEN, BLUE };").unwrap();
        assert_eq!(d.kind, DeclKind::Enum);
        assert_eq!(d.base, Some("int".to_string()));
    }

    #[test]
    fn classifies_simple_typedef_and_requires_base() {
        let d = classify("typedef unsigned int uint_t;").unwrap();
        assert_eq!(d.kind, DeclKind::SimpleTypedef);
        assert!(d.requires.contains("unsigned int") || d.requires.contains("int"));
    }

    #[test]
    fn classifies_struct_definition_and_pointer_fields() {
        let d = classify("struct A { struct B *next; int value; };").unwrap();
        assert_eq!(d.kind, DeclKind::Struct);
        assert!(d.requires.contains("B"));
        assert!(d.requires.contains("int"));
    }

    #[test]
    fn self_referencing_struct_excludes_its_own_name_from_requires_check() {
        let d = classify("struct Node { struct Node *next; };").unwrap();
        assert!(d.self_references());
    }

    #[test]
    fn classifies_typedef_struct_with_alias() {
        let d = classify("typedef struct Point { int x; int y; } PointT;").unwrap();
        assert_eq!(d.kind, DeclKind::TypedefStruct);
        assert_eq!(d.names, vec!["Point".to_string(), "PointT".to_string()]);
    }

    #[test]
    fn classifies_function_pointer_typedef_with_param_and_return_requirements() {
        let d = classify("typedef struct Ctx *(*pHandler)(struct Ctx *, int);").unwrap();
        assert_eq!(d.kind, DeclKind::FnPtrTypedef);
        assert!(d.requires.contains("Ctx"));
    }

    #[test]
    fn unrecognized_shape_returns_none() {
        assert!(classify("this is not a declaration at all").is_none());
    }
}
