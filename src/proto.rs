//! `FunctionProto` (§3): a parsed C function prototype, shared by the splitter, stub
//! synthesizer, dependency propagator, and wrapper emitter.

use std::sync::OnceLock;

use regex::Regex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    pub ty: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionProto {
    pub name: String,
    pub return_type: String,
    pub params: Vec<Param>,
    pub is_variadic: bool,
    pub is_external: bool,
    pub is_glibc: bool,
    pub is_weak: bool,
}

impl FunctionProto {
    pub fn arg_types(&self) -> String {
        let mut parts: Vec<String> = self.params.iter().map(|p| p.ty.clone()).collect();
        if self.is_variadic {
            parts.push("...".to_string());
        }
        if parts.is_empty() {
            "void".to_string()
        } else {
            parts.join(", ")
        }
    }

    pub fn params_with_names(&self) -> String {
        let mut parts: Vec<String> = self
            .params
            .iter()
            .map(|p| format!("{} {}", p.ty, p.name))
            .collect();
        if self.is_variadic {
            parts.push("...".to_string());
        }
        if parts.is_empty() {
            "void".to_string()
        } else {
            parts.join(", ")
        }
    }

    pub fn arg_names(&self) -> String {
        self.params.iter().map(|p| p.name.clone()).collect::<Vec<_>>().join(", ")
    }

    pub fn is_void(&self) -> bool {
        self.return_type.trim() == "void"
    }
}

fn proto_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*(.+?)\s+(\w+)\s*\((.*)\)\s*;?\s*(//.*)?$").unwrap())
}

/// Parses a single prototype line (`RET NAME(TYPE name, ...);`) into a [`FunctionProto`].
/// `is_external`/`is_glibc`/`is_weak` are not determinable from the text alone and are left
/// `false`; callers reconcile them against the [`crate::symbol::SymbolIndex`].
pub fn parse(line: &str) -> Option<FunctionProto> {
    let c = proto_regex().captures(line.trim())?;
    let return_type = c[1].trim().to_string();
    let name = c[2].to_string();
    let (params, is_variadic) = split_params(&c[3]);
    Some(FunctionProto {
        name,
        return_type,
        params,
        is_variadic,
        is_external: false,
        is_glibc: false,
        is_weak: false,
    })
}

fn split_params(list: &str) -> (Vec<Param>, bool) {
    let list = list.trim();
    if list.is_empty() || list == "void" {
        return (Vec::new(), false);
    }

    let mut chunks = Vec::new();
    let mut depth = 0i32;
    let mut current = String::new();
    for ch in list.chars() {
        match ch {
            '(' => {
                depth += 1;
                current.push(ch);
            }
            ')' => {
                depth -= 1;
                current.push(ch);
            }
            ',' if depth == 0 => {
                chunks.push(std::mem::take(&mut current));
            }
            _ => current.push(ch),
        }
    }
    if !current.trim().is_empty() {
        chunks.push(current);
    }

    let mut params = Vec::new();
    let mut is_variadic = false;
    for (i, chunk) in chunks.iter().enumerate() {
        let chunk = chunk.trim();
        if chunk == "..." {
            is_variadic = true;
            continue;
        }
        let trimmed = chunk.trim_end_matches(|c: char| c == '*' || c.is_whitespace());
        let (ty, name) = match trimmed.rfind(|c: char| c.is_whitespace() || c == '*') {
            Some(idx) => (chunk[..=idx].trim().to_string(), chunk[idx + 1..].to_string()),
            None => (chunk.to_string(), format!("a{i}")),
        };
        let name = if name.is_empty() { format!("a{i}") } else { name };
        params.push(Param { ty, name });
    }
    (params, is_variadic)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_simple_prototype() {
        let p = parse("int foo(int x, char *y);").unwrap();
        assert_eq!(p.name, "foo");
        assert_eq!(p.return_type, "int");
        assert_eq!(p.params.len(), 2);
        assert_eq!(p.params[0], Param { ty: "int".into(), name: "x".into() });
        assert_eq!(p.params[1], Param { ty: "char *".into(), name: "y".into() });
    }

    #[test]
    fn detects_variadic_trailer() {
        let p = parse("int printf(const char *fmt, ...);").unwrap();
        assert!(p.is_variadic);
        assert_eq!(p.arg_types(), "const char *, ...");
    }

    #[test]
    fn void_parameter_list_yields_no_params() {
        let p = parse("void run(void);").unwrap();
        assert!(p.params.is_empty());
        assert_eq!(p.arg_types(), "void");
    }

    #[test]
    fn unnamed_parameters_get_synthesized_names() {
        let p = parse("int add(int, int);").unwrap();
        assert_eq!(p.params[0].name, "a0");
        assert_eq!(p.params[1].name, "a1");
    }
}
