//! Section Splitter (§4.5): partitions one decompiled translation unit into prototype, data,
//! and per-function body regions, using the sentinel markers from §6.

use std::sync::OnceLock;

use regex::Regex;
use tracing::{debug, trace};

/// One function body, still raw hex-rays text.
#[derive(Debug, Clone)]
pub struct FunctionBody {
    pub address: String,
    pub text: String,
}

/// The three regions of a decompiled translation unit.
#[derive(Debug, Default)]
pub struct SplitResult {
    pub prototypes: Vec<String>,
    pub data_decls: Vec<String>,
    pub bodies: Vec<FunctionBody>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    SeekProtos,
    Protos,
    SeekData,
    Data,
    SeekBody,
    Bodies,
}

fn body_header() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^//----- \(([0-9A-Fa-fXx]+)\)").unwrap())
}

fn guessed_type_comment() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^//\s*\S+:\s*using guessed type\s+(.+?);?\s*$").unwrap())
}

fn declared_name(line: &str) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"(\w+)\s*\(").unwrap());
    re.captures(line).map(|c| c[1].to_string())
}

/// Splits `raw` into prototype, data, and body regions.
///
/// Guessed-type hint comments (`// ADDR: using guessed type ...`) are kept as tentative
/// prototypes and discarded once a concrete (non-comment) declaration for the same name shows
/// up later in the prototype region.
pub fn split(raw: &str) -> SplitResult {
    let mut state = State::SeekProtos;
    let mut concrete: Vec<(String, String)> = Vec::new();
    let mut guessed: Vec<(String, String)> = Vec::new();
    let mut data_decls = Vec::new();
    let mut bodies: Vec<FunctionBody> = Vec::new();
    let mut current: Option<FunctionBody> = None;

    for line in raw.lines() {
        match state {
            State::SeekProtos => {
                if line.contains("// Function declarations") {
                    state = State::Protos;
                }
            }
            State::Protos => {
                if line.trim_start().starts_with("//-----") {
                    state = State::SeekData;
                    continue;
                }
                if line.trim().is_empty() {
                    continue;
                }
                if let Some(c) = guessed_type_comment().captures(line) {
                    let decl = c[1].to_string();
                    if let Some(name) = declared_name(&decl) {
                        trace!("tentative guessed-type prototype for '{name}'");
                        guessed.push((name, format!("{decl};")));
                    }
                } else if let Some(name) = declared_name(line) {
                    concrete.push((name, line.to_string()));
                }
            }
            State::SeekData => {
                if line.contains("// Data declarations") {
                    state = State::Data;
                }
            }
            State::Data => {
                if line.trim_start().starts_with("//-----") {
                    state = State::SeekBody;
                    continue;
                }
                if !line.trim().is_empty() {
                    data_decls.push(line.to_string());
                }
            }
            State::SeekBody | State::Bodies => {
                if let Some(c) = body_header().captures(line) {
                    if let Some(body) = current.take() {
                        bodies.push(body);
                    }
                    current = Some(FunctionBody { address: c[1].to_string(), text: String::new() });
                    state = State::Bodies;
                } else if let Some(body) = current.as_mut() {
                    body.text.push_str(line);
                    body.text.push('\n');
                }
            }
        }
    }
    if let Some(body) = current.take() {
        bodies.push(body);
    }

    let concrete_names: std::collections::HashSet<&str> =
        concrete.iter().map(|(n, _)| n.as_str()).collect();
    let mut prototypes: Vec<String> = concrete.into_iter().map(|(_, line)| line).collect();
    for (name, line) in guessed {
        if !concrete_names.contains(name.as_str()) {
            debug!("keeping guessed-type prototype for '{name}', no concrete declaration found");
            prototypes.push(line);
        }
    }

    SplitResult { prototypes, data_decls, bodies }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_protos_data_and_bodies() {
        let raw = "\
// Function declarations
int foo(int x);
//-----
// Data declarations
int g_counter;
//-----
//----- (00401000) ----------
int foo(int x)
{
  return x;
}
";
        let out = split(raw);
        assert_eq!(out.prototypes, vec!["int foo(int x);".to_string()]);
        assert_eq!(out.data_decls, vec!["int g_counter;".to_string()]);
        assert_eq!(out.bodies.len(), 1);
        assert_eq!(out.bodies[0].address, "00401000");
        assert!(out.bodies[0].text.contains("return x;"));
    }

    #[test]
    fn multiple_bodies_are_each_captured() {
        let raw = "\
// Function declarations
//-----
// Data declarations
//-----
//----- (00401000) ----------
int a(void) { return 1; }
//----- (00401100) ----------
int b(void) { return 2; }
";
        let out = split(raw);
        assert_eq!(out.bodies.len(), 2);
        assert_eq!(out.bodies[1].address, "00401100");
    }

    #[test]
    fn guessed_prototype_is_discarded_once_concrete_one_is_seen() {
        let raw = "\
// Function declarations
// 00401000: using guessed type int helper();
int helper(int a, int b);
//-----
// Data declarations
//-----
";
        let out = split(raw);
        assert_eq!(out.prototypes, vec!["int helper(int a, int b);".to_string()]);
    }

    #[test]
    fn guessed_prototype_survives_when_no_concrete_declaration_follows() {
        let raw = "\
// Function declarations
// 00401000: using guessed type int mystery();
//-----
// Data declarations
//-----
";
        let out = split(raw);
        assert_eq!(out.prototypes, vec!["int mystery();".to_string()]);
    }
}
