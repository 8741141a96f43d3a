//! Dependency Propagator (§4.7): transitively closes each target's external requirements over
//! its locally-called functions, producing the deterministic ordering the wrapper's parameter
//! list follows.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::Regex;
use tracing::trace;

use crate::symbol::SymbolIndex;

/// What one decompiled function body references, before transitive closure.
#[derive(Debug, Clone, Default)]
pub struct FunctionDeps {
    pub name: String,
    pub external_stubs: BTreeSet<String>,
    pub external_data: BTreeSet<String>,
    pub local_callees: BTreeSet<String>,
}

fn call_site() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b([A-Za-z_]\w*)\s*\(").unwrap())
}

fn bare_identifier() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b[A-Za-z_]\w*\b").unwrap())
}

/// Scans one decompiled function body for calls and data references, classifying each against
/// the known local-function-name set and the symbol index.
pub fn analyze_function(name: &str, body: &str, symbols: &SymbolIndex, local_names: &BTreeSet<String>) -> FunctionDeps {
    let mut deps = FunctionDeps { name: name.to_string(), ..Default::default() };

    for c in call_site().captures_iter(body) {
        let callee = &c[1];
        if callee == name {
            continue;
        }
        if local_names.contains(callee) {
            deps.local_callees.insert(callee.to_string());
        } else if symbols.function_symbol_names().contains(&callee) {
            deps.external_stubs.insert(callee.to_string());
        }
    }

    let data_names: BTreeSet<&str> = symbols.data_symbol_names().into_iter().collect();
    for m in bare_identifier().find_iter(body) {
        let word = m.as_str();
        if data_names.contains(word) {
            deps.external_data.insert(word.to_string());
        }
    }

    trace!(
        "function '{name}': {} external stub(s), {} external datum(a), {} local callee(s)",
        deps.external_stubs.len(),
        deps.external_data.len(),
        deps.local_callees.len(),
    );
    deps
}

/// A target's fully-propagated requirement lists, already sorted: this order *is* the
/// wrapper's stub/data parameter order (§3, §4.8).
#[derive(Debug, Default)]
pub struct TargetDeps {
    pub stubs: Vec<String>,
    pub data: Vec<String>,
}

/// Computes the transitive closure of `target_functions` over `local_callees`, unioning in the
/// external stubs and data reached along the way.
pub fn propagate(
    all_functions: &std::collections::HashMap<String, FunctionDeps>,
    target_functions: &[String],
) -> TargetDeps {
    let mut stubs = BTreeSet::new();
    let mut data = BTreeSet::new();
    let mut visited: BTreeSet<String> = BTreeSet::new();
    let mut stack: Vec<String> = target_functions.to_vec();

    while let Some(f) = stack.pop() {
        if !visited.insert(f.clone()) {
            continue;
        }
        if let Some(deps) = all_functions.get(&f) {
            stubs.extend(deps.external_stubs.iter().cloned());
            data.extend(deps.external_data.iter().cloned());
            for callee in &deps.local_callees {
                if !visited.contains(callee) {
                    stack.push(callee.clone());
                }
            }
        }
    }

    TargetDeps { stubs: stubs.into_iter().collect(), data: data.into_iter().collect() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol::{IdentityDemangler, SymbolIndex};
    use std::collections::HashMap;

    fn index_with(listing: &str) -> SymbolIndex {
        SymbolIndex::build(listing, &IdentityDemangler).unwrap()
    }

    #[test]
    fn classifies_calls_as_local_or_external() {
        let symbols = index_with("deadbeef T printf\n");
        let locals: BTreeSet<String> = ["helper".to_string()].into_iter().collect();
        let deps = analyze_function("main", "helper(1); printf(\"hi\");", &symbols, &locals);
        assert!(deps.local_callees.contains("helper"));
        assert!(deps.external_stubs.contains("printf"));
    }

    #[test]
    fn picks_up_bare_data_symbol_references() {
        let symbols = index_with("0000cafe D g_count\n");
        let locals = BTreeSet::new();
        let deps = analyze_function("f", "g_count = g_count + 1;", &symbols, &locals);
        assert!(deps.external_data.contains("g_count"));
    }

    #[test]
    fn propagation_reaches_through_shared_local_helper() {
        let mut all = HashMap::new();
        all.insert(
            "target_a".to_string(),
            FunctionDeps { name: "target_a".into(), local_callees: ["h".to_string()].into_iter().collect(), ..Default::default() },
        );
        all.insert(
            "target_b".to_string(),
            FunctionDeps { name: "target_b".into(), local_callees: ["h".to_string()].into_iter().collect(), ..Default::default() },
        );
        all.insert(
            "h".to_string(),
            FunctionDeps { name: "h".into(), external_stubs: ["printf".to_string()].into_iter().collect(), ..Default::default() },
        );

        let a = propagate(&all, &["target_a".to_string()]);
        let b = propagate(&all, &["target_b".to_string()]);
        assert_eq!(a.stubs, vec!["printf".to_string()]);
        assert_eq!(b.stubs, vec!["printf".to_string()]);
    }

    #[test]
    fn result_lists_are_sorted_for_determinism() {
        let mut all = HashMap::new();
        all.insert(
            "t".to_string(),
            FunctionDeps {
                name: "t".into(),
                external_stubs: ["zeta".to_string(), "alpha".to_string()].into_iter().collect(),
                ..Default::default()
            },
        );
        let out = propagate(&all, &["t".to_string()]);
        assert_eq!(out.stubs, vec!["alpha".to_string(), "zeta".to_string()]);
    }
}
