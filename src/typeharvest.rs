//! Type Harvester (§4.2): turns the decompiler's global type dump into a normalized
//! declaration stream, one logical declaration per line, ready for [`crate::typedecl`].

use regex::Regex;
use std::sync::OnceLock;

const TYPEDEF_START: &str = "============================== START ==============================";
const TYPEDEF_END: &str = "============================== END ==============================";

/// Word-boundary renames applied by the artifact pass (§4.2). Order matters: `bool` must be
/// bounced through `_BoolDef` so the later `int`/`char` substitutions don't clobber it, since
/// hex-rays' own `_Bool` typedef would otherwise collide with the C99 keyword.
const ARTIFACT_RENAMES: &[(&str, &str)] = &[
    ("int64", "long"),
    ("int32", "int"),
    ("int16", "short"),
    ("int8", "char"),
    ("_DWORD", "int"),
    ("_WORD", "short"),
    ("_BYTE", "char"),
    ("_UNKNOWN", "void"),
    ("__long", "long"),
    ("__int", "int"),
    ("__short", "short"),
    ("__char", "char"),
];

/// Extracts the region of `raw` between the fixed sentinel comments the type-dump contract
/// (§6) promises, dropping the sentinels themselves. Returns an empty string if either marker
/// is absent.
pub fn extract_region(raw: &str) -> String {
    let mut latch = false;
    let mut out = String::new();
    for line in raw.lines() {
        if line.contains(TYPEDEF_START) {
            latch = true;
            continue;
        }
        if line.contains(TYPEDEF_END) {
            latch = false;
            continue;
        }
        if latch {
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

/// Collapses inline `/* ... */` comments to a blank line (preserving line structure so later
/// offsets stay meaningful), while leaving `#define` lines untouched.
pub fn collapse_comments(region: &str) -> String {
    let mut out = String::new();
    for line in region.lines() {
        if line.trim_start().starts_with("#define") {
            out.push_str(line);
            out.push('\n');
            continue;
        }
        if line.contains("/*") && line.contains("*/") {
            out.push('\n');
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// Splits a line holding more than one logical declaration into one declaration per line.
/// Lines with brace bodies (`struct`/`union`/`enum` definitions) are left intact, since a `;`
/// inside a brace body does not terminate the declaration.
pub fn split_joined_declarations(text: &str) -> String {
    let mut out = String::new();
    for line in text.lines() {
        if !line.contains('{') && !line.contains('}') && line.matches(';').count() > 1 {
            out.push_str(&line.replace(';', ";\n"));
            out.push('\n');
        } else {
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

fn renames_regex(pattern: &str) -> Regex {
    Regex::new(&format!(r"\b{}\b", regex::escape(pattern))).expect("static pattern is valid")
}

/// Applies the fixed word-boundary renames (§4.2) plus the `bool` round-trip workaround.
pub fn rewrite_artifacts(text: &str) -> String {
    static BOOL_TO_STAGING: OnceLock<Regex> = OnceLock::new();
    static STAGING_TO_DEF: OnceLock<Regex> = OnceLock::new();

    let mut rewritten = text.to_string();

    // Stage `bool` through an intermediate name so the generic substitutions below can't
    // re-clobber it before it reaches its final `_Bool` form.
    let bool_re = BOOL_TO_STAGING.get_or_init(|| renames_regex("bool"));
    rewritten = bool_re.replace_all(&rewritten, "_BoolStaging").into_owned();

    for (from, to) in ARTIFACT_RENAMES {
        let re = renames_regex(from);
        rewritten = re.replace_all(&rewritten, *to).into_owned();
    }

    let staging_re = STAGING_TO_DEF.get_or_init(|| renames_regex("_BoolStaging"));
    rewritten = staging_re.replace_all(&rewritten, "_BoolDef").into_owned();

    rewritten
}

/// Runs the full harvester pipeline over a raw type-dump transcript.
pub fn harvest(raw: &str) -> String {
    let region = extract_region(raw);
    let collapsed = collapse_comments(&region);
    let split = split_joined_declarations(&collapsed);
    rewrite_artifacts(&split)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_only_the_delimited_region() {
        let raw = format!(
            "noise before\n{TYPEDEF_START}\ntypedef int foo;\n{TYPEDEF_END}\nnoise after\n"
        );
        let region = extract_region(&raw);
        assert_eq!(region, "typedef int foo;\n");
    }

    #[test]
    fn collapses_inline_comments_but_keeps_defines() {
        let region = "typedef int foo; /* a comment */\n#define BAR 1\n";
        let collapsed = collapse_comments(region);
        assert_eq!(collapsed, "\n#define BAR 1\n");
    }

    #[test]
    fn splits_multiple_declarations_per_line() {
        let text = "typedef int a; typedef int b;\n";
        let split = split_joined_declarations(text);
        assert_eq!(split, "typedef int a;\n typedef int b;\n\n");
    }

    #[test]
    fn leaves_brace_bodies_intact_even_with_many_semicolons() {
        let text = "struct foo { int a; int b; };\n";
        let split = split_joined_declarations(text);
        assert_eq!(split, text);
    }

    #[test]
    fn rewrites_artifact_type_names() {
        let text = "typedef __int64 Quad;\ntypedef _DWORD Word;\n";
        let out = rewrite_artifacts(text);
        assert_eq!(out, "typedef long Quad;\ntypedef int Word;\n");
    }

    #[test]
    fn bool_survives_the_int_substitution_roundtrip() {
        let out = rewrite_artifacts("typedef bool Flag;\n");
        assert_eq!(out, "typedef _BoolDef Flag;\n");
    }
}
