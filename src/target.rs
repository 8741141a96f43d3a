//! Input target list parsing (§6) and the `TargetRecord` entity (§3).

use std::path::PathBuf;

use tracing::warn;

/// One row of the input target list: a named recompilation unit, the binary it lives in, and
/// the mangled function names to recompile. `functions[0]` is the semantic "main" entry used
/// as the wrapper-generation convention (§6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetRecord {
    pub name: String,
    pub binary_path: PathBuf,
    pub functions: Vec<String>,
}

impl TargetRecord {
    pub fn entry_function(&self) -> Option<&str> {
        self.functions.first().map(|s| s.as_str())
    }
}

/// A placeholder used to protect a mangled name's own `::` separators while the function list
/// is split on `:`. Unlikely to occur in decompiler output.
const ESCAPE_SENTINEL: char = '\u{1}';

/// Parses one line of `target_name, binary_path, fn1:fn2:...:fnN`. Returns `None` (after
/// logging a warning) for malformed lines, blank lines, and `#`-comments.
pub fn parse_line(line: &str) -> Option<TargetRecord> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }

    let parts: Vec<&str> = trimmed.splitn(3, ',').map(|s| s.trim()).collect();
    if parts.len() != 3 || parts.iter().any(|p| p.is_empty()) {
        warn!("malformed target list line, skipping: {trimmed:?}");
        return None;
    }

    let escaped = parts[2].replace("::", &ESCAPE_SENTINEL.to_string());
    let functions: Vec<String> = escaped
        .split(':')
        .filter(|s| !s.is_empty())
        .map(|s| s.replace(ESCAPE_SENTINEL, "::"))
        .collect();

    if functions.is_empty() {
        warn!("target '{}' has no functions listed, skipping", parts[0]);
        return None;
    }

    Some(TargetRecord {
        name: parts[0].to_string(),
        binary_path: PathBuf::from(parts[1]),
        functions,
    })
}

/// Parses a whole target list file, logging and skipping malformed lines rather than failing
/// the run.
pub fn parse_target_list(content: &str) -> Vec<TargetRecord> {
    content.lines().filter_map(parse_line).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_simple_line() {
        let t = parse_line("svc, ./svc, cgc_WalkTree").unwrap();
        assert_eq!(t.name, "svc");
        assert_eq!(t.binary_path, PathBuf::from("./svc"));
        assert_eq!(t.functions, vec!["cgc_WalkTree".to_string()]);
    }

    #[test]
    fn splits_multiple_functions_on_colon() {
        let t = parse_line("svc,./svc,main:helper:cleanup").unwrap();
        assert_eq!(t.functions, vec!["main".to_string(), "helper".to_string(), "cleanup".to_string()]);
    }

    #[test]
    fn double_colon_in_a_mangled_name_is_preserved() {
        let t = parse_line("svc,./svc,Namespace::Method:other").unwrap();
        assert_eq!(t.functions, vec!["Namespace::Method".to_string(), "other".to_string()]);
    }

    #[test]
    fn blank_and_comment_lines_are_skipped() {
        assert!(parse_line("").is_none());
        assert!(parse_line("   ").is_none());
        assert!(parse_line("# a comment").is_none());
    }

    #[test]
    fn malformed_line_is_skipped_with_a_warning() {
        assert!(parse_line("not,enough").is_none());
    }

    #[test]
    fn parse_target_list_collects_only_well_formed_rows() {
        let content = "svc,./svc,main\n# comment\n\nbad,line\nsecond,./second,entry1:entry2\n";
        let targets = parse_target_list(content);
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].name, "svc");
        assert_eq!(targets[1].name, "second");
    }
}
