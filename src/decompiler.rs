//! Function Decompiler Driver (§4.4): obtains pseudo-source for a target's functions, caching
//! per invocation and falling back to a secondary decompiler when the primary output shows a
//! known defect pattern.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use regex::Regex;
use std::sync::OnceLock;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};

/// Abstracts the external decompiler invocation (§6: `DECOMP -Ohexrays:-nosave:<outfile_base>:
/// <fn1:fn2:...> -A <binary>`) so tests can supply a fixture instead of spawning `idat`.
pub trait DecompilerInvoker {
    /// Runs the decompiler against `functions` (joined with `:` per §6) and returns the raw
    /// contents of `<outfile_base>.c`.
    fn invoke(&self, outfile_base: &Path, functions: &[String], binary: &Path) -> Result<String>;
}

/// The real `idat`-style decompiler, invoked as a subprocess.
pub struct ExternalDecompiler {
    pub command: PathBuf,
}

impl DecompilerInvoker for ExternalDecompiler {
    fn invoke(&self, outfile_base: &Path, functions: &[String], binary: &Path) -> Result<String> {
        let joined = functions.join(":");
        let arg = format!(
            "-Ohexrays:-nosave:{}:{}",
            outfile_base.display(),
            joined
        );
        let status = Command::new(&self.command)
            .arg(arg)
            .arg("-A")
            .arg(binary)
            .status()
            .map_err(|e| Error::spawn(self.command.display().to_string(), e))?;
        if !status.success() {
            warn!("decompiler exited with {status}");
        }
        let out_path = outfile_base.with_extension("c");
        Ok(fs::read_to_string(&out_path).unwrap_or_default())
    }
}

/// Invokes the type-dump contract (§6: `DECOMP -B -S"<script>" -A <binary>`, `IDALOG` pointed
/// at a writable path) and returns the log file's contents for the Type Harvester to chew on.
pub fn harvest_type_dump(command: &Path, typedef_script: &Path, work_dir: &Path, binary: &Path) -> Result<String> {
    let stem = binary.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_else(|| "binary".to_string());
    let log_path = work_dir.join(format!("{stem}.idalog"));

    let status = Command::new(command)
        .arg("-B")
        .arg(format!("-S{}", typedef_script.display()))
        .arg("-A")
        .arg(binary)
        .env("IDALOG", &log_path)
        .status()
        .map_err(|e| Error::spawn(command.display().to_string(), e))?;
    if !status.success() {
        warn!("type-dump invocation exited with {status}");
    }
    Ok(fs::read_to_string(&log_path).unwrap_or_default())
}

/// Abstracts the optional secondary decompiler (§6: shell command template with `<SYM>`/`<BIN>`
/// placeholders).
pub trait SecondaryDecompiler {
    fn invoke(&self, symbol: &str, binary: &Path) -> Result<String>;
}

/// Runs the configured shell command template through `sh -c`.
pub struct ShellSecondaryDecompiler {
    pub template: String,
}

impl SecondaryDecompiler for ShellSecondaryDecompiler {
    fn invoke(&self, symbol: &str, binary: &Path) -> Result<String> {
        let command = self
            .template
            .replace("<SYM>", symbol)
            .replace("<BIN>", &binary.display().to_string());
        let output = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .output()
            .map_err(|e| Error::spawn(command.clone(), e))?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Matches the decompiler-defect pattern named in §4.4: a by-value address-of reference to a
/// locally-synthesized `dwordNNN` temporary, which hex-rays occasionally emits in place of the
/// real parameter name.
fn defect_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)&\w*dword\d+\w*").unwrap())
}

pub fn has_known_defect(source: &str) -> bool {
    defect_pattern().is_match(source)
}

fn load_cache(path: &Path) -> Option<String> {
    match fs::metadata(path) {
        Ok(meta) if meta.len() > 0 => fs::read_to_string(path).ok(),
        _ => None,
    }
}

fn save_cache(path: &Path, content: &str) -> Result<()> {
    fs::write(path, content).map_err(|e| Error::io(path, e))
}

/// Obtains decompiled pseudo-source for every function in `functions`, belonging to `target` in
/// `binary`. A per-target cache file (keyed by the joined function list, since the underlying
/// decompiler call itself batches them -- §4.4) is consulted first; on miss the primary
/// decompiler runs, and the secondary decompiler is consulted only if the primary's output
/// shows the known defect pattern.
pub fn decompile_functions(
    cfg: &Config,
    primary: &dyn DecompilerInvoker,
    secondary: Option<&dyn SecondaryDecompiler>,
    target: &str,
    binary: &Path,
    functions: &[String],
) -> Result<String> {
    let cache_key = functions.join(":");
    let cache_path = cfg.cache_path_for(target, &cache_key);

    if let Some(cached) = load_cache(&cache_path) {
        debug!("cache hit for target '{target}' functions [{cache_key}]");
        return Ok(cached);
    }

    let outfile_base = cfg.work_dir.join(format!("{target}.{cache_key}"));
    info!("decompiling target '{target}' functions [{cache_key}]");
    let mut source = primary.invoke(&outfile_base, functions, binary)?;

    if source.trim().is_empty() {
        return Err(Error::DecompilationFailed {
            target: target.to_string(),
            function: cache_key,
        });
    }

    if has_known_defect(&source) {
        if let Some(secondary) = secondary {
            warn!("primary decompiler output for '{target}' shows the known defect pattern, trying secondary decompiler");
            if let Ok(replacement) = secondary.invoke(&functions[0], binary) {
                if !replacement.trim().is_empty() {
                    source = replacement;
                }
            }
        }
    }

    save_cache(&cache_path, &source)?;
    Ok(source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct FixtureDecompiler {
        output: String,
    }

    impl DecompilerInvoker for FixtureDecompiler {
        fn invoke(&self, _outfile_base: &Path, _functions: &[String], _binary: &Path) -> Result<String> {
            Ok(self.output.clone())
        }
    }

    struct FixtureSecondary {
        calls: RefCell<Vec<String>>,
        output: String,
    }

    impl SecondaryDecompiler for FixtureSecondary {
        fn invoke(&self, symbol: &str, _binary: &Path) -> Result<String> {
            self.calls.borrow_mut().push(symbol.to_string());
            Ok(self.output.clone())
        }
    }

    fn test_config(work_dir: &Path) -> Config {
        Config {
            target_list: PathBuf::from("targets.list"),
            output_dir: PathBuf::from("out"),
            detour_prefix: "det_".into(),
            decompiler_path: PathBuf::from("/bin/true"),
            secondary_decompiler_cmd: None,
            typedef_script: PathBuf::from("get_ida_details.py"),
            work_dir: work_dir.to_path_buf(),
            verbose: 0,
        }
    }

    #[test]
    fn empty_primary_output_is_a_decompilation_failure() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let primary = FixtureDecompiler { output: String::new() };
        let err = decompile_functions(&cfg, &primary, None, "svc", Path::new("./svc"), &["f".to_string()])
            .unwrap_err();
        assert!(matches!(err, Error::DecompilationFailed { .. }));
    }

    #[test]
    fn defect_pattern_triggers_secondary_decompiler() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let primary = FixtureDecompiler { output: "x = &dword12345;\n".to_string() };
        let secondary = FixtureSecondary {
            calls: RefCell::new(Vec::new()),
            output: "clean source\n".to_string(),
        };
        let out = decompile_functions(&cfg, &primary, Some(&secondary), "svc", Path::new("./svc"), &["f".to_string()])
            .unwrap();
        assert_eq!(out, "clean source\n");
        assert_eq!(secondary.calls.borrow().as_slice(), &["f".to_string()]);
    }

    #[test]
    fn clean_output_does_not_consult_secondary() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let primary = FixtureDecompiler { output: "int f(void) { return 0; }\n".to_string() };
        let secondary = FixtureSecondary { calls: RefCell::new(Vec::new()), output: String::new() };
        let out = decompile_functions(&cfg, &primary, Some(&secondary), "svc", Path::new("./svc"), &["f".to_string()])
            .unwrap();
        assert!(out.contains("return 0"));
        assert!(secondary.calls.borrow().is_empty());
    }

    #[test]
    fn second_call_hits_the_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let primary = FixtureDecompiler { output: "int f(void) { return 1; }\n".to_string() };
        decompile_functions(&cfg, &primary, None, "svc", Path::new("./svc"), &["f".to_string()]).unwrap();

        let primary_again = FixtureDecompiler { output: "should not be used".to_string() };
        let out = decompile_functions(&cfg, &primary_again, None, "svc", Path::new("./svc"), &["f".to_string()])
            .unwrap();
        assert!(out.contains("return 1"));
    }
}
