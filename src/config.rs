//! Configuration resolution (§10.3): CLI flag, then environment variable, then compiled-in
//! default. Resolved once into a [`Config`] that the rest of the pipeline treats as read-only.

use std::env;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Default location of the `idat`-style decompiler binary when nothing else is configured.
fn default_decompiler_path() -> PathBuf {
    if let Ok(base) = env::var("IDA_BASE_DIR") {
        return PathBuf::from(base).join("idat");
    }
    let home = env::var("HOME").unwrap_or_else(|_| "/root".to_string());
    PathBuf::from(home).join("seclab_ida/ida/idat")
}

/// Arguments accepted by the binary, mirrored here so [`Config::resolve`] doesn't need to know
/// about `clap`.
pub struct CliArgs {
    pub target_list: PathBuf,
    pub output_dir: PathBuf,
    pub detour_prefix: String,
    pub decompiler_path: Option<PathBuf>,
    pub secondary_decompiler_cmd: Option<String>,
    pub typedef_script: Option<PathBuf>,
    pub work_dir: Option<PathBuf>,
    pub verbose: u8,
}

/// Fully resolved, immutable configuration for one run of the pipeline.
#[derive(Debug, Clone)]
pub struct Config {
    pub target_list: PathBuf,
    pub output_dir: PathBuf,
    pub detour_prefix: String,
    pub decompiler_path: PathBuf,
    pub secondary_decompiler_cmd: Option<String>,
    pub typedef_script: PathBuf,
    pub work_dir: PathBuf,
    pub verbose: u8,
}

impl Config {
    pub fn resolve(args: CliArgs) -> Result<Config> {
        let decompiler_path = args.decompiler_path.unwrap_or_else(default_decompiler_path);
        if !decompiler_path.is_file() {
            return Err(Error::Environment(format!(
                "decompiler binary not found at {}; set --decompiler-path or IDA_BASE_DIR",
                decompiler_path.display(),
            )));
        }

        let typedef_script = args
            .typedef_script
            .unwrap_or_else(|| PathBuf::from("get_ida_details.py"));

        let work_dir = args
            .work_dir
            .unwrap_or_else(env::temp_dir);

        Ok(Config {
            target_list: args.target_list,
            output_dir: args.output_dir,
            detour_prefix: args.detour_prefix,
            decompiler_path,
            secondary_decompiler_cmd: args.secondary_decompiler_cmd,
            typedef_script,
            work_dir,
            verbose: args.verbose,
        })
    }

    pub fn cache_path_for(&self, target: &str, function: &str) -> PathBuf {
        self.work_dir.join(format!("{target}.{function}.cache.c"))
    }

    pub fn symbol_index_cache_path(&self, binary: &Path) -> PathBuf {
        let stem = binary
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "binary".to_string());
        self.work_dir.join(format!("{stem}.symbols.cache"))
    }

    pub fn target_dir(&self, target: &str) -> PathBuf {
        self.output_dir.join(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_path_is_namespaced_by_target_and_function() {
        let cfg = Config {
            target_list: PathBuf::from("targets.list"),
            output_dir: PathBuf::from("out"),
            detour_prefix: "det_".into(),
            decompiler_path: PathBuf::from("/bin/true"),
            secondary_decompiler_cmd: None,
            typedef_script: PathBuf::from("get_ida_details.py"),
            work_dir: PathBuf::from("/tmp/prd-work"),
            verbose: 0,
        };
        let a = cfg.cache_path_for("svc", "cgc_WalkTree");
        let b = cfg.cache_path_for("svc", "other_fn");
        assert_ne!(a, b);
        assert!(a.to_string_lossy().contains("svc"));
        assert!(a.to_string_lossy().contains("cgc_WalkTree"));
    }
}
