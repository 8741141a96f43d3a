//! CLI entry point (§6): parses arguments, resolves configuration, runs the type-dump and the
//! per-target pipeline, and reports the process exit code.

mod config;
mod decompiler;
mod error;
mod proto;
mod propagate;
mod pipeline;
mod resolver;
mod splitter;
mod stub;
mod symbol;
mod target;
mod typedecl;
mod typeharvest;
mod wrapper;

use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use config::{CliArgs, Config};
use decompiler::{ExternalDecompiler, ShellSecondaryDecompiler};
use error::Error;
use pipeline::RunContext;
use symbol::ExternalDemangler;

/// Decompiler post-processor and recompilation-harness generator.
#[derive(Parser, Debug)]
#[command(name = "prd-recompiler", version, about)]
struct Cli {
    /// Path to the target list (one `name, binary, fn1:fn2:...` row per line).
    target_list: PathBuf,

    /// Directory artifacts are written to, one subdirectory per target.
    output_dir: PathBuf,

    /// Prefix applied to synthesized detour function names.
    #[arg(long, default_value = "det_")]
    detour_prefix: String,

    /// Path to the `idat`-style decompiler. Defaults to `$IDA_BASE_DIR/idat` or
    /// `~/seclab_ida/ida/idat`.
    #[arg(long)]
    decompiler_path: Option<PathBuf>,

    /// Shell command template for the secondary decompiler, with `<SYM>`/`<BIN>` placeholders.
    #[arg(long, env = "PRD_SECONDARY_DECOMPILER")]
    secondary_decompiler_cmd: Option<String>,

    /// Script passed to `-S` when dumping type information.
    #[arg(long)]
    typedef_script: Option<PathBuf>,

    /// Scratch directory for caches and the decompiler's temporary output. Defaults to the
    /// system temp directory.
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// Increase log verbosity; repeat for more (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn install_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    install_logging(cli.verbose);

    let cfg = Config::resolve(CliArgs {
        target_list: cli.target_list,
        output_dir: cli.output_dir,
        detour_prefix: cli.detour_prefix,
        decompiler_path: cli.decompiler_path,
        secondary_decompiler_cmd: cli.secondary_decompiler_cmd,
        typedef_script: cli.typedef_script,
        work_dir: cli.work_dir,
        verbose: cli.verbose,
    })
    .context("resolving configuration")?;

    fs::create_dir_all(&cfg.work_dir).with_context(|| format!("creating work dir {}", cfg.work_dir.display()))?;
    fs::create_dir_all(&cfg.output_dir).with_context(|| format!("creating output dir {}", cfg.output_dir.display()))?;

    let list_content = fs::read_to_string(&cfg.target_list)
        .with_context(|| format!("reading target list {}", cfg.target_list.display()))?;
    let targets = target::parse_target_list(&list_content);
    if targets.is_empty() {
        anyhow::bail!("target list {} contained no usable rows", cfg.target_list.display());
    }

    let primary = ExternalDecompiler { command: cfg.decompiler_path.clone() };
    let secondary = cfg
        .secondary_decompiler_cmd
        .clone()
        .map(|template| ShellSecondaryDecompiler { template });
    let demangler = ExternalDemangler::default();

    let mut ctx = RunContext::new(cfg.clone());

    let mut type_dumps: std::collections::HashMap<PathBuf, String> = std::collections::HashMap::new();
    for target in &targets {
        if !type_dumps.contains_key(&target.binary_path) {
            let dump = decompiler::harvest_type_dump(
                &cfg.decompiler_path,
                &cfg.typedef_script,
                &cfg.work_dir,
                &target.binary_path,
            )
            .with_context(|| format!("dumping types for {}", target.binary_path.display()))?;
            type_dumps.insert(target.binary_path.clone(), dump);
        }
    }

    for target in &targets {
        let type_dump = type_dumps.get(&target.binary_path).map(|s| s.as_str()).unwrap_or("");
        ctx.process_target(target, &primary, secondary.as_ref().map(|s| s as _), &demangler, type_dump);
    }

    let code = pipeline::summarize(&ctx.outcomes);
    if code != 0 && ctx.outcomes.iter().all(|o| matches!(o, pipeline::TargetOutcome::Failure { .. })) {
        return Err(Error::NoTargetsSucceeded.into());
    }
    std::process::exit(code);
}
