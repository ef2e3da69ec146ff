//! The binary entrypoint for `quack`, the cache-backed build executor.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, crate_version};
use color_eyre::{
    Result,
    eyre::{Context, bail, eyre},
};
use colored::Colorize;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::warn;
use tracing_subscriber::util::SubscriberInitExt;

use quack::cache::{BackendKind, CloudBackend, LocalBackend, disk_driver};
use quack::ci::CiEnvironment;
use quack::config::Config;
use quack::executor;
use quack::model::TargetExecutionMode;
use quack::runtime::Runtime;
use quack::spec::{SPEC_FILENAME, Spec};

// Since this is a binary crate, we need to ensure these modules aren't pub
// so that they can correctly warn about dead code. Relatedly, in this file
// specifically nothing should be `pub`.
mod log;

#[derive(Clone, Debug, Parser)]
#[command(
    name = "quack",
    about = "Cache-backed build executor",
    version = crate_version!(),
)]
struct TopLevelFlags {
    /// List available scripts
    #[arg(short = 'l', long)]
    list: bool,

    /// List available scripts and targets
    #[arg(short = 'L', long)]
    list_all: bool,

    /// Change to this directory before doing anything else
    #[arg(short = 'C', long)]
    directory: Option<PathBuf>,

    /// Resolve the target fingerprint from the commit index written by a
    /// prior CI job, then load from cache (implies load-only)
    #[arg(long)]
    load_from_job: bool,

    /// Clear expired cloud cache entries and exit
    #[arg(long)]
    clear_expired_cache: bool,

    /// Materialise upstream dependencies only; skip this target's build
    #[arg(long)]
    deps_only: bool,

    /// Run the named scripts in parallel
    #[arg(short = 'p', long)]
    parallel: bool,

    /// Cache backend to use (false, local, cloud, dev)
    #[arg(long)]
    cache: Option<String>,

    /// Log level when QUACK_LOG is unset
    #[arg(long)]
    log_level: Option<String>,

    /// When to colorize output
    #[arg(long, value_enum, default_value_t = log::WhenColor::Auto)]
    color: log::WhenColor,

    /// Script or target names, with extra arguments forwarded to scripts
    names: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let flags = TopLevelFlags::parse();

    let pwd = match &flags.directory {
        Some(directory) => std::path::absolute(directory)
            .with_context(|| format!("resolve working directory: {directory:?}"))?,
        None => std::env::current_dir().context("resolve working directory")?,
    };

    // The whole invocation runs from the project root.
    let spec_path = find_spec_root(&pwd)?;
    let root = spec_path
        .parent()
        .expect("spec path has a parent")
        .to_path_buf();
    std::env::set_current_dir(&root)
        .with_context(|| format!("change to project root: {root:?}"))?;

    let config = Config::load()?;
    let default_level = flags
        .log_level
        .clone()
        .or_else(|| config.log_level.clone())
        .unwrap_or_else(|| String::from("info"));
    log::make_logger(std::io::stderr, flags.color, &default_level)?.init();

    let ci = CiEnvironment::from_env();
    let cache_name = flags.cache.as_deref().unwrap_or(&config.cache);
    let kind = cache_name
        .parse::<BackendKind>()
        .map_err(|_| eyre!("invalid cache backend: {cache_name}"))?;

    let spec = Spec::load(&pwd, &spec_path)?;
    let mut runtime = Runtime::new(spec, config, ci, kind);
    if !runtime.is_nested {
        runtime.spec.validate()?;
    }
    runtime.spec.post_process()?;
    let runtime = Arc::new(runtime);
    runtime.export_env();

    install_signal_handlers(&runtime);

    let result = dispatch(&runtime, &flags).await;

    // Exit-path hygiene, success or not: the periodic local cache sweep.
    match LocalBackend::open(&runtime.spec.app_name, &runtime.ci) {
        Ok(local) => {
            if let Err(err) = local.clear_expired().await {
                warn!(%err, "local cache sweep failed");
            }
        }
        Err(err) => warn!(%err, "could not open local cache for sweeping"),
    }

    result
}

async fn dispatch(runtime: &Arc<Runtime>, flags: &TopLevelFlags) -> Result<()> {
    if flags.clear_expired_cache {
        let backend = CloudBackend::open(
            disk_driver(&runtime.config)?,
            &runtime.spec.app_name,
            &runtime.config,
            &runtime.ci,
        )?;
        return backend.clear_expired().await;
    }

    if flags.list || flags.list_all {
        print_available(&runtime.spec, flags.list_all);
        return Ok(());
    }

    if flags.names.is_empty() {
        bail!("specify a script or target name to execute (see --list)");
    }

    if flags.parallel {
        return executor::execute_scripts_parallel(runtime, &flags.names).await;
    }

    if flags.load_from_job {
        if flags.names.len() != 1 {
            bail!("--load-from-job takes exactly one target name");
        }
        if !runtime.ci.is_ci {
            bail!("--load-from-job is only supported in CI");
        }
    }

    let name = &flags.names[0];
    let args = &flags.names[1..];
    if runtime.spec.scripts.contains_key(name) {
        executor::execute_script(runtime, name, args).await
    } else if runtime.spec.targets.contains_key(name) {
        let mode = if flags.load_from_job {
            TargetExecutionMode::LoadOnly
        } else if flags.deps_only {
            TargetExecutionMode::DepsOnly
        } else {
            TargetExecutionMode::Normal
        };
        executor::execute_target(runtime, name, mode).await
    } else {
        bail!("unknown script or target name: {name}");
    }
}

/// Tear down every tracked subprocess and exit 1 on SIGINT/SIGTERM.
fn install_signal_handlers(runtime: &Arc<Runtime>) {
    let registry = runtime.registry.clone();
    std::thread::spawn(move || {
        let mut signals =
            Signals::new([SIGINT, SIGTERM]).expect("register signal handlers");
        if let Some(signal) = signals.forever().next() {
            if signal == SIGINT {
                eprintln!("interrupted");
            }
            registry.terminate_all();
            std::process::exit(1);
        }
    });
}

/// Walk up from `pwd` to the `quack.yaml` that carries the `app_name`.
fn find_spec_root(pwd: &Path) -> Result<PathBuf> {
    let mut dir = pwd.to_path_buf();
    loop {
        let candidate = dir.join(SPEC_FILENAME);
        if let Ok(text) = std::fs::read_to_string(&candidate)
            && text.starts_with("app_name: ")
        {
            return Ok(candidate);
        }
        if !dir.pop() {
            bail!("no {SPEC_FILENAME} with an app_name found at or above {pwd:?}");
        }
    }
}

fn print_available(spec: &Spec, list_targets: bool) {
    let scripts = spec
        .scripts
        .values()
        .filter(|script| !script.name.starts_with('.'))
        .collect::<Vec<_>>();

    println!();
    if !scripts.is_empty() {
        println!("{}\n", "Scripts (current directory only)".bold());
        for script in &scripts {
            println!("  *  {:32} - {}", script.name, script.description);
        }
    }

    if list_targets && !spec.targets.is_empty() {
        if !scripts.is_empty() {
            println!();
        }
        println!("{}\n", "Targets (global, mainly used in CI)".bold());
        for target in spec.targets.values() {
            println!("  *  {:32} - {}", target.name, target.description);
        }
    }
    println!();
}
