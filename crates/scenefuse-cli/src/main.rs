//! `scenefuse` – SceneFuse Command Line Interface
//!
//! Two modes:
//!
//! 1. **One-shot grounding**:
//!    `scenefuse ground <scene.json> "<query>" [--save-store <store.json>]`
//!    builds an entity store from a scene dump, grounds the query, writes
//!    `result.json` into the configured output directory and prints the
//!    document.  Exits non-zero when grounding fails.
//! 2. **Interactive REPL** (no arguments): runs a **First-Run Wizard** when
//!    `~/.scenefuse/config.toml` is absent, then drops the user into a shell
//!    with slash-commands (`/ingest`, `/list`, `/nearest`, `/help`, …).
//!
//! **Ctrl-C** sets a shared shutdown flag so the REPL exits cleanly.

mod config;
mod repl;

use colored::Colorize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

use scenefuse_memory::store::EntityStore;
use scenefuse_perception::ingestion::SceneFile;
use scenefuse_runtime::{GroundingPipeline, init_tracing};

/// Arguments of the one-shot `ground` subcommand.
#[derive(Debug, PartialEq)]
struct GroundArgs {
    scene: PathBuf,
    query: String,
    save_store: Option<PathBuf>,
}

#[derive(Debug, PartialEq)]
enum Invocation {
    Repl,
    Help,
    Ground(GroundArgs),
}

fn parse_args(args: &[String]) -> Result<Invocation, String> {
    match args {
        [] => Ok(Invocation::Repl),
        [flag] if flag == "-h" || flag == "--help" => Ok(Invocation::Help),
        [cmd, rest @ ..] if cmd == "ground" => {
            let mut positional = Vec::new();
            let mut save_store = None;
            let mut iter = rest.iter();
            while let Some(arg) = iter.next() {
                if arg == "--save-store" {
                    let path = iter.next().ok_or("--save-store needs a path")?;
                    save_store = Some(PathBuf::from(path));
                } else {
                    positional.push(arg.as_str());
                }
            }
            match positional.as_slice() {
                [scene, query] => Ok(Invocation::Ground(GroundArgs {
                    scene: PathBuf::from(scene),
                    query: query.to_string(),
                    save_store,
                })),
                _ => Err("usage: scenefuse ground <scene.json> \"<query>\" [--save-store <path>]".into()),
            }
        }
        [other, ..] => Err(format!("unknown command '{other}'")),
    }
}

fn main() -> ExitCode {
    // ── Structured logging ────────────────────────────────────────────────
    // RUST_LOG selects the filter; SCENEFUSE_LOG_FORMAT=json switches to
    // JSON lines.  User-facing output still goes through println!.
    let _guard = init_tracing("scenefuse");

    let args: Vec<String> = std::env::args().skip(1).collect();
    let invocation = match parse_args(&args) {
        Ok(i) => i,
        Err(msg) => {
            eprintln!("{} {}", "Error:".red(), msg);
            print_usage();
            return ExitCode::from(2);
        }
    };

    match invocation {
        Invocation::Help => {
            print_usage();
            ExitCode::SUCCESS
        }
        Invocation::Ground(args) => run_ground(&args),
        Invocation::Repl => {
            run_interactive();
            ExitCode::SUCCESS
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// One-shot grounding
// ─────────────────────────────────────────────────────────────────────────────

fn run_ground(args: &GroundArgs) -> ExitCode {
    let cfg = match config::load_or_default() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}: {}", "Config error".red(), e);
            return ExitCode::from(2);
        }
    };

    let scene = match SceneFile::load(&args.scene) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("{}: {}", "Scene error".red(), e);
            return ExitCode::FAILURE;
        }
    };

    let pipeline = GroundingPipeline::new(cfg.pipeline_config());
    let store: EntityStore = match pipeline.build_store(&scene.keyframes(), &scene, &scene) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("{}: {}", "Ingestion failed".red(), e);
            return ExitCode::FAILURE;
        }
    };

    let parser = cfg.query_parser();
    let result = pipeline.ground(&args.query, parser.as_ref(), &store);

    match result.write_to(&cfg.output_dir) {
        Ok(path) => info!(path = %path.display(), "result written"),
        Err(e) => warn!(error = %e, "could not write result document"),
    }
    if let Some(path) = &args.save_store
        && let Err(e) = store.save(path)
    {
        eprintln!("{}: {}", "Store save failed".red(), e);
    }

    match serde_json::to_string_pretty(&result) {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("{}: {}", "Serialisation failed".red(), e),
    }

    if result.success { ExitCode::SUCCESS } else { ExitCode::FAILURE }
}

// ─────────────────────────────────────────────────────────────────────────────
// Interactive mode
// ─────────────────────────────────────────────────────────────────────────────

fn run_interactive() {
    print_banner();

    // ── Shared shutdown flag ──────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();

    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – shutting down …".yellow().bold());
        shutdown_clone.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler");
    }

    // ── First-Run Wizard ──────────────────────────────────────────────────
    let cfg = match config::load() {
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Ok(None) => run_first_run_wizard(),
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            config::Config::default()
        }
    };

    let parser = if cfg.llm_enabled {
        format!("{} at {}", cfg.llm_model, cfg.llm_url)
    } else {
        "keyword rules".to_string()
    };
    println!("  Query parser: {}", parser.bold());
    println!();
    println!("  Type {} for a list of commands.\n", "/help".bold().cyan());

    repl::run(&cfg, shutdown);
}

// ─────────────────────────────────────────────────────────────────────────────
// First-Run Wizard
// ─────────────────────────────────────────────────────────────────────────────

fn run_first_run_wizard() -> config::Config {
    println!();
    println!("{}", "  ╔══════════════════════════════════════╗".bold().cyan());
    println!("{}", "  ║      SceneFuse First-Run Wizard      ║".bold().cyan());
    println!("{}", "  ╚══════════════════════════════════════╝".bold().cyan());
    println!();
    println!("  No configuration found.  Let's set up SceneFuse.\n");

    let mut cfg = config::Config::default();

    println!("  How should queries be parsed?");
    println!("    1) Keyword rules          (default, offline)");
    println!("    2) Local language model   (OpenAI-compatible server, e.g. Ollama)");
    let choice = prompt_line("  Enter choice [1]: ", "1");
    if choice.trim() == "2" {
        cfg.llm_enabled = true;
        cfg.llm_url = prompt_line(&format!("  Server URL [{}]: ", cfg.llm_url), &cfg.llm_url);
        cfg.llm_model = prompt_line(&format!("  Model [{}]: ", cfg.llm_model), &cfg.llm_model);
    }

    let iou = prompt_line(
        &format!("  Duplicate IoU threshold [{}]: ", cfg.iou_threshold),
        &cfg.iou_threshold.to_string(),
    );
    if let Ok(v) = iou.trim().parse::<f32>() {
        cfg.iou_threshold = v;
    }

    match config::save(&cfg) {
        Ok(()) => println!(
            "\n  {} Config saved to {}\n",
            "✓".green().bold(),
            config::config_path().display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }
    cfg
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"   ____                    ____              "#.bold().cyan());
    println!("{}", r#"  / __/______ ___  ___    / __/_ _____ ___    "#.bold().cyan());
    println!("{}", r#" _\ \/ __/ -_) _ \/ -_)  / _// // (_-</ -_)   "#.bold().cyan());
    println!("{}", r#"/___/\__/\__/_//_/\__/  /_/  \_,_/___/\__/    "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "SceneFuse".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  3-D object fusion and natural-language lookup");
    println!();
}

fn print_usage() {
    println!("{}", "Usage:".bold());
    println!("  scenefuse                                   start the interactive shell");
    println!("  scenefuse ground <scene.json> \"<query>\"     ground one query");
    println!("            [--save-store <store.json>]       also persist the fused store");
    println!("  scenefuse --help                            show this message");
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn prompt_line(msg: &str, default: &str) -> String {
    use std::io::{BufRead, Write};
    print!("{}", msg);
    std::io::stdout().flush().ok();
    let mut line = String::new();
    match std::io::stdin().lock().read_line(&mut line) {
        Ok(_) => {
            let t = line.trim().to_string();
            if t.is_empty() { default.to_string() } else { t }
        }
        Err(_) => default.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn no_args_starts_repl() {
        assert_eq!(parse_args(&[]), Ok(Invocation::Repl));
    }

    #[test]
    fn help_flag() {
        assert_eq!(parse_args(&args(&["--help"])), Ok(Invocation::Help));
    }

    #[test]
    fn ground_with_save_store() {
        let parsed = parse_args(&args(&["ground", "scene.json", "the red mug", "--save-store", "s.json"]));
        assert_eq!(
            parsed,
            Ok(Invocation::Ground(GroundArgs {
                scene: "scene.json".into(),
                query: "the red mug".into(),
                save_store: Some("s.json".into()),
            }))
        );
    }

    #[test]
    fn ground_requires_scene_and_query() {
        assert!(parse_args(&args(&["ground", "scene.json"])).is_err());
        assert!(parse_args(&args(&["ground", "scene.json", "q", "--save-store"])).is_err());
        assert!(parse_args(&args(&["serve"])).is_err());
    }
}
