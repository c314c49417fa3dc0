//! REPL – interactive shell over one in-memory entity store.
//!
//! Supported slash-commands:
//!   /ingest <scene.json>          – ingest a scene dump and merge duplicates
//!   /load <store.json>            – replace the store with a saved one
//!   /save <store.json>            – write the store to disk
//!   /merge                        – run another duplicate-merge pass
//!   /list                         – tabulate every entity
//!   /frame <id>                   – entities seen in a keyframe
//!   /nearest <x> <y> <z> [class]  – closest entity to a point
//!   /region <x> <y> <z> <r>       – entities within a radius
//!   /help                         – show this list
//!   /quit | /exit                 – leave the shell
//!
//! Any line that is not a slash-command is grounded as a query.

use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;

use scenefuse_memory::store::EntityStore;
use scenefuse_perception::ingestion::SceneFile;
use scenefuse_runtime::{GroundingPipeline, GroundingResult, QueryParser};
use scenefuse_types::{Object3D, Point3};

use crate::config::Config;

// ─────────────────────────────────────────────────────────────────────────────
// Command parsing
// ─────────────────────────────────────────────────────────────────────────────

/// One parsed REPL input line.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    Quit,
    Ingest(PathBuf),
    Load(PathBuf),
    Save(PathBuf),
    Merge,
    List,
    Frame(u32),
    Nearest { point: Point3, class: Option<String> },
    Region { centre: Point3, radius: f32 },
    Query(String),
}

impl Command {
    /// Parse a non-empty, trimmed input line.
    pub fn parse(line: &str) -> Result<Self, String> {
        if !line.starts_with('/') {
            return Ok(Command::Query(line.to_string()));
        }
        let mut parts = line.split_whitespace();
        let name = parts.next().unwrap_or_default();
        let args: Vec<&str> = parts.collect();

        match (name, args.as_slice()) {
            ("/help", []) => Ok(Command::Help),
            ("/quit" | "/exit", []) => Ok(Command::Quit),
            ("/merge", []) => Ok(Command::Merge),
            ("/list", []) => Ok(Command::List),
            ("/ingest", [path]) => Ok(Command::Ingest(PathBuf::from(path))),
            ("/load", [path]) => Ok(Command::Load(PathBuf::from(path))),
            ("/save", [path]) => Ok(Command::Save(PathBuf::from(path))),
            ("/frame", [id]) => id
                .parse()
                .map(Command::Frame)
                .map_err(|_| format!("'{id}' is not a frame id")),
            ("/nearest", [x, y, z, rest @ ..]) if rest.len() <= 1 => Ok(Command::Nearest {
                point: parse_point(x, y, z)?,
                class: rest.first().map(|c| c.to_string()),
            }),
            ("/region", [x, y, z, r]) => Ok(Command::Region {
                centre: parse_point(x, y, z)?,
                radius: parse_f32(r)?,
            }),
            (
                "/help" | "/quit" | "/exit" | "/merge" | "/list" | "/ingest" | "/load" | "/save" | "/frame"
                | "/nearest" | "/region",
                _,
            ) => Err(format!("wrong arguments for {name}; see /help")),
            (other, _) => Err(format!("unknown command '{other}'")),
        }
    }
}

fn parse_f32(s: &str) -> Result<f32, String> {
    s.parse::<f32>().map_err(|_| format!("'{s}' is not a number"))
}

fn parse_point(x: &str, y: &str, z: &str) -> Result<Point3, String> {
    Ok(Point3::new(parse_f32(x)?, parse_f32(y)?, parse_f32(z)?))
}

// ─────────────────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────────────────

/// What the loop should do after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// REPL state: the store plus everything needed to fill and query it.
pub struct Session {
    store: EntityStore,
    pipeline: GroundingPipeline,
    parser: Box<dyn QueryParser>,
    nearest_max_distance: f32,
    last_result: Option<GroundingResult>,
}

impl Session {
    pub fn new(cfg: &Config) -> Self {
        Self {
            store: EntityStore::new(),
            pipeline: GroundingPipeline::new(cfg.pipeline_config()),
            parser: cfg.query_parser(),
            nearest_max_distance: cfg.nearest_max_distance,
            last_result: None,
        }
    }

    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    pub fn last_result(&self) -> Option<&GroundingResult> {
        self.last_result.as_ref()
    }

    /// Execute one command, printing its output.
    pub fn execute(&mut self, cmd: Command) -> Flow {
        match cmd {
            Command::Help => cmd_help(),
            Command::Quit => return Flow::Quit,
            Command::Ingest(path) => self.cmd_ingest(&path),
            Command::Load(path) => match EntityStore::open(&path) {
                Ok(store) => {
                    self.store = store;
                    println!("{} {} entities", "✓ Loaded".green(), self.store.len());
                }
                Err(e) => println!("{}: {}", "Load failed".red(), e),
            },
            Command::Save(path) => match self.store.save(&path) {
                Ok(()) => println!("{} {}", "✓ Saved to".green(), path.display().to_string().bold()),
                Err(e) => println!("{}: {}", "Save failed".red(), e),
            },
            Command::Merge => {
                let summary = self.store.merge_with(self.pipeline.dedup());
                println!(
                    "  {} → {} entities ({} clusters merged)",
                    summary.before,
                    summary.after.to_string().bold(),
                    summary.clusters_merged
                );
            }
            Command::List => self.cmd_list(),
            Command::Frame(id) => print_objects(&self.store.get_in_frame(id)),
            Command::Nearest { point, class } => {
                match self.store.nearest(point, class.as_deref(), self.nearest_max_distance) {
                    Some(o) => print_objects(&[o]),
                    None => println!("  {}", "nothing within range".dimmed()),
                }
            }
            Command::Region { centre, radius } => print_objects(&self.store.in_region(centre, radius)),
            Command::Query(q) => self.cmd_query(&q),
        }
        Flow::Continue
    }

    fn cmd_ingest(&mut self, path: &std::path::Path) {
        let scene = match SceneFile::load(path) {
            Ok(s) => s,
            Err(e) => {
                println!("{}: {}", "Ingest failed".red(), e);
                return;
            }
        };
        let before = self.store.len();
        match self
            .pipeline
            .ingest_into(&mut self.store, &scene.keyframes(), &scene, &scene)
        {
            Ok(()) => println!(
                "{} {} keyframes; store now holds {} entities (was {})",
                "✓ Ingested".green(),
                scene.keyframes.len(),
                self.store.len().to_string().bold(),
                before
            ),
            Err(e) => println!("{}: {}", "Ingest failed".red(), e),
        }
    }

    fn cmd_list(&self) {
        if self.store.is_empty() {
            println!("  {}", "store is empty".dimmed());
            return;
        }
        println!(
            "  {:>4}  {:<16} {:>5}  {:<26} {}",
            "id".bold(),
            "class".bold(),
            "conf".bold(),
            "center".bold(),
            "frames".bold()
        );
        for row in self.store.summary_rows() {
            let id = row.id.map(|i| i.to_string()).unwrap_or_else(|| "-".into());
            println!(
                "  {:>4}  {:<16} {:>5.2}  {:<26} {:?}",
                id,
                row.class_label,
                row.confidence,
                format_point(row.center),
                row.frame_ids
            );
        }
    }

    fn cmd_query(&mut self, query: &str) {
        let result = self.pipeline.ground(query, self.parser.as_ref(), &self.store);
        print_result(&result);
        self.last_result = Some(result);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Loop
// ─────────────────────────────────────────────────────────────────────────────

/// Entry point for the interactive REPL.
///
/// `shutdown` is polled each iteration; when set the REPL exits cleanly.
pub fn run(cfg: &Config, shutdown: Arc<AtomicBool>) {
    let mut editor = match DefaultEditor::new() {
        Ok(e) => e,
        Err(e) => {
            eprintln!("{}: {}", "Failed to start line editor".red(), e);
            return;
        }
    };
    let mut session = Session::new(cfg);

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        let line = match editor.readline("scenefuse> ") {
            Ok(l) => l,
            Err(ReadlineError::Eof) => break,
            Err(ReadlineError::Interrupted) => {
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let _ = editor.add_history_entry(line);

        match Command::parse(line) {
            Ok(cmd) => {
                if session.execute(cmd) == Flow::Quit {
                    shutdown.store(true, Ordering::SeqCst);
                    break;
                }
            }
            Err(msg) => println!(
                "{} {}. Type {} for available commands.",
                "Error:".red(),
                msg.yellow(),
                "/help".bold()
            ),
        }
    }
    println!("{}", "Goodbye.".green());
}

// ─────────────────────────────────────────────────────────────────────────────
// Output helpers
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_help() {
    println!();
    println!("{}", "SceneFuse Commands".bold().underline());
    println!("  {}        – ingest a scene dump", "/ingest <scene.json>".bold().cyan());
    println!("  {}          – load a saved store", "/load <store.json>".bold().cyan());
    println!("  {}          – save the store", "/save <store.json>".bold().cyan());
    println!("  {}                      – merge duplicates again", "/merge".bold().cyan());
    println!("  {}                       – list entities", "/list".bold().cyan());
    println!("  {}                  – entities in a keyframe", "/frame <id>".bold().cyan());
    println!("  {} – closest entity", "/nearest <x> <y> <z> [class]".bold().cyan());
    println!("  {}       – entities within r", "/region <x> <y> <z> <r>".bold().cyan());
    println!("  {}                – exit", "/quit  /exit".bold().cyan());
    println!("  Anything else is treated as a query, e.g. {}", "the lamp on the table".italic());
    println!();
}

fn format_point(p: Option<Point3>) -> String {
    match p {
        Some(p) => format!("({:.2}, {:.2}, {:.2})", p.x, p.y, p.z),
        None => "unresolved".to_string(),
    }
}

fn print_objects(objects: &[&Object3D]) {
    if objects.is_empty() {
        println!("  {}", "no entities".dimmed());
        return;
    }
    for o in objects {
        let id = o.id.map(|i| i.to_string()).unwrap_or_else(|| "-".into());
        println!(
            "  #{} {} {:.2} at {}",
            id.bold(),
            o.class_label.cyan(),
            o.confidence,
            format_point(o.center_3d)
        );
    }
}

pub(crate) fn print_result(result: &GroundingResult) {
    if result.success {
        println!(
            "  {} {} (id {}, confidence {:.2})",
            "✓ Found".green().bold(),
            result.target_object.as_deref().unwrap_or_default().bold(),
            result.object_id.map(|i| i.to_string()).unwrap_or_else(|| "-".into()),
            result.confidence
        );
        println!("    center : {}", format_point(result.center_3d));
        if let Some(b) = result.bbox_3d {
            println!(
                "    box    : {} size ({:.2} × {:.2} × {:.2})",
                format_point(Some(b.centre)),
                b.width,
                b.height,
                b.depth
            );
        }
        if let Some(reason) = &result.metadata.degraded {
            println!("    {} {}", "note:".yellow(), reason);
        }
    } else {
        println!(
            "  {} {}",
            "✗".red().bold(),
            result.error.as_deref().unwrap_or("grounding failed").red()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── Command::parse ───────────────────────────────────────────────────────

    #[test]
    fn plain_text_is_a_query() {
        assert_eq!(
            Command::parse("the lamp on the table"),
            Ok(Command::Query("the lamp on the table".into()))
        );
    }

    #[test]
    fn simple_commands() {
        assert_eq!(Command::parse("/help"), Ok(Command::Help));
        assert_eq!(Command::parse("/exit"), Ok(Command::Quit));
        assert_eq!(Command::parse("/merge"), Ok(Command::Merge));
        assert_eq!(Command::parse("/list"), Ok(Command::List));
        assert_eq!(Command::parse("/frame 12"), Ok(Command::Frame(12)));
        assert_eq!(Command::parse("/save out/s.json"), Ok(Command::Save("out/s.json".into())));
    }

    #[test]
    fn nearest_with_and_without_class() {
        assert_eq!(
            Command::parse("/nearest 1 2 3"),
            Ok(Command::Nearest {
                point: Point3::new(1.0, 2.0, 3.0),
                class: None
            })
        );
        assert_eq!(
            Command::parse("/nearest 0 0 0.5 chair"),
            Ok(Command::Nearest {
                point: Point3::new(0.0, 0.0, 0.5),
                class: Some("chair".into())
            })
        );
    }

    #[test]
    fn region_parses_radius() {
        assert_eq!(
            Command::parse("/region 0 0 0 1.5"),
            Ok(Command::Region {
                centre: Point3::new(0.0, 0.0, 0.0),
                radius: 1.5
            })
        );
    }

    #[test]
    fn bad_arguments_are_reported() {
        assert!(Command::parse("/frame x").is_err());
        assert!(Command::parse("/region 0 0 0").is_err());
        assert!(Command::parse("/nearest 1 2 three").is_err());
        assert!(Command::parse("/save").unwrap_err().contains("wrong arguments"));
        assert!(Command::parse("/settings").unwrap_err().contains("unknown command"));
    }

    // ── Session ──────────────────────────────────────────────────────────────

    fn write_scene(dir: &std::path::Path) -> PathBuf {
        let path = dir.join("scene.json");
        std::fs::write(
            &path,
            r#"{
                "keyframes": [
                    {"frame_id": 0, "detections": [
                        {"class_name": "chair", "confidence": 0.9, "bbox_norm": [0.1, 0.1, 0.3, 0.5]},
                        {"class_name": "cup", "confidence": 0.6, "bbox_norm": [0.6, 0.6, 0.7, 0.7]}
                    ]},
                    {"frame_id": 1, "detections": [
                        {"class_name": "chair", "confidence": 0.8, "bbox_norm": [0.1, 0.1, 0.3, 0.5]}
                    ]}
                ],
                "pointcloud": {"points": [[0, 0, 2.0]]}
            }"#,
        )
        .unwrap();
        path
    }

    #[test]
    fn session_ingest_query_save_load() {
        let _env = crate::config::env_guard();
        let dir = tempfile::tempdir().unwrap();
        let scene = write_scene(dir.path());
        let mut session = Session::new(&Config::default());

        assert_eq!(session.execute(Command::Ingest(scene)), Flow::Continue);
        assert_eq!(session.store().len(), 2);

        session.execute(Command::Query("the chair".into()));
        let result = session.last_result().unwrap();
        assert!(result.success);
        assert_eq!(result.object_id, Some(0));

        let saved = dir.path().join("store.json");
        session.execute(Command::Save(saved.clone()));
        let mut fresh = Session::new(&Config::default());
        fresh.execute(Command::Load(saved));
        assert_eq!(fresh.store().objects(), session.store().objects());
    }

    #[test]
    fn session_quit_returns_quit() {
        let mut session = Session::new(&Config::default());
        assert_eq!(session.execute(Command::Quit), Flow::Quit);
    }

    #[test]
    fn failed_ingest_keeps_store() {
        let mut session = Session::new(&Config::default());
        session.execute(Command::Ingest(PathBuf::from("/nonexistent/scene.json")));
        assert!(session.store().is_empty());
    }
}
