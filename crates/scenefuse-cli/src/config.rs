//! Configuration Vault – reads/writes `~/.scenefuse/config.toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use scenefuse_runtime::{LlmQueryParser, PipelineConfig, QueryParser, RuleBasedParser, SynonymTable};

/// Persisted user configuration stored in `~/.scenefuse/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    /// 2-D IoU above which two same-class detections are merged.
    #[serde(default = "default_iou_threshold")]
    pub iou_threshold: f32,

    /// 3-D centre distance (metres) below which two same-class detections
    /// are merged.
    #[serde(default = "default_distance_threshold")]
    pub distance_threshold: f32,

    /// Search radius used by the REPL's `/nearest`.
    #[serde(default = "default_nearest_max_distance")]
    pub nearest_max_distance: f32,

    /// Parse queries with a language model instead of keyword rules.
    #[serde(default)]
    pub llm_enabled: bool,

    /// Base URL of the OpenAI-compatible model server.
    #[serde(default = "default_llm_url")]
    pub llm_url: String,

    /// Model used for query parsing.
    #[serde(default = "default_llm_model")]
    pub llm_model: String,

    /// Bearer token for hosted model servers (plain text; the file is written
    /// owner-only).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub llm_api_key: String,

    /// Directory that receives `result.json`.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Label → synonyms used when no detection matches a query label.
    #[serde(default)]
    pub synonyms: SynonymTable,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("iou_threshold", &self.iou_threshold)
            .field("distance_threshold", &self.distance_threshold)
            .field("nearest_max_distance", &self.nearest_max_distance)
            .field("llm_enabled", &self.llm_enabled)
            .field("llm_url", &self.llm_url)
            .field("llm_model", &self.llm_model)
            .field(
                "llm_api_key",
                if self.llm_api_key.is_empty() { &"<not set>" } else { &"<redacted>" },
            )
            .field("output_dir", &self.output_dir)
            .field("synonyms", &self.synonyms.len())
            .finish()
    }
}

fn default_iou_threshold() -> f32 {
    0.5
}
fn default_distance_threshold() -> f32 {
    0.3
}
fn default_nearest_max_distance() -> f32 {
    2.0
}
fn default_llm_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_llm_model() -> String {
    "qwen2-vl".to_string()
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("./outputs")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            iou_threshold: default_iou_threshold(),
            distance_threshold: default_distance_threshold(),
            nearest_max_distance: default_nearest_max_distance(),
            llm_enabled: false,
            llm_url: default_llm_url(),
            llm_model: default_llm_model(),
            llm_api_key: String::new(),
            output_dir: default_output_dir(),
            synonyms: SynonymTable::default(),
        }
    }
}

impl Config {
    /// Pipeline tunables derived from this config.
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            iou_threshold: self.iou_threshold,
            distance_threshold: self.distance_threshold,
            synonyms: self.synonyms.clone(),
            ..PipelineConfig::default()
        }
    }

    /// The query parser selected by `llm_enabled`.
    pub fn query_parser(&self) -> Box<dyn QueryParser> {
        if !self.llm_enabled {
            return Box::new(RuleBasedParser);
        }
        let mut parser = LlmQueryParser::new(&self.llm_url, &self.llm_model);
        if !self.llm_api_key.is_empty() {
            parser = parser.with_api_key(&self.llm_api_key);
        }
        Box::new(parser)
    }
}

/// Return the path to `~/.scenefuse/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".scenefuse").join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    load_from(&config_path())
}

/// Load the config from disk, falling back to defaults (with environment
/// overrides) when there is no file.
pub fn load_or_default() -> Result<Config, String> {
    Ok(load()?.unwrap_or_else(|| {
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        cfg
    }))
}

/// Load the config from a specific path.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let mut cfg: Config = toml::from_str(&raw)
        .map_err(|e| format!("Failed to parse config: {}", e))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `SCENEFUSE_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `SCENEFUSE_LLM_URL` | `llm_url` |
/// | `SCENEFUSE_LLM_MODEL` | `llm_model` |
/// | `SCENEFUSE_LLM_API_KEY` | `llm_api_key` |
/// | `SCENEFUSE_IOU_THRESHOLD` | `iou_threshold` |
/// | `SCENEFUSE_DISTANCE_THRESHOLD` | `distance_threshold` |
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("SCENEFUSE_LLM_URL") {
        cfg.llm_url = v;
    }
    if let Ok(v) = std::env::var("SCENEFUSE_LLM_MODEL") {
        cfg.llm_model = v;
    }
    if let Ok(v) = std::env::var("SCENEFUSE_LLM_API_KEY") {
        cfg.llm_api_key = v;
    }
    if let Ok(v) = std::env::var("SCENEFUSE_IOU_THRESHOLD")
        && let Ok(t) = v.parse::<f32>()
    {
        cfg.iou_threshold = t;
    }
    if let Ok(v) = std::env::var("SCENEFUSE_DISTANCE_THRESHOLD")
        && let Ok(t) = v.parse::<f32>()
    {
        cfg.distance_threshold = t;
    }
}

/// Save the config to disk, creating `~/.scenefuse/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

/// Save the config to a specific path.
pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}

/// Serialises this crate's tests that read or write process environment
/// variables.  Temp-dir creation reads `TMPDIR` and building an LLM parser
/// reads the proxy variables, so those tests take it too.
#[cfg(test)]
static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[cfg(test)]
pub(crate) fn env_guard() -> std::sync::MutexGuard<'static, ()> {
    ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_debug_redacts_api_key() {
        let cfg = Config {
            llm_api_key: "sk-super-secret".to_string(),
            ..Config::default()
        };
        let debug_str = format!("{:?}", cfg);
        assert!(!debug_str.contains("sk-super-secret"), "api key must not appear in debug output");
        assert!(debug_str.contains("<redacted>"));
    }

    #[test]
    fn config_debug_shows_not_set_for_empty_key() {
        let debug_str = format!("{:?}", Config::default());
        assert!(debug_str.contains("<not set>"));
    }

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        let _env = env_guard();
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");

        let file_mode = std::fs::metadata(&path).expect("file metadata").permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600, "config file must have 0o600 permissions");
        let dir_mode = std::fs::metadata(path.parent().unwrap())
            .expect("dir metadata")
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(dir_mode, 0o700, "config directory must have 0o700 permissions");
    }

    #[test]
    fn roundtrip_default_config() {
        let _env = env_guard();
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert!((loaded.iou_threshold - 0.5).abs() < 1e-6);
        assert!((loaded.nearest_max_distance - 2.0).abs() < 1e-6);
        assert_eq!(loaded.llm_model, "qwen2-vl");
        assert!(!loaded.llm_enabled);
        assert_eq!(loaded.synonyms, SynonymTable::default());
    }

    #[test]
    fn partial_file_fills_defaults() {
        let _env = env_guard();
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "llm_enabled = true\n\n[synonyms]\nsofa = [\"couch\"]\n").unwrap();

        let cfg = load_from(&path).expect("load ok").expect("some");
        assert!(cfg.llm_enabled);
        assert_eq!(cfg.llm_url, "http://localhost:11434");
        assert_eq!(cfg.synonyms.lookup("sofa"), ["couch"]);
        assert!(cfg.synonyms.lookup("laptop").is_empty());
    }

    #[test]
    fn config_path_points_to_scenefuse_dir() {
        let p = config_path_for_home("/home/testuser");
        assert!(p.to_string_lossy().contains(".scenefuse"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let _env = env_guard();
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn pipeline_config_carries_thresholds_and_synonyms() {
        let cfg = Config {
            iou_threshold: 0.7,
            distance_threshold: 0.1,
            ..Config::default()
        };
        let pc = cfg.pipeline_config();
        assert!((pc.iou_threshold - 0.7).abs() < 1e-6);
        assert!((pc.distance_threshold - 0.1).abs() < 1e-6);
        assert_eq!(pc.synonyms, cfg.synonyms);
    }

    #[test]
    fn query_parser_follows_llm_flag() {
        let _env = env_guard();
        assert_eq!(Config::default().query_parser().name(), "rule-based");
        let cfg = Config {
            llm_enabled: true,
            llm_model: "tiny".into(),
            ..Config::default()
        };
        assert_eq!(cfg.query_parser().name(), "tiny");
    }

    #[test]
    fn apply_env_overrides_changes_llm_url() {
        let _env = env_guard();
        // SAFETY: every test in this crate that touches the environment
        // holds ENV_LOCK, so no other thread reads or writes it meanwhile.
        unsafe { std::env::set_var("SCENEFUSE_LLM_URL", "http://gpu-box:11434") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.llm_url, "http://gpu-box:11434");
        // SAFETY: ENV_LOCK is still held.
        unsafe { std::env::remove_var("SCENEFUSE_LLM_URL") };
    }

    #[test]
    fn apply_env_overrides_changes_model() {
        let _env = env_guard();
        // SAFETY: every test in this crate that touches the environment
        // holds ENV_LOCK, so no other thread reads or writes it meanwhile.
        unsafe { std::env::set_var("SCENEFUSE_LLM_MODEL", "llava") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.llm_model, "llava");
        // SAFETY: ENV_LOCK is still held.
        unsafe { std::env::remove_var("SCENEFUSE_LLM_MODEL") };
    }

    #[test]
    fn apply_env_overrides_changes_iou_threshold() {
        let _env = env_guard();
        // SAFETY: every test in this crate that touches the environment
        // holds ENV_LOCK, so no other thread reads or writes it meanwhile.
        unsafe { std::env::set_var("SCENEFUSE_IOU_THRESHOLD", "0.65") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert!((cfg.iou_threshold - 0.65).abs() < 1e-6);
        // SAFETY: ENV_LOCK is still held.
        unsafe { std::env::remove_var("SCENEFUSE_IOU_THRESHOLD") };
    }

    #[test]
    fn apply_env_overrides_ignores_invalid_threshold() {
        let _env = env_guard();
        // SAFETY: every test in this crate that touches the environment
        // holds ENV_LOCK, so no other thread reads or writes it meanwhile.
        unsafe { std::env::set_var("SCENEFUSE_DISTANCE_THRESHOLD", "far") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert!((cfg.distance_threshold - 0.3).abs() < 1e-6);
        // SAFETY: ENV_LOCK is still held.
        unsafe { std::env::remove_var("SCENEFUSE_DISTANCE_THRESHOLD") };
    }
}
