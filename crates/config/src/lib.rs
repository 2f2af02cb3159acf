//! Configuration loading and validation.
//!
//! Configuration is layered with `figment`: built-in defaults, then an
//! optional file (TOML, YAML or JSON, picked by extension), then environment
//! variables prefixed with `TRAWL_`, using `__` to separate nested keys
//! (`TRAWL_RUN__PORT=9090`). The resulting [`Config`] is built once at
//! startup and passed to whatever needs it.

pub mod error;

use derive_more::Display;
use directories::ProjectDirs;
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{ErrorKind, Result};

pub const ENV_PREFIX: &str = "TRAWL_";

/// Role of this node, fixed for the lifetime of the process.
#[derive(Debug, Display, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Nothing is started.
    #[default]
    #[display("unset")]
    Unset,
    /// Owns the task jar, serves tasks to workers and runs local workers.
    #[display("master")]
    #[serde(alias = "server")]
    Master,
    /// Fetches tasks from a master and runs them.
    #[display("worker")]
    #[serde(alias = "client")]
    Worker,
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "unset" => Ok(Self::Unset),
            "master" | "server" => Ok(Self::Master),
            "worker" | "client" => Ok(Self::Worker),
            other => Err(format!("unknown mode {other:?} (expected master or worker)")),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub run: RunConfig,
    pub output: OutputConfig,
    pub mongo: MongoConfig,
    pub mysql: MysqlConfig,
    pub kafka: KafkaConfig,
    pub log: LogConfig,
}

/// How this node runs tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub mode: Mode,
    /// Port the master listens on, and the port workers connect to.
    pub port: u16,
    /// Master host, for workers.
    pub master: String,
    /// Concurrent worker units per node.
    pub thread: usize,
    /// Milliseconds to wait between two requests of the same task.
    pub pause_ms: u64,
    /// Default output type for collectors.
    pub out_type: String,
    /// Default records per output batch.
    pub docker_cap: usize,
    /// Default record limit per task; zero means unlimited.
    pub limit: u64,
    /// Proxy rotation interval in seconds; zero disables rotation.
    pub proxy_second: u64,
    /// Keep the record of successful requests between runs.
    pub success_inherit: bool,
    /// Keep (and retry) the record of failed requests between runs.
    pub failure_inherit: bool,
    pub jar_capacity: usize,
    /// Whether a master also runs worker units against its own jar.
    pub local_workers: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Unset,
            port: 2015,
            master: "127.0.0.1".into(),
            thread: 20,
            pause_ms: 300,
            out_type: "csv".into(),
            docker_cap: 10_000,
            limit: 0,
            proxy_second: 0,
            success_inherit: true,
            failure_inherit: true,
            jar_capacity: 1024,
            local_workers: true,
        }
    }
}

impl RunConfig {
    /// `host:port` of the master.
    pub fn master_addr(&self) -> String {
        format!("{}:{}", self.master, self.port)
    }
}

/// Where output lands on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// File artifacts (images, documents).
    pub file_dir: PathBuf,
    /// Text output such as CSV files.
    pub text_dir: PathBuf,
    /// The bucket store, shared by the `bolt` output and the request history.
    pub db_name: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        let root = default_work_root();
        Self {
            file_dir: root.join("file_out"),
            text_dir: root.join("text_out"),
            db_name: root.join("trawl.db"),
        }
    }
}

fn default_work_root() -> PathBuf {
    ProjectDirs::from("", "", "trawl")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("trawl_temp"))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MongoConfig {
    pub conn_string: String,
    pub conn_cap: usize,
    pub conn_gc_second: u64,
}

impl Default for MongoConfig {
    fn default() -> Self {
        Self { conn_string: "127.0.0.1:27017".into(), conn_cap: 1024, conn_gc_second: 600 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MysqlConfig {
    pub conn_string: String,
    pub conn_cap: usize,
    pub max_allowed_packet: u64,
}

impl Default for MysqlConfig {
    fn default() -> Self {
        Self { conn_string: "mysql://root@127.0.0.1:3306".into(), conn_cap: 2048, max_allowed_packet: 1_048_576 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KafkaConfig {
    pub brokers: String,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self { brokers: "127.0.0.1:9092".into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive used when `RUST_LOG` is not set.
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { level: "info".into() }
    }
}

impl Config {
    /// Load defaults, then `path` (if given), then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = merge_file(figment, path)?;
        }
        Self::extract(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    fn extract(figment: Figment) -> Result<Self> {
        let config: Config = figment.extract().or_raise(|| ErrorKind::Invalid)?;
        config.validate()?;
        tracing::debug!(mode = %config.run.mode, "configuration loaded");
        Ok(config)
    }

    /// Reject values that parse but cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.run.thread == 0 {
            exn::bail!(ErrorKind::InvalidValue("run.thread", "must be at least 1".into()));
        }
        if self.run.docker_cap == 0 {
            exn::bail!(ErrorKind::InvalidValue("run.docker_cap", "must be at least 1".into()));
        }
        if self.run.jar_capacity == 0 {
            exn::bail!(ErrorKind::InvalidValue("run.jar_capacity", "must be at least 1".into()));
        }
        if self.run.mode == Mode::Worker && self.run.master.trim().is_empty() {
            exn::bail!(ErrorKind::InvalidValue("run.master", "required in worker mode".into()));
        }
        Ok(())
    }
}

fn merge_file(figment: Figment, path: &Path) -> Result<Figment> {
    if !path.is_file() {
        exn::bail!(ErrorKind::NotFound(path.to_path_buf()));
    }
    let extension = path.extension().and_then(|ext| ext.to_str()).map(str::to_ascii_lowercase);
    let figment = match extension.as_deref() {
        Some("toml") => figment.merge(Toml::file_exact(path)),
        Some("yaml" | "yml") => figment.merge(Yaml::file_exact(path)),
        Some("json") => figment.merge(Json::file_exact(path)),
        _ => exn::bail!(ErrorKind::UnsupportedFormat(path.to_path_buf())),
    };
    Ok(figment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const TOML: &str = "[run]\nmode = \"master\"\nport = 9000\nout_type = \"bolt\"\n[log]\nlevel = \"debug\"\n";
    const YAML: &str = "run:\n  mode: master\n  port: 9000\n  out_type: bolt\nlog:\n  level: debug\n";
    const JSON: &str = r#"{"run": {"mode": "master", "port": 9000, "out_type": "bolt"}, "log": {"level": "debug"}}"#;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.run.mode, Mode::Unset);
        assert_eq!(config.run.port, 2015);
        assert_eq!(config.run.thread, 20);
        assert_eq!(config.run.pause_ms, 300);
        assert_eq!(config.run.out_type, "csv");
        assert_eq!(config.run.docker_cap, 10_000);
        assert_eq!(config.run.jar_capacity, 1024);
        assert!(config.run.success_inherit && config.run.failure_inherit);
        assert_eq!(config.run.master_addr(), "127.0.0.1:2015");
        config.validate().unwrap();
    }

    #[rstest]
    #[case::toml("trawl.toml", TOML)]
    #[case::yaml("trawl.yaml", YAML)]
    #[case::yml("trawl.yml", YAML)]
    #[case::json("trawl.json", JSON)]
    fn test_file_formats(#[case] name: &str, #[case] contents: &str) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        let config = Config::extract(merge_file(Figment::from(Serialized::defaults(Config::default())), &path).unwrap())
            .unwrap();
        assert_eq!(config.run.mode, Mode::Master);
        assert_eq!(config.run.port, 9000);
        assert_eq!(config.run.out_type, "bolt");
        assert_eq!(config.log.level, "debug");
        // Untouched values keep their defaults.
        assert_eq!(config.run.thread, 20);
    }

    #[test]
    fn test_missing_and_unsupported_files() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));

        let path = dir.path().join("trawl.ini");
        std::fs::write(&path, "port=1").unwrap();
        let err = Config::load(Some(&path)).unwrap_err();
        assert!(matches!(&*err, ErrorKind::UnsupportedFormat(_)));
    }

    #[test]
    fn test_validation_rejects_zero_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trawl.toml");
        std::fs::write(&path, "[run]\ndocker_cap = 0\n").unwrap();
        let figment = merge_file(Figment::from(Serialized::defaults(Config::default())), &path).unwrap();
        let err = Config::extract(figment).unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidValue("run.docker_cap", _)));
    }

    #[test]
    fn test_malformed_file_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trawl.toml");
        std::fs::write(&path, "[run]\nport = \"not a number\"\n").unwrap();
        let figment = merge_file(Figment::from(Serialized::defaults(Config::default())), &path).unwrap();
        let err = Config::extract(figment).unwrap_err();
        assert!(matches!(&*err, ErrorKind::Invalid));
    }

    #[test]
    fn test_environment_overrides_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("trawl.toml", TOML)?;
            jail.set_env("TRAWL_RUN__PORT", 9191);
            jail.set_env("TRAWL_RUN__MODE", "client");
            let config = Config::load(Some(Path::new("trawl.toml"))).unwrap();
            assert_eq!(config.run.port, 9191);
            assert_eq!(config.run.mode, Mode::Worker);
            assert_eq!(config.run.out_type, "bolt");
            Ok(())
        });
    }

    #[rstest]
    #[case::file("[run]\nmode = \"server\"\n", None)]
    #[case::env("", Some("server"))]
    fn test_legacy_master_name_in_file_and_env(#[case] contents: &str, #[case] env: Option<&str>) {
        figment::Jail::expect_with(|jail| {
            jail.create_file("trawl.toml", contents)?;
            if let Some(mode) = env {
                jail.set_env("TRAWL_RUN__MODE", mode);
            }
            let config = Config::load(Some(Path::new("trawl.toml"))).unwrap();
            assert_eq!(config.run.mode, Mode::Master);
            Ok(())
        });
    }

    #[rstest]
    #[case("master", Mode::Master)]
    #[case("server", Mode::Master)]
    #[case("Worker", Mode::Worker)]
    #[case("client", Mode::Worker)]
    #[case("", Mode::Unset)]
    fn test_mode_from_str(#[case] input: &str, #[case] expected: Mode) {
        assert_eq!(input.parse::<Mode>().unwrap(), expected);
    }

    #[test]
    fn test_mode_from_str_rejects_unknown() {
        assert!("offline-ish".parse::<Mode>().is_err());
    }
}
