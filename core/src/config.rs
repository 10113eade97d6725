//! `config.toml` loading and the resolved runtime configuration.

use std::path::Path;
use std::path::PathBuf;

use dirs::home_dir;
use serde::Deserialize;

use crate::dual_write::StreamConfig;
use crate::dual_write::StreamToml;
use crate::error::GaplessErr;
use crate::error::Result;
use crate::heartbeat::HeartbeatToml;
use crate::monitor::MonitorConfig;
use crate::monitor::MonitorToml;
use crate::planner::PlannerConfig;
use crate::planner::PlannerToml;
use crate::retry::RetryPolicy;
use crate::retry::RetryToml;
use crate::source::SourceToml;

pub const GAPLESS_HOME_ENV: &str = "GAPLESS_HOME";
pub const CONFIG_TOML_FILE: &str = "config.toml";
const DEFAULT_HOME_DIR: &str = ".gapless";

/// Raw contents of `config.toml`. Every field is optional.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ConfigToml {
    /// Directory for the SQLite store. Defaults to the gapless home.
    pub state_dir: Option<PathBuf>,
    pub source: Option<SourceToml>,
    #[serde(default)]
    pub planner: PlannerToml,
    #[serde(default)]
    pub retry: RetryToml,
    #[serde(default)]
    pub monitor: MonitorToml,
    #[serde(default)]
    pub heartbeat: HeartbeatToml,
    #[serde(default)]
    pub stream: StreamToml,
}

/// Settings with defaults applied.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub gapless_home: PathBuf,
    pub state_dir: PathBuf,
    pub source: Option<SourceToml>,
    pub planner: PlannerConfig,
    pub retry: RetryPolicy,
    pub monitor: MonitorConfig,
    pub heartbeat: HeartbeatToml,
    pub stream: StreamConfig,
}

impl Config {
    /// Read `gapless_home/config.toml`. A missing file yields the defaults.
    pub fn load(gapless_home: PathBuf) -> Result<Self> {
        let path = gapless_home.join(CONFIG_TOML_FILE);
        let toml = load_config_toml(&path)?;
        Ok(Self::from_toml(gapless_home, toml))
    }

    pub fn from_toml(gapless_home: PathBuf, toml: ConfigToml) -> Self {
        let state_dir = match toml.state_dir {
            Some(dir) if dir.is_absolute() => dir,
            Some(dir) => gapless_home.join(dir),
            None => gapless_home.clone(),
        };
        Self {
            gapless_home,
            state_dir,
            source: toml.source,
            planner: toml.planner.into(),
            retry: toml.retry.into(),
            monitor: toml.monitor.into(),
            heartbeat: toml.heartbeat,
            stream: toml.stream.into(),
        }
    }

    /// Configured upstream, or an error naming the missing table.
    pub fn require_source(&self) -> Result<&SourceToml> {
        self.source.as_ref().ok_or_else(|| {
            GaplessErr::Config(format!(
                "no [source] table in {}",
                self.gapless_home.join(CONFIG_TOML_FILE).display()
            ))
        })
    }
}

fn load_config_toml(path: &Path) -> Result<ConfigToml> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(ConfigToml::default());
        }
        Err(source) => {
            return Err(GaplessErr::ConfigIo {
                path: path.display().to_string(),
                source,
            });
        }
    };
    toml::from_str(&contents).map_err(|source| GaplessErr::ConfigParse {
        path: path.display().to_string(),
        source,
    })
}

/// Resolve the gapless home: `$GAPLESS_HOME` when set and non-empty, else
/// `~/.gapless`. A home named through the environment must already be a
/// directory. The default one is created by the store on first use.
pub fn find_gapless_home() -> Result<PathBuf> {
    let explicit = std::env::var_os(GAPLESS_HOME_ENV)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from);
    resolve_gapless_home(explicit)
}

fn resolve_gapless_home(explicit: Option<PathBuf>) -> Result<PathBuf> {
    let Some(path) = explicit else {
        return home_dir()
            .map(|home| home.join(DEFAULT_HOME_DIR))
            .ok_or_else(|| {
                GaplessErr::Config(format!(
                    "cannot locate a home directory; set {GAPLESS_HOME_ENV}"
                ))
            });
    };
    let io_err = |source| GaplessErr::ConfigIo {
        path: path.display().to_string(),
        source,
    };
    if !std::fs::metadata(&path).map_err(io_err)?.is_dir() {
        return Err(GaplessErr::Config(format!(
            "{GAPLESS_HOME_ENV} must name a directory, got {}",
            path.display()
        )));
    }
    path.canonicalize().map_err(io_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::CalendarAnchor;
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;
    use std::io::ErrorKind;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn missing_config_file_uses_defaults() {
        let home = TempDir::new().expect("temp home");
        let config = Config::load(home.path().to_path_buf()).expect("load");
        assert_eq!(config.state_dir, home.path());
        assert_eq!(config.planner, PlannerConfig::default());
        assert_eq!(config.retry, RetryPolicy::default());
        assert_eq!(config.monitor, MonitorConfig::default());
        assert_eq!(config.source, None);
        assert!(config.require_source().is_err());
    }

    #[test]
    fn config_toml_overrides_each_section() {
        let home = TempDir::new().expect("temp home");
        std::fs::write(
            home.path().join(CONFIG_TOML_FILE),
            r#"
state_dir = "db"

[source]
kind = "json_rpc"
url = "http://localhost:8545"

[planner]
memory_limit_bytes = 1073741824
chunk_records = 50000

[[planner.calendar_units]]
unit_start = "2015-07-30"
first_sequence = 0

[[planner.calendar_units]]
unit_start = "2016-01-01"
first_sequence = 778483

[retry]
max_attempts = 5

[monitor]
staleness_threshold_secs = 600
start_sequence = 1

[heartbeat]
success_url = "https://hc-ping.com/abc"

[stream]
batch_interval_secs = 0
heartbeat_url = "https://hc-ping.com/stream"
"#,
        )
        .expect("write config");

        let config = Config::load(home.path().to_path_buf()).expect("load");

        assert_eq!(config.state_dir, home.path().join("db"));
        assert_eq!(config.planner.memory_limit_bytes, 1_073_741_824);
        assert_eq!(config.planner.chunk_records, Some(50_000));
        assert_eq!(
            config.planner.anchors[1],
            CalendarAnchor {
                unit_start: NaiveDate::from_ymd_opt(2016, 1, 1).expect("date"),
                first_sequence: 778_483,
            }
        );
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.monitor.staleness_threshold, Duration::from_secs(600));
        assert_eq!(config.monitor.start_sequence, Some(1));
        assert_eq!(
            config.heartbeat.success_url.as_deref(),
            Some("https://hc-ping.com/abc")
        );
        assert_eq!(config.stream.batch_interval, Duration::ZERO);
        assert_eq!(
            config.stream.heartbeat_url.as_deref(),
            Some("https://hc-ping.com/stream")
        );
        assert!(config.require_source().is_ok());
    }

    #[test]
    fn malformed_config_reports_path() {
        let home = TempDir::new().expect("temp home");
        std::fs::write(home.path().join(CONFIG_TOML_FILE), "planner = 3").expect("write");
        let err = Config::load(home.path().to_path_buf()).expect_err("bad config");
        assert!(matches!(err, GaplessErr::ConfigParse { .. }));
        assert!(err.to_string().contains(CONFIG_TOML_FILE), "{err}");
    }

    #[test]
    fn explicit_home_must_exist() {
        let temp_home = TempDir::new().expect("temp home");
        let missing = temp_home.path().join("missing-gapless-home");

        let err = resolve_gapless_home(Some(missing)).expect_err("missing home");
        match err {
            GaplessErr::ConfigIo { path, source } => {
                assert!(path.ends_with("missing-gapless-home"), "{path}");
                assert_eq!(source.kind(), ErrorKind::NotFound);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn explicit_home_must_be_a_directory() {
        let temp_home = TempDir::new().expect("temp home");
        let file_path = temp_home.path().join("gapless-home.txt");
        std::fs::write(&file_path, "not a directory").expect("write temp file");

        let err = resolve_gapless_home(Some(file_path)).expect_err("file home");
        assert!(matches!(err, GaplessErr::Config(_)));
        assert!(err.to_string().contains(GAPLESS_HOME_ENV), "{err}");
    }

    #[test]
    fn explicit_home_is_canonicalized() {
        let temp_home = TempDir::new().expect("temp home");
        let dotted = temp_home.path().join(".");

        let resolved = resolve_gapless_home(Some(dotted)).expect("valid home");
        assert_eq!(resolved, temp_home.path().canonicalize().expect("canonicalize"));
    }

    #[test]
    fn default_home_is_dot_gapless_under_user_home() {
        let resolved = resolve_gapless_home(None).expect("default home");
        assert_eq!(resolved, home_dir().expect("home dir").join(".gapless"));
    }
}
