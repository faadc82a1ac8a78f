//! Throughput probes.
//!
//! Two independent external probes: the Ookla `speedtest` CLI (JSON on
//! stdout, cached to `ookla_result.json`) and a Node script that writes its
//! own result file. Both hand back raw JSON; failures are represented as an
//! `{"error": ...}` payload rather than an `Err`, so they can be folded into
//! the cycle report verbatim.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::command::CommandRunner;

/// Cached output of the last successful bandwidth run.
pub const BANDWIDTH_CACHE_FILE: &str = "ookla_result.json";
/// Default script and its result file, relative to the state directory.
pub const DEFAULT_SCRIPT: &str = "test.js";
pub const DEFAULT_SCRIPT_RESULT: &str = "result.json";
/// Companion CSV the script maintains; attached to reports when present.
pub const SCRIPT_CSV: &str = "results.csv";

const RAW_EXCERPT_CHARS: usize = 4000;

pub struct SpeedTestRunner<R> {
    runner: Arc<R>,
    bandwidth_cache: PathBuf,
    script: PathBuf,
    script_result: PathBuf,
}

impl<R: CommandRunner> SpeedTestRunner<R> {
    pub fn new(
        runner: Arc<R>,
        bandwidth_cache: PathBuf,
        script: PathBuf,
        script_result: PathBuf,
    ) -> Self {
        Self {
            runner,
            bandwidth_cache,
            script,
            script_result,
        }
    }

    pub fn bandwidth_cache(&self) -> &Path {
        &self.bandwidth_cache
    }

    pub fn script_result(&self) -> &Path {
        &self.script_result
    }

    /// Run the bandwidth binary and cache its JSON on success.
    pub async fn run_bandwidth(&self) -> Value {
        let out = match self
            .runner
            .run("speedtest", &["--accept-license", "--accept-gdpr", "-f", "json"])
            .await
        {
            Ok(out) => out,
            Err(e) => return json!({ "error": { "rc": -1, "stderr": e.to_string() } }),
        };
        if !out.success() {
            tracing::warn!(code = out.code(), "speedtest exited with failure");
            return json!({ "error": { "rc": out.code(), "stderr": out.stderr.trim() } });
        }

        match serde_json::from_str::<Value>(&out.stdout) {
            Ok(data) => {
                match serde_json::to_string_pretty(&data) {
                    Ok(pretty) => {
                        if let Err(e) = std::fs::write(&self.bandwidth_cache, pretty) {
                            tracing::warn!(
                                path = %self.bandwidth_cache.display(),
                                error = %e,
                                "failed to cache speedtest result"
                            );
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "failed to render speedtest result"),
                }
                data
            }
            Err(e) => {
                let raw: String = out.stdout.chars().take(RAW_EXCERPT_CHARS).collect();
                json!({ "error": format!("parse json: {e}"), "raw": raw })
            }
        }
    }

    /// Run the script probe and read the result file it leaves behind.
    pub async fn run_script(&self) -> Value {
        let script = self.script.to_string_lossy();
        let out = match self.runner.run("node", &[&*script]).await {
            Ok(out) => out,
            Err(e) => return json!({ "error": { "rc": -1, "stderr": e.to_string() } }),
        };
        if !out.success() {
            tracing::warn!(code = out.code(), script = %script, "speed script exited with failure");
            return json!({ "error": { "rc": out.code(), "stderr": out.stderr.trim() } });
        }

        let name = self
            .script_result
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match std::fs::read_to_string(&self.script_result) {
            Ok(raw) => serde_json::from_str::<Value>(&raw)
                .unwrap_or_else(|e| json!({ "error": format!("read {name}: {e}") })),
            Err(e) => json!({ "error": format!("read {name}: {e}") }),
        }
    }
}

/// Whether a probe result is an error payload rather than data.
pub fn is_error(result: &Value) -> bool {
    !result.is_object() || result.get("error").is_some()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Latency {
    pub latency: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Transfer {
    /// Bytes per second.
    pub bandwidth: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerInfo {
    pub host: Option<String>,
}

/// The parts of the Ookla JSON the report uses.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BandwidthResult {
    #[serde(default)]
    pub ping: Latency,
    #[serde(default)]
    pub download: Transfer,
    #[serde(default)]
    pub upload: Transfer,
    #[serde(default)]
    pub server: ServerInfo,
}

impl BandwidthResult {
    /// Typed view of a bandwidth result; `None` for error payloads.
    pub fn from_value(result: &Value) -> Option<Self> {
        if is_error(result) {
            return None;
        }
        serde_json::from_value(result.clone()).ok()
    }

    pub fn download_mbps(&self) -> f64 {
        self.download.bandwidth.unwrap_or(0.0) / 1e6
    }

    pub fn upload_mbps(&self) -> f64 {
        self.upload.bandwidth.unwrap_or(0.0) / 1e6
    }
}

/// Numeric rates reported by the script probe.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct ScriptResult {
    pub download_mbps: f64,
    pub upload_mbps: f64,
}

impl ScriptResult {
    /// Typed view of a script result; `None` unless both rates are numbers.
    pub fn from_value(result: &Value) -> Option<Self> {
        if is_error(result) {
            return None;
        }
        serde_json::from_value(result.clone()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{fail, ok, ScriptedRunner};

    const OOKLA: &str = r#"{"ping":{"latency":12.5},"download":{"bandwidth":12500000},
        "upload":{"bandwidth":2500000},"server":{"host":"speed.example.net"}}"#;

    fn runner_in(dir: &Path, runner: Arc<ScriptedRunner>) -> SpeedTestRunner<ScriptedRunner> {
        SpeedTestRunner::new(
            runner,
            dir.join(BANDWIDTH_CACHE_FILE),
            dir.join(DEFAULT_SCRIPT),
            dir.join(DEFAULT_SCRIPT_RESULT),
        )
    }

    #[tokio::test]
    async fn bandwidth_success_is_cached() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("speedtest", ok(OOKLA));
        let probe = runner_in(dir.path(), runner);

        let result = probe.run_bandwidth().await;

        let view = BandwidthResult::from_value(&result).unwrap();
        assert!((view.download_mbps() - 12.5).abs() < 1e-9);
        assert!((view.upload_mbps() - 2.5).abs() < 1e-9);
        assert_eq!(view.server.host.as_deref(), Some("speed.example.net"));
        let cached: Value =
            serde_json::from_str(&std::fs::read_to_string(probe.bandwidth_cache()).unwrap()).unwrap();
        assert_eq!(cached, result);
    }

    #[tokio::test]
    async fn bandwidth_failure_becomes_error_payload() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("speedtest", fail(2, "  Limit reached \n"));
        let probe = runner_in(dir.path(), runner);

        let result = probe.run_bandwidth().await;

        assert_eq!(result, json!({ "error": { "rc": 2, "stderr": "Limit reached" } }));
        assert!(BandwidthResult::from_value(&result).is_none());
        assert!(!probe.bandwidth_cache().exists());
    }

    #[tokio::test]
    async fn bandwidth_garbage_keeps_raw_excerpt() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("speedtest", ok("not json"));

        let result = runner_in(dir.path(), runner).run_bandwidth().await;

        assert!(result["error"].as_str().unwrap().starts_with("parse json:"));
        assert_eq!(result["raw"], "not json");
    }

    #[tokio::test]
    async fn script_result_is_read_from_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(DEFAULT_SCRIPT_RESULT),
            r#"{"download_mbps": 88.1, "upload_mbps": 9.4, "ping_ms": 14}"#,
        )
        .unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let probe = runner_in(dir.path(), runner.clone());

        let result = probe.run_script().await;

        assert_eq!(
            ScriptResult::from_value(&result),
            Some(ScriptResult {
                download_mbps: 88.1,
                upload_mbps: 9.4
            })
        );
        assert!(runner.calls()[0].starts_with("node "));
    }

    #[tokio::test]
    async fn script_missing_result_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = runner_in(dir.path(), Arc::new(ScriptedRunner::new()))
            .run_script()
            .await;
        assert!(result["error"].as_str().unwrap().starts_with("read result.json:"));
    }

    #[test]
    fn script_view_requires_numeric_rates() {
        assert!(ScriptResult::from_value(&json!({ "download_mbps": "fast", "upload_mbps": 1 })).is_none());
        assert!(ScriptResult::from_value(&json!({ "download_mbps": 1.0 })).is_none());
        assert!(ScriptResult::from_value(&json!([1, 2])).is_none());
    }
}
