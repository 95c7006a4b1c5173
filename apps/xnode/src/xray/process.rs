//! The managed `xray` subprocess.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tracing::{error, info, warn};

/// Base config fragments, loaded by `xray run -confdir` in file-name order.
fn fragments(api_port: u16) -> Vec<(&'static str, Value)> {
    vec![
        (
            "00_base.json",
            json!({"log": {}, "api": {}, "dns": {}, "stats": {}, "policy": {}, "transport": {}, "routing": {}, "inbounds": []}),
        ),
        (
            "01_api.json",
            json!({"api": {"tag": "api", "services": ["HandlerService", "LoggerService", "StatsService"]}}),
        ),
        (
            "02_policy.json",
            json!({"policy": {
                "levels": {"0": {"statsUserUplink": true, "statsUserDownlink": true, "statsUserOnline": true}},
                "system": {
                    "statsInboundUplink": true,
                    "statsInboundDownlink": true,
                    "statsOutboundUplink": true,
                    "statsOutboundDownlink": true
                }
            }}),
        ),
        (
            "03_routing.json",
            json!({"routing": {"rules": [{"inboundTag": ["api"], "outboundTag": "api", "type": "field"}]}}),
        ),
        (
            "04_inbounds.json",
            json!({"inbounds": [{
                "listen": "127.0.0.1",
                "port": api_port,
                "protocol": "dokodemo-door",
                "settings": {"address": "127.0.0.1"},
                "tag": "api"
            }]}),
        ),
        (
            "05_outbounds.json",
            json!({"outbounds": [{"protocol": "freedom"}]}),
        ),
    ]
}

/// Write the base fragments into `dir`. Files already present are left
/// untouched so operators can customise them.
pub async fn write_base_config(dir: &Path, api_port: u16) -> Result<Vec<PathBuf>> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("Failed to create {}", dir.display()))?;

    let mut written = Vec::new();
    for (name, content) in fragments(api_port) {
        let path = dir.join(name);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            continue;
        }
        let body = serde_json::to_string_pretty(&content)?;
        tokio::fs::write(&path, body)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        written.push(path);
    }
    Ok(written)
}

/// Poll until something accepts TCP connections on `host:port`.
pub async fn wait_for_port(host: &str, port: u16, deadline: Duration) -> Result<()> {
    let target = format!("{host}:{port}");
    let started = tokio::time::Instant::now();
    loop {
        match tokio::time::timeout(Duration::from_secs(2), TcpStream::connect(&target)).await {
            Ok(Ok(_)) => return Ok(()),
            Ok(Err(_)) | Err(_) => {}
        }
        if started.elapsed() >= deadline {
            bail!("control plane {target} did not come up within {deadline:?}");
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

pub struct XrayProcess {
    child: Child,
}

impl XrayProcess {
    pub async fn start(executable: &Path, config_dir: &Path, api_port: u16) -> Result<Self> {
        let written = write_base_config(config_dir, api_port).await?;
        for path in &written {
            info!("💾 Wrote {}", path.display());
        }

        let child = Command::new(executable)
            .arg("run")
            .arg("-confdir")
            .arg(config_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", executable.display()))?;

        info!("🚀 Started xray (pid {:?})", child.id());
        Ok(Self { child })
    }

    /// Terminate, then kill if the engine does not exit in time.
    pub async fn stop(mut self, grace: Duration) {
        let pid = self.child.id();

        if let Ok(Some(status)) = self.child.try_wait() {
            warn!("⚠️ xray already exited: {status}");
            return;
        }

        #[cfg(unix)]
        if let Some(pid) = pid {
            let sent = Command::new("kill")
                .arg("-TERM")
                .arg(pid.to_string())
                .status()
                .await;
            match sent {
                Ok(status) if status.success() => {}
                Ok(status) => warn!("⚠️ kill -TERM {pid} exited with {status}"),
                Err(e) => warn!("⚠️ Could not send TERM to xray (pid {pid}): {e}"),
            }
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => info!("🛑 xray (pid {pid:?}) stopped: {status}"),
            Ok(Err(e)) => error!("❌ Failed to wait for xray: {e}"),
            Err(_) => {
                warn!("⚠️ xray (pid {pid:?}) still running, killing");
                if let Err(e) = self.child.kill().await {
                    error!("❌ Failed to kill xray: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn base_config_keeps_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("05_outbounds.json"), "{\"custom\": true}")
            .await
            .unwrap();

        let written = write_base_config(dir.path(), 10085).await.unwrap();
        assert_eq!(written.len(), 5);

        let custom = std::fs::read_to_string(dir.path().join("05_outbounds.json")).unwrap();
        assert_eq!(custom, "{\"custom\": true}");

        let api: Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("04_inbounds.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(api["inbounds"][0]["port"], 10085);
        assert_eq!(api["inbounds"][0]["tag"], "api");

        assert!(write_base_config(dir.path(), 10085).await.unwrap().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stop_terminates_before_the_grace_period() {
        let child = Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let engine = XrayProcess { child };

        let started = std::time::Instant::now();
        engine.stop(Duration::from_secs(10)).await;
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn wait_for_port_sees_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        wait_for_port("127.0.0.1", port, Duration::from_secs(1))
            .await
            .unwrap();

        drop(listener);
        assert!(
            wait_for_port("127.0.0.1", port, Duration::from_millis(300))
                .await
                .is_err()
        );
    }
}
