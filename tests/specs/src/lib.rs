// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for end-to-end binary smoke tests.
//!
//! Spawns the real `porter` binary as a subprocess and exercises it over
//! HTTP and the relay WebSocket.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

/// Resolve the path to the compiled `porter` binary.
pub fn porter_binary() -> PathBuf {
    let manifest = Path::new(env!("CARGO_MANIFEST_DIR"));
    // tests/specs → tests → workspace root
    let workspace = manifest.parent().and_then(|p| p.parent()).unwrap_or(manifest);
    workspace.join("target").join("debug").join("porter")
}

/// Find a free TCP port by binding to :0 then releasing.
pub fn free_port() -> anyhow::Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// Default stub agent: announces a session id and answers every message
/// with one assistant turn.
pub const ECHO_AGENT: &str = r#"#!/bin/sh
echo '{"type":"system","subtype":"init","session_id":"smoke-session","cwd":"/tmp"}'
i=0
while read line; do
  i=$((i+1))
  printf '{"type":"assistant","message":{"id":"reply_%s","role":"assistant","content":[{"type":"text","text":"ack %s"}]}}\n' "$i" "$i"
  printf '{"type":"result","subtype":"success"}\n'
done
sleep 60
"#;

/// A running `porter` process that is killed on drop.
pub struct PorterProcess {
    child: Child,
    port: u16,
    dir: tempfile::TempDir,
}

/// Builder for extra CLI flags and a custom agent script.
pub struct PorterBuilder {
    extra_args: Vec<String>,
    agent: String,
}

impl Default for PorterBuilder {
    fn default() -> Self {
        Self { extra_args: Vec::new(), agent: ECHO_AGENT.to_owned() }
    }
}

impl PorterBuilder {
    pub fn arg(mut self, arg: &str) -> Self {
        self.extra_args.push(arg.to_owned());
        self
    }

    pub fn agent_script(mut self, script: &str) -> Self {
        self.agent = script.to_owned();
        self
    }

    pub fn spawn(self) -> anyhow::Result<PorterProcess> {
        use std::os::unix::fs::PermissionsExt;

        let binary = porter_binary();
        anyhow::ensure!(binary.exists(), "porter binary not found at {}", binary.display());

        let dir = tempfile::tempdir()?;
        let agent_path = dir.path().join("agent.sh");
        std::fs::write(&agent_path, &self.agent)?;
        let mut perms = std::fs::metadata(&agent_path)?.permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&agent_path, perms)?;
        std::fs::create_dir_all(dir.path().join("project"))?;

        let port = free_port()?;
        let mut args: Vec<String> = vec![
            "--port".into(),
            port.to_string(),
            "--host".into(),
            "127.0.0.1".into(),
            "--data-dir".into(),
            dir.path().join("data").to_string_lossy().into_owned(),
            "--agent-cmd".into(),
            agent_path.to_string_lossy().into_owned(),
            "--cache-ttl-ms".into(),
            "100".into(),
            "--log-format".into(),
            "text".into(),
            "--log-level".into(),
            "warn".into(),
        ];
        args.extend(self.extra_args);

        let child = Command::new(&binary)
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        Ok(PorterProcess { child, port, dir })
    }
}

impl PorterProcess {
    pub fn build() -> PorterBuilder {
        PorterBuilder::default()
    }

    pub fn start() -> anyhow::Result<Self> {
        Self::build().spawn()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// A project directory that exists inside the temp workspace.
    pub fn project_path(&self) -> PathBuf {
        self.dir.path().join("project")
    }

    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub fn relay_url(&self) -> String {
        format!("ws://127.0.0.1:{}/relay", self.port)
    }

    /// Poll health until responsive.
    pub async fn wait_healthy(&self, timeout: Duration) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        let client = reqwest::Client::new();
        let url = format!("{}/api/v1/health", self.base_url());
        loop {
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("porter did not become healthy within {timeout:?}");
            }
            if let Ok(resp) = client.get(&url).send().await {
                if resp.status().is_success() {
                    return Ok(());
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

impl Drop for PorterProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
