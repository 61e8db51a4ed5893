//! The one-shot container executor.
//!
//! Script content is a JSON container spec. Each invocation pulls the
//! image, runs a uniquely named container with the message fields as
//! environment variables and the payload piped to stdin, and returns the
//! exit code, stdout and stderr as the result. Live containers are tracked
//! so `stop()` can kill them.
//!
//! Built only with the `container` cargo feature; otherwise a stub returns
//! a structured "not supported" error.

use serde::Deserialize;

/// A bind mount from the container spec.
#[derive(Debug, Clone, Deserialize)]
pub struct Mount {
    /// Host path.
    pub source: String,
    /// Path inside the container.
    pub destination: String,
    /// Mount options, e.g. `ro`.
    #[serde(default)]
    pub options: Vec<String>,
}

/// The container spec carried in the script content.
#[derive(Debug, Clone, Deserialize)]
pub struct ContainerSpec {
    /// Image reference to pull and run.
    pub image: String,
    /// Command override; the image default when empty.
    #[serde(default)]
    pub command: Vec<String>,
    /// Bind mounts.
    #[serde(default)]
    pub mounts: Vec<Mount>,
    /// Run privileged.
    #[serde(default)]
    pub privileged: bool,
    /// User to run as.
    #[serde(default)]
    pub user: String,
    /// Supplementary groups.
    #[serde(default)]
    pub groups: Vec<String>,
}

#[cfg(feature = "container")]
mod enabled {
    use dashmap::DashMap;
    use std::process::Stdio;
    use tokio::io::AsyncWriteExt;
    use tokio::process::Command;
    use tracing::{debug, info, warn};
    use uuid::Uuid;

    use super::ContainerSpec;
    use crate::executor::{ExecContext, Executor, MAX_INTERPRETER_RUNNING_TIME};
    use crate::models::{Message, Script, ScriptResult};

    /// Runs scripts as one-shot containers through the configured runtime
    /// binary (`podman` by default).
    pub struct ContainerExecutor {
        runtime: String,
        /// Names of currently running containers, for `stop()`.
        containers: DashMap<String, ()>,
    }

    impl ContainerExecutor {
        /// Creates the executor driving `runtime` (e.g. `podman`).
        pub fn new(runtime: String) -> Self {
            ContainerExecutor { runtime, containers: DashMap::new() }
        }

        fn run_args(spec: &ContainerSpec, name: &str, msg: &Message) -> Vec<String> {
            let mut args = vec![
                "run".to_string(),
                "-i".to_string(),
                "--rm".to_string(),
                "--name".to_string(),
                name.to_string(),
            ];

            let payload = String::from_utf8_lossy(&msg.payload);
            for (key, value) in [
                ("SUBJECT", msg.subject.as_str()),
                ("PAYLOAD", payload.as_ref()),
                ("METHOD", msg.method.as_str()),
                ("URL", msg.url.as_str()),
            ] {
                args.push("--env".to_string());
                args.push(format!("{key}={value}"));
            }

            for mount in &spec.mounts {
                let mut volume = format!("{}:{}", mount.source, mount.destination);
                if !mount.options.is_empty() {
                    volume.push(':');
                    volume.push_str(&mount.options.join(","));
                }
                args.push("--volume".to_string());
                args.push(volume);
            }

            if !spec.user.is_empty() {
                args.push("--user".to_string());
                args.push(spec.user.clone());
            }
            for group in &spec.groups {
                args.push("--group-add".to_string());
                args.push(group.clone());
            }
            if spec.privileged {
                args.push("--privileged".to_string());
            }

            args.push(spec.image.clone());
            args.extend(spec.command.iter().cloned());
            args
        }

        async fn execute(
            &self,
            ctx: &ExecContext,
            msg: &Message,
            spec: &ContainerSpec,
        ) -> Result<ScriptResult, String> {
            let name = format!("msgscript-{}", &Uuid::new_v4().to_string()[..8]);

            debug!(image = %spec.image, "pulling image");
            let pull = Command::new(&self.runtime)
                .args(["pull", &spec.image])
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .output()
                .await
                .map_err(|e| format!("failed to run {}: {e}", self.runtime))?;
            if !pull.status.success() {
                return Err(format!(
                    "failed to pull image {}: {}",
                    spec.image,
                    String::from_utf8_lossy(&pull.stderr).trim()
                ));
            }

            let mut child = Command::new(&self.runtime)
                .args(Self::run_args(spec, &name, msg))
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
                .map_err(|e| format!("failed to create container: {e}"))?;

            // Pipe the payload in and close stdin so the entrypoint sees EOF.
            if let Some(mut stdin) = child.stdin.take() {
                if let Err(e) = stdin.write_all(&msg.payload).await {
                    warn!(error = %e, "failed to write to container stdin");
                }
            }

            self.containers.insert(name.clone(), ());
            debug!(container = %name, "started container");

            let budget = ctx.remaining().unwrap_or(MAX_INTERPRETER_RUNNING_TIME);
            let output = match tokio::time::timeout(budget, child.wait_with_output()).await {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => {
                    self.containers.remove(&name);
                    return Err(format!("container wait failed: {e}"));
                }
                Err(_) => {
                    self.kill(&name).await;
                    self.containers.remove(&name);
                    return Err("container timed out".to_string());
                }
            };

            self.containers.remove(&name);

            let exit_code = i64::from(output.status.code().unwrap_or(-1));
            info!(container = %name, code = exit_code, "container exited");

            Ok(ScriptResult {
                code: exit_code,
                payload: output.stdout,
                error: String::from_utf8_lossy(&output.stderr).to_string(),
                ..ScriptResult::default()
            })
        }

        async fn kill(&self, name: &str) {
            let result = Command::new(&self.runtime)
                .args(["kill", "--signal", "SIGKILL", name])
                .output()
                .await;
            if let Err(e) = result {
                warn!(container = %name, error = %e, "failed to kill container");
            }
        }
    }

    #[async_trait::async_trait]
    impl Executor for ContainerExecutor {
        #[tracing::instrument(
            skip_all,
            fields(subject = %msg.subject, script = %script.name, executor = "container")
        )]
        async fn handle(
            &self,
            ctx: &ExecContext,
            msg: &Message,
            script: &Script,
        ) -> Option<ScriptResult> {
            let spec: ContainerSpec = match serde_json::from_slice(&script.content) {
                Ok(spec) => spec,
                Err(e) => {
                    return Some(ScriptResult::from_error(format!(
                        "failed to decode container configuration: {e}"
                    )))
                }
            };

            match self.execute(ctx, msg, &spec).await {
                Ok(result) => Some(result),
                Err(e) => Some(ScriptResult::from_error(e)),
            }
        }

        async fn stop(&self) {
            let names: Vec<String> =
                self.containers.iter().map(|entry| entry.key().clone()).collect();
            for name in names {
                debug!(container = %name, "killing container on shutdown");
                self.kill(&name).await;
                self.containers.remove(&name);
            }
        }
    }

}

#[cfg(not(feature = "container"))]
mod disabled {
    use crate::executor::{ExecContext, Executor};
    use crate::models::{Message, Script, ScriptResult};

    /// Stub registered when the build does not carry the container runtime.
    pub struct ContainerExecutor;

    impl ContainerExecutor {
        /// Creates the stub; the runtime name is ignored.
        pub fn new(_runtime: String) -> Self {
            ContainerExecutor
        }
    }

    #[async_trait::async_trait]
    impl Executor for ContainerExecutor {
        async fn handle(
            &self,
            _ctx: &ExecContext,
            _msg: &Message,
            _script: &Script,
        ) -> Option<ScriptResult> {
            Some(ScriptResult::from_error("server wasn't built with container support"))
        }

        async fn stop(&self) {}
    }

}

#[cfg(feature = "container")]
pub use enabled::ContainerExecutor;
#[cfg(not(feature = "container"))]
pub use disabled::ContainerExecutor;

#[cfg(test)]
mod spec_tests {
    use super::*;

    #[test]
    fn spec_defaults_apply() {
        let spec: ContainerSpec = serde_json::from_str(r#"{"image": "alpine"}"#).unwrap();
        assert_eq!(spec.image, "alpine");
        assert!(spec.command.is_empty());
        assert!(spec.mounts.is_empty());
        assert!(!spec.privileged);
        assert!(spec.user.is_empty());
    }

    #[test]
    fn malformed_spec_is_rejected() {
        assert!(serde_json::from_str::<ContainerSpec>(r#"{"no_image": true}"#).is_err());
    }
}
