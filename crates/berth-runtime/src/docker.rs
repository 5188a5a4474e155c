use crate::backend::{BuildSpec, LiveMachine, LiveStatus, MachineRuntime, MachineSpec};
use crate::progress::ProgressSink;
use crate::RuntimeError;
use berth_schema::{BuildContext, ImageRef, MachineId, WorkspaceId};
use std::fs;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use tracing::{debug, info, warn};

pub const LABEL_WORKSPACE: &str = "berth.workspace";
pub const LABEL_MACHINE: &str = "berth.machine";

/// Drives a Docker-compatible CLI (`docker`, `podman`).
pub struct DockerCliRuntime {
    binary: String,
}

impl Default for DockerCliRuntime {
    fn default() -> Self {
        Self {
            binary: "docker".to_owned(),
        }
    }
}

impl DockerCliRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn run(&self, args: &[String]) -> Result<String, RuntimeError> {
        debug!("{} {}", self.binary, args.join(" "));
        let output = Command::new(&self.binary).args(args).output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(self.classify_failure(args, stderr.trim()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
    }

    fn classify_failure(&self, args: &[String], stderr: &str) -> RuntimeError {
        let lower = stderr.to_lowercase();
        if lower.contains("cannot connect to the docker daemon")
            || lower.contains("connection refused")
            || lower.contains("is the docker daemon running")
        {
            return RuntimeError::Daemon(stderr.to_owned());
        }
        if lower.contains("no such container") {
            return RuntimeError::MachineNotFound(args.last().cloned().unwrap_or_default());
        }
        if lower.contains("no such image") || lower.contains("pull access denied") {
            return RuntimeError::ImageNotFound(args.last().cloned().unwrap_or_default());
        }
        RuntimeError::CommandFailed {
            command: format!(
                "{} {}",
                self.binary,
                args.first().map_or("", String::as_str)
            ),
            stderr: stderr.to_owned(),
        }
    }

    fn login(&self, registry: &str, username: &str, password: &str) -> Result<(), RuntimeError> {
        let args = login_command_args(registry, username);
        debug!("{} {}", self.binary, args.join(" "));
        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(password.as_bytes())?;
        }
        let output = child.wait_with_output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(self.classify_failure(&args, stderr.trim()));
        }
        Ok(())
    }

    /// Run `build`, forwarding each stdout line to `progress`.
    fn run_streaming(
        &self,
        args: &[String],
        machine: &str,
        image: &str,
        progress: &dyn ProgressSink,
    ) -> Result<(), RuntimeError> {
        debug!("{} {}", self.binary, args.join(" "));
        let mut child = Command::new(&self.binary)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stderr_reader = child.stderr.take().map(|mut stderr| {
            thread::spawn(move || {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf);
                buf
            })
        });

        if let Some(stdout) = child.stdout.take() {
            for line in BufReader::new(stdout).lines() {
                progress.on_line(machine, &line?);
            }
        }

        let status = child.wait()?;
        let stderr = stderr_reader
            .and_then(|h| h.join().ok())
            .unwrap_or_default();
        if status.success() {
            for line in stderr.lines() {
                progress.on_line(machine, line);
            }
            return Ok(());
        }
        match self.classify_failure(args, stderr.trim()) {
            RuntimeError::CommandFailed { stderr, .. } => Err(RuntimeError::BuildFailed {
                image: image.to_owned(),
                detail: stderr,
            }),
            other => Err(other),
        }
    }
}

impl MachineRuntime for DockerCliRuntime {
    fn name(&self) -> &str {
        &self.binary
    }

    fn available(&self) -> bool {
        Command::new(&self.binary)
            .args(["version", "--format", "{{.Server.Version}}"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok_and(|s| s.success())
    }

    fn build_image(
        &self,
        spec: &BuildSpec,
        progress: &dyn ProgressSink,
    ) -> Result<ImageRef, RuntimeError> {
        let request = &spec.request;
        for (registry, auth) in request.auth_configs().iter() {
            self.login(registry, &auth.username, &auth.password)?;
        }

        // Keeps the staging directory alive until the build finishes.
        let mut staging = None;
        let (context, dockerfile) = match request.context() {
            BuildContext::Remote(url) => (url.clone(), request.dockerfile_path().map(str::to_owned)),
            BuildContext::Files(files) => {
                let dir = tempfile::Builder::new().prefix("berth-build-").tempdir()?;
                stage_build_files(files, dir.path())?;
                let dockerfile_path = dir.path().join(request.effective_dockerfile());
                if !dockerfile_path.is_file() {
                    return Err(RuntimeError::BuildFailed {
                        image: spec.image.to_string(),
                        detail: format!(
                            "build context does not contain '{}'",
                            request.effective_dockerfile()
                        ),
                    });
                }
                let context = dir.path().display().to_string();
                staging = Some(dir);
                (context, Some(dockerfile_path.display().to_string()))
            }
        };

        let args = build_command_args(spec, &context, dockerfile.as_deref());
        info!("building image {} for machine {}", spec.image, spec.machine);
        let result = self.run_streaming(&args, &spec.machine, spec.image.as_str(), progress);
        drop(staging);
        result?;
        Ok(spec.image.clone())
    }

    fn create(&self, spec: &MachineSpec) -> Result<MachineId, RuntimeError> {
        let id = self.run(&create_command_args(spec))?;
        let id = id.lines().last().unwrap_or_default().trim();
        if id.is_empty() {
            return Err(RuntimeError::InvalidOutput(format!(
                "'{} create' printed no container id",
                self.binary
            )));
        }
        Ok(MachineId::new(id))
    }

    fn start(&self, id: &MachineId) -> Result<(), RuntimeError> {
        self.run(&["start".to_owned(), id.to_string()]).map(drop)
    }

    fn stop(&self, id: &MachineId) -> Result<(), RuntimeError> {
        self.run(&["stop".to_owned(), id.to_string()]).map(drop)
    }

    fn remove(&self, id: &MachineId) -> Result<(), RuntimeError> {
        self.run(&["rm".to_owned(), id.to_string()]).map(drop)
    }

    fn list_live(&self, workspace: &WorkspaceId) -> Result<Vec<LiveMachine>, RuntimeError> {
        let out = self.run(&ps_command_args(workspace))?;
        parse_ps_output(&out)
    }
}

/// Copy every build input into `dest`, keeping each input's file name.
pub fn stage_build_files(files: &[PathBuf], dest: &Path) -> Result<(), RuntimeError> {
    for file in files {
        let meta = fs::metadata(file).map_err(|e| {
            RuntimeError::Io(std::io::Error::new(
                e.kind(),
                format!("build input {}: {e}", file.display()),
            ))
        })?;
        let target = match file.file_name() {
            Some(name) => dest.join(name),
            None => dest.to_path_buf(),
        };
        if meta.is_dir() {
            copy_dir_all(file, &target)?;
        } else {
            fs::copy(file, &target)?;
        }
    }
    Ok(())
}

fn copy_dir_all(src: &Path, dst: &Path) -> Result<(), RuntimeError> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let ty = entry.file_type()?;
        let target = dst.join(entry.file_name());
        if ty.is_dir() {
            copy_dir_all(&entry.path(), &target)?;
        } else if ty.is_file() {
            fs::copy(entry.path(), &target)?;
        } else {
            warn!("skipping non-regular build input {}", entry.path().display());
        }
    }
    Ok(())
}

pub fn build_command_args(spec: &BuildSpec, context: &str, dockerfile: Option<&str>) -> Vec<String> {
    let request = &spec.request;
    let mut args = vec![
        "build".to_owned(),
        "-t".to_owned(),
        spec.image.to_string(),
        "--label".to_owned(),
        format!("{LABEL_WORKSPACE}={}", spec.workspace_id),
        "--label".to_owned(),
        format!("{LABEL_MACHINE}={}", spec.machine),
    ];
    if request.force_pull() {
        args.push("--pull".to_owned());
    }
    if let Some(bytes) = request.memory_limit() {
        args.push("--memory".to_owned());
        args.push(bytes.to_string());
    }
    if let Some(bytes) = request.memory_swap_limit() {
        args.push("--memory-swap".to_owned());
        args.push(bytes.to_string());
    }
    if let Some(path) = dockerfile {
        args.push("-f".to_owned());
        args.push(path.to_owned());
    }
    if request.quiet() {
        args.push("-q".to_owned());
    }
    if request.no_cache() {
        args.push("--no-cache".to_owned());
    }
    // `build` removes intermediate containers unless told otherwise.
    if request.remove_intermediate_containers() {
        args.push("--rm".to_owned());
    } else {
        args.push("--rm=false".to_owned());
    }
    if request.force_remove_intermediate_containers() {
        args.push("--force-rm".to_owned());
    }
    if let Some(build_args) = request.build_args() {
        for (key, value) in build_args {
            args.push("--build-arg".to_owned());
            match value {
                Some(v) => args.push(format!("{key}={v}")),
                None => args.push(key.clone()),
            }
        }
    }
    args.push(context.to_owned());
    args
}

pub fn create_command_args(spec: &MachineSpec) -> Vec<String> {
    let mut args = vec![
        "create".to_owned(),
        "--name".to_owned(),
        container_name(&spec.workspace_id, &spec.name),
        "--label".to_owned(),
        format!("{LABEL_WORKSPACE}={}", spec.workspace_id),
        "--label".to_owned(),
        format!("{LABEL_MACHINE}={}", spec.name),
    ];
    if let Some(bytes) = spec.memory_limit {
        args.push("--memory".to_owned());
        args.push(bytes.to_string());
    }
    if let Some(bytes) = spec.memory_swap_limit {
        args.push("--memory-swap".to_owned());
        args.push(bytes.to_string());
    }
    for (key, value) in &spec.env {
        args.push("-e".to_owned());
        args.push(format!("{key}={value}"));
    }
    for link in &spec.links {
        args.push("--link".to_owned());
        args.push(format!("{}:{}", link.target, link.alias));
    }
    args.push(spec.image.to_string());
    args
}

fn login_command_args(registry: &str, username: &str) -> Vec<String> {
    vec![
        "login".to_owned(),
        "--username".to_owned(),
        username.to_owned(),
        "--password-stdin".to_owned(),
        registry.to_owned(),
    ]
}

fn ps_command_args(workspace: &WorkspaceId) -> Vec<String> {
    vec![
        "ps".to_owned(),
        "--all".to_owned(),
        "--no-trunc".to_owned(),
        "--filter".to_owned(),
        format!("label={LABEL_WORKSPACE}={workspace}"),
        "--format".to_owned(),
        "{{json .}}".to_owned(),
    ]
}

/// Container names allow `[a-zA-Z0-9][a-zA-Z0-9_.-]*`.
pub fn container_name(workspace: &WorkspaceId, machine: &str) -> String {
    format!("berth-{workspace}-{machine}")
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Parse `ps --format '{{json .}}'` output, one JSON object per line.
pub fn parse_ps_output(out: &str) -> Result<Vec<LiveMachine>, RuntimeError> {
    let mut machines = Vec::new();
    for line in out.lines().filter(|l| !l.trim().is_empty()) {
        let row: serde_json::Value = serde_json::from_str(line)
            .map_err(|e| RuntimeError::InvalidOutput(format!("ps row '{line}': {e}")))?;
        let id = row
            .get("ID")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| RuntimeError::InvalidOutput(format!("ps row without ID: {line}")))?;
        let labels = row
            .get("Labels")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        let display_name = label_value(labels, LABEL_MACHINE)
            .or_else(|| row.get("Names").and_then(serde_json::Value::as_str))
            .unwrap_or(id)
            .to_owned();
        let status = row
            .get("State")
            .and_then(serde_json::Value::as_str)
            .map_or(LiveStatus::Unknown, LiveStatus::parse);
        machines.push(LiveMachine {
            machine_id: MachineId::new(id),
            display_name,
            status,
        });
    }
    Ok(machines)
}

fn label_value<'a>(labels: &'a str, key: &str) -> Option<&'a str> {
    labels
        .split(',')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| k.trim() == key)
        .map(|(_, v)| v.trim())
}
