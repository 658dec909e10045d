//! Built-in local tools: file access and a shell, rooted at the workplace.

use std::path::{Component, Path, PathBuf};
use std::process::Stdio;

use serde_json::{Value, json};
use tracing::{debug, warn};

use termpilot_agent::tools::{ParamType, PermissionPolicy};
use termpilot_agent::{AgentError, ToolRegistry, ToolResult, ToolSchema, ToolSpec, handler_fn};

/// Maximum characters returned from a file read.
const MAX_READ_CHARS: usize = 100_000;

/// Maximum bytes of stdout/stderr kept from a command.
const MAX_OUTPUT_BYTES: usize = 64 * 1024;

/// Register `read_file`, `write_file`, `list_dir` and `run_shell`.
pub fn register_builtin_tools(
    registry: &ToolRegistry,
    workplace: &Path,
    policy: &PermissionPolicy,
) -> termpilot_agent::Result<()> {
    let root = workplace.canonicalize().unwrap_or_else(|_| workplace.to_path_buf());

    let read_root = root.clone();
    registry.register(
        ToolSpec::new("read_file", "Read a UTF-8 text file relative to the working directory")
            .schema(ToolSchema::new().required("path", ParamType::String, "file path"))
            .read_only()
            .handler(handler_fn(move |args: Value, _ctx| {
                let root = read_root.clone();
                async move { read_file(&root, &args).await }
            })),
    )?;

    let write_root = root.clone();
    registry.register(
        ToolSpec::new("write_file", "Create or overwrite a text file relative to the working directory")
            .schema(
                ToolSchema::new()
                    .required("path", ParamType::String, "file path")
                    .required("content", ParamType::String, "full new file content"),
            )
            .sensitive()
            .handler(handler_fn(move |args: Value, _ctx| {
                let root = write_root.clone();
                async move { write_file(&root, &args).await }
            })),
    )?;

    let list_root = root.clone();
    registry.register(
        ToolSpec::new("list_dir", "List the entries of a directory")
            .schema(
                ToolSchema::new()
                    .optional("path", ParamType::String, "directory path")
                    .default_value("."),
            )
            .read_only()
            .handler(handler_fn(move |args: Value, _ctx| {
                let root = list_root.clone();
                async move { list_dir(&root, &args).await }
            })),
    )?;

    let shell_root = root;
    let shell_policy = policy.clone();
    registry.register(
        ToolSpec::new("run_shell", "Run a shell command in the working directory")
            .schema(ToolSchema::new().required("command", ParamType::String, "command line for `sh -c`"))
            .sensitive()
            .handler(handler_fn(move |args: Value, ctx| {
                let root = shell_root.clone();
                let policy = shell_policy.clone();
                async move { run_shell(&root, &policy, &args, &ctx.cancel).await }
            })),
    )?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

/// Resolve `raw` against `root`, refusing anything that escapes it.
fn resolve(root: &Path, raw: &str) -> Result<PathBuf, String> {
    let candidate = if Path::new(raw).is_absolute() {
        PathBuf::from(raw)
    } else {
        root.join(raw)
    };
    let normalized = normalize_path(&candidate);
    if normalized.starts_with(root) {
        Ok(normalized)
    } else {
        Err(format!("path `{raw}` is outside the working directory"))
    }
}

/// Resolve `.` and `..` without touching the filesystem.
fn normalize_path(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                if matches!(components.last(), Some(Component::Normal(_))) {
                    components.pop();
                } else {
                    components.push(component);
                }
            }
            Component::CurDir => {}
            _ => components.push(component),
        }
    }
    components.iter().collect()
}

fn str_arg<'a>(args: &'a Value, field: &str) -> &'a str {
    args.get(field).and_then(Value::as_str).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn read_file(root: &Path, args: &Value) -> termpilot_agent::Result<ToolResult> {
    let path = match resolve(root, str_arg(args, "path")) {
        Ok(p) => p,
        Err(e) => return Ok(ToolResult::failure(e)),
    };
    debug!(path = %path.display(), "reading file");
    let raw = match tokio::fs::read_to_string(&path).await {
        Ok(raw) => raw,
        Err(e) => return Ok(ToolResult::failure(format!("cannot read {}: {e}", path.display()))),
    };
    let total = raw.chars().count();
    if total <= MAX_READ_CHARS {
        return Ok(ToolResult::ok(raw));
    }
    let head: String = raw.chars().take(MAX_READ_CHARS).collect();
    Ok(ToolResult::ok(format!(
        "{head}\n\n[... file truncated at {MAX_READ_CHARS} of {total} chars]"
    )))
}

async fn write_file(root: &Path, args: &Value) -> termpilot_agent::Result<ToolResult> {
    let path = match resolve(root, str_arg(args, "path")) {
        Ok(p) => p,
        Err(e) => return Ok(ToolResult::failure(e)),
    };
    let content = str_arg(args, "content");
    debug!(path = %path.display(), bytes = content.len(), "writing file");
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&path, content).await?;
    Ok(ToolResult::ok_with_data(
        format!("wrote {} bytes to {}", content.len(), path.display()),
        json!({ "path": path.display().to_string(), "size_bytes": content.len() }),
    ))
}

async fn list_dir(root: &Path, args: &Value) -> termpilot_agent::Result<ToolResult> {
    let raw = args.get("path").and_then(Value::as_str).unwrap_or(".");
    let path = match resolve(root, raw) {
        Ok(p) => p,
        Err(e) => return Ok(ToolResult::failure(e)),
    };
    let mut read_dir = match tokio::fs::read_dir(&path).await {
        Ok(rd) => rd,
        Err(e) => return Ok(ToolResult::failure(format!("cannot list {}: {e}", path.display()))),
    };
    let mut names = Vec::new();
    while let Some(entry) = read_dir.next_entry().await? {
        let mut name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type().await?.is_dir() {
            name.push('/');
        }
        names.push(name);
    }
    names.sort();
    Ok(ToolResult::ok(names.join("\n")))
}

async fn run_shell(
    root: &Path,
    policy: &PermissionPolicy,
    args: &Value,
    cancel: &tokio_util::sync::CancellationToken,
) -> termpilot_agent::Result<ToolResult> {
    let command = str_arg(args, "command");
    if !policy.command_allowed(command) {
        warn!(command, "shell command rejected by allowed_commands");
        return Ok(ToolResult::failure(format!("command not allowed: {command}")));
    }
    debug!(command, cwd = %root.display(), "running shell command");

    let child = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(root)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    // Dropping the wait future on cancellation kills the child.
    let output = tokio::select! {
        out = child.wait_with_output() => out?,
        _ = cancel.cancelled() => {
            debug!(command, "shell command canceled");
            return Err(AgentError::Canceled);
        }
    };

    let code = output.status.code().unwrap_or(-1);
    let stdout = truncate_output(&output.stdout);
    let stderr = truncate_output(&output.stderr);
    let mut text = stdout;
    if !stderr.is_empty() {
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str("[stderr]\n");
        text.push_str(&stderr);
    }

    if output.status.success() {
        Ok(ToolResult::ok(text))
    } else {
        let mut result = ToolResult::failure(format!("exit status {code}"));
        result.output = text;
        Ok(result)
    }
}

fn truncate_output(raw: &[u8]) -> String {
    if raw.len() <= MAX_OUTPUT_BYTES {
        return String::from_utf8_lossy(raw).into_owned();
    }
    let mut s = String::from_utf8_lossy(&raw[..MAX_OUTPUT_BYTES]).into_owned();
    s.push_str("\n... [output truncated]");
    s
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
