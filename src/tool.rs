//! Tool lookup — the name→tool registry a portal serves from.
//!
//! A [`Tool`] runs synchronously against two in-memory sinks and returns its
//! exit status. [`ToolRegistry`] is built once (from config or by hand) and
//! shared read-only by every connection handler.
//!
//! [`CommandTool`] wraps an external executable: it is run directly (never
//! through a shell) with the configured args prepended and resolved env
//! overrides applied, and its stdout/stderr are captured into the sinks.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Instant;

use crate::config::{resolve_env_vars, PortalConfig, ToolConfig};
use crate::protocol::Response;

/// A named tool that can be invoked in-process.
pub trait Tool: Send + Sync {
    /// Run with `args`, writing normal output to `out` and diagnostics to `err`.
    fn run(&self, args: &[String], out: &mut dyn Write, err: &mut dyn Write) -> i32;
}

impl<F> Tool for F
where
    F: Fn(&[String], &mut dyn Write, &mut dyn Write) -> i32 + Send + Sync,
{
    fn run(&self, args: &[String], out: &mut dyn Write, err: &mut dyn Write) -> i32 {
        self(args, out, err)
    }
}

/// Run a tool against fresh in-memory sinks and package the result.
pub fn capture(tool: &dyn Tool, args: &[String]) -> Response {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let status = tool.run(args, &mut stdout, &mut stderr);
    Response {
        status,
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
    }
}

/// Read-only registry of tools, keyed by name.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry holding one [`CommandTool`] per enabled `[tools.*]` entry.
    pub fn from_config(config: &PortalConfig) -> Self {
        let mut registry = Self::new();
        for (name, tool_config) in &config.tools {
            if !tool_config.enabled {
                tracing::debug!(tool = %name, "skipping disabled tool");
                continue;
            }
            registry.register(name.clone(), CommandTool::from_config(name, tool_config));
        }
        tracing::debug!(tools = registry.len(), "tool registry built");
        registry
    }

    /// Register a tool, replacing any previous tool with the same name.
    pub fn register(&mut self, name: impl Into<String>, tool: impl Tool + 'static) {
        self.tools.insert(name.into(), Arc::new(tool));
    }

    pub fn find(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Sorted tool names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }
}

/// An external executable exposed as a tool.
#[derive(Debug, Clone)]
pub struct CommandTool {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    /// Unresolved `${VAR}` references; resolved per invocation.
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
}

impl CommandTool {
    pub fn from_config(name: &str, config: &ToolConfig) -> Self {
        Self {
            name: name.to_string(),
            command: config.command.clone(),
            args: config.args.clone(),
            env: config.env.clone(),
            cwd: config.cwd.clone(),
        }
    }
}

impl Tool for CommandTool {
    fn run(&self, args: &[String], out: &mut dyn Write, err: &mut dyn Write) -> i32 {
        let start = Instant::now();

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (k, v) in resolve_env_vars(&self.env) {
            cmd.env(k, v);
        }
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }

        let output = match cmd.output() {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!(
                    tool = %self.name,
                    command = %self.command,
                    error = %e,
                    "failed to spawn tool"
                );
                let _ = writeln!(err, "{}: failed to run '{}': {}", self.name, self.command, e);
                return 1;
            }
        };

        // Killed by a signal: no code, report a generic failure
        let exit_code = output.status.code().unwrap_or(-1);
        let _ = out.write_all(&output.stdout);
        let _ = err.write_all(&output.stderr);

        tracing::info!(
            tool = %self.name,
            command = %self.command,
            exit_code = %exit_code,
            duration_ms = %start.elapsed().as_millis(),
            "tool invocation"
        );
        exit_code
    }
}
