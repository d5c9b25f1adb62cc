//! The bootstrap program and its text form.

use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use url::Url;

use crate::bootstrap::{BASE_URI_GLOBAL, RUNTIME_NAMESPACE, WORKER_ID_GLOBAL};
use crate::runtime::{TraceRuntime, WorkerContext, WorkerError, WorkerId, WorkerResult};

const CONTEXT: &str = "this";

/// Inputs of [`BootstrapProgram::build`].
#[derive(Debug, Clone, Copy)]
pub struct BootstrapParams<'a> {
    pub worker_id: WorkerId,
    pub base_location: &'a Url,
    pub tracing_runtime_url: &'a Url,
    pub application_script_url: &'a Url,
}

/// One line of a bootstrap program.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    /// `this.<name> = <value>;`
    SetGlobal { name: String, value: Value },
    /// `importScripts("<url>");`
    ImportScript(String),
    /// `tracer.prepare(<options>);`
    Prepare(Value),
    /// `tracer.start();`
    Start,
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Statement::SetGlobal { name, value } => write!(f, "{CONTEXT}.{name} = {value};"),
            Statement::ImportScript(url) => write!(f, "importScripts({});", Value::from(url.as_str())),
            Statement::Prepare(options) => write!(f, "{RUNTIME_NAMESPACE}.prepare({options});"),
            Statement::Start => write!(f, "{RUNTIME_NAMESPACE}.start();"),
        }
    }
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("line {line}: unrecognized statement '{text}'")]
    UnknownStatement { line: usize, text: String },

    #[error("line {line}: invalid literal: {source}")]
    Literal {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Program run first in a new worker, ahead of the application script.
#[derive(Debug, Clone, PartialEq)]
pub struct BootstrapProgram {
    statements: Vec<Statement>,
}

impl BootstrapProgram {
    pub fn build(params: &BootstrapParams<'_>) -> Self {
        let statements = vec![
            Statement::SetGlobal {
                name: WORKER_ID_GLOBAL.to_string(),
                value: json!(params.worker_id.as_u32()),
            },
            Statement::SetGlobal {
                name: BASE_URI_GLOBAL.to_string(),
                value: json!(params.base_location.as_str()),
            },
            Statement::ImportScript(params.tracing_runtime_url.to_string()),
            Statement::Prepare(json!({})),
            Statement::Start,
            Statement::ImportScript(params.application_script_url.to_string()),
        ];
        Self { statements }
    }

    pub fn statements(&self) -> &[Statement] {
        &self.statements
    }

    /// Source text, one statement per line.
    pub fn render(&self) -> String {
        self.to_string()
    }

    /// Parse source text produced by [`render`](Self::render).
    pub fn parse(source: &str) -> Result<Self, BootstrapError> {
        let mut statements = Vec::new();
        for (index, raw) in source.lines().enumerate() {
            let text = raw.trim();
            if text.is_empty() {
                continue;
            }
            statements.push(parse_statement(index + 1, text)?);
        }
        Ok(Self { statements })
    }

    /// Run the statements against `ctx`, in order, stopping at the first
    /// failure.
    pub fn execute(&self, ctx: &WorkerContext) -> WorkerResult<()> {
        for statement in &self.statements {
            match statement {
                Statement::SetGlobal { name, value } => {
                    ctx.native_scope().set_global(name, value.clone());
                }
                Statement::ImportScript(url) => ctx.scope().import_scripts(&[url.as_str()])?,
                Statement::Prepare(options) => loaded_runtime(ctx)?.prepare(ctx, options)?,
                Statement::Start => loaded_runtime(ctx)?.start(ctx)?,
            }
        }
        Ok(())
    }
}

impl fmt::Display for BootstrapProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for statement in &self.statements {
            writeln!(f, "{statement}")?;
        }
        Ok(())
    }
}

fn loaded_runtime(ctx: &WorkerContext) -> WorkerResult<Arc<dyn TraceRuntime>> {
    ctx.runtime()
        .ok_or_else(|| WorkerError::Bootstrap(format!("{RUNTIME_NAMESPACE} is not defined")))
}

fn parse_statement(line: usize, text: &str) -> Result<Statement, BootstrapError> {
    let unknown = || BootstrapError::UnknownStatement {
        line,
        text: text.to_string(),
    };
    let literal = |source| BootstrapError::Literal { line, source };

    let body = text.strip_suffix(';').ok_or_else(unknown)?;

    if let Some(assignment) = body.strip_prefix(CONTEXT).and_then(|s| s.strip_prefix('.')) {
        let (name, value) = assignment.split_once(" = ").ok_or_else(unknown)?;
        let value = serde_json::from_str(value).map_err(literal)?;
        return Ok(Statement::SetGlobal {
            name: name.to_string(),
            value,
        });
    }

    if let Some(args) = call_args(body, "importScripts") {
        let url: String = serde_json::from_str(args).map_err(literal)?;
        return Ok(Statement::ImportScript(url));
    }

    if let Some(call) = body
        .strip_prefix(RUNTIME_NAMESPACE)
        .and_then(|s| s.strip_prefix('.'))
    {
        if let Some(args) = call_args(call, "prepare") {
            let options = serde_json::from_str(args).map_err(literal)?;
            return Ok(Statement::Prepare(options));
        }
        if call_args(call, "start") == Some("") {
            return Ok(Statement::Start);
        }
    }

    Err(unknown())
}

/// `name(args)` → `args`.
fn call_args<'a>(text: &'a str, name: &str) -> Option<&'a str> {
    text.strip_prefix(name)?
        .strip_prefix('(')?
        .strip_suffix(')')
}
