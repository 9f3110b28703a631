// Module: Loader
// Resolves which flow to run (cascade), reads and parses it, enforces
// strict signature mode, and hands the raw steps to validation.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde_json::{json, Value};

use crate::audit::{events, AuditLevel, AuditLog};
use crate::errors::CouncilError;
use crate::limits::GlobalLimits;
use crate::protocol::{FlowStep, RawStep};
use crate::signature::{self, VerifyOutcome};
use crate::validation::{validate_flow, ValidationOptions};

/// Where the flow came from, in cascade order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowSource {
    /// Path given explicitly on the command line.
    Explicit,
    /// `FLOW_CONFIG` environment variable.
    EnvVar,
    /// `./flow.json` in the current directory.
    CurrentDir,
    /// `<user-home>/flow.json`.
    HomeDir,
    /// Built-in default flow, compiled into the binary.
    BuiltIn,
}

impl FlowSource {
    /// Implicit sources require explicit user confirmation before
    /// execution and are refused outright in non-interactive mode: an
    /// attacker able to plant `./flow.json` or poison the environment
    /// must not get code execution for free.
    pub fn is_implicit(&self) -> bool {
        matches!(self, FlowSource::EnvVar | FlowSource::CurrentDir)
    }

    pub fn label(&self) -> &'static str {
        match self {
            FlowSource::Explicit => "explicit",
            FlowSource::EnvVar => "env",
            FlowSource::CurrentDir => "cwd",
            FlowSource::HomeDir => "home",
            FlowSource::BuiltIn => "builtin",
        }
    }
}

/// A flow ready to run.
#[derive(Debug)]
pub struct LoadedFlow {
    pub steps: Vec<FlowStep>,
    pub source: FlowSource,
    pub path: Option<PathBuf>,
    /// Set when strict mode verified the signature.
    pub verified_key_id: Option<String>,
}

impl LoadedFlow {
    pub fn is_implicit(&self) -> bool {
        self.source.is_implicit()
    }
}

/// Base directory for Council state: `COUNCIL_HOME` override, else
/// `~/.council`.
pub fn council_home() -> Result<PathBuf, CouncilError> {
    match std::env::var("COUNCIL_HOME") {
        Ok(dir) if !dir.trim().is_empty() => Ok(PathBuf::from(dir)),
        _ => dirs::home_dir()
            .map(|h| h.join(".council"))
            .ok_or_else(|| {
                CouncilError::Config("diretório home do usuário não encontrado".to_string())
            }),
    }
}

// ============================================================================
// Resolution cascade
// ============================================================================

/// Resolves the flow source. Pure core, testable without touching the
/// process environment.
pub fn resolve_source(
    explicit: Option<&Path>,
    env_flow: Option<&Path>,
    cwd_flow: Option<&Path>,
    home_flow: Option<&Path>,
) -> (FlowSource, Option<PathBuf>) {
    if let Some(path) = explicit {
        return (FlowSource::Explicit, Some(path.to_path_buf()));
    }
    if let Some(path) = env_flow {
        return (FlowSource::EnvVar, Some(path.to_path_buf()));
    }
    if let Some(path) = cwd_flow {
        return (FlowSource::CurrentDir, Some(path.to_path_buf()));
    }
    if let Some(path) = home_flow {
        return (FlowSource::HomeDir, Some(path.to_path_buf()));
    }
    (FlowSource::BuiltIn, None)
}

fn resolve_source_from_env(explicit: Option<&Path>) -> (FlowSource, Option<PathBuf>) {
    let env_flow = std::env::var("FLOW_CONFIG")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from);

    let cwd_flow = Some(PathBuf::from("flow.json")).filter(|p| p.is_file());

    let home_flow = dirs::home_dir()
        .map(|h| h.join("flow.json"))
        .filter(|p| p.is_file());

    resolve_source(
        explicit,
        env_flow.as_deref(),
        cwd_flow.as_deref(),
        home_flow.as_deref(),
    )
}

// ============================================================================
// Loading
// ============================================================================

/// Loads, optionally verifies, parses and validates a flow.
///
/// `audit` is optional so that key-management commands and tests can
/// load flows before (or without) an audit sink.
pub fn load_flow(
    explicit: Option<&Path>,
    limits: &GlobalLimits,
    validation: &ValidationOptions,
    audit: Option<&AuditLog>,
) -> Result<LoadedFlow, CouncilError> {
    let (source, path) = resolve_source_from_env(explicit);
    let require_signature = signature::require_signature_from_env()?;

    let (raw_steps, verified_key_id) = match &path {
        Some(path) => {
            let bytes = fs::read(path)
                .with_context(|| format!("ler flow {}", path.display()))
                .map_err(config_err)?;

            let verified_key_id = if require_signature {
                Some(enforce_signature(path, &bytes, audit)?)
            } else {
                None
            };

            (parse_steps(&bytes).map_err(config_err)?, verified_key_id)
        }
        // The built-in flow is compiled into the binary; strict mode
        // governs on-disk flows.
        None => (builtin_default_flow(), None),
    };

    let steps = validate_flow(&raw_steps, limits, validation).map_err(|errors| {
        let joined = errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        CouncilError::Config(joined)
    })?;

    if let Some(audit) = audit {
        audit.emit(
            AuditLevel::Info,
            events::FLOW_LOAD,
            json!({
                "source": source.label(),
                "path": path.as_ref().map(|p| p.display().to_string()),
                "steps": steps.len(),
                "implicit": source.is_implicit(),
            }),
        );
    }

    Ok(LoadedFlow {
        steps,
        source,
        path,
        verified_key_id,
    })
}

/// Strict mode: missing or invalid sidecar fails the load.
fn enforce_signature(
    flow_path: &Path,
    flow_bytes: &[u8],
    audit: Option<&AuditLog>,
) -> Result<String, CouncilError> {
    let home = council_home()?;
    let trust_store = signature::trust_dir(&home);
    let sidecar_path = signature::sidecar_path(flow_path);

    let sidecar_bytes = match fs::read(&sidecar_path) {
        Ok(bytes) => bytes,
        Err(_) => {
            if let Some(audit) = audit {
                audit.emit(
                    AuditLevel::Error,
                    events::SIGNATURE_MISSING,
                    json!({ "flow": flow_path.display().to_string() }),
                );
            }
            return Err(CouncilError::Config(format!(
                "assinatura obrigatória e ausente para {}",
                flow_path.display()
            )));
        }
    };

    match signature::verify(flow_bytes, &sidecar_bytes, &trust_store) {
        VerifyOutcome::Verified { key_id } => {
            if let Some(audit) = audit {
                audit.emit(
                    AuditLevel::Info,
                    events::SIGNATURE_VERIFIED,
                    json!({
                        "flow": flow_path.display().to_string(),
                        "key_id": key_id,
                    }),
                );
            }
            Ok(key_id)
        }
        VerifyOutcome::UntrustedKey { key_id } => Err(CouncilError::Config(format!(
            "flow assinado por chave não confiável: '{key_id}'"
        ))),
        VerifyOutcome::BadSignature => Err(CouncilError::Config(
            "assinatura do flow não corresponde ao conteúdo".to_string(),
        )),
        VerifyOutcome::Malformed(detail) => Err(CouncilError::Config(format!(
            "sidecar de assinatura malformado: {detail}"
        ))),
    }
}

/// Accepts either `{"steps": [...]}` or a bare top-level array.
pub fn parse_steps(bytes: &[u8]) -> anyhow::Result<Vec<RawStep>> {
    let value: Value = serde_json::from_slice(bytes).context("JSON do flow inválido")?;

    let steps_value = match value {
        Value::Array(items) => Value::Array(items),
        Value::Object(mut map) => map.remove("steps").context("flow sem campo 'steps'")?,
        _ => anyhow::bail!("flow deve ser um objeto com 'steps' ou uma lista"),
    };

    serde_json::from_value(steps_value).context("step inválido no flow")
}

/// I/O edges use anyhow for context chaining; the load boundary folds
/// the chain into the `Config` variant the taxonomy demands.
fn config_err(e: anyhow::Error) -> CouncilError {
    CouncilError::Config(format!("{e:#}"))
}

/// Built-in default flow: a two-seat council over the `claude` CLI.
pub fn builtin_default_flow() -> Vec<RawStep> {
    let value = json!([
        {
            "key": "plano",
            "agent_name": "Arquiteto",
            "role_desc": "Planejador",
            "command": "claude -p",
            "instruction": "Analise o pedido do usuário e produza um plano objetivo, em passos numerados.",
            "input_template": "{instruction}\n\n{user_prompt}"
        },
        {
            "key": "revisao",
            "agent_name": "Revisor",
            "role_desc": "Revisor crítico",
            "command": "claude -p",
            "instruction": "Critique o plano anterior: riscos, lacunas e melhorias concretas.",
            "input_template": "{instruction}\n\n{user_prompt}\n\n{plano}"
        }
    ]);
    serde_json::from_value(value).expect("built-in flow is valid")
}
