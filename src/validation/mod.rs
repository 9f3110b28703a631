//! # Módulo de Validação de Flow
//!
//! Valida o flow completo antes da execução: campos obrigatórios,
//! unicidade de keys, placeholders de template e — o contrato mais
//! importante — o parser endurecido de `command`.
//!
//! ## Para leigos:
//!
//! O flow diz quais comandos externos serão executados. Um flow
//! malicioso (ou um typo infeliz) poderia tentar contrabandear shell:
//! `claude -p ; rm -rf /`. Este módulo garante que isso morre na
//! validação, antes de qualquer processo ser criado.
//!
//! ## Contrato de segurança do `command`:
//!
//! 1. A tokenização POSIX precisa ter sucesso (só para validar; o
//!    executor nunca entrega a string a um shell)
//! 2. O primeiro token não pode conter separador de caminho
//! 3. O primeiro token precisa estar na allowlist de binários
//! 4. Binário que não é API-only precisa existir no PATH
//! 5. Nenhuma substring proibida pode aparecer na string original:
//!    `|`, `&&`, `;`, crase, `$(`, `${`, `$` + letra/underscore, `~`,
//!    `>`, `>>`, CR, LF
//!
//! ## Por que validar tudo de uma vez?
//!
//! Como no resto do Council, a validação coleta TODOS os erros e
//! reporta de uma vez, em vez de parar no primeiro.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::context::template_placeholders;
use crate::limits::GlobalLimits;
use crate::protocol::{
    FlowStep, RawStep, DEFAULT_INPUT_TEMPLATE, DEFAULT_TIMEOUT_SECS, RESERVED_KEYS,
};

// ============================================================================
// CONSTANTES DO CONTRATO
// ============================================================================

/// Binários de CLI de LLM que o Council aceita executar.
///
/// Se não está aqui, o flow é rejeitado na validação. Isso é melhor
/// que descobrir na execução.
pub const ALLOWED_BINARIES: &[&str] = &["claude", "gemini", "codex", "ollama", "deepseek"];

/// Binários validados como classe API-only: membros da allowlist que
/// não passam pela checagem de existência no PATH.
pub const API_ONLY_BINARIES: &[&str] = &["deepseek"];

/// Substrings proibidas em qualquer posição da string original.
/// `>` cobre também `>>`.
const FORBIDDEN_PATTERNS: &[&str] = &["|", "&&", ";", "`", "$(", "${", "~", ">", "\r", "\n"];

// `$PATH`, `$x`, `$_x`: expansão de variável de shell.
static DOLLAR_IDENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$[A-Za-z_]").expect("valid dollar pattern"));

// Keys precisam ser identificadores para serem referenciáveis como
// `{key}` em templates de steps posteriores.
static KEY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid key regex"));

// ============================================================================
// TIPOS DE ERRO
// ============================================================================

/// Erros de validação de flow.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// Flow sem nenhum step.
    #[error("flow vazio: nenhum step definido")]
    EmptyFlow,

    /// Campo obrigatório ausente.
    #[error("step '{step}': campo obrigatório '{field}' está ausente")]
    MissingField { step: String, field: String },

    /// Key duplicada dentro do flow.
    #[error("key '{key}' duplicada no flow")]
    DuplicateKey { key: String },

    /// Key colide com um placeholder reservado.
    #[error("key '{key}' é um nome reservado (user_prompt, full_context, last_output, instruction)")]
    ReservedKey { key: String },

    /// Key não é um identificador válido.
    #[error("key '{key}' inválida: use apenas letras, dígitos e underscore")]
    InvalidKey { key: String },

    /// Campo numérico presente mas não positivo.
    #[error("step '{step}': campo '{field}' deve ser um inteiro positivo")]
    NonPositive { step: String, field: String },

    /// A tokenização POSIX do comando falhou.
    #[error("step '{step}': comando não tokeniza: {detail}")]
    CommandTokenize { step: String, detail: String },

    /// Primeiro token contém separador de caminho.
    #[error("step '{step}': caminho '{token}' não é permitido como binário")]
    CommandPath { step: String, token: String },

    /// Binário fora da allowlist.
    #[error("step '{step}': binário '{binary}' não está na allowlist (claude, gemini, codex, ollama, deepseek)")]
    CommandNotAllowed { step: String, binary: String },

    /// Binário da allowlist não encontrado no PATH.
    #[error("step '{step}': binário '{binary}' não encontrado no PATH")]
    CommandNotFound { step: String, binary: String },

    /// Metacaractere de shell proibido na string do comando.
    #[error("step '{step}': operador proibido '{pattern}' no comando")]
    ForbiddenPattern { step: String, pattern: String },

    /// Placeholder do template não resolve para nome reservado nem para
    /// key de step estritamente anterior.
    #[error("step '{step}': placeholder '{{{name}}}' desconhecido no input_template")]
    UnknownPlaceholder { step: String, name: String },
}

/// Tipo de resultado para validação: ou a lista de steps resolvidos,
/// ou TODOS os problemas encontrados.
pub type ValidationResult = Result<Vec<FlowStep>, Vec<ValidationError>>;

// ============================================================================
// OPÇÕES
// ============================================================================

/// Opções da validação.
#[derive(Debug, Clone)]
pub struct ValidationOptions {
    /// Checa a existência dos binários no PATH (regra 4 do contrato).
    /// Desligado apenas em testes que não têm os CLIs instalados.
    pub check_binaries: bool,
}

impl Default for ValidationOptions {
    fn default() -> Self {
        Self {
            check_binaries: true,
        }
    }
}

// ============================================================================
// VALIDAÇÃO DO FLOW COMPLETO
// ============================================================================

/// Valida os steps brutos e resolve defaults, retornando a lista de
/// [`FlowStep`] na ordem original.
pub fn validate_flow(
    raw_steps: &[RawStep],
    limits: &GlobalLimits,
    options: &ValidationOptions,
) -> ValidationResult {
    let mut errors = Vec::new();

    if raw_steps.is_empty() {
        return Err(vec![ValidationError::EmptyFlow]);
    }

    // Primeira passada: resolve todas as keys (explícitas ou step_<N>)
    // para que a checagem de placeholders conheça os steps anteriores.
    let keys: Vec<String> = raw_steps
        .iter()
        .enumerate()
        .map(|(i, s)| resolve_key(s, i))
        .collect();

    let mut seen = HashSet::new();
    for key in &keys {
        if !KEY_RE.is_match(key) {
            errors.push(ValidationError::InvalidKey { key: key.clone() });
            continue;
        }
        if RESERVED_KEYS.contains(&key.as_str()) {
            errors.push(ValidationError::ReservedKey { key: key.clone() });
        }
        if !seen.insert(key.clone()) {
            errors.push(ValidationError::DuplicateKey { key: key.clone() });
        }
    }

    // Segunda passada: valida cada step individualmente.
    let mut steps = Vec::with_capacity(raw_steps.len());
    for (index, raw) in raw_steps.iter().enumerate() {
        let key = keys[index].clone();
        if let Some(step) = validate_step(raw, key, &keys[..index], limits, options, &mut errors) {
            steps.push(step);
        }
    }

    if errors.is_empty() {
        Ok(steps)
    } else {
        Err(errors)
    }
}

fn resolve_key(raw: &RawStep, index: usize) -> String {
    match raw.key.as_deref().map(str::trim) {
        Some(k) if !k.is_empty() => k.to_string(),
        _ => format!("step_{}", index + 1),
    }
}

// ============================================================================
// VALIDAÇÃO DE STEP INDIVIDUAL
// ============================================================================

fn validate_step(
    raw: &RawStep,
    key: String,
    earlier_keys: &[String],
    limits: &GlobalLimits,
    options: &ValidationOptions,
    errors: &mut Vec<ValidationError>,
) -> Option<FlowStep> {
    let before = errors.len();

    let required = |value: &Option<String>, field: &str, errors: &mut Vec<ValidationError>| {
        match value.as_deref().map(str::trim) {
            Some(v) if !v.is_empty() => Some(v.to_string()),
            _ => {
                errors.push(ValidationError::MissingField {
                    step: key.clone(),
                    field: field.to_string(),
                });
                None
            }
        }
    };

    let agent_name = required(&raw.agent_name, "agent_name", errors);
    let role_desc = required(&raw.role_desc, "role_desc", errors);
    let command = required(&raw.command, "command", errors);
    let instruction = required(&raw.instruction, "instruction", errors);

    if let Some(cmd) = &command {
        validate_command(&key, cmd, options, errors);
    }

    // Campos numéricos: serde já rejeitou negativos (u64); aqui só o zero.
    for (value, field) in [
        (raw.timeout_seconds, "timeout"),
        (raw.max_input_chars, "max_input_chars"),
        (raw.max_output_chars, "max_output_chars"),
        (raw.max_context_chars, "max_context_chars"),
    ] {
        if value == Some(0) {
            errors.push(ValidationError::NonPositive {
                step: key.clone(),
                field: field.to_string(),
            });
        }
    }

    let input_template = raw
        .input_template
        .clone()
        .unwrap_or_else(|| DEFAULT_INPUT_TEMPLATE.to_string());

    // Placeholders: reservados ou key de step ESTRITAMENTE anterior.
    for name in template_placeholders(&input_template) {
        let is_reserved = RESERVED_KEYS.contains(&name.as_str());
        let is_earlier = earlier_keys.iter().any(|k| k == &name);
        if !is_reserved && !is_earlier {
            errors.push(ValidationError::UnknownPlaceholder {
                step: key.clone(),
                name,
            });
        }
    }

    if errors.len() > before {
        return None;
    }

    Some(FlowStep {
        key,
        agent_name: agent_name.expect("checked above"),
        role_desc: role_desc.expect("checked above"),
        command: command.expect("checked above"),
        instruction: instruction.expect("checked above"),
        input_template,
        style: raw.style.clone().unwrap_or_else(|| "text".to_string()),
        is_code: raw.is_code.unwrap_or(false),
        enabled: raw.enabled.unwrap_or(true),
        timeout_seconds: raw.timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECS),
        max_input_chars: raw
            .max_input_chars
            .map(|n| n as usize)
            .unwrap_or(limits.max_input_chars),
        max_output_chars: raw
            .max_output_chars
            .map(|n| n as usize)
            .unwrap_or(limits.max_output_chars),
        max_context_chars: raw
            .max_context_chars
            .map(|n| n as usize)
            .unwrap_or(limits.max_context_chars),
    })
}

// ============================================================================
// VALIDAÇÃO DO COMANDO (CONTRATO DE SEGURANÇA)
// ============================================================================

/// Aplica as cinco regras do contrato sobre a string original.
pub fn validate_command(
    step_key: &str,
    command: &str,
    options: &ValidationOptions,
    errors: &mut Vec<ValidationError>,
) {
    // Regra 5 primeiro: a checagem é sobre a string BRUTA, posição
    // qualquer, antes mesmo de tokenizar.
    for pattern in FORBIDDEN_PATTERNS {
        if command.contains(pattern) {
            errors.push(ValidationError::ForbiddenPattern {
                step: step_key.to_string(),
                pattern: printable_pattern(pattern),
            });
        }
    }
    if DOLLAR_IDENT_RE.is_match(command) {
        errors.push(ValidationError::ForbiddenPattern {
            step: step_key.to_string(),
            pattern: "$<nome>".to_string(),
        });
    }

    // Regra 1: tokenização POSIX (apenas validação).
    let tokens = match shell_words::split(command) {
        Ok(t) => t,
        Err(e) => {
            errors.push(ValidationError::CommandTokenize {
                step: step_key.to_string(),
                detail: e.to_string(),
            });
            return;
        }
    };

    let Some(first) = tokens.first() else {
        errors.push(ValidationError::CommandTokenize {
            step: step_key.to_string(),
            detail: "comando vazio".to_string(),
        });
        return;
    };

    // Regra 2: caminho absoluto ou relativo é rejeitado.
    if first.contains('/') || first.contains('\\') {
        errors.push(ValidationError::CommandPath {
            step: step_key.to_string(),
            token: first.clone(),
        });
        return;
    }

    // Regra 3: allowlist.
    if !ALLOWED_BINARIES.contains(&first.as_str()) {
        errors.push(ValidationError::CommandNotAllowed {
            step: step_key.to_string(),
            binary: first.clone(),
        });
        return;
    }

    // Regra 4: existência no PATH, exceto classe API-only.
    if options.check_binaries
        && !API_ONLY_BINARIES.contains(&first.as_str())
        && which::which(first).is_err()
    {
        errors.push(ValidationError::CommandNotFound {
            step: step_key.to_string(),
            binary: first.clone(),
        });
    }
}

fn printable_pattern(pattern: &str) -> String {
    match pattern {
        "\r" => "\\r".to_string(),
        "\n" => "\\n".to_string(),
        other => other.to_string(),
    }
}

// ============================================================================
// TESTES
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_step(json: &str) -> RawStep {
        serde_json::from_str(json).unwrap()
    }

    fn minimal_step(command: &str) -> RawStep {
        raw_step(&format!(
            r#"{{
                "agent_name": "Agente",
                "role_desc": "Papel",
                "command": {},
                "instruction": "Faça."
            }}"#,
            serde_json::to_string(command).unwrap()
        ))
    }

    fn validate_one(step: RawStep) -> ValidationResult {
        validate_flow(
            &[step],
            &GlobalLimits::default(),
            &ValidationOptions {
                check_binaries: false,
            },
        )
    }

    fn assert_rejects(command: &str, expect_substring: &str) {
        let result = validate_one(minimal_step(command));
        let errors = result.err().unwrap_or_else(|| {
            panic!("comando deveria ser rejeitado: {command:?}");
        });
        assert!(
            errors.iter().any(|e| e.to_string().contains(expect_substring)),
            "esperava erro contendo {expect_substring:?}, obtido: {errors:?}"
        );
    }

    // ========================================================================
    // CONTRATO DO COMANDO
    // ========================================================================

    #[test]
    fn test_valid_command_passes() {
        let result = validate_one(minimal_step("claude -p"));
        assert!(result.is_ok());
    }

    #[test]
    fn test_every_forbidden_metacharacter_rejected() {
        // Cobertura total: cada metacaractere, em posição arbitrária.
        for pattern in ["|", "&&", ";", "`", "$(", "${", "~", ">", ">>", "\n", "\r"] {
            let cmd = format!("claude -p a{pattern}b");
            let result = validate_one(minimal_step(&cmd));
            assert!(result.is_err(), "deveria rejeitar {pattern:?}");
        }
    }

    #[test]
    fn test_dollar_variable_rejected() {
        assert_rejects("claude -p $HOME", "$");
        assert_rejects("claude -p $_x", "$");
    }

    #[test]
    fn test_binary_outside_allowlist_rejected() {
        for binary in ["bash", "sh", "python", "rm", "curl", "echo"] {
            let cmd = format!("{binary} -c x");
            let result = validate_one(minimal_step(&cmd));
            assert!(result.is_err(), "deveria rejeitar binário {binary:?}");
        }
    }

    #[test]
    fn test_paths_rejected_as_first_token() {
        assert_rejects("/usr/bin/claude -p", "caminho");
        assert_rejects("./claude -p", "caminho");
        assert_rejects("bin/claude -p", "caminho");
    }

    #[test]
    fn test_shell_injection_scenario() {
        // Cenário literal: nenhum processo jamais é criado para isto.
        assert_rejects("claude -p ; rm -rf /", ";");
    }

    #[test]
    fn test_unbalanced_quote_fails_tokenization() {
        assert_rejects("claude -p 'aberto", "tokeniza");
    }

    #[test]
    fn test_api_only_binary_skips_path_check() {
        let result = validate_flow(
            &[minimal_step("deepseek -p")],
            &GlobalLimits::default(),
            &ValidationOptions {
                check_binaries: true,
            },
        );
        assert!(result.is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_binary_must_exist_on_path() {
        use std::os::unix::fs::PermissionsExt;

        let _guard = crate::limits::env_lock();

        let tmp = tempfile::tempdir().unwrap();
        let fake = tmp.path().join("claude");
        std::fs::write(&fake, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();

        let old_path = std::env::var_os("PATH");
        std::env::set_var("PATH", tmp.path());

        let found = validate_flow(
            &[minimal_step("claude -p")],
            &GlobalLimits::default(),
            &ValidationOptions {
                check_binaries: true,
            },
        );
        let missing = validate_flow(
            &[minimal_step("gemini -p")],
            &GlobalLimits::default(),
            &ValidationOptions {
                check_binaries: true,
            },
        );

        match old_path {
            Some(p) => std::env::set_var("PATH", p),
            None => std::env::remove_var("PATH"),
        }

        assert!(found.is_ok());
        let errors = missing.unwrap_err();
        assert!(matches!(
            &errors[0],
            ValidationError::CommandNotFound { binary, .. } if binary == "gemini"
        ));
    }

    // ========================================================================
    // KEYS E DEFAULTS
    // ========================================================================

    #[test]
    fn test_empty_flow_rejected() {
        let result = validate_flow(
            &[],
            &GlobalLimits::default(),
            &ValidationOptions {
                check_binaries: false,
            },
        );
        assert!(matches!(
            result.unwrap_err()[0],
            ValidationError::EmptyFlow
        ));
    }

    #[test]
    fn test_default_key_is_one_indexed() {
        let steps = validate_flow(
            &[minimal_step("claude -p"), minimal_step("gemini -p")],
            &GlobalLimits::default(),
            &ValidationOptions {
                check_binaries: false,
            },
        )
        .unwrap();
        assert_eq!(steps[0].key, "step_1");
        assert_eq!(steps[1].key, "step_2");
    }

    #[test]
    fn test_reserved_key_rejected() {
        for reserved in RESERVED_KEYS {
            let mut step = minimal_step("claude -p");
            step.key = Some(reserved.to_string());
            let result = validate_one(step);
            assert!(result.is_err(), "key reservada {reserved:?} deveria falhar");
        }
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let mut a = minimal_step("claude -p");
        let mut b = minimal_step("gemini -p");
        a.key = Some("plan".to_string());
        b.key = Some("plan".to_string());

        let errors = validate_flow(
            &[a, b],
            &GlobalLimits::default(),
            &ValidationOptions {
                check_binaries: false,
            },
        )
        .unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::DuplicateKey { key } if key == "plan")));
    }

    #[test]
    fn test_missing_required_fields_all_reported() {
        let step = raw_step(r#"{ "command": "claude -p" }"#);
        let errors = validate_one(step).unwrap_err();
        let missing: Vec<_> = errors
            .iter()
            .filter_map(|e| match e {
                ValidationError::MissingField { field, .. } => Some(field.as_str()),
                _ => None,
            })
            .collect();
        assert!(missing.contains(&"agent_name"));
        assert!(missing.contains(&"role_desc"));
        assert!(missing.contains(&"instruction"));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut step = minimal_step("claude -p");
        step.timeout_seconds = Some(0);
        let errors = validate_one(step).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::NonPositive { field, .. } if field == "timeout")));
    }

    #[test]
    fn test_defaults_applied() {
        let steps = validate_one(minimal_step("claude -p")).unwrap();
        let step = &steps[0];
        assert_eq!(step.input_template, "{instruction}\n\n{full_context}");
        assert_eq!(step.timeout_seconds, 120);
        assert!(step.enabled);
        assert!(!step.is_code);
        assert_eq!(step.max_input_chars, GlobalLimits::default().max_input_chars);
    }

    // ========================================================================
    // PLACEHOLDERS DE TEMPLATE
    // ========================================================================

    #[test]
    fn test_reserved_placeholders_accepted() {
        let mut step = minimal_step("claude -p");
        step.input_template =
            Some("{instruction} {user_prompt} {full_context} {last_output}".to_string());
        assert!(validate_one(step).is_ok());
    }

    #[test]
    fn test_unknown_placeholder_rejected() {
        let mut step = minimal_step("claude -p");
        step.input_template = Some("{instruction}\n{inexistente}".to_string());
        let errors = validate_one(step).unwrap_err();
        assert!(errors.iter().any(|e| matches!(
            e,
            ValidationError::UnknownPlaceholder { name, .. } if name == "inexistente"
        )));
    }

    #[test]
    fn test_earlier_step_key_accepted_later_rejected() {
        let mut first = minimal_step("claude -p");
        first.key = Some("plan".to_string());

        let mut second = minimal_step("gemini -p");
        second.key = Some("review".to_string());
        second.input_template = Some("{instruction}\nPlano:\n{plan}".to_string());

        // Ordem correta: review referencia plan (anterior) — ok.
        let ok = validate_flow(
            &[first.clone(), second.clone()],
            &GlobalLimits::default(),
            &ValidationOptions {
                check_binaries: false,
            },
        );
        assert!(ok.is_ok());

        // Ordem invertida: plan ainda não existe quando review roda.
        let err = validate_flow(
            &[second, first],
            &GlobalLimits::default(),
            &ValidationOptions {
                check_binaries: false,
            },
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_self_reference_rejected() {
        let mut step = minimal_step("claude -p");
        step.key = Some("plan".to_string());
        step.input_template = Some("{plan}".to_string());
        assert!(validate_one(step).is_err());
    }
}
