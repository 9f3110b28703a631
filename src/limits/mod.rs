//! # Módulo de Limites Globais
//!
//! Define os limites de tamanho que protegem o Council contra prompts,
//! contextos e saídas desproporcionais.
//!
//! ## Para todos entenderem:
//!
//! CLIs de LLM aceitam inputs enormes e podem produzir saídas enormes.
//! Sem limites, um flow mal configurado consumiria memória sem teto e
//! estouraria a janela de contexto dos modelos. Este módulo centraliza
//! os três tetos globais:
//!
//! | Variável            | Padrão  | Protege                              |
//! |---------------------|---------|--------------------------------------|
//! | MAX_CONTEXT_CHARS   | 100000  | Contexto agregado entre steps        |
//! | MAX_INPUT_CHARS     | 120000  | Input entregue a um comando          |
//! | MAX_OUTPUT_CHARS    | 200000  | Saída retida em memória (depois faz  |
//! |                     |         | spool para arquivo)                  |
//!
//! ## Fail-fast obrigatório
//!
//! Uma variável presente com valor não-numérico ou não-positivo derruba
//! o processo na inicialização. Fallback silencioso é proibido: limite
//! errado descoberto no meio de um run custa caro.

use crate::errors::CouncilError;

// ============================================================================
// LIMITES PADRÃO (CONSTANTES)
// ============================================================================

/// Teto padrão do contexto agregado, em caracteres.
pub const DEFAULT_MAX_CONTEXT_CHARS: usize = 100_000;

/// Teto padrão do input de um comando, em caracteres.
pub const DEFAULT_MAX_INPUT_CHARS: usize = 120_000;

/// Teto padrão da saída retida em memória, em caracteres.
pub const DEFAULT_MAX_OUTPUT_CHARS: usize = 200_000;

// ============================================================================
// ESTRUTURA DE LIMITES
// ============================================================================

/// Limites globais de tamanho, consultados por contexto, executor e
/// defaults da validação.
///
/// Acessores são read-only: depois de construída na inicialização a
/// struct nunca muda.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalLimits {
    /// Teto do contexto agregado (`full_context`).
    pub max_context_chars: usize,

    /// Teto do input entregue a um comando.
    pub max_input_chars: usize,

    /// Teto da saída retida em memória antes do spool.
    pub max_output_chars: usize,
}

impl Default for GlobalLimits {
    fn default() -> Self {
        Self {
            max_context_chars: DEFAULT_MAX_CONTEXT_CHARS,
            max_input_chars: DEFAULT_MAX_INPUT_CHARS,
            max_output_chars: DEFAULT_MAX_OUTPUT_CHARS,
        }
    }
}

impl GlobalLimits {
    /// Carrega os limites das variáveis de ambiente.
    ///
    /// Variável ausente usa o padrão. Variável presente com valor
    /// inválido (não-numérico ou zero/negativo) é erro fatal: o nome da
    /// variável e o valor ofensivo aparecem na mensagem.
    pub fn from_env() -> Result<Self, CouncilError> {
        let mut limits = Self::default();

        if let Some(n) = read_positive_env("MAX_CONTEXT_CHARS")? {
            limits.max_context_chars = n;
        }
        if let Some(n) = read_positive_env("MAX_INPUT_CHARS")? {
            limits.max_input_chars = n;
        }
        if let Some(n) = read_positive_env("MAX_OUTPUT_CHARS")? {
            limits.max_output_chars = n;
        }

        Ok(limits)
    }
}

// ============================================================================
// LEITURA DE VARIÁVEL NUMÉRICA
// ============================================================================

/// Lê uma variável de ambiente que, se presente, deve ser um inteiro
/// positivo.
///
/// ## Retorno:
/// - `Ok(None)`: variável ausente (usa o padrão)
/// - `Ok(Some(n))`: valor válido
/// - `Err`: presente mas inválida (fail-fast)
pub fn read_positive_env(name: &str) -> Result<Option<usize>, CouncilError> {
    match std::env::var(name) {
        Err(_) => Ok(None),
        Ok(raw) => match raw.trim().parse::<i64>() {
            Ok(n) if n > 0 => Ok(Some(n as usize)),
            _ => Err(CouncilError::Config(format!(
                "variável de ambiente {name} deve ser um inteiro positivo, recebido '{raw}'"
            ))),
        },
    }
}

// Testes que mexem no ambiente do processo (em qualquer módulo) rodam
// serializados por este lock único.
#[cfg(test)]
pub(crate) fn env_lock() -> std::sync::MutexGuard<'static, ()> {
    static TEST_ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    match TEST_ENV_LOCK.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
