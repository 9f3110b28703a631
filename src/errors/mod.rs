//! # Módulo de Códigos de Erro Estruturados
//!
//! Define códigos de erro padronizados para melhor UX e integração
//! com sistemas externos (CI/CD, dashboards, alertas).
//!
//! ## Para todos entenderem:
//!
//! Quando algo dá errado, este módulo fornece códigos únicos
//! que identificam exatamente o que aconteceu.
//!
//! ## Categorias de Erro
//!
//! | Faixa  | Categoria       | Descrição                              |
//! |--------|-----------------|----------------------------------------|
//! | E1xxx  | Configuração    | Flow inválido, comando proibido        |
//! | E2xxx  | Execução        | Falha ao rodar o CLI externo           |
//! | E3xxx  | Segurança       | SafetyBlock, assinatura de flow        |
//! | E4xxx  | Ambiente        | Variável de ambiente, audit log        |
//! | E5xxx  | Interno         | Bug no próprio Council                 |
//!
//! A taxonomia de runtime é o enum [`CouncilError`]: o orquestrador
//! decide o destino do run fazendo `match` nas variantes, nunca
//! inspecionando strings. Cada variante mapeia para um [`ErrorCode`].

use std::fmt;
use thiserror::Error;

// ============================================================================
// CÓDIGO DE ERRO
// ============================================================================

/// Código de erro estruturado com categoria e número.
///
/// O código é um número de 4 dígitos onde:
/// - Primeiro dígito: categoria (1-5)
/// - Últimos 3 dígitos: erro específico (001-999)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorCode(u16);

impl ErrorCode {
    // ========================================================================
    // E1xxx: Configuração/Validação
    // ========================================================================
    // Erros que acontecem antes de executar qualquer coisa.
    // Problema está no arquivo de flow ou na forma de carregá-lo.

    /// Flow inválido (validação reportou um ou mais problemas).
    pub const INVALID_FLOW: Self = Self(1001);

    /// Arquivo de flow não encontrado ou ilegível.
    pub const FLOW_FILE_NOT_FOUND: Self = Self(1002);

    /// JSON do flow com sintaxe inválida.
    pub const INVALID_FLOW_FORMAT: Self = Self(1003);

    /// Flow implícito recusado em modo não-interativo.
    pub const IMPLICIT_FLOW_REFUSED: Self = Self(1004);

    // ========================================================================
    // E2xxx: Execução de comando
    // ========================================================================

    /// Timeout do comando externo.
    pub const COMMAND_TIMEOUT: Self = Self(2001);

    /// Falha ao spawnar o processo filho.
    pub const COMMAND_SPAWN: Self = Self(2002);

    /// Processo filho saiu com código diferente de zero.
    pub const COMMAND_EXIT: Self = Self(2003);

    /// Input maior que o limite configurado.
    pub const INPUT_TOO_LARGE: Self = Self(2004);

    /// Execução abortada por cancelamento.
    pub const COMMAND_ABORTED: Self = Self(2005);

    // ========================================================================
    // E3xxx: Segurança
    // ========================================================================

    /// Step is_code sem bloco de código cercado na saída.
    pub const SAFETY_BLOCK: Self = Self(3001);

    /// Assinatura do flow ausente em modo estrito.
    pub const SIGNATURE_MISSING: Self = Self(3002);

    /// Assinatura presente mas inválida ou de chave não confiável.
    pub const SIGNATURE_INVALID: Self = Self(3003);

    // ========================================================================
    // E4xxx: Ambiente
    // ========================================================================

    /// Variável de ambiente com valor inválido.
    pub const INVALID_ENV_VAR: Self = Self(4001);

    /// Configuração do audit log inválida (fatal na inicialização).
    pub const AUDIT_CONFIG: Self = Self(4002);

    /// Erro de permissão ou I/O em arquivo do Council.
    pub const FILE_ERROR: Self = Self(4003);

    // ========================================================================
    // E5xxx: Erros Internos
    // ========================================================================

    /// Erro interno inesperado. Se você ver este, reporte!
    pub const INTERNAL_ERROR: Self = Self(5001);

    /// Retorna o código numérico.
    pub fn code(&self) -> u16 {
        self.0
    }

    /// Retorna o código formatado com prefixo "E".
    ///
    /// Exemplo: ErrorCode::SAFETY_BLOCK.formatted() == "E3001"
    pub fn formatted(&self) -> String {
        format!("E{:04}", self.0)
    }

    /// Retorna a categoria do erro baseado no primeiro dígito.
    pub fn category(&self) -> ErrorCategory {
        match self.0 / 1000 {
            1 => ErrorCategory::Configuration,
            2 => ErrorCategory::Execution,
            3 => ErrorCategory::Security,
            4 => ErrorCategory::Environment,
            5 => ErrorCategory::Internal,
            _ => ErrorCategory::Unknown,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.formatted())
    }
}

// ============================================================================
// CATEGORIA DE ERRO
// ============================================================================

/// Categoria de erro baseada no primeiro dígito do código.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Erros de configuração/validação (E1xxx).
    Configuration,
    /// Erros de execução do comando externo (E2xxx).
    Execution,
    /// Erros de segurança (E3xxx).
    Security,
    /// Erros de ambiente (E4xxx).
    Environment,
    /// Erros internos (E5xxx).
    Internal,
    /// Categoria desconhecida.
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration => write!(f, "Configuração"),
            Self::Execution => write!(f, "Execução"),
            Self::Security => write!(f, "Segurança"),
            Self::Environment => write!(f, "Ambiente"),
            Self::Internal => write!(f, "Interno"),
            Self::Unknown => write!(f, "Desconhecido"),
        }
    }
}

// ============================================================================
// TAXONOMIA DE RUNTIME
// ============================================================================

/// Erro do Council, com variantes que o orquestrador trata por `match`.
///
/// `Config` e `AuditConfig` abortam a inicialização; as demais encerram
/// o run corrente. Nenhuma variante é engolida: toda falha vira uma
/// linha para o usuário, um evento de audit e exit code != 0 em modo
/// não-interativo.
#[derive(Debug, Error)]
pub enum CouncilError {
    /// Flow ou ambiente inválido. A mensagem agrega todos os problemas
    /// encontrados pela validação.
    #[error("configuração inválida: {0}")]
    Config(String),

    /// Input preparado excede o limite do step.
    #[error("input com {actual} caracteres excede o limite de {limit}")]
    InputTooLarge { actual: usize, limit: usize },

    /// O comando externo não terminou dentro do timeout.
    #[error("comando excedeu o timeout de {seconds}s")]
    Timeout { seconds: u64 },

    /// Execução cancelada pelo usuário ou por sinal.
    #[error("execução abortada")]
    Aborted,

    /// Falha ao spawnar o processo filho.
    #[error("falha ao iniciar o comando: {message}")]
    Spawn { message: String },

    /// O processo filho saiu com código diferente de zero.
    #[error("comando falhou com código {exit_code}: {stderr_tail}")]
    Command { exit_code: i32, stderr_tail: String },

    /// Step `is_code` sem bloco de código cercado na saída.
    #[error("step '{step_key}' exigia bloco de código e a saída não contém nenhum")]
    SafetyBlock { step_key: String },

    /// Configuração do audit log inválida (fatal na inicialização).
    #[error("configuração do audit log inválida: {0}")]
    AuditConfig(String),
}

impl CouncilError {
    /// Mapeia a variante para o código estruturado correspondente.
    pub fn code(&self) -> ErrorCode {
        match self {
            CouncilError::Config(_) => ErrorCode::INVALID_FLOW,
            CouncilError::InputTooLarge { .. } => ErrorCode::INPUT_TOO_LARGE,
            CouncilError::Timeout { .. } => ErrorCode::COMMAND_TIMEOUT,
            CouncilError::Aborted => ErrorCode::COMMAND_ABORTED,
            CouncilError::Spawn { .. } => ErrorCode::COMMAND_SPAWN,
            CouncilError::Command { .. } => ErrorCode::COMMAND_EXIT,
            CouncilError::SafetyBlock { .. } => ErrorCode::SAFETY_BLOCK,
            CouncilError::AuditConfig(_) => ErrorCode::AUDIT_CONFIG,
        }
    }

    /// Formata o erro para exibição ao usuário (uma linha, com código).
    ///
    /// Stack traces e detalhes internos nunca aparecem aqui; eles vão
    /// para o audit log.
    pub fn user_message(&self) -> String {
        format!("[{}] {}", self.code(), self)
    }
}
