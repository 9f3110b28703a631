//! # Módulo de Protocolo - Estruturas de Dados do Council
//!
//! Este módulo define todas as **estruturas de dados** que os demais
//! componentes compartilham: o flow (lista ordenada de steps), os turnos
//! da conversa e o protocolo de delimitadores entre agentes.
//!
//! ## O que é um Flow?
//!
//! Um flow é o "roteiro" do conselho: uma sequência ordenada de steps,
//! cada um vinculando um papel (role) a um comando de CLI de LLM externo.
//! É carregado de um JSON com estrutura bem definida:
//!
//! ```json
//! {
//!   "steps": [
//!     {
//!       "key": "plan",
//!       "agent_name": "Arquiteto",
//!       "role_desc": "Planejador",
//!       "command": "claude -p",
//!       "instruction": "Produza um plano passo a passo.",
//!       "input_template": "{instruction}\n\n{full_context}",
//!       "timeout": 120
//!     }
//!   ]
//! }
//! ```
//!
//! ## Hierarquia de Tipos:
//!
//! ```text
//! RawStep  (como veio do JSON, campos opcionais)
//!    │  validação (src/validation)
//!    ▼
//! FlowStep (imutável, campos resolvidos)
//!
//! Turn     (uma entrada no histórico append-only)
//! CheckpointDecision (continue / adjust / abort)
//! ```
//!
//! ## Protocolo de delimitadores
//!
//! Todo dado que atravessa a fronteira entre agentes (saída de um step
//! injetada no prompt do próximo, payload entregue via argv) é emoldurado
//! pelos marcadores ASCII definidos aqui. Os marcadores são um contrato
//! público estável: não mudam sem bump de versão.

use serde::{Deserialize, Serialize};

// ============================================================================
// CONTRATO DE DELIMITADORES (PÚBLICO E ESTÁVEL)
// ============================================================================

/// Marcador de abertura do payload entregue via argv.
pub const ARGV_INPUT_START: &str = "===COUNCIL_INPUT_ARGV_START===";

/// Marcador de fechamento do payload entregue via argv.
pub const ARGV_INPUT_END: &str = "===COUNCIL_INPUT_ARGV_END===";

/// Marcador de abertura de dados vindos de um agente anterior.
pub const AGENT_DATA_START: &str = "===DADOS_DO_AGENTE_ANTERIOR===";

/// Marcador de fechamento de dados vindos de um agente anterior.
pub const AGENT_DATA_END: &str = "===FIM_DADOS_DO_AGENTE_ANTERIOR===";

/// Cabeçalho usado no input de re-execução (decisão `adjust` do checkpoint).
pub const PREVIOUS_ANSWER_HEADER: &str = "RESPOSTA ANTERIOR:";

/// Linha que substitui o prefixo removido quando o contexto é truncado.
pub const CONTEXT_TRUNCATION_MARKER: &str =
    "[... contexto anterior truncado por limite de tamanho ...]";

// ============================================================================
// NOMES RESERVADOS
// ============================================================================

/// Placeholders reservados de template.
///
/// Uma `key` de step não pode colidir com nenhum destes nomes: eles são
/// preenchidos pelo orquestrador a cada step e a colisão tornaria o
/// template ambíguo. Verificado na validação, nunca em tempo de execução.
pub const RESERVED_KEYS: &[&str] = &["user_prompt", "full_context", "last_output", "instruction"];

/// Template de input aplicado quando o step não define um.
pub const DEFAULT_INPUT_TEMPLATE: &str = "{instruction}\n\n{full_context}";

/// Timeout padrão de um step, em segundos.
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

// ============================================================================
// STEP BRUTO (COMO VEIO DO JSON)
// ============================================================================

/// Step como deserializado do arquivo de flow, antes da validação.
///
/// Campos obrigatórios são `Option` aqui de propósito: a validação
/// percorre todos os steps e reporta TODAS as ausências de uma vez,
/// em vez de parar no primeiro campo faltante.
///
/// Campos desconhecidos no JSON são ignorados (compatibilidade futura).
#[derive(Debug, Clone, Deserialize)]
pub struct RawStep {
    /// Identificador único dentro do flow. Alias: `id`.
    /// Se ausente, a validação atribui `step_<N>` (1-indexado).
    #[serde(default, alias = "id")]
    pub key: Option<String>,

    /// Nome do agente exibido nos painéis e gravado nos turnos.
    /// Alias: `agent`.
    #[serde(default, alias = "agent")]
    pub agent_name: Option<String>,

    /// Descrição do papel do agente no conselho. Alias: `role`.
    #[serde(default, alias = "role")]
    pub role_desc: Option<String>,

    /// Linha de comando do CLI externo. Passa pelo parser endurecido
    /// de `src/validation` antes de qualquer execução.
    #[serde(default)]
    pub command: Option<String>,

    /// Instrução fixa do step, disponível como `{instruction}` no template.
    #[serde(default)]
    pub instruction: Option<String>,

    /// Template do input enviado ao comando. Padrão:
    /// `"{instruction}\n\n{full_context}"`.
    #[serde(default)]
    pub input_template: Option<String>,

    /// Dica de apresentação para a UI (ex.: "markdown", "code").
    #[serde(default)]
    pub style: Option<String>,

    /// Quando true, a saída DEVE conter um bloco de código cercado;
    /// sem bloco o step falha fechado (SafetyBlock).
    #[serde(default)]
    pub is_code: Option<bool>,

    /// Step desabilitado é pulado sem checkpoint. Padrão: true.
    #[serde(default)]
    pub enabled: Option<bool>,

    /// Timeout em segundos. Alias: `timeout`. Deve ser positivo.
    #[serde(default, alias = "timeout")]
    pub timeout_seconds: Option<u64>,

    /// Limite de caracteres do input deste step (herda o global se ausente).
    #[serde(default)]
    pub max_input_chars: Option<u64>,

    /// Limite de caracteres retidos em memória da saída deste step.
    #[serde(default)]
    pub max_output_chars: Option<u64>,

    /// Limite de caracteres do contexto agregado visto por este step.
    #[serde(default)]
    pub max_context_chars: Option<u64>,
}

// ============================================================================
// STEP VALIDADO
// ============================================================================

/// Um step do flow, imutável após a validação.
///
/// Todos os campos já estão resolvidos: aliases aplicados, defaults
/// preenchidos, `command` aprovado pelo parser endurecido e todos os
/// placeholders do `input_template` verificados.
#[derive(Debug, Clone, Serialize)]
pub struct FlowStep {
    /// Identificador único dentro do flow. Nunca colide com
    /// [`RESERVED_KEYS`].
    pub key: String,

    /// Nome do agente.
    pub agent_name: String,

    /// Descrição do papel.
    pub role_desc: String,

    /// Linha de comando validada (apenas binários da allowlist,
    /// sem metacaracteres de shell).
    pub command: String,

    /// Instrução fixa do step.
    pub instruction: String,

    /// Template do input, com placeholders já verificados.
    pub input_template: String,

    /// Dica de apresentação para a UI.
    pub style: String,

    /// Exige bloco de código cercado na saída.
    pub is_code: bool,

    /// Step participa da execução.
    pub enabled: bool,

    /// Timeout de execução em segundos (positivo).
    pub timeout_seconds: u64,

    /// Limite de caracteres do input (resolvido contra o global).
    pub max_input_chars: usize,

    /// Limite de caracteres da saída em memória (resolvido contra o global).
    pub max_output_chars: usize,

    /// Limite de caracteres do contexto agregado (resolvido contra o global).
    pub max_context_chars: usize,
}

// ============================================================================
// TURNO DA CONVERSA
// ============================================================================

/// Papel de quem produziu um turno.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// O usuário humano.
    Human,
    /// Um agente do conselho.
    Assistant,
}

impl Role {
    /// Rótulo estável usado na agregação do contexto e no log.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Human => "human",
            Role::Assistant => "assistant",
        }
    }
}

/// Uma entrada do histórico da conversa.
///
/// Turnos são imutáveis depois de anexados: o histórico é append-only
/// durante um run, nunca é editado nem reordenado.
#[derive(Debug, Clone, Serialize)]
pub struct Turn {
    /// Nome do agente (ou do usuário) que produziu o conteúdo.
    pub agent_name: String,

    /// Papel do produtor.
    pub role: Role,

    /// Conteúdo textual do turno.
    pub content: String,

    /// Descrição do papel, para rotular o contexto agregado.
    pub role_desc: String,
}

// ============================================================================
// DECISÃO DE CHECKPOINT
// ============================================================================

/// Decisão do humano no checkpoint após cada step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointDecision {
    /// Avança para o próximo step.
    Continue,
    /// Re-executa o mesmo step com uma instrução de acompanhamento.
    Adjust(String),
    /// Encerra o flow imediatamente.
    Abort,
}

// ============================================================================
// RESULTADO DE RUN
// ============================================================================

/// Desfecho de um `run_flow` completo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    /// Todos os steps habilitados concluíram e o humano não abortou.
    Completed,
    /// O humano escolheu abortar em um checkpoint.
    Aborted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_step_aliases() {
        let json = r#"{
            "id": "plan",
            "agent": "Arquiteto",
            "role": "Planejador",
            "command": "claude -p",
            "instruction": "Planeje.",
            "timeout": 30
        }"#;
        let step: RawStep = serde_json::from_str(json).unwrap();
        assert_eq!(step.key.as_deref(), Some("plan"));
        assert_eq!(step.agent_name.as_deref(), Some("Arquiteto"));
        assert_eq!(step.role_desc.as_deref(), Some("Planejador"));
        assert_eq!(step.timeout_seconds, Some(30));
    }

    #[test]
    fn test_raw_step_unknown_fields_ignored() {
        let json = r#"{ "agent_name": "A", "future_field": {"x": 1} }"#;
        let step: RawStep = serde_json::from_str(json).unwrap();
        assert_eq!(step.agent_name.as_deref(), Some("A"));
    }

    #[test]
    fn test_raw_step_is_code_must_be_bool() {
        let json = r#"{ "agent_name": "A", "is_code": "yes" }"#;
        assert!(serde_json::from_str::<RawStep>(json).is_err());
    }

    #[test]
    fn test_reserved_keys_are_stable() {
        // Contrato público: estes quatro nomes são preenchidos pelo
        // orquestrador e proibidos como key de step.
        assert_eq!(
            RESERVED_KEYS,
            &["user_prompt", "full_context", "last_output", "instruction"]
        );
    }

    #[test]
    fn test_markers_are_stable() {
        assert_eq!(ARGV_INPUT_START, "===COUNCIL_INPUT_ARGV_START===");
        assert_eq!(ARGV_INPUT_END, "===COUNCIL_INPUT_ARGV_END===");
        assert_eq!(AGENT_DATA_START, "===DADOS_DO_AGENTE_ANTERIOR===");
        assert_eq!(AGENT_DATA_END, "===FIM_DADOS_DO_AGENTE_ANTERIOR===");
    }

    #[test]
    fn test_role_labels() {
        assert_eq!(Role::Human.as_str(), "human");
        assert_eq!(Role::Assistant.as_str(), "assistant");
    }
}
