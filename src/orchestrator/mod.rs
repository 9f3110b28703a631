//! # Módulo de Orquestração - Máquina de Estados do Flow
//!
//! Percorre os steps em ordem estritamente serial, montando o contexto
//! de template de cada um, invocando o executor, registrando turnos e
//! dirigindo os checkpoints humanos.
//!
//! ## Máquina de estados por step:
//!
//! ```text
//! Start → BuildContext → Render → Execute → [Success|Failure]
//! Success → Checkpoint → {Continue | Adjust → Execute | Abort}
//! Failure → End(failed)
//! Todos os steps concluídos → End(ok)
//! ```
//!
//! ## Regras que este módulo garante:
//!
//! - Step N+1 só começa depois do checkpoint de N retornar `continue`
//! - Dado de agente anterior NUNCA entra num prompt sem a moldura de
//!   delimitadores (`user_prompt` e `instruction` são os únicos crus)
//! - Step `is_code` sem bloco cercado falha fechado: a saída bruta não
//!   chega ao histórico nem aos steps seguintes
//! - Erro do executor encerra o flow; nada é engolido
//! - `adjust` não é recuperação de erro: é re-execução explícita, e
//!   cada re-execução vira um turno novo no histórico e eventos novos
//!   no audit log

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{error, info};
use uuid::Uuid;

use crate::audit::{events, AuditLevel, AuditLog};
use crate::context::{render_template, wrap_agent_data, CouncilState};
use crate::errors::CouncilError;
use crate::executor::CliExecutor;
use crate::extractors::extract_code_block;
use crate::limits::GlobalLimits;
use crate::protocol::{
    CheckpointDecision, FlowStep, Role, RunOutcome, PREVIOUS_ANSWER_HEADER,
};
use crate::ui::CouncilUi;

// ============================================================================
// ORQUESTRADOR
// ============================================================================

/// Dirige um run completo: é o único escritor do estado e o dono do
/// executor durante cada step.
pub struct Orchestrator {
    steps: Vec<FlowStep>,
    state: CouncilState,
    outputs: HashMap<String, String>,
    executor: CliExecutor,
    audit: Arc<AuditLog>,
    ui: Arc<dyn CouncilUi>,
}

impl Orchestrator {
    pub fn new(
        steps: Vec<FlowStep>,
        limits: GlobalLimits,
        audit: Arc<AuditLog>,
        ui: Arc<dyn CouncilUi>,
    ) -> Self {
        Self {
            steps,
            state: CouncilState::new(limits.max_context_chars),
            outputs: HashMap::new(),
            executor: CliExecutor::new(Arc::clone(&audit)),
            audit,
            ui,
        }
    }

    /// Flag de cancelamento do executor, para a UI ou um handler de
    /// sinal.
    pub fn executor(&self) -> &CliExecutor {
        &self.executor
    }

    /// Histórico do run (somente leitura).
    pub fn state(&self) -> &CouncilState {
        &self.state
    }

    /// Saídas por key dos steps já concluídos.
    pub fn outputs(&self) -> &HashMap<String, String> {
        &self.outputs
    }

    /// Executa o flow de ponta a ponta a partir do prompt humano.
    pub async fn run_flow(&mut self, user_prompt: &str) -> Result<RunOutcome, CouncilError> {
        let run_id = Uuid::new_v4().to_string();
        info!(run_id = %run_id, steps = self.steps.len(), "run starting");

        self.state
            .add_turn("user", Role::Human, user_prompt, "Usuário");

        let steps = self.steps.clone();
        let mut last_output = String::new();

        for step in &steps {
            if !step.enabled {
                info!(step = %step.key, "step disabled, skipping");
                self.audit.emit(
                    AuditLevel::Info,
                    events::STEP_SKIP,
                    json!({ "run_id": run_id, "step": step.key }),
                );
                continue;
            }

            self.audit.emit(
                AuditLevel::Info,
                events::STEP_START,
                json!({ "run_id": run_id, "step": step.key, "agent": step.agent_name }),
            );
            info!(step = %step.key, agent = %step.agent_name, "running step");

            let mut input = self.render_step_input(step, user_prompt, &last_output)?;

            // Loop de checkpoint: `adjust` re-executa o MESMO step com
            // input novo, quantas vezes o humano quiser.
            let output = loop {
                let output = match self.execute_step(step, &input).await {
                    Ok(output) => output,
                    Err(e) => {
                        error!(step = %step.key, error = %e, "step failed");
                        self.audit.emit(
                            AuditLevel::Error,
                            events::STEP_ERROR,
                            json!({
                                "run_id": run_id,
                                "step": step.key,
                                "code": e.code().formatted(),
                                "error": e.to_string(),
                            }),
                        );
                        return Err(e);
                    }
                };

                // Registro: turno do assistente + tabela de saídas.
                self.state.add_turn(
                    &step.agent_name,
                    Role::Assistant,
                    output.clone(),
                    &step.role_desc,
                );
                self.outputs.insert(step.key.clone(), output.clone());
                self.ui
                    .on_step_final(&step.key, &output, &step.style, step.is_code);
                self.audit.emit(
                    AuditLevel::Info,
                    events::STEP_END,
                    json!({
                        "run_id": run_id,
                        "step": step.key,
                        "output_chars": output.chars().count(),
                    }),
                );

                match self.ui.ask_checkpoint(&step.key).await {
                    CheckpointDecision::Continue => break output,
                    CheckpointDecision::Abort => {
                        info!(step = %step.key, "aborted at checkpoint");
                        self.audit.emit(
                            AuditLevel::Warning,
                            events::COMMAND_ABORT,
                            json!({ "step": step.key, "at": "checkpoint" }),
                        );
                        return Ok(RunOutcome::Aborted);
                    }
                    CheckpointDecision::Adjust(follow_up) => {
                        input = build_followup_input(&step.key, &output, &follow_up);
                    }
                }
            };

            last_output = output;
        }

        info!("flow completed");
        Ok(RunOutcome::Completed)
    }

    // ========================================================================
    // CONTEXTO DE TEMPLATE
    // ========================================================================

    /// Monta o mapeamento de placeholders e renderiza o input do step.
    ///
    /// `user_prompt` e `instruction` entram crus; `full_context`,
    /// `last_output` e cada key de step anterior entram EMOLDURADOS
    /// pelos delimitadores, com rótulo de origem.
    fn render_step_input(
        &self,
        step: &FlowStep,
        user_prompt: &str,
        last_output: &str,
    ) -> Result<String, CouncilError> {
        let mut vars: HashMap<String, String> = HashMap::new();
        vars.insert("user_prompt".to_string(), user_prompt.to_string());
        vars.insert("instruction".to_string(), step.instruction.clone());
        vars.insert(
            "full_context".to_string(),
            wrap_agent_data(
                "full_context",
                &self.state.full_context_capped(step.max_context_chars),
            ),
        );
        vars.insert(
            "last_output".to_string(),
            wrap_agent_data("last_output", last_output),
        );
        for (key, output) in &self.outputs {
            vars.insert(key.clone(), wrap_agent_data(key, output));
        }

        // Placeholders foram conferidos no parse; uma referência a um
        // step desabilitado (pulado) ainda falha aqui, alto e claro.
        render_template(&step.input_template, &vars)
    }

    // ========================================================================
    // EXECUÇÃO DE UM STEP
    // ========================================================================

    /// Invoca o executor e aplica o contrato `is_code`.
    async fn execute_step(&self, step: &FlowStep, input: &str) -> Result<String, CouncilError> {
        let ui = Arc::clone(&self.ui);
        let step_key = step.key.clone();
        let on_output = move |chunk: &str| ui.on_stream(&step_key, chunk);

        let raw = self
            .executor
            .run_cli(
                &step.command,
                input,
                Duration::from_secs(step.timeout_seconds),
                &on_output,
                step.max_input_chars,
                step.max_output_chars,
            )
            .await?;

        if step.is_code {
            // Falha fechada: sem bloco cercado, a saída bruta morre aqui.
            return match extract_code_block(&raw) {
                Some(code) => Ok(code),
                None => Err(CouncilError::SafetyBlock {
                    step_key: step.key.clone(),
                }),
            };
        }

        Ok(raw.trim_end().to_string())
    }
}

/// Input de re-execução: a resposta anterior emoldurada sob um
/// cabeçalho claro, seguida da instrução de acompanhamento do humano.
fn build_followup_input(step_key: &str, prior_output: &str, follow_up: &str) -> String {
    format!(
        "{PREVIOUS_ANSWER_HEADER}\n{}\n\n{follow_up}",
        wrap_agent_data(step_key, prior_output)
    )
}

// ============================================================================
// TESTES
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditConfig;
    use crate::protocol::{AGENT_DATA_END, AGENT_DATA_START};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    // UI roteirizada: devolve decisões pré-programadas e grava tudo
    // que recebeu.
    struct ScriptedUi {
        decisions: Mutex<VecDeque<CheckpointDecision>>,
        streamed: Mutex<Vec<(String, String)>>,
        finals: Mutex<Vec<(String, String)>>,
    }

    impl ScriptedUi {
        fn new(decisions: Vec<CheckpointDecision>) -> Arc<Self> {
            Arc::new(Self {
                decisions: Mutex::new(decisions.into()),
                streamed: Mutex::new(Vec::new()),
                finals: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl CouncilUi for ScriptedUi {
        fn on_stream(&self, step_key: &str, chunk: &str) {
            self.streamed
                .lock()
                .unwrap()
                .push((step_key.to_string(), chunk.to_string()));
        }

        fn on_step_final(&self, step_key: &str, content: &str, _style: &str, _is_code: bool) {
            self.finals
                .lock()
                .unwrap()
                .push((step_key.to_string(), content.to_string()));
        }

        async fn ask_checkpoint(&self, _step_key: &str) -> CheckpointDecision {
            self.decisions
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(CheckpointDecision::Continue)
        }
    }

    fn test_audit(dir: &std::path::Path) -> Arc<AuditLog> {
        Arc::new(
            AuditLog::open(AuditConfig {
                path: dir.join("council.log"),
                level: AuditLevel::Debug,
                max_bytes: 10 * 1024 * 1024,
                backup_count: 1,
            })
            .unwrap(),
        )
    }

    fn log_events(dir: &std::path::Path) -> Vec<String> {
        std::fs::read_to_string(dir.join("council.log"))
            .unwrap_or_default()
            .lines()
            .map(|l| {
                serde_json::from_str::<serde_json::Value>(l).unwrap()["event"]
                    .as_str()
                    .unwrap()
                    .to_string()
            })
            .collect()
    }

    fn step(key: &str, command: &str) -> FlowStep {
        FlowStep {
            key: key.to_string(),
            agent_name: format!("agente-{key}"),
            role_desc: format!("papel-{key}"),
            command: command.to_string(),
            instruction: format!("instrução de {key}"),
            input_template: "{instruction}\n\n{user_prompt}".to_string(),
            style: "text".to_string(),
            is_code: false,
            enabled: true,
            timeout_seconds: 30,
            max_input_chars: 100_000,
            max_output_chars: 100_000,
            max_context_chars: 100_000,
        }
    }

    fn orchestrator(
        steps: Vec<FlowStep>,
        ui: Arc<dyn CouncilUi>,
        dir: &std::path::Path,
    ) -> Orchestrator {
        Orchestrator::new(steps, GlobalLimits::default(), test_audit(dir), ui)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_happy_path_records_two_turns() {
        let tmp = tempfile::tempdir().unwrap();
        let ui = ScriptedUi::new(vec![]);
        let mut orch = orchestrator(
            vec![step("saudacao", "echo Hello, World.")],
            ui.clone(),
            tmp.path(),
        );

        let outcome = orch.run_flow("World").await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed);

        let turns = orch.state().turns();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, Role::Human);
        assert_eq!(turns[0].content, "World");
        assert_eq!(turns[1].role, Role::Assistant);
        assert_eq!(turns[1].content, "Hello, World.");

        let events = log_events(tmp.path());
        assert!(events.contains(&"command-start".to_string()));
        assert!(events.contains(&"command-success".to_string()));
        assert!(events.contains(&"step-end".to_string()));

        // O painel final recebeu o conteúdo registrado.
        let finals = ui.finals.lock().unwrap();
        assert_eq!(finals.len(), 1);
        assert_eq!(finals[0], ("saudacao".to_string(), "Hello, World.".to_string()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_is_code_fails_closed() {
        let tmp = tempfile::tempdir().unwrap();
        let ui = ScriptedUi::new(vec![]);
        let mut code_step = step("gen", "echo not code");
        code_step.is_code = true;
        let following = step("depois", "echo nunca");

        let mut orch = orchestrator(vec![code_step, following], ui.clone(), tmp.path());
        let err = orch.run_flow("x").await.unwrap_err();

        assert!(matches!(err, CouncilError::SafetyBlock { ref step_key } if step_key == "gen"));
        // Nenhum turno de assistente entrou; o step seguinte nunca rodou.
        assert_eq!(orch.state().turns().len(), 1);
        assert!(orch.outputs().is_empty());
        assert!(log_events(tmp.path()).contains(&"step-error".to_string()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_is_code_extracts_fenced_block() {
        let tmp = tempfile::tempdir().unwrap();
        let ui = ScriptedUi::new(vec![]);
        let mut code_step = step("gen", "cat");
        code_step.is_code = true;
        code_step.input_template = "{instruction}".to_string();
        code_step.instruction = "preamble\n```python\nprint(1)\n```\ntrailer".to_string();

        let mut orch = orchestrator(vec![code_step], ui.clone(), tmp.path());
        orch.run_flow("x").await.unwrap();

        assert_eq!(orch.outputs()["gen"], "print(1)");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_earlier_step_key_is_wrapped() {
        let tmp = tempfile::tempdir().unwrap();
        let ui = ScriptedUi::new(vec![]);

        let plan = step("plan", "echo P");
        let mut review = step("review", "cat");
        review.input_template = "{instruction}\n\nPlan:\n{plan}".to_string();

        let mut orch = orchestrator(vec![plan, review], ui.clone(), tmp.path());
        orch.run_flow("x").await.unwrap();

        let review_output = &orch.outputs()["review"];
        assert!(review_output.contains(&format!(
            "Plan:\n{AGENT_DATA_START}\n[origem: plan]\nP\n{AGENT_DATA_END}"
        )));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_last_output_and_full_context_are_wrapped() {
        let tmp = tempfile::tempdir().unwrap();
        let ui = ScriptedUi::new(vec![]);

        let first = step("first", "echo SEGREDO_DO_AGENTE");
        let mut second = step("second", "cat");
        second.input_template = "{last_output}\n{full_context}".to_string();

        let mut orch = orchestrator(vec![first, second], ui.clone(), tmp.path());
        orch.run_flow("x").await.unwrap();

        let output = &orch.outputs()["second"];
        // O conteúdo do agente anterior nunca aparece sem moldura.
        assert!(output.contains(AGENT_DATA_START));
        assert!(output.contains(AGENT_DATA_END));
        assert!(output.contains("[origem: last_output]\nSEGREDO_DO_AGENTE"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_adjust_reexecutes_with_framed_previous_answer() {
        let tmp = tempfile::tempdir().unwrap();
        let ui = ScriptedUi::new(vec![
            CheckpointDecision::Adjust("refine por favor".to_string()),
            CheckpointDecision::Continue,
        ]);

        let mut echo_back = step("s", "cat");
        echo_back.input_template = "{instruction}".to_string();

        let mut orch = orchestrator(vec![echo_back], ui.clone(), tmp.path());
        orch.run_flow("x").await.unwrap();

        // Duas execuções: humano + 2 turnos de assistente.
        assert_eq!(orch.state().turns().len(), 3);

        let second_output = &orch.outputs()["s"];
        assert!(second_output.starts_with(PREVIOUS_ANSWER_HEADER));
        assert!(second_output.contains(AGENT_DATA_START));
        assert!(second_output.contains("refine por favor"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_abort_at_checkpoint_stops_flow() {
        let tmp = tempfile::tempdir().unwrap();
        let ui = ScriptedUi::new(vec![CheckpointDecision::Abort]);

        let mut orch = orchestrator(
            vec![step("a", "echo um"), step("b", "echo dois")],
            ui.clone(),
            tmp.path(),
        );
        let outcome = orch.run_flow("x").await.unwrap();

        assert_eq!(outcome, RunOutcome::Aborted);
        assert!(orch.outputs().contains_key("a"));
        assert!(!orch.outputs().contains_key("b"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_disabled_step_is_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let ui = ScriptedUi::new(vec![]);

        let mut disabled = step("off", "echo nunca");
        disabled.enabled = false;

        let mut orch = orchestrator(vec![disabled, step("on", "echo sim")], ui.clone(), tmp.path());
        let outcome = orch.run_flow("x").await.unwrap();

        assert_eq!(outcome, RunOutcome::Completed);
        assert!(!orch.outputs().contains_key("off"));
        assert_eq!(orch.state().turns().len(), 2);
        assert!(log_events(tmp.path()).contains(&"step-skip".to_string()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_executor_error_ends_flow() {
        let tmp = tempfile::tempdir().unwrap();
        let ui = ScriptedUi::new(vec![]);

        let bad = step("bad", "cat /definitely/not/here");
        let never = step("never", "echo x");

        let mut orch = orchestrator(vec![bad, never], ui.clone(), tmp.path());
        let err = orch.run_flow("x").await.unwrap_err();

        assert!(matches!(err, CouncilError::Command { .. }));
        assert!(orch.outputs().is_empty());
        assert!(log_events(tmp.path()).contains(&"step-error".to_string()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_streaming_reaches_ui_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let ui = ScriptedUi::new(vec![]);

        let mut multi = step("multi", "cat");
        multi.input_template = "{instruction}".to_string();
        multi.instruction = "linha1\nlinha2\nlinha3".to_string();

        let mut orch = orchestrator(vec![multi], ui.clone(), tmp.path());
        orch.run_flow("x").await.unwrap();

        let streamed = ui.streamed.lock().unwrap();
        let joined: String = streamed.iter().map(|(_, c)| c.as_str()).collect();
        assert_eq!(joined, "linha1\nlinha2\nlinha3\n");
        assert!(streamed.iter().all(|(k, _)| k == "multi"));
    }
}
