//! # Executor de CLI - Processos Filhos com Streaming
//!
//! Este é o executor central do Council. Ele roda o CLI de LLM externo
//! como processo filho e devolve a saída acumulada, transmitindo cada
//! linha ao vivo para a UI.
//!
//! ## O que este executor faz?
//!
//! 1. **Reseta** a flag de cancelamento (um cancel antigo não envenena
//!    o próximo run)
//! 2. **Barra** inputs maiores que o limite antes de criar processo
//! 3. **Tokeniza** o comando em argv — NUNCA passa por um shell
//! 4. **Escolhe o canal de entrega**: argv (placeholder `{input}` ou
//!    `gemini -p` sem valor final) ou stdin
//! 5. **Transmite** stdout linha a linha via callback
//! 6. **Faz spool** para arquivo temporário quando a saída excede o
//!    limite em memória
//! 7. **Impõe** timeout e cancelamento: SIGTERM, carência, SIGKILL
//!
//! ## Fluxo de execução:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         run_cli()                             │
//! └──────────────────────────────┬───────────────────────────────┘
//!                                │
//!     ┌──────────────┬───────────┴────────────┬──────────────┐
//!     ▼              ▼                        ▼              ▼
//! ┌─────────┐  ┌───────────┐           ┌───────────┐  ┌───────────┐
//! │ 1. Plan │  │ 2. Spawn  │           │ 3. Stream │  │ 4. Reap   │
//! │  argv   │→ │ (sem      │     →     │ stdout +  │→ │ status /  │
//! │         │  │  shell)   │           │ timeout + │  │ stderr    │
//! └─────────┘  └───────────┘           │ cancel    │  └───────────┘
//!                                      └───────────┘
//! ```
//!
//! ## Concorrência
//!
//! O leitor de stdout, o timer de timeout e o poller de cancelamento
//! correm "juntos" num único `tokio::select!`; o primeiro que disparar
//! vence e os outros dois são descartados com segurança. O stderr é
//! drenado por uma task paralela para nunca deadlockar em pipe cheio.
//! `kill_on_drop(true)` garante que o filho é colhido em QUALQUER
//! caminho de saída, inclusive panic.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::NamedTempFile;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};

use crate::audit::{events, AuditLevel, AuditLog};
use crate::errors::CouncilError;
use crate::protocol::{ARGV_INPUT_END, ARGV_INPUT_START};

/// Carência entre o sinal educado (SIGTERM) e o SIGKILL.
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// Intervalo de polling da flag de cancelamento.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Tempo máximo drenando saída residual depois de matar o filho.
const DRAIN_BUDGET: Duration = Duration::from_secs(2);

/// Quantos caracteres do fim do stderr entram no erro.
const STDERR_TAIL_CHARS: usize = 2000;

// ============================================================================
// CANAL DE ENTREGA DO INPUT
// ============================================================================

/// Como o input chega ao processo filho.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputChannel {
    /// Payload embutido no argv (com marcadores de moldura).
    Argv,
    /// Payload escrito no stdin do filho (sem marcadores) e EOF.
    Stdin,
}

/// Prepara o argv e decide o canal de entrega. Nenhum shell envolvido.
///
/// - `{input}` em qualquer token: substituído pelo payload emoldurado
/// - argv exatamente `gemini -p` ou `gemini --prompt`: payload
///   emoldurado anexado como último elemento
/// - caso contrário: entrega via stdin
pub fn plan_invocation(
    command: &str,
    input_data: &str,
) -> Result<(Vec<String>, InputChannel), CouncilError> {
    let tokens = shell_words::split(command).map_err(|e| CouncilError::Spawn {
        message: format!("comando não tokeniza: {e}"),
    })?;
    if tokens.is_empty() {
        return Err(CouncilError::Spawn {
            message: "comando vazio".to_string(),
        });
    }

    if tokens.iter().any(|t| t.contains("{input}")) {
        let payload = wrap_argv_payload(input_data);
        let argv = tokens
            .into_iter()
            .map(|t| t.replace("{input}", &payload))
            .collect();
        return Ok((argv, InputChannel::Argv));
    }

    // `gemini -p` sem o valor posicional final: o payload vira o valor.
    if tokens.len() == 2 && tokens[0] == "gemini" && (tokens[1] == "-p" || tokens[1] == "--prompt")
    {
        let mut argv = tokens;
        argv.push(wrap_argv_payload(input_data));
        return Ok((argv, InputChannel::Argv));
    }

    Ok((tokens, InputChannel::Stdin))
}

/// Moldura do payload em argv, para o filho distinguir dado de
/// instrução.
fn wrap_argv_payload(data: &str) -> String {
    format!("{ARGV_INPUT_START}\n{data}\n{ARGV_INPUT_END}")
}

// ============================================================================
// SPOOL DE SAÍDA
// ============================================================================

/// Acumula a saída em memória e, passado o teto, transborda de forma
/// transparente para um arquivo temporário (0o600 por padrão do
/// tempfile). O valor final lê o conteúdo combinado.
struct OutputSink {
    max_chars: usize,
    chars: usize,
    buffer: String,
    spool: Option<NamedTempFile>,
}

impl OutputSink {
    fn new(max_chars: usize) -> Self {
        Self {
            max_chars,
            chars: 0,
            buffer: String::new(),
            spool: None,
        }
    }

    fn push(&mut self, chunk: &str) -> Result<(), CouncilError> {
        use std::io::Write;

        self.chars += chunk.chars().count();

        if let Some(spool) = &mut self.spool {
            spool.write_all(chunk.as_bytes()).map_err(spool_error)?;
            return Ok(());
        }

        if self.chars > self.max_chars {
            let mut spool = NamedTempFile::new().map_err(spool_error)?;
            spool.write_all(self.buffer.as_bytes()).map_err(spool_error)?;
            spool.write_all(chunk.as_bytes()).map_err(spool_error)?;
            self.buffer.clear();
            self.spool = Some(spool);
            return Ok(());
        }

        self.buffer.push_str(chunk);
        Ok(())
    }

    fn spooled(&self) -> bool {
        self.spool.is_some()
    }

    fn into_string(self) -> Result<String, CouncilError> {
        use std::io::{Read, Seek, SeekFrom};

        match self.spool {
            None => Ok(self.buffer),
            Some(mut spool) => {
                let file = spool.as_file_mut();
                file.seek(SeekFrom::Start(0)).map_err(spool_error)?;
                let mut content = String::new();
                file.read_to_string(&mut content).map_err(spool_error)?;
                Ok(content)
            }
        }
    }
}

fn spool_error(e: std::io::Error) -> CouncilError {
    CouncilError::Spawn {
        message: format!("spool de saída: {e}"),
    }
}

// ============================================================================
// EXECUTOR
// ============================================================================

/// Executor de comandos externos com streaming, timeout e cancelamento.
///
/// Possui exclusivamente o processo filho durante um `run_cli`: o filho
/// é sempre colhido antes do retorno, em qualquer desfecho.
pub struct CliExecutor {
    cancel: Arc<AtomicBool>,
    audit: Arc<AuditLog>,
}

impl CliExecutor {
    pub fn new(audit: Arc<AuditLog>) -> Self {
        Self {
            cancel: Arc::new(AtomicBool::new(false)),
            audit,
        }
    }

    /// Flag compartilhada, para a UI ou um handler de sinal pedirem
    /// cancelamento de fora.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Pede o cancelamento do run corrente.
    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Executa o comando e retorna a saída acumulada.
    ///
    /// `on_output` é chamado exatamente uma vez por chunk, na ordem
    /// produzida pelo filho, a partir do loop de leitura: a UI precisa
    /// tratá-lo como chamável de qualquer thread.
    pub async fn run_cli(
        &self,
        command: &str,
        input_data: &str,
        timeout: Duration,
        on_output: &(dyn Fn(&str) + Send + Sync),
        max_input_chars: usize,
        max_output_chars: usize,
    ) -> Result<String, CouncilError> {
        // 1. Um cancel pedido antes deste run não vale para este run.
        self.cancel.store(false, Ordering::SeqCst);

        // 2. Guarda de tamanho, antes de criar qualquer processo.
        let input_chars = input_data.chars().count();
        if input_chars > max_input_chars {
            return Err(CouncilError::InputTooLarge {
                actual: input_chars,
                limit: max_input_chars,
            });
        }

        // 3/4. Argv e canal de entrega.
        let (argv, channel) = plan_invocation(command, input_data)?;
        let binary = argv[0].clone();
        let channel_label = match channel {
            InputChannel::Argv => "argv",
            InputChannel::Stdin => "stdin",
        };

        self.audit.emit(
            AuditLevel::Info,
            events::COMMAND_START,
            json!({
                "binary": binary,
                "channel": channel_label,
                "timeout_secs": timeout.as_secs(),
                "input_chars": input_chars,
            }),
        );

        // 5. Spawn sem interpretação de shell, pipes nos três fds.
        let mut child = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                self.audit.emit(
                    AuditLevel::Error,
                    events::COMMAND_FAILURE,
                    json!({ "binary": binary, "error": e.to_string() }),
                );
                CouncilError::Spawn {
                    message: format!("{binary}: {e}"),
                }
            })?;

        // 7. Stdin: escreve e fecha logo, para o filho não bloquear
        // esperando mais input. No canal argv fecha sem escrever nada.
        let stdin = child.stdin.take();
        match channel {
            InputChannel::Stdin => {
                let data = input_data.as_bytes().to_vec();
                tokio::spawn(async move {
                    if let Some(mut stdin) = stdin {
                        let _ = stdin.write_all(&data).await;
                        let _ = stdin.shutdown().await;
                    }
                });
            }
            InputChannel::Argv => drop(stdin),
        }

        // Stderr drenado em paralelo: relatório de erro nunca deadlocka
        // em pipe cheio.
        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_end(&mut buf).await;
            }
            buf
        });

        let stdout = child.stdout.take().ok_or_else(|| CouncilError::Spawn {
            message: "stdout do filho indisponível".to_string(),
        })?;
        let mut lines = BufReader::new(stdout).lines();
        let mut sink = OutputSink::new(max_output_chars);

        // 6/8/9. Leitor, timer e poller logicamente concorrentes: o
        // primeiro a disparar vence.
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let mut poll = tokio::time::interval(CANCEL_POLL_INTERVAL);

        enum ReadOutcome {
            Eof,
            TimedOut,
            Cancelled,
        }

        let outcome = loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        let chunk = format!("{line}\n");
                        on_output(&chunk);
                        sink.push(&chunk)?;
                    }
                    Ok(None) => break ReadOutcome::Eof,
                    Err(_) => break ReadOutcome::Eof,
                },
                () = &mut deadline => break ReadOutcome::TimedOut,
                _ = poll.tick() => {
                    if self.cancel.load(Ordering::SeqCst) {
                        break ReadOutcome::Cancelled;
                    }
                }
            }
        };

        match outcome {
            ReadOutcome::TimedOut => {
                terminate(&mut child).await;
                drain_remaining(&mut lines, on_output, &mut sink).await;
                self.audit.emit(
                    AuditLevel::Error,
                    events::COMMAND_TIMEOUT,
                    json!({ "binary": binary, "timeout_secs": timeout.as_secs() }),
                );
                Err(CouncilError::Timeout {
                    seconds: timeout.as_secs(),
                })
            }
            ReadOutcome::Cancelled => {
                terminate(&mut child).await;
                drain_remaining(&mut lines, on_output, &mut sink).await;
                self.audit.emit(
                    AuditLevel::Warning,
                    events::COMMAND_ABORT,
                    json!({ "binary": binary }),
                );
                Err(CouncilError::Aborted)
            }
            ReadOutcome::Eof => {
                // 10. EOF no stdout: colhe o status e decide. Um filho
                // que fecha o stdout mas nunca sai ainda cai no timeout.
                let status = tokio::select! {
                    status = child.wait() => status.map_err(|e| CouncilError::Spawn {
                        message: format!("wait: {e}"),
                    })?,
                    () = &mut deadline => {
                        terminate(&mut child).await;
                        self.audit.emit(
                            AuditLevel::Error,
                            events::COMMAND_TIMEOUT,
                            json!({ "binary": binary, "timeout_secs": timeout.as_secs() }),
                        );
                        return Err(CouncilError::Timeout {
                            seconds: timeout.as_secs(),
                        });
                    }
                };
                let stderr_buf = stderr_task.await.unwrap_or_default();

                if status.success() {
                    self.audit.emit(
                        AuditLevel::Info,
                        events::COMMAND_SUCCESS,
                        json!({
                            "binary": binary,
                            "output_chars": sink.chars,
                            "spooled": sink.spooled(),
                        }),
                    );
                    sink.into_string()
                } else {
                    let exit_code = status.code().unwrap_or(-1);
                    let stderr_tail = tail_chars(
                        &String::from_utf8_lossy(&stderr_buf),
                        STDERR_TAIL_CHARS,
                    );
                    self.audit.emit(
                        AuditLevel::Error,
                        events::COMMAND_FAILURE,
                        json!({ "binary": binary, "exit_code": exit_code }),
                    );
                    Err(CouncilError::Command {
                        exit_code,
                        stderr_tail,
                    })
                }
            }
        }
    }
}

/// Sinal educado primeiro, SIGKILL depois da carência.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
            if tokio::time::timeout(TERMINATE_GRACE, child.wait())
                .await
                .is_ok()
            {
                return;
            }
        }
    }
    let _ = child.kill().await;
}

/// Depois de matar o filho, drena o que já estava no pipe para o
/// retorno/streaming não perder chunks produzidos antes do sinal.
async fn drain_remaining(
    lines: &mut tokio::io::Lines<BufReader<tokio::process::ChildStdout>>,
    on_output: &(dyn Fn(&str) + Send + Sync),
    sink: &mut OutputSink,
) {
    let _ = tokio::time::timeout(DRAIN_BUDGET, async {
        while let Ok(Some(line)) = lines.next_line().await {
            let chunk = format!("{line}\n");
            on_output(&chunk);
            let _ = sink.push(&chunk);
        }
    })
    .await;
}

fn tail_chars(text: &str, max: usize) -> String {
    let total = text.chars().count();
    if total <= max {
        return text.trim_end().to_string();
    }
    text.chars()
        .skip(total - max)
        .collect::<String>()
        .trim_end()
        .to_string()
}

// ============================================================================
// TESTES
// ============================================================================
