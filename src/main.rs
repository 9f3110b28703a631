//! # Council - Orquestrador Multi-Agente de CLIs de LLM
//!
//! Este é o **ponto de entrada principal** do Council: o usuário entrega
//! um prompt e o Council dirige um conselho de agentes, cada um rodando
//! um CLI de LLM externo como processo filho, encadeando as saídas e
//! pausando em checkpoints humanos.
//!
//! ## O que este arquivo faz?
//!
//! 1. **Processa argumentos da linha de comando** (CLI) usando `clap`
//! 2. **Inicializa fail-fast**: limites globais e audit log primeiro
//! 3. **Carrega e valida** o flow (cascata de resolução + assinatura)
//! 4. **Executa o flow** via orquestrador, em modo headless
//! 5. **Gerencia chaves** de assinatura de flow (keygen/sign/trust/verify)
//!
//! ## Exemplo de uso:
//!
//! ```bash
//! # Executar um flow de ponta a ponta
//! council run "Projete uma API de pagamentos" --flow-config flow.json
//!
//! # Diagnosticar o flow sem executar nada
//! council doctor --flow-config flow.json
//!
//! # Assinar um flow e confiar na chave
//! council flow keygen --key-id ci --trust
//! council flow sign flow.json --private-key ci.pem --key-id ci
//! ```
//!
//! ## Arquitetura
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           main.rs                                │
//! │  (CLI, inicialização fail-fast, dispatch)                        │
//! └─────────────────────────────────────────────────────────────────┘
//!                                 │
//!          ┌──────────────────────┼──────────────────────┐
//!          ▼                      ▼                      ▼
//!    ┌──────────┐          ┌────────────┐         ┌──────────┐
//!    │ loader/  │          │orchestrator│         │ executor/│
//!    │ (flow)   │          │ (steps +   │         │ (CLI     │
//!    │          │          │ checkpoint)│         │  filho)  │
//!    └──────────┘          └────────────┘         └──────────┘
//! ```

mod audit;
mod context;
mod errors;
mod executor;
mod extractors;
mod limits;
mod loader;
mod orchestrator;
mod protocol;
mod signature;
mod ui;
mod validation;

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{error, info};

use audit::{events, AuditConfig, AuditLevel, AuditLog};
use errors::CouncilError;
use limits::GlobalLimits;
use loader::{council_home, load_flow};
use orchestrator::Orchestrator;
use protocol::RunOutcome;
use signature::VerifyOutcome;
use ui::HeadlessUi;
use validation::ValidationOptions;

// ============================================================================
// DEFINIÇÃO DA CLI
// ============================================================================

/// Estrutura principal da CLI.
#[derive(Parser)]
#[command(name = "council")]
#[command(about = "Council - conselho de agentes LLM dirigido por flows", long_about = None)]
struct Cli {
    /// Subcomando a ser executado.
    #[command(subcommand)]
    command: Commands,
}

/// Subcomandos disponíveis.
#[derive(Subcommand)]
enum Commands {
    /// Executa um flow de ponta a ponta, sem interação (checkpoints
    /// avançam sozinhos). Exit 0 em sucesso, 1 em qualquer falha.
    Run {
        /// Prompt do usuário que abre o conselho.
        prompt: String,

        /// Caminho do flow JSON. Sem ele, vale a cascata:
        /// FLOW_CONFIG → ./flow.json → ~/flow.json → flow embutido.
        #[arg(short = 'c', long)]
        flow_config: Option<PathBuf>,

        /// Modo silencioso: apenas erros no stderr, sem streaming.
        #[arg(long, short = 's', default_value = "false")]
        silent: bool,

        /// Modo verbose: logs de debug no console.
        #[arg(long, short = 'v', default_value = "false")]
        verbose: bool,
    },

    /// Valida o flow e os binários exigidos; não executa nenhum step.
    Doctor {
        /// Caminho do flow JSON (mesma cascata do run).
        #[arg(short = 'c', long)]
        flow_config: Option<PathBuf>,
    },

    /// Gerenciamento de chaves e assinaturas de flow.
    Flow {
        #[command(subcommand)]
        command: FlowCommands,
    },
}

/// Subcomandos de assinatura de flow.
#[derive(Subcommand)]
enum FlowCommands {
    /// Gera um par de chaves Ed25519 (<id>.pem privada, <id>.pub.pem pública).
    Keygen {
        /// Identificador da chave (vira o nome no trust store).
        #[arg(long)]
        key_id: String,

        /// Instala a chave pública no trust store na hora.
        #[arg(long, default_value = "false")]
        trust: bool,

        /// Diretório de saída das chaves (padrão: diretório atual).
        #[arg(long)]
        out_dir: Option<PathBuf>,
    },

    /// Assina um flow, gravando o sidecar `<flow>.sig`.
    Sign {
        /// Arquivo de flow a assinar.
        file: PathBuf,

        /// Chave privada PKCS#8 PEM.
        #[arg(long)]
        private_key: PathBuf,

        /// Identificador da chave no trust store.
        #[arg(long)]
        key_id: String,
    },

    /// Instala uma chave pública no trust store.
    Trust {
        /// Arquivo PEM da chave pública.
        public_key: PathBuf,

        /// Identificador da chave.
        #[arg(long)]
        key_id: String,
    },

    /// Verifica a assinatura de um flow.
    Verify {
        /// Arquivo de flow.
        file: PathBuf,

        /// Verifica contra esta chave pública em vez do trust store.
        #[arg(long)]
        public_key: Option<PathBuf>,
    },
}

// ============================================================================
// FUNÇÃO PRINCIPAL
// ============================================================================

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let (silent, verbose) = match &cli.command {
        Commands::Run {
            silent, verbose, ..
        } => (*silent, *verbose),
        _ => (false, false),
    };
    init_tracing(silent, verbose);

    let result: anyhow::Result<i32> = match cli.command {
        Commands::Run {
            prompt,
            flow_config,
            silent,
            ..
        } => run_command(&prompt, flow_config.as_deref(), silent)
            .await
            .map_err(Into::into),
        Commands::Doctor { flow_config } => doctor_command(flow_config.as_deref()),
        Commands::Flow { command } => flow_command(command),
    };

    match result {
        Ok(exit_code) => std::process::exit(exit_code),
        Err(e) => {
            // Uma linha para o usuário; detalhes ficam no audit log.
            match e.downcast_ref::<CouncilError>() {
                Some(council) => eprintln!("{}", council.user_message()),
                None => eprintln!("{e:#}"),
            }
            std::process::exit(1);
        }
    }
}

/// Logging de console do desenvolvedor. O audit log é o sink
/// estruturado; isto aqui é só fmt compacto com EnvFilter.
fn init_tracing(silent: bool, verbose: bool) {
    let default_level = if silent {
        "error"
    } else if verbose {
        "debug"
    } else {
        "info"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .compact()
        .try_init();
}

/// Inicialização fail-fast compartilhada: limites e audit log.
fn init_runtime() -> Result<(GlobalLimits, Arc<AuditLog>), CouncilError> {
    let limits = GlobalLimits::from_env()?;
    let home = council_home()?;
    let audit = AuditLog::open(AuditConfig::from_env(&home)?)?;
    Ok((limits, Arc::new(audit)))
}

// ============================================================================
// COMANDO RUN
// ============================================================================

async fn run_command(
    prompt: &str,
    flow_config: Option<&std::path::Path>,
    silent: bool,
) -> Result<i32, CouncilError> {
    let (limits, audit) = init_runtime()?;

    let flow = load_flow(
        flow_config,
        &limits,
        &ValidationOptions::default(),
        Some(&audit),
    )?;

    // Flow implícito (FLOW_CONFIG ou ./flow.json) exige confirmação
    // humana; em modo não-interativo a resposta é não.
    if flow.is_implicit() {
        return Err(CouncilError::Config(format!(
            "flow implícito ({}) recusado em modo não-interativo; passe --flow-config",
            flow.source.label()
        )));
    }

    if let Some(key_id) = &flow.verified_key_id {
        info!(key_id = %key_id, "flow signature verified");
    }
    info!(
        source = flow.source.label(),
        steps = flow.steps.len(),
        "flow loaded"
    );

    let ui = Arc::new(HeadlessUi::new(!silent));
    let mut orch = Orchestrator::new(flow.steps, limits, audit, ui);

    // Ctrl-C vira pedido de cancelamento; o executor derruba o filho.
    let cancel = orch.executor().cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.store(true, Ordering::SeqCst);
        }
    });

    match orch.run_flow(prompt).await? {
        RunOutcome::Completed => Ok(0),
        RunOutcome::Aborted => Ok(1),
    }
}

// ============================================================================
// COMANDO DOCTOR
// ============================================================================

fn doctor_command(flow_config: Option<&std::path::Path>) -> anyhow::Result<i32> {
    let (limits, audit) = init_runtime()?;
    audit.emit(AuditLevel::Info, events::DOCTOR_INVOKED, json!({}));

    let flow = match load_flow(
        flow_config,
        &limits,
        &ValidationOptions::default(),
        Some(&audit),
    ) {
        Ok(flow) => flow,
        Err(e) => {
            println!("flow: INVÁLIDO");
            println!("  {e}");
            return Ok(1);
        }
    };

    println!("flow: ok ({} steps, origem {})", flow.steps.len(), flow.source.label());
    for step in &flow.steps {
        let binary = step.command.split_whitespace().next().unwrap_or("?");
        println!(
            "  step '{}' -> {} (timeout {}s{})",
            step.key,
            binary,
            step.timeout_seconds,
            if step.is_code { ", is_code" } else { "" }
        );
    }

    // Estado da assinatura, sem exigir modo estrito.
    match &flow.path {
        None => println!("assinatura: n/a (flow embutido)"),
        Some(path) => {
            let sidecar_path = signature::sidecar_path(path);
            if !sidecar_path.is_file() {
                println!("assinatura: ausente");
            } else {
                let bytes =
                    fs::read(path).with_context(|| format!("ler flow {}", path.display()))?;
                let sidecar = fs::read(&sidecar_path)
                    .with_context(|| format!("ler sidecar {}", sidecar_path.display()))?;
                let trust_store = signature::trust_dir(&council_home()?);
                match signature::verify(&bytes, &sidecar, &trust_store) {
                    VerifyOutcome::Verified { key_id } => {
                        println!("assinatura: ok (chave '{key_id}')");
                    }
                    VerifyOutcome::UntrustedKey { key_id } => {
                        println!("assinatura: chave '{key_id}' fora do trust store");
                    }
                    VerifyOutcome::BadSignature => println!("assinatura: NÃO CONFERE"),
                    VerifyOutcome::Malformed(detail) => {
                        println!("assinatura: sidecar malformado ({detail})");
                    }
                }
            }
        }
    }

    let strict = signature::require_signature_from_env()?;
    println!(
        "modo estrito (REQUIRE_FLOW_SIGNATURE): {}",
        if strict { "ligado" } else { "desligado" }
    );

    Ok(0)
}

// ============================================================================
// COMANDOS DE CHAVE/ASSINATURA
// ============================================================================

fn flow_command(command: FlowCommands) -> anyhow::Result<i32> {
    match command {
        FlowCommands::Keygen {
            key_id,
            trust,
            out_dir,
        } => {
            let out_dir = out_dir.unwrap_or_else(|| PathBuf::from("."));
            let key = signature::generate_keypair();
            let verifying = key.verifying_key();

            let private_path = out_dir.join(format!("{key_id}.pem"));
            let public_path = out_dir.join(format!("{key_id}.pub.pem"));
            signature::write_private_key(&private_path, &key)?;
            signature::write_public_key(&public_path, &verifying)?;

            println!("chave privada: {}", private_path.display());
            println!("chave pública: {}", public_path.display());
            println!("fingerprint: {}", signature::fingerprint(&verifying));

            if trust {
                let store = signature::trust_dir(&council_home()?);
                let installed = signature::install_trusted_key(&store, &key_id, &verifying)?;
                println!("instalada no trust store: {}", installed.display());
            }
            Ok(0)
        }

        FlowCommands::Sign {
            file,
            private_key,
            key_id,
        } => {
            let key = signature::load_signing_key(&private_key)?;
            let bytes = fs::read(&file).with_context(|| format!("ler {}", file.display()))?;
            let sidecar = signature::sign(&bytes, &key, &key_id)?;

            let sidecar_path = signature::sidecar_path(&file);
            fs::write(&sidecar_path, sidecar)
                .with_context(|| format!("gravar sidecar {}", sidecar_path.display()))?;
            println!("assinado: {}", sidecar_path.display());
            Ok(0)
        }

        FlowCommands::Trust { public_key, key_id } => {
            let verifying = signature::load_verifying_key(&public_key)?;
            let store = signature::trust_dir(&council_home()?);
            let installed = signature::install_trusted_key(&store, &key_id, &verifying)?;
            println!(
                "confiada: {} (fingerprint {})",
                installed.display(),
                signature::fingerprint(&verifying)
            );
            Ok(0)
        }

        FlowCommands::Verify { file, public_key } => {
            let bytes = fs::read(&file).with_context(|| format!("ler {}", file.display()))?;
            let sidecar_path = signature::sidecar_path(&file);
            let sidecar = fs::read(&sidecar_path)
                .with_context(|| format!("sidecar ausente: {}", sidecar_path.display()))?;

            let outcome = match public_key {
                Some(path) => {
                    let key = signature::load_verifying_key(&path)?;
                    signature::verify_with_key(&bytes, &sidecar, &key)
                }
                None => {
                    let store = signature::trust_dir(&council_home()?);
                    signature::verify(&bytes, &sidecar, &store)
                }
            };

            match outcome {
                VerifyOutcome::Verified { key_id } => {
                    println!("ok: assinatura válida (chave '{key_id}')");
                    Ok(0)
                }
                VerifyOutcome::UntrustedKey { key_id } => {
                    error!(key_id = %key_id, "untrusted key");
                    println!("falha: chave '{key_id}' fora do trust store");
                    Ok(1)
                }
                VerifyOutcome::BadSignature => {
                    println!("falha: assinatura não corresponde ao conteúdo");
                    Ok(1)
                }
                VerifyOutcome::Malformed(detail) => {
                    println!("falha: sidecar malformado ({detail})");
                    Ok(1)
                }
            }
        }
    }
}
