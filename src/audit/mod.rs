//! # Módulo de Audit Log
//!
//! Log estruturado append-only de tudo que importa em um run: carga de
//! flow, início/fim de step, comandos externos, assinaturas. Um evento
//! por linha, em JSON (NDJSON), para consumo por ferramentas externas.
//!
//! ## Para todos entenderem:
//!
//! O audit log é a caixa-preta do Council. Se um comando foi executado,
//! abortado ou estourou timeout, existe uma linha aqui dizendo quando e
//! com quais dados. Diferente do log de console (`tracing`), que é para
//! o desenvolvedor, o audit log é um registro durável e estruturado.
//!
//! ## Formato de cada linha:
//!
//! ```json
//! {"timestamp_utc":"2024-06-01T12:00:00.000Z","level":"INFO","event":"command-start","data":{"binary":"claude"}}
//! ```
//!
//! ## Endurecimento
//!
//! - Arquivo criado com permissão 0o600 e diretório 0o700 (quando o
//!   host suporta); reaplicados a cada abertura para resistir a drift.
//! - Rotação por tamanho: `council.log.1 .. council.log.N`.
//! - Escritas serializadas por mutex: linhas nunca se entrelaçam.
//!
//! ## Fail-fast
//!
//! `LOG_LEVEL` inválido, `LOG_MAX_BYTES` ou `LOG_BACKUP_COUNT` não
//! positivos abortam a inicialização. Fallback silencioso é proibido.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};

use crate::errors::CouncilError;

// ============================================================================
// NOMES DE EVENTO
// ============================================================================
// Identificadores curtos e estáveis. Ferramentas externas filtram por
// estes nomes; não renomear sem bump de versão.

pub mod events {
    pub const FLOW_LOAD: &str = "flow-load";
    pub const STEP_START: &str = "step-start";
    pub const STEP_END: &str = "step-end";
    pub const STEP_ERROR: &str = "step-error";
    pub const STEP_SKIP: &str = "step-skip";
    pub const COMMAND_START: &str = "command-start";
    pub const COMMAND_SUCCESS: &str = "command-success";
    pub const COMMAND_FAILURE: &str = "command-failure";
    pub const COMMAND_TIMEOUT: &str = "command-timeout";
    pub const COMMAND_ABORT: &str = "command-abort";
    pub const DOCTOR_INVOKED: &str = "doctor-invoked";
    pub const SIGNATURE_VERIFIED: &str = "signature-verified";
    pub const SIGNATURE_MISSING: &str = "signature-missing";
}

// ============================================================================
// NÍVEL DE AUDIT
// ============================================================================

/// Severidade de um evento de audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AuditLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl AuditLevel {
    /// Converte a string de `LOG_LEVEL`. Case-insensitive.
    ///
    /// Valor desconhecido é erro fatal, nunca fallback.
    pub fn parse(raw: &str) -> Result<Self, CouncilError> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "DEBUG" => Ok(Self::Debug),
            "INFO" => Ok(Self::Info),
            "WARNING" => Ok(Self::Warning),
            "ERROR" => Ok(Self::Error),
            "CRITICAL" => Ok(Self::Critical),
            _ => Err(CouncilError::AuditConfig(format!(
                "LOG_LEVEL desconhecido: '{raw}'"
            ))),
        }
    }

    /// Rótulo estável gravado em cada linha.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
        }
    }
}

// ============================================================================
// CONFIGURAÇÃO
// ============================================================================

/// Tamanho padrão de rotação: 5 MiB.
pub const DEFAULT_LOG_MAX_BYTES: u64 = 5 * 1024 * 1024;

/// Quantidade padrão de arquivos rotacionados mantidos.
pub const DEFAULT_LOG_BACKUP_COUNT: u32 = 3;

/// Configuração do audit log.
#[derive(Debug, Clone)]
pub struct AuditConfig {
    /// Caminho do arquivo de log (`<COUNCIL_HOME>/council.log`).
    pub path: PathBuf,

    /// Nível mínimo gravado.
    pub level: AuditLevel,

    /// Tamanho que dispara a rotação, em bytes.
    pub max_bytes: u64,

    /// Quantos arquivos `.1 .. .N` são mantidos.
    pub backup_count: u32,
}

impl AuditConfig {
    /// Carrega a configuração das variáveis de ambiente, fail-fast.
    ///
    /// Variáveis: `LOG_LEVEL`, `LOG_MAX_BYTES`, `LOG_BACKUP_COUNT`.
    pub fn from_env(council_home: &Path) -> Result<Self, CouncilError> {
        let level = match std::env::var("LOG_LEVEL") {
            Err(_) => AuditLevel::Info,
            Ok(raw) => AuditLevel::parse(&raw)?,
        };

        let max_bytes = read_positive_u64("LOG_MAX_BYTES")?.unwrap_or(DEFAULT_LOG_MAX_BYTES);
        let backup_count =
            read_positive_u64("LOG_BACKUP_COUNT")?.unwrap_or(DEFAULT_LOG_BACKUP_COUNT as u64);

        Ok(Self {
            path: council_home.join("council.log"),
            level,
            max_bytes,
            backup_count: backup_count as u32,
        })
    }
}

fn read_positive_u64(name: &str) -> Result<Option<u64>, CouncilError> {
    match std::env::var(name) {
        Err(_) => Ok(None),
        Ok(raw) => match raw.trim().parse::<i64>() {
            Ok(n) if n > 0 => Ok(Some(n as u64)),
            _ => Err(CouncilError::AuditConfig(format!(
                "{name} deve ser um inteiro positivo, recebido '{raw}'"
            ))),
        },
    }
}

// ============================================================================
// AUDIT LOG
// ============================================================================

struct LogInner {
    file: File,
    written: u64,
}

/// Sink compartilhado de eventos de audit.
///
/// `emit` nunca falha no ponto de chamada: um problema de I/O durante a
/// gravação vira um aviso no console e o run continua. A falha fatal só
/// existe na inicialização.
pub struct AuditLog {
    config: AuditConfig,
    inner: Mutex<LogInner>,
}

impl AuditLog {
    /// Abre (ou cria) o arquivo de log e endurece as permissões.
    pub fn open(config: AuditConfig) -> Result<Self, CouncilError> {
        let file = open_hardened(&config.path)?;
        let written = file
            .metadata()
            .map(|m| m.len())
            .map_err(|e| CouncilError::AuditConfig(format!("metadata do log: {e}")))?;

        Ok(Self {
            config,
            inner: Mutex::new(LogInner { file, written }),
        })
    }

    /// Grava um evento. Eventos abaixo do nível configurado são
    /// descartados.
    pub fn emit(&self, level: AuditLevel, event: &str, data: Value) {
        if level < self.config.level {
            return;
        }

        let record = json!({
            "timestamp_utc": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            "level": level.as_str(),
            "event": event,
            "data": data,
        });
        let mut line = record.to_string();
        line.push('\n');

        // Erros e críticos também aparecem no console do desenvolvedor.
        if level >= AuditLevel::Error {
            tracing::error!(event = event, "audit");
        }

        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if inner.written + line.len() as u64 > self.config.max_bytes {
            if let Err(e) = self.rotate(&mut inner) {
                tracing::warn!(error = %e, "audit log rotation failed");
            }
        }

        if let Err(e) = inner.file.write_all(line.as_bytes()) {
            tracing::warn!(error = %e, "audit log write failed");
            return;
        }
        inner.written += line.len() as u64;
    }

    /// Rotaciona `council.log` para `.1`, empurrando `.1 .. .N-1` e
    /// descartando o mais antigo.
    fn rotate(&self, inner: &mut LogInner) -> Result<(), CouncilError> {
        let base = &self.config.path;

        let _ = inner.file.flush();

        for i in (1..self.config.backup_count).rev() {
            let from = rotated_name(base, i);
            let to = rotated_name(base, i + 1);
            if from.exists() {
                fs::rename(&from, &to)
                    .map_err(|e| CouncilError::AuditConfig(format!("rotação do log: {e}")))?;
            }
        }
        if self.config.backup_count > 0 {
            fs::rename(base, rotated_name(base, 1))
                .map_err(|e| CouncilError::AuditConfig(format!("rotação do log: {e}")))?;
        }

        inner.file = open_hardened(base)?;
        inner.written = 0;
        Ok(())
    }
}

fn rotated_name(base: &Path, index: u32) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(format!(".{index}"));
    PathBuf::from(name)
}

/// Abre o arquivo em modo append, criando diretório e arquivo se
/// necessário, e reaplica as permissões restritivas a cada abertura.
fn open_hardened(path: &Path) -> Result<File, CouncilError> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)
            .map_err(|e| CouncilError::AuditConfig(format!("criar diretório do log: {e}")))?;
        harden_dir(dir);
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| CouncilError::AuditConfig(format!("abrir arquivo de log: {e}")))?;
    harden_file(path);
    Ok(file)
}

#[cfg(unix)]
fn harden_dir(dir: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = fs::set_permissions(dir, fs::Permissions::from_mode(0o700));
}

#[cfg(not(unix))]
fn harden_dir(_dir: &Path) {}

#[cfg(unix)]
fn harden_file(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o600));
}

#[cfg(not(unix))]
fn harden_file(_path: &Path) {}
