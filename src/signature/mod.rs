// Module: Signature
// Ed25519 signing and verification of flow files against a local trust
// store of PEM public keys.

use std::fs;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
use ed25519_dalek::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use once_cell::sync::Lazy;
use rand::rngs::OsRng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::CouncilError;

/// Sidecar schema version. Bumped together with the delimiter protocol.
pub const SIDECAR_VERSION: u32 = 1;

/// Only supported algorithm.
pub const SIDECAR_ALGORITHM: &str = "ed25519";

// key_id becomes a file name inside the trust store, so it must never
// carry path syntax.
static KEY_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,63}$").expect("valid key id regex"));

/// Sidecar file co-located with the flow (`<flow>.sig`).
///
/// The signed payload is the flow file's raw bytes, never its parsed
/// form: re-serializing JSON is not byte-stable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureSidecar {
    pub version: u32,
    pub algorithm: String,
    pub key_id: String,
    /// Ed25519 signature, base64 (64 bytes decoded).
    pub signature: String,
}

/// Result of verifying a flow file against the trust store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// Signature checks out against a trusted key.
    Verified { key_id: String },
    /// The sidecar names a key the trust store does not hold.
    UntrustedKey { key_id: String },
    /// Trusted key found, but the signature does not match the bytes.
    BadSignature,
    /// Sidecar unreadable, wrong version/algorithm, or malformed fields.
    Malformed(String),
}

/// Path of the sidecar for a flow file: `<flow>.sig`.
pub fn sidecar_path(flow_path: &Path) -> PathBuf {
    let mut name = flow_path.as_os_str().to_os_string();
    name.push(".sig");
    PathBuf::from(name)
}

/// Trust store directory: `TRUSTED_FLOW_KEYS_DIR` override, else
/// `<COUNCIL_HOME>/trusted_flow_keys`.
pub fn trust_dir(council_home: &Path) -> PathBuf {
    match std::env::var("TRUSTED_FLOW_KEYS_DIR") {
        Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
        _ => council_home.join("trusted_flow_keys"),
    }
}

/// Parses `REQUIRE_FLOW_SIGNATURE`. Accepts 1/0, true/false, yes/no,
/// on/off (case-insensitive); anything else is a fatal config error.
pub fn require_signature_from_env() -> Result<bool, CouncilError> {
    match std::env::var("REQUIRE_FLOW_SIGNATURE") {
        Err(_) => Ok(false),
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(CouncilError::Config(format!(
                "REQUIRE_FLOW_SIGNATURE com valor inválido: '{raw}'"
            ))),
        },
    }
}

// ============================================================================
// Sign / verify
// ============================================================================

/// Signs the flow bytes, producing the serialized sidecar.
pub fn sign(
    file_bytes: &[u8],
    signing_key: &SigningKey,
    key_id: &str,
) -> Result<Vec<u8>, CouncilError> {
    validate_key_id(key_id)?;

    let signature: Signature = signing_key.sign(file_bytes);
    let sidecar = SignatureSidecar {
        version: SIDECAR_VERSION,
        algorithm: SIDECAR_ALGORITHM.to_string(),
        key_id: key_id.to_string(),
        signature: BASE64.encode(signature.to_bytes()),
    };

    let mut out = serde_json::to_vec_pretty(&sidecar)
        .map_err(|e| CouncilError::Config(format!("serializar sidecar: {e}")))?;
    out.push(b'\n');
    Ok(out)
}

/// Decodes and sanity-checks a sidecar. Shared by both verify paths.
fn decode_sidecar(sidecar_bytes: &[u8]) -> Result<(SignatureSidecar, Signature), VerifyOutcome> {
    let sidecar: SignatureSidecar = match serde_json::from_slice(sidecar_bytes) {
        Ok(s) => s,
        Err(e) => return Err(VerifyOutcome::Malformed(format!("sidecar JSON inválido: {e}"))),
    };

    if sidecar.version != SIDECAR_VERSION {
        return Err(VerifyOutcome::Malformed(format!(
            "versão de sidecar não suportada: {}",
            sidecar.version
        )));
    }
    if sidecar.algorithm != SIDECAR_ALGORITHM {
        return Err(VerifyOutcome::Malformed(format!(
            "algoritmo não suportado: {}",
            sidecar.algorithm
        )));
    }
    if validate_key_id(&sidecar.key_id).is_err() {
        return Err(VerifyOutcome::Malformed(format!(
            "key_id inválido: '{}'",
            sidecar.key_id
        )));
    }

    let sig_bytes = match BASE64.decode(&sidecar.signature) {
        Ok(b) => b,
        Err(_) => return Err(VerifyOutcome::Malformed("assinatura não é base64".to_string())),
    };
    let sig_array: [u8; 64] = match sig_bytes.try_into() {
        Ok(a) => a,
        Err(_) => return Err(VerifyOutcome::Malformed("assinatura não tem 64 bytes".to_string())),
    };

    let signature = Signature::from_bytes(&sig_array);
    Ok((sidecar, signature))
}

/// Verifies the flow bytes against the sidecar and the trust store.
///
/// Never panics and never touches anything outside `trust_store` — the
/// `key_id` is validated before being used as a file name.
pub fn verify(file_bytes: &[u8], sidecar_bytes: &[u8], trust_store: &Path) -> VerifyOutcome {
    let (sidecar, signature) = match decode_sidecar(sidecar_bytes) {
        Ok(decoded) => decoded,
        Err(outcome) => return outcome,
    };

    let key_path = trust_store.join(format!("{}.pem", sidecar.key_id));
    let pem = match fs::read_to_string(&key_path) {
        Ok(p) => p,
        Err(_) => {
            return VerifyOutcome::UntrustedKey {
                key_id: sidecar.key_id,
            }
        }
    };
    let verifying_key = match VerifyingKey::from_public_key_pem(&pem) {
        Ok(k) => k,
        Err(_) => {
            return VerifyOutcome::UntrustedKey {
                key_id: sidecar.key_id,
            }
        }
    };

    match verifying_key.verify(file_bytes, &signature) {
        Ok(()) => VerifyOutcome::Verified {
            key_id: sidecar.key_id,
        },
        Err(_) => VerifyOutcome::BadSignature,
    }
}

/// Verifies against an explicit public key, bypassing the trust store
/// (`flow verify --public-key`).
pub fn verify_with_key(
    file_bytes: &[u8],
    sidecar_bytes: &[u8],
    key: &VerifyingKey,
) -> VerifyOutcome {
    let (sidecar, signature) = match decode_sidecar(sidecar_bytes) {
        Ok(decoded) => decoded,
        Err(outcome) => return outcome,
    };

    match key.verify(file_bytes, &signature) {
        Ok(()) => VerifyOutcome::Verified {
            key_id: sidecar.key_id,
        },
        Err(_) => VerifyOutcome::BadSignature,
    }
}

fn validate_key_id(key_id: &str) -> Result<(), CouncilError> {
    if KEY_ID_RE.is_match(key_id) {
        Ok(())
    } else {
        Err(CouncilError::Config(format!(
            "key_id inválido: '{key_id}' (apenas [A-Za-z0-9._-], até 64 caracteres)"
        )))
    }
}

// ============================================================================
// Key management (flow keygen / trust)
// ============================================================================

/// Generates a fresh Ed25519 key pair.
pub fn generate_keypair() -> SigningKey {
    SigningKey::generate(&mut OsRng)
}

/// Writes the private key as PKCS#8 PEM with owner-only permissions.
pub fn write_private_key(path: &Path, key: &SigningKey) -> Result<(), CouncilError> {
    let pem = key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| CouncilError::Config(format!("codificar chave privada: {e}")))?;
    write_owner_only(path, pem.as_bytes())
}

/// Writes the public key as SPKI PEM.
pub fn write_public_key(path: &Path, key: &VerifyingKey) -> Result<(), CouncilError> {
    let pem = key
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| CouncilError::Config(format!("codificar chave pública: {e}")))?;
    write_owner_only(path, pem.as_bytes())
}

/// Loads a PKCS#8 PEM private key.
pub fn load_signing_key(path: &Path) -> Result<SigningKey, CouncilError> {
    let pem = fs::read_to_string(path)
        .map_err(|e| CouncilError::Config(format!("ler chave privada {}: {e}", path.display())))?;
    SigningKey::from_pkcs8_pem(&pem)
        .map_err(|e| CouncilError::Config(format!("chave privada inválida: {e}")))
}

/// Loads an SPKI PEM public key.
pub fn load_verifying_key(path: &Path) -> Result<VerifyingKey, CouncilError> {
    let pem = fs::read_to_string(path)
        .map_err(|e| CouncilError::Config(format!("ler chave pública {}: {e}", path.display())))?;
    VerifyingKey::from_public_key_pem(&pem)
        .map_err(|e| CouncilError::Config(format!("chave pública inválida: {e}")))
}

/// Installs a public key into the trust store as `<key_id>.pem`.
///
/// The only write path into the trust store: everything else treats the
/// directory as read-only.
pub fn install_trusted_key(
    trust_store: &Path,
    key_id: &str,
    key: &VerifyingKey,
) -> Result<PathBuf, CouncilError> {
    validate_key_id(key_id)?;
    fs::create_dir_all(trust_store)
        .map_err(|e| CouncilError::Config(format!("criar trust store: {e}")))?;
    harden_dir(trust_store);

    let path = trust_store.join(format!("{key_id}.pem"));
    write_public_key(&path, key)?;
    Ok(path)
}

/// SHA-256 fingerprint of the raw public key, hex, truncated for display.
pub fn fingerprint(key: &VerifyingKey) -> String {
    let digest = Sha256::digest(key.as_bytes());
    digest
        .iter()
        .take(8)
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

fn write_owner_only(path: &Path, bytes: &[u8]) -> Result<(), CouncilError> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)
            .map_err(|e| CouncilError::Config(format!("criar diretório {}: {e}", dir.display())))?;
    }
    fs::write(path, bytes)
        .map_err(|e| CouncilError::Config(format!("gravar {}: {e}", path.display())))?;
    harden_file(path);
    Ok(())
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::env_lock;

    fn trusted_setup(key_id: &str) -> (tempfile::TempDir, SigningKey) {
        let tmp = tempfile::tempdir().unwrap();
        let key = generate_keypair();
        install_trusted_key(tmp.path(), key_id, &key.verifying_key()).unwrap();
        (tmp, key)
    }

    #[test]
    fn test_sign_then_verify_roundtrip() {
        let (store, key) = trusted_setup("ci-key");
        let flow = br#"{"steps": []}"#;

        let sidecar = sign(flow, &key, "ci-key").unwrap();
        let outcome = verify(flow, &sidecar, store.path());
        assert_eq!(
            outcome,
            VerifyOutcome::Verified {
                key_id: "ci-key".to_string()
            }
        );
    }

    #[test]
    fn test_verify_detects_tampered_bytes() {
        let (store, key) = trusted_setup("ci-key");
        let flow = br#"{"steps": []}"#;

        let sidecar = sign(flow, &key, "ci-key").unwrap();
        let tampered = br#"{"steps": [{}]}"#;
        assert_eq!(verify(tampered, &sidecar, store.path()), VerifyOutcome::BadSignature);
    }

    #[test]
    fn test_verify_untrusted_key() {
        let tmp = tempfile::tempdir().unwrap();
        let key = generate_keypair();
        let flow = b"data";

        let sidecar = sign(flow, &key, "nobody").unwrap();
        assert_eq!(
            verify(flow, &sidecar, tmp.path()),
            VerifyOutcome::UntrustedKey {
                key_id: "nobody".to_string()
            }
        );
    }

    #[test]
    fn test_verify_malformed_sidecar() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(matches!(
            verify(b"data", b"not json", tmp.path()),
            VerifyOutcome::Malformed(_)
        ));
        assert!(matches!(
            verify(
                b"data",
                br#"{"version":2,"algorithm":"ed25519","key_id":"a","signature":""}"#,
                tmp.path()
            ),
            VerifyOutcome::Malformed(_)
        ));
    }

    #[test]
    fn test_key_id_with_path_syntax_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let key = generate_keypair();
        assert!(sign(b"data", &key, "../escape").is_err());

        // Um sidecar forjado com key_id malicioso é Malformed, nunca
        // leitura fora do trust store.
        let forged = br#"{"version":1,"algorithm":"ed25519","key_id":"../../etc/x","signature":"AA=="}"#;
        assert!(matches!(
            verify(b"data", forged, tmp.path()),
            VerifyOutcome::Malformed(_)
        ));
    }

    #[test]
    fn test_private_key_roundtrip_and_permissions() {
        let tmp = tempfile::tempdir().unwrap();
        let key = generate_keypair();
        let path = tmp.path().join("id.pem");

        write_private_key(&path, &key).unwrap();
        let loaded = load_signing_key(&path).unwrap();
        assert_eq!(loaded.verifying_key(), key.verifying_key());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_require_signature_env_values() {
        let _guard = env_lock();

        for (value, expected) in [
            ("1", true),
            ("true", true),
            ("YES", true),
            ("on", true),
            ("0", false),
            ("false", false),
            ("no", false),
            ("OFF", false),
        ] {
            std::env::set_var("REQUIRE_FLOW_SIGNATURE", value);
            assert_eq!(require_signature_from_env().unwrap(), expected, "{value}");
        }

        std::env::set_var("REQUIRE_FLOW_SIGNATURE", "maybe");
        assert!(require_signature_from_env().is_err());

        std::env::remove_var("REQUIRE_FLOW_SIGNATURE");
        assert!(!require_signature_from_env().unwrap());
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let key = generate_keypair();
        let vk = key.verifying_key();
        assert_eq!(fingerprint(&vk), fingerprint(&vk));
        assert_eq!(fingerprint(&vk).len(), 8 * 2 + 7); // 8 bytes hex + separadores
    }
}
