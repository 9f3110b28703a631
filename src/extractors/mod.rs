//! # Módulo de Extração - Bloco de Código Cercado
//!
//! Steps com `is_code = true` prometem que a saída útil do agente é um
//! bloco de código Markdown. Este módulo captura o primeiro bloco
//! cercado da saída bruta.
//!
//! ## Para todos entenderem:
//!
//! LLMs adoram enfeitar a resposta ("Claro! Segue o código:") mesmo
//! quando pedimos só o código. O contrato `is_code` resolve isso:
//!
//! 1. **Recebe** a saída bruta do comando
//! 2. **Procura** o primeiro bloco ```...```
//! 3. **Captura** apenas o conteúdo interno (sem a linha da cerca)
//! 4. **Falha fechado** se não houver bloco nenhum
//!
//! O "falha fechado" é deliberado: saída sem bloco nunca chega ao
//! histórico nem aos steps seguintes (SafetyBlock, ver orquestrador).
//!
//! ## Exemplo:
//!
//! ```text
//! Entrada:  "preamble\n```python\nprint(1)\n```\ntrailer"
//! Extraído: "print(1)"
//! ```

use once_cell::sync::Lazy;
use regex::Regex;

// (?s): o `.` atravessa quebras de linha; `.*?` pega o MENOR bloco.
static FENCE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```[^\n]*\n(.*?)```").expect("valid fence regex"));

/// Captura o conteúdo do primeiro bloco de código cercado, sem as
/// cercas e com espaços das pontas removidos.
///
/// Retorna `None` quando a saída não contém bloco nenhum; quem decide o
/// destino do step (falhar fechado) é o orquestrador.
pub fn extract_code_block(output: &str) -> Option<String> {
    FENCE_RE
        .captures(output)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_first_fenced_block() {
        let output = "preamble\n```python\nprint(1)\n```\ntrailer";
        assert_eq!(extract_code_block(output).unwrap(), "print(1)");
    }

    #[test]
    fn test_no_fence_returns_none() {
        assert!(extract_code_block("hello world").is_none());
        assert!(extract_code_block("not code").is_none());
    }

    #[test]
    fn test_language_tag_is_not_captured() {
        let output = "```rust\nfn main() {}\n```";
        assert_eq!(extract_code_block(output).unwrap(), "fn main() {}");
    }

    #[test]
    fn test_bare_fence_without_language() {
        let output = "```\nlinha\n```";
        assert_eq!(extract_code_block(output).unwrap(), "linha");
    }

    #[test]
    fn test_first_of_multiple_blocks_wins() {
        let output = "```\nprimeiro\n```\nmeio\n```\nsegundo\n```";
        assert_eq!(extract_code_block(output).unwrap(), "primeiro");
    }

    #[test]
    fn test_multiline_content_preserved() {
        let output = "```python\nlinha1\nlinha2\n```";
        assert_eq!(extract_code_block(output).unwrap(), "linha1\nlinha2");
    }

    #[test]
    fn test_unclosed_fence_is_not_a_block() {
        assert!(extract_code_block("```python\nprint(1)").is_none());
    }
}
