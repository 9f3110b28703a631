// Module: UI contract
// The orchestrator talks to the front-end only through this trait. The
// interactive TUI lives outside this crate; here we keep the contract
// and the headless implementation used by `council run`.

use std::io::{self, Write};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::protocol::CheckpointDecision;

/// Contract the UI collaborator must satisfy.
///
/// `on_stream` and `on_step_final` must not block: they are invoked
/// from the executor's read loop, possibly from another thread, and a
/// slow UI would stall the child's stdout pipe. `ask_checkpoint` is the
/// only call allowed to block (it waits for a human).
#[async_trait]
pub trait CouncilUi: Send + Sync {
    /// A chunk of live output from the step bound to `step_key`.
    fn on_stream(&self, step_key: &str, chunk: &str);

    /// Final content of a step, ready for panel rendering.
    fn on_step_final(&self, step_key: &str, content: &str, style: &str, is_code: bool);

    /// Human decision after a step: continue, adjust or abort.
    async fn ask_checkpoint(&self, step_key: &str) -> CheckpointDecision;
}

/// Headless UI for non-interactive runs: streams to stdout and always
/// continues at checkpoints.
///
/// With `stream` on, chunks go out live and the final panel is skipped
/// (the user already saw everything); with it off, only the final
/// panel per step is printed.
pub struct HeadlessUi {
    stream: bool,
    out: Mutex<Box<dyn Write + Send>>,
}

impl HeadlessUi {
    pub fn new(stream: bool) -> Self {
        Self::with_writer(stream, Box::new(io::stdout()))
    }

    fn with_writer(stream: bool, out: Box<dyn Write + Send>) -> Self {
        Self {
            stream,
            out: Mutex::new(out),
        }
    }

    fn write(&self, text: &str) {
        let mut out = match self.out.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let _ = out.write_all(text.as_bytes());
        let _ = out.flush();
    }
}

#[async_trait]
impl CouncilUi for HeadlessUi {
    fn on_stream(&self, _step_key: &str, chunk: &str) {
        if self.stream {
            self.write(chunk);
        }
    }

    fn on_step_final(&self, step_key: &str, content: &str, _style: &str, is_code: bool) {
        if !self.stream {
            let tag = if is_code { " [code]" } else { "" };
            self.write(&format!("--- {step_key}{tag} ---\n{content}\n"));
        }
    }

    async fn ask_checkpoint(&self, _step_key: &str) -> CheckpointDecision {
        CheckpointDecision::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    // Writer que guarda tudo num buffer compartilhado inspecionável.
    #[derive(Clone, Default)]
    struct CaptureBuf(Arc<Mutex<Vec<u8>>>);

    impl CaptureBuf {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    impl Write for CaptureBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn captured(stream: bool) -> (CaptureBuf, HeadlessUi) {
        let buf = CaptureBuf::default();
        let ui = HeadlessUi::with_writer(stream, Box::new(buf.clone()));
        (buf, ui)
    }

    #[test]
    fn test_streaming_mode_prints_chunks_live() {
        let (buf, ui) = captured(true);

        ui.on_stream("plan", "linha1\n");
        ui.on_stream("plan", "linha2\n");

        assert_eq!(buf.contents(), "linha1\nlinha2\n");
    }

    #[test]
    fn test_streaming_mode_skips_final_panel() {
        let (buf, ui) = captured(true);

        ui.on_step_final("plan", "conteúdo", "text", false);

        assert_eq!(buf.contents(), "");
    }

    #[test]
    fn test_silent_mode_suppresses_chunks() {
        let (buf, ui) = captured(false);

        ui.on_stream("plan", "nunca aparece\n");

        assert_eq!(buf.contents(), "");
    }

    #[test]
    fn test_silent_mode_prints_final_panel() {
        let (buf, ui) = captured(false);

        ui.on_step_final("plan", "resultado", "text", false);

        let out = buf.contents();
        assert_eq!(out, "--- plan ---\nresultado\n");
    }

    #[test]
    fn test_final_panel_tags_code_steps() {
        let (buf, ui) = captured(false);

        ui.on_step_final("gen", "print(1)", "code", true);

        assert!(buf.contents().starts_with("--- gen [code] ---\n"));
    }

    #[tokio::test]
    async fn test_checkpoint_always_continues() {
        let (_, ui) = captured(true);
        assert_eq!(ui.ask_checkpoint("plan").await, CheckpointDecision::Continue);

        let (_, ui) = captured(false);
        assert_eq!(ui.ask_checkpoint("plan").await, CheckpointDecision::Continue);
    }
}
