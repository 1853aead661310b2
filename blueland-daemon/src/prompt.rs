/*!
 * Prompt Gateway
 * Runs the external renderer (zenity by default) for one question
 */

use std::future::Future;
use std::process::{ExitStatus, Stdio};
use tokio::process::Command;
use tokio::sync::oneshot;

use crate::config::PromptConfig;

/// Resolves (or errors, when the sender is dropped) once the prompt should be torn down.
pub type CancelSignal = oneshot::Receiver<()>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    YesNo,
    TextEntry,
    Info,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub kind: PromptKind,
    pub message: String,
    pub payload: Option<String>,
}

impl Prompt {
    pub fn new(kind: PromptKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn text(&self) -> String {
        match &self.payload {
            Some(payload) => format!("{}\n\n{}", self.message, payload),
            None => self.message.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Answer {
    Text(String),
    Confirmed(bool),
    Cancelled,
    Failed(String),
}

pub trait Prompter: Send + Sync + 'static {
    fn ask(&self, prompt: Prompt, cancel: CancelSignal) -> impl Future<Output = Answer> + Send;
}

pub struct ZenityPrompter {
    program: String,
    title: String,
}

impl ZenityPrompter {
    pub fn new(config: &PromptConfig) -> Self {
        Self {
            program: config.program.clone(),
            title: config.title.clone(),
        }
    }

    fn args(&self, prompt: &Prompt) -> Vec<String> {
        let mode = match prompt.kind {
            PromptKind::YesNo => "--question",
            PromptKind::TextEntry => "--entry",
            PromptKind::Info => "--info",
        };
        vec![
            mode.to_string(),
            "--title".to_string(),
            self.title.clone(),
            "--text".to_string(),
            prompt.text(),
        ]
    }
}

impl Prompter for ZenityPrompter {
    async fn ask(&self, prompt: Prompt, cancel: CancelSignal) -> Answer {
        let mut command = Command::new(&self.program);
        command
            .args(self.args(&prompt))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!("Failed to start prompt renderer {}: {}", self.program, e);
                return Answer::Failed(e.to_string());
            }
        };

        // Dropping the wait future drops the child, which kills the renderer.
        tokio::select! {
            output = child.wait_with_output() => match output {
                Ok(output) => interpret(prompt.kind, output.status, &output.stdout),
                Err(e) => Answer::Failed(e.to_string()),
            },
            _ = cancel => {
                tracing::debug!("Prompt cancelled: {}", prompt.message);
                Answer::Cancelled
            }
        }
    }
}

/// zenity exits 0 on OK/Yes, 1 on Cancel/No or window close, anything else is an error.
fn interpret(kind: PromptKind, status: ExitStatus, stdout: &[u8]) -> Answer {
    match (kind, status.code()) {
        (PromptKind::YesNo, Some(0)) => Answer::Confirmed(true),
        (PromptKind::YesNo, Some(1)) => Answer::Confirmed(false),
        (PromptKind::TextEntry, Some(0)) => {
            let text = String::from_utf8_lossy(stdout);
            Answer::Text(text.trim_end_matches(['\n', '\r']).to_string())
        }
        (PromptKind::Info, Some(0)) => Answer::Confirmed(true),
        (PromptKind::TextEntry | PromptKind::Info, Some(1)) => Answer::Cancelled,
        (_, Some(code)) => Answer::Failed(format!("renderer exited with status {code}")),
        (_, None) => Answer::Failed("renderer terminated by signal".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;

    fn exit(code: i32) -> ExitStatus {
        ExitStatus::from_raw(code << 8)
    }

    fn prompter(program: &str) -> ZenityPrompter {
        ZenityPrompter {
            program: program.to_string(),
            title: "Blueland".to_string(),
        }
    }

    #[test]
    fn yes_no_exit_codes() {
        assert_eq!(interpret(PromptKind::YesNo, exit(0), b""), Answer::Confirmed(true));
        assert_eq!(interpret(PromptKind::YesNo, exit(1), b""), Answer::Confirmed(false));
        assert!(matches!(interpret(PromptKind::YesNo, exit(5), b""), Answer::Failed(_)));
    }

    #[test]
    fn text_entry_strips_newline() {
        assert_eq!(
            interpret(PromptKind::TextEntry, exit(0), b"0000\n"),
            Answer::Text("0000".to_string())
        );
        assert_eq!(interpret(PromptKind::TextEntry, exit(1), b""), Answer::Cancelled);
    }

    #[test]
    fn killed_renderer_is_a_failure() {
        // raw wait status 9 = terminated by SIGKILL
        let status = ExitStatus::from_raw(9);
        assert!(matches!(interpret(PromptKind::YesNo, status, b""), Answer::Failed(_)));
    }

    #[test]
    fn payload_is_appended_to_text() {
        let prompt = Prompt::new(PromptKind::YesNo, "Confirm passkey").with_payload("123456");
        assert_eq!(prompt.text(), "Confirm passkey\n\n123456");
        let args = prompter("zenity").args(&prompt);
        assert_eq!(args[0], "--question");
        assert_eq!(args.last().unwrap(), "Confirm passkey\n\n123456");
    }

    #[tokio::test]
    async fn runs_the_renderer_process() {
        let (_keep, cancel) = oneshot::channel();
        let answer = prompter("true").ask(Prompt::new(PromptKind::YesNo, "ok?"), cancel).await;
        assert_eq!(answer, Answer::Confirmed(true));

        let (_keep, cancel) = oneshot::channel();
        let answer = prompter("false").ask(Prompt::new(PromptKind::YesNo, "ok?"), cancel).await;
        assert_eq!(answer, Answer::Confirmed(false));
    }

    #[tokio::test]
    async fn missing_renderer_fails() {
        let (_keep, cancel) = oneshot::channel();
        let answer = prompter("/nonexistent/blueland-renderer")
            .ask(Prompt::new(PromptKind::YesNo, "ok?"), cancel)
            .await;
        assert!(matches!(answer, Answer::Failed(_)));
    }
}
