//! Interactive gate approval on the terminal.

use console::style;
use dialoguer::Confirm;
use stepwise_core::workflow::Approver;

/// Asks on stderr with a yes/no prompt, defaulting to "no".
///
/// A terminal that cannot prompt (closed stdin, not a TTY) denies.
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalApprover;

impl Approver for TerminalApprover {
    async fn approve(&self, step: &str, prompt: &str) -> bool {
        let question = format!(
            "{} {}\n  {}",
            style("gate").yellow().bold(),
            style(step).bold(),
            prompt
        );

        let answer = tokio::task::spawn_blocking(move || {
            Confirm::new()
                .with_prompt(question)
                .default(false)
                .interact()
        })
        .await;

        match answer {
            Ok(Ok(approved)) => approved,
            Ok(Err(e)) => {
                tracing::warn!(step, "gate prompt failed, denying: {e}");
                false
            }
            Err(e) => {
                tracing::warn!(step, "gate prompt task failed, denying: {e}");
                false
            }
        }
    }
}
