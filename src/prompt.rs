use std::io::{self, BufRead, Write};

use anyhow::{Context, anyhow};

/// Free-text operator input. Only a case-insensitive `n` has abort semantics;
/// any other answer, including an empty one, means continue.
pub trait OperatorPrompt: Send + Sync {
    fn ask(&self, message: &str) -> anyhow::Result<String>;

    /// `false` when the operator answered `n`.
    fn confirm(&self, message: &str) -> anyhow::Result<bool> {
        let answer = self.ask(message)?;
        Ok(!is_cancel(&answer))
    }

    /// Show a notice that needs no answer.
    fn notify(&self, message: &str) {
        println!("{message}");
    }
}

pub fn is_cancel(answer: &str) -> bool {
    answer.trim().eq_ignore_ascii_case("n")
}

pub fn is_yes(answer: &str) -> bool {
    answer.trim().eq_ignore_ascii_case("y")
}

/// Reads answers from stdin.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConsolePrompt;

impl OperatorPrompt for ConsolePrompt {
    fn ask(&self, message: &str) -> anyhow::Result<String> {
        print!("{message} ");
        io::stdout().flush().context("flush stdout")?;
        let mut input = String::new();
        let read = io::stdin()
            .lock()
            .read_line(&mut input)
            .context("read operator input")?;
        if read == 0 {
            return Err(anyhow!("stdin closed"));
        }
        Ok(input.trim_end_matches(['\r', '\n']).to_string())
    }
}
