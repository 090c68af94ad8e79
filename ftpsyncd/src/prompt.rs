use std::io::{BufRead, Write};

use async_trait::async_trait;

/// Host UI used by commands that need a decision from the user.
#[async_trait]
pub trait Prompter: Send + Sync {
    /// Presents rows of text (the first line of a row is its label) and
    /// returns the chosen row index, or `None` when the user dismissed it.
    async fn choose(&self, rows: &[Vec<String>]) -> Option<usize>;

    /// Asks for a single line of text; `None` means cancelled.
    async fn ask_text(&self, caption: &str, default: &str) -> Option<String>;

    /// Transient status line.
    fn status(&self, message: &str);
}

/// Prompter backed by the controlling terminal.
#[derive(Debug, Default, Clone)]
pub struct TerminalPrompter;

impl TerminalPrompter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Prompter for TerminalPrompter {
    async fn choose(&self, rows: &[Vec<String>]) -> Option<usize> {
        let mut text = String::new();
        for (index, row) in rows.iter().enumerate() {
            let mut lines = row.iter().filter(|line| !line.is_empty());
            if let Some(label) = lines.next() {
                text.push_str(&format!("  [{index}] {label}\n"));
            }
            for line in lines {
                text.push_str(&format!("      {line}\n"));
            }
        }
        text.push_str("choice> ");

        let answer = read_answer(text).await?;
        let index = answer.trim().parse::<usize>().ok()?;
        (index < rows.len()).then_some(index)
    }

    async fn ask_text(&self, caption: &str, default: &str) -> Option<String> {
        let answer = read_answer(format!("{caption} [{default}]: ")).await?;
        let answer = answer.trim_end_matches(['\r', '\n']);
        if answer.is_empty() {
            Some(default.to_string())
        } else {
            Some(answer.to_string())
        }
    }

    fn status(&self, message: &str) {
        eprintln!("{message}");
    }
}

async fn read_answer(question: String) -> Option<String> {
    tokio::task::spawn_blocking(move || {
        let mut stderr = std::io::stderr();
        let _ = write!(stderr, "{question}");
        let _ = stderr.flush();
        let mut line = String::new();
        match std::io::stdin().lock().read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line),
        }
    })
    .await
    .ok()
    .flatten()
}
