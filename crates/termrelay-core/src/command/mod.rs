//! Keystroke command reconstruction for the session audit trail.
//!
//! The relay sees raw, uncooked terminal input. [`CommandBuffer`] replays
//! that input against a minimal line editor to approximate the command lines
//! the user ran. It is best-effort: the remote shell's own line editing is not
//! visible here, so completion and history recall are inferred from the next
//! chunk of echoed output.

mod cleanup;
mod keys;

pub use cleanup::scrub_editor_noise;
pub use keys::{tokenize, Key};

use once_cell::sync::Lazy;
use regex::Regex;

/// ANSI escape sequences, C1 controls and backspaces echoed by the shell.
static ECHO_NOISE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:\x1B[@-_]|[\x{80}-\x{9F}])[0-?]*[ -/]*[@-~]|\x08")
        .expect("echo noise pattern is valid")
});

/// Which interpretation applies to the next chunk of remote output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconstructorState {
    Normal,
    AwaitingCompletion,
    AwaitingHistory,
}

#[derive(Debug, Default)]
pub struct CommandBuffer {
    committed: Vec<String>,
    line: Vec<char>,
    cursor: usize,
    awaiting_completion: bool,
    awaiting_history: bool,
}

impl CommandBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one chunk of client keystrokes.
    pub fn feed_input(&mut self, input: &str) {
        for key in tokenize(input) {
            self.apply(key);
        }
    }

    fn apply(&mut self, key: Key) {
        match key {
            Key::Enter => {
                let line: String = self.line.iter().collect();
                if !line.trim().is_empty() {
                    self.committed.push(line);
                }
                self.line.clear();
                self.cursor = 0;
            }
            Key::Bell | Key::Escape(_) => {}
            Key::Interrupt | Key::Home => self.cursor = 0,
            Key::End => self.cursor = self.line.len().saturating_sub(2),
            Key::Left => {
                self.cursor = match self.cursor {
                    0 => self.line.len().saturating_sub(2),
                    n => n - 1,
                }
            }
            // Unbounded; clamped wherever the cursor is used.
            Key::Right => self.cursor += 1,
            Key::Backspace => {
                if self.cursor == 0 {
                    self.line.pop();
                } else if self.cursor < self.line.len() {
                    self.line.remove(self.cursor);
                }
            }
            Key::Complete => self.awaiting_completion = true,
            Key::Up | Key::Down => self.awaiting_history = true,
            Key::Text(text) => {
                if self.cursor == 0 {
                    self.line.extend(text.chars());
                } else {
                    let at = self.cursor.min(self.line.len());
                    let inserted: Vec<char> = text.chars().collect();
                    self.cursor = at + inserted.len();
                    self.line.splice(at..at, inserted);
                }
            }
        }
    }

    /// Observe one chunk of decoded remote output.
    ///
    /// Only has an effect while a completion or history recall is pending.
    pub fn observe_output(&mut self, output: &str) {
        if self.awaiting_completion {
            let parts: Vec<&str> = output.split(' ').collect();
            let completed = match parts.as_slice() {
                [word, ""] if !word.is_empty() => Some(*word),
                [word] if *word != "\x07" => Some(*word),
                _ => None,
            };
            if let Some(word) = completed {
                self.line.extend(word.chars().filter(|&c| c != '\x07'));
            }
            self.awaiting_completion = false;
        }

        if self.awaiting_history && !output.trim().is_empty() {
            self.line = ECHO_NOISE.replace_all(output, "").chars().collect();
            self.cursor = 0;
            self.awaiting_history = false;
        }
    }

    pub fn state(&self) -> ReconstructorState {
        if self.awaiting_completion {
            ReconstructorState::AwaitingCompletion
        } else if self.awaiting_history {
            ReconstructorState::AwaitingHistory
        } else {
            ReconstructorState::Normal
        }
    }

    /// The in-progress line.
    pub fn line(&self) -> String {
        self.line.iter().collect()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn committed(&self) -> &[String] {
        &self.committed
    }

    /// Consume the buffer, returning the committed commands with editor
    /// noise removed.
    pub fn finish(self) -> Vec<String> {
        scrub_editor_noise(self.committed)
    }
}
