//! Episode transcript: oracle replies and executed code, in order.
//!
//! Passed explicitly to every component that writes to it. The orchestrator
//! resets it at episode start and flushes it at episode end.

use crate::error::{io_error, Result};
use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;
use tracing::info;

pub type SharedTranscript = Rc<RefCell<Transcript>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    /// A unit's reply and the text it ran
    Executed { unit: String, reply: String, logged: String },
    /// A synthesized function
    Created { reply: String, query: String, source: String },
    /// Something the robot said
    Said(String),
    /// Free-form note (goal text, errors, scores)
    Note(String),
}

#[derive(Debug, Clone, Default)]
pub struct Transcript {
    entries: Vec<Entry>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedTranscript {
        Rc::new(RefCell::new(Self::new()))
    }

    pub fn record_executed(&mut self, unit: &str, reply: &str, logged: &str) {
        self.entries.push(Entry::Executed {
            unit: unit.to_string(),
            reply: reply.to_string(),
            logged: logged.to_string(),
        });
    }

    pub fn record_created(&mut self, reply: &str, query: &str, source: &str) {
        self.entries.push(Entry::Created {
            reply: reply.to_string(),
            query: query.to_string(),
            source: source.to_string(),
        });
    }

    pub fn say(&mut self, message: &str) {
        info!(target: "lmprog::robot", "robot says: {}", message);
        self.entries.push(Entry::Said(message.to_string()));
    }

    pub fn note(&mut self, text: impl Into<String>) {
        self.entries.push(Entry::Note(text.into()));
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn reset(&mut self) {
        self.entries.clear();
    }

    /// Human-readable rendering.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            match entry {
                Entry::Executed { unit, reply, logged } => {
                    out.push_str(&format!("LLM answer:\n{}\nLMP {} exec:\n\n{}\n", reply, unit, logged));
                }
                Entry::Created { reply, query, source } => {
                    out.push_str(&format!("LLM answer:\n{}\nLMP FGEN created:\n\n{}\n{}\n", reply, query, source));
                }
                Entry::Said(message) => {
                    out.push_str(&format!("robot says: {}\n", message));
                }
                Entry::Note(text) => {
                    out.push_str(text);
                    out.push('\n');
                }
            }
        }
        out
    }

    /// Write the rendering to `path`, creating parent directories.
    pub fn flush(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| io_error(parent, e).with_operation("transcript::flush"))?;
            }
        }
        std::fs::write(path, self.text()).map_err(|e| io_error(path, e).with_operation("transcript::flush"))
    }
}
