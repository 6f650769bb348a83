//! A line-oriented command dispatcher.
//!
//! Commands are registered as trigger words mapped to closures; the first
//! whitespace-separated field of each input line picks the handler, which
//! receives the whole cleaned line as its payload. `.help` lists every
//! registered command.

use std::collections::BTreeMap;
use std::io::{BufRead, Write};

use uuid::Uuid;

use crate::errors::Result;

/// Per-session state handed to every command handler.
pub struct ReplState<'a> {
    pub writer: &'a mut dyn Write,
    /// Identity of this session; autocommitted statements derive their
    /// transaction ids from fresh UUIDs, explicit transactions reuse one.
    pub client_id: Uuid,
    /// The explicit transaction currently open in this session, if any.
    pub txn: Option<Uuid>,
}

type Handler = Box<dyn Fn(&str, &mut ReplState) -> Result<()> + Send + Sync>;

#[derive(Default)]
pub struct Repl {
    commands: BTreeMap<String, Handler>,
    help: BTreeMap<String, String>,
}

impl Repl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a command with its help line. A duplicate trigger replaces
    /// the earlier registration.
    pub fn add_command<F>(&mut self, trigger: &str, help: &str, action: F)
    where
        F: Fn(&str, &mut ReplState) -> Result<()> + Send + Sync + 'static,
    {
        self.commands.insert(trigger.to_owned(), Box::new(action));
        self.help.insert(trigger.to_owned(), help.to_owned());
    }

    pub fn help_string(&self) -> String {
        let mut out = String::new();
        for (trigger, help) in &self.help {
            out.push_str(trigger);
            out.push_str(": ");
            out.push_str(help);
            out.push('\n');
        }
        out
    }

    /// Runs the loop until the reader is exhausted.
    pub fn run(
        &self,
        reader: &mut dyn BufRead,
        writer: &mut dyn Write,
        prompt: &str,
    ) -> std::io::Result<()> {
        let client_id = Uuid::new_v4();
        let mut txn = None;
        write!(writer, "{prompt}")?;
        writer.flush()?;

        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                break;
            }
            let payload = line.trim().to_lowercase();
            let Some(trigger) = payload.split_whitespace().next() else {
                write!(writer, "{prompt}")?;
                writer.flush()?;
                continue;
            };

            if trigger == ".help" {
                write!(writer, "{}", self.help_string())?;
            } else if let Some(command) = self.commands.get(trigger) {
                let mut state = ReplState {
                    writer: &mut *writer,
                    client_id,
                    txn,
                };
                if let Err(e) = command(&payload, &mut state) {
                    writeln!(state.writer, "{e}")?;
                }
                txn = state.txn;
            } else {
                writeln!(writer, "command not found")?;
            }
            write!(writer, "{prompt}")?;
            writer.flush()?;
        }
        writeln!(writer)?;
        Ok(())
    }
}
