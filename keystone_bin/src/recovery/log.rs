//! Textual log records.
//!
//! One record per line, tokens comma-separated inside angle brackets,
//! transaction ids in canonical UUID form. A keyword inside the brackets
//! (`create`, `start`, `commit`, `checkpoint`) distinguishes the record
//! kinds; everything else parses as an edit.

use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

use crate::errors::DbError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let token = match self {
            Action::Insert => "INSERT",
            Action::Update => "UPDATE",
            Action::Delete => "DELETE",
        };
        write!(f, "{token}")
    }
}

impl FromStr for Action {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INSERT" => Ok(Action::Insert),
            "UPDATE" => Ok(Action::Update),
            "DELETE" => Ok(Action::Delete),
            _ => Err(DbError::LogParse(format!("unknown action {s:?}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    Table {
        kind: String,
        name: String,
    },
    Start {
        id: Uuid,
    },
    Edit {
        id: Uuid,
        table: String,
        action: Action,
        key: i64,
        oldval: i64,
        newval: i64,
    },
    Commit {
        id: Uuid,
    },
    Checkpoint {
        ids: Vec<Uuid>,
    },
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogRecord::Table { kind, name } => write!(f, "< create {kind} table {name} >"),
            LogRecord::Start { id } => write!(f, "< {id} start >"),
            LogRecord::Edit {
                id,
                table,
                action,
                key,
                oldval,
                newval,
            } => write!(f, "< {id}, {table}, {action}, {key}, {oldval}, {newval} >"),
            LogRecord::Commit { id } => write!(f, "< {id} commit >"),
            LogRecord::Checkpoint { ids } => {
                if ids.is_empty() {
                    return write!(f, "< checkpoint >");
                }
                let joined = ids
                    .iter()
                    .map(Uuid::to_string)
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(f, "< {joined} checkpoint >")
            }
        }
    }
}

fn parse_uuid(s: &str) -> Result<Uuid, DbError> {
    Uuid::parse_str(s.trim()).map_err(|_| DbError::LogParse(format!("bad transaction id {s:?}")))
}

fn parse_i64(s: &str) -> Result<i64, DbError> {
    s.trim()
        .parse()
        .map_err(|_| DbError::LogParse(format!("bad integer {s:?}")))
}

impl FromStr for LogRecord {
    type Err = DbError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let inner = line
            .strip_prefix('<')
            .and_then(|rest| rest.strip_suffix('>'))
            .ok_or_else(|| DbError::LogParse(format!("not a log record: {line:?}")))?
            .trim();

        if let Some(rest) = inner.strip_prefix("create ") {
            let fields: Vec<&str> = rest.split_whitespace().collect();
            return match fields.as_slice() {
                [kind, "table", name] => Ok(LogRecord::Table {
                    kind: (*kind).to_owned(),
                    name: (*name).to_owned(),
                }),
                _ => Err(DbError::LogParse(format!("bad table record: {line:?}"))),
            };
        }
        if let Some(rest) = inner.strip_suffix(" start") {
            return Ok(LogRecord::Start {
                id: parse_uuid(rest)?,
            });
        }
        if let Some(rest) = inner.strip_suffix(" commit") {
            return Ok(LogRecord::Commit {
                id: parse_uuid(rest)?,
            });
        }
        if inner == "checkpoint" {
            return Ok(LogRecord::Checkpoint { ids: Vec::new() });
        }
        if let Some(rest) = inner.strip_suffix(" checkpoint") {
            let ids = rest
                .split(',')
                .map(parse_uuid)
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(LogRecord::Checkpoint { ids });
        }

        let fields: Vec<&str> = inner.split(',').collect();
        if fields.len() != 6 {
            return Err(DbError::LogParse(format!("bad edit record: {line:?}")));
        }
        Ok(LogRecord::Edit {
            id: parse_uuid(fields[0])?,
            table: fields[1].trim().to_owned(),
            action: fields[2].trim().parse()?,
            key: parse_i64(fields[3])?,
            oldval: parse_i64(fields[4])?,
            newval: parse_i64(fields[5])?,
        })
    }
}
