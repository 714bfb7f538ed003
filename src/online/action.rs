//! Online command protocol.
//!
//! One command per line, fields separated by tabs, verbs case-insensitive:
//!
//! ```text
//! ADD      <partition> <predicate> <args..> [value]
//! DELETE   <partition> <predicate> <args..>
//! UPDATE   <predicate> <args..> <value>
//! OBSERVE  <predicate> <args..> <value>
//! QUERY    <predicate> <args..>
//! WRITE    [path]
//! SYNC | STOP | EXIT
//! ```

use std::path::PathBuf;

use crate::database::Partition;
use crate::error::{HlmrfResult, OnlineError};
use crate::model::{GroundAtom, Model};

#[derive(Debug, Clone, PartialEq)]
pub enum OnlineAction {
    Add {
        partition: Partition,
        atom: GroundAtom,
        value: f32,
    },
    Delete {
        partition: Partition,
        atom: GroundAtom,
    },
    Update {
        atom: GroundAtom,
        value: f32,
    },
    Observe {
        atom: GroundAtom,
        value: f32,
    },
    Query {
        atom: GroundAtom,
    },
    /// Dump target atoms, to a file when a path is given.
    Write {
        path: Option<PathBuf>,
    },
    /// Re-run inference if anything changed.
    Sync,
    /// Shut the server down.
    Stop,
    /// End this session.
    Exit,
}

impl OnlineAction {
    /// Parse one protocol line against `model`.
    pub fn parse(line: &str, model: &Model) -> HlmrfResult<Self> {
        let fields: Vec<&str> = line
            .trim_end_matches(['\r', '\n'])
            .split('\t')
            .map(str::trim)
            .collect();
        let verb = fields[0].to_ascii_uppercase();
        let rest = &fields[1..];
        let malformed = |message: String| -> crate::error::HlmrfError {
            OnlineError::Malformed {
                command: verb.clone(),
                message,
            }
            .into()
        };

        match verb.as_str() {
            "ADD" => {
                let (partition, rest) = split_partition(rest).map_err(&malformed)?;
                let (atom, value) = parse_atom(model, rest, Arity::Optional).map_err(&malformed)?;
                let default = if partition.is_observed() { 1.0 } else { 0.0 };
                Ok(OnlineAction::Add {
                    partition,
                    atom,
                    value: value.unwrap_or(default),
                })
            }
            "DELETE" => {
                let (partition, rest) = split_partition(rest).map_err(&malformed)?;
                let (atom, _) = parse_atom(model, rest, Arity::Absent).map_err(&malformed)?;
                Ok(OnlineAction::Delete { partition, atom })
            }
            "UPDATE" | "OBSERVE" => {
                let (atom, value) = parse_atom(model, rest, Arity::Required).map_err(&malformed)?;
                let value = value.ok_or_else(|| malformed("a value is required".to_string()))?;
                if verb == "UPDATE" {
                    Ok(OnlineAction::Update { atom, value })
                } else {
                    Ok(OnlineAction::Observe { atom, value })
                }
            }
            "QUERY" => {
                let (atom, _) = parse_atom(model, rest, Arity::Absent).map_err(&malformed)?;
                Ok(OnlineAction::Query { atom })
            }
            "WRITE" => match rest {
                [] | [""] => Ok(OnlineAction::Write { path: None }),
                [path] => Ok(OnlineAction::Write {
                    path: Some(PathBuf::from(path)),
                }),
                _ => Err(malformed("WRITE takes at most one path".to_string())),
            },
            "SYNC" | "STOP" | "EXIT" => {
                if rest.iter().any(|f| !f.is_empty()) {
                    return Err(malformed(format!("{verb} takes no arguments")));
                }
                Ok(match verb.as_str() {
                    "SYNC" => OnlineAction::Sync,
                    "STOP" => OnlineAction::Stop,
                    _ => OnlineAction::Exit,
                })
            }
            _ => Err(OnlineError::UnknownCommand {
                command: fields[0].to_string(),
            }
            .into()),
        }
    }
}

/// Whether a trailing value field is expected.
#[derive(Clone, Copy, PartialEq)]
enum Arity {
    Absent,
    Optional,
    Required,
}

fn split_partition<'a>(fields: &'a [&'a str]) -> Result<(Partition, &'a [&'a str]), String> {
    let Some((first, rest)) = fields.split_first() else {
        return Err("missing partition".to_string());
    };
    let partition: Partition = first.parse()?;
    if partition.is_special() {
        return Err(format!("partition {partition} is internal"));
    }
    Ok((partition, rest))
}

fn parse_atom(model: &Model, fields: &[&str], arity: Arity) -> Result<(GroundAtom, Option<f32>), String> {
    let Some((name, rest)) = fields.split_first() else {
        return Err("missing predicate".to_string());
    };
    let predicate = model.lookup(name).map_err(|e| e.to_string())?;
    let expected = model.predicate(predicate).arity;
    let value = match (rest.len() - expected.min(rest.len()), arity) {
        _ if rest.len() < expected => {
            return Err(format!("{name} takes {expected} arguments, got {}", rest.len()));
        }
        (0, Arity::Absent | Arity::Optional) => None,
        (0, Arity::Required) => return Err("a value is required".to_string()),
        (1, Arity::Optional | Arity::Required) => Some(parse_value(rest[expected])?),
        _ => {
            return Err(format!("{name} takes {expected} arguments, got {}", rest.len()));
        }
    };
    let atom = model.atom(name, &rest[..expected]).map_err(|e| e.to_string())?;
    Ok((atom, value))
}

fn parse_value(field: &str) -> Result<f32, String> {
    let value: f32 = field
        .parse()
        .map_err(|e| format!("bad truth value \"{field}\": {e}"))?;
    if !(0.0..=1.0).contains(&value) {
        return Err(format!("truth value {value} is outside [0, 1]"));
    }
    Ok(value)
}
