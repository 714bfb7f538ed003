//! An online inference session: apply protocol actions to a live term
//! store and re-run the reasoner when answers are requested.

use std::io::{BufRead, Write};
use std::path::Path;

use crate::database::Partition;
use crate::error::{HlmrfError, HlmrfResult, StoreError};
use crate::model::GroundAtom;
use crate::online::action::OnlineAction;
use crate::reasoner::{OptimizationReport, Reasoner};
use crate::term::TermStore;
use crate::term::online::{AtomChange, OnlineTermStore};

/// Reply to one action.
#[derive(Debug, Clone, PartialEq)]
pub enum OnlineResponse {
    Ack(String),
    Value { atom: String, value: Option<f32> },
    Targets(Vec<(String, f32)>),
    Stopped,
    Exited,
}

impl std::fmt::Display for OnlineResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OnlineResponse::Ack(message) => write!(f, "OK\t{message}"),
            OnlineResponse::Value {
                atom,
                value: Some(value),
            } => write!(f, "{atom}\t{value:.6}"),
            OnlineResponse::Value { atom, value: None } => write!(f, "{atom}\tunknown"),
            OnlineResponse::Targets(rows) => {
                for (i, (atom, value)) in rows.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{atom}\t{value:.6}")?;
                }
                Ok(())
            }
            OnlineResponse::Stopped => f.write_str("OK\tstopping"),
            OnlineResponse::Exited => f.write_str("OK\tbye"),
        }
    }
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Stopped,
    Exited,
    EndOfInput,
}

pub struct OnlineInference {
    store: OnlineTermStore,
    reasoner: Box<dyn Reasoner>,
    /// Something changed since the last optimization.
    dirty: bool,
    last_report: Option<OptimizationReport>,
}

impl OnlineInference {
    pub fn new(store: OnlineTermStore, reasoner: Box<dyn Reasoner>) -> Self {
        Self {
            store,
            reasoner,
            dirty: true,
            last_report: None,
        }
    }

    pub fn store(&self) -> &OnlineTermStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut OnlineTermStore {
        self.dirty = true;
        &mut self.store
    }

    pub fn last_report(&self) -> Option<&OptimizationReport> {
        self.last_report.as_ref()
    }

    /// Optimize if anything changed since the last run.
    pub fn infer(&mut self) -> HlmrfResult<Option<&OptimizationReport>> {
        if !self.dirty && self.store.is_current() {
            return Ok(None);
        }
        let report = self.reasoner.optimize(&mut self.store)?;
        tracing::info!(reasoner = self.reasoner.name(), %report, "online inference");
        self.dirty = false;
        self.last_report = Some(report);
        Ok(self.last_report.as_ref())
    }

    pub fn apply(&mut self, action: OnlineAction) -> HlmrfResult<OnlineResponse> {
        tracing::debug!(?action, "online action");
        match action {
            OnlineAction::Add {
                partition,
                atom,
                value,
            } => {
                let name = self.store.model().format_atom(&atom);
                let change = self.store.add_atom(partition, atom, value)?;
                self.dirty = true;
                Ok(OnlineResponse::Ack(format!("{} {name}", describe(change))))
            }
            OnlineAction::Delete { partition, atom } => {
                let name = self.store.model().format_atom(&atom);
                let in_partition = self
                    .store
                    .database()
                    .get(&atom)
                    .is_some_and(|fact| fact.partition.merged() == partition.merged());
                let change = if in_partition {
                    self.store.delete_atom(&atom)?
                } else {
                    AtomChange::Missing
                };
                self.dirty |= change != AtomChange::Missing;
                Ok(OnlineResponse::Ack(format!("{} {name}", describe(change))))
            }
            OnlineAction::Update { atom, value } => {
                let name = self.store.model().format_atom(&atom);
                let change = self.store.update_atom(&atom, value)?;
                self.dirty |= change != AtomChange::Missing;
                Ok(OnlineResponse::Ack(format!("{} {name}", describe(change))))
            }
            OnlineAction::Observe { atom, value } => {
                let name = self.store.model().format_atom(&atom);
                let change = self.store.observe_atom(&atom, value)?;
                self.dirty = true;
                Ok(OnlineResponse::Ack(format!("{} {name}", describe(change))))
            }
            OnlineAction::Query { atom } => {
                self.infer()?;
                Ok(OnlineResponse::Value {
                    atom: self.store.model().format_atom(&atom),
                    value: self.store.value(&atom),
                })
            }
            OnlineAction::Write { path } => {
                self.infer()?;
                let rows = self.targets();
                match path {
                    Some(path) => {
                        write_targets(&path, &rows)?;
                        Ok(OnlineResponse::Ack(format!(
                            "wrote {} atoms to {}",
                            rows.len(),
                            path.display()
                        )))
                    }
                    None => Ok(OnlineResponse::Targets(rows)),
                }
            }
            OnlineAction::Sync => {
                let message = match self.infer()? {
                    Some(report) => report.to_string(),
                    None => "up to date".to_string(),
                };
                Ok(OnlineResponse::Ack(message))
            }
            OnlineAction::Stop => Ok(OnlineResponse::Stopped),
            OnlineAction::Exit => Ok(OnlineResponse::Exited),
        }
    }

    /// Target atoms with their current values, sorted by name.
    pub fn targets(&self) -> Vec<(String, f32)> {
        let database = self.store.database();
        let mut rows: Vec<(String, f32)> = database
            .atoms(Partition::Write)
            .into_iter()
            .chain(database.atoms(Partition::SpecialWrite))
            .map(|(atom, stored)| {
                let value = self.value_or(&atom, stored);
                (self.store.model().format_atom(&atom), value)
            })
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    }

    fn value_or(&self, atom: &GroundAtom, stored: f32) -> f32 {
        self.store.value(atom).unwrap_or(stored)
    }

    /// Read commands from `input` until STOP, EXIT or end of input, writing
    /// one reply per command. Bad commands get an `ERROR` reply and the
    /// session carries on.
    pub fn run_session<R: BufRead, W: Write>(&mut self, input: R, mut output: W) -> HlmrfResult<SessionEnd> {
        for line in input.lines() {
            let line = line.map_err(io_error)?;
            if line.trim().is_empty() || line.trim_start().starts_with('#') {
                continue;
            }
            let reply = OnlineAction::parse(&line, self.store.model()).and_then(|a| self.apply(a));
            match reply {
                Ok(response) => {
                    writeln!(output, "{response}").map_err(io_error)?;
                    output.flush().map_err(io_error)?;
                    match response {
                        OnlineResponse::Stopped => return Ok(SessionEnd::Stopped),
                        OnlineResponse::Exited => return Ok(SessionEnd::Exited),
                        _ => {}
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, command = %line, "online command failed");
                    writeln!(output, "ERROR\t{e}").map_err(io_error)?;
                }
            }
        }
        Ok(SessionEnd::EndOfInput)
    }

    /// Close the store's pages.
    pub fn close(mut self) -> HlmrfResult<()> {
        self.store.close()
    }
}

fn describe(change: AtomChange) -> &'static str {
    match change {
        AtomChange::Added => "added",
        AtomChange::Modified => "modified",
        AtomChange::Missing => "missing",
    }
}

fn io_error(source: std::io::Error) -> HlmrfError {
    StoreError::Io {
        path: "<session>".to_string(),
        source,
    }
    .into()
}

fn write_targets(path: &Path, rows: &[(String, f32)]) -> HlmrfResult<()> {
    let mut text = String::new();
    for (atom, value) in rows {
        text.push_str(&format!("{atom}\t{value:.6}\n"));
    }
    std::fs::write(path, text).map_err(|source| {
        StoreError::Io {
            path: path.display().to_string(),
            source,
        }
        .into()
    })
}

impl std::fmt::Debug for OnlineInference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnlineInference")
            .field("reasoner", &self.reasoner.name())
            .field("dirty", &self.dirty)
            .finish()
    }
}
