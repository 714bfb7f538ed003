//! Tab-separated fact files.
//!
//! One fact per line: `Predicate<TAB>arg1<TAB>...<TAB>argN[<TAB>value]`.
//! Blank lines and lines starting with `#` are skipped. A missing value
//! defaults to 1.0 for observations and 0.0 for targets.

use std::path::Path;

use crate::database::{Database, Partition};
use crate::error::{DatabaseError, HlmrfResult};
use crate::model::Model;

/// File names [`load_directory`] looks for.
pub const OBSERVATIONS_FILE: &str = "observations.tsv";
pub const TARGETS_FILE: &str = "targets.tsv";

/// Parse fact lines from `text` into `partition`. Returns the number of facts.
pub fn load_str(
    database: &Database,
    model: &Model,
    text: &str,
    partition: Partition,
    origin: &str,
) -> HlmrfResult<usize> {
    let default_value = if partition.is_observed() { 1.0 } else { 0.0 };
    let mut count = 0;
    for (number, line) in text.lines().enumerate() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() || line.trim_start().starts_with('#') {
            continue;
        }
        let malformed = |message: String| DatabaseError::Malformed {
            path: origin.to_string(),
            line: number + 1,
            message,
        };
        let fields: Vec<&str> = line.split('\t').map(str::trim).collect();
        let predicate = model.lookup(fields[0])?;
        let arity = model.predicate(predicate).arity;
        let rest = &fields[1..];
        let value = match rest.len() {
            n if n == arity => default_value,
            n if n == arity + 1 => rest[arity]
                .parse::<f32>()
                .map_err(|e| malformed(format!("bad truth value \"{}\": {e}", rest[arity])))?,
            n => {
                return Err(malformed(format!(
                    "{} takes {arity} arguments, line has {n} fields",
                    fields[0]
                ))
                .into());
            }
        };
        let atom = model.atom(fields[0], &rest[..arity])?;
        database.insert(partition, atom, value)?;
        count += 1;
    }
    Ok(count)
}

/// Load one fact file into `partition`.
pub fn load_file(
    database: &Database,
    model: &Model,
    path: &Path,
    partition: Partition,
) -> HlmrfResult<usize> {
    let text = std::fs::read_to_string(path).map_err(|e| DatabaseError::Read {
        path: path.display().to_string(),
        source: e,
    })?;
    let count = load_str(database, model, &text, partition, &path.display().to_string())?;
    tracing::info!(path = %path.display(), facts = count, %partition, "loaded facts");
    Ok(count)
}

/// Load `observations.tsv` into READ and `targets.tsv` into WRITE, where present.
pub fn load_directory(database: &Database, model: &Model, dir: &Path) -> HlmrfResult<usize> {
    let mut total = 0;
    for (name, partition) in [
        (OBSERVATIONS_FILE, Partition::Read),
        (TARGETS_FILE, Partition::Write),
    ] {
        let path = dir.join(name);
        if path.exists() {
            total += load_file(database, model, &path, partition)?;
        }
    }
    Ok(total)
}
