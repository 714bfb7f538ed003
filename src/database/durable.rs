//! ACID-durable fact persistence backed by redb.
//!
//! Facts are keyed by predicate name and arguments rather than by
//! [`crate::model::PredicateId`], so an archive can be reloaded into any model
//! that declares the same predicates.

use std::path::Path;
use std::sync::Arc;

use redb::{ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

use crate::database::{Database, Fact};
use crate::error::{DatabaseError, HlmrfResult};
use crate::model::{Constant, GroundAtom, Model};

/// Serialized fact key → serialized [`Fact`].
const FACTS_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("facts");

#[derive(Debug, Serialize, Deserialize)]
struct FactKey {
    predicate: String,
    args: Vec<Constant>,
}

/// A redb file holding a snapshot of a [`Database`].
pub struct FactArchive {
    db: Arc<redb::Database>,
}

impl FactArchive {
    /// Open or create an archive in the given directory.
    pub fn open(data_dir: &Path) -> HlmrfResult<Self> {
        std::fs::create_dir_all(data_dir).map_err(|e| DatabaseError::Read {
            path: data_dir.display().to_string(),
            source: e,
        })?;
        let db_path = data_dir.join("facts.redb");
        let db = redb::Database::create(&db_path).map_err(|e| DatabaseError::Redb {
            message: format!("failed to open redb at {}: {e}", db_path.display()),
        })?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Replace the archive contents with every fact in `database`.
    pub fn save(&self, database: &Database, model: &Model) -> HlmrfResult<usize> {
        let entries = database.entries();
        let txn = self.db.begin_write().map_err(|e| redb_err("begin_write", e))?;
        txn.delete_table(FACTS_TABLE)
            .map_err(|e| redb_err("delete_table", e))?;
        {
            let mut table = txn
                .open_table(FACTS_TABLE)
                .map_err(|e| redb_err("open_table", e))?;
            for (atom, fact) in &entries {
                let key = encode(&FactKey {
                    predicate: model.predicate(atom.predicate).name.clone(),
                    args: atom.args.clone(),
                })?;
                let value = encode(fact)?;
                table
                    .insert(key.as_slice(), value.as_slice())
                    .map_err(|e| redb_err("insert", e))?;
            }
        }
        txn.commit().map_err(|e| redb_err("commit", e))?;
        tracing::info!(facts = entries.len(), "saved fact archive");
        Ok(entries.len())
    }

    /// Persist new values for atoms in one transaction.
    pub fn commit(&self, model: &Model, atoms: &[(GroundAtom, Fact)]) -> HlmrfResult<()> {
        let txn = self.db.begin_write().map_err(|e| redb_err("begin_write", e))?;
        {
            let mut table = txn
                .open_table(FACTS_TABLE)
                .map_err(|e| redb_err("open_table", e))?;
            for (atom, fact) in atoms {
                let key = encode(&FactKey {
                    predicate: model.predicate(atom.predicate).name.clone(),
                    args: atom.args.clone(),
                })?;
                let value = encode(fact)?;
                table
                    .insert(key.as_slice(), value.as_slice())
                    .map_err(|e| redb_err("insert", e))?;
            }
        }
        txn.commit().map_err(|e| redb_err("commit", e))?;
        Ok(())
    }

    /// Load the archive into a fresh database for `model`.
    pub fn load(&self, model: &Model) -> HlmrfResult<Database> {
        let database = Database::new();
        let txn = self.db.begin_read().map_err(|e| redb_err("begin_read", e))?;
        let table = match txn.open_table(FACTS_TABLE) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(database),
            Err(e) => return Err(redb_err("open_table", e)),
        };
        for entry in table.iter().map_err(|e| redb_err("iter", e))? {
            let (key, value) = entry.map_err(|e| redb_err("iter", e))?;
            let key: FactKey = decode(key.value())?;
            let fact: Fact = decode(value.value())?;
            let predicate = model.lookup(&key.predicate)?;
            database.insert(fact.partition, GroundAtom::new(predicate, key.args), fact.value)?;
        }
        tracing::info!(facts = database.len(), "loaded fact archive");
        Ok(database)
    }
}

impl std::fmt::Debug for FactArchive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FactArchive").finish()
    }
}

fn redb_err(operation: &str, e: impl std::fmt::Display) -> crate::error::HlmrfError {
    DatabaseError::Redb {
        message: format!("{operation} failed: {e}"),
    }
    .into()
}

fn encode<T: Serialize>(value: &T) -> HlmrfResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| {
        DatabaseError::Serialization {
            message: e.to_string(),
        }
        .into()
    })
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> HlmrfResult<T> {
    bincode::deserialize(bytes).map_err(|e| {
        DatabaseError::Serialization {
            message: e.to_string(),
        }
        .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Partition;
    use tempfile::TempDir;

    fn model() -> Model {
        let mut m = Model::new();
        m.add_predicate("Nice", 1, true).unwrap();
        m.add_predicate("Friends", 2, false).unwrap();
        m
    }

    #[test]
    fn persistence_across_reopens() {
        let dir = TempDir::new().unwrap();
        let m = model();
        let db = Database::new();
        db.insert(Partition::Read, m.atom("Nice", &["alice"]).unwrap(), 1.0)
            .unwrap();
        db.insert(
            Partition::Write,
            m.atom("Friends", &["alice", "bob"]).unwrap(),
            0.25,
        )
        .unwrap();

        {
            let archive = FactArchive::open(dir.path()).unwrap();
            assert_eq!(archive.save(&db, &m).unwrap(), 2);
        }

        let archive = FactArchive::open(dir.path()).unwrap();
        let loaded = archive.load(&m).unwrap();
        assert_eq!(loaded.len(), 2);
        let friends = loaded
            .get(&m.atom("Friends", &["alice", "bob"]).unwrap())
            .unwrap();
        assert_eq!(friends.partition, Partition::Write);
        assert_eq!(friends.value, 0.25);
    }

    #[test]
    fn commit_updates_single_atoms() {
        let dir = TempDir::new().unwrap();
        let m = model();
        let archive = FactArchive::open(dir.path()).unwrap();
        let atom = m.atom("Friends", &["a", "b"]).unwrap();
        archive
            .commit(
                &m,
                &[(
                    atom.clone(),
                    Fact {
                        partition: Partition::Write,
                        value: 0.9,
                    },
                )],
            )
            .unwrap();
        let loaded = archive.load(&m).unwrap();
        assert_eq!(loaded.get(&atom).unwrap().value, 0.9);
    }

    #[test]
    fn empty_archive_loads_empty() {
        let dir = TempDir::new().unwrap();
        let archive = FactArchive::open(dir.path()).unwrap();
        assert!(archive.load(&model()).unwrap().is_empty());
    }
}
