//! BTreeMap-backed store used by tests and ephemeral nodes.

use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::{BatchOp, Error, KvStore, WriteBatch};

type Table = BTreeMap<Box<[u8]>, Box<[u8]>>;

pub struct MemoryKv {
    tables: RwLock<BTreeMap<&'static str, Table>>,
}

impl MemoryKv {
    pub fn new(tables: &[&'static str]) -> Self {
        let tables = tables.iter().map(|name| (*name, Table::new())).collect();

        Self {
            tables: RwLock::new(tables),
        }
    }
}

impl KvStore for MemoryKv {
    fn get(&self, table: &'static str, key: &[u8]) -> Result<Option<Box<[u8]>>, Error> {
        let tables = self.tables.read().expect("lock is never poisoned");
        let table = tables.get(table).ok_or(Error::UnknownTable(table))?;

        Ok(table.get(key).cloned())
    }

    fn commit(&self, batch: WriteBatch) -> Result<(), Error> {
        let mut tables = self.tables.write().expect("lock is never poisoned");

        // validate every table before mutating anything so a bad op
        // cannot leave a half-applied batch behind
        for op in &batch.ops {
            let name = match op {
                BatchOp::Put { table, .. } | BatchOp::Delete { table, .. } => table,
            };
            if !tables.contains_key(name) {
                return Err(Error::UnknownTable(name));
            }
        }

        for op in batch.ops {
            match op {
                BatchOp::Put { table, key, value } => {
                    tables
                        .get_mut(table)
                        .expect("validated above")
                        .insert(key, value);
                }
                BatchOp::Delete { table, key } => {
                    tables.get_mut(table).expect("validated above").remove(&key);
                }
            }
        }

        Ok(())
    }

    fn iter_from(
        &self,
        table: &'static str,
        from: Option<&[u8]>,
    ) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>, Error> {
        let tables = self.tables.read().expect("lock is never poisoned");
        let table = tables.get(table).ok_or(Error::UnknownTable(table))?;

        let entries = match from {
            Some(from) => table
                .range(Box::<[u8]>::from(from)..)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            None => table.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        };

        Ok(entries)
    }

    fn last(&self, table: &'static str) -> Result<Option<(Box<[u8]>, Box<[u8]>)>, Error> {
        let tables = self.tables.read().expect("lock is never poisoned");
        let table = tables.get(table).ok_or(Error::UnknownTable(table))?;

        Ok(table
            .iter()
            .next_back()
            .map(|(k, v)| (k.clone(), v.clone())))
    }
}
