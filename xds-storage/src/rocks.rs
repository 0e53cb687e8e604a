//! RocksDB-backed store, one column family per table.

use std::path::Path;

use rocksdb::{IteratorMode, Options, DB};

use crate::{BatchOp, Error, KvStore, WriteBatch};

pub struct RocksKv {
    db: DB,
}

impl RocksKv {
    /// Open (or create) the database with the given tables.
    pub fn open(path: &Path, tables: &[&'static str]) -> Result<Self, Error> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let db = DB::open_cf(&opts, path, tables).map_err(|err| Error::Io(err.to_string()))?;

        Ok(Self { db })
    }

    fn cf(&self, table: &'static str) -> Result<rocksdb::ColumnFamilyRef, Error> {
        self.db.cf_handle(table).ok_or(Error::UnknownTable(table))
    }
}

impl KvStore for RocksKv {
    fn get(&self, table: &'static str, key: &[u8]) -> Result<Option<Box<[u8]>>, Error> {
        let cf = self.cf(table)?;

        let value = self
            .db
            .get_cf(&cf, key)
            .map_err(|err| Error::Io(err.to_string()))?
            .map(|v| Box::from(v.as_slice()));

        Ok(value)
    }

    fn commit(&self, batch: WriteBatch) -> Result<(), Error> {
        let mut inner = rocksdb::WriteBatch::default();

        for op in batch.ops {
            match op {
                BatchOp::Put { table, key, value } => {
                    let cf = self.cf(table)?;
                    inner.put_cf(&cf, key, value);
                }
                BatchOp::Delete { table, key } => {
                    let cf = self.cf(table)?;
                    inner.delete_cf(&cf, key);
                }
            }
        }

        self.db
            .write(inner)
            .map_err(|err| Error::Io(err.to_string()))
    }

    fn iter_from(
        &self,
        table: &'static str,
        from: Option<&[u8]>,
    ) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>, Error> {
        let cf = self.cf(table)?;

        let mode = match from {
            Some(from) => IteratorMode::From(from, rocksdb::Direction::Forward),
            None => IteratorMode::Start,
        };

        let mut entries = Vec::new();

        for item in self.db.iterator_cf(&cf, mode) {
            let (key, value) = item.map_err(|err| Error::Io(err.to_string()))?;
            entries.push((key, value));
        }

        Ok(entries)
    }

    fn last(&self, table: &'static str) -> Result<Option<(Box<[u8]>, Box<[u8]>)>, Error> {
        let cf = self.cf(table)?;

        match self.db.iterator_cf(&cf, IteratorMode::End).next() {
            Some(item) => {
                let entry = item.map_err(|err| Error::Io(err.to_string()))?;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }
}
