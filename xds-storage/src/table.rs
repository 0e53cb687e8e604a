//! Typed table helpers over the raw byte contract.

use serde::{de::DeserializeOwned, Serialize};

use crate::{Error, KvStore, WriteBatch};

/// 32-byte hash key stored in wire order.
pub struct DbHash(pub [u8; 32]);

impl From<DbHash> for Box<[u8]> {
    fn from(value: DbHash) -> Self {
        Box::new(value.0)
    }
}

impl TryFrom<Box<[u8]>> for DbHash {
    type Error = Error;

    fn try_from(value: Box<[u8]>) -> Result<Self, Error> {
        let inner: [u8; 32] = value.as_ref().try_into().map_err(|_| Error::Serde)?;
        Ok(Self(inner))
    }
}

/// Big-endian u64 key so byte order matches numeric order.
pub struct DbInt(pub u64);

impl From<DbInt> for Box<[u8]> {
    fn from(value: DbInt) -> Self {
        Box::new(value.0.to_be_bytes())
    }
}

impl TryFrom<Box<[u8]>> for DbInt {
    type Error = Error;

    fn try_from(value: Box<[u8]>) -> Result<Self, Error> {
        let inner: [u8; 8] = value.as_ref().try_into().map_err(|_| Error::Serde)?;
        Ok(Self(u64::from_be_bytes(inner)))
    }
}

/// Bincode-marshalled value.
pub struct DbSerde<V>(pub V);

impl<V: Serialize> TryFrom<DbSerde<V>> for Box<[u8]> {
    type Error = Error;

    fn try_from(value: DbSerde<V>) -> Result<Self, Error> {
        bincode::serialize(&value.0)
            .map(Vec::into_boxed_slice)
            .map_err(|_| Error::Serde)
    }
}

impl<V: DeserializeOwned> TryFrom<Box<[u8]>> for DbSerde<V> {
    type Error = Error;

    fn try_from(value: Box<[u8]>) -> Result<Self, Error> {
        bincode::deserialize(&value).map(DbSerde).map_err(|_| Error::Serde)
    }
}

/// A named table with typed keys and values.
///
/// Implementors pick the marshalling newtypes; the trait supplies the
/// get/stage/iterate plumbing over any [`KvStore`].
pub trait KvTable {
    const NAME: &'static str;

    type Key: Into<Box<[u8]>> + TryFrom<Box<[u8]>, Error = Error>;
    type Value: TryInto<Box<[u8]>, Error = Error> + TryFrom<Box<[u8]>, Error = Error>;

    fn get(store: &dyn KvStore, key: Self::Key) -> Result<Option<Self::Value>, Error> {
        let raw = store.get(Self::NAME, &key.into())?;

        match raw {
            Some(raw) => Ok(Some(Self::Value::try_from(raw)?)),
            None => Ok(None),
        }
    }

    fn stage_put(batch: &mut WriteBatch, key: Self::Key, value: Self::Value) -> Result<(), Error> {
        batch.put(Self::NAME, key.into(), value.try_into()?);
        Ok(())
    }

    fn stage_delete(batch: &mut WriteBatch, key: Self::Key) {
        batch.delete(Self::NAME, key.into());
    }

    fn last_entry(store: &dyn KvStore) -> Result<Option<(Self::Key, Self::Value)>, Error> {
        match store.last(Self::NAME)? {
            Some((key, value)) => Ok(Some((
                Self::Key::try_from(key)?,
                Self::Value::try_from(value)?,
            ))),
            None => Ok(None),
        }
    }

    fn entries_from(
        store: &dyn KvStore,
        from: Option<Self::Key>,
    ) -> Result<Vec<(Self::Key, Self::Value)>, Error> {
        let from = from.map(Into::into);
        let raw = store.iter_from(Self::NAME, from.as_deref())?;

        raw.into_iter()
            .map(|(k, v)| Ok((Self::Key::try_from(k)?, Self::Value::try_from(v)?)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryKv;

    struct Heights;

    impl KvTable for Heights {
        const NAME: &'static str = "heights";
        type Key = DbInt;
        type Value = DbSerde<String>;
    }

    #[test]
    fn typed_roundtrip_in_key_order() {
        let store = MemoryKv::new(&["heights"]);

        let mut batch = WriteBatch::new();
        Heights::stage_put(&mut batch, DbInt(300), DbSerde("c".into())).unwrap();
        Heights::stage_put(&mut batch, DbInt(2), DbSerde("a".into())).unwrap();
        store.commit(batch).unwrap();

        let got = Heights::get(&store, DbInt(2)).unwrap().unwrap();
        assert_eq!(got.0, "a");

        // big-endian keys keep numeric order under bytewise sort
        let entries = Heights::entries_from(&store, None).unwrap();
        let keys: Vec<u64> = entries.iter().map(|(k, _)| k.0).collect();
        assert_eq!(keys, vec![2, 300]);

        let (last, _) = Heights::last_entry(&store).unwrap().unwrap();
        assert_eq!(last.0, 300);
    }
}
