//! Forward-only record cursors.

use std::marker::PhantomData;

use crate::backend::Table;
use crate::error::StoreError;
use crate::schema::{StoreName, StoreRecord};
use crate::transaction::{TxView, decode};

enum Source<'tx> {
    Values(std::vec::IntoIter<(Vec<u8>, Vec<u8>)>),
    /// Index entries whose values are primary keys into `store`.
    Index {
        view: TxView<'tx>,
        store: StoreName,
        entries: std::vec::IntoIter<(Vec<u8>, Vec<u8>)>,
    },
}

/// A finite, single-pass sequence of records.
///
/// Keys are fixed when the cursor is opened; records are fetched and
/// decoded one at a time as the cursor advances. Open a new cursor to
/// iterate again.
pub struct Cursor<'tx, R> {
    source: Source<'tx>,
    _record: PhantomData<fn() -> R>,
}

impl<'tx, R: StoreRecord> Cursor<'tx, R> {
    pub(crate) fn values(entries: Vec<(Vec<u8>, Vec<u8>)>) -> Self {
        Self { source: Source::Values(entries.into_iter()), _record: PhantomData }
    }

    pub(crate) fn indexed(view: TxView<'tx>, store: StoreName, entries: Vec<(Vec<u8>, Vec<u8>)>) -> Self {
        Self {
            source: Source::Index { view, store, entries: entries.into_iter() },
            _record: PhantomData,
        }
    }

    /// Consume into a vector, stopping at the first error.
    pub fn to_vec(self) -> Result<Vec<R>, StoreError> {
        self.collect()
    }

    pub fn map_records<U>(self, mut f: impl FnMut(R) -> U) -> Result<Vec<U>, StoreError> {
        self.map(|r| r.map(&mut f)).collect()
    }

    pub fn filter_records(self, mut pred: impl FnMut(&R) -> bool) -> Result<Vec<R>, StoreError> {
        let mut out = Vec::new();
        for r in self {
            let r = r?;
            if pred(&r) {
                out.push(r);
            }
        }
        Ok(out)
    }
}

impl<R: StoreRecord> Iterator for Cursor<'_, R> {
    type Item = Result<R, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.source {
            Source::Values(entries) => entries.next().map(|(_, v)| decode(&v)),
            Source::Index { view, store, entries } => {
                let (_, pk) = entries.next()?;
                Some(match view.get_raw(Table::Store(*store), &pk) {
                    Ok(Some(bytes)) => decode(&bytes),
                    Ok(None) => Err(StoreError::Backend(format!(
                        "index entry points at missing record in {store}"
                    ))),
                    Err(e) => Err(e),
                })
            }
        }
    }
}
