//! Per-item results for best-effort batch operations.
//!
//! URL resolution, reorder and bulk removal fan out independent calls; a
//! failure of one item must not hide the others. Results keep the input
//! order so callers can inspect them position by position.

use uuid::Uuid;

use crate::error::ImageError;

/// A single failed item of a batch, tagged with the image it concerns
#[derive(Debug)]
pub struct ItemFailure {
    pub id: Uuid,
    pub error: ImageError,
}

/// Ordered outcome of a best-effort batch
#[derive(Debug)]
pub struct BatchOutcome<T> {
    items: Vec<Result<T, ItemFailure>>,
}

impl<T> BatchOutcome<T> {
    pub fn new(items: Vec<Result<T, ItemFailure>>) -> Self {
        Self { items }
    }

    pub fn items(&self) -> &[Result<T, ItemFailure>] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// True when every item succeeded
    pub fn is_complete(&self) -> bool {
        self.items.iter().all(Result::is_ok)
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &T> {
        self.items.iter().filter_map(|r| r.as_ref().ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = &ItemFailure> {
        self.items.iter().filter_map(|r| r.as_ref().err())
    }

    /// Split into successful values and failures, both in input order
    pub fn into_parts(self) -> (Vec<T>, Vec<ItemFailure>) {
        let mut ok = Vec::new();
        let mut failed = Vec::new();
        for item in self.items {
            match item {
                Ok(value) => ok.push(value),
                Err(failure) => failed.push(failure),
            }
        }
        (ok, failed)
    }

    /// Collapse into a single result; any failure yields `PartialBatchFailure`
    /// whose first entry is the first failed item.
    pub fn into_result(self) -> Result<Vec<T>, ImageError> {
        let total = self.items.len();
        let (ok, failures) = self.into_parts();
        if failures.is_empty() {
            Ok(ok)
        } else {
            Err(ImageError::PartialBatchFailure { failures, total })
        }
    }
}

impl<T> IntoIterator for BatchOutcome<T> {
    type Item = Result<T, ItemFailure>;
    type IntoIter = std::vec::IntoIter<Self::Item>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(n: u128) -> ItemFailure {
        ItemFailure {
            id: Uuid::from_u128(n),
            error: ImageError::ImageNotFound(Uuid::from_u128(n)),
        }
    }

    #[test]
    fn test_complete_batch_collapses_to_values() {
        let outcome = BatchOutcome::new(vec![Ok(1), Ok(2), Ok(3)]);
        assert!(outcome.is_complete());
        assert_eq!(outcome.into_result().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_partial_batch_keeps_order_and_reports_first_failure() {
        let outcome = BatchOutcome::new(vec![Ok(1), Err(failure(7)), Ok(3), Err(failure(9))]);
        assert!(!outcome.is_complete());
        assert_eq!(outcome.succeeded().copied().collect::<Vec<_>>(), vec![1, 3]);

        match outcome.into_result() {
            Err(ImageError::PartialBatchFailure { failures, total }) => {
                assert_eq!(total, 4);
                assert_eq!(failures.len(), 2);
                assert_eq!(failures[0].id, Uuid::from_u128(7));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
