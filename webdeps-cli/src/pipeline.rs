//! Stage-parallel asynchronous transform chain.
//!
//! Each combinator runs its transform over every item concurrently and only
//! returns once all of them have settled, so a stage boundary is a full
//! barrier. A failing item does not cancel its siblings; the first error (in
//! item order) is returned after the whole stage has finished.

use std::future::Future;

use futures::future::join_all;

/// An ordered collection of items moving through pipeline stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline<T> {
    items: Vec<T>,
}

impl<T> Pipeline<T> {
    #[must_use]
    pub fn new(items: Vec<T>) -> Self {
        Self { items }
    }

    /// Apply `transform` to every item concurrently.
    ///
    /// # Errors
    ///
    /// Returns the first item error once every transform has completed.
    pub async fn map<U, E, F, Fut>(self, transform: F) -> Result<Pipeline<U>, E>
    where
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<U, E>>,
    {
        let settled = join_all(self.items.into_iter().map(transform)).await;
        let items = settled.into_iter().collect::<Result<Vec<_>, E>>()?;
        Ok(Pipeline { items })
    }

    /// Like [`Pipeline::map`], but each item expands into zero or more
    /// output items.
    ///
    /// # Errors
    ///
    /// Returns the first item error once every transform has completed.
    pub async fn flat_map<U, I, E, F, Fut>(self, transform: F) -> Result<Pipeline<U>, E>
    where
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<I, E>>,
        I: IntoIterator<Item = U>,
    {
        let settled = join_all(self.items.into_iter().map(transform)).await;
        let mut items = Vec::new();
        for expanded in settled {
            items.extend(expanded?);
        }
        Ok(Pipeline { items })
    }

    /// Keep only items satisfying `predicate`.
    #[must_use]
    pub fn filter(self, mut predicate: impl FnMut(&T) -> bool) -> Self {
        Self {
            items: self.items.into_iter().filter(|item| predicate(item)).collect(),
        }
    }

    /// Observe every item without changing it.
    #[must_use]
    pub fn inspect(self, observe: impl Fn(&T)) -> Self {
        self.items.iter().for_each(observe);
        self
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[must_use]
    pub fn into_items(self) -> Vec<T> {
        self.items
    }
}

impl<T> From<Vec<T>> for Pipeline<T> {
    fn from(items: Vec<T>) -> Self {
        Self::new(items)
    }
}

impl<T> IntoIterator for Pipeline<T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::convert::Infallible;

    #[tokio::test]
    async fn map_keeps_item_order() {
        let out = Pipeline::new(vec![3u64, 1, 2])
            .map(|n| async move {
                for _ in 0..n {
                    tokio::task::yield_now().await;
                }
                Ok::<_, Infallible>(n * 10)
            })
            .await
            .unwrap();
        assert_eq!(out.into_items(), [30, 10, 20]);
    }

    #[tokio::test]
    async fn stage_is_a_barrier() {
        let log = RefCell::new(Vec::new());
        let out = Pipeline::new(vec![2u32, 0])
            .map(|n| {
                let log = &log;
                async move {
                    for _ in 0..n {
                        tokio::task::yield_now().await;
                    }
                    log.borrow_mut().push(format!("first {n}"));
                    Ok::<_, Infallible>(n)
                }
            })
            .await
            .unwrap()
            .map(|n| {
                let log = &log;
                async move {
                    log.borrow_mut().push(format!("second {n}"));
                    Ok::<_, Infallible>(n)
                }
            })
            .await
            .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(
            log.into_inner(),
            ["first 0", "first 2", "second 2", "second 0"]
        );
    }

    #[tokio::test]
    async fn failure_does_not_cancel_siblings() {
        let completed = Cell::new(0);
        let result = Pipeline::new(vec![0u32, 1, 2])
            .map(|n| {
                let completed = &completed;
                async move {
                    if n == 0 {
                        return Err(format!("item {n} failed"));
                    }
                    tokio::task::yield_now().await;
                    completed.set(completed.get() + 1);
                    Ok(n)
                }
            })
            .await;
        assert_eq!(result.unwrap_err(), "item 0 failed");
        assert_eq!(completed.get(), 2);
    }

    #[tokio::test]
    async fn flat_map_expands_and_drops() {
        let out = Pipeline::new(vec![0usize, 1, 3])
            .flat_map(|n| async move { Ok::<_, Infallible>(vec![n; n]) })
            .await
            .unwrap();
        assert_eq!(out.into_items(), [1, 3, 3, 3]);
    }

    #[test]
    fn filter_and_inspect() {
        let seen = RefCell::new(Vec::new());
        let out = Pipeline::new(vec!["a", "bb", "ccc"])
            .filter(|s| s.len() != 2)
            .inspect(|s| seen.borrow_mut().push(s.to_uppercase()));
        assert_eq!(out.iter().copied().collect::<Vec<_>>(), ["a", "ccc"]);
        assert_eq!(seen.into_inner(), ["A", "CCC"]);
    }
}
