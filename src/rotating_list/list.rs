use super::{check_index, check_position, ListError, SubList};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// Copy-on-write list with a rotate primitive
pub struct RotatingList<T> {
    elements: ArcSwap<Vec<T>>,
    write_lock: Mutex<()>,
}

/// Result of one write: the replacement vector (if anything changed) and
/// the value handed back to the caller
pub(super) type Edit<T, R> = Result<(Option<Vec<T>>, R), ListError>;

impl<T> Default for RotatingList<T> {
    fn default() -> Self {
        Self::from_vec(Vec::new())
    }
}

impl<T> RotatingList<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_vec(elements: Vec<T>) -> Self {
        Self {
            elements: ArcSwap::from_pointee(elements),
            write_lock: Mutex::new(()),
        }
    }

    /// Current contents; never changes after it was taken
    #[must_use]
    pub fn snapshot(&self) -> Arc<Vec<T>> {
        self.elements.load_full()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.elements.load().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.elements.load().is_empty()
    }

    /// Iterator over the current snapshot
    #[must_use]
    pub fn iter(&self) -> Iter<T> {
        Iter::new(self.snapshot())
    }

    /// Apply `edit` to the current contents under the write lock and publish
    /// the vector it returns. With `expected`, fails unless the current
    /// contents are still that snapshot. Returns the caller's value and the
    /// snapshot in place afterwards.
    pub(super) fn write<R, F>(
        &self,
        expected: Option<&Arc<Vec<T>>>,
        edit: F,
    ) -> Result<(R, Arc<Vec<T>>), ListError>
    where
        F: FnOnce(&[T]) -> Edit<T, R>,
    {
        let _guard = self.write_lock.lock();
        let current = self.elements.load_full();
        if let Some(expected) = expected {
            if !Arc::ptr_eq(&current, expected) {
                return Err(ListError::ConcurrentModification);
            }
        }
        let (next, value) = edit(current.as_slice())?;
        match next {
            Some(next) => {
                let next = Arc::new(next);
                self.elements.store(Arc::clone(&next));
                Ok((value, next))
            }
            None => Ok((value, current)),
        }
    }

    fn edit<R, F>(&self, edit: F) -> Result<R, ListError>
    where
        F: FnOnce(&[T]) -> Edit<T, R>,
    {
        self.write(None, edit).map(|(value, _)| value)
    }

    /// Unconditional write: publish what `build` makes of the current contents
    fn replace_with<F>(&self, build: F)
    where
        F: FnOnce(&[T]) -> Vec<T>,
    {
        let _guard = self.write_lock.lock();
        let next = build(self.elements.load().as_slice());
        self.elements.store(Arc::new(next));
    }

    /// Remove every element
    pub fn clear(&self) {
        let _guard = self.write_lock.lock();
        self.elements.store(Arc::new(Vec::new()));
    }
}

impl<T: Clone> RotatingList<T> {
    #[must_use]
    pub fn get(&self, index: usize) -> Option<T> {
        self.elements.load().get(index).cloned()
    }

    #[must_use]
    pub fn to_vec(&self) -> Vec<T> {
        self.elements.load().as_ref().clone()
    }

    /// Replace the element at `index`, returning the old one
    pub fn set(&self, index: usize, element: T) -> Result<T, ListError> {
        self.edit(|es| {
            check_index(index, es.len())?;
            let mut next = es.to_vec();
            let old = std::mem::replace(&mut next[index], element);
            Ok((Some(next), old))
        })
    }

    /// Append `element`
    pub fn push(&self, element: T) {
        self.replace_with(|es| {
            let mut next = Vec::with_capacity(es.len() + 1);
            next.extend_from_slice(es);
            next.push(element);
            next
        });
    }

    /// Prepend `element`
    pub fn offer(&self, element: T) {
        self.replace_with(|es| {
            let mut next = Vec::with_capacity(es.len() + 1);
            next.push(element);
            next.extend_from_slice(es);
            next
        });
    }

    /// Insert `element` at `index`, shifting later elements right
    pub fn insert(&self, index: usize, element: T) -> Result<(), ListError> {
        self.edit(|es| {
            check_position(index, es.len())?;
            let mut next = Vec::with_capacity(es.len() + 1);
            next.extend_from_slice(&es[..index]);
            next.push(element);
            next.extend_from_slice(&es[index..]);
            Ok((Some(next), ()))
        })
    }

    /// Remove and return the element at `index`
    pub fn remove(&self, index: usize) -> Result<T, ListError> {
        self.edit(|es| {
            check_index(index, es.len())?;
            let mut next = es.to_vec();
            let old = next.remove(index);
            Ok((Some(next), old))
        })
    }

    /// Remove `[from, to)`
    pub fn remove_range(&self, from: usize, to: usize) -> Result<(), ListError> {
        self.edit(|es| {
            check_position(to, es.len())?;
            if from > to {
                return Err(ListError::IndexOutOfBounds {
                    index: from,
                    len: es.len(),
                });
            }
            if from == to {
                return Ok((None, ()));
            }
            let mut next = Vec::with_capacity(es.len() - (to - from));
            next.extend_from_slice(&es[..from]);
            next.extend_from_slice(&es[to..]);
            Ok((Some(next), ()))
        })
    }

    /// Append every element of `items`; `false` if there were none
    pub fn add_all<I>(&self, items: I) -> bool
    where
        I: IntoIterator<Item = T>,
    {
        let items: Vec<T> = items.into_iter().collect();
        if items.is_empty() {
            return false;
        }
        self.edit(|es| {
            let mut next = Vec::with_capacity(es.len() + items.len());
            next.extend_from_slice(es);
            next.extend(items);
            Ok((Some(next), true))
        })
        .unwrap_or(false)
    }

    /// Insert every element of `items` at `index`, preserving their order
    pub fn insert_all<I>(&self, index: usize, items: I) -> Result<bool, ListError>
    where
        I: IntoIterator<Item = T>,
    {
        let items: Vec<T> = items.into_iter().collect();
        self.edit(|es| {
            check_position(index, es.len())?;
            if items.is_empty() {
                return Ok((None, false));
            }
            let mut next = Vec::with_capacity(es.len() + items.len());
            next.extend_from_slice(&es[..index]);
            next.extend(items);
            next.extend_from_slice(&es[index..]);
            Ok((Some(next), true))
        })
    }

    /// Remove the elements matching `filter`; `true` if any were removed
    pub fn remove_if<F>(&self, mut filter: F) -> bool
    where
        F: FnMut(&T) -> bool,
    {
        self.edit(|es| {
            let next: Vec<T> = es.iter().filter(|e| !filter(*e)).cloned().collect();
            if next.len() == es.len() {
                Ok((None, false))
            } else {
                Ok((Some(next), true))
            }
        })
        .unwrap_or(false)
    }

    /// Keep only the elements matching `keep`; `true` if any were removed
    pub fn retain<F>(&self, mut keep: F) -> bool
    where
        F: FnMut(&T) -> bool,
    {
        self.remove_if(|e| !keep(e))
    }

    /// Replace every element with `operator(element)`
    pub fn replace_all<F>(&self, operator: F)
    where
        F: FnMut(&T) -> T,
    {
        self.replace_with(|es| es.iter().map(operator).collect());
    }

    /// Stable sort by `compare`
    pub fn sort_by<F>(&self, compare: F)
    where
        F: FnMut(&T, &T) -> Ordering,
    {
        self.replace_with(|es| {
            let mut next = es.to_vec();
            next.sort_by(compare);
            next
        });
    }

    /// Put `new_head` first, shift everything right by one and return the
    /// evicted last element. The length never changes.
    ///
    /// # Errors
    ///
    /// [`ListError::IndexOutOfBounds`] if the list is empty; there is nothing
    /// to evict.
    pub fn rotate(&self, new_head: T) -> Result<T, ListError> {
        self.edit(|es| {
            let Some((last, rest)) = es.split_last() else {
                return Err(ListError::IndexOutOfBounds { index: 0, len: 0 });
            };
            let mut next = Vec::with_capacity(es.len());
            next.push(new_head);
            next.extend_from_slice(rest);
            Ok((Some(next), last.clone()))
        })
    }

    /// View of `[from, to)` of the current snapshot
    pub fn sub_list(&self, from: usize, to: usize) -> Result<SubList<'_, T>, ListError> {
        let snapshot = self.snapshot();
        check_position(to, snapshot.len())?;
        if from > to {
            return Err(ListError::IndexOutOfBounds {
                index: from,
                len: snapshot.len(),
            });
        }
        Ok(SubList::new(self, snapshot, from, to - from))
    }
}

impl<T: Clone + PartialEq> RotatingList<T> {
    #[must_use]
    pub fn contains(&self, element: &T) -> bool {
        self.elements.load().contains(element)
    }

    #[must_use]
    pub fn index_of(&self, element: &T) -> Option<usize> {
        self.elements.load().iter().position(|e| e == element)
    }

    #[must_use]
    pub fn last_index_of(&self, element: &T) -> Option<usize> {
        self.elements.load().iter().rposition(|e| e == element)
    }

    /// Remove the first occurrence of `element`
    pub fn remove_item(&self, element: &T) -> bool {
        self.edit(|es| match es.iter().position(|e| e == element) {
            Some(index) => {
                let mut next = es.to_vec();
                next.remove(index);
                Ok((Some(next), true))
            }
            None => Ok((None, false)),
        })
        .unwrap_or(false)
    }

    /// Append `element` unless an equal one is present
    pub fn add_if_absent(&self, element: T) -> bool {
        self.edit(|es| {
            if es.contains(&element) {
                return Ok((None, false));
            }
            let mut next = Vec::with_capacity(es.len() + 1);
            next.extend_from_slice(es);
            next.push(element);
            Ok((Some(next), true))
        })
        .unwrap_or(false)
    }

    /// Append the elements of `items` that are not present yet (duplicates
    /// within `items` are added once). Returns how many were added.
    pub fn add_all_absent<I>(&self, items: I) -> usize
    where
        I: IntoIterator<Item = T>,
    {
        let items: Vec<T> = items.into_iter().collect();
        self.edit(|es| {
            let mut next = es.to_vec();
            let mut added = 0;
            for item in items {
                if !next.contains(&item) {
                    next.push(item);
                    added += 1;
                }
            }
            Ok(((added > 0).then_some(next), added))
        })
        .unwrap_or(0)
    }
}

impl<T: Clone> Clone for RotatingList<T> {
    /// An independent list with the current contents
    fn clone(&self) -> Self {
        Self::from_vec(self.to_vec())
    }
}

impl<T: PartialEq> PartialEq for RotatingList<T> {
    fn eq(&self, other: &Self) -> bool {
        *self.elements.load() == *other.elements.load()
    }
}

impl<T: Eq> Eq for RotatingList<T> {}

impl<T: fmt::Debug> fmt::Debug for RotatingList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.elements.load().iter()).finish()
    }
}

impl<T> From<Vec<T>> for RotatingList<T> {
    fn from(elements: Vec<T>) -> Self {
        Self::from_vec(elements)
    }
}

impl<T> FromIterator<T> for RotatingList<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self::from_vec(iter.into_iter().collect())
    }
}

impl<'a, T: Clone> IntoIterator for &'a RotatingList<T> {
    type Item = T;
    type IntoIter = Iter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over one snapshot of a [`RotatingList`]
pub struct Iter<T> {
    snapshot: Arc<Vec<T>>,
    front: usize,
    back: usize,
}

impl<T> Iter<T> {
    fn new(snapshot: Arc<Vec<T>>) -> Self {
        let back = snapshot.len();
        Self {
            snapshot,
            front: 0,
            back,
        }
    }
}

impl<T: Clone> Iterator for Iter<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        if self.front == self.back {
            return None;
        }
        let item = self.snapshot[self.front].clone();
        self.front += 1;
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.back - self.front;
        (n, Some(n))
    }
}

impl<T: Clone> DoubleEndedIterator for Iter<T> {
    fn next_back(&mut self) -> Option<T> {
        if self.front == self.back {
            return None;
        }
        self.back -= 1;
        Some(self.snapshot[self.back].clone())
    }
}

impl<T: Clone> ExactSizeIterator for Iter<T> {}
