use super::list::Edit;
use super::{check_index, check_position, ListError, RotatingList};
use std::sync::Arc;

/// Window `[offset, offset + len)` onto a [`RotatingList`].
///
/// Edits go through to the parent. Every operation first checks that the
/// parent still holds the snapshot this view last saw; any other writer in
/// between makes the view fail with [`ListError::ConcurrentModification`].
pub struct SubList<'a, T> {
    parent: &'a RotatingList<T>,
    expected: Arc<Vec<T>>,
    offset: usize,
    len: usize,
}

impl<'a, T: Clone> SubList<'a, T> {
    pub(super) fn new(
        parent: &'a RotatingList<T>,
        expected: Arc<Vec<T>>,
        offset: usize,
        len: usize,
    ) -> Self {
        Self {
            parent,
            expected,
            offset,
            len,
        }
    }

    fn checked_snapshot(&self) -> Result<Arc<Vec<T>>, ListError> {
        let current = self.parent.snapshot();
        if Arc::ptr_eq(&current, &self.expected) {
            Ok(current)
        } else {
            Err(ListError::ConcurrentModification)
        }
    }

    /// Write through to the parent and adopt the resulting snapshot
    fn write<R, F>(&mut self, edit: F) -> Result<R, ListError>
    where
        F: FnOnce(&[T]) -> Edit<T, R>,
    {
        let (value, snapshot) = self.parent.write(Some(&self.expected), edit)?;
        self.expected = snapshot;
        Ok(value)
    }

    pub fn len(&self) -> Result<usize, ListError> {
        self.checked_snapshot().map(|_| self.len)
    }

    pub fn is_empty(&self) -> Result<bool, ListError> {
        self.len().map(|n| n == 0)
    }

    pub fn get(&self, index: usize) -> Result<T, ListError> {
        check_index(index, self.len)?;
        let snapshot = self.checked_snapshot()?;
        Ok(snapshot[self.offset + index].clone())
    }

    pub fn to_vec(&self) -> Result<Vec<T>, ListError> {
        let snapshot = self.checked_snapshot()?;
        Ok(snapshot[self.offset..self.offset + self.len].to_vec())
    }

    pub fn set(&mut self, index: usize, element: T) -> Result<T, ListError> {
        check_index(index, self.len)?;
        let at = self.offset + index;
        self.write(|es| {
            let mut next = es.to_vec();
            let old = std::mem::replace(&mut next[at], element);
            Ok((Some(next), old))
        })
    }

    pub fn insert(&mut self, index: usize, element: T) -> Result<(), ListError> {
        check_position(index, self.len)?;
        let at = self.offset + index;
        self.write(|es| {
            let mut next = Vec::with_capacity(es.len() + 1);
            next.extend_from_slice(&es[..at]);
            next.push(element);
            next.extend_from_slice(&es[at..]);
            Ok((Some(next), ()))
        })?;
        self.len += 1;
        Ok(())
    }

    /// Append at the end of the window
    pub fn push(&mut self, element: T) -> Result<(), ListError> {
        self.insert(self.len, element)
    }

    pub fn remove(&mut self, index: usize) -> Result<T, ListError> {
        check_index(index, self.len)?;
        let at = self.offset + index;
        let old = self.write(|es| {
            let mut next = es.to_vec();
            let old = next.remove(at);
            Ok((Some(next), old))
        })?;
        self.len -= 1;
        Ok(old)
    }

    /// Remove the window's elements from the parent
    pub fn clear(&mut self) -> Result<(), ListError> {
        let (from, to) = (self.offset, self.offset + self.len);
        self.write(|es| {
            if from == to {
                return Ok((None, ()));
            }
            let mut next = Vec::with_capacity(es.len() - (to - from));
            next.extend_from_slice(&es[..from]);
            next.extend_from_slice(&es[to..]);
            Ok((Some(next), ()))
        })?;
        self.len = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edits_write_through() {
        let list = RotatingList::from_vec(vec![1, 2, 3, 4, 5]);
        let mut view = list.sub_list(1, 4).unwrap();
        assert_eq!(view.to_vec().unwrap(), vec![2, 3, 4]);

        assert_eq!(view.set(0, 20), Ok(2));
        view.push(6).unwrap();
        assert_eq!(view.remove(1), Ok(3));
        assert_eq!(view.len(), Ok(3));
        assert_eq!(view.to_vec().unwrap(), vec![20, 4, 6]);
        assert_eq!(list.to_vec(), vec![1, 20, 4, 6, 5]);

        view.clear().unwrap();
        assert_eq!(view.is_empty(), Ok(true));
        assert_eq!(list.to_vec(), vec![1, 5]);
    }

    #[test]
    fn test_parent_change_is_detected() {
        let list = RotatingList::from_vec(vec!["a", "b", "c"]);
        let mut view = list.sub_list(0, 2).unwrap();
        list.rotate("x").unwrap();
        assert_eq!(view.get(0), Err(ListError::ConcurrentModification));
        assert_eq!(view.set(0, "y"), Err(ListError::ConcurrentModification));
        assert_eq!(list.to_vec(), vec!["x", "a", "b"]);
    }

    #[test]
    fn test_bounds() {
        let list = RotatingList::from_vec(vec![1, 2, 3]);
        assert!(list.sub_list(2, 4).is_err());
        assert!(list.sub_list(2, 1).is_err());
        let mut view = list.sub_list(1, 2).unwrap();
        assert_eq!(
            view.get(1),
            Err(ListError::IndexOutOfBounds { index: 1, len: 1 })
        );
        assert!(view.insert(2, 9).is_err());
        view.insert(1, 9).unwrap();
        assert_eq!(list.to_vec(), vec![1, 2, 9, 3]);
    }
}
