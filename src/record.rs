use std::cmp::Ordering;
use std::sync::Arc;

/// Marker for anything the engine can sort: the record itself is opaque,
/// ordering always comes from a caller-supplied [`Comparator`].
pub trait Record: Send + 'static {}

impl<T: Send + 'static> Record for T {}

/// A shared, cloneable total order over `T`.
///
/// The comparison function must be pure and consistent for the whole sort
/// job; a comparator that panics fails the job (the panic is trapped on the
/// worker and surfaced as the job error).
pub struct Comparator<T> {
    cmp: Arc<dyn Fn(&T, &T) -> Ordering + Send + Sync>,
}

impl<T> Clone for Comparator<T> {
    fn clone(&self) -> Self {
        Self {
            cmp: Arc::clone(&self.cmp),
        }
    }
}

impl<T: 'static> Comparator<T> {
    pub fn new<F>(compare: F) -> Self
    where
        F: Fn(&T, &T) -> Ordering + Send + Sync + 'static,
    {
        Self {
            cmp: Arc::new(compare),
        }
    }

    /// The type's own `Ord` implementation.
    pub fn natural() -> Self
    where
        T: Ord,
    {
        Self::new(|a, b| a.cmp(b))
    }

    /// Order by a derived key.
    pub fn by_key<K, F>(key: F) -> Self
    where
        K: Ord,
        F: Fn(&T) -> K + Send + Sync + 'static,
    {
        Self::new(move |a, b| key(a).cmp(&key(b)))
    }

    /// Fallback chaining: use `fallback` to break ties of `self`.
    pub fn then(self, fallback: Comparator<T>) -> Self {
        let primary = self.cmp;
        let secondary = fallback.cmp;
        Self::new(move |a, b| match (primary)(a, b) {
            Ordering::Equal => (secondary)(a, b),
            other => other,
        })
    }

    pub fn reversed(self) -> Self {
        let inner = self.cmp;
        Self::new(move |a, b| (inner)(b, a))
    }

    pub fn compare(&self, a: &T, b: &T) -> Ordering {
        (self.cmp)(a, b)
    }
}
