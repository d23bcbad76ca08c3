
use crate::error::MulticastError;

/// Capacity of every source list (per socket, per device aggregate, per pending query).
pub const MAX_SOURCES: usize = 10;

/// Ordered, duplicate-free list of source addresses bounded by [`MAX_SOURCES`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceList<A> {
    addrs: Vec<A>,
}

impl<A> Default for SourceList<A> {
    fn default() -> Self {
        Self { addrs: Vec::new() }
    }
}

impl<A> SourceList<A>
where
    A: Copy + Eq,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Duplicates are dropped; more than [`MAX_SOURCES`] distinct entries is an error.
    pub fn from_slice(addrs: &[A]) -> Result<Self, MulticastError> {
        let mut list = Self::new();
        for addr in addrs {
            list.insert(*addr)?;
        }
        Ok(list)
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    pub fn contains(&self, addr: &A) -> bool {
        self.addrs.contains(addr)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, A> {
        self.addrs.iter()
    }

    pub fn as_slice(&self) -> &[A] {
        &self.addrs
    }

    pub fn to_vec(&self) -> Vec<A> {
        self.addrs.clone()
    }

    pub fn clear(&mut self) {
        self.addrs.clear();
    }

    /// Returns `Ok(false)` when the address was already present.
    pub fn insert(&mut self, addr: A) -> Result<bool, MulticastError> {
        if self.addrs.contains(&addr) {
            return Ok(false);
        }
        if self.addrs.len() >= MAX_SOURCES {
            return Err(MulticastError::TooManySourceAddresses);
        }
        self.addrs.push(addr);
        Ok(true)
    }

    /// self ∪ other, in first-seen order.
    pub fn union(&self, other: &Self) -> Result<Self, MulticastError> {
        let mut result = self.clone();
        for addr in other.iter() {
            result.insert(*addr)?;
        }
        Ok(result)
    }

    /// self − other
    pub fn difference(&self, other: &Self) -> Self {
        let addrs = self.addrs.iter().filter(|a| !other.contains(a)).copied().collect();
        Self { addrs }
    }

    /// self ∩ other, in the order of `self`.
    pub fn intersection(&self, other: &Self) -> Self {
        let addrs = self.addrs.iter().filter(|a| other.contains(a)).copied().collect();
        Self { addrs }
    }

    /// Set equality, ignoring order.
    pub fn same_set(&self, other: &Self) -> bool {
        self.len() == other.len() && self.addrs.iter().all(|a| other.contains(a))
    }
}

impl<'a, A> IntoIterator for &'a SourceList<A> {
    type Item = &'a A;
    type IntoIter = std::slice::Iter<'a, A>;

    fn into_iter(self) -> Self::IntoIter {
        self.addrs.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(addrs: &[u8]) -> SourceList<u8> {
        SourceList::from_slice(addrs).unwrap()
    }

    #[test]
    fn test_srcset_from_slice_drops_duplicates() {
        let l = list(&[1, 2, 2, 3, 1]);
        assert_eq!(l.as_slice(), &[1, 2, 3]);
    }

    #[test]
    fn test_srcset_capacity_is_enforced() {
        let addrs: Vec<u8> = (0..MAX_SOURCES as u8 + 1).collect();
        assert_eq!(SourceList::from_slice(&addrs), Err(MulticastError::TooManySourceAddresses));

        let mut l = SourceList::from_slice(&addrs[..MAX_SOURCES]).unwrap();
        assert_eq!(l.insert(0), Ok(false));
        assert_eq!(l.insert(200), Err(MulticastError::TooManySourceAddresses));
        assert_eq!(l.len(), MAX_SOURCES);
    }

    #[test]
    fn test_srcset_algebra() {
        let a = list(&[1, 2, 3]);
        let b = list(&[2, 3, 4]);
        assert_eq!(a.union(&b).unwrap().as_slice(), &[1, 2, 3, 4]);
        assert_eq!(a.difference(&b).as_slice(), &[1]);
        assert_eq!(b.difference(&a).as_slice(), &[4]);
        assert_eq!(a.intersection(&b).as_slice(), &[2, 3]);
        assert!(a.intersection(&list(&[9])).is_empty());
    }

    #[test]
    fn test_srcset_union_overflow_leaves_inputs_alone() {
        let a = list(&[0, 1, 2, 3, 4, 5]);
        let b = list(&[6, 7, 8, 9, 10]);
        assert_eq!(a.union(&b), Err(MulticastError::TooManySourceAddresses));
        assert_eq!(a.len(), 6);
    }

    #[test]
    fn test_srcset_same_set_ignores_order() {
        assert!(list(&[1, 2, 3]).same_set(&list(&[3, 1, 2])));
        assert!(!list(&[1, 2]).same_set(&list(&[1, 2, 3])));
    }
}
