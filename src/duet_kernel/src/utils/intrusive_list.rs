//! Circular intrusive doubly linked lists. Elements are reached through a
//! "pool" implementing `ops::Index`, and each element stores its own
//! [`Link`] in a cell that can only be accessed with a key.
use core::{fmt, ops};

use super::Init;

/// Circular linked list header.
#[derive(Copy, Clone)]
pub struct ListHead<Index> {
    pub first: Option<Index>,
}

impl<Index: fmt::Debug> fmt::Debug for ListHead<Index> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ListHead({:?})", &self.first)
    }
}

impl<Index> Init for ListHead<Index> {
    const INIT: Self = Self { first: None };
}

impl<Index> ListHead<Index> {
    pub const fn new() -> Self {
        Self::INIT
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }
}

/// Links to neighbor items.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Link<Index> {
    pub prev: Index,
    pub next: Index,
}

/// A virtual container of `T`s that can be indexed by `Ident<&'static T>`.
#[derive(Debug, Clone, Copy)]
pub struct Static;

impl<T> ops::Index<Ident<&'static T>> for Static {
    type Output = T;

    fn index(&self, index: Ident<&'static T>) -> &Self::Output {
        index.0
    }
}

/// Reference wrapper compared by identity.
#[derive(Clone, Copy)]
pub struct Ident<T>(pub T);

impl<T> fmt::Debug for Ident<&'_ T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // Print the address only. The pointee may contain this very list.
        f.debug_tuple("Ident").field(&(self.0 as *const T)).finish()
    }
}

impl<T: ?Sized> PartialEq for Ident<&'_ T> {
    fn eq(&self, other: &Self) -> bool {
        core::ptr::eq(self.0, other.0)
    }
}

impl<T: ?Sized> Eq for Ident<&'_ T> {}

/// List header whose elements are linked by [`StaticLink`]`<Element>`.
pub type StaticListHead<Element> = ListHead<Ident<&'static Element>>;

/// A pair of `&'static Element` links.
pub type StaticLink<Element> = Link<Ident<&'static Element>>;

/// A cell whose contents can be read and written by presenting `Key`.
pub trait CellLike<Key> {
    type Target;

    fn get(&self, key: &Key) -> Self::Target;
    fn set(&self, key: &mut Key, value: Self::Target);

    #[inline]
    fn modify<T>(&self, key: &mut Key, f: impl FnOnce(&mut Self::Target) -> T) -> T
    where
        Self: Sized,
    {
        let mut x = self.get(key);
        let ret = f(&mut x);
        self.set(key, x);
        ret
    }
}

impl<Element: Copy> CellLike<()> for core::cell::Cell<Element> {
    type Target = Element;

    fn get(&self, _: &()) -> Self::Target {
        self.get()
    }
    fn set(&self, _: &mut (), value: Self::Target) {
        self.set(value);
    }
}

impl<Key, Element: CellLike<Key>> CellLike<Key> for &Element {
    type Target = Element::Target;

    fn get(&self, key: &Key) -> Self::Target {
        (*self).get(key)
    }
    fn set(&self, key: &mut Key, value: Self::Target) {
        (*self).set(key, value);
    }
}

/// The item passed to an insertion method is already in a list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlreadyLinkedError;

/// The item passed to a method is not in any list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotLinkedError;

#[cold]
#[track_caller]
fn inconsistent() -> ! {
    panic!("linked list is inconsistent")
}

/// Accessor to a linked list whose header and links are stored in
/// [`CellLike`] cells.
#[derive(Debug)]
pub struct ListAccessor<'a, HeadCell, Pool, MapLink, CellKey> {
    head: HeadCell,
    pool: &'a Pool,
    map_link: MapLink,
    /// The key used to read or write cells.
    cell_key: CellKey,
}

impl<'a, HeadCell, Index, Pool, MapLink, Element, LinkCell, CellKey>
    ListAccessor<'a, HeadCell, Pool, MapLink, CellKey>
where
    HeadCell: CellLike<CellKey, Target = ListHead<Index>>,
    Pool: ops::Index<Index, Output = Element>,
    MapLink: Fn(&Element) -> &LinkCell,
    Element: 'a,
    LinkCell: CellLike<CellKey, Target = Option<Link<Index>>>,
    Index: PartialEq + Clone,
{
    pub fn new(head: HeadCell, pool: &'a Pool, map_link: MapLink, cell_key: CellKey) -> Self {
        Self {
            head,
            pool,
            map_link,
            cell_key,
        }
    }

    pub fn head(&self) -> ListHead<Index> {
        self.head.get(&self.cell_key)
    }

    fn set_head(&mut self, head: ListHead<Index>) {
        self.head.set(&mut self.cell_key, head);
    }

    pub fn cell_key(&self) -> &CellKey {
        &self.cell_key
    }

    pub fn is_empty(&self) -> bool {
        self.head().is_empty()
    }

    fn link_of(&self, item: Index) -> Option<Link<Index>> {
        (self.map_link)(&self.pool[item]).get(&self.cell_key)
    }

    fn set_link_of(&mut self, item: Index, link: Option<Link<Index>>) {
        (self.map_link)(&self.pool[item]).set(&mut self.cell_key, link);
    }

    fn modify_link_of(&mut self, item: Index, f: impl FnOnce(&mut Link<Index>)) {
        (self.map_link)(&self.pool[item]).modify(&mut self.cell_key, |link| match link {
            Some(link) => f(link),
            None => inconsistent(),
        });
    }

    /// Return `true` if `item` is linked to any list.
    pub fn is_linked(&self, item: Index) -> bool {
        self.link_of(item).is_some()
    }

    #[inline]
    pub fn front(&self) -> Option<Index> {
        self.head().first
    }

    #[inline]
    pub fn back(&self) -> Option<Index> {
        let first = self.head().first?;
        Some(self.link_of(first).unwrap_or_else(|| inconsistent()).prev)
    }

    #[inline]
    pub fn front_data(&self) -> Option<&'a Element> {
        let pool = self.pool;
        self.front().map(|i| &pool[i])
    }

    /// Insert `item` before `at`, or at the back of the list if `at` is
    /// `None`.
    pub fn insert(&mut self, item: Index, at: Option<Index>) -> Result<(), AlreadyLinkedError> {
        if self.is_linked(item.clone()) {
            return Err(AlreadyLinkedError);
        }

        let mut head = self.head();

        let Some(first) = head.first.clone() else {
            debug_assert!(at.is_none());
            self.set_link_of(
                item.clone(),
                Some(Link {
                    prev: item.clone(),
                    next: item.clone(),
                }),
            );
            head.first = Some(item);
            self.set_head(head);
            return Ok(());
        };

        let (next, becomes_first) = match at {
            Some(at) => {
                let becomes_first = at == first;
                (at, becomes_first)
            }
            None => (first, false),
        };

        let prev = self
            .link_of(next.clone())
            .unwrap_or_else(|| inconsistent())
            .prev;
        self.modify_link_of(prev.clone(), |l| l.next = item.clone());
        self.modify_link_of(next.clone(), |l| l.prev = item.clone());
        self.set_link_of(item.clone(), Some(Link { prev, next }));

        if becomes_first {
            head.first = Some(item);
            self.set_head(head);
        }

        Ok(())
    }

    #[inline]
    pub fn push_back(&mut self, item: Index) -> Result<(), AlreadyLinkedError> {
        self.insert(item, None)
    }

    #[inline]
    pub fn push_front(&mut self, item: Index) -> Result<(), AlreadyLinkedError> {
        let at = self.front();
        self.insert(item, at)
    }

    /// Remove `item` from the list. `item` must be an element of this list
    /// (not some other list).
    pub fn remove(&mut self, item: Index) -> Result<Index, NotLinkedError> {
        let link = self.link_of(item.clone()).ok_or(NotLinkedError)?;

        let mut head = self.head();
        if head.first.as_ref() == Some(&item) {
            if link.next == item {
                // The list just became empty
                head.first = None;
                self.set_head(head);
                self.set_link_of(item.clone(), None);
                return Ok(item);
            }

            head.first = Some(link.next.clone());
            self.set_head(head);
        }

        self.modify_link_of(link.prev.clone(), |l| l.next = link.next.clone());
        self.modify_link_of(link.next.clone(), |l| l.prev = link.prev.clone());
        self.set_link_of(item.clone(), None);

        Ok(item)
    }

    #[inline]
    pub fn pop_front(&mut self) -> Option<Index> {
        let item = self.front()?;
        Some(self.remove(item).unwrap_or_else(|_| inconsistent()))
    }

    /// Get the element following `item`.
    pub fn next(&self, item: Index) -> Result<Option<Index>, NotLinkedError> {
        let next = self.link_of(item).ok_or(NotLinkedError)?.next;
        Ok(if Some(&next) == self.head().first.as_ref() {
            None
        } else {
            Some(next)
        })
    }

    /// Get the element preceding `item`.
    pub fn prev(&self, item: Index) -> Result<Option<Index>, NotLinkedError> {
        let prev = self.link_of(item.clone()).ok_or(NotLinkedError)?.prev;
        Ok(if Some(&item) == self.head().first.as_ref() {
            None
        } else {
            Some(prev)
        })
    }

    pub fn iter(&self) -> Iter<'_, 'a, HeadCell, Pool, MapLink, CellKey, Index> {
        Iter {
            next: self.head().first,
            accessor: self,
        }
    }
}

impl<HeadCell, Pool, MapLink, CellKey> ops::Deref for ListAccessor<'_, HeadCell, Pool, MapLink, CellKey> {
    type Target = Pool;

    fn deref(&self) -> &Self::Target {
        self.pool
    }
}

/// An iterator over the elements of a [`ListAccessor`].
pub struct Iter<'b, 'a, HeadCell, Pool, MapLink, CellKey, Index> {
    accessor: &'b ListAccessor<'a, HeadCell, Pool, MapLink, CellKey>,
    next: Option<Index>,
}

impl<'b, 'a, HeadCell, Index, Pool, MapLink, Element, LinkCell, CellKey> Iterator
    for Iter<'b, 'a, HeadCell, Pool, MapLink, CellKey, Index>
where
    HeadCell: CellLike<CellKey, Target = ListHead<Index>>,
    Pool: ops::Index<Index, Output = Element>,
    MapLink: Fn(&Element) -> &LinkCell,
    Element: 'a,
    LinkCell: CellLike<CellKey, Target = Option<Link<Index>>>,
    Index: PartialEq + Clone,
{
    type Item = (Index, &'a Element);

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next.take()?;
        self.next = self
            .accessor
            .next(current.clone())
            .unwrap_or_else(|_| inconsistent());
        let pool: &'a Pool = self.accessor.pool;
        Some((current.clone(), &pool[current]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn push<Element>(this: &mut Vec<Element>, x: Element) -> usize {
        let i = this.len();
        this.push(x);
        i
    }

    fn push_static<Element>(x: Element) -> Ident<&'static Element> {
        Ident(Box::leak(Box::new(x)))
    }

    #[test]
    fn push_and_remove() {
        let mut pool = Vec::new();
        let head = Cell::new(ListHead::new());

        macro_rules! accessor {
            () => {
                ListAccessor::new(&head, &pool, |(_, link)| link, ())
            };
        }

        let ptr1 = push(&mut pool, (1, Cell::new(None)));
        let ptr2 = push(&mut pool, (2, Cell::new(None)));
        let ptr3 = push(&mut pool, (3, Cell::new(None)));
        accessor!().push_back(ptr1).unwrap();
        accessor!().push_back(ptr2).unwrap();
        accessor!().push_front(ptr3).unwrap();

        let mut accessor = accessor!();
        assert!(!accessor.is_empty());
        assert_eq!(accessor.front(), Some(ptr3));
        assert_eq!(accessor.back(), Some(ptr2));
        assert_eq!(accessor.front_data().unwrap().0, 3);

        let items: Vec<_> = accessor.iter().map(|(_, (x, _))| *x).collect();
        assert_eq!(items, vec![3, 1, 2]);

        assert_eq!(accessor.push_back(ptr1), Err(AlreadyLinkedError));

        // Remove from the middle, then the ends
        accessor.remove(ptr1).unwrap();
        assert_eq!(accessor.remove(ptr1), Err(NotLinkedError));
        accessor.remove(ptr3).unwrap();
        assert_eq!(accessor.front(), Some(ptr2));
        accessor.remove(ptr2).unwrap();
        assert!(accessor.is_empty());
    }

    #[test]
    fn insert_before() {
        let mut pool = Vec::new();
        let head = Cell::new(ListHead::new());

        macro_rules! accessor {
            () => {
                ListAccessor::new(&head, &pool, |(_, link)| link, ())
            };
        }

        let ptrs: Vec<usize> = (0..4)
            .map(|i| push(&mut pool, (i, Cell::new(None))))
            .collect();

        accessor!().push_back(ptrs[0]).unwrap();
        accessor!().push_back(ptrs[2]).unwrap();
        accessor!().insert(ptrs[1], Some(ptrs[2])).unwrap();
        accessor!().insert(ptrs[3], Some(ptrs[0])).unwrap();

        let accessor = accessor!();
        let items: Vec<_> = accessor.iter().map(|(_, (x, _))| *x).collect();
        assert_eq!(items, vec![3, 0, 1, 2]);
    }

    #[test]
    fn pop_until_empty() {
        let mut pool = Vec::new();
        let head = Cell::new(ListHead::new());

        macro_rules! accessor {
            () => {
                ListAccessor::new(&head, &pool, |(_, link)| link, ())
            };
        }

        let ptrs = [
            push(&mut pool, (1, Cell::new(None))),
            push(&mut pool, (2, Cell::new(None))),
            push(&mut pool, (3, Cell::new(None))),
        ];

        for &ptr in &ptrs {
            accessor!().push_back(ptr).unwrap();
        }

        let mut popped = Vec::new();
        while let Some(ptr) = accessor!().pop_front() {
            popped.push(ptr);
        }

        assert_eq!(popped, ptrs);
        assert!(head.get().first.is_none());
        for &ptr in &ptrs {
            assert!(pool[ptr].1.get().is_none());
        }
    }

    #[test]
    fn static_neighbors() {
        #[derive(Debug)]
        struct El(u32, Cell<Option<Link<Ident<&'static El>>>>);

        let head = Cell::new(ListHead::<Ident<&'static El>>::new());

        macro_rules! accessor {
            () => {
                ListAccessor::new(&head, &Static, |El(_, link)| link, ())
            };
        }

        let ptr1 = push_static(El(1, Cell::new(None)));
        let ptr2 = push_static(El(2, Cell::new(None)));
        let ptr3 = push_static(El(3, Cell::new(None)));
        accessor!().push_back(ptr1).unwrap();
        accessor!().push_back(ptr2).unwrap();
        accessor!().push_front(ptr3).unwrap();

        let accessor = accessor!();
        assert_eq!(accessor.next(ptr3).unwrap(), Some(ptr1));
        assert_eq!(accessor.next(ptr1).unwrap(), Some(ptr2));
        assert_eq!(accessor.next(ptr2).unwrap(), None);
        assert_eq!(accessor.prev(ptr3).unwrap(), None);
        assert_eq!(accessor.prev(ptr1).unwrap(), Some(ptr3));
        assert_eq!(accessor.prev(ptr2).unwrap(), Some(ptr1));
    }
}
