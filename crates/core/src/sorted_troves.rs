//! NICR-ordered position registry.
//!
//! Per collateral asset, a doubly linked list of position identifiers kept
//! in descending nominal-collateralization-ratio order. Nodes store the
//! NICR supplied at insertion so hint validation never calls back into the
//! ledger. Inserts take optional neighbor hints; valid hints make the
//! operation O(1), stale or missing hints degrade to a bounded linear walk
//! from the nearest anchor.
//!
//! The list is pure bookkeeping: it holds identifiers and ordering keys,
//! never balances.

use std::collections::HashMap;

use alloy::primitives::{Address, U256};

use crate::error::{LedgerError, LedgerResult};

/// Optional neighbor hints bracketing an insertion point.
#[derive(Debug, Clone, Copy, Default)]
pub struct InsertHints {
    /// Proposed predecessor (closer to head, higher NICR).
    pub prev: Option<Address>,
    /// Proposed successor (closer to tail, lower NICR).
    pub next: Option<Address>,
}

impl InsertHints {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn between(prev: Option<Address>, next: Option<Address>) -> Self {
        Self { prev, next }
    }
}

#[derive(Debug, Clone)]
struct Node {
    prev: Option<Address>,
    next: Option<Address>,
    nicr: U256,
}

#[derive(Debug, Clone, Default)]
struct TroveList {
    head: Option<Address>,
    tail: Option<Address>,
    nodes: HashMap<Address, Node>,
}

impl TroveList {
    fn nicr_of(&self, id: Address) -> Option<U256> {
        self.nodes.get(&id).map(|node| node.nicr)
    }

    /// Liquity-style position check: the pair must be adjacent and must
    /// bracket `nicr` in descending order.
    fn valid_position(&self, nicr: U256, prev: Option<Address>, next: Option<Address>) -> bool {
        match (prev, next) {
            (None, None) => self.head.is_none(),
            (None, Some(n)) => {
                self.head == Some(n) && self.nicr_of(n).is_some_and(|next_nicr| nicr >= next_nicr)
            }
            (Some(p), None) => {
                self.tail == Some(p) && self.nicr_of(p).is_some_and(|prev_nicr| nicr <= prev_nicr)
            }
            (Some(p), Some(n)) => {
                let adjacent = self.nodes.get(&p).is_some_and(|node| node.next == Some(n));
                adjacent
                    && self.nicr_of(p).is_some_and(|prev_nicr| prev_nicr >= nicr)
                    && self.nicr_of(n).is_some_and(|next_nicr| nicr >= next_nicr)
            }
        }
    }

    /// Walk toward the tail from `start` until the bracket fits.
    fn descend(&self, nicr: U256, start: Address) -> (Option<Address>, Option<Address>) {
        if self.head == Some(start) && self.nicr_of(start).is_some_and(|head_nicr| nicr >= head_nicr)
        {
            return (None, Some(start));
        }

        let mut prev = Some(start);
        let mut next = self.nodes.get(&start).and_then(|node| node.next);
        while prev.is_some() && !self.valid_position(nicr, prev, next) {
            prev = prev.and_then(|p| self.nodes.get(&p)).and_then(|node| node.next);
            next = prev.and_then(|p| self.nodes.get(&p)).and_then(|node| node.next);
        }
        (prev, next)
    }

    /// Walk toward the head from `start` until the bracket fits.
    fn ascend(&self, nicr: U256, start: Address) -> (Option<Address>, Option<Address>) {
        if self.tail == Some(start) && self.nicr_of(start).is_some_and(|tail_nicr| nicr <= tail_nicr)
        {
            return (Some(start), None);
        }

        let mut next = Some(start);
        let mut prev = self.nodes.get(&start).and_then(|node| node.prev);
        while next.is_some() && !self.valid_position(nicr, prev, next) {
            next = next.and_then(|n| self.nodes.get(&n)).and_then(|node| node.prev);
            prev = next.and_then(|n| self.nodes.get(&n)).and_then(|node| node.prev);
        }
        (prev, next)
    }

    fn find_insert_position(
        &self,
        nicr: U256,
        hints: InsertHints,
    ) -> (Option<Address>, Option<Address>) {
        let mut prev = hints.prev;
        let mut next = hints.next;

        // Drop hints that no longer exist or sit on the wrong side.
        if let Some(p) = prev {
            match self.nicr_of(p) {
                Some(prev_nicr) if nicr <= prev_nicr => {}
                _ => prev = None,
            }
        }
        if let Some(n) = next {
            match self.nicr_of(n) {
                Some(next_nicr) if nicr >= next_nicr => {}
                _ => next = None,
            }
        }

        match (prev, next) {
            (None, None) => match self.head {
                Some(head) => self.descend(nicr, head),
                None => (None, None),
            },
            (None, Some(n)) => self.ascend(nicr, n),
            (Some(p), None) => self.descend(nicr, p),
            (Some(p), Some(_)) => self.descend(nicr, p),
        }
    }
}

/// Per-asset sorted registry of active positions.
#[derive(Debug, Clone)]
pub struct SortedTroves {
    lists: HashMap<Address, TroveList>,
    max_size: usize,
}

impl SortedTroves {
    pub fn new(max_size: usize) -> Self {
        Self {
            lists: HashMap::new(),
            max_size,
        }
    }

    /// Insert `id` with ordering key `nicr`, using `hints` when they hold.
    pub fn insert(
        &mut self,
        asset: Address,
        id: Address,
        nicr: U256,
        hints: InsertHints,
    ) -> LedgerResult<()> {
        if id == Address::ZERO {
            return Err(LedgerError::ZeroIdentifier);
        }
        if nicr.is_zero() {
            return Err(LedgerError::ZeroRatio);
        }
        if self.contains(asset, id) {
            return Err(LedgerError::DuplicateEntry);
        }
        if self.len(asset) >= self.max_size {
            return Err(LedgerError::RegistryFull);
        }

        let list = self.lists.entry(asset).or_default();
        let (prev, next) = list.find_insert_position(nicr, hints);

        list.nodes.insert(id, Node { prev, next, nicr });
        match (prev, next) {
            (None, None) => {
                list.head = Some(id);
                list.tail = Some(id);
            }
            (None, Some(n)) => {
                if let Some(node) = list.nodes.get_mut(&n) {
                    node.prev = Some(id);
                }
                list.head = Some(id);
            }
            (Some(p), None) => {
                if let Some(node) = list.nodes.get_mut(&p) {
                    node.next = Some(id);
                }
                list.tail = Some(id);
            }
            (Some(p), Some(n)) => {
                if let Some(node) = list.nodes.get_mut(&p) {
                    node.next = Some(id);
                }
                if let Some(node) = list.nodes.get_mut(&n) {
                    node.prev = Some(id);
                }
            }
        }
        Ok(())
    }

    /// Unlink `id`; O(1).
    pub fn remove(&mut self, asset: Address, id: Address) -> LedgerResult<()> {
        let list = self
            .lists
            .get_mut(&asset)
            .ok_or(LedgerError::MissingEntry)?;
        let node = list.nodes.remove(&id).ok_or(LedgerError::MissingEntry)?;

        match (node.prev, node.next) {
            (Some(p), Some(n)) => {
                if let Some(prev_node) = list.nodes.get_mut(&p) {
                    prev_node.next = Some(n);
                }
                if let Some(next_node) = list.nodes.get_mut(&n) {
                    next_node.prev = Some(p);
                }
            }
            (Some(p), None) => {
                if let Some(prev_node) = list.nodes.get_mut(&p) {
                    prev_node.next = None;
                }
                list.tail = Some(p);
            }
            (None, Some(n)) => {
                if let Some(next_node) = list.nodes.get_mut(&n) {
                    next_node.prev = None;
                }
                list.head = Some(n);
            }
            (None, None) => {
                list.head = None;
                list.tail = None;
            }
        }
        Ok(())
    }

    /// Move `id` to the slot matching `new_nicr`.
    pub fn re_insert(
        &mut self,
        asset: Address,
        id: Address,
        new_nicr: U256,
        hints: InsertHints,
    ) -> LedgerResult<()> {
        if !self.contains(asset, id) {
            return Err(LedgerError::MissingEntry);
        }
        if new_nicr.is_zero() {
            return Err(LedgerError::ZeroRatio);
        }
        self.remove(asset, id)?;
        self.insert(asset, id, new_nicr, hints)
    }

    pub fn contains(&self, asset: Address, id: Address) -> bool {
        self.lists
            .get(&asset)
            .is_some_and(|list| list.nodes.contains_key(&id))
    }

    pub fn len(&self, asset: Address) -> usize {
        self.lists.get(&asset).map_or(0, |list| list.nodes.len())
    }

    pub fn is_empty(&self, asset: Address) -> bool {
        self.len(asset) == 0
    }

    /// Highest-NICR identifier.
    pub fn first(&self, asset: Address) -> Option<Address> {
        self.lists.get(&asset).and_then(|list| list.head)
    }

    /// Lowest-NICR identifier.
    pub fn last(&self, asset: Address) -> Option<Address> {
        self.lists.get(&asset).and_then(|list| list.tail)
    }

    /// Neighbor toward the tail (next-lower NICR).
    pub fn next(&self, asset: Address, id: Address) -> Option<Address> {
        self.lists
            .get(&asset)
            .and_then(|list| list.nodes.get(&id))
            .and_then(|node| node.next)
    }

    /// Neighbor toward the head (next-higher NICR).
    pub fn prev(&self, asset: Address, id: Address) -> Option<Address> {
        self.lists
            .get(&asset)
            .and_then(|list| list.nodes.get(&id))
            .and_then(|node| node.prev)
    }

    /// Ordering key stored for `id`, if present.
    pub fn nicr_of(&self, asset: Address, id: Address) -> Option<U256> {
        self.lists.get(&asset).and_then(|list| list.nicr_of(id))
    }

    /// Whether `(prev, next)` brackets a valid slot for `nicr`.
    pub fn valid_insert_position(
        &self,
        asset: Address,
        nicr: U256,
        prev: Option<Address>,
        next: Option<Address>,
    ) -> bool {
        match self.lists.get(&asset) {
            Some(list) => list.valid_position(nicr, prev, next),
            None => prev.is_none() && next.is_none(),
        }
    }

    /// Head-to-tail walk (descending NICR).
    pub fn iter(&self, asset: Address) -> impl Iterator<Item = Address> + '_ {
        std::iter::successors(self.first(asset), move |id| self.next(asset, *id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ASSET: Address = Address::repeat_byte(0xAA);

    fn addr(n: u8) -> Address {
        Address::repeat_byte(n)
    }

    fn nicr(n: u64) -> U256 {
        U256::from(n) * U256::from(10u64).pow(U256::from(16u64))
    }

    fn assert_ordering(reg: &SortedTroves, asset: Address) {
        let ids: Vec<Address> = reg.iter(asset).collect();
        for pair in ids.windows(2) {
            let a = reg.nicr_of(asset, pair[0]).unwrap();
            let b = reg.nicr_of(asset, pair[1]).unwrap();
            assert!(a >= b, "registry out of order: {a} < {b}");
        }
    }

    #[test]
    fn test_insert_into_empty() {
        let mut reg = SortedTroves::new(10);
        reg.insert(ASSET, addr(1), nicr(150), InsertHints::none())
            .unwrap();
        assert_eq!(reg.first(ASSET), Some(addr(1)));
        assert_eq!(reg.last(ASSET), Some(addr(1)));
        assert_eq!(reg.len(ASSET), 1);
        assert!(reg.contains(ASSET, addr(1)));
    }

    #[test]
    fn test_insert_maintains_descending_order() {
        let mut reg = SortedTroves::new(10);
        reg.insert(ASSET, addr(1), nicr(150), InsertHints::none())
            .unwrap();
        reg.insert(ASSET, addr(2), nicr(300), InsertHints::none())
            .unwrap();
        reg.insert(ASSET, addr(3), nicr(200), InsertHints::none())
            .unwrap();
        reg.insert(ASSET, addr(4), nicr(100), InsertHints::none())
            .unwrap();

        let ids: Vec<Address> = reg.iter(ASSET).collect();
        assert_eq!(ids, vec![addr(2), addr(3), addr(1), addr(4)]);
        assert_ordering(&reg, ASSET);
    }

    #[test]
    fn test_insert_with_valid_hints() {
        let mut reg = SortedTroves::new(10);
        reg.insert(ASSET, addr(1), nicr(300), InsertHints::none())
            .unwrap();
        reg.insert(ASSET, addr(2), nicr(100), InsertHints::none())
            .unwrap();

        // 200 belongs exactly between the two
        let hints = InsertHints::between(Some(addr(1)), Some(addr(2)));
        reg.insert(ASSET, addr(3), nicr(200), hints).unwrap();
        assert_eq!(reg.next(ASSET, addr(1)), Some(addr(3)));
        assert_eq!(reg.prev(ASSET, addr(2)), Some(addr(3)));
    }

    #[test]
    fn test_insert_with_stale_hints_falls_back_to_walk() {
        let mut reg = SortedTroves::new(10);
        for (i, n) in [(1u8, 400u64), (2, 300), (3, 200), (4, 100)] {
            reg.insert(ASSET, addr(i), nicr(n), InsertHints::none())
                .unwrap();
        }

        // hints point at the wrong end of the list
        let hints = InsertHints::between(Some(addr(4)), Some(addr(1)));
        reg.insert(ASSET, addr(5), nicr(250), hints).unwrap();

        let ids: Vec<Address> = reg.iter(ASSET).collect();
        assert_eq!(ids, vec![addr(1), addr(2), addr(5), addr(3), addr(4)]);

        // hints referencing absent identifiers are ignored
        let hints = InsertHints::between(Some(addr(9)), Some(addr(8)));
        reg.insert(ASSET, addr(6), nicr(50), hints).unwrap();
        assert_eq!(reg.last(ASSET), Some(addr(6)));
        assert_ordering(&reg, ASSET);
    }

    #[test]
    fn test_equal_nicr_lands_before_first_equal() {
        let mut reg = SortedTroves::new(10);
        reg.insert(ASSET, addr(1), nicr(300), InsertHints::none())
            .unwrap();
        reg.insert(ASSET, addr(2), nicr(200), InsertHints::none())
            .unwrap();
        reg.insert(ASSET, addr(3), nicr(100), InsertHints::none())
            .unwrap();

        reg.insert(ASSET, addr(4), nicr(200), InsertHints::none())
            .unwrap();
        let ids: Vec<Address> = reg.iter(ASSET).collect();
        assert_eq!(ids, vec![addr(1), addr(4), addr(2), addr(3)]);
    }

    #[test]
    fn test_insert_rejects_bad_input() {
        let mut reg = SortedTroves::new(2);
        assert_eq!(
            reg.insert(ASSET, Address::ZERO, nicr(100), InsertHints::none()),
            Err(LedgerError::ZeroIdentifier)
        );
        assert_eq!(
            reg.insert(ASSET, addr(1), U256::ZERO, InsertHints::none()),
            Err(LedgerError::ZeroRatio)
        );

        reg.insert(ASSET, addr(1), nicr(100), InsertHints::none())
            .unwrap();
        assert_eq!(
            reg.insert(ASSET, addr(1), nicr(200), InsertHints::none()),
            Err(LedgerError::DuplicateEntry)
        );

        reg.insert(ASSET, addr(2), nicr(200), InsertHints::none())
            .unwrap();
        assert_eq!(
            reg.insert(ASSET, addr(3), nicr(300), InsertHints::none()),
            Err(LedgerError::RegistryFull)
        );
    }

    #[test]
    fn test_remove_relinks() {
        let mut reg = SortedTroves::new(10);
        for (i, n) in [(1u8, 300u64), (2, 200), (3, 100)] {
            reg.insert(ASSET, addr(i), nicr(n), InsertHints::none())
                .unwrap();
        }

        // middle
        reg.remove(ASSET, addr(2)).unwrap();
        assert_eq!(reg.next(ASSET, addr(1)), Some(addr(3)));
        assert_eq!(reg.prev(ASSET, addr(3)), Some(addr(1)));

        // head
        reg.remove(ASSET, addr(1)).unwrap();
        assert_eq!(reg.first(ASSET), Some(addr(3)));

        // last node
        reg.remove(ASSET, addr(3)).unwrap();
        assert!(reg.is_empty(ASSET));
        assert_eq!(reg.first(ASSET), None);
        assert_eq!(reg.last(ASSET), None);

        assert_eq!(reg.remove(ASSET, addr(3)), Err(LedgerError::MissingEntry));
    }

    #[test]
    fn test_re_insert_moves_node() {
        let mut reg = SortedTroves::new(10);
        for (i, n) in [(1u8, 300u64), (2, 200), (3, 100)] {
            reg.insert(ASSET, addr(i), nicr(n), InsertHints::none())
                .unwrap();
        }

        reg.re_insert(ASSET, addr(3), nicr(250), InsertHints::none())
            .unwrap();
        let ids: Vec<Address> = reg.iter(ASSET).collect();
        assert_eq!(ids, vec![addr(1), addr(3), addr(2)]);
        assert_eq!(reg.nicr_of(ASSET, addr(3)), Some(nicr(250)));

        assert_eq!(
            reg.re_insert(ASSET, addr(9), nicr(100), InsertHints::none()),
            Err(LedgerError::MissingEntry)
        );
    }

    #[test]
    fn test_assets_are_isolated() {
        let other = Address::repeat_byte(0xBB);
        let mut reg = SortedTroves::new(10);
        reg.insert(ASSET, addr(1), nicr(100), InsertHints::none())
            .unwrap();
        reg.insert(other, addr(1), nicr(200), InsertHints::none())
            .unwrap();

        assert_eq!(reg.len(ASSET), 1);
        assert_eq!(reg.len(other), 1);
        reg.remove(ASSET, addr(1)).unwrap();
        assert!(reg.is_empty(ASSET));
        assert!(reg.contains(other, addr(1)));
    }

    #[test]
    fn test_valid_insert_position() {
        let mut reg = SortedTroves::new(10);
        assert!(reg.valid_insert_position(ASSET, nicr(100), None, None));

        reg.insert(ASSET, addr(1), nicr(300), InsertHints::none())
            .unwrap();
        reg.insert(ASSET, addr(2), nicr(100), InsertHints::none())
            .unwrap();

        assert!(reg.valid_insert_position(ASSET, nicr(200), Some(addr(1)), Some(addr(2))));
        assert!(!reg.valid_insert_position(ASSET, nicr(400), Some(addr(1)), Some(addr(2))));
        assert!(reg.valid_insert_position(ASSET, nicr(400), None, Some(addr(1))));
        assert!(reg.valid_insert_position(ASSET, nicr(50), Some(addr(2)), None));
        assert!(!reg.valid_insert_position(ASSET, nicr(100), None, None));
    }
}
