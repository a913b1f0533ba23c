// Copyright (c) nodesel contributors.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # NodeSet
//!
//! Bitmaps over node indices, the currency every selector plugin trades in.
//!
//! NodeSet
//! -------
//!
//! A NodeSet is a BitVec of u64's sized to the cluster's node count, along
//! with helpers for creating, combining, and scanning node index sets.
//!
//! Empty NodeSets can be created directly, or parsed from a hexadecimal
//! string or an index-list string:
//!
//!```
//!     use nodesel_utils::NodeSet;
//!     let none = NodeSet::new(64);
//!     let from_hex = NodeSet::from_str("0xf0", 64);
//!     let from_list = NodeSet::from_nodelist("0-3,9", 64);
//!```
//!
//! The hexadecimal form also accepts the special values "none" and "all".
//!
//! Unlike a CPU mask, a NodeSet's width is a property of the cluster being
//! scheduled, not of the host running the scheduler, so the width is carried
//! per instance. Combining two sets of different widths is a registry
//! corruption bug and panics.

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use bitvec::prelude::*;
use sscanf::sscanf;
use std::fmt;
use std::ops::BitAndAssign;
use std::ops::BitOrAssign;
use std::ops::BitXorAssign;

#[derive(Debug, Eq, Clone, Hash, Ord, PartialEq, PartialOrd)]
pub struct NodeSet {
    bits: BitVec<u64, Lsb0>,
}

impl NodeSet {
    fn check_node(&self, node: usize) -> Result<()> {
        if node >= self.bits.len() {
            bail!("Invalid node {} passed, max {}", node, self.bits.len());
        }

        Ok(())
    }

    fn check_width(&self, other: &NodeSet) {
        if self.bits.len() != other.bits.len() {
            panic!(
                "NodeSet width mismatch: {} vs {}",
                self.bits.len(),
                other.bits.len()
            );
        }
    }

    /// Build a new empty NodeSet spanning `nr_nodes` indices.
    pub fn new(nr_nodes: usize) -> NodeSet {
        NodeSet {
            bits: bitvec![u64, Lsb0; 0; nr_nodes],
        }
    }

    /// Build a NodeSet from a hexadecimal string, or "none" / "all".
    pub fn from_str(mask: &str, nr_nodes: usize) -> Result<NodeSet> {
        match mask {
            "none" => {
                return Ok(Self::new(nr_nodes));
            }
            "all" => {
                let mut set = Self::new(nr_nodes);
                set.set_all();
                return Ok(set);
            }
            _ => {}
        }
        let hex_str = {
            let mut tmp_str = mask.strip_prefix("0x").unwrap_or(mask).replace('_', "");
            if tmp_str.len() % 2 != 0 {
                tmp_str = "0".to_string() + &tmp_str;
            }
            tmp_str
        };
        let byte_vec =
            hex::decode(&hex_str).with_context(|| format!("Failed to parse node mask: {mask}"))?;

        let mut bits = bitvec![u64, Lsb0; 0; nr_nodes];
        for (index, &val) in byte_vec.iter().rev().enumerate() {
            let mut v = val;
            while v != 0 {
                let lsb = v.trailing_zeros() as usize;
                v &= !(1 << lsb);
                let node = index * 8 + lsb;
                if node >= nr_nodes {
                    bail!(
                        "Found node ({}) in mask ({}) beyond the cluster's node count ({})",
                        node,
                        mask,
                        nr_nodes
                    );
                }
                bits.set(node, true);
            }
        }

        Ok(Self { bits })
    }

    /// Build a NodeSet from an index-list string, e.g. "0-3,9".
    pub fn from_nodelist(nodelist: &str, nr_nodes: usize) -> Result<NodeSet> {
        let mut set = NodeSet::new(nr_nodes);
        for node in read_nodelist(nodelist)? {
            set.set_node(node)?;
        }

        Ok(set)
    }

    pub fn from_bitvec(bits: BitVec<u64, Lsb0>) -> Self {
        Self { bits }
    }

    /// Return a slice of u64's whose bits reflect the NodeSet.
    pub fn as_raw_slice(&self) -> &[u64] {
        self.bits.as_raw_slice()
    }

    /// Set all bits in the NodeSet to 1.
    pub fn set_all(&mut self) {
        self.bits.fill(true);
    }

    /// Set all bits in the NodeSet to 0.
    pub fn clear_all(&mut self) {
        self.bits.fill(false);
    }

    /// Set a bit in the NodeSet. Returns an error if the index exceeds the
    /// set's width.
    pub fn set_node(&mut self, node: usize) -> Result<()> {
        self.check_node(node)?;
        self.bits.set(node, true);
        Ok(())
    }

    /// Clear a bit from the NodeSet. Returns an error if the index exceeds
    /// the set's width.
    pub fn clear_node(&mut self, node: usize) -> Result<()> {
        self.check_node(node)?;
        self.bits.set(node, false);
        Ok(())
    }

    /// Test whether the specified node bit is set. Out-of-range indices
    /// test false.
    pub fn test_node(&self, node: usize) -> bool {
        match self.bits.get(node) {
            Some(bit) => *bit,
            None => false,
        }
    }

    /// Test whether every index in `[start, start + len)` is set.
    pub fn test_range(&self, start: usize, len: usize) -> bool {
        if start + len > self.bits.len() {
            return false;
        }
        (start..start + len).all(|node| self.bits[node])
    }

    /// Count the number of bits set.
    pub fn weight(&self) -> usize {
        self.bits.count_ones()
    }

    /// Return true if no bit is set.
    pub fn is_empty(&self) -> bool {
        self.bits.count_ones() == 0
    }

    /// Return true if every bit is set.
    pub fn is_full(&self) -> bool {
        self.bits.count_ones() == self.bits.len()
    }

    /// The width of the set in bits.
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    /// Lowest set index, if any.
    pub fn first_set(&self) -> Option<usize> {
        self.bits.first_one()
    }

    /// Lowest set index strictly greater than `node`, if any.
    pub fn next_set(&self, node: usize) -> Option<usize> {
        self.iter().find(|&n| n > node)
    }

    /// Test whether every bit of `other` is also set in `self`.
    pub fn is_superset(&self, other: &NodeSet) -> bool {
        self.check_width(other);
        other
            .bits
            .iter_ones()
            .all(|node| self.bits[node])
    }

    /// Create a NodeSet that is the negation of the current one.
    pub fn not(&self) -> NodeSet {
        let mut new = self.clone();
        new.bits = !new.bits;
        new
    }

    /// Create a NodeSet that is the AND of the current NodeSet and another.
    pub fn and(&self, other: &NodeSet) -> NodeSet {
        self.check_width(other);
        let mut new = self.clone();
        new.bits &= other.bits.clone();
        new
    }

    /// Create a NodeSet that is the OR of the current NodeSet and another.
    pub fn or(&self, other: &NodeSet) -> NodeSet {
        self.check_width(other);
        let mut new = self.clone();
        new.bits |= other.bits.clone();
        new
    }

    /// Create a NodeSet that is the XOR of the current NodeSet and another.
    pub fn xor(&self, other: &NodeSet) -> NodeSet {
        self.check_width(other);
        let mut new = self.clone();
        new.bits ^= other.bits.clone();
        new
    }

    /// Iterate the set indices in ascending order.
    pub fn iter(&self) -> NodeSetIterator<'_> {
        NodeSetIterator {
            set: self,
            index: 0,
        }
    }

    fn fmt_with(&self, f: &mut fmt::Formatter<'_>, case: char) -> fmt::Result {
        let mut masks: Vec<u32> = self
            .as_raw_slice()
            .iter()
            .flat_map(|x| [*x as u32, (x >> 32) as u32])
            .collect();

        // Throw out possible stray from u64 -> u32.
        masks.truncate(self.bits.len().div_ceil(32));

        // Print the highest 32bit. Trim digits beyond the set width.
        let width = match self.bits.len().div_ceil(4) % 8 {
            0 => 8,
            v => v,
        };
        match case {
            'x' => write!(f, "{:0width$x}", masks.pop().unwrap(), width = width)?,
            'X' => write!(f, "{:0width$X}", masks.pop().unwrap(), width = width)?,
            _ => unreachable!(),
        }

        // The rest in descending order.
        for submask in masks.iter().rev() {
            match case {
                'x' => write!(f, ",{submask:08x}")?,
                'X' => write!(f, ",{submask:08X}")?,
                _ => unreachable!(),
            }
        }
        Ok(())
    }
}

/// Parse an index-list string, e.g. "0-2,5", into the indices it names.
pub fn read_nodelist(nodelist: &str) -> Result<Vec<usize>> {
    let nodelist = nodelist.trim_end_matches('\0');
    let groups: Vec<&str> = nodelist.split(',').collect();
    let mut nodes = vec![];
    for group in groups.iter() {
        let (min, max) = match sscanf!(group.trim(), "{usize}-{usize}") {
            Ok((x, y)) => (x, y),
            Err(_) => match sscanf!(group.trim(), "{usize}") {
                Ok(x) => (x, x),
                Err(_) => {
                    bail!("Failed to parse nodelist {}", group.trim());
                }
            },
        };
        if max < min {
            bail!("Backward range {}-{} in nodelist", min, max);
        }
        for i in min..(max + 1) {
            nodes.push(i);
        }
    }

    Ok(nodes)
}

pub struct NodeSetIterator<'a> {
    set: &'a NodeSet,
    index: usize,
}

impl Iterator for NodeSetIterator<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        while self.index < self.set.len() {
            let index = self.index;
            self.index += 1;
            if self.set.test_node(index) {
                return Some(index);
            }
        }

        None
    }
}

impl fmt::Display for NodeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_with(f, 'x')
    }
}

impl fmt::LowerHex for NodeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_with(f, 'x')
    }
}

impl fmt::UpperHex for NodeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_with(f, 'X')
    }
}

impl BitAndAssign<&Self> for NodeSet {
    fn bitand_assign(&mut self, rhs: &Self) {
        self.check_width(rhs);
        self.bits &= &rhs.bits;
    }
}

impl BitOrAssign<&Self> for NodeSet {
    fn bitor_assign(&mut self, rhs: &Self) {
        self.check_width(rhs);
        self.bits |= &rhs.bits;
    }
}

impl BitXorAssign<&Self> for NodeSet {
    fn bitxor_assign(&mut self, rhs: &Self) {
        self.check_width(rhs);
        self.bits ^= &rhs.bits;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_roundtrip() {
        let set = NodeSet::from_str("0xf0", 32).unwrap();
        assert_eq!(set.weight(), 4);
        assert!(set.test_node(4) && set.test_node(7));
        assert!(!set.test_node(3) && !set.test_node(8));
        assert_eq!(format!("{}", set), "000000f0");
    }

    #[test]
    fn test_none_all() {
        assert!(NodeSet::from_str("none", 16).unwrap().is_empty());
        assert!(NodeSet::from_str("all", 16).unwrap().is_full());
    }

    #[test]
    fn test_out_of_range_bit_rejected() {
        assert!(NodeSet::from_str("0x100", 8).is_err());
    }

    #[test]
    fn test_nodelist() {
        let set = NodeSet::from_nodelist("0-3,9", 16).unwrap();
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0, 1, 2, 3, 9]);
        assert!(read_nodelist("7-4").is_err());
        assert!(read_nodelist("a-b").is_err());
    }

    #[test]
    fn test_range_and_scan() {
        let set = NodeSet::from_nodelist("2-5,8", 16).unwrap();
        assert!(set.test_range(2, 4));
        assert!(!set.test_range(2, 5));
        assert!(!set.test_range(14, 4));
        assert_eq!(set.first_set(), Some(2));
        assert_eq!(set.next_set(5), Some(8));
        assert_eq!(set.next_set(8), None);
    }

    #[test]
    fn test_superset() {
        let big = NodeSet::from_nodelist("0-7", 16).unwrap();
        let small = NodeSet::from_nodelist("2-4", 16).unwrap();
        assert!(big.is_superset(&small));
        assert!(!small.is_superset(&big));
        assert!(big.is_superset(&NodeSet::new(16)));
    }

    #[test]
    #[should_panic]
    fn test_width_mismatch_panics() {
        let a = NodeSet::new(16);
        let b = NodeSet::new(32);
        let _ = a.and(&b);
    }

    #[test]
    fn test_set_algebra() {
        let a = NodeSet::from_nodelist("0-3", 8).unwrap();
        let b = NodeSet::from_nodelist("2-5", 8).unwrap();
        assert_eq!(a.and(&b).iter().collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(a.or(&b).weight(), 6);
        assert_eq!(a.xor(&b).iter().collect::<Vec<_>>(), vec![0, 1, 4, 5]);
        assert_eq!(a.not().iter().collect::<Vec<_>>(), vec![4, 5, 6, 7]);
    }
}
