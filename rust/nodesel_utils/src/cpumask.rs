// Copyright (c) nodesel contributors.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # CpuMask
//!
//! Per-node CPU bitmaps, and the external cpu-bind string grammar.
//!
//! A CpuMask is sized to a single node's CPU count. The task binding engine
//! builds one mask per task; the node daemon applies it when launching the
//! task.
//!
//! The bind-string grammar is an external contract:
//!
//! ```text
//! bind-list  := entry ("," entry)*
//! entry      := hex-mask | decimal-id
//! hex-mask   := "0x" [0-9a-fA-F]+        // little-endian bit order
//! decimal-id := [0-9]+
//! ```
//!
//! Task `t` picks entry `t mod len(bind-list)`. Bits naming CPUs beyond the
//! node's width are dropped here; whether a resulting empty or partial mask
//! is an error is the binding engine's call, since it depends on the job's
//! allocation.

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use bitvec::prelude::*;
use std::fmt;

#[derive(Debug, Eq, Clone, Hash, PartialEq)]
pub struct CpuMask {
    bits: BitVec<u64, Lsb0>,
}

impl CpuMask {
    /// Build a new empty CpuMask spanning `nr_cpus` bits.
    pub fn new(nr_cpus: usize) -> CpuMask {
        CpuMask {
            bits: bitvec![u64, Lsb0; 0; nr_cpus],
        }
    }

    /// Build a CpuMask with a single CPU set.
    pub fn single(cpu: usize, nr_cpus: usize) -> Result<CpuMask> {
        let mut mask = CpuMask::new(nr_cpus);
        mask.set_cpu(cpu)?;
        Ok(mask)
    }

    /// Parse a hex-mask bind entry ("0x" prefix optional) into a mask of
    /// width `nr_cpus`. Little-endian bit order: the least significant bit
    /// of the value is CPU 0. Bits beyond `nr_cpus` are dropped.
    pub fn from_hex(entry: &str, nr_cpus: usize) -> Result<CpuMask> {
        let hex_str = {
            let mut tmp_str = entry.strip_prefix("0x").unwrap_or(entry).replace('_', "");
            if tmp_str.is_empty() {
                bail!("Empty CPU mask entry");
            }
            if tmp_str.len() % 2 != 0 {
                tmp_str = "0".to_string() + &tmp_str;
            }
            tmp_str
        };
        let byte_vec = hex::decode(&hex_str)
            .with_context(|| format!("Failed to parse CPU mask entry: {entry}"))?;

        let mut bits = bitvec![u64, Lsb0; 0; nr_cpus];
        for (index, &val) in byte_vec.iter().rev().enumerate() {
            let mut v = val;
            while v != 0 {
                let lsb = v.trailing_zeros() as usize;
                v &= !(1 << lsb);
                let cpu = index * 8 + lsb;
                if cpu < nr_cpus {
                    bits.set(cpu, true);
                }
            }
        }

        Ok(Self { bits })
    }

    pub fn set_cpu(&mut self, cpu: usize) -> Result<()> {
        if cpu >= self.bits.len() {
            bail!("Invalid CPU {} passed, max {}", cpu, self.bits.len());
        }
        self.bits.set(cpu, true);
        Ok(())
    }

    pub fn clear_cpu(&mut self, cpu: usize) -> Result<()> {
        if cpu >= self.bits.len() {
            bail!("Invalid CPU {} passed, max {}", cpu, self.bits.len());
        }
        self.bits.set(cpu, false);
        Ok(())
    }

    /// Out-of-range CPUs test false.
    pub fn test_cpu(&self, cpu: usize) -> bool {
        match self.bits.get(cpu) {
            Some(bit) => *bit,
            None => false,
        }
    }

    pub fn weight(&self) -> usize {
        self.bits.count_ones()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.count_ones() == 0
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn set_all(&mut self) {
        self.bits.fill(true);
    }

    /// Iterate the set CPU ids in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter_ones()
    }

    pub fn and(&self, other: &CpuMask) -> CpuMask {
        let mut new = self.clone();
        new.bits &= other.bits.clone();
        new
    }

    pub fn or(&self, other: &CpuMask) -> CpuMask {
        let mut new = self.clone();
        new.bits |= other.bits.clone();
        new
    }

    /// Grow every set bit to cover its whole aligned group of `group_size`
    /// bits. With abstract CPU numbering, a group of `threads` bits is a
    /// core and a group of `cores * threads` bits is a socket, so this is
    /// how a thread-granular assignment coarsens to bind-to-cores or
    /// bind-to-sockets.
    pub fn widen_to_group(&self, group_size: usize) -> CpuMask {
        if group_size <= 1 {
            return self.clone();
        }
        let mut new = CpuMask::new(self.bits.len());
        for cpu in self.bits.iter_ones() {
            let base = (cpu / group_size) * group_size;
            for sibling in base..(base + group_size).min(self.bits.len()) {
                new.bits.set(sibling, true);
            }
        }
        new
    }

    /// Apply a permutation: bit `i` of self sets bit `map[i]` of the result.
    /// Used to translate a mask in abstract (config) numbering into the
    /// machine's physical numbering, and back through the inverse map.
    pub fn remap(&self, map: &[usize]) -> Result<CpuMask> {
        if map.len() != self.bits.len() {
            bail!(
                "CPU map has {} entries, mask is {} wide",
                map.len(),
                self.bits.len()
            );
        }
        let mut new = CpuMask::new(self.bits.len());
        for cpu in self.bits.iter_ones() {
            new.set_cpu(map[cpu])?;
        }
        Ok(new)
    }

    fn fmt_with(&self, f: &mut fmt::Formatter<'_>, case: char) -> fmt::Result {
        let mut masks: Vec<u32> = self
            .bits
            .as_raw_slice()
            .iter()
            .flat_map(|x| [*x as u32, (x >> 32) as u32])
            .collect();

        masks.truncate(self.bits.len().div_ceil(32));

        let width = match self.bits.len().div_ceil(4) % 8 {
            0 => 8,
            v => v,
        };
        match case {
            'x' => write!(f, "0x{:0width$x}", masks.pop().unwrap(), width = width)?,
            'X' => write!(f, "0x{:0width$X}", masks.pop().unwrap(), width = width)?,
            _ => unreachable!(),
        }

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

impl fmt::Display for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_with(f, 'x')
    }
}

/// Split a bind-list and return the entry task `task` selects, wrapping by
/// modulo. An empty list is malformed.
pub fn pick_bind_entry(bind_list: &str, task: usize) -> Result<&str> {
    let entries: Vec<&str> = bind_list
        .split(',')
        .map(|e| e.trim())
        .filter(|e| !e.is_empty())
        .collect();
    if entries.is_empty() {
        bail!("Empty cpu-bind list");
    }
    Ok(entries[task % entries.len()])
}

/// Parse a decimal-id bind entry.
pub fn parse_bind_id(entry: &str) -> Result<usize> {
    entry
        .parse::<usize>()
        .with_context(|| format!("Failed to parse CPU id entry: {entry}"))
}
