//! Bitset nodes: a 256-bit presence map followed by one id per set bit, in byte order.

use bitvec::prelude::*;

use super::inner::{body_offset, num_branches, Branches};
use crate::address::{IdAddress, PACKED_ID_SIZE};

const MAP_SIZE: usize = 32;

#[derive(Clone, Copy)]
pub struct BitsetNode<'a> {
    bytes: &'a [u8],
}

impl<'a> BitsetNode<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        BitsetNode { bytes }
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    fn parts(&self) -> (&'a BitSlice<u8, Lsb0>, &'a [u8]) {
        let n = num_branches(self.bytes);
        let body = &self.bytes[body_offset(self.bytes)..];
        let (map, ids) = body.split_at(MAP_SIZE);
        (map.view_bits::<Lsb0>(), &ids[..n * PACKED_ID_SIZE])
    }
}

fn id_at(ids: &[u8], rank: usize) -> IdAddress {
    IdAddress::read_from(&ids[rank * PACKED_ID_SIZE..])
}

impl<'a> Branches for BitsetNode<'a> {
    fn get_branch(&self, byte: u8) -> Option<IdAddress> {
        let (map, ids) = self.parts();
        if !map[byte as usize] {
            return None;
        }
        Some(id_at(ids, map[..byte as usize].count_ones()))
    }

    fn next_branch(&self, from: u16) -> Option<(u8, IdAddress)> {
        let (map, ids) = self.parts();
        let from = from as usize;
        let byte = from + map[from..].first_one()?;
        Some((byte as u8, id_at(ids, map[..byte].count_ones())))
    }

    fn prev_branch(&self, before: u16) -> Option<(u8, IdAddress)> {
        let (map, ids) = self.parts();
        let byte = map[..before as usize].last_one()?;
        Some((byte as u8, id_at(ids, map[..byte].count_ones())))
    }

    fn for_each_branch(&self, f: &mut dyn FnMut(u8, IdAddress)) {
        let (map, ids) = self.parts();
        for (rank, byte) in map.iter_ones().enumerate() {
            f(byte as u8, id_at(ids, rank));
        }
    }
}

pub(crate) fn body_size(capacity: usize) -> usize {
    MAP_SIZE + capacity * PACKED_ID_SIZE
}

pub(crate) fn write_body(body: &mut [u8], branches: &[(u8, IdAddress)]) {
    body.fill(0);
    let (map, ids) = body.split_at_mut(MAP_SIZE);
    let map = map.view_bits_mut::<Lsb0>();
    for (rank, (byte, id)) in branches.iter().enumerate() {
        map.set(*byte as usize, true);
        id.write_to(&mut ids[rank * PACKED_ID_SIZE..]);
    }
}

pub(crate) fn set_branch(body: &mut [u8], byte: u8, id: IdAddress) -> bool {
    let (map, ids) = body.split_at_mut(MAP_SIZE);
    let map = map.view_bits::<Lsb0>();
    if !map[byte as usize] {
        return false;
    }
    let rank = map[..byte as usize].count_ones();
    id.write_to(&mut ids[rank * PACKED_ID_SIZE..]);
    true
}

pub(crate) fn remove_branch(body: &mut [u8], byte: u8) -> bool {
    let (map, ids) = body.split_at_mut(MAP_SIZE);
    let map = map.view_bits_mut::<Lsb0>();
    if !map[byte as usize] {
        return false;
    }
    let rank = map[..byte as usize].count_ones();
    let n = map.count_ones();
    map.set(byte as usize, false);
    ids.copy_within(
        (rank + 1) * PACKED_ID_SIZE..n * PACKED_ID_SIZE,
        rank * PACKED_ID_SIZE,
    );
    IdAddress::NULL.write_to(&mut ids[(n - 1) * PACKED_ID_SIZE..]);
    true
}

pub(crate) fn is_well_formed(body: &[u8], n: usize) -> bool {
    if body.len() < body_size(n) {
        return false;
    }
    body[..MAP_SIZE].view_bits::<Lsb0>().count_ones() == n
}
