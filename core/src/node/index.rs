//! Index nodes: a 256-entry byte to slot map in front of a compact id array.
//!
//! A map entry of 0 means the branch is absent; otherwise it holds the slot plus one. Slots
//! whose id is null are free.

use super::inner::{body_offset, Branches};
use super::NodeHeader;
use crate::address::{IdAddress, PACKED_ID_SIZE};

const MAP_SIZE: usize = 256;

#[derive(Clone, Copy)]
pub struct IndexNode<'a> {
    bytes: &'a [u8],
}

impl<'a> IndexNode<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        IndexNode { bytes }
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    fn parts(&self) -> (&'a [u8], &'a [u8]) {
        let cap = NodeHeader::new(self.bytes).branch_capacity();
        let body = &self.bytes[body_offset(self.bytes)..];
        let (map, ids) = body.split_at(MAP_SIZE);
        (map, &ids[..cap * PACKED_ID_SIZE])
    }
}

fn id_at(ids: &[u8], slot: usize) -> IdAddress {
    IdAddress::read_from(&ids[slot * PACKED_ID_SIZE..])
}

impl<'a> Branches for IndexNode<'a> {
    fn get_branch(&self, byte: u8) -> Option<IdAddress> {
        let (map, ids) = self.parts();
        match map[byte as usize] {
            0 => None,
            slot => Some(id_at(ids, slot as usize - 1)),
        }
    }

    fn next_branch(&self, from: u16) -> Option<(u8, IdAddress)> {
        let (map, ids) = self.parts();
        map[from as usize..]
            .iter()
            .position(|slot| *slot != 0)
            .map(|pos| {
                let byte = from as usize + pos;
                (byte as u8, id_at(ids, map[byte] as usize - 1))
            })
    }

    fn prev_branch(&self, before: u16) -> Option<(u8, IdAddress)> {
        let (map, ids) = self.parts();
        map[..before as usize]
            .iter()
            .rposition(|slot| *slot != 0)
            .map(|byte| (byte as u8, id_at(ids, map[byte] as usize - 1)))
    }

    fn for_each_branch(&self, f: &mut dyn FnMut(u8, IdAddress)) {
        let (map, ids) = self.parts();
        for (byte, slot) in map.iter().enumerate() {
            if *slot != 0 {
                f(byte as u8, id_at(ids, *slot as usize - 1));
            }
        }
    }
}

pub(crate) fn body_size(capacity: usize) -> usize {
    MAP_SIZE + capacity * PACKED_ID_SIZE
}

pub(crate) fn write_body(body: &mut [u8], capacity: usize, branches: &[(u8, IdAddress)]) {
    assert!(branches.len() <= capacity && capacity < 256);
    body.fill(0);
    let (map, ids) = body.split_at_mut(MAP_SIZE);
    for (slot, (byte, id)) in branches.iter().enumerate() {
        map[*byte as usize] = slot as u8 + 1;
        id.write_to(&mut ids[slot * PACKED_ID_SIZE..]);
    }
}

pub(crate) fn set_branch(body: &mut [u8], byte: u8, id: IdAddress) -> bool {
    let (map, ids) = body.split_at_mut(MAP_SIZE);
    match map[byte as usize] {
        0 => false,
        slot => {
            id.write_to(&mut ids[(slot as usize - 1) * PACKED_ID_SIZE..]);
            true
        }
    }
}

pub(crate) fn add_branch(body: &mut [u8], capacity: usize, byte: u8, id: IdAddress) -> bool {
    let (map, ids) = body.split_at_mut(MAP_SIZE);
    if map[byte as usize] != 0 {
        return false;
    }
    let free = (0..capacity).find(|slot| !id_at(ids, *slot).is_valid());
    match free {
        Some(slot) => {
            map[byte as usize] = slot as u8 + 1;
            id.write_to(&mut ids[slot * PACKED_ID_SIZE..]);
            true
        }
        None => false,
    }
}

pub(crate) fn remove_branch(body: &mut [u8], byte: u8) -> bool {
    let (map, ids) = body.split_at_mut(MAP_SIZE);
    match map[byte as usize] {
        0 => false,
        slot => {
            map[byte as usize] = 0;
            IdAddress::NULL.write_to(&mut ids[(slot as usize - 1) * PACKED_ID_SIZE..]);
            true
        }
    }
}

pub(crate) fn is_well_formed(body: &[u8], capacity: usize, n: usize) -> bool {
    if capacity >= 256 || n > capacity || body.len() < body_size(capacity) {
        return false;
    }
    let map = &body[..MAP_SIZE];
    let used = map.iter().filter(|slot| **slot != 0).count();
    used == n && map.iter().all(|slot| (*slot as usize) <= capacity)
}
