//! Setlist nodes: a sorted list of branch bytes with a parallel id array.
//!
//! ```text
//!  keys: [u8; capacity]     the first num_branches are live, ascending
//!  ids:  [id; capacity]
//! ```

use super::inner::{body_offset, num_branches, Branches};
use super::NodeHeader;
use crate::address::{IdAddress, PACKED_ID_SIZE};

#[derive(Clone, Copy)]
pub struct SetlistNode<'a> {
    bytes: &'a [u8],
}

impl<'a> SetlistNode<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        SetlistNode { bytes }
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    fn parts(&self) -> (&'a [u8], &'a [u8]) {
        let cap = NodeHeader::new(self.bytes).branch_capacity();
        let n = num_branches(self.bytes);
        let body = &self.bytes[body_offset(self.bytes)..];
        (&body[..n], &body[cap..])
    }
}

fn id_at(ids: &[u8], slot: usize) -> IdAddress {
    IdAddress::read_from(&ids[slot * PACKED_ID_SIZE..])
}

impl<'a> Branches for SetlistNode<'a> {
    fn get_branch(&self, byte: u8) -> Option<IdAddress> {
        let (keys, ids) = self.parts();
        keys.binary_search(&byte).ok().map(|slot| id_at(ids, slot))
    }

    fn next_branch(&self, from: u16) -> Option<(u8, IdAddress)> {
        let (keys, ids) = self.parts();
        let slot = keys.partition_point(|k| (*k as u16) < from);
        keys.get(slot).map(|k| (*k, id_at(ids, slot)))
    }

    fn prev_branch(&self, before: u16) -> Option<(u8, IdAddress)> {
        let (keys, ids) = self.parts();
        let slot = keys.partition_point(|k| (*k as u16) < before).checked_sub(1)?;
        Some((keys[slot], id_at(ids, slot)))
    }

    fn for_each_branch(&self, f: &mut dyn FnMut(u8, IdAddress)) {
        let (keys, ids) = self.parts();
        for (slot, k) in keys.iter().enumerate() {
            f(*k, id_at(ids, slot));
        }
    }
}

pub(crate) fn body_size(capacity: usize) -> usize {
    capacity * (1 + PACKED_ID_SIZE)
}

pub(crate) fn write_body(body: &mut [u8], capacity: usize, branches: &[(u8, IdAddress)]) {
    body.fill(0);
    let (keys, ids) = body.split_at_mut(capacity);
    for (slot, (byte, id)) in branches.iter().enumerate() {
        keys[slot] = *byte;
        id.write_to(&mut ids[slot * PACKED_ID_SIZE..]);
    }
}

pub(crate) fn set_branch(body: &mut [u8], capacity: usize, n: usize, byte: u8, id: IdAddress) -> bool {
    let (keys, ids) = body.split_at_mut(capacity);
    match keys[..n].binary_search(&byte) {
        Ok(slot) => {
            id.write_to(&mut ids[slot * PACKED_ID_SIZE..]);
            true
        }
        Err(_) => false,
    }
}

pub(crate) fn add_branch(body: &mut [u8], capacity: usize, n: usize, byte: u8, id: IdAddress) -> bool {
    if n >= capacity {
        return false;
    }
    let (keys, ids) = body.split_at_mut(capacity);
    let slot = match keys[..n].binary_search(&byte) {
        Ok(_) => return false,
        Err(slot) => slot,
    };
    keys.copy_within(slot..n, slot + 1);
    keys[slot] = byte;
    ids.copy_within(
        slot * PACKED_ID_SIZE..n * PACKED_ID_SIZE,
        (slot + 1) * PACKED_ID_SIZE,
    );
    id.write_to(&mut ids[slot * PACKED_ID_SIZE..]);
    true
}

pub(crate) fn remove_branch(body: &mut [u8], capacity: usize, n: usize, byte: u8) -> bool {
    let (keys, ids) = body.split_at_mut(capacity);
    let slot = match keys[..n].binary_search(&byte) {
        Ok(slot) => slot,
        Err(_) => return false,
    };
    keys.copy_within(slot + 1..n, slot);
    keys[n - 1] = 0;
    ids.copy_within(
        (slot + 1) * PACKED_ID_SIZE..n * PACKED_ID_SIZE,
        slot * PACKED_ID_SIZE,
    );
    IdAddress::NULL.write_to(&mut ids[(n - 1) * PACKED_ID_SIZE..]);
    true
}

pub(crate) fn is_well_formed(body: &[u8], capacity: usize, n: usize) -> bool {
    if n > capacity || body.len() < body_size(capacity) {
        return false;
    }
    body[..n].windows(2).all(|w| w[0] < w[1])
}
