//! Full nodes: a direct table of 256 ids, null for absent branches.

use super::inner::{body_offset, Branches};
use crate::address::{IdAddress, PACKED_ID_SIZE};

#[derive(Clone, Copy)]
pub struct FullNode<'a> {
    bytes: &'a [u8],
}

impl<'a> FullNode<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        FullNode { bytes }
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    fn ids(&self) -> &'a [u8] {
        &self.bytes[body_offset(self.bytes)..]
    }
}

fn id_at(ids: &[u8], byte: usize) -> IdAddress {
    IdAddress::read_from(&ids[byte * PACKED_ID_SIZE..])
}

impl<'a> Branches for FullNode<'a> {
    fn get_branch(&self, byte: u8) -> Option<IdAddress> {
        Some(id_at(self.ids(), byte as usize)).filter(IdAddress::is_valid)
    }

    fn next_branch(&self, from: u16) -> Option<(u8, IdAddress)> {
        let ids = self.ids();
        (from as usize..256)
            .map(|byte| (byte as u8, id_at(ids, byte)))
            .find(|(_, id)| id.is_valid())
    }

    fn prev_branch(&self, before: u16) -> Option<(u8, IdAddress)> {
        let ids = self.ids();
        (0..before as usize)
            .rev()
            .map(|byte| (byte as u8, id_at(ids, byte)))
            .find(|(_, id)| id.is_valid())
    }

    fn for_each_branch(&self, f: &mut dyn FnMut(u8, IdAddress)) {
        let ids = self.ids();
        for byte in 0..256 {
            let id = id_at(ids, byte);
            if id.is_valid() {
                f(byte as u8, id);
            }
        }
    }
}

pub(crate) fn body_size(_capacity: usize) -> usize {
    256 * PACKED_ID_SIZE
}

pub(crate) fn write_body(body: &mut [u8], branches: &[(u8, IdAddress)]) {
    body.fill(0);
    for (byte, id) in branches {
        id.write_to(&mut body[*byte as usize * PACKED_ID_SIZE..]);
    }
}

pub(crate) fn set_branch(body: &mut [u8], byte: u8, id: IdAddress) -> bool {
    let at = byte as usize * PACKED_ID_SIZE;
    if !IdAddress::read_from(&body[at..]).is_valid() {
        return false;
    }
    id.write_to(&mut body[at..]);
    true
}

pub(crate) fn add_branch(body: &mut [u8], byte: u8, id: IdAddress) -> bool {
    let at = byte as usize * PACKED_ID_SIZE;
    if IdAddress::read_from(&body[at..]).is_valid() {
        return false;
    }
    id.write_to(&mut body[at..]);
    true
}

pub(crate) fn remove_branch(body: &mut [u8], byte: u8) -> bool {
    let at = byte as usize * PACKED_ID_SIZE;
    if !IdAddress::read_from(&body[at..]).is_valid() {
        return false;
    }
    IdAddress::NULL.write_to(&mut body[at..]);
    true
}

pub(crate) fn is_well_formed(body: &[u8], n: usize) -> bool {
    if body.len() < body_size(256) {
        return false;
    }
    (0..256).filter(|byte| id_at(body, *byte).is_valid()).count() == n
}
