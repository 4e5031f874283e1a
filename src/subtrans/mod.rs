//! # Subtransaction Parent Map
//!
//! Maps a subtransaction XID to its immediate parent. Visibility checks walk
//! this map when a participant's subtransaction cache has overflowed. The
//! map is not preserved across restarts; recovery repopulates it from the
//! children recorded in each prepared transaction's state file.

use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::types::Xid;

#[derive(Debug, Default)]
pub struct SubtransMap {
    parents: RwLock<HashMap<Xid, Xid>>,
}

impl SubtransMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_parent(&self, child: Xid, parent: Xid) {
        self.parents.write().insert(child, parent);
    }

    pub fn parent_of(&self, child: Xid) -> Option<Xid> {
        self.parents.read().get(&child).copied()
    }

    /// Follow parent links to the top of the transaction tree.
    pub fn top_parent_of(&self, xid: Xid) -> Xid {
        let parents = self.parents.read();
        let mut current = xid;
        while let Some(&parent) = parents.get(&current) {
            current = parent;
        }
        current
    }
}
