//! Minimal schema-object stand-in for the excluded B+-tree (spec §4.6,
//! §3, SPEC_FULL.md §B.4). `Tree` is the `T` versioned by
//! `TimelyResource<Tree>` in the engine's tree directory; it carries
//! enough identity (name, owning volume, root page) to exercise MVCC
//! create/replace/drop without implementing page-level tree traversal,
//! which spec §1 explicitly places out of scope.

use log::debug;

use crate::timely_resource::Prunable;
use crate::volume::PageAddress;

#[derive(Debug, Clone)]
pub struct Tree {
    pub name: String,
    pub volume_handle: i32,
    pub root_page: PageAddress,
    /// `true` once `remove_tree` has staged this version for deletion;
    /// kept distinct from "absent" so TimelyResource can still track it
    /// as a committed version that later prunes the live one away.
    pub dropped: bool,
}

impl Tree {
    pub fn new(name: &str, volume_handle: i32, root_page: PageAddress) -> Self {
        Tree {
            name: name.to_string(),
            volume_handle,
            root_page,
            dropped: false,
        }
    }

    pub fn dropped(name: &str, volume_handle: i32) -> Self {
        Tree {
            name: name.to_string(),
            volume_handle,
            root_page: 0,
            dropped: true,
        }
    }
}

impl Prunable for Tree {
    /// Real page deallocation for a dropped tree's page chain is part of
    /// the out-of-scope B+-tree; this stand-in only logs the event.
    fn prune(&self) {
        debug!(
            "pruning tree version '{}' (volume handle {}, root page {}, dropped={})",
            self.name, self.volume_handle, self.root_page, self.dropped
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_tree_is_not_dropped() {
        let t = Tree::new("accounts", 1, 7);
        assert_eq!(t.name, "accounts");
        assert_eq!(t.volume_handle, 1);
        assert_eq!(t.root_page, 7);
        assert!(!t.dropped);
    }

    #[test]
    fn dropped_tree_has_no_root_page() {
        let t = Tree::dropped("accounts", 1);
        assert!(t.dropped);
        assert_eq!(t.root_page, 0);
    }

    #[test]
    fn prune_does_not_panic() {
        Tree::new("t", 1, 0).prune();
        Tree::dropped("t", 1).prune();
    }
}
