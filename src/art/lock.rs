//! # Optimistic Version Lock
//!
//! Per-node synchronization: a 64-bit counter where bit 0 marks the node
//! obsolete, bit 1 marks it write-locked, and the remaining bits count
//! versions. Readers never block — they snapshot the version, read, and
//! revalidate; any change (unlock adds 2, obsoleting unlock adds 3) sends
//! the reader back to the root. The obsoleting unlock leaves bit 0 set
//! permanently, so a reader holding any stale version of a replaced node can
//! never revalidate successfully.
//!
//! ## Memory Ordering
//!
//! Version loads are `Acquire` and unlocks are `Release`, so a successful
//! revalidation orders every field read between them after the writer's
//! field writes. The write-lock upgrade is an `AcqRel` compare-exchange.
//! Node payload fields themselves are read `Relaxed`; the version protocol
//! decides whether the values may be used.

use super::node::NodeHeader;
use std::sync::atomic::Ordering;

const SPIN_COUNT: u32 = 30;

const LOCKED_BIT: u64 = 2;
const OBSOLETE_BIT: u64 = 1;

impl NodeHeader {
    /// Spins until the node is not write-locked and returns the observed
    /// version (which may carry the obsolete bit).
    pub(crate) fn wait_unlock(&self) -> u64 {
        let mut v = self.version.load(Ordering::Acquire);
        let mut budget = SPIN_COUNT;
        while v & LOCKED_BIT == LOCKED_BIT {
            if budget == 0 {
                std::thread::yield_now();
                budget = SPIN_COUNT;
            } else {
                budget -= 1;
                std::hint::spin_loop();
            }
            v = self.version.load(Ordering::Acquire);
        }
        v
    }

    /// Publishes a read-version, or `None` when the node is obsolete.
    pub(crate) fn read_lock(&self) -> Option<u64> {
        let v = self.wait_unlock();
        (v & OBSOLETE_BIT != OBSOLETE_BIT).then_some(v)
    }

    /// Revalidates a read: true iff nothing changed since `version`.
    pub(crate) fn read_unlock(&self, version: u64) -> bool {
        version == self.version.load(Ordering::Acquire)
    }

    /// Same check, releasing `locked` on failure.
    pub(crate) fn read_unlock_or_release(&self, version: u64, locked: &NodeHeader) -> bool {
        if version != self.version.load(Ordering::Acquire) {
            locked.write_unlock();
            return false;
        }
        true
    }

    /// Mid-read revalidation; identical to [`NodeHeader::read_unlock`].
    pub(crate) fn check(&self, version: u64) -> bool {
        self.read_unlock(version)
    }

    /// Upgrades a valid read-version to the write lock.
    pub(crate) fn upgrade_to_write(&self, version: u64) -> bool {
        self.version
            .compare_exchange(
                version,
                version + LOCKED_BIT,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Same upgrade, releasing `locked` on failure.
    pub(crate) fn upgrade_to_write_or_release(&self, version: u64, locked: &NodeHeader) -> bool {
        if !self.upgrade_to_write(version) {
            locked.write_unlock();
            return false;
        }
        true
    }

    /// Blocking write acquisition; fails only when the node went obsolete.
    pub(crate) fn write_lock(&self) -> bool {
        loop {
            match self.read_lock() {
                None => return false,
                Some(version) => {
                    if self.upgrade_to_write(version) {
                        return true;
                    }
                }
            }
        }
    }

    pub(crate) fn write_unlock(&self) {
        self.version.fetch_add(2, Ordering::Release);
    }

    /// Unlock that also marks the node replaced: +3 sets the obsolete bit,
    /// failing every outstanding and future revalidation.
    pub(crate) fn write_unlock_obsolete(&self) {
        self.version.fetch_add(3, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::super::node::NodeHeader;

    #[test]
    fn read_lock_returns_current_version() {
        let node = NodeHeader::dummy();
        let v = node.read_lock().unwrap();
        assert_eq!(v, 0);
        assert!(node.read_unlock(v));
    }

    #[test]
    fn write_cycle_bumps_version() {
        let node = NodeHeader::dummy();
        let v = node.read_lock().unwrap();

        assert!(node.upgrade_to_write(v));
        assert!(!node.read_unlock(v), "locked version fails validation");
        node.write_unlock();

        assert!(!node.read_unlock(v), "version advanced by 4 total");
        let v2 = node.read_lock().unwrap();
        assert_eq!(v2, v + 4);
    }

    #[test]
    fn failed_upgrade_leaves_version_intact() {
        let node = NodeHeader::dummy();
        let v = node.read_lock().unwrap();
        assert!(node.upgrade_to_write(v));
        assert!(!node.upgrade_to_write(v), "second CAS loses");
        node.write_unlock();
        assert!(node.read_lock().is_some());
    }

    #[test]
    fn obsolete_is_terminal() {
        let node = NodeHeader::dummy();
        let v = node.read_lock().unwrap();
        assert!(node.upgrade_to_write(v));
        node.write_unlock_obsolete();

        assert!(!node.read_unlock(v));
        assert!(node.read_lock().is_none(), "obsolete nodes reject readers");
        assert!(!node.write_lock(), "and writers");
    }

    #[test]
    fn release_helpers_unlock_on_failure() {
        let node = NodeHeader::dummy();
        let locked = NodeHeader::dummy();
        let lv = locked.read_lock().unwrap();
        assert!(locked.upgrade_to_write(lv));

        let v = node.read_lock().unwrap();
        let other = node.read_lock().unwrap();
        assert!(node.upgrade_to_write(other));
        node.write_unlock();

        // Stale version: the helper must release `locked` before failing.
        assert!(!node.upgrade_to_write_or_release(v, &locked));
        assert!(locked.read_lock().is_some(), "helper released the lock");
    }
}
