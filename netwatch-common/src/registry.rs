/// Entries the kernel `MONITORED_IFS` map is created with.
pub const MONITORED_IFS_CAPACITY: u32 = 32;

/// Read side of the monitored-interface set, as seen from the hot paths.
///
/// Implementors only answer `lookup` for a positive index; `contains`
/// handles the "no interface" values before any lookup happens.
pub trait InterfaceRegistry {
    fn lookup(&self, ifindex: u32) -> bool;

    #[inline(always)]
    fn contains(&self, ifindex: i32) -> bool {
        if ifindex <= 0 {
            return false;
        }
        self.lookup(ifindex as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct Counting {
        members: &'static [u32],
        lookups: Cell<usize>,
    }

    impl InterfaceRegistry for Counting {
        fn lookup(&self, ifindex: u32) -> bool {
            self.lookups.set(self.lookups.get() + 1);
            self.members.contains(&ifindex)
        }
    }

    #[test]
    fn non_positive_indices_skip_lookup() {
        let reg = Counting { members: &[0, 3], lookups: Cell::new(0) };
        assert!(!reg.contains(0));
        assert!(!reg.contains(-1));
        assert!(!reg.contains(i32::MIN));
        assert_eq!(reg.lookups.get(), 0);
    }

    #[test]
    fn positive_indices_are_looked_up() {
        let reg = Counting { members: &[3], lookups: Cell::new(0) };
        assert!(reg.contains(3));
        assert!(!reg.contains(7));
        assert_eq!(reg.lookups.get(), 2);
    }
}
