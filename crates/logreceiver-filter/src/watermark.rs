//! Per-host watermarks.
//!
//! A watermark is the highest entry ID a filter pass has examined for a
//! host. It only moves through [`WatermarkTable::compare_and_set`] against the
//! value the caller last read, so a slow scan can never move a watermark
//! back after a faster one advanced it: the first successful CAS wins.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
pub struct WatermarkTable {
    marks: Mutex<HashMap<IpAddr, i64>>,
}

impl WatermarkTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<IpAddr, i64>> {
        self.marks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `None` if the host has never been examined.
    pub fn get(&self, address: &IpAddr) -> Option<i64> {
        self.lock().get(address).copied()
    }

    /// Sets the watermark to `new` if it still equals `expected`.
    ///
    /// A `new` value below `expected` is refused as well.
    pub fn compare_and_set(&self, address: IpAddr, expected: Option<i64>, new: i64) -> bool {
        let mut marks = self.lock();
        if marks.get(&address).copied() != expected {
            return false;
        }
        if expected.map_or(false, |current| new < current) {
            return false;
        }
        marks.insert(address, new);
        true
    }

    pub fn remove(&self, address: &IpAddr) -> Option<i64> {
        self.lock().remove(address)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn addr() -> IpAddr {
        "10.0.0.1".parse().unwrap()
    }

    #[test]
    fn test_first_set_requires_absent() {
        let table = WatermarkTable::new();
        assert!(!table.compare_and_set(addr(), Some(0), 5));
        assert!(table.compare_and_set(addr(), None, 5));
        assert!(!table.compare_and_set(addr(), None, 7));
        assert_eq!(table.get(&addr()), Some(5));
    }

    #[test]
    fn test_stale_reader_cannot_regress() {
        let table = WatermarkTable::new();
        table.compare_and_set(addr(), None, 10);

        // Both scans read 10; the faster one advances to 30.
        assert!(table.compare_and_set(addr(), Some(10), 30));
        assert!(!table.compare_and_set(addr(), Some(10), 20));
        assert_eq!(table.get(&addr()), Some(30));

        assert!(!table.compare_and_set(addr(), Some(30), 25));
        assert_eq!(table.get(&addr()), Some(30));
    }

    #[test]
    fn test_concurrent_scans_are_monotonic() {
        let table = Arc::new(WatermarkTable::new());
        table.compare_and_set(addr(), None, 0);

        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let table = Arc::clone(&table);
                std::thread::spawn(move || {
                    let mut observed = Vec::new();
                    for step in 0..500 {
                        let current = table.get(&addr()).unwrap();
                        observed.push(current);
                        let target = current + 1 + (worker + step) % 3;
                        table.compare_and_set(addr(), Some(current), target);
                    }
                    observed
                })
            })
            .collect();

        for handle in handles {
            let observed = handle.join().unwrap();
            assert!(observed.windows(2).all(|w| w[0] <= w[1]));
        }
    }

    #[test]
    fn test_remove() {
        let table = WatermarkTable::new();
        table.compare_and_set(addr(), None, 3);
        assert_eq!(table.remove(&addr()), Some(3));
        assert!(table.is_empty());
    }
}
