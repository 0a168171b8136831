// SPDX-License-Identifier: Apache-2.0

//! The pending-batch pool behind BlockPublisher (spec.md §4.7): FIFO
//! ordering, TTL expiry, and high-water-mark backpressure, all behind one
//! lock since the pool is shared between client submission and block
//! assembly.

use ledger_types::Batch;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MempoolError {
    #[error("mempool is at its high water mark, reject and let the client retry")]
    PoolFull,
}

struct Entry {
    batch: Batch,
    received_at: Instant,
}

struct Inner {
    entries: VecDeque<Entry>,
}

/// Cloneable handle to the shared pending-batch pool.
pub struct Mempool {
    ttl: Duration,
    high_water_mark: usize,
    inner: Mutex<Inner>,
}

impl Mempool {
    pub fn new(ttl: Duration, high_water_mark: usize) -> Self {
        Self {
            ttl,
            high_water_mark,
            inner: Mutex::new(Inner { entries: VecDeque::new() }),
        }
    }

    /// Admits `batch` at the back of the pool. Rejects with `PoolFull` once
    /// the pool is at its configured high water mark (spec.md §4.7
    /// backpressure), rather than growing without bound.
    pub fn submit(&self, batch: Batch) -> Result<(), MempoolError> {
        let mut inner = self.inner.lock();
        self.evict_expired_locked(&mut inner);
        if inner.entries.len() >= self.high_water_mark {
            return Err(MempoolError::PoolFull);
        }
        inner.entries.push_back(Entry {
            batch,
            received_at: Instant::now(),
        });
        ledger_metrics::MEMPOOL_SIZE.with_label_values(&["pending"]).set(inner.entries.len() as i64);
        Ok(())
    }

    /// Pops the oldest non-expired batch, discarding any expired entries
    /// found ahead of it along the way.
    pub fn pop_oldest(&self) -> Option<Batch> {
        let mut inner = self.inner.lock();
        self.evict_expired_locked(&mut inner);
        let popped = inner.entries.pop_front().map(|e| e.batch);
        ledger_metrics::MEMPOOL_SIZE.with_label_values(&["pending"]).set(inner.entries.len() as i64);
        popped
    }

    /// Re-admits `batches` at the front of the pool, ahead of everything
    /// already waiting — used when a fork switch drops blocks and their
    /// batches need another chance at inclusion (spec.md §4.7). Resets
    /// each batch's TTL clock: it's being given a fresh shot, not treated
    /// as having sat in the pool since its original submission.
    pub fn requeue_front(&self, batches: Vec<Batch>) {
        let mut inner = self.inner.lock();
        for batch in batches.into_iter().rev() {
            inner.entries.push_front(Entry {
                batch,
                received_at: Instant::now(),
            });
        }
        ledger_metrics::MEMPOOL_SIZE.with_label_values(&["pending"]).set(inner.entries.len() as i64);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict_expired_locked(&self, inner: &mut Inner) {
        let ttl = self.ttl;
        let before = inner.entries.len();
        inner.entries.retain(|e| e.received_at.elapsed() < ttl);
        let expired = before - inner.entries.len();
        if expired > 0 {
            ledger_metrics::MEMPOOL_SIZE.with_label_values(&["expired"]).add(expired as i64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_crypto::PrivateKey;
    use ledger_types::{AddressPrefix, Transaction};

    fn sample_batch(signer: &PrivateKey, nonce: u64) -> Batch {
        let txn = Transaction::new_signed(
            "intkey",
            "1.0",
            vec![AddressPrefix::parse("aabbcc").unwrap()],
            vec![AddressPrefix::parse("aabbcc").unwrap()],
            vec![],
            b"payload".to_vec(),
            nonce,
            signer.public_key(),
            signer,
        );
        Batch::new_signed(vec![txn], false, signer)
    }

    #[test]
    fn pops_in_fifo_order() {
        let pool = Mempool::new(Duration::from_secs(60), 10);
        let signer = PrivateKey::generate();
        let first = sample_batch(&signer, 0);
        let second = sample_batch(&signer, 1);
        pool.submit(first.clone()).unwrap();
        pool.submit(second.clone()).unwrap();
        assert_eq!(pool.pop_oldest().unwrap().id(), first.id());
        assert_eq!(pool.pop_oldest().unwrap().id(), second.id());
        assert!(pool.pop_oldest().is_none());
    }

    #[test]
    fn rejects_once_at_the_high_water_mark() {
        let pool = Mempool::new(Duration::from_secs(60), 1);
        let signer = PrivateKey::generate();
        pool.submit(sample_batch(&signer, 0)).unwrap();
        assert_eq!(pool.submit(sample_batch(&signer, 1)), Err(MempoolError::PoolFull));
    }

    #[test]
    fn expired_entries_are_dropped_rather_than_returned() {
        let pool = Mempool::new(Duration::from_millis(5), 10);
        let signer = PrivateKey::generate();
        pool.submit(sample_batch(&signer, 0)).unwrap();
        std::thread::sleep(Duration::from_millis(15));
        assert!(pool.pop_oldest().is_none());
    }

    #[test]
    fn requeue_front_takes_priority_over_existing_entries() {
        let pool = Mempool::new(Duration::from_secs(60), 10);
        let signer = PrivateKey::generate();
        let queued = sample_batch(&signer, 0);
        let requeued = sample_batch(&signer, 1);
        pool.submit(queued.clone()).unwrap();
        pool.requeue_front(vec![requeued.clone()]);
        assert_eq!(pool.pop_oldest().unwrap().id(), requeued.id());
        assert_eq!(pool.pop_oldest().unwrap().id(), queued.id());
    }
}
