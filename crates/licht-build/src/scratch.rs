//! Pooled per-task scratch state to avoid realloc churn in workers.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_channel::{Receiver, Sender, bounded};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// Reusable buffers plus a task-local RNG. The RNG must be reseeded for each
/// task so output never depends on which pooled instance a worker drew.
pub struct Scratch {
    pub rng: ChaCha8Rng,
    pub direct: Vec<f32>,
    pub indirect: Vec<f32>,
}

impl Scratch {
    fn new() -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(0),
            direct: Vec::new(),
            indirect: Vec::new(),
        }
    }

    pub fn reseed(&mut self, seed: u64) {
        self.rng = ChaCha8Rng::seed_from_u64(seed);
    }

    pub fn reset(&mut self) {
        self.direct.clear();
        self.indirect.clear();
    }
}

pub struct ScratchPool {
    available_rx: Receiver<Box<Scratch>>,
    available_tx: Sender<Box<Scratch>>,
    allocated: AtomicUsize,
    max_size: usize,
}

impl ScratchPool {
    pub fn new(max_size: usize) -> Self {
        let cap = max_size.max(1);
        let (available_tx, available_rx) = bounded(cap);
        Self {
            available_rx,
            available_tx,
            allocated: AtomicUsize::new(0),
            max_size: cap,
        }
    }

    /// Twice the worker count keeps a spare per worker without letting the
    /// pool grow with scene size.
    pub fn with_capacity_from_workers(workers: usize) -> Self {
        Self::new(workers.max(1) * 2)
    }

    /// Grabs a free scratch, allocating up to the cap, then blocks until one
    /// is returned.
    pub fn acquire(&self) -> PooledScratch<'_> {
        if let Ok(scratch) = self.available_rx.try_recv() {
            return self.wrap(scratch);
        }
        let current = self.allocated.load(Ordering::Relaxed);
        if current < self.max_size
            && self
                .allocated
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        {
            return self.wrap(Box::new(Scratch::new()));
        }
        let scratch = self
            .available_rx
            .recv()
            .expect("scratch pool channel closed");
        self.wrap(scratch)
    }

    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    fn wrap(&self, mut scratch: Box<Scratch>) -> PooledScratch<'_> {
        scratch.reset();
        PooledScratch {
            scratch: Some(scratch),
            pool: self,
        }
    }
}

/// Scratch on loan from the pool; returns itself on drop.
pub struct PooledScratch<'a> {
    scratch: Option<Box<Scratch>>,
    pool: &'a ScratchPool,
}

impl<'a> Deref for PooledScratch<'a> {
    type Target = Scratch;

    fn deref(&self) -> &Self::Target {
        self.scratch.as_ref().expect("scratch taken")
    }
}

impl<'a> DerefMut for PooledScratch<'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.scratch.as_mut().expect("scratch taken")
    }
}

impl<'a> Drop for PooledScratch<'a> {
    fn drop(&mut self) {
        if let Some(scratch) = self.scratch.take() {
            let _ = self.pool.available_tx.send(scratch);
        }
    }
}
