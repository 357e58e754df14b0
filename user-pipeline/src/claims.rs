//! Partition claims held by this consumer.
//!
//! Every assignment from the group coordinator opens a new generation. Setting
//! up a generation creates a bounded queue and a cancellation token for each
//! newly claimed partition and announces the claim to the pipeline, which
//! spawns a worker for it. Setup for a generation runs at most once and ends by
//! publishing the generation on a watch channel, so readiness is signalled
//! exactly once per rebalance however often the callback fires.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, info, warn};

use crate::metrics_consts::CLAIMED_PARTITIONS;
use crate::source::Delivery;
use crate::types::Partition;

pub type Generation = u64;

#[derive(Debug, Clone)]
pub struct Claim {
    partition: Partition,
    generation: Generation,
    token: CancellationToken,
}

impl Claim {
    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Resolves when the claim is revoked or the pipeline shuts down
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }
}

/// A new claim and the consuming end of its queue, handed to the pipeline.
#[derive(Debug)]
pub struct ClaimedPartition<T> {
    pub claim: Claim,
    pub receiver: mpsc::Receiver<Delivery<T>>,
}

struct ActiveClaim<T> {
    claim: Claim,
    sender: mpsc::Sender<Delivery<T>>,
}

pub struct ClaimRegistry<T> {
    queue_capacity: usize,
    shutdown: CancellationToken,
    claims: DashMap<Partition, ActiveClaim<T>>,
    latest_generation: AtomicU64,
    // Held across a whole setup so concurrent callers can't set up a generation twice
    setup_lock: Mutex<Generation>,
    ready: watch::Sender<Generation>,
    claimed_tx: mpsc::UnboundedSender<ClaimedPartition<T>>,
}

impl<T> ClaimRegistry<T> {
    /// Claim tokens are children of `shutdown`, cancelling it cancels every claim.
    pub fn new(
        queue_capacity: usize,
        shutdown: CancellationToken,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ClaimedPartition<T>>) {
        let (claimed_tx, claimed_rx) = mpsc::unbounded_channel();
        let (ready, _) = watch::channel(0);
        let registry = Self {
            queue_capacity: queue_capacity.max(1),
            shutdown,
            claims: DashMap::new(),
            latest_generation: AtomicU64::new(0),
            setup_lock: Mutex::new(0),
            ready,
            claimed_tx,
        };
        (Arc::new(registry), claimed_rx)
    }

    /// Opens the next generation with the given assignment and returns it.
    pub fn setup(&self, partitions: &[Partition]) -> Generation {
        let generation = self.latest_generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.setup_generation(generation, partitions);
        generation
    }

    /// Sets up a specific generation. Returns false, changing nothing, if this
    /// or a later generation was already set up.
    pub fn setup_generation(&self, generation: Generation, partitions: &[Partition]) -> bool {
        let mut last_setup = match self.setup_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *last_setup >= generation {
            debug!(generation, "claims already set up for generation");
            return false;
        }

        self.latest_generation.fetch_max(generation, Ordering::SeqCst);
        for partition in partitions {
            self.claim(partition.clone(), generation);
        }
        *last_setup = generation;
        self.report_claimed();

        self.ready.send_if_modified(|ready| {
            if *ready < generation {
                *ready = generation;
                true
            } else {
                false
            }
        });
        info!(
            generation,
            partitions = partitions.len(),
            "partition claims ready"
        );
        true
    }

    /// Returns the queue for a partition. A partition we hold no claim for is
    /// claimed under the current generation so its messages still get a worker.
    pub fn sender_or_claim(&self, partition: &Partition) -> mpsc::Sender<Delivery<T>> {
        if let Some(active) = self.claims.get(partition) {
            return active.sender.clone();
        }
        warn!(%partition, "message for a partition without a claim, claiming it");
        let sender = self.claim(partition.clone(), self.current_generation());
        self.report_claimed();
        sender
    }

    /// Cancels and forgets the claims for the given partitions. Their workers
    /// drain what is already queued, flush, and exit.
    pub fn revoke(&self, partitions: &[Partition]) -> usize {
        let mut revoked = 0;
        for partition in partitions {
            if let Some((_, active)) = self.claims.remove(partition) {
                active.claim.token.cancel();
                revoked += 1;
            }
        }
        self.report_claimed();
        revoked
    }

    /// Drops every queue sender without cancelling. Workers finish their queue
    /// and exit once it is empty.
    pub fn close_all(&self) {
        self.claims.clear();
        self.report_claimed();
    }

    pub fn claimed_partitions(&self) -> Vec<Partition> {
        let mut partitions: Vec<_> = self.claims.iter().map(|e| e.key().clone()).collect();
        partitions.sort();
        partitions
    }

    pub fn current_generation(&self) -> Generation {
        self.latest_generation.load(Ordering::SeqCst)
    }

    /// Last generation whose setup completed, 0 before the first assignment
    pub fn ready_generation(&self) -> Generation {
        *self.ready.borrow()
    }

    pub fn subscribe_ready(&self) -> watch::Receiver<Generation> {
        self.ready.subscribe()
    }

    /// Waits until at least `generation` has been set up.
    pub async fn wait_ready(&self, generation: Generation) {
        let mut ready = self.ready.subscribe();
        if ready.wait_for(|ready| *ready >= generation).await.is_err() {
            warn!(generation, "claim registry dropped while waiting for readiness");
        }
    }

    fn claim(&self, partition: Partition, generation: Generation) -> mpsc::Sender<Delivery<T>> {
        match self.claims.entry(partition.clone()) {
            Entry::Occupied(existing) => {
                debug!(%partition, generation, "partition is still claimed, keeping it");
                existing.get().sender.clone()
            }
            Entry::Vacant(vacant) => {
                let (sender, receiver) = mpsc::channel(self.queue_capacity);
                let claim = Claim {
                    partition,
                    generation,
                    token: self.shutdown.child_token(),
                };
                if self
                    .claimed_tx
                    .send(ClaimedPartition {
                        claim: claim.clone(),
                        receiver,
                    })
                    .is_err()
                {
                    warn!(partition = %claim.partition, "no pipeline is listening for new claims");
                }
                vacant.insert(ActiveClaim {
                    claim,
                    sender: sender.clone(),
                });
                sender
            }
        }
    }

    fn report_claimed(&self) {
        metrics::gauge!(CLAIMED_PARTITIONS).set(self.claims.len() as f64);
    }
}
