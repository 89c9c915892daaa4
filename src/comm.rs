//! The message-passing seam between constraint construction and the host
//! application's communication layer.
//!
//! Constraint exchange only needs a narrow subset of an MPI-style interface:
//! rank/size queries, an all-to-all exchange of counts, an all-to-all exchange
//! of opaque payloads, a boolean AND-reduction for collective validation, and
//! a barrier. [`Communicator`] captures exactly that subset so that an MPI
//! binding can be adapted in a few lines by the host application.
//!
//! Two implementations are provided: [`SerialComm`] for single-rank runs and
//! [`LocalComm`], which runs one rank per thread in a single process. The
//! latter is what the test suite uses to exercise genuinely collective code
//! paths.

use crate::error::ConstraintError;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::mem;
use std::sync::{Arc, Barrier};

/// Collective communication primitives for one rank of an SPMD job.
///
/// All methods are collective: every rank of the communicator must call them
/// in the same order. The exchange methods take one send buffer per
/// destination rank (including the local rank, which simply receives its own
/// buffer back) and return one receive buffer per source rank.
pub trait Communicator {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Exchanges per-destination record counts so each rank can size its
    /// receive side before the payload exchange.
    fn all_to_all_counts(&self, send_counts: &[usize]) -> Result<Vec<usize>, ConstraintError>;

    /// Exchanges opaque payloads, one buffer per destination rank.
    fn all_to_all_bytes(&self, sends: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>, ConstraintError>;

    /// Logical AND over one boolean per rank. Used to turn a local validation
    /// failure into a whole-job abort.
    fn all_reduce_and(&self, value: bool) -> bool;

    /// Blocks until every rank has reached the barrier.
    fn barrier(&self);
}

/// Exchanges typed records with every rank in two phases: counts first, then
/// `bincode`-encoded payloads.
///
/// The decoded record count from each source is verified against the count
/// phase; a disagreement is a defect in message construction and is reported
/// as [`ConstraintError::CommunicationMismatch`].
pub fn exchange_records<C, M>(comm: &C, sends: &[Vec<M>]) -> Result<Vec<Vec<M>>, ConstraintError>
where
    C: Communicator + ?Sized,
    M: Serialize + DeserializeOwned,
{
    assert_eq!(sends.len(), comm.size(), "one send buffer per destination rank");

    let counts: Vec<usize> = sends.iter().map(Vec::len).collect();
    let recv_counts = comm.all_to_all_counts(&counts)?;

    let payloads = sends
        .iter()
        .map(|records| {
            bincode::serialize(records).map_err(|err| {
                ConstraintError::comm_mismatch(comm.rank(), format!("payload encoding failed: {err}"))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    let received = comm.all_to_all_bytes(payloads)?;

    let mut decoded = Vec::with_capacity(received.len());
    for (source, bytes) in received.into_iter().enumerate() {
        let records: Vec<M> = bincode::deserialize(&bytes).map_err(|err| {
            ConstraintError::comm_mismatch(source, format!("payload decoding failed: {err}"))
        })?;
        if records.len() != recv_counts[source] {
            return Err(ConstraintError::comm_mismatch(
                source,
                format!(
                    "count phase announced {} records, payload carried {}",
                    recv_counts[source],
                    records.len()
                ),
            ));
        }
        decoded.push(records);
    }
    Ok(decoded)
}

/// The trivial communicator for a single-rank job.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialComm;

impl Communicator for SerialComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn all_to_all_counts(&self, send_counts: &[usize]) -> Result<Vec<usize>, ConstraintError> {
        if send_counts.len() != 1 {
            return Err(ConstraintError::comm_mismatch(
                0,
                format!("expected 1 send count on a serial communicator, got {}", send_counts.len()),
            ));
        }
        Ok(send_counts.to_vec())
    }

    fn all_to_all_bytes(&self, sends: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>, ConstraintError> {
        if sends.len() != 1 {
            return Err(ConstraintError::comm_mismatch(
                0,
                format!("expected 1 send buffer on a serial communicator, got {}", sends.len()),
            ));
        }
        Ok(sends)
    }

    fn all_reduce_and(&self, value: bool) -> bool {
        value
    }

    fn barrier(&self) {}
}

/// An in-process communicator running one rank per thread.
///
/// [`LocalComm::create`] returns one handle per rank; each handle must be
/// moved to its own thread. Exchanges rendezvous twice per operation: once so
/// that every rank has deposited its outgoing buffers before anyone reads,
/// and once so that no rank starts the next operation while another is still
/// reading.
#[derive(Clone)]
pub struct LocalComm {
    rank: usize,
    shared: Arc<Mailboxes>,
}

struct Mailboxes {
    size: usize,
    barrier: Barrier,
    // Indexed as [destination][source].
    bytes: Mutex<Vec<Vec<Vec<u8>>>>,
    counts: Mutex<Vec<Vec<usize>>>,
    votes: Mutex<Vec<bool>>,
}

impl LocalComm {
    /// Creates communicator handles for `size` ranks sharing one mailbox set.
    pub fn create(size: usize) -> Vec<LocalComm> {
        assert!(size > 0, "communicator must have at least one rank");
        let shared = Arc::new(Mailboxes {
            size,
            barrier: Barrier::new(size),
            bytes: Mutex::new(vec![vec![Vec::new(); size]; size]),
            counts: Mutex::new(vec![vec![0; size]; size]),
            votes: Mutex::new(vec![true; size]),
        });
        (0..size)
            .map(|rank| LocalComm {
                rank,
                shared: Arc::clone(&shared),
            })
            .collect()
    }
}

impl Communicator for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn all_to_all_counts(&self, send_counts: &[usize]) -> Result<Vec<usize>, ConstraintError> {
        if send_counts.len() != self.shared.size {
            return Err(ConstraintError::comm_mismatch(
                self.rank,
                format!(
                    "expected {} send counts, got {}",
                    self.shared.size,
                    send_counts.len()
                ),
            ));
        }
        {
            let mut slots = self.shared.counts.lock();
            for (dest, &count) in send_counts.iter().enumerate() {
                slots[dest][self.rank] = count;
            }
        }
        self.shared.barrier.wait();
        let received = self.shared.counts.lock()[self.rank].clone();
        self.shared.barrier.wait();
        Ok(received)
    }

    fn all_to_all_bytes(&self, sends: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>, ConstraintError> {
        if sends.len() != self.shared.size {
            return Err(ConstraintError::comm_mismatch(
                self.rank,
                format!("expected {} send buffers, got {}", self.shared.size, sends.len()),
            ));
        }
        {
            let mut slots = self.shared.bytes.lock();
            for (dest, payload) in sends.into_iter().enumerate() {
                slots[dest][self.rank] = payload;
            }
        }
        self.shared.barrier.wait();
        let received = {
            let mut slots = self.shared.bytes.lock();
            slots[self.rank].iter_mut().map(mem::take).collect()
        };
        self.shared.barrier.wait();
        Ok(received)
    }

    fn all_reduce_and(&self, value: bool) -> bool {
        {
            self.shared.votes.lock()[self.rank] = value;
        }
        self.shared.barrier.wait();
        let verdict = self.shared.votes.lock().iter().all(|&vote| vote);
        self.shared.barrier.wait();
        verdict
    }

    fn barrier(&self) {
        self.shared.barrier.wait();
    }
}
