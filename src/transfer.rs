//! Move per-octant data from one partition of a forest to another.
//!
//! Both forests must describe the same octants in the same global order, cut
//! differently between processes. Every process receives the data for its
//! destination range and sends the data for its source range; the overlap of the
//! two ranges on the same process is copied locally.
//!
//! Transfers come in a blocking form over borrowed buffers and a split form:
//! `*_begin` takes ownership of both buffers, posts all messages and returns a
//! [`TransferContext`], and [`TransferContext::end`] waits for them and hands the
//! buffers back.

use std::cmp::{max, min};

use log::{debug, error, trace};
use mpi::{
    topology::{Rank, SimpleCommunicator},
    traits::*,
};

use crate::{
    comm::ProcessGroup,
    error::{ForestError, Result},
    forest::Forest,
    partition::Partition,
    request::RequestSet,
    types::{Gloidx, Tag},
};

/// Which communicator a transfer runs over.
#[derive(Clone, Copy, Debug)]
pub enum TransferComm<'a> {
    /// The source forest's communicator.
    Source,
    /// The destination forest's communicator.
    Destination,
    /// A private duplicate of the source forest's communicator.
    SourceDup,
    /// A private duplicate of the destination forest's communicator.
    DestinationDup,
    /// A communicator supplied by the caller.
    External(&'a SimpleCommunicator),
}

/// Lifecycle of a split transfer.
///
/// A context is created and posted inside `*_begin`, so callers first see it
/// `Posted`. [`TransferContext::wait`] moves it to `Completed`, and dropping or
/// ending the context frees it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferState {
    Posted,
    Completed,
}

/// A run of global indices `[first, last)` exchanged with one peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Overlap {
    pub peer: Rank,
    pub first: Gloidx,
    pub last: Gloidx,
}

impl Overlap {
    pub fn len(&self) -> Gloidx {
        self.last - self.first
    }

    pub fn is_empty(&self) -> bool {
        self.first == self.last
    }
}

/// Split the global range `[own_first, own_last)` into the pieces owned by each
/// process of `other`, in rank order. Empty pieces are left out.
pub fn transfer_schedule(
    own_first: Gloidx,
    own_last: Gloidx,
    other: &Partition,
    guess: Rank,
) -> Result<Vec<Overlap>> {
    if own_first >= own_last {
        return Ok(Vec::new());
    }
    if own_first < 0 || own_last > other.global_count() {
        return Err(ForestError::precondition(format!(
            "range {}..{} exceeds the {} octants of the other partition",
            own_first,
            own_last,
            other.global_count()
        )));
    }

    let counts = other.global_first_count();
    let num_procs = other.num_procs() as usize;

    let mut peer = other.find_owner_index(own_first, guess)? as usize;
    let mut schedule = Vec::new();

    while peer < num_procs && counts[peer] < own_last {
        let first = max(own_first, counts[peer]);
        let last = min(own_last, counts[peer + 1]);
        if first < last {
            schedule.push(Overlap {
                peer: peer as Rank,
                first,
                last,
            });
        }
        peer += 1;
    }

    Ok(schedule)
}

/// Byte layout of the per-octant data held by one process.
enum Layout {
    Fixed(usize),
    /// Prefix sums of per-octant sizes, one more entry than octants.
    Variable(Vec<usize>),
}

impl Layout {
    fn variable(sizes: &[usize]) -> Self {
        let mut offsets = Vec::with_capacity(sizes.len() + 1);
        let mut total = 0;
        offsets.push(0);
        for &size in sizes {
            total += size;
            offsets.push(total);
        }
        Layout::Variable(offsets)
    }

    /// Byte offset of the `local`-th octant.
    fn offset(&self, local: usize) -> usize {
        match self {
            Layout::Fixed(size) => local * size,
            Layout::Variable(offsets) => offsets[local],
        }
    }

    fn total(&self, num_octants: usize) -> usize {
        self.offset(num_octants)
    }
}

/// The partitions on both ends of a transfer.
struct Plan<'a> {
    rank: Rank,
    dest_partition: &'a Partition,
    src_partition: &'a Partition,
}

impl<'a> Plan<'a> {
    fn dest_octants(&self) -> Result<usize> {
        Ok(self.dest_partition.local_count(self.rank)? as usize)
    }

    fn src_octants(&self) -> Result<usize> {
        Ok(self.src_partition.local_count(self.rank)? as usize)
    }
}

/// Resolve the communicator for a transfer and check both partitions against it.
fn plan<'a>(
    dest: &'a Forest<'_>,
    src: &'a Forest<'_>,
    which: TransferComm<'a>,
) -> Result<(ProcessGroup<'a>, Plan<'a>)> {
    let dest_partition: &'a Partition = dest.partition()?;
    let src_partition: &'a Partition = src.partition()?;

    let group = match which {
        TransferComm::Source => ProcessGroup::borrowed(src.group().comm()?),
        TransferComm::Destination => ProcessGroup::borrowed(dest.group().comm()?),
        TransferComm::SourceDup => ProcessGroup::duplicate_of(src.group().comm()?),
        TransferComm::DestinationDup => ProcessGroup::duplicate_of(dest.group().comm()?),
        TransferComm::External(comm) => ProcessGroup::borrowed(comm),
    };

    let size = group.size()?;
    let rank = group.rank()?;

    for (name, partition) in [("destination", dest_partition), ("source", src_partition)] {
        if partition.num_procs() != size {
            return Err(ForestError::precondition(format!(
                "{} partition spans {} processes, transfer group has {}",
                name,
                partition.num_procs(),
                size
            )));
        }
    }
    for (name, forest) in [("destination", dest), ("source", src)] {
        if !forest.group().is_null() && forest.group().rank()? != rank {
            return Err(ForestError::precondition(format!(
                "{} forest is rank {} but transfer group is rank {}",
                name,
                forest.group().rank()?,
                rank
            )));
        }
    }
    if dest_partition.global_count() != src_partition.global_count() {
        return Err(ForestError::precondition(format!(
            "destination holds {} octants, source holds {}",
            dest_partition.global_count(),
            src_partition.global_count()
        )));
    }

    Ok((
        group,
        Plan {
            rank,
            dest_partition,
            src_partition,
        },
    ))
}

/// Post receives for the destination range, then sends for the source range,
/// and copy the part this process sends to itself.
///
/// Returns the number of posted receives and sends.
///
/// # Safety
///
/// `dest_data` and `src_data` must stay allocated, and must not be touched,
/// until both `recv` and `send` have been waited on.
#[allow(clippy::too_many_arguments)]
unsafe fn post_messages(
    recv: &mut RequestSet,
    send: &mut RequestSet,
    comm: &SimpleCommunicator,
    plan: &Plan<'_>,
    tag: Tag,
    dest_data: &mut [u8],
    dest_layout: &Layout,
    src_data: &[u8],
    src_layout: &Layout,
) -> Result<(usize, usize)> {
    let rank = plan.rank;

    let (dest_first, dest_last) = plan.dest_partition.local_range(rank)?;
    let (src_first, src_last) = plan.src_partition.local_range(rank)?;

    let receives = transfer_schedule(dest_first, dest_last, plan.src_partition, rank)?;
    let sends = transfer_schedule(src_first, src_last, plan.dest_partition, rank)?;

    let mut num_senders = 0;
    let mut num_receivers = 0;

    // Receive buffers are consecutive, disjoint pieces of the destination data.
    let mut rest: &mut [u8] = dest_data;
    let mut local_target: Option<&mut [u8]> = None;

    for overlap in &receives {
        let begin = dest_layout.offset((overlap.first - dest_first) as usize);
        let end = dest_layout.offset((overlap.last - dest_first) as usize);

        let (chunk, tail) = std::mem::take(&mut rest).split_at_mut(end - begin);
        rest = tail;

        if overlap.peer == rank {
            local_target = Some(chunk);
        } else if !chunk.is_empty() {
            recv.receive_into(comm, overlap.peer, tag, chunk)?;
            num_senders += 1;
        }
    }

    for overlap in &sends {
        let begin = src_layout.offset((overlap.first - src_first) as usize);
        let end = src_layout.offset((overlap.last - src_first) as usize);
        let chunk = &src_data[begin..end];

        if overlap.peer == rank {
            let target = local_target.take().ok_or_else(|| {
                ForestError::invariant(format!(
                    "rank {} sends {:?} to itself without a matching receive",
                    rank, overlap
                ))
            })?;
            if target.len() != chunk.len() {
                return Err(ForestError::precondition(format!(
                    "local copy of {:?} is {} bytes at the source, {} at the destination",
                    overlap,
                    chunk.len(),
                    target.len()
                )));
            }
            target.copy_from_slice(chunk);
            trace!("copied {} bytes locally", chunk.len());
        } else if !chunk.is_empty() {
            send.send(comm, overlap.peer, tag, chunk)?;
            num_receivers += 1;
        }
    }

    if local_target.is_some() {
        return Err(ForestError::invariant(format!(
            "rank {} receives from itself without a matching send",
            rank
        )));
    }

    debug!(
        "transfer posted: {} receives, {} sends on tag {}",
        num_senders, num_receivers, tag
    );
    Ok((num_senders, num_receivers))
}

/// Post every message of a transfer over borrowed buffers and wait for all of them.
fn run_blocking(
    group: &ProcessGroup<'_>,
    plan: &Plan<'_>,
    tag: Tag,
    dest_data: &mut [u8],
    dest_layout: &Layout,
    src_data: &[u8],
    src_layout: &Layout,
) -> Result<()> {
    let comm = group.comm()?;
    let mut recv = RequestSet::new();
    let mut send = RequestSet::new();

    // Both sets are local and are waited on, here or in their `Drop`, before the
    // borrows of the buffers end.
    unsafe {
        post_messages(
            &mut recv,
            &mut send,
            comm,
            plan,
            tag,
            dest_data,
            dest_layout,
            src_data,
            src_layout,
        )?;
    }

    recv.wait_all()?;
    send.wait_all()
}

/// Buffers handed back by a finished split transfer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransferBuffers {
    /// The data of every local octant of the destination.
    pub dest_data: Vec<u8>,
    /// The source data, unchanged.
    pub src_data: Vec<u8>,
}

/// Outstanding messages of a split transfer.
///
/// The context owns both data buffers while messages are in flight and hands
/// them back from [`TransferContext::end`]. Dropping a context that is still
/// posted waits for its messages first. A leaked context leaks its buffers
/// with it, so pending messages never see freed memory.
pub struct TransferContext<'a> {
    recv: RequestSet,
    send: RequestSet,
    group: ProcessGroup<'a>,
    dest_data: Vec<u8>,
    src_data: Vec<u8>,
    tag: Tag,
    state: TransferState,
    num_senders: usize,
    num_receivers: usize,
}

impl<'a> TransferContext<'a> {
    /// Take ownership of both buffers and post every message of the transfer.
    fn post(
        group: ProcessGroup<'a>,
        plan: &Plan<'_>,
        tag: Tag,
        dest_data: Vec<u8>,
        dest_layout: &Layout,
        src_data: Vec<u8>,
        src_layout: &Layout,
    ) -> Result<Self> {
        let mut context = TransferContext {
            recv: RequestSet::new(),
            send: RequestSet::new(),
            group,
            dest_data,
            src_data,
            tag,
            state: TransferState::Posted,
            num_senders: 0,
            num_receivers: 0,
        };

        let comm = context.group.comm()?;
        // The heap storage of both vectors is owned by the context and is not
        // touched again until `complete` has waited on every request.
        let (num_senders, num_receivers) = unsafe {
            post_messages(
                &mut context.recv,
                &mut context.send,
                comm,
                plan,
                tag,
                &mut context.dest_data,
                dest_layout,
                &context.src_data,
                src_layout,
            )?
        };
        context.num_senders = num_senders;
        context.num_receivers = num_receivers;

        Ok(context)
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn tag(&self) -> Tag {
        self.tag
    }

    /// Number of remote processes this process receives from.
    pub fn num_senders(&self) -> usize {
        self.num_senders
    }

    /// Number of remote processes this process sends to.
    pub fn num_receivers(&self) -> usize {
        self.num_receivers
    }

    /// Wait for every message of the transfer without giving up the context.
    pub fn wait(&mut self) -> Result<()> {
        self.complete()
    }

    /// Wait for every message of the transfer, release the context and hand
    /// back both buffers.
    pub fn end(mut self) -> Result<TransferBuffers> {
        self.complete()?;
        Ok(TransferBuffers {
            dest_data: std::mem::take(&mut self.dest_data),
            src_data: std::mem::take(&mut self.src_data),
        })
    }

    fn complete(&mut self) -> Result<()> {
        if self.state == TransferState::Posted {
            let received = self.recv.wait_all();
            let sent = self.send.wait_all();
            if let Err(err) = received.and(sent) {
                // Failed requests may still point into the buffers.
                std::mem::forget(std::mem::take(&mut self.dest_data));
                std::mem::forget(std::mem::take(&mut self.src_data));
                return Err(err);
            }
            self.state = TransferState::Completed;
            trace!("transfer on tag {} completed", self.tag);
        }
        self.group.free();
        Ok(())
    }
}

impl<'a> Drop for TransferContext<'a> {
    fn drop(&mut self) {
        if let Err(err) = self.complete() {
            error!("transfer failed while being dropped: {}", err);
        }
    }
}

fn check_len(what: &str, actual: usize, expected: usize) -> Result<()> {
    if actual != expected {
        return Err(ForestError::precondition(format!(
            "{} holds {}, expected {}",
            what, actual, expected
        )));
    }
    Ok(())
}

fn check_fixed_buffers(
    plan: &Plan<'_>,
    layout: &Layout,
    dest_len: usize,
    src_len: usize,
) -> Result<()> {
    check_len("destination buffer", dest_len, layout.total(plan.dest_octants()?))?;
    check_len("source buffer", src_len, layout.total(plan.src_octants()?))
}

/// Start moving `data_size` bytes per octant from `src` to `dest`.
///
/// `src_data` holds the data of every local octant of `src` in order. The
/// context takes both buffers, and [`TransferContext::end`] returns them with
/// `dest_data` filled with the data of every local octant of `dest`.
pub fn transfer_fixed_begin<'a>(
    dest: &'a Forest<'_>,
    src: &'a Forest<'_>,
    which: TransferComm<'a>,
    tag: Tag,
    dest_data: Vec<u8>,
    src_data: Vec<u8>,
    data_size: usize,
) -> Result<TransferContext<'a>> {
    let (group, plan) = plan(dest, src, which)?;
    let layout = Layout::Fixed(data_size);
    check_fixed_buffers(&plan, &layout, dest_data.len(), src_data.len())?;

    TransferContext::post(group, &plan, tag, dest_data, &layout, src_data, &layout)
}

/// Move `data_size` bytes per octant from `src` to `dest`. Collective.
pub fn transfer_fixed(
    dest: &Forest<'_>,
    src: &Forest<'_>,
    which: TransferComm<'_>,
    tag: Tag,
    dest_data: &mut [u8],
    src_data: &[u8],
    data_size: usize,
) -> Result<()> {
    let (group, plan) = plan(dest, src, which)?;
    let layout = Layout::Fixed(data_size);
    check_fixed_buffers(&plan, &layout, dest_data.len(), src_data.len())?;

    run_blocking(&group, &plan, tag, dest_data, &layout, src_data, &layout)
}

/// Send the per-octant sizes of `src` to the owners of those octants in `dest`.
/// Collective.
pub fn transfer_sizes(
    dest: &Forest<'_>,
    src: &Forest<'_>,
    which: TransferComm<'_>,
    tag: Tag,
    src_sizes: &[usize],
) -> Result<Vec<usize>> {
    const WIDTH: usize = std::mem::size_of::<u64>();

    let encoded: Vec<u8> = src_sizes
        .iter()
        .flat_map(|&size| (size as u64).to_le_bytes())
        .collect();

    let rank = match which {
        TransferComm::External(comm) => comm.rank(),
        TransferComm::Source | TransferComm::SourceDup => src.group().rank()?,
        TransferComm::Destination | TransferComm::DestinationDup => dest.group().rank()?,
    };
    let dest_octants = dest.partition()?.local_count(rank)? as usize;
    let mut received = vec![0u8; dest_octants * WIDTH];

    transfer_fixed(dest, src, which, tag, &mut received, &encoded, WIDTH)?;

    Ok(received
        .chunks_exact(WIDTH)
        .map(|bytes| {
            let mut word = [0u8; WIDTH];
            word.copy_from_slice(bytes);
            u64::from_le_bytes(word) as usize
        })
        .collect())
}

/// Layouts of both ends of a variable-size transfer, checked against the buffers.
fn variable_layouts(
    plan: &Plan<'_>,
    dest_len: usize,
    dest_sizes: &[usize],
    src_len: usize,
    src_sizes: &[usize],
) -> Result<(Layout, Layout)> {
    check_len("destination size table", dest_sizes.len(), plan.dest_octants()?)?;
    check_len("source size table", src_sizes.len(), plan.src_octants()?)?;

    let dest_layout = Layout::variable(dest_sizes);
    let src_layout = Layout::variable(src_sizes);

    check_len("destination buffer", dest_len, dest_layout.total(dest_sizes.len()))?;
    check_len("source buffer", src_len, src_layout.total(src_sizes.len()))?;

    Ok((dest_layout, src_layout))
}

/// Start moving variable-size per-octant data from `src` to `dest`.
///
/// Sizes must be known on both ends: `dest_sizes` has to agree with the
/// `src_sizes` of whichever process sends each octant, see [`transfer_sizes`].
/// The context takes both buffers and [`TransferContext::end`] returns them.
#[allow(clippy::too_many_arguments)]
pub fn transfer_variable_begin<'a>(
    dest: &'a Forest<'_>,
    src: &'a Forest<'_>,
    which: TransferComm<'a>,
    tag: Tag,
    dest_data: Vec<u8>,
    dest_sizes: &[usize],
    src_data: Vec<u8>,
    src_sizes: &[usize],
) -> Result<TransferContext<'a>> {
    let (group, plan) = plan(dest, src, which)?;
    let (dest_layout, src_layout) =
        variable_layouts(&plan, dest_data.len(), dest_sizes, src_data.len(), src_sizes)?;

    TransferContext::post(group, &plan, tag, dest_data, &dest_layout, src_data, &src_layout)
}

/// Data received by [`transfer_variable`]: the bytes of every local octant of
/// the destination, and the size of each.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VariablePayload {
    pub data: Vec<u8>,
    pub sizes: Vec<usize>,
}

/// Move variable-size per-octant data from `src` to `dest`, exchanging the sizes
/// first. Collective.
pub fn transfer_variable(
    dest: &Forest<'_>,
    src: &Forest<'_>,
    which: TransferComm<'_>,
    tag: Tag,
    src_data: &[u8],
    src_sizes: &[usize],
) -> Result<VariablePayload> {
    let sizes = transfer_sizes(dest, src, which, tag, src_sizes)?;
    let mut data = vec![0u8; sizes.iter().sum()];

    let (group, plan) = plan(dest, src, which)?;
    let (dest_layout, src_layout) =
        variable_layouts(&plan, data.len(), &sizes, src_data.len(), src_sizes)?;
    run_blocking(&group, &plan, tag, &mut data, &dest_layout, src_data, &src_layout)?;

    Ok(VariablePayload { data, sizes })
}
