//! MPI backed process group.

use mpi::{
    collective::UserOperation,
    traits::{CommunicatorCollectives, Destination, Root, Source},
};

use super::{Message, ProcessGroup, ReduceOp, Reducible};

/// A [ProcessGroup] over an MPI communicator.
///
/// Messages use standard mode sends, so they may block until the matching receive
/// is posted. Collectives over all ranks map to the MPI collectives of the
/// communicator, which need no tag.
pub struct MpiGroup<'c, C: CommunicatorCollectives> {
    comm: &'c C,
    rank: usize,
    size: usize,
}

impl<'c, C: CommunicatorCollectives> MpiGroup<'c, C> {
    /// Wrap a communicator.
    pub fn new(comm: &'c C) -> Self {
        Self {
            comm,
            rank: comm.rank() as usize,
            size: comm.size() as usize,
        }
    }

    /// The wrapped communicator.
    pub fn communicator(&self) -> &'c C {
        self.comm
    }
}

impl<C: CommunicatorCollectives> ProcessGroup for MpiGroup<'_, C> {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn send<T: Message>(&self, buf: &[T], dest: usize, tag: i32) {
        self.comm
            .process_at_rank(dest as i32)
            .send_with_tag(buf, tag);
    }

    fn receive<T: Message>(&self, buf: &mut [T], src: usize, tag: i32) {
        let _status = self
            .comm
            .process_at_rank(src as i32)
            .receive_into_with_tag(buf, tag);
    }

    fn broadcast<T: Message>(&self, buf: &mut [T], root: usize, _tag: i32) {
        self.comm.process_at_rank(root as i32).broadcast_into(buf);
    }

    fn reduce<T: Reducible>(&self, input: &[T], output: &mut [T], op: ReduceOp, root: usize, _tag: i32) {
        let root_process = self.comm.process_at_rank(root as i32);
        let operation = element_wise::<T>(op);

        if self.rank == root {
            root_process.reduce_into_root(input, output, &operation);
        } else {
            root_process.reduce_into(input, &operation);
        }
    }

    fn all_reduce<T: Reducible>(&self, input: &[T], op: ReduceOp, _tag: i32) -> Vec<T> {
        let mut output = vec![T::default(); input.len()];
        self.comm
            .all_reduce_into(input, &mut output[..], &element_wise::<T>(op));
        output
    }

    fn gather<T: Message>(&self, local: &[T], root: usize, _tag: i32) -> Option<Vec<T>> {
        let root_process = self.comm.process_at_rank(root as i32);

        if self.rank == root {
            let mut result = vec![T::default(); local.len() * self.size];
            root_process.gather_into_root(local, &mut result[..]);
            Some(result)
        } else {
            root_process.gather_into(local);
            None
        }
    }

    fn all_gather<T: Message>(&self, local: &[T], _tag: i32) -> Vec<T> {
        let mut result = vec![T::default(); local.len() * self.size];
        self.comm.all_gather_into(local, &mut result[..]);
        result
    }
}

/// `op` applied element wise to buffers of `T`.
fn element_wise<'a, T: Reducible>(op: ReduceOp) -> UserOperation<'a> {
    UserOperation::commutative(move |x, y| {
        if let (Some(x), Some(y)) = (x.downcast::<T>(), y.downcast::<T>()) {
            op.combine(y, x);
        }
    })
}
