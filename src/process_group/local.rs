//! An in-process group of ranks that run as threads.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, PoisonError};

use super::{Message, ProcessGroup};

struct Envelope {
    source: usize,
    tag: i32,
    payload: Box<dyn Any + Send>,
}

#[derive(Default)]
struct Mailbox {
    queue: Mutex<VecDeque<Envelope>>,
    arrived: Condvar,
}

/// A process group whose ranks are threads of the same process.
///
/// Sends never block. A receive waits for the oldest message from the given
/// source with the given tag.
#[derive(Clone)]
pub struct LocalGroup {
    rank: usize,
    mailboxes: Arc<Vec<Mailbox>>,
}

impl LocalGroup {
    /// Create the handles for `size` ranks sharing one set of mailboxes.
    pub fn universe(size: usize) -> Vec<LocalGroup> {
        assert!(size > 0);
        let mailboxes = Arc::new((0..size).map(|_| Mailbox::default()).collect::<Vec<_>>());
        (0..size)
            .map(|rank| LocalGroup {
                rank,
                mailboxes: mailboxes.clone(),
            })
            .collect()
    }
}

impl ProcessGroup for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.mailboxes.len()
    }

    fn send<T: Message>(&self, buf: &[T], dest: usize, tag: i32) {
        let mailbox = &self.mailboxes[dest];
        let mut queue = mailbox
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        queue.push_back(Envelope {
            source: self.rank,
            tag,
            payload: Box::new(buf.to_vec()),
        });
        mailbox.arrived.notify_all();
    }

    fn receive<T: Message>(&self, buf: &mut [T], src: usize, tag: i32) {
        let mailbox = &self.mailboxes[self.rank];
        let mut queue = mailbox
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let envelope = loop {
            if let Some(envelope) = queue
                .iter()
                .position(|envelope| envelope.source == src && envelope.tag == tag)
                .and_then(|pos| queue.remove(pos))
            {
                break envelope;
            }
            queue = mailbox
                .arrived
                .wait(queue)
                .unwrap_or_else(PoisonError::into_inner);
        };

        match envelope.payload.downcast::<Vec<T>>() {
            Ok(payload) => {
                assert_eq!(
                    payload.len(),
                    buf.len(),
                    "rank {} expected {} elements from {} with tag {}",
                    self.rank,
                    buf.len(),
                    src,
                    tag
                );
                buf.copy_from_slice(&payload);
            }
            Err(_) => panic!(
                "rank {} received a message of the wrong type from {} with tag {}",
                self.rank, src, tag
            ),
        }
    }
}

/// Run `f` on `size` ranks, each on its own thread, and collect the results by rank.
pub fn run_on_ranks<R, F>(size: usize, f: F) -> Vec<R>
where
    R: Send,
    F: Fn(&LocalGroup) -> R + Sync,
{
    let groups = LocalGroup::universe(size);
    std::thread::scope(|s| {
        let handles = groups
            .iter()
            .map(|comm| {
                let f = &f;
                s.spawn(move || f(comm))
            })
            .collect::<Vec<_>>();

        handles
            .into_iter()
            .map(|handle| match handle.join() {
                Ok(result) => result,
                Err(payload) => std::panic::resume_unwind(payload),
            })
            .collect()
    })
}
