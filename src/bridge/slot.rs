//! Rendezvous between a thread blocked in a read and the host completing it

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{error, warn};

/// Host-side read function.
///
/// Called on the engine's thread with a [`PendingRead`]; it should start the
/// real read and return immediately. The handle may be completed on any
/// thread. Dropping it without completing reports end-of-stream, so a failed
/// read can never leave the engine thread waiting forever.
pub trait ReadBlock: Send + Sync {
    fn read_block(&self, request: PendingRead);
}

impl<F> ReadBlock for F
where
    F: Fn(PendingRead) + Send + Sync,
{
    fn read_block(&self, request: PendingRead) {
        self(request);
    }
}

/// Engine-owned destination buffer of the read currently in flight
#[derive(Clone, Copy)]
pub(crate) struct Destination {
    ptr: *mut u8,
    len: usize,
}

// The pointer is only dereferenced under the slot mutex while the owning
// reader is parked in `ReadSlot::wait`.
unsafe impl Send for Destination {}

struct Armed {
    ticket: u64,
    dest: Destination,
}

#[derive(Default)]
struct SlotState {
    next_ticket: u64,
    armed: Option<Armed>,
    completed: Option<(u64, i32)>,
}

enum Outcome<'a> {
    Bytes(&'a [u8]),
    Value(i32),
}

/// Mutex/condition-variable pair plus the return-value slot
#[derive(Default)]
pub(crate) struct ReadSlot {
    state: Mutex<SlotState>,
    cond: Condvar,
}

impl ReadSlot {
    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Arm the slot for a new read, waiting out any read still in flight.
    fn arm(&self, dest: Destination) -> u64 {
        let guard = self.lock();
        let mut guard = self
            .cond
            .wait_while(guard, |s| s.armed.is_some())
            .unwrap_or_else(PoisonError::into_inner);

        let ticket = guard.next_ticket;
        guard.next_ticket = guard.next_ticket.wrapping_add(1);
        guard.armed = Some(Armed { ticket, dest });
        guard.completed = None;
        ticket
    }

    /// Park until `ticket` is completed (or the timeout elapses) and take its value.
    fn wait(&self, ticket: u64, timeout: Option<Duration>) -> i32 {
        let guard = self.lock();
        let mut guard = match timeout {
            None => self
                .cond
                .wait_while(guard, |s| !is_completed(s, ticket))
                .unwrap_or_else(PoisonError::into_inner),
            Some(limit) => {
                let (mut guard, result) = self
                    .cond
                    .wait_timeout_while(guard, limit, |s| !is_completed(s, ticket))
                    .unwrap_or_else(PoisonError::into_inner);
                if result.timed_out() && !is_completed(&mut guard, ticket) {
                    error!("read {ticket} not completed within {limit:?}; reporting end of stream");
                    guard.armed = None;
                    guard.completed = None;
                    self.cond.notify_all();
                    return 0;
                }
                guard
            }
        };

        let value = guard.completed.take().map_or(0, |(_, value)| value);
        guard.armed = None;
        self.cond.notify_all();
        value
    }

    fn complete(&self, ticket: u64, outcome: Outcome<'_>) -> bool {
        let mut guard = self.lock();
        let dest = match guard.armed {
            Some(ref armed) if armed.ticket == ticket => armed.dest,
            _ => return false,
        };
        if guard.completed.is_some() {
            return false;
        }

        let value = match outcome {
            Outcome::Bytes(data) => {
                let n = data.len().min(dest.len);
                if n > 0 {
                    // SAFETY: the reader that armed `dest` is parked in `wait` for this
                    // ticket, so the engine buffer is alive and not aliased.
                    unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), dest.ptr, n) };
                }
                i32::try_from(n).unwrap_or(i32::MAX)
            }
            Outcome::Value(value) => value,
        };

        guard.completed = Some((ticket, value));
        self.cond.notify_all();
        true
    }

    /// Complete whatever read is currently armed with a raw return code.
    fn complete_current(&self, value: i32) -> bool {
        let mut guard = self.lock();
        let Some(ticket) = guard.armed.as_ref().map(|armed| armed.ticket) else {
            return false;
        };
        if guard.completed.is_some() {
            return false;
        }
        guard.completed = Some((ticket, value));
        self.cond.notify_all();
        true
    }
}

fn is_completed(state: &mut SlotState, ticket: u64) -> bool {
    matches!(state.completed, Some((t, _)) if t == ticket)
}

/// One outstanding read request handed to the host.
///
/// Exactly one completion reaches the waiting engine thread: the first call
/// to [`complete`](Self::complete) or [`fail`](Self::fail), or the implicit
/// end-of-stream completion on drop.
pub struct PendingRead {
    slot: Arc<ReadSlot>,
    ticket: u64,
    position: u64,
    dest: Destination,
    done: bool,
}

impl PendingRead {
    /// Byte offset requested by the engine
    #[must_use]
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Number of bytes the engine asked for
    #[must_use]
    pub fn len(&self) -> usize {
        self.dest.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.dest.len == 0
    }

    /// Copy `data` (truncated to the requested size) and wake the engine.
    ///
    /// Returns `false` when the engine already gave up on this read.
    pub fn complete(mut self, data: &[u8]) -> bool {
        self.done = true;
        self.slot.complete(self.ticket, Outcome::Bytes(data))
    }

    /// Report end-of-stream / failure to the engine.
    pub fn fail(mut self) -> bool {
        self.done = true;
        self.slot.complete(self.ticket, Outcome::Value(0))
    }

    /// Hand the destination pointer to foreign code that will finish the read
    /// through [`BlockingReader::set_value`].
    pub(crate) fn into_detached(mut self) -> *mut u8 {
        self.done = true;
        self.dest.ptr
    }
}

impl Drop for PendingRead {
    fn drop(&mut self) {
        if !self.done {
            warn!(
                "read of {} bytes at {} dropped without completion",
                self.dest.len, self.position
            );
            self.slot.complete(self.ticket, Outcome::Value(0));
        }
    }
}

impl std::fmt::Debug for PendingRead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRead")
            .field("ticket", &self.ticket)
            .field("position", &self.position)
            .field("len", &self.dest.len)
            .finish_non_exhaustive()
    }
}

/// Synchronous facade over an asynchronous [`ReadBlock`].
///
/// `read_at` blocks the calling thread until the host completes the request.
/// Reads against one reader are serialized.
pub struct BlockingReader {
    slot: Arc<ReadSlot>,
    reader: Box<dyn ReadBlock>,
    timeout: Option<Duration>,
}

impl BlockingReader {
    pub fn new(reader: impl ReadBlock + 'static) -> Self {
        Self {
            slot: Arc::new(ReadSlot::default()),
            reader: Box::new(reader),
            timeout: None,
        }
    }

    /// Bound the wait for each read. `None` waits forever.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Read into `buf` starting at `position`, returning the host's return
    /// value (bytes read; zero or negative for EOF/error).
    pub fn read_at(&self, position: u64, buf: &mut [u8]) -> i32 {
        let dest = Destination {
            ptr: buf.as_mut_ptr(),
            len: buf.len(),
        };
        let ticket = self.slot.arm(dest);
        let request = PendingRead {
            slot: Arc::clone(&self.slot),
            ticket,
            position,
            dest,
            done: false,
        };

        // A panicking host drops the request during unwinding, which completes it.
        if catch_unwind(AssertUnwindSafe(|| self.reader.read_block(request))).is_err() {
            error!("host read function panicked at position {position}");
        }

        self.slot.wait(ticket, self.timeout)
    }

    /// Complete the read currently in flight with a raw return value.
    ///
    /// Returns `false` if no read was waiting or it was already completed.
    pub fn set_value(&self, value: i32) -> bool {
        self.slot.complete_current(value)
    }
}

impl std::fmt::Debug for BlockingReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingReader")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use super::*;

    #[test]
    fn completes_on_another_thread() {
        let data: Arc<Vec<u8>> = Arc::new((0..=255).collect());
        let source = Arc::clone(&data);
        let reader = BlockingReader::new(move |req: PendingRead| {
            let source = Arc::clone(&source);
            thread::spawn(move || {
                let start = req.position() as usize;
                let end = (start + req.len()).min(source.len());
                req.complete(&source[start..end]);
            });
        });

        let mut buf = [0u8; 16];
        assert_eq!(reader.read_at(100, &mut buf), 16);
        assert_eq!(&buf[..], &data[100..116]);
    }

    #[test]
    fn synchronous_completion_does_not_deadlock() {
        let reader = BlockingReader::new(|req: PendingRead| {
            req.complete(b"abc");
        });
        let mut buf = [0u8; 8];
        assert_eq!(reader.read_at(0, &mut buf), 3);
        assert_eq!(&buf[..3], b"abc");
    }

    #[test]
    fn dropped_request_reports_end_of_stream() {
        let reader = BlockingReader::new(|req: PendingRead| {
            drop(req);
        });
        let mut buf = [0u8; 8];
        assert_eq!(reader.read_at(0, &mut buf), 0);
    }

    #[test]
    fn panicking_host_reports_end_of_stream() {
        let reader = BlockingReader::new(|_req: PendingRead| {
            panic!("host exploded");
        });
        let mut buf = [0u8; 8];
        assert_eq!(reader.read_at(0, &mut buf), 0);
    }

    #[test]
    fn second_completion_is_rejected() {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);
        let reader = Arc::new(BlockingReader::new(move |req: PendingRead| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
            req.complete(b"xy");
        }));

        let mut buf = [0u8; 4];
        assert_eq!(reader.read_at(0, &mut buf), 2);
        // Nothing is armed any more.
        assert!(!reader.set_value(99));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn timeout_disarms_and_ignores_late_completion() {
        let parked: Arc<Mutex<Option<PendingRead>>> = Arc::new(Mutex::new(None));
        let parked_clone = Arc::clone(&parked);
        let reader = BlockingReader::new(move |req: PendingRead| {
            *parked_clone.lock().unwrap() = Some(req);
        })
        .with_timeout(Some(Duration::from_millis(20)));

        let mut buf = [7u8; 4];
        assert_eq!(reader.read_at(0, &mut buf), 0);

        let late = parked.lock().unwrap().take().unwrap();
        assert!(!late.complete(b"late"));
        assert_eq!(buf, [7u8; 4]);
    }

    #[test]
    fn raw_set_value_completes_detached_read() {
        let holder: Arc<Mutex<Option<usize>>> = Arc::new(Mutex::new(None));
        let holder_clone = Arc::clone(&holder);
        let reader = Arc::new(BlockingReader::new(move |req: PendingRead| {
            let ptr = req.into_detached();
            *holder_clone.lock().unwrap() = Some(ptr as usize);
        }));

        let signaller = Arc::clone(&reader);
        let handle = thread::spawn(move || {
            loop {
                if let Some(addr) = *holder.lock().unwrap() {
                    // SAFETY: the reader stays parked until set_value below.
                    unsafe { *(addr as *mut u8) = 42 };
                    break;
                }
                thread::yield_now();
            }
            assert!(signaller.set_value(1));
        });

        let mut buf = [0u8; 1];
        assert_eq!(reader.read_at(5, &mut buf), 1);
        assert_eq!(buf[0], 42);
        handle.join().unwrap();
    }
}
