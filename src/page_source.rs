//! Page Sources - External Pager Interface
//!
//! Based on the Mach external memory management protocol
//! (memory_object_data_request / memory_object_data_supply).
//!
//! When a fault reaches the root of a copy-on-write chain and that object
//! is backed by a page source, the fault is deflected to the source:
//!
//! 1. The faulting path hands the source a [`PageRequest`] token
//! 2. The source either returns a page at once, or records the request and
//!    answers `ShouldWait` (or `Batched` when it is still coalescing)
//! 3. The caller drops the object lock and blocks in [`PageRequest::wait`]
//! 4. The pager pushes pages in with `VmObject::supply_pages`, which calls
//!    [`PageSource::on_pages_supplied`], resolving overlapping requests
//! 5. The caller re-takes the lock and retries the fault

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::error::{VmError, VmResult};
use crate::vm_page::{PageRef, PAGE_SIZE};

// ============================================================================
// Page Request
// ============================================================================

/// Lifecycle of a page request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Not associated with any fault
    Idle,
    /// Recorded by a page source, awaiting pages
    Requested,
    /// Every requested page has been supplied
    Fulfilled,
    /// The source gave up on the request
    Failed(VmError),
}

#[derive(Debug)]
struct RequestInner {
    state: RequestState,
    offset: u64,
    len: u64,
    /// Bytes of the range not yet supplied
    pending: u64,
    /// Whether the range has been forwarded to the pager
    sent: bool,
}

/// Token for one outstanding page source request
///
/// Owned by the faulting call path and reused across retries; a source
/// keeps a clone while the request is outstanding.
#[derive(Debug)]
pub struct PageRequest {
    allow_batching: bool,
    inner: Mutex<RequestInner>,
}

impl PageRequest {
    pub fn new(allow_batching: bool) -> Arc<Self> {
        Arc::new(Self {
            allow_batching,
            inner: Mutex::new(RequestInner {
                state: RequestState::Idle,
                offset: 0,
                len: 0,
                pending: 0,
                sent: false,
            }),
        })
    }

    pub fn allow_batching(&self) -> bool {
        self.allow_batching
    }

    pub fn state(&self) -> RequestState {
        self.inner.lock().state
    }

    /// Requested byte range, while the request is live
    pub fn range(&self) -> Option<(u64, u64)> {
        let inner = self.inner.lock();
        match inner.state {
            RequestState::Idle => None,
            _ => Some((inner.offset, inner.len)),
        }
    }

    /// Start a request for `[offset, offset + len)`
    pub fn init(&self, offset: u64, len: u64) {
        let mut inner = self.inner.lock();
        assert_eq!(inner.state, RequestState::Idle, "page request already in use");
        inner.state = RequestState::Requested;
        inner.offset = offset;
        inner.len = len;
        inner.pending = len;
        inner.sent = false;
    }

    /// Grow an unsent request by `len` bytes at its end
    pub fn extend(&self, len: u64) {
        let mut inner = self.inner.lock();
        debug_assert!(!inner.sent);
        inner.len += len;
        inner.pending += len;
    }

    /// End offset of the requested range
    pub fn end(&self) -> u64 {
        let inner = self.inner.lock();
        inner.offset + inner.len
    }

    pub fn mark_sent(&self) {
        self.inner.lock().sent = true;
    }

    pub fn is_sent(&self) -> bool {
        self.inner.lock().sent
    }

    /// Account for pages supplied over `[offset, offset + len)`
    ///
    /// Returns true once the whole request has been supplied.
    pub fn on_supplied(&self, offset: u64, len: u64) -> bool {
        let mut inner = self.inner.lock();
        // Resolved elsewhere; the source can let go of it
        if inner.state != RequestState::Requested {
            return true;
        }
        let start = offset.max(inner.offset);
        let end = (offset + len).min(inner.offset + inner.len);
        if start < end {
            inner.pending = inner.pending.saturating_sub(end - start);
        }
        if inner.pending == 0 {
            inner.state = RequestState::Fulfilled;
            true
        } else {
            false
        }
    }

    /// Resolve the request with an error
    pub fn fail(&self, err: VmError) {
        let mut inner = self.inner.lock();
        if inner.state == RequestState::Requested {
            inner.state = RequestState::Failed(err);
        }
    }

    /// Whether the live request overlaps `[offset, offset + len)`
    fn overlaps(&self, offset: u64, len: u64) -> bool {
        let inner = self.inner.lock();
        inner.state == RequestState::Requested
            && offset < inner.offset + inner.len
            && inner.offset < offset + len
    }

    /// Block until the request resolves, then return it to `Idle`
    ///
    /// Must never be called with an object lock held.
    pub fn wait(&self) -> VmResult<()> {
        loop {
            {
                let mut inner = self.inner.lock();
                match inner.state {
                    RequestState::Requested => {}
                    RequestState::Idle => return Ok(()),
                    RequestState::Fulfilled => {
                        inner.state = RequestState::Idle;
                        return Ok(());
                    }
                    RequestState::Failed(err) => {
                        inner.state = RequestState::Idle;
                        return Err(err);
                    }
                }
            }
            core::hint::spin_loop();
        }
    }
}

// ============================================================================
// Page Source Interface
// ============================================================================

/// Supplier of page contents for a pager-backed VM object
pub trait PageSource: Send + Sync {
    /// Resolve the page at `offset`
    ///
    /// Returns the page when the source can hand it over immediately.
    /// Otherwise records the fault against `request` and fails with
    /// `ShouldWait`, or `Batched` when the request may still be extended.
    /// Without a request the source only forwards the fault.
    fn get_page(&self, offset: u64, request: Option<&Arc<PageRequest>>) -> VmResult<PageRef>;

    /// Pages over `[offset, offset + len)` were spliced into the object
    fn on_pages_supplied(&self, offset: u64, len: u64);

    /// Send a batched request; `Ok` if already resolved, `ShouldWait` if
    /// the caller must wait, or the failure
    fn finalize_request(&self, request: &Arc<PageRequest>) -> VmResult<()>;

    /// The owning object is gone; no further requests are valid
    fn close(&self);
}

// ============================================================================
// Pager Queue
// ============================================================================

#[derive(Default)]
struct PagerInner {
    /// Requests awaiting pages, sent or still batching
    outstanding: Vec<Arc<PageRequest>>,
    /// Ranges forwarded to the pager and not yet read by it
    queue: VecDeque<(u64, u64)>,
    closed: bool,
}

impl PagerInner {
    fn send(&mut self, request: &Arc<PageRequest>) {
        if let Some((offset, len)) = request.range() {
            request.mark_sent();
            self.queue.push_back((offset, len));
            log::trace!("pager: request [{:#x}, {:#x})", offset, offset + len);
        }
    }

    fn queued(&self, offset: u64) -> bool {
        self.queue
            .iter()
            .any(|&(start, len)| offset >= start && offset < start + len)
    }
}

/// Page source served by a pager draining a request queue
///
/// The pager polls [`next_request`](Self::next_request) and answers with
/// `VmObject::supply_pages`, or [`fail_range`](Self::fail_range).
#[derive(Default)]
pub struct PagerQueue {
    inner: Mutex<PagerInner>,
}

impl PagerQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Next range the pager should supply
    pub fn next_request(&self) -> Option<(u64, u64)> {
        self.inner.lock().queue.pop_front()
    }

    /// Number of requests awaiting pages
    pub fn outstanding(&self) -> usize {
        let mut inner = self.inner.lock();
        inner
            .outstanding
            .retain(|request| request.state() == RequestState::Requested);
        inner.outstanding.len()
    }

    /// Ranges forwarded and not yet read by the pager
    pub fn queued(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Fail every request overlapping `[offset, offset + len)`
    pub fn fail_range(&self, offset: u64, len: u64, err: VmError) {
        let mut inner = self.inner.lock();
        inner.outstanding.retain(|request| {
            if request.overlaps(offset, len) {
                request.fail(err);
                false
            } else {
                true
            }
        });
        inner
            .queue
            .retain(|&(start, qlen)| start + qlen <= offset || offset + len <= start);
    }
}

impl PageSource for PagerQueue {
    fn get_page(&self, offset: u64, request: Option<&Arc<PageRequest>>) -> VmResult<PageRef> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(VmError::BadState);
        }

        let request = match request {
            Some(request) => request,
            None => {
                if !inner.queued(offset) {
                    inner.queue.push_back((offset, PAGE_SIZE as u64));
                }
                return Err(VmError::ShouldWait);
            }
        };

        if request.state() == RequestState::Requested {
            if request.allow_batching() && !request.is_sent() && request.end() == offset {
                request.extend(PAGE_SIZE as u64);
                return Err(VmError::Batched);
            }
            // Not contiguous: ship what we have, the caller retries `offset` later
            if !request.is_sent() {
                inner.send(request);
            }
            return Err(VmError::ShouldWait);
        }

        request.init(offset, PAGE_SIZE as u64);
        inner.outstanding.push(Arc::clone(request));
        if request.allow_batching() {
            return Err(VmError::Batched);
        }
        inner.send(request);
        Err(VmError::ShouldWait)
    }

    fn on_pages_supplied(&self, offset: u64, len: u64) {
        let mut inner = self.inner.lock();
        inner.outstanding.retain(|request| !request.on_supplied(offset, len));
        inner
            .queue
            .retain(|&(start, qlen)| start < offset || start + qlen > offset + len);
    }

    fn finalize_request(&self, request: &Arc<PageRequest>) -> VmResult<()> {
        let mut inner = self.inner.lock();
        match request.state() {
            RequestState::Idle | RequestState::Fulfilled => Ok(()),
            RequestState::Failed(err) => Err(err),
            RequestState::Requested => {
                if !request.is_sent() {
                    inner.send(request);
                }
                Err(VmError::ShouldWait)
            }
        }
    }

    fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        for request in inner.outstanding.drain(..) {
            request.fail(VmError::BadState);
        }
        inner.queue.clear();
        log::debug!("pager: closed");
    }
}
