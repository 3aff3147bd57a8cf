//! Completion multiplexer wrapping io_uring.
//!
//! One multiplexer serves every endpoint of the process: endpoints are
//! registered into a routing table, operations are submitted as SQEs
//! carrying a context token as user_data, and `wait` delivers exactly one
//! completion at a time, in the order the kernel reports them. A finite
//! wait timeout lets the dispatch loop interleave housekeeping without a
//! second thread.

use io_uring::{opcode, types, IoUring};
use std::collections::HashSet;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Reserved user_data for cancel SQEs; never allocated by the context
/// pool, whose tokens are slab indices.
pub const CANCEL_TOKEN: u64 = u64::MAX;

/// One finished asynchronous operation.
#[derive(Debug, Clone, Copy)]
pub struct Completion {
    /// Context token the operation was submitted with.
    pub token: u64,
    /// Raw kernel result: byte count on success, negated errno on failure.
    pub result: i32,
}

impl Completion {
    /// Bytes transferred, or the operation's error.
    ///
    /// Zero bytes on a receive means the peer closed gracefully.
    pub fn bytes(&self) -> io::Result<usize> {
        if self.result < 0 {
            Err(io::Error::from_raw_os_error(-self.result))
        } else {
            Ok(self.result as usize)
        }
    }
}

/// Outcome of one `wait` call.
#[derive(Debug)]
pub enum WaitOutcome {
    /// Exactly one operation finished.
    Completion(Completion),
    /// The timeout elapsed (or the wait was interrupted) with nothing to
    /// report; the caller may run housekeeping and wait again.
    Timeout,
}

/// Endpoint registration errors.
#[derive(Debug, PartialEq, Eq)]
pub enum RegistrationError {
    /// The endpoint is already in the routing table.
    AlreadyRegistered(RawFd),
}

impl std::fmt::Display for RegistrationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistrationError::AlreadyRegistered(fd) => {
                write!(f, "endpoint fd {fd} is already registered")
            }
        }
    }
}

impl std::error::Error for RegistrationError {}

/// The shared completion queue plus its endpoint routing table.
pub struct Multiplexer {
    ring: IoUring,
    registered: HashSet<RawFd>,
}

impl Multiplexer {
    /// Create a multiplexer with the given ring size.
    pub fn new(entries: usize) -> io::Result<Self> {
        let ring = IoUring::new((entries.max(2) as u32).next_power_of_two())?;
        Ok(Self {
            ring,
            registered: HashSet::new(),
        })
    }

    /// Associate an endpoint with the completion queue.
    ///
    /// Registering the same endpoint twice is an error.
    pub fn register(&mut self, fd: RawFd) -> Result<(), RegistrationError> {
        if !self.registered.insert(fd) {
            return Err(RegistrationError::AlreadyRegistered(fd));
        }
        Ok(())
    }

    /// Remove a closed endpoint from the routing table.
    pub fn deregister(&mut self, fd: RawFd) -> bool {
        self.registered.remove(&fd)
    }

    /// Whether an endpoint is currently registered.
    pub fn is_registered(&self, fd: RawFd) -> bool {
        self.registered.contains(&fd)
    }

    /// Number of registered endpoints.
    pub fn registered_count(&self) -> usize {
        self.registered.len()
    }

    /// Queue an accept against the listening endpoint.
    ///
    /// The accepted endpoint's fd arrives as the completion result.
    pub fn submit_accept(&mut self, listener_fd: RawFd, token: u64) -> io::Result<()> {
        self.check_registered(listener_fd)?;

        let sqe = opcode::Accept::new(
            types::Fd(listener_fd),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
        )
        .build()
        .user_data(token);

        self.push(&sqe)
    }

    /// Queue a receive of up to `len` bytes into `buf`.
    ///
    /// # Safety
    /// `buf` must stay valid for writes of `len` bytes until the
    /// completion for `token` is observed.
    pub unsafe fn submit_recv(
        &mut self,
        fd: RawFd,
        buf: *mut u8,
        len: usize,
        token: u64,
    ) -> io::Result<()> {
        self.check_registered(fd)?;

        let sqe = opcode::Recv::new(types::Fd(fd), buf, len as u32)
            .build()
            .user_data(token);

        self.push(&sqe)
    }

    /// Queue a send of `len` bytes from `buf`.
    ///
    /// # Safety
    /// `buf` must stay valid for reads of `len` bytes until the
    /// completion for `token` is observed.
    pub unsafe fn submit_send(
        &mut self,
        fd: RawFd,
        buf: *const u8,
        len: usize,
        token: u64,
    ) -> io::Result<()> {
        self.check_registered(fd)?;

        let sqe = opcode::Send::new(types::Fd(fd), buf, len as u32)
            .build()
            .user_data(token);

        self.push(&sqe)
    }

    /// Ask the kernel to cancel the operation submitted with `token`.
    ///
    /// The cancelled operation still completes (with ECANCELED) and must
    /// be processed; the cancel SQE's own completion arrives under
    /// `CANCEL_TOKEN` and carries no context.
    pub fn cancel(&mut self, token: u64) -> io::Result<()> {
        let sqe = opcode::AsyncCancel::new(token)
            .build()
            .user_data(CANCEL_TOKEN);

        self.push(&sqe)
    }

    /// Block until one operation finishes or the timeout elapses.
    ///
    /// Flushes pending submissions first. EINTR and ETIME surface as
    /// `Timeout`; only a genuinely unusable ring returns `Err`.
    pub fn wait(&mut self, timeout: Duration) -> io::Result<WaitOutcome> {
        // Flush SQEs queued by handlers since the last wait.
        match self.ring.submit() {
            Ok(_) => {}
            Err(e) if is_transient(&e) => {}
            Err(e) => return Err(e),
        }

        // Completions already queued are delivered without blocking.
        if let Some(completion) = self.pop_completion() {
            return Ok(WaitOutcome::Completion(completion));
        }

        let ts = types::Timespec::new()
            .sec(timeout.as_secs())
            .nsec(timeout.subsec_nanos());
        let args = types::SubmitArgs::new().timespec(&ts);

        match self.ring.submitter().submit_with_args(1, &args) {
            Ok(_) => {}
            Err(e) if e.raw_os_error() == Some(libc::ETIME) => {}
            Err(e) if is_transient(&e) => return Ok(WaitOutcome::Timeout),
            Err(e) => return Err(e),
        }

        match self.pop_completion() {
            Some(completion) => Ok(WaitOutcome::Completion(completion)),
            None => Ok(WaitOutcome::Timeout),
        }
    }

    fn pop_completion(&mut self) -> Option<Completion> {
        self.ring.completion().next().map(|cqe| Completion {
            token: cqe.user_data(),
            result: cqe.result(),
        })
    }

    fn check_registered(&self, fd: RawFd) -> io::Result<()> {
        if self.registered.contains(&fd) {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "endpoint not registered with multiplexer",
            ))
        }
    }

    fn push(&mut self, sqe: &io_uring::squeue::Entry) -> io::Result<()> {
        unsafe {
            self.ring
                .submission()
                .push(sqe)
                .map_err(|_| io::Error::new(io::ErrorKind::Other, "submission queue full"))
        }
    }

    #[cfg(test)]
    fn submit_nop(&mut self, token: u64) -> io::Result<()> {
        let sqe = opcode::Nop::new().build().user_data(token);
        self.push(&sqe)
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(libc::EINTR) | Some(libc::EBUSY))
}
