//! Per-operation context pool.
//!
//! Every submitted operation owns exactly one `OperationContext` pairing a
//! fixed-capacity buffer with the operation's metadata. The context's slab
//! index doubles as the completion token (io_uring user_data), so a
//! completion can be correlated back to its context in O(1).
//!
//! A context is acquired before submission and released exactly once, after
//! its completion has been observed. Released buffers are recycled instead
//! of reallocated.

use slab::Slab;

/// Kind of in-flight operation, tagged with its owning connection.
///
/// Accept operations have no owning connection yet; the connection is
/// created only when the accept completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// Accept operation on the listening socket.
    Accept,
    /// Receive operation on a connection.
    Recv {
        /// Connection identifier in the registry.
        conn_id: usize,
    },
    /// Send operation on a connection.
    Send {
        /// Connection identifier in the registry.
        conn_id: usize,
    },
}

/// One outstanding asynchronous request.
#[derive(Debug)]
pub struct OperationContext {
    /// Operation kind and owning connection.
    pub kind: OpKind,
    /// I/O buffer for this operation.
    pub buf: Box<[u8]>,
    /// Payload length in `buf` (bytes queued for a send; unused for
    /// accept/receive, where the completion reports the byte count).
    pub len: usize,
}

/// Pool of operation contexts with O(1) acquire, lookup and release.
///
/// The pool is bounded: `acquire` fails once `capacity` contexts are
/// outstanding, and the caller must abandon the triggering operation.
pub struct ContextPool {
    ops: Slab<OperationContext>,
    /// Buffers recycled from released contexts (LIFO for cache locality).
    spare_bufs: Vec<Box<[u8]>>,
    buffer_size: usize,
    capacity: usize,
}

impl ContextPool {
    /// Create a pool holding at most `capacity` outstanding contexts,
    /// each with a `buffer_size`-byte buffer.
    pub fn new(capacity: usize, buffer_size: usize) -> Self {
        Self {
            ops: Slab::with_capacity(capacity),
            spare_bufs: Vec::with_capacity(capacity),
            buffer_size,
            capacity,
        }
    }

    /// Acquire a context with a zeroed buffer.
    ///
    /// Returns the completion token, or `None` if the pool is exhausted.
    pub fn acquire(&mut self, kind: OpKind) -> Option<u64> {
        if self.ops.len() >= self.capacity {
            return None;
        }

        let buf = match self.spare_bufs.pop() {
            Some(mut buf) => {
                buf.fill(0);
                buf
            }
            None => vec![0u8; self.buffer_size].into_boxed_slice(),
        };

        let token = self.ops.insert(OperationContext { kind, buf, len: 0 });
        Some(token as u64)
    }

    /// Get the context for a token.
    pub fn get(&self, token: u64) -> Option<&OperationContext> {
        self.ops.get(token as usize)
    }

    /// Get the context for a token, mutably.
    pub fn get_mut(&mut self, token: u64) -> Option<&mut OperationContext> {
        self.ops.get_mut(token as usize)
    }

    /// Get a raw pointer to a context's buffer for submission.
    ///
    /// # Safety
    /// The pointer stays valid until the context is released (the buffer
    /// is heap-allocated and never moves while the context is live), but
    /// the caller must not release the context while the kernel may still
    /// write through the pointer.
    pub fn buf_ptr(&mut self, token: u64) -> *mut u8 {
        self.ops[token as usize].buf.as_mut_ptr()
    }

    /// Release a context, recycling its buffer.
    ///
    /// Returns the operation kind, or `None` if the token is unknown or
    /// was already released.
    pub fn release(&mut self, token: u64) -> Option<OpKind> {
        let idx = token as usize;
        if !self.ops.contains(idx) {
            return None;
        }
        let ctx = self.ops.remove(idx);
        self.spare_bufs.push(ctx.buf);
        Some(ctx.kind)
    }

    /// Number of currently outstanding contexts.
    pub fn in_flight(&self) -> usize {
        self.ops.len()
    }

    /// Check if no contexts are outstanding.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Buffer capacity of each context.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release_accounting() {
        let mut pool = ContextPool::new(4, 64);
        assert!(pool.is_empty());

        let t1 = pool.acquire(OpKind::Accept).unwrap();
        let t2 = pool.acquire(OpKind::Recv { conn_id: 3 }).unwrap();
        assert_eq!(pool.in_flight(), 2);

        assert!(matches!(pool.get(t1).unwrap().kind, OpKind::Accept));
        assert!(matches!(
            pool.get(t2).unwrap().kind,
            OpKind::Recv { conn_id: 3 }
        ));

        assert_eq!(pool.release(t1), Some(OpKind::Accept));
        assert_eq!(pool.in_flight(), 1);

        // Releasing twice is rejected
        assert_eq!(pool.release(t1), None);

        pool.release(t2);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_pool_exhaustion() {
        let mut pool = ContextPool::new(2, 16);

        let t1 = pool.acquire(OpKind::Accept).unwrap();
        let _t2 = pool.acquire(OpKind::Accept).unwrap();
        assert!(pool.acquire(OpKind::Accept).is_none());

        pool.release(t1);
        assert!(pool.acquire(OpKind::Accept).is_some());
    }

    #[test]
    fn test_recycled_buffer_is_zeroed() {
        let mut pool = ContextPool::new(2, 16);

        let t1 = pool.acquire(OpKind::Send { conn_id: 0 }).unwrap();
        pool.get_mut(t1).unwrap().buf[0] = 0xAB;
        pool.release(t1);

        let t2 = pool.acquire(OpKind::Recv { conn_id: 0 }).unwrap();
        let ctx = pool.get(t2).unwrap();
        assert_eq!(ctx.buf.len(), 16);
        assert!(ctx.buf.iter().all(|&b| b == 0));
        assert_eq!(ctx.len, 0);
    }

    #[test]
    fn test_token_reuses_slot() {
        let mut pool = ContextPool::new(4, 16);

        let t1 = pool.acquire(OpKind::Accept).unwrap();
        pool.release(t1);
        let t2 = pool.acquire(OpKind::Accept).unwrap();
        assert_eq!(t1, t2); // Slab reuses slots
    }
}
