//! Single-threaded dispatch loop.
//!
//! One thread drains the multiplexer and is the sole executor of every
//! state-machine transition, so connection and context fields need no
//! locking. Submissions are non-blocking; the only blocking point is the
//! multiplexer's finite-timeout wait, whose timeout doubles as the
//! housekeeping and shutdown tick.
//!
//! Failures local to one connection never propagate to other connections
//! or the listener. Only a multiplexer-level failure stops the service.

use crate::config::Config;
use crate::runtime::connection::{ConnectionRegistry, EchoState};
use crate::runtime::context::{ContextPool, OpKind};
use crate::runtime::echo;
use crate::runtime::listener::Listener;
use crate::runtime::multiplexer::{Completion, Multiplexer, WaitOutcome, CANCEL_TOKEN};
use crate::runtime::transport;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Timeout ticks to wait for in-flight operations after shutdown before
/// giving up on a clean drain.
const MAX_DRAIN_TICKS: u32 = 5;

/// The echo server: listener, multiplexer, context pool, and the
/// connections they drive.
pub struct Server {
    config: Config,
    mux: Multiplexer,
    pool: ContextPool,
    connections: ConnectionRegistry,
    listener: Listener,
    shutdown: Arc<AtomicBool>,
}

impl Server {
    /// Bind the listening endpoint and prepare the runtime.
    pub fn bind(config: Config) -> io::Result<Self> {
        let addr: SocketAddr = config
            .listen
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let mut mux = Multiplexer::new(config.ring_size)?;
        let listener = Listener::bind(addr, config.backlog, &mut mux)?;

        // One context per outstanding operation: at most one receive and
        // one send per connection, plus the standing accept.
        let pool = ContextPool::new(
            config.max_connections * 2 + 1,
            echo::reply_capacity(config.buffer_size),
        );
        let connections = ConnectionRegistry::new(config.max_connections);

        Ok(Self {
            config,
            mux,
            pool,
            connections,
            listener,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Actual bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    /// Flag that requests shutdown when set; checked every timeout tick
    /// and after every completion.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Run the dispatch loop until shutdown is requested.
    ///
    /// Returns an error only if the multiplexer itself becomes unusable.
    pub fn run(mut self) -> io::Result<()> {
        self.listener.post_accept(&mut self.mux, &mut self.pool);

        info!(
            addr = %self.listener.local_addr(),
            buffer_size = self.config.buffer_size,
            max_connections = self.config.max_connections,
            "Echo server running"
        );

        let timeout = Duration::from_millis(self.config.wait_timeout_ms);
        let mut draining = false;
        let mut drain_ticks = 0u32;

        loop {
            if !draining && self.shutdown.load(Ordering::Relaxed) {
                self.begin_drain();
                draining = true;
            }
            if draining && self.pool.is_empty() {
                break;
            }

            match self.mux.wait(timeout) {
                Ok(WaitOutcome::Completion(completion)) => {
                    self.dispatch(completion, draining);
                }
                Ok(WaitOutcome::Timeout) => {
                    if draining {
                        drain_ticks += 1;
                        if drain_ticks >= MAX_DRAIN_TICKS {
                            warn!(
                                in_flight = self.pool.in_flight(),
                                "Drain timed out with operations still in flight"
                            );
                            break;
                        }
                    } else {
                        // Housekeeping: restore the backlog invariant if
                        // an accept was abandoned under memory pressure.
                        if !self.listener.has_pending_accept() {
                            self.listener.post_accept(&mut self.mux, &mut self.pool);
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "Multiplexer failed, stopping service");
                    self.close_all();
                    return Err(e);
                }
            }
        }

        self.close_all();
        info!("Echo server stopped");
        Ok(())
    }

    /// Route one completion to the matching handler, exactly once.
    fn dispatch(&mut self, completion: Completion, draining: bool) {
        if completion.token == CANCEL_TOKEN {
            debug!("Cancel completed");
            return;
        }

        let kind = match self.pool.get(completion.token) {
            Some(ctx) => ctx.kind,
            None => {
                warn!(token = completion.token, "Unknown token in completion");
                return;
            }
        };

        match kind {
            OpKind::Accept => {
                if let Some(conn_id) = self.listener.handle_accept(
                    completion,
                    &mut self.mux,
                    &mut self.pool,
                    &mut self.connections,
                    draining,
                ) {
                    self.post_recv(conn_id);
                }
            }
            OpKind::Recv { conn_id } => self.handle_recv(conn_id, completion),
            OpKind::Send { conn_id } => self.handle_send(conn_id, completion),
        }
    }

    /// Post a receive for the next client message.
    ///
    /// Only the first `buffer_size` bytes are requested; a longer message
    /// is truncated at that capacity and the excess shows up as the next
    /// message.
    fn post_recv(&mut self, conn_id: usize) {
        let fd = match self.connections.get(conn_id) {
            Some(conn) => conn.fd,
            None => return,
        };

        let token = match self.pool.acquire(OpKind::Recv { conn_id }) {
            Some(token) => token,
            None => {
                warn!(conn_id, "Context pool exhausted, closing connection");
                self.close_connection(conn_id);
                return;
            }
        };

        let ptr = self.pool.buf_ptr(token);
        let len = self.config.buffer_size;

        if let Err(e) = unsafe { self.mux.submit_recv(fd, ptr, len, token) } {
            warn!(conn_id, error = %e, "Failed to submit receive");
            self.pool.release(token);
            self.close_connection(conn_id);
            return;
        }

        if let Some(conn) = self.connections.get_mut(conn_id) {
            conn.recv_ctx = Some(token);
            conn.start_receiving();
        }
    }

    /// Receive completed: echo non-empty payloads, close on zero bytes
    /// (orderly peer close) or error (never retried).
    fn handle_recv(&mut self, conn_id: usize, completion: Completion) {
        let n = match completion.bytes() {
            Ok(n) => n,
            Err(e) => {
                debug!(conn_id, error = %e, "Receive failed");
                self.pool.release(completion.token);
                self.clear_recv(conn_id);
                self.close_connection(conn_id);
                return;
            }
        };

        if n == 0 {
            debug!(conn_id, "Connection closed by peer");
            self.pool.release(completion.token);
            self.clear_recv(conn_id);
            self.close_connection(conn_id);
            return;
        }

        let closing = match self.connections.get_mut(conn_id) {
            Some(conn) => {
                conn.recv_ctx = None;
                conn.state == EchoState::Closed
            }
            None => {
                self.pool.release(completion.token);
                return;
            }
        };
        if closing {
            // Data arrived while draining; the payload is dropped.
            self.pool.release(completion.token);
            self.close_connection(conn_id);
            return;
        }

        // Copy the payload out so the receive context can be released
        // before the send context borrows the pool.
        let payload = match self.pool.get(completion.token) {
            Some(ctx) => ctx.buf[..n].to_vec(),
            None => return,
        };
        self.pool.release(completion.token);

        let send_token = match self.pool.acquire(OpKind::Send { conn_id }) {
            Some(token) => token,
            None => {
                warn!(conn_id, "Context pool exhausted, closing connection");
                self.close_connection(conn_id);
                return;
            }
        };

        let reply_len = match self.pool.get_mut(send_token) {
            Some(ctx) => {
                let len = echo::build_reply(&payload, &mut ctx.buf);
                ctx.len = len;
                len
            }
            None => return,
        };

        let fd = match self.connections.get_mut(conn_id) {
            Some(conn) => {
                conn.send_ctx = Some(send_token);
                conn.start_sending(reply_len);
                conn.fd
            }
            None => {
                self.pool.release(send_token);
                return;
            }
        };

        let ptr = self.pool.buf_ptr(send_token);
        if let Err(e) = unsafe { self.mux.submit_send(fd, ptr, reply_len, send_token) } {
            warn!(conn_id, error = %e, "Failed to submit send");
            self.pool.release(send_token);
            self.clear_send(conn_id);
            self.close_connection(conn_id);
        }
    }

    /// Send completed: resume a short send from the same context, or
    /// release it and post the next receive. A send error closes the
    /// connection exactly like a receive error.
    fn handle_send(&mut self, conn_id: usize, completion: Completion) {
        let n = match completion.bytes() {
            Ok(n) if n > 0 => n,
            Ok(_) => {
                debug!(conn_id, "Send made no progress");
                self.pool.release(completion.token);
                self.clear_send(conn_id);
                self.close_connection(conn_id);
                return;
            }
            Err(e) => {
                debug!(conn_id, error = %e, "Send failed");
                self.pool.release(completion.token);
                self.clear_send(conn_id);
                self.close_connection(conn_id);
                return;
            }
        };

        let (fd, progress) = match self.connections.get_mut(conn_id) {
            Some(conn) => {
                let progress = match conn.state {
                    EchoState::AwaitingSend { written, total } => {
                        let written = written + n;
                        if written < total {
                            conn.state = EchoState::AwaitingSend { written, total };
                            Some((written, total))
                        } else {
                            None
                        }
                    }
                    EchoState::Closed => {
                        conn.send_ctx = None;
                        self.pool.release(completion.token);
                        self.close_connection(conn_id);
                        return;
                    }
                    EchoState::AwaitingRecv => {
                        warn!(conn_id, "Send completion in receive state");
                        conn.send_ctx = None;
                        self.pool.release(completion.token);
                        self.close_connection(conn_id);
                        return;
                    }
                };
                (conn.fd, progress)
            }
            None => {
                self.pool.release(completion.token);
                return;
            }
        };

        match progress {
            Some((written, total)) => {
                // Short send: resubmit the remainder from the same context.
                let ptr = self.pool.buf_ptr(completion.token);
                let result = unsafe {
                    self.mux
                        .submit_send(fd, ptr.add(written), total - written, completion.token)
                };
                if let Err(e) = result {
                    warn!(conn_id, error = %e, "Failed to resume send");
                    self.pool.release(completion.token);
                    self.clear_send(conn_id);
                    self.close_connection(conn_id);
                }
            }
            None => {
                if let Some(conn) = self.connections.get_mut(conn_id) {
                    conn.send_ctx = None;
                }
                self.pool.release(completion.token);
                self.post_recv(conn_id);
            }
        }
    }

    /// Tear the connection down, or defer until its in-flight operations
    /// have completed. Destroying a connection with an operation still
    /// outstanding would leave the kernel writing through a freed buffer.
    fn close_connection(&mut self, conn_id: usize) {
        let defer = match self.connections.get_mut(conn_id) {
            Some(conn) => {
                conn.close();
                if conn.has_outstanding() {
                    // Completions for this connection are still owed;
                    // make them arrive promptly and finish then.
                    transport::shutdown(conn.fd);
                    true
                } else {
                    false
                }
            }
            None => return,
        };

        if !defer {
            if let Some(conn) = self.connections.remove(conn_id) {
                self.mux.deregister(conn.fd);
                transport::close(conn.fd);
                debug!(conn_id, "Connection closed");
            }
        }
    }

    fn clear_recv(&mut self, conn_id: usize) {
        if let Some(conn) = self.connections.get_mut(conn_id) {
            conn.recv_ctx = None;
        }
    }

    fn clear_send(&mut self, conn_id: usize) {
        if let Some(conn) = self.connections.get_mut(conn_id) {
            conn.send_ctx = None;
        }
    }

    /// Stop accepting and push every connection toward completion so the
    /// in-flight operations can drain.
    fn begin_drain(&mut self) {
        info!(
            connections = self.connections.len(),
            in_flight = self.pool.in_flight(),
            "Shutting down"
        );

        if let Some(token) = self.listener.pending_token() {
            if let Err(e) = self.mux.cancel(token) {
                warn!(error = %e, "Failed to cancel outstanding accept");
            }
        }

        for (_, conn) in self.connections.iter_mut() {
            conn.close();
            transport::shutdown(conn.fd);
        }
    }

    /// Final sweep: close anything the drain did not get to.
    fn close_all(&mut self) {
        let ids: Vec<usize> = self.connections.iter().map(|(id, _)| id).collect();
        for id in ids {
            if let Some(conn) = self.connections.remove(id) {
                self.mux.deregister(conn.fd);
                transport::close(conn.fd);
            }
        }
    }
}
