//! echo-client: interactive client for the completion-driven echo server.
//!
//! One background thread exclusively drains completions while the
//! foreground thread reads stdin lines and hands send requests to the
//! background thread over a channel, so each operation context has
//! exactly one submitter and is freed by the thread that observes its
//! completion. Typing `exit` closes the session.

#[cfg(target_os = "linux")]
mod client {
    use clap::Parser;
    use echo_ring::runtime::context::{ContextPool, OpKind};
    use echo_ring::runtime::multiplexer::{Multiplexer, WaitOutcome};
    use echo_ring::runtime::transport;
    use std::io::{self, BufRead};
    use std::net::SocketAddr;
    use std::os::unix::io::{AsRawFd, RawFd};
    use std::sync::mpsc::{self, Receiver};
    use std::thread;
    use std::time::Duration;
    use tracing::{debug, error, warn};

    /// Command-line arguments for the echo client
    #[derive(Parser, Debug)]
    #[command(name = "echo-client")]
    #[command(version = "0.1.0")]
    #[command(about = "Interactive client for the echo server", long_about = None)]
    struct CliArgs {
        /// Server address to connect to
        #[arg(short, long, default_value = "127.0.0.1:8888")]
        addr: String,

        /// Per-operation I/O buffer capacity in bytes
        #[arg(short = 'b', long, default_value_t = 1024)]
        buffer_size: usize,

        /// Completion-wait timeout in milliseconds (also the tick at
        /// which queued send requests are picked up)
        #[arg(short = 't', long, default_value_t = 100)]
        wait_timeout_ms: u64,

        /// Log level (trace, debug, info, warn, error)
        #[arg(long, default_value = "warn")]
        log_level: String,
    }

    /// Requests handed from the foreground thread to the drain thread.
    enum Request {
        /// Submit a send with this payload.
        Send(Vec<u8>),
        /// Shut the endpoint down; the drain thread exits once the
        /// outstanding receive reports the close.
        Shutdown,
    }

    pub fn main() -> Result<(), Box<dyn std::error::Error>> {
        let args = CliArgs::parse();

        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
            )
            .with_target(false)
            .init();

        let addr: SocketAddr = args.addr.parse()?;
        let stream = transport::connect(addr)?;
        let fd = stream.as_raw_fd();
        println!("Connected to {addr}.");

        let mut mux = Multiplexer::new(64)?;
        mux.register(fd)
            .map_err(|e| io::Error::new(io::ErrorKind::AlreadyExists, e.to_string()))?;

        let pool = ContextPool::new(64, args.buffer_size);
        let timeout = Duration::from_millis(args.wait_timeout_ms);

        let (tx, rx) = mpsc::channel::<Request>();

        let worker = thread::Builder::new()
            .name("completion-drain".to_string())
            .spawn(move || drain_loop(fd, mux, pool, rx, timeout))?;

        println!("Enter messages to send to the server. Type 'exit' to quit.");
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let line = line?;
            if line == "exit" {
                let _ = tx.send(Request::Shutdown);
                break;
            }
            if tx.send(Request::Send(line.into_bytes())).is_err() {
                // Drain thread already exited (server closed the session).
                break;
            }
        }
        // stdin EOF counts as exit
        let _ = tx.send(Request::Shutdown);

        let _ = worker.join();
        Ok(())
    }

    /// Background thread: the sole consumer of completions.
    fn drain_loop(
        fd: RawFd,
        mut mux: Multiplexer,
        mut pool: ContextPool,
        rx: Receiver<Request>,
        timeout: Duration,
    ) {
        let mux = &mut mux;
        let pool = &mut pool;

        if !post_recv(fd, mux, pool) {
            return;
        }

        loop {
            // Pick up foreground requests between waits.
            while let Ok(request) = rx.try_recv() {
                match request {
                    Request::Send(msg) => post_send(fd, mux, pool, &msg),
                    Request::Shutdown => transport::shutdown(fd),
                }
            }

            let completion = match mux.wait(timeout) {
                Ok(WaitOutcome::Completion(completion)) => completion,
                Ok(WaitOutcome::Timeout) => continue,
                Err(e) => {
                    error!(error = %e, "Multiplexer failed");
                    return;
                }
            };

            let kind = match pool.get(completion.token) {
                Some(ctx) => ctx.kind,
                None => {
                    warn!(token = completion.token, "Unknown token in completion");
                    continue;
                }
            };

            match kind {
                OpKind::Recv { .. } => match completion.bytes() {
                    Ok(0) => {
                        println!("Server closed connection.");
                        pool.release(completion.token);
                        return;
                    }
                    Ok(n) => {
                        if let Some(ctx) = pool.get(completion.token) {
                            let text = String::from_utf8_lossy(&ctx.buf[..n]);
                            println!("Received echo from server: {text}");
                        }
                        pool.release(completion.token);
                        if !post_recv(fd, mux, pool) {
                            return;
                        }
                    }
                    Err(e) => {
                        println!("Receive failed: {e}");
                        pool.release(completion.token);
                        return;
                    }
                },
                OpKind::Send { .. } => {
                    if let Err(e) = completion.bytes() {
                        warn!(error = %e, "Send failed");
                    } else {
                        debug!("Message sent to server");
                    }
                    pool.release(completion.token);
                }
                OpKind::Accept => {
                    warn!("Unexpected accept completion on client");
                    pool.release(completion.token);
                }
            }
        }
    }

    fn post_recv(fd: RawFd, mux: &mut Multiplexer, pool: &mut ContextPool) -> bool {
        let token = match pool.acquire(OpKind::Recv { conn_id: 0 }) {
            Some(token) => token,
            None => {
                error!("Context pool exhausted");
                return false;
            }
        };

        let ptr = pool.buf_ptr(token);
        let len = pool.buffer_size();
        if let Err(e) = unsafe { mux.submit_recv(fd, ptr, len, token) } {
            error!(error = %e, "Failed to submit receive");
            pool.release(token);
            return false;
        }
        true
    }

    fn post_send(fd: RawFd, mux: &mut Multiplexer, pool: &mut ContextPool, msg: &[u8]) {
        let token = match pool.acquire(OpKind::Send { conn_id: 0 }) {
            Some(token) => token,
            None => {
                warn!("Context pool exhausted, message dropped");
                return;
            }
        };

        // Over-length messages are truncated, as the server would
        // truncate them anyway.
        let len = {
            let ctx = match pool.get_mut(token) {
                Some(ctx) => ctx,
                None => return,
            };
            let len = msg.len().min(ctx.buf.len());
            ctx.buf[..len].copy_from_slice(&msg[..len]);
            ctx.len = len;
            len
        };

        let ptr = pool.buf_ptr(token);
        if let Err(e) = unsafe { mux.submit_send(fd, ptr, len, token) } {
            warn!(error = %e, "Failed to submit send");
            pool.release(token);
        }
    }
}

#[cfg(target_os = "linux")]
fn main() -> Result<(), Box<dyn std::error::Error>> {
    client::main()
}

#[cfg(not(target_os = "linux"))]
fn main() {
    eprintln!("echo-client requires Linux io_uring");
    std::process::exit(1);
}
