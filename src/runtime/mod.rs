//! Completion-driven runtime for the echo service.
//!
//! Linux-only: io_uring provides the completion queue. Shared
//! abstractions:
//! - `ContextPool`: per-operation context and buffer management
//! - `Connection`: per-connection echo state machine
//! - `Multiplexer`: the shared completion queue and routing table
//! - `Listener`: the accept state machine
//! - `Server`: the single-threaded dispatch loop

pub mod connection;
pub mod context;
pub mod echo;

#[cfg(target_os = "linux")]
pub mod event_loop;
#[cfg(target_os = "linux")]
pub mod listener;
#[cfg(target_os = "linux")]
pub mod multiplexer;
#[cfg(target_os = "linux")]
pub mod transport;

pub use connection::{Connection, ConnectionRegistry, EchoState};
pub use context::{ContextPool, OpKind, OperationContext};

#[cfg(target_os = "linux")]
pub use event_loop::Server;
#[cfg(target_os = "linux")]
pub use listener::Listener;
#[cfg(target_os = "linux")]
pub use multiplexer::{Completion, Multiplexer, RegistrationError, WaitOutcome};

use crate::config::Config;
use std::io;

/// Run the echo server until SIGINT or SIGTERM.
#[cfg(target_os = "linux")]
pub fn run(config: Config) -> io::Result<()> {
    let server = Server::bind(config)?;
    signal::install(server.shutdown_handle());
    server.run()
}

/// Run the echo server.
#[cfg(not(target_os = "linux"))]
pub fn run(_config: Config) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "Unsupported platform: the completion runtime requires Linux io_uring",
    ))
}

#[cfg(target_os = "linux")]
mod signal {
    //! Process-signal bridge to the dispatch loop's shutdown flag.
    //!
    //! The handler only stores into an atomic; the loop observes the flag
    //! on its next timeout tick.

    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, OnceLock};

    static SHUTDOWN: OnceLock<Arc<AtomicBool>> = OnceLock::new();

    extern "C" fn on_signal(_sig: libc::c_int) {
        if let Some(flag) = SHUTDOWN.get() {
            flag.store(true, Ordering::Relaxed);
        }
    }

    pub fn install(flag: Arc<AtomicBool>) {
        let _ = SHUTDOWN.set(flag);
        unsafe {
            libc::signal(libc::SIGINT, on_signal as libc::sighandler_t);
            libc::signal(libc::SIGTERM, on_signal as libc::sighandler_t);
        }
    }
}
