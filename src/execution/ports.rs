//! Per-run service ports.
//!
//! Contexts that share the host network (local processes, Docker in `host`
//! mode) would collide on a fixed service port, so every context leases
//! its own port and exports it as `FORGE_PORT`. Bundles bind their service
//! to `$FORGE_PORT` and reference it in readiness targets.

use std::collections::HashSet;
use std::net::TcpListener;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Mutex, OnceLock};

/// Variable holding a context's service port.
pub const PORT_VAR: &str = "FORGE_PORT";

const FIRST_PORT: u16 = 20_000;
const LAST_PORT: u16 = 60_000;

static NEXT_PORT: AtomicU16 = AtomicU16::new(FIRST_PORT);
static LEASED: OnceLock<Mutex<HashSet<u16>>> = OnceLock::new();

fn next_candidate() -> u16 {
    loop {
        let current = NEXT_PORT.load(Ordering::Relaxed);
        let next = if current >= LAST_PORT {
            FIRST_PORT
        } else {
            current + 1
        };
        if NEXT_PORT
            .compare_exchange(current, next, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            return current;
        }
    }
}

fn with_leased<T>(f: impl FnOnce(&mut HashSet<u16>) -> T) -> T {
    let leased = LEASED.get_or_init(|| Mutex::new(HashSet::new()));
    let mut guard = match leased.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    f(&mut guard)
}

/// A port reserved for one context until dropped.
#[derive(Debug)]
pub struct PortLease {
    port: u16,
}

impl PortLease {
    /// Leases a port that no live context holds and nothing on the host
    /// is listening on.
    pub fn acquire() -> std::io::Result<Self> {
        for _ in FIRST_PORT..=LAST_PORT {
            let port = next_candidate();
            if !with_leased(|leased| leased.insert(port)) {
                continue;
            }
            if TcpListener::bind(("127.0.0.1", port)).is_ok() {
                return Ok(Self { port });
            }
            with_leased(|leased| leased.remove(&port));
        }
        Err(std::io::Error::new(
            std::io::ErrorKind::AddrInUse,
            "no free service port",
        ))
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        with_leased(|leased| leased.remove(&self.port));
    }
}

/// Substitutes `$FORGE_PORT` / `${FORGE_PORT}` in `text`. Left as is when
/// the context has no service port.
pub fn expand_port(text: &str, port: Option<u16>) -> String {
    match port {
        Some(port) => {
            let port = port.to_string();
            text.replace(&format!("${{{PORT_VAR}}}"), &port)
                .replace(&format!("${PORT_VAR}"), &port)
        }
        None => text.to_string(),
    }
}
