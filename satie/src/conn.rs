// src/conn.rs
use crate::coro::Task;
use std::net::SocketAddr;

/// Per-connection record. One lives in the worker's slab for every
/// possible fd value; the fd doubles as the slab index.
pub struct Conn {
    pub fd: i32,
    pub remote_addr: Option<SocketAddr>,
    /// The resumable task driving this connection. Created on first
    /// activity, owned solely by this record, dropped when the connection
    /// dies or the task completes a non-keep-alive request.
    pub task: Option<Box<Task>>,
    /// Response buffer reused across requests on the same connection.
    pub response_buf: Vec<u8>,
    /// Parsed query-string key/value sequence; empty for most requests and
    /// only allocates once a request actually carries parameters.
    pub query: Vec<(String, String)>,

    /// True iff the connection is in the expiration queue and its fd open.
    pub alive: bool,
    pub should_resume: bool,
    /// Which direction the multiplexor is currently armed for.
    pub write_events: bool,
    pub is_keep_alive: bool,
    /// Logical tick at which the connection is reaped if still idle.
    pub time_to_die: u32,
}

impl Conn {
    /// A fresh unused connection slot.
    pub fn empty() -> Self {
        Self {
            fd: -1,
            remote_addr: None,
            task: None,
            response_buf: Vec::new(),
            query: Vec::new(),
            alive: false,
            should_resume: false,
            write_events: false,
            is_keep_alive: false,
            time_to_die: 0,
        }
    }

    /// Take ownership of a freshly accepted socket. Buffers are kept so
    /// their capacity survives slot reuse.
    pub fn attach(&mut self, fd: i32, remote_addr: Option<SocketAddr>) {
        self.fd = fd;
        self.remote_addr = remote_addr;
        self.task = None;
        self.alive = false;
        self.should_resume = false;
        self.write_events = false;
        self.is_keep_alive = false;
        self.time_to_die = 0;
        self.response_buf.clear();
        self.query.clear();
    }

    /// Reset per-request mutable state, preserving the task handle, fd,
    /// buffer ownership and remote address. Query storage from the
    /// previous request is released.
    pub fn reset_for_request(&mut self) {
        self.query = Vec::new();
        self.response_buf.clear();
        self.is_keep_alive = false;
    }
}

impl Default for Conn {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_preserves_connection_identity() {
        let mut conn = Conn::empty();
        conn.attach(9, None);
        conn.response_buf.extend_from_slice(b"previous response");
        conn.query.push(("a".into(), "1".into()));
        conn.is_keep_alive = true;

        conn.reset_for_request();

        assert_eq!(conn.fd, 9);
        assert!(conn.response_buf.is_empty());
        assert!(conn.query.is_empty());
        assert!(!conn.is_keep_alive);
    }
}
