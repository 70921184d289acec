// src/worker.rs
use crate::coro::Task;
use crate::date::DateCache;
use crate::death_queue::DeathQueue;
use crate::metrics::WorkerMetrics;
use crate::serve_files::ServeFiles;
use crate::slab::ConnSlab;
use crate::syscalls::{self, epoll_event, Epoll, HANGUP_EVENTS, READ_EVENTS, WRITE_EVENTS};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Reserved epoll token for the acceptor pipe.
const PIPE_TOKEN: u64 = u64::MAX;

/// The pipe is watched level-triggered so the hangup the acceptor raises
/// at shutdown keeps waking an otherwise idle worker until it observes
/// its closed epoll fd.
const PIPE_EVENTS: u32 = (libc::EPOLLIN | libc::EPOLLERR) as u32;

pub struct Worker {
    id: usize,
    /// Owned by the server; closing it is the shutdown signal.
    epoll_fd: i32,
    /// Read end of the pipe the acceptor distributes client fds over.
    pipe_fd: i32,
    handler: Arc<ServeFiles>,
    metrics: Arc<WorkerMetrics>,
    max_fd: usize,
    keep_alive_timeout: u32,
}

impl Worker {
    pub fn new(
        id: usize,
        epoll_fd: i32,
        pipe_fd: i32,
        handler: Arc<ServeFiles>,
        metrics: Arc<WorkerMetrics>,
        max_fd: usize,
        keep_alive_timeout: u32,
    ) -> Self {
        Self {
            id,
            epoll_fd,
            pipe_fd,
            handler,
            metrics,
            max_fd,
            keep_alive_timeout,
        }
    }

    pub fn run(&mut self) {
        let epoll = Epoll::from_raw(self.epoll_fd);
        let mut slab = ConnSlab::new(self.max_fd);
        let mut dq = DeathQueue::new(self.max_fd);
        let mut dates = DateCache::new();
        let mut events = vec![epoll_event { events: 0, u64: 0 }; self.max_fd.min(1024)];

        if let Err(e) = epoll.add(self.pipe_fd, PIPE_TOKEN, PIPE_EVENTS) {
            warn!(worker = self.id, "failed to register acceptor pipe: {}", e);
            return;
        }

        info!(worker = self.id, "entering event loop");

        loop {
            let n = match epoll.wait(&mut events, dq.epoll_timeout()) {
                Ok(n) => n,
                Err(e) => match e.raw_os_error() {
                    // The server closed our epoll fd: shut down.
                    Some(libc::EBADF) | Some(libc::EINVAL) => break,
                    _ => continue,
                },
            };

            dates.refresh();

            if n == 0 {
                // Timeout: shut down idle keep-alive connections.
                let reaped = dq.tick_and_reap(&mut slab);
                if reaped > 0 {
                    trace!(worker = self.id, reaped, "reaped idle connections");
                    self.metrics.add_reaped(reaped);
                }
                continue;
            }

            for event in &events[..n] {
                if event.u64 == PIPE_TOKEN {
                    self.drain_pipe(&epoll, &mut slab);
                    continue;
                }

                let fd = event.u64 as i32;
                if !slab.holds(fd) {
                    continue;
                }

                if event.events & HANGUP_EVENTS != 0 {
                    self.handle_hangup(&mut slab, fd);
                    continue;
                }

                self.service(&epoll, &mut slab, fd, &dates);

                // Keep-alive connections and suspended tasks get a fresh
                // deadline; everything else is reaped on the next tick.
                let time = dq.time();
                let timeout = self.keep_alive_timeout;
                let mut needs_push = false;
                if let Some(conn) = slab.get_mut(fd) {
                    conn.time_to_die = time
                        + if conn.is_keep_alive || conn.should_resume {
                            timeout
                        } else {
                            0
                        };
                    needs_push = !conn.alive && conn.fd >= 0;
                }
                if needs_push && dq.push(&mut slab, fd) {
                    self.metrics.add_reaped(1);
                }
            }
        }

        info!(worker = self.id, "event loop closed, draining connections");

        for fd in 0..slab.capacity() as i32 {
            if let Some(conn) = slab.get_mut(fd) {
                if conn.fd >= 0 {
                    conn.task = None;
                    conn.alive = false;
                    conn.fd = -1;
                    syscalls::close_fd(fd);
                }
            }
        }
    }

    /// Register the client fds the acceptor handed us.
    fn drain_pipe(&self, epoll: &Epoll, slab: &mut ConnSlab) {
        loop {
            match syscalls::recv_fd_from_pipe(self.pipe_fd) {
                Ok(Some(client_fd)) => {
                    if !slab.holds(client_fd) {
                        // fd value outside the slab: refuse (backpressure).
                        warn!(
                            worker = self.id,
                            fd = client_fd,
                            "connection refused, fd exceeds slab capacity"
                        );
                        syscalls::close_fd(client_fd);
                        continue;
                    }

                    if let Err(e) = epoll.add(client_fd, client_fd as u64, READ_EVENTS) {
                        debug!(worker = self.id, "epoll add failed: {}", e);
                        syscalls::close_fd(client_fd);
                        continue;
                    }

                    let remote_addr = syscalls::peer_addr(client_fd);
                    if let Some(conn) = slab.get_mut(client_fd) {
                        conn.attach(client_fd, remote_addr);
                        trace!(worker = self.id, fd = client_fd, peer = ?conn.remote_addr, "accepted");
                    }
                    self.metrics.inc_conn();
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(worker = self.id, "acceptor pipe read failed: {}", e);
                    break;
                }
            }
        }
    }

    /// Hangup or peer reset: flip alive in place and close the fd. The
    /// task is not freed here; the expiration queue drains it lazily.
    fn handle_hangup(&self, slab: &mut ConnSlab, fd: i32) {
        if let Some(conn) = slab.get_mut(fd) {
            if conn.fd >= 0 {
                conn.fd = -1;
                conn.alive = false;
                conn.should_resume = false;
                syscalls::close_fd(fd);
                self.metrics.dec_conn();
            }
        }
    }

    /// Drive the connection's task through one resume, spawning it first
    /// if needed, then re-arm the multiplexor if the suspension direction
    /// changed.
    fn service(&self, epoll: &Epoll, slab: &mut ConnSlab, fd: i32, dates: &DateCache) {
        let conn = match slab.get_mut(fd) {
            Some(c) => c,
            None => return,
        };
        if conn.fd < 0 {
            return;
        }

        // A task that finished its cycle is freed before anything else;
        // its deferred cleanups run now.
        if conn.task.is_some() && !conn.should_resume {
            conn.task = None;
        }

        if conn.task.is_none() {
            conn.task = Some(Box::new(Task::new()));
            conn.should_resume = true;
            conn.write_events = false;
        }

        if !conn.should_resume {
            return;
        }

        let mut task = match conn.task.take() {
            Some(t) => t,
            None => return,
        };
        let still_running = task.resume(conn, &self.handler, dates, &self.metrics);
        let wants_write = task.wants_write;
        conn.task = Some(task);
        conn.should_resume = still_running;

        // A suspended task is armed for the direction it blocked on; a
        // finished one goes back to edge-triggered reads for the next
        // request on the connection.
        let desired_write = still_running && wants_write;
        if desired_write != conn.write_events {
            let interest = if desired_write {
                WRITE_EVENTS
            } else {
                READ_EVENTS
            };
            if let Err(e) = epoll.modify(fd, fd as u64, interest) {
                debug!(worker = self.id, "epoll modify failed: {}", e);
            }
            conn.write_events = desired_write;
        }
    }
}
