// src/death_queue.rs
use crate::conn::Conn;
use crate::slab::ConnSlab;
use crate::syscalls;

/// Fixed-capacity ring of fds tracking alive connections in arrival
/// order. Every push uses the same keep-alive timeout, so the ring is
/// automatically ordered by expiration and reaping only ever inspects the
/// head. Connections killed by hangup events are skipped lazily when they
/// reach the head, avoiding mid-queue deletion.
pub struct DeathQueue {
    queue: Box<[i32]>,
    first: usize,
    last: usize,
    population: usize,
    max: usize,
    time: u32,
}

impl DeathQueue {
    pub fn new(max: usize) -> Self {
        Self {
            queue: vec![0; max].into_boxed_slice(),
            first: 0,
            last: 0,
            population: 0,
            max,
            time: 0,
        }
    }

    /// Current logical tick. One tick is one second of wall time.
    pub fn time(&self) -> u32 {
        self.time
    }

    pub fn population(&self) -> usize {
        self.population
    }

    /// Timeout for the event-wait primitive: tick once per second while
    /// anything is queued, otherwise sleep indefinitely.
    pub fn epoll_timeout(&self) -> i32 {
        if self.population > 0 {
            1000
        } else {
            -1
        }
    }

    /// Append a connection and mark it alive.
    ///
    /// Precondition: the connection is not already present (alive=false).
    /// A full ring force-reaps its oldest entry first so the server keeps
    /// accepting; the return value reports whether that happened.
    pub fn push(&mut self, slab: &mut ConnSlab, fd: i32) -> bool {
        let mut force_reaped = false;
        if self.population == self.max {
            let victim = self.pop();
            if reap_if_alive(slab, victim) {
                force_reaped = true;
            }
        }

        self.queue[self.last] = fd;
        self.last = (self.last + 1) % self.max;
        self.population += 1;
        if let Some(conn) = slab.get_mut(fd) {
            conn.alive = true;
        }
        force_reaped
    }

    /// Advance the logical clock and reap every expired connection at the
    /// head. O(k) in the number of newly expired entries.
    pub fn tick_and_reap(&mut self, slab: &mut ConnSlab) -> usize {
        self.time += 1;

        let mut reaped = 0;
        while self.population > 0 {
            let fd = self.queue[self.first];

            match slab.get(fd) {
                Some(conn) => {
                    if conn.time_to_die > self.time {
                        break;
                    }
                }
                None => {
                    self.pop();
                    continue;
                }
            }

            self.pop();

            // This connection might have died from a hangup event.
            if reap_if_alive(slab, fd) {
                reaped += 1;
            }
        }
        reaped
    }

    fn pop(&mut self) -> i32 {
        let fd = self.queue[self.first];
        self.first = (self.first + 1) % self.max;
        self.population -= 1;
        fd
    }
}

/// Free a still-alive connection: dropping the task runs its deferred
/// cleanups in reverse registration order, then the fd is closed.
fn reap_if_alive(slab: &mut ConnSlab, fd: i32) -> bool {
    let conn: &mut Conn = match slab.get_mut(fd) {
        Some(c) => c,
        None => return false,
    };
    if !conn.alive {
        return false;
    }

    conn.task = None;
    conn.alive = false;
    conn.should_resume = false;
    conn.fd = -1;
    syscalls::close_fd(fd);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::os::fd::IntoRawFd;

    fn devnull_fd() -> i32 {
        File::open("/dev/null").unwrap().into_raw_fd()
    }

    fn queued_conn(slab: &mut ConnSlab, dq: &mut DeathQueue, timeout: u32) -> i32 {
        let fd = devnull_fd();
        assert!(slab.holds(fd), "test fd {} outside slab", fd);
        slab.get_mut(fd).unwrap().attach(fd, None);
        slab.get_mut(fd).unwrap().time_to_die = dq.time() + timeout;
        dq.push(slab, fd);
        fd
    }

    #[test]
    fn test_expiration_is_monotonic_in_insertion_order() {
        let mut slab = ConnSlab::new(512);
        let mut dq = DeathQueue::new(512);

        let a = queued_conn(&mut slab, &mut dq, 5);
        let b = queued_conn(&mut slab, &mut dq, 5);
        assert!(
            slab.get(a).unwrap().time_to_die <= slab.get(b).unwrap().time_to_die
        );
        assert_eq!(dq.population(), 2);
        assert_eq!(dq.epoll_timeout(), 1000);
    }

    #[test]
    fn test_timeout_is_infinite_when_empty() {
        let dq = DeathQueue::new(4);
        assert_eq!(dq.epoll_timeout(), -1);
    }

    #[test]
    fn test_reap_waits_for_expiry() {
        let mut slab = ConnSlab::new(512);
        let mut dq = DeathQueue::new(512);

        let fd = queued_conn(&mut slab, &mut dq, 2);
        assert_eq!(dq.tick_and_reap(&mut slab), 0);
        assert!(slab.get(fd).unwrap().alive);
        assert_eq!(dq.tick_and_reap(&mut slab), 1);
        assert!(!slab.get(fd).unwrap().alive);
        assert_eq!(dq.population(), 0);
    }

    #[test]
    fn test_hangup_victims_are_skipped_lazily() {
        let mut slab = ConnSlab::new(512);
        let mut dq = DeathQueue::new(512);

        let dead = queued_conn(&mut slab, &mut dq, 1);
        let live = queued_conn(&mut slab, &mut dq, 1);

        // Simulate the worker observing a hangup: alive flips in place.
        let conn = slab.get_mut(dead).unwrap();
        conn.alive = false;
        syscalls::close_fd(dead);

        assert_eq!(dq.tick_and_reap(&mut slab), 1);
        assert!(!slab.get(live).unwrap().alive);
        assert_eq!(dq.population(), 0);
    }

    #[test]
    fn test_full_ring_force_reaps_oldest() {
        let mut slab = ConnSlab::new(512);
        let mut dq = DeathQueue::new(2);

        let oldest = queued_conn(&mut slab, &mut dq, 10);
        let _second = queued_conn(&mut slab, &mut dq, 10);
        let third = queued_conn(&mut slab, &mut dq, 10);

        assert!(!slab.get(oldest).unwrap().alive);
        assert!(slab.get(third).unwrap().alive);
        assert_eq!(dq.population(), 2);
    }
}
