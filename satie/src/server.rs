// src/server.rs
use crate::config::Config;
use crate::error::SatieResult;
use crate::metrics::WorkerMetrics;
use crate::serve_files::ServeFiles;
use crate::syscalls;
use crate::worker::Worker;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info};

/// A bound, not-yet-running server. Binding happens in [`Server::bind`]
/// so the resolved port (relevant when binding port 0) is known before
/// [`Server::serve`] blocks.
pub struct Server {
    config: Config,
    listen_fd: i32,
    local_port: u16,
}

impl Server {
    pub fn bind(config: Config) -> SatieResult<Self> {
        config.validate()?;
        let listen_fd = syscalls::create_listen_socket(&config.server_host, config.server_port)?;
        let local_port = syscalls::local_port(listen_fd)?;
        Ok(Self {
            config,
            listen_fd,
            local_port,
        })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Run until SIGINT.
    pub fn serve(self) -> SatieResult<()> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown.clone();
        ctrlc::set_handler(move || {
            info!("received SIGINT, initiating graceful shutdown");
            shutdown_clone.store(true, Ordering::SeqCst);
        })
        .map_err(|e| crate::error::SatieError::Other(format!("signal handler: {}", e)))?;

        self.serve_with_shutdown(shutdown)
    }

    /// Run until the shared flag flips. Workers are signalled by closing
    /// their epoll fds, which makes the event wait fail and the loop
    /// exit; they are then joined.
    pub fn serve_with_shutdown(self, shutdown: Arc<AtomicBool>) -> SatieResult<()> {
        // Writes to reset peers must fail with EPIPE, not kill the process.
        unsafe {
            libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        }

        let handler = Arc::new(ServeFiles::new(&self.config)?);
        let workers = self.config.worker_threads;
        let core_ids = core_affinity::get_core_ids().unwrap_or_default();

        let mut worker_metrics = Vec::with_capacity(workers);
        for _ in 0..workers {
            worker_metrics.push(Arc::new(WorkerMetrics::new()));
        }

        // ---- Per-worker pipes and epoll fds ----
        let mut pipe_write_fds = Vec::with_capacity(workers);
        let mut pipe_read_fds = Vec::with_capacity(workers);
        let mut epoll_fds = Vec::with_capacity(workers);

        for _ in 0..workers {
            let (read_fd, write_fd) = syscalls::create_pipe()?;
            pipe_read_fds.push(read_fd);
            pipe_write_fds.push(write_fd);
            epoll_fds.push(syscalls::epoll_create()?);
        }

        // ---- Metrics reporter ----
        let metrics_clones = worker_metrics.clone();
        let shutdown_metrics = shutdown.clone();
        thread::Builder::new()
            .name("satie-metrics".to_string())
            .spawn(move || {
                while !shutdown_metrics.load(Ordering::Acquire) {
                    thread::sleep(Duration::from_secs(5));
                    if shutdown_metrics.load(Ordering::Acquire) {
                        break;
                    }

                    let mut total_reqs = 0;
                    let mut total_active = 0;
                    let mut total_bytes = 0;
                    let mut total_reaped = 0;

                    for m in &metrics_clones {
                        total_reqs += m.req_count.load(Ordering::Relaxed);
                        total_active += m.active_conns.load(Ordering::Relaxed);
                        total_bytes += m.bytes_sent.load(Ordering::Relaxed);
                        total_reaped += m.reaped_conns.load(Ordering::Relaxed);
                    }

                    debug!(
                        active_connections = total_active,
                        total_requests = total_reqs,
                        bytes_sent = total_bytes,
                        reaped_connections = total_reaped,
                        "metrics"
                    );
                }
            })
            .ok();

        // ---- Worker threads ----
        let mut handles = Vec::with_capacity(workers);
        info!(
            workers,
            root = %self.config.root_path,
            "starting on {}:{}",
            self.config.server_host,
            self.local_port
        );

        for i in 0..workers {
            let core_id = core_ids.get(i % core_ids.len().max(1)).copied();
            let handler = handler.clone();
            let metrics = worker_metrics[i].clone();
            let epoll_fd = epoll_fds[i];
            let pipe_fd = pipe_read_fds[i];
            let max_fd = self.config.worker_max_fd;
            let keep_alive_timeout = self.config.keep_alive_timeout;

            let handle = thread::Builder::new()
                .name(format!("satie-worker-{}", i))
                .spawn(move || {
                    if let Some(id) = core_id {
                        if core_affinity::set_for_current(id) {
                            debug!(worker = i, cpu = id.id, "pinned");
                        }
                    }

                    let mut worker = Worker::new(
                        i,
                        epoll_fd,
                        pipe_fd,
                        handler,
                        metrics,
                        max_fd,
                        keep_alive_timeout,
                    );
                    worker.run();
                })?;

            handles.push(handle);
        }

        // ---- Acceptor thread ----
        let listen_fd = self.listen_fd;
        let shutdown_accept = shutdown.clone();
        let acceptor_handle = thread::Builder::new()
            .name("satie-acceptor".to_string())
            .spawn(move || {
                let epoll = match syscalls::Epoll::new() {
                    Ok(e) => e,
                    Err(e) => {
                        error!("acceptor: failed to create epoll: {}", e);
                        return;
                    }
                };
                if let Err(e) = epoll.add(listen_fd, 0, libc::EPOLLIN as u32) {
                    error!("acceptor: failed to register listen fd: {}", e);
                    return;
                }

                let mut events = vec![syscalls::epoll_event { events: 0, u64: 0 }; 64];
                let mut next_worker: usize = 0;
                let num_workers = pipe_write_fds.len();

                while !shutdown_accept.load(Ordering::Acquire) {
                    let n = match epoll.wait(&mut events, 500) {
                        Ok(n) => n,
                        Err(_) => break,
                    };

                    for _ in 0..n {
                        // Drain the accept queue
                        loop {
                            match syscalls::accept_connection(listen_fd) {
                                Ok(Some(client_fd)) => {
                                    // Round-robin to workers
                                    let target = next_worker % num_workers;
                                    next_worker = next_worker.wrapping_add(1);

                                    if syscalls::send_fd_over_pipe(
                                        pipe_write_fds[target],
                                        client_fd,
                                    )
                                    .is_err()
                                    {
                                        syscalls::close_fd(client_fd);
                                    }
                                }
                                Ok(None) => break, // WouldBlock
                                Err(_) => break,
                            }
                        }
                    }
                }

                syscalls::close_fd(listen_fd);
                for fd in &pipe_write_fds {
                    syscalls::close_fd(*fd);
                }
                debug!("acceptor thread exiting");
            })?;

        // ---- Wait for shutdown ----
        while !shutdown.load(Ordering::Acquire) {
            thread::sleep(Duration::from_millis(100));
        }

        let _ = acceptor_handle.join();

        // Closing the epoll fds forces each worker's wait to fail, which
        // is its signal to drain and exit.
        for fd in &epoll_fds {
            syscalls::close_fd(*fd);
        }
        for handle in handles {
            let _ = handle.join();
        }

        let (hits, misses, evictions) = handler.cache_stats();
        debug!(hits, misses, evictions, "cache stats");

        info!("shut down");
        Ok(())
    }
}
