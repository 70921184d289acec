// src/coro.rs
//
// The resumable per-connection task. Each task drives one
// request/response cycle (plus any pipelined requests already buffered)
// as an explicit state machine over non-blocking I/O: resume() runs until
// the next would-block point, records which readiness direction it needs,
// and hands control back to the worker. Only the worker that owns the
// connection ever resumes or frees a task.

use crate::conn::Conn;
use crate::date::DateCache;
use crate::http::{self, HttpStatus, RequestHead};
use crate::metrics::WorkerMetrics;
use crate::parser::{self, ParseError};
use crate::serve_files::{BufferedPayload, CachedFile, ServeFiles, TaskAction};
use crate::syscalls;
use std::mem;

/// Request head read buffer. A head that does not fit is a 500.
const REQUEST_BUFFER_SIZE: usize = 4096;

/// How many times an fd-exhausted open is retried (one event-loop
/// iteration apart) before giving up with a 503.
const MAX_OPEN_ATTEMPTS: u32 = 8;

/// Cleanup handlers registered on a task, released in reverse
/// registration order when the task is freed, even mid-execution.
pub struct DeferList {
    cleanups: Vec<Box<dyn FnOnce() + Send>>,
}

impl DeferList {
    pub fn new() -> Self {
        Self {
            cleanups: Vec::new(),
        }
    }

    pub fn push<F: FnOnce() + Send + 'static>(&mut self, cleanup: F) {
        self.cleanups.push(Box::new(cleanup));
    }

    pub fn len(&self) -> usize {
        self.cleanups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cleanups.is_empty()
    }
}

impl Default for DeferList {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DeferList {
    fn drop(&mut self) {
        while let Some(cleanup) = self.cleanups.pop() {
            cleanup();
        }
    }
}

enum State {
    ReadRequest,
    /// Waiting to open a Large entry's file; fd exhaustion yields here.
    OpenFile {
        entry: CachedFile,
        from: u64,
        len: u64,
        attempts: u32,
    },
    /// Headers flushed with MSG_MORE, then the zero-copy body.
    SendHeadersThenFile {
        file_fd: i32,
        offset: i64,
        end: i64,
        header_written: usize,
    },
    /// Single gather-write of [headers, payload] out of the response
    /// buffer and an optional cached payload window.
    WriteBuffered {
        payload: Option<BufferedPayload>,
        written: usize,
    },
    Finished,
}

enum Flow {
    Continue(State),
    Yield(State, bool),
    Done,
}

pub struct Task {
    state: State,
    read_buf: Box<[u8]>,
    read_len: usize,
    /// Bytes consumed by previously parsed requests (pipelining).
    parsed: usize,
    /// Suspension direction: true when the task yielded waiting to write.
    pub wants_write: bool,
    defer: DeferList,
}

impl Task {
    pub fn new() -> Self {
        Self {
            state: State::ReadRequest,
            read_buf: vec![0; REQUEST_BUFFER_SIZE].into_boxed_slice(),
            read_len: 0,
            parsed: 0,
            wants_write: false,
            defer: DeferList::new(),
        }
    }

    /// Continue until the next yield point or completion. Returns whether
    /// the task is still running (true: call again after the readiness
    /// direction in `wants_write` fires).
    pub fn resume(
        &mut self,
        conn: &mut Conn,
        handler: &ServeFiles,
        dates: &DateCache,
        metrics: &WorkerMetrics,
    ) -> bool {
        loop {
            let state = mem::replace(&mut self.state, State::Finished);
            let flow = match state {
                State::ReadRequest => self.step_read(conn, handler, dates, metrics),
                State::OpenFile {
                    entry,
                    from,
                    len,
                    attempts,
                } => self.step_open(conn, handler, dates, entry, from, len, attempts),
                State::SendHeadersThenFile {
                    file_fd,
                    offset,
                    end,
                    header_written,
                } => self.step_sendfile(conn, metrics, file_fd, offset, end, header_written),
                State::WriteBuffered { payload, written } => {
                    self.step_write_buffered(conn, metrics, payload, written)
                }
                State::Finished => Flow::Done,
            };

            match flow {
                Flow::Continue(next) => self.state = next,
                Flow::Yield(next, wants_write) => {
                    self.state = next;
                    self.wants_write = wants_write;
                    return true;
                }
                Flow::Done => {
                    self.state = State::Finished;
                    return false;
                }
            }
        }
    }

    fn step_read(
        &mut self,
        conn: &mut Conn,
        handler: &ServeFiles,
        dates: &DateCache,
        metrics: &WorkerMetrics,
    ) -> Flow {
        loop {
            // Serve already-buffered bytes first so pipelined requests go
            // out in arrival order without touching the socket.
            if self.read_len > self.parsed {
                let outcome =
                    match parser::parse_request(&self.read_buf[self.parsed..self.read_len]) {
                        Ok((req, consumed)) => {
                            conn.reset_for_request();
                            Some((RequestHead::parse(&req, &mut conn.query), consumed))
                        }
                        Err(ParseError::Incomplete) => None,
                        Err(_) => {
                            // Malformed request: close without a response.
                            conn.is_keep_alive = false;
                            return Flow::Done;
                        }
                    };

                match outcome {
                    Some((head, consumed)) => {
                        self.parsed += consumed;
                        conn.is_keep_alive = head.keep_alive;
                        metrics.inc_req();
                        let next = self.dispatch(head, conn, handler, dates);
                        return Flow::Continue(next);
                    }
                    None => {
                        // Reclaim bytes consumed by previously served
                        // pipelined requests before judging the partial
                        // head against the buffer capacity.
                        if self.parsed > 0 {
                            self.read_buf.copy_within(self.parsed..self.read_len, 0);
                            self.read_len -= self.parsed;
                            self.parsed = 0;
                        }

                        if self.read_len == self.read_buf.len() {
                            // The request head overflowed the buffer.
                            conn.is_keep_alive = false;
                            http::fill_error_response(
                                &mut conn.response_buf,
                                HttpStatus::InternalError,
                                dates,
                                false,
                            );
                            return Flow::Continue(State::WriteBuffered {
                                payload: None,
                                written: 0,
                            });
                        }
                    }
                }
            }

            match syscalls::read_nonblocking(conn.fd, &mut self.read_buf[self.read_len..]) {
                Ok(Some(0)) => {
                    // Peer closed its end.
                    conn.is_keep_alive = false;
                    return Flow::Done;
                }
                Ok(Some(n)) => self.read_len += n,
                Ok(None) => return Flow::Yield(State::ReadRequest, false),
                Err(_) => {
                    conn.is_keep_alive = false;
                    return Flow::Done;
                }
            }
        }
    }

    fn dispatch(
        &mut self,
        head: RequestHead,
        conn: &mut Conn,
        handler: &ServeFiles,
        dates: &DateCache,
    ) -> State {
        match handler.handle(&head, conn, dates, &mut self.defer) {
            TaskAction::WriteBuffered { payload } => State::WriteBuffered {
                payload,
                written: 0,
            },
            TaskAction::OpenAndSendfile { entry, from, len } => State::OpenFile {
                entry,
                from,
                len,
                attempts: 0,
            },
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn step_open(
        &mut self,
        conn: &mut Conn,
        handler: &ServeFiles,
        dates: &DateCache,
        entry: CachedFile,
        from: u64,
        len: u64,
        attempts: u32,
    ) -> Flow {
        match handler.open_for_sendfile(&entry.value, &mut self.defer) {
            Ok(file_fd) => Flow::Continue(State::SendHeadersThenFile {
                file_fd,
                offset: from as i64,
                end: (from + len) as i64,
                header_written: 0,
            }),
            Err(errno) if errno == libc::ENFILE || errno == libc::EMFILE => {
                // The fd table is exhausted; yield so the event loop can
                // close something, then retry.
                if attempts + 1 < MAX_OPEN_ATTEMPTS {
                    Flow::Yield(
                        State::OpenFile {
                            entry,
                            from,
                            len,
                            attempts: attempts + 1,
                        },
                        true,
                    )
                } else {
                    self.error_response(conn, dates, HttpStatus::Unavailable)
                }
            }
            Err(libc::EACCES) => self.error_response(conn, dates, HttpStatus::Forbidden),
            Err(_) => self.error_response(conn, dates, HttpStatus::NotFound),
        }
    }

    fn error_response(&mut self, conn: &mut Conn, dates: &DateCache, status: HttpStatus) -> Flow {
        http::fill_error_response(&mut conn.response_buf, status, dates, conn.is_keep_alive);
        Flow::Continue(State::WriteBuffered {
            payload: None,
            written: 0,
        })
    }

    fn step_sendfile(
        &mut self,
        conn: &mut Conn,
        metrics: &WorkerMetrics,
        file_fd: i32,
        mut offset: i64,
        end: i64,
        mut header_written: usize,
    ) -> Flow {
        while header_written < conn.response_buf.len() {
            match syscalls::send_with_more(conn.fd, &conn.response_buf[header_written..]) {
                Ok(Some(n)) if n > 0 => {
                    header_written += n;
                    metrics.add_bytes(n);
                }
                Ok(Some(_)) | Err(_) => {
                    conn.is_keep_alive = false;
                    return Flow::Done;
                }
                Ok(None) => {
                    return Flow::Yield(
                        State::SendHeadersThenFile {
                            file_fd,
                            offset,
                            end,
                            header_written,
                        },
                        true,
                    )
                }
            }
        }

        while offset < end {
            let remaining = (end - offset) as usize;
            match syscalls::sendfile(conn.fd, file_fd, &mut offset, remaining) {
                Ok(Some(n)) if n > 0 => metrics.add_bytes(n),
                Ok(Some(_)) | Err(_) => {
                    // Truncated under us or the peer went away.
                    conn.is_keep_alive = false;
                    return Flow::Done;
                }
                Ok(None) => {
                    return Flow::Yield(
                        State::SendHeadersThenFile {
                            file_fd,
                            offset,
                            end,
                            header_written,
                        },
                        true,
                    )
                }
            }
        }

        self.end_of_cycle(conn)
    }

    fn step_write_buffered(
        &mut self,
        conn: &mut Conn,
        metrics: &WorkerMetrics,
        payload: Option<BufferedPayload>,
        mut written: usize,
    ) -> Flow {
        loop {
            let header = conn.response_buf.as_slice();
            let body: &[u8] = payload.as_ref().map(BufferedPayload::bytes).unwrap_or(&[]);
            let total = header.len() + body.len();

            if written >= total {
                return self.end_of_cycle(conn);
            }

            let result = if written < header.len() {
                syscalls::writev_nonblocking(
                    conn.fd,
                    &[&header[written..], body],
                )
            } else {
                syscalls::write_nonblocking(conn.fd, &body[written - header.len()..])
            };

            match result {
                Ok(Some(n)) if n > 0 => {
                    written += n;
                    metrics.add_bytes(n);
                }
                Ok(Some(_)) | Err(_) => {
                    conn.is_keep_alive = false;
                    return Flow::Done;
                }
                Ok(None) => {
                    return Flow::Yield(State::WriteBuffered { payload, written }, true);
                }
            }
        }
    }

    /// The response is fully written. Keep going if the connection is
    /// keep-alive and another pipelined request is already buffered.
    fn end_of_cycle(&mut self, conn: &mut Conn) -> Flow {
        if conn.is_keep_alive && self.read_len > self.parsed {
            Flow::Continue(State::ReadRequest)
        } else {
            Flow::Done
        }
    }
}

impl Default for Task {
    fn default() -> Self {
        Self::new()
    }
}
