// src/serve_files.rs
//
// The file handler: resolves request paths under a pinned root directory,
// builds response artifacts (in-memory for small files, zero-copy handles
// for large ones, pre-rendered HTML for directories) and keeps them in
// the shared content cache.

use crate::cache::{Cache, CacheMiss, Entry};
use crate::config::Config;
use crate::conn::Conn;
use crate::coro::DeferList;
use crate::date::{self, DateCache};
use crate::dirlist::{self, ListingEntry};
use crate::error::SatieResult;
use crate::http::{self, HttpStatus, Method, RequestHead};
use crate::mime;
use crate::syscalls;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use libc::c_int;
use memmap2::{Advice, Mmap};
use std::fs::File;
use std::io::Write;
use std::os::fd::FromRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Files under this size are mapped and pre-compressed into memory; at or
/// above it they are sent with zero-copy transfers instead.
pub const SMALL_FILE_THRESHOLD: u64 = 16384;

/// A compressed copy is only worth keeping if it saves more than the
/// header it costs to announce it.
const COMPRESSED_HEADER_OVERHEAD: usize = "Content-Encoding: deflate\r\n".len();

/// Directories nested as their own index are resolved at most this deep.
const MAX_INDEX_DEPTH: u32 = 4;

pub type CachedFile = Arc<Entry<FileEntry>>;

/// What the handler asks the task to do next.
pub enum TaskAction {
    /// The response head (and any inline body) is in the connection's
    /// response buffer, optionally followed by a window of a cached
    /// payload.
    WriteBuffered { payload: Option<BufferedPayload> },
    /// Open the entry's file relative to the root and transfer
    /// `[from, from + len)` with sendfile after the buffered head.
    OpenAndSendfile {
        entry: CachedFile,
        from: u64,
        len: u64,
    },
}

/// The byte window of a cached artifact a buffered response sends.
pub struct BufferedPayload {
    pub entry: CachedFile,
    pub compressed: bool,
    pub from: usize,
    pub len: usize,
}

impl BufferedPayload {
    pub fn bytes(&self) -> &[u8] {
        let all = if self.compressed {
            self.entry.value.compressed().unwrap_or(&[])
        } else {
            self.entry.value.uncompressed()
        };
        all.get(self.from..self.from + self.len).unwrap_or(&[])
    }
}

pub enum Variant {
    /// Memory-mapped contents plus a zlib-deflate copy when compression
    /// actually saves space. Empty files carry no map.
    Small {
        map: Option<Mmap>,
        compressed: Option<Vec<u8>>,
    },
    /// Identifier for later zero-copy transmission.
    Large { filename: PathBuf, size: u64 },
    /// Fully rendered HTML directory listing.
    Dir { rendered: Vec<u8> },
}

pub struct FileEntry {
    pub last_modified_str: String,
    pub last_modified: i64,
    pub mime_type: &'static str,
    pub variant: Variant,
}

impl FileEntry {
    pub fn uncompressed(&self) -> &[u8] {
        match &self.variant {
            Variant::Small { map, .. } => map.as_deref().unwrap_or(&[]),
            Variant::Dir { rendered } => rendered,
            Variant::Large { .. } => &[],
        }
    }

    pub fn compressed(&self) -> Option<&[u8]> {
        match &self.variant {
            Variant::Small { compressed, .. } => compressed.as_deref(),
            _ => None,
        }
    }
}

pub struct ServeFiles {
    /// Canonical absolute root path; prefix checks compare against it.
    root_path: PathBuf,
    /// Open directory fd all file I/O is performed relative to, resisting
    /// root-path swaps after startup.
    root_fd: c_int,
    extra_modes: c_int,
    index_html: String,
    cache: Cache<FileEntry>,
}

impl ServeFiles {
    pub fn new(config: &Config) -> SatieResult<Self> {
        let root_path = std::fs::canonicalize(&config.root_path)?;
        let (root_fd, extra_modes) = syscalls::open_root(&root_path)?;

        Ok(Self {
            root_path,
            root_fd,
            extra_modes,
            index_html: config.index_html.clone(),
            cache: Cache::new(config.cache_ttl),
        })
    }

    pub fn cache_stats(&self) -> (u64, u64, u64) {
        self.cache.stats()
    }

    /// Serve one request: resolve through the cache and describe the
    /// response for the task to write. Every failure is absorbed into a
    /// canned error response here; nothing escapes to the worker loop.
    pub fn handle(
        &self,
        head: &RequestHead,
        conn: &mut Conn,
        dates: &DateCache,
        defer: &mut DeferList,
    ) -> TaskAction {
        let key = head.path.trim_start_matches('/');

        let mut entry = self.fetch_and_ref(key, defer);

        // A miss on a path with an inner parent reference may still
        // canonicalise back under the root; retry under the canonical
        // relative key so equivalent spellings share one cache entry.
        if entry.is_none() && key.contains("/../") {
            if let Some(rel) = self.canonical_relative(key) {
                let rel_key = rel.to_string_lossy();
                entry = self.fetch_and_ref(&rel_key, defer);
            }
        }

        match entry {
            Some(entry) => self.serve_entry(entry, head, conn, dates),
            None => {
                debug!(path = %head.path, "not found");
                http::fill_error_response(
                    &mut conn.response_buf,
                    HttpStatus::NotFound,
                    dates,
                    head.keep_alive,
                );
                TaskAction::WriteBuffered { payload: None }
            }
        }
    }

    /// Task-scoped get-and-ref: the reference is released when the task
    /// is freed. If the cache would block, the artifact is built directly
    /// and floats outside the map, keeping request latency bounded while
    /// a writer holds the lock.
    fn fetch_and_ref(&self, key: &str, defer: &mut DeferList) -> Option<CachedFile> {
        let entry = match self.cache.get_and_ref(key, || self.create_entry(key)) {
            Ok(entry) => entry,
            Err(CacheMiss::WouldBlock) => Cache::floating(self.create_entry(key)?),
            Err(CacheMiss::Absent) => return None,
        };

        let released = entry.clone();
        defer.push(move || drop(released));
        Some(entry)
    }

    /// The cache's create collaborator: resolve `key` under the root and
    /// build the artifact that serves it.
    fn create_entry(&self, key: &str) -> Option<FileEntry> {
        let rel = self.canonical_relative(key)?;
        let st = syscalls::fstatat(self.root_fd, &rel)?;
        self.entry_for(&rel, &st, 0)
    }

    /// Canonicalise `key` under the root. The prefix check on the result
    /// is the sole escape defence; anything resolving outside is a miss.
    fn canonical_relative(&self, key: &str) -> Option<PathBuf> {
        let full = std::fs::canonicalize(self.root_path.join(key)).ok()?;
        let rel = full.strip_prefix(&self.root_path).ok()?;
        Some(rel.to_path_buf())
    }

    fn entry_for(&self, rel: &Path, st: &libc::stat, depth: u32) -> Option<FileEntry> {
        match st.st_mode & libc::S_IFMT {
            libc::S_IFREG => {
                if (st.st_size as u64) < SMALL_FILE_THRESHOLD {
                    self.small_init(rel, st)
                } else {
                    Some(self.large_init(rel, st))
                }
            }
            libc::S_IFDIR => {
                if depth < MAX_INDEX_DEPTH {
                    let index = rel.join(&self.index_html);
                    if let Some(index_st) = syscalls::fstatat(self.root_fd, &index) {
                        return self.entry_for(&index, &index_st, depth + 1);
                    }
                }
                self.dir_init(rel, st)
            }
            _ => None,
        }
    }

    fn small_init(&self, rel: &Path, st: &libc::stat) -> Option<FileEntry> {
        let fd = syscalls::openat(self.root_fd, rel, self.extra_modes).ok()?;
        // The mapping stays valid after the fd is closed with `file`.
        let file = unsafe { File::from_raw_fd(fd) };

        let map = if st.st_size == 0 {
            None
        } else {
            let map = unsafe { Mmap::map(&file) }.ok()?;
            if let Err(e) = map.advise(Advice::WillNeed) {
                warn!("madvise: {}", e);
            }
            Some(map)
        };

        let compressed = map.as_deref().and_then(compress_entry);

        Some(FileEntry {
            last_modified_str: date::format_http_date(st.st_mtime),
            last_modified: st.st_mtime,
            mime_type: mime::mime_type_for(rel),
            variant: Variant::Small { map, compressed },
        })
    }

    fn large_init(&self, rel: &Path, st: &libc::stat) -> FileEntry {
        FileEntry {
            last_modified_str: date::format_http_date(st.st_mtime),
            last_modified: st.st_mtime,
            mime_type: mime::mime_type_for(rel),
            variant: Variant::Large {
                filename: rel.to_path_buf(),
                size: st.st_size as u64,
            },
        }
    }

    fn dir_init(&self, rel: &Path, st: &libc::stat) -> Option<FileEntry> {
        let full = self.root_path.join(rel);
        let mut entries = Vec::new();

        for dirent in std::fs::read_dir(&full).ok()?.flatten() {
            let name = match dirent.file_name().into_string() {
                Ok(n) => n,
                Err(_) => continue,
            };
            if name.starts_with('.') {
                continue;
            }
            let meta = match dirent.metadata() {
                Ok(m) => m,
                Err(_) => continue,
            };
            entries.push(ListingEntry {
                name,
                is_dir: meta.is_dir(),
                size: meta.len(),
            });
        }

        entries.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then_with(|| a.name.cmp(&b.name)));

        let display = format!("/{}", rel.display());
        let rendered = dirlist::render(&display, &entries);

        Some(FileEntry {
            last_modified_str: date::format_http_date(st.st_mtime),
            last_modified: st.st_mtime,
            mime_type: "text/html",
            variant: Variant::Dir { rendered },
        })
    }

    fn serve_entry(
        &self,
        entry: CachedFile,
        head: &RequestHead,
        conn: &mut Conn,
        dates: &DateCache,
    ) -> TaskAction {
        let fresh = client_has_fresh_content(head, entry.value.last_modified);

        if let Variant::Large { size, .. } = entry.value.variant {
            let (from, len, partial) = match compute_range(head.range, size) {
                Some(window) => window,
                None => {
                    http::fill_error_response(
                        &mut conn.response_buf,
                        HttpStatus::RangeUnsatisfiable,
                        dates,
                        head.keep_alive,
                    );
                    return TaskAction::WriteBuffered { payload: None };
                }
            };

            let status = if fresh {
                HttpStatus::NotModified
            } else if partial {
                HttpStatus::PartialContent
            } else {
                HttpStatus::Ok
            };

            conn.response_buf.clear();
            http::prepare_response_header(
                &mut conn.response_buf,
                status,
                len,
                entry.value.mime_type,
                Some(&entry.value.last_modified_str),
                dates,
                false,
                head.keep_alive,
            );

            return if head.method == Method::Head || fresh {
                TaskAction::WriteBuffered { payload: None }
            } else {
                TaskAction::OpenAndSendfile { entry, from, len }
            };
        }

        // Small and Dir artifacts share the buffered gather-write path.
        // An explicit Range selects a window of the stored bytes, so it
        // disables the compressed copy.
        let deflated =
            head.accepts_deflate && head.range.is_none() && entry.value.compressed().is_some();
        let full_len = if deflated {
            entry.value.compressed().map(<[u8]>::len).unwrap_or(0)
        } else {
            entry.value.uncompressed().len()
        };

        let (from, len, partial) = match compute_range(head.range, full_len as u64) {
            Some(window) => window,
            None => {
                http::fill_error_response(
                    &mut conn.response_buf,
                    HttpStatus::RangeUnsatisfiable,
                    dates,
                    head.keep_alive,
                );
                return TaskAction::WriteBuffered { payload: None };
            }
        };

        let status = if fresh {
            HttpStatus::NotModified
        } else if partial {
            HttpStatus::PartialContent
        } else {
            HttpStatus::Ok
        };

        conn.response_buf.clear();
        http::prepare_response_header(
            &mut conn.response_buf,
            status,
            len,
            entry.value.mime_type,
            Some(&entry.value.last_modified_str),
            dates,
            deflated,
            head.keep_alive,
        );

        if head.method == Method::Head || fresh {
            TaskAction::WriteBuffered { payload: None }
        } else {
            TaskAction::WriteBuffered {
                payload: Some(BufferedPayload {
                    entry,
                    compressed: deflated,
                    from: from as usize,
                    len: len as usize,
                }),
            }
        }
    }

    /// Open a Large entry's file for sendfile. The fd is registered with
    /// the task and closed when the task is freed; the caller maps
    /// EACCES/ENFILE/EMFILE to 403/503 and yields to retry on exhaustion.
    pub fn open_for_sendfile(
        &self,
        entry: &FileEntry,
        defer: &mut DeferList,
    ) -> Result<c_int, c_int> {
        let filename = match &entry.variant {
            Variant::Large { filename, .. } => filename,
            _ => return Err(libc::EINVAL),
        };

        let fd = syscalls::openat(self.root_fd, filename, self.extra_modes)?;
        defer.push(move || syscalls::close_fd(fd));
        Ok(fd)
    }
}

impl Drop for ServeFiles {
    fn drop(&mut self) {
        self.cache.clear();
        syscalls::close_fd(self.root_fd);
    }
}

fn client_has_fresh_content(head: &RequestHead, mtime: i64) -> bool {
    matches!(head.if_modified_since, Some(ims) if mtime <= ims)
}

fn compress_entry(contents: &[u8]) -> Option<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(
        Vec::with_capacity(contents.len() / 2),
        Compression::default(),
    );
    encoder.write_all(contents).ok()?;
    let compressed = encoder.finish().ok()?;

    if compressed.len() + COMPRESSED_HEADER_OVERHEAD < contents.len() {
        Some(compressed)
    } else {
        None
    }
}

/// Compute the byte window a Range header selects over a `size`-byte
/// file. Returns `(from, len, is_partial)`; None is 416.
///
/// Standard inclusive semantics (`from <= to`, `len = to - from + 1`);
/// either endpoint at or past the file size is unsatisfiable rather than
/// clamped, and the `bytes=-N` suffix form is unsatisfiable too.
fn compute_range(range: Option<(i64, i64)>, size: u64) -> Option<(u64, u64, bool)> {
    let (from, to) = match range {
        None => return Some((0, size, false)),
        Some(r) => r,
    };

    // No explicit endpoints at all: the whole file.
    if from <= 0 && to <= 0 {
        return Some((0, size, false));
    }

    if from < 0 {
        return None;
    }
    let from = from as u64;
    if from >= size {
        return None;
    }

    if to < 0 {
        return Some((from, size - from, true));
    }
    let to = to as u64;
    if to >= size || to < from {
        return None;
    }

    Some((from, to - from + 1, true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::fs;

    fn handler_for(root: &Path) -> ServeFiles {
        let config = Config::for_root(root.to_str().unwrap());
        ServeFiles::new(&config).unwrap()
    }

    #[test]
    fn test_compute_range_table() {
        // Canonical cases over a 1000-byte file.
        assert_eq!(compute_range(None, 1000), Some((0, 1000, false)));
        assert_eq!(compute_range(Some((0, 99)), 1000), Some((0, 100, true)));
        assert_eq!(compute_range(Some((900, -1)), 1000), Some((900, 100, true)));
        assert_eq!(compute_range(Some((2000, 3000)), 1000), None);

        // Endpoints at or past the size are unsatisfiable, not clamped.
        assert_eq!(compute_range(Some((0, 1000)), 1000), None);
        assert_eq!(compute_range(Some((1000, -1)), 1000), None);
        // Inverted windows and the suffix form are unsatisfiable.
        assert_eq!(compute_range(Some((500, 100)), 1000), None);
        assert_eq!(compute_range(Some((-1, 500)), 1000), None);
        // Absent endpoints mean the whole file.
        assert_eq!(compute_range(Some((-1, -1)), 1000), Some((0, 1000, false)));
        assert_eq!(compute_range(Some((0, -1)), 1000), Some((0, 1000, false)));
    }

    #[test]
    fn test_resolver_rejects_escapes() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("inside.txt"), b"ok").unwrap();
        let handler = handler_for(dir.path());

        assert!(handler.create_entry("inside.txt").is_some());
        assert!(handler.create_entry("../etc/passwd").is_none());
        assert!(handler.create_entry("a/../../etc/passwd").is_none());
        assert!(handler.create_entry("/etc/passwd").is_none());
        assert!(handler.create_entry("missing.txt").is_none());
    }

    #[test]
    fn test_inner_dotdot_resolving_inside_root_is_served() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("b.txt"), b"b").unwrap();
        let handler = handler_for(dir.path());

        assert!(handler.create_entry("sub/../b.txt").is_some());
    }

    #[test]
    fn test_variant_selection_by_size() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("small.txt"), vec![b'x'; 100]).unwrap();
        fs::write(
            dir.path().join("large.bin"),
            vec![0u8; SMALL_FILE_THRESHOLD as usize],
        )
        .unwrap();
        let handler = handler_for(dir.path());

        let small = handler.create_entry("small.txt").unwrap();
        assert!(matches!(small.variant, Variant::Small { .. }));
        assert_eq!(small.uncompressed().len(), 100);

        let large = handler.create_entry("large.bin").unwrap();
        match large.variant {
            Variant::Large { size, .. } => assert_eq!(size, SMALL_FILE_THRESHOLD),
            _ => panic!("expected Large variant at the threshold"),
        }
    }

    #[test]
    fn test_directory_prefers_index_then_lists() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("with_index")).unwrap();
        fs::write(dir.path().join("with_index/index.html"), b"<p>hi</p>").unwrap();
        fs::create_dir(dir.path().join("plain")).unwrap();
        fs::write(dir.path().join("plain/visible.txt"), b"v").unwrap();
        fs::write(dir.path().join("plain/.hidden"), b"h").unwrap();
        let handler = handler_for(dir.path());

        let indexed = handler.create_entry("with_index").unwrap();
        assert_eq!(indexed.mime_type, "text/html");
        assert_eq!(indexed.uncompressed(), b"<p>hi</p>");

        let listed = handler.create_entry("plain").unwrap();
        assert!(matches!(listed.variant, Variant::Dir { .. }));
        let html = String::from_utf8(listed.uncompressed().to_vec()).unwrap();
        assert!(html.contains("visible.txt"));
        assert!(!html.contains(".hidden"));
    }

    #[test]
    fn test_compression_kept_only_when_it_saves() {
        // Highly repetitive content compresses well.
        let compressible = vec![b'a'; 4096];
        assert!(compress_entry(&compressible).is_some());

        // Tiny content can never beat the header overhead.
        assert!(compress_entry(b"hi").is_none());
    }

    #[test]
    fn test_buffered_payload_windows_the_stored_bytes() {
        let entry = Cache::floating(FileEntry {
            last_modified_str: date::format_http_date(0),
            last_modified: 0,
            mime_type: "text/html",
            variant: Variant::Dir {
                rendered: (0..100u8).collect(),
            },
        });

        let whole = BufferedPayload {
            entry: entry.clone(),
            compressed: false,
            from: 0,
            len: 100,
        };
        assert_eq!(whole.bytes().len(), 100);

        let window = BufferedPayload {
            entry,
            compressed: false,
            from: 10,
            len: 20,
        };
        assert_eq!(window.bytes(), &(10..30u8).collect::<Vec<u8>>()[..]);
    }

    #[test]
    fn test_root_dir_key_is_the_empty_string() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("index.html"), b"root index").unwrap();
        let handler = handler_for(dir.path());

        let entry = handler.create_entry("").unwrap();
        assert_eq!(entry.uncompressed(), b"root index");
        assert_eq!(entry.mime_type, "text/html");
    }
}
