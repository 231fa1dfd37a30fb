use std::ffi::CString;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::debug;

use crate::buffer::Buffer;

/// Read-only private mapping of a payload file, unmapped exactly once on
/// drop. The pointer never escapes except as a borrowed slice.
pub struct MappedFile {
    ptr: *mut libc::c_void,
    len: usize,
}

// The mapping is PROT_READ/MAP_PRIVATE and owned uniquely; handing it to a
// worker thread is sound.
unsafe impl Send for MappedFile {}

impl MappedFile {
    /// Map `path` read-only. `None` when the file cannot be opened or
    /// mapped; empty files yield a zero-length handle without a mapping.
    pub fn open(path: &Path) -> Option<Self> {
        let c_path = CString::new(path.as_os_str().as_encoded_bytes()).ok()?;
        unsafe {
            let fd = libc::open(c_path.as_ptr(), libc::O_RDONLY);
            if fd < 0 {
                return None;
            }
            let mut st: libc::stat = std::mem::zeroed();
            if libc::fstat(fd, &mut st) < 0 {
                libc::close(fd);
                return None;
            }
            let len = st.st_size as usize;
            if len == 0 {
                libc::close(fd);
                return Some(Self {
                    ptr: std::ptr::null_mut(),
                    len: 0,
                });
            }
            let ptr = libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                fd,
                0,
            );
            libc::close(fd);
            if ptr == libc::MAP_FAILED {
                return None;
            }
            Some(Self { ptr, len })
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        if self.len == 0 {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.ptr as *const u8, self.len) }
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe {
                libc::munmap(self.ptr, self.len);
            }
        }
    }
}

fn status_text(code: u16) -> &'static str {
    match code {
        200 => "OK",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        _ => "Bad Request",
    }
}

fn error_page(code: u16) -> Option<&'static str> {
    match code {
        400 => Some("/400.html"),
        403 => Some("/403.html"),
        404 => Some("/404.html"),
        _ => None,
    }
}

fn content_type(path: &str) -> &'static str {
    let suffix = match path.rfind('.') {
        Some(at) => &path[at..],
        None => return "text/plain",
    };
    match suffix {
        ".html" => "text/html",
        ".xml" => "text/xml",
        ".xhtml" => "application/xhtml+xml",
        ".txt" => "text/plain",
        ".rtf" => "application/rtf",
        ".pdf" => "application/pdf",
        ".png" => "image/png",
        ".gif" => "image/gif",
        ".jpg" | ".jpeg" => "image/jpeg",
        ".au" => "audio/basic",
        ".mpeg" | ".mpg" => "video/mpeg",
        ".avi" => "video/x-msvideo",
        ".gz" => "application/x-gzip",
        ".tar" => "application/x-tar",
        ".css" => "text/css",
        ".js" => "text/javascript",
        _ => "text/plain",
    }
}

struct FileStat {
    is_dir: bool,
    world_readable: bool,
}

fn stat_path(path: &Path) -> Option<FileStat> {
    let c_path = CString::new(path.as_os_str().as_encoded_bytes()).ok()?;
    unsafe {
        let mut st: libc::stat = std::mem::zeroed();
        if libc::stat(c_path.as_ptr(), &mut st) < 0 {
            return None;
        }
        Some(FileStat {
            is_dir: (st.st_mode & libc::S_IFMT) == libc::S_IFDIR,
            world_readable: (st.st_mode & libc::S_IROTH) != 0,
        })
    }
}

/// Builds one response into the connection's write buffer: status line,
/// Connection/Date/Content-Type headers, then either an inline error body
/// or a Content-Length for the mapped payload file handed to the
/// connection for zero-copy send.
pub struct Response {
    root: PathBuf,
    path: String,
    keep_alive: bool,
    code: u16,
    file: Option<MappedFile>,
}

impl Response {
    pub fn new(root: &Path, path: &str, keep_alive: bool, code: Option<u16>) -> Self {
        Self {
            root: root.to_path_buf(),
            path: path.to_string(),
            keep_alive,
            // 0 means "decide from the filesystem".
            code: code.unwrap_or(0),
            file: None,
        }
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    fn real_path(&self) -> PathBuf {
        let rel = self.path.trim_start_matches('/');
        self.root.join(rel)
    }

    pub fn build(&mut self, buf: &mut Buffer) {
        if self.code == 0 {
            self.code = match stat_path(&self.real_path()) {
                None => 404,
                Some(st) if st.is_dir => 404,
                Some(st) if !st.world_readable => 403,
                Some(_) => 200,
            };
        }
        self.swap_in_error_page();
        self.add_status_line(buf);
        self.add_headers(buf);
        self.add_content(buf);
    }

    /// The mapped payload, if any, for the connection to send after the
    /// buffered header bytes.
    pub fn take_file(&mut self) -> Option<MappedFile> {
        self.file.take()
    }

    fn swap_in_error_page(&mut self) {
        if let Some(page) = error_page(self.code) {
            self.path = page.to_string();
        }
    }

    fn add_status_line(&self, buf: &mut Buffer) {
        buf.append(
            format!("HTTP/1.1 {} {}\r\n", self.code, status_text(self.code)).as_bytes(),
        );
    }

    fn add_headers(&self, buf: &mut Buffer) {
        buf.append(b"Connection: ");
        if self.keep_alive {
            buf.append(b"keep-alive\r\n");
            buf.append(b"keep-alive: max=6, timeout=120\r\n");
        } else {
            buf.append(b"close\r\n");
        }
        buf.append(format!("Date: {}\r\n", httpdate::fmt_http_date(SystemTime::now())).as_bytes());
        buf.append(format!("Content-Type: {}\r\n", content_type(&self.path)).as_bytes());
    }

    fn add_content(&mut self, buf: &mut Buffer) {
        let path = self.real_path();
        match MappedFile::open(&path) {
            Some(file) => {
                debug!(path = %path.display(), len = file.len(), "mapped payload");
                buf.append(format!("Content-Length: {}\r\n\r\n", file.len()).as_bytes());
                self.file = Some(file);
            }
            None => self.error_content(buf, "file not found"),
        }
    }

    /// Inline HTML body used when no page file can be served.
    fn error_content(&self, buf: &mut Buffer, message: &str) {
        let mut body = String::from("<html><title>Error</title>");
        body.push_str("<body bgcolor=\"ffffff\">");
        body.push_str(&format!("{} : {}\n", self.code, status_text(self.code)));
        body.push_str(&format!("<p>{message}</p>"));
        body.push_str("<hr><em>ravel</em></body></html>");

        buf.append(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
        buf.append(body.as_bytes());
    }
}
