use std::collections::HashMap;

use tracing::debug;

use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::store::UserStore;

/// Extensionless paths that resolve to their `.html` page.
const DEFAULT_HTML: &[&str] = &[
    "/index", "/register", "/login", "/welcome", "/video", "/picture",
];

const REGISTER_PAGE: &str = "/register.html";
const LOGIN_PAGE: &str = "/login.html";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    RequestLine,
    Headers,
    Body,
    Finished,
}

/// Incremental HTTP/1.1 request parser.
///
/// Consumes an elastic buffer line by line; when a line terminator has not
/// arrived yet, `parse` pauses and reports "need more data" instead of
/// blocking. Rebuilt per request even on a keep-alive connection.
pub struct Request {
    state: ParseState,
    method: String,
    path: String,
    version: String,
    headers: HashMap<String, String>,
    body: String,
    post: HashMap<String, String>,
}

impl Default for Request {
    fn default() -> Self {
        Self::new()
    }
}

impl Request {
    pub fn new() -> Self {
        Self {
            state: ParseState::RequestLine,
            method: String::new(),
            path: String::new(),
            version: String::new(),
            headers: HashMap::new(),
            body: String::new(),
            post: HashMap::new(),
        }
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    /// Header lookup, case-insensitive, last write wins.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(&key.to_ascii_lowercase()).map(String::as_str)
    }

    /// Decoded form field from an url-encoded POST body.
    pub fn post(&self, key: &str) -> Option<&str> {
        self.post.get(key).map(String::as_str)
    }

    pub fn is_keep_alive(&self) -> bool {
        self.header("connection") == Some("keep-alive") && self.version == "1.1"
    }

    /// Drive the state machine over whatever bytes are buffered.
    ///
    /// `Ok(true)` once a full request is parsed, `Ok(false)` when more
    /// bytes are needed first. A malformed request is a protocol error;
    /// the orchestrator closes the connection without a response.
    pub fn parse(&mut self, buf: &mut Buffer, store: &dyn UserStore) -> Result<bool> {
        while self.state != ParseState::Finished
            && (buf.readable_bytes() > 0 || self.state == ParseState::Body)
        {
            if self.state == ParseState::Body {
                let need = self.content_length()?;
                if buf.readable_bytes() < need {
                    break;
                }
                let raw = buf.retrieve_bytes(need);
                self.body = String::from_utf8(raw)
                    .map_err(|_| Error::Protocol("body is not valid utf-8"))?;
                self.handle_post(store);
                self.state = ParseState::Finished;
                continue;
            }

            let Some(line) = buf.search(b"\r\n") else {
                break;
            };
            let line = String::from_utf8(line)
                .map_err(|_| Error::Protocol("request is not valid utf-8"))?;

            match self.state {
                ParseState::RequestLine => {
                    self.parse_request_line(&line)?;
                    self.normalize_path();
                }
                ParseState::Headers => self.parse_header(&line),
                _ => unreachable!(),
            }
            buf.retrieve(2);

            // No Content-Length means there is nothing more to wait for.
            if self.state == ParseState::Body && self.header("content-length").is_none() {
                self.state = ParseState::Finished;
            }
        }

        if self.state == ParseState::Finished {
            debug!(method = %self.method, path = %self.path, version = %self.version, "request parsed");
            return Ok(true);
        }
        Ok(false)
    }

    fn parse_request_line(&mut self, line: &str) -> Result<()> {
        let mut parts = line.split(' ');
        let (Some(method), Some(path), Some(proto), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::Protocol("malformed request line"));
        };
        let Some(version) = proto.strip_prefix("HTTP/") else {
            return Err(Error::Protocol("malformed request line"));
        };
        if method.is_empty() || path.is_empty() || version.is_empty() {
            return Err(Error::Protocol("malformed request line"));
        }
        self.method = method.to_string();
        self.path = path.to_string();
        self.version = version.to_string();
        self.state = ParseState::Headers;
        Ok(())
    }

    fn parse_header(&mut self, line: &str) {
        match line.split_once(':') {
            Some((key, value)) => {
                self.headers.insert(
                    key.to_ascii_lowercase(),
                    value.trim_start_matches(' ').to_string(),
                );
            }
            // First non-header line ends the header section.
            None => self.state = ParseState::Body,
        }
    }

    fn content_length(&self) -> Result<usize> {
        match self.header("content-length") {
            Some(v) => v
                .trim()
                .parse()
                .map_err(|_| Error::Protocol("unsupported content-length")),
            None => Ok(0),
        }
    }

    fn normalize_path(&mut self) {
        if self.path == "/" {
            self.path = "/index.html".to_string();
        } else if DEFAULT_HTML.contains(&self.path.as_str()) {
            self.path.push_str(".html");
        }
    }

    /// Decode a form body and run the register/login side effect when the
    /// request targets one of the two credential pages.
    fn handle_post(&mut self, store: &dyn UserStore) {
        if self.method != "POST"
            || self.header("content-type") != Some("application/x-www-form-urlencoded")
        {
            return;
        }
        self.post = decode_form(&self.body);

        let is_login = match self.path.as_str() {
            LOGIN_PAGE => true,
            REGISTER_PAGE => false,
            _ => return,
        };
        let name = self.post.get("username").cloned().unwrap_or_default();
        let password = self.post.get("password").cloned().unwrap_or_default();
        self.path = if user_verify(store, &name, &password, is_login) {
            "/welcome.html".to_string()
        } else {
            "/error.html".to_string()
        };
    }
}

/// Login checks the stored password; register fails on an existing name
/// and otherwise creates the user. Store failures read as "failed".
fn user_verify(store: &dyn UserStore, name: &str, password: &str, is_login: bool) -> bool {
    debug!(name, is_login, "verifying user");
    match store.verify(name) {
        Some(stored) => is_login && stored == password,
        None => {
            if is_login {
                false
            } else {
                store.create(name, password)
            }
        }
    }
}

/// `application/x-www-form-urlencoded` decode: `+` to space, `%XX`
/// percent-escapes, pairs split on `&`/`=`.
fn decode_form(body: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for pair in body.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        map.insert(decode_component(key), decode_component(value));
    }
    map
}

fn decode_component(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' => match (hex_val(bytes.get(i + 1)), hex_val(bytes.get(i + 2))) {
                (Some(hi), Some(lo)) => {
                    out.push(hi * 16 + lo);
                    i += 3;
                }
                _ => {
                    out.push(b'%');
                    i += 1;
                }
            },
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_val(b: Option<&u8>) -> Option<u8> {
    match b? {
        b @ b'0'..=b'9' => Some(b - b'0'),
        b @ b'a'..=b'f' => Some(b - b'a' + 10),
        b @ b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn feed(req: &mut Request, bytes: &[u8], store: &dyn UserStore) -> Result<bool> {
        let mut buf = Buffer::new();
        buf.append(bytes);
        req.parse(&mut buf, store)
    }

    #[test]
    fn parses_keep_alive_get() {
        let store = MemoryStore::new();
        let mut req = Request::new();
        let done = feed(
            &mut req,
            b"GET /index HTTP/1.1\r\nConnection: keep-alive\r\n\r\n",
            &store,
        )
        .unwrap();
        assert!(done);
        assert_eq!(req.method(), "GET");
        assert_eq!(req.path(), "/index.html");
        assert_eq!(req.version(), "1.1");
        assert!(req.is_keep_alive());
        assert!(req.body().is_empty());
    }

    #[test]
    fn root_path_maps_to_index() {
        let store = MemoryStore::new();
        let mut req = Request::new();
        assert!(feed(&mut req, b"GET / HTTP/1.1\r\n\r\n", &store).unwrap());
        assert_eq!(req.path(), "/index.html");
    }

    #[test]
    fn body_waits_for_content_length() {
        let store = MemoryStore::new();
        let mut req = Request::new();
        let mut buf = Buffer::new();
        buf.append(b"POST /p HTTP/1.1\r\nContent-length: 5\r\n\r\n");
        assert!(!req.parse(&mut buf, &store).unwrap());
        assert_eq!(req.state(), ParseState::Body);

        buf.append(b"hel");
        assert!(!req.parse(&mut buf, &store).unwrap());

        buf.append(b"lo");
        assert!(req.parse(&mut buf, &store).unwrap());
        assert_eq!(req.body(), "hello");
    }

    #[test]
    fn pauses_mid_header_until_terminator_arrives() {
        let store = MemoryStore::new();
        let mut req = Request::new();
        let mut buf = Buffer::new();
        buf.append(b"GET /x HTTP/1.1\r\nHost: loc");
        assert!(!req.parse(&mut buf, &store).unwrap());
        buf.append(b"alhost\r\n\r\n");
        assert!(req.parse(&mut buf, &store).unwrap());
        assert_eq!(req.header("host"), Some("localhost"));
    }

    #[test]
    fn malformed_request_line_is_protocol_error() {
        let store = MemoryStore::new();
        let mut req = Request::new();
        let err = feed(&mut req, b"NOT-HTTP\r\n\r\n", &store);
        assert!(matches!(err, Err(Error::Protocol(_))));
    }

    #[test]
    fn header_map_is_case_insensitive_last_write_wins() {
        let store = MemoryStore::new();
        let mut req = Request::new();
        assert!(feed(
            &mut req,
            b"GET /a HTTP/1.1\r\nX-Tag: one\r\nx-tag: two\r\n\r\n",
            &store,
        )
        .unwrap());
        assert_eq!(req.header("X-Tag"), Some("two"));
    }

    #[test]
    fn form_body_is_percent_decoded() {
        let store = MemoryStore::new();
        let mut req = Request::new();
        let body = b"username=a%20b&note=x%2By+z";
        let mut raw = Vec::new();
        raw.extend_from_slice(
            b"POST /p HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-length: 27\r\n\r\n",
        );
        raw.extend_from_slice(body);
        assert!(feed(&mut req, &raw, &store).unwrap());
        assert_eq!(req.post("username"), Some("a b"));
        assert_eq!(req.post("note"), Some("x+y z"));
    }

    #[test]
    fn login_rewrites_to_welcome_or_error() {
        let store = MemoryStore::with_user("ada", "engine");
        let good = b"username=ada&password=engine";
        let mut raw = Vec::new();
        raw.extend_from_slice(
            b"POST /login HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-length: 28\r\n\r\n",
        );
        raw.extend_from_slice(good);
        let mut req = Request::new();
        assert!(feed(&mut req, &raw, &store).unwrap());
        assert_eq!(req.path(), "/welcome.html");

        let bad = b"username=ada&password=wrongXX";
        let mut raw = Vec::new();
        raw.extend_from_slice(
            b"POST /login HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-length: 29\r\n\r\n",
        );
        raw.extend_from_slice(bad);
        let mut req = Request::new();
        assert!(feed(&mut req, &raw, &store).unwrap());
        assert_eq!(req.path(), "/error.html");
    }

    #[test]
    fn register_creates_new_user_and_rejects_existing() {
        let store = MemoryStore::new();
        let body = b"username=new&password=pw";
        let mut raw = Vec::new();
        raw.extend_from_slice(
            b"POST /register HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-length: 24\r\n\r\n",
        );
        raw.extend_from_slice(body);
        let mut req = Request::new();
        assert!(feed(&mut req, &raw, &store).unwrap());
        assert_eq!(req.path(), "/welcome.html");
        assert_eq!(store.verify("new").as_deref(), Some("pw"));

        // Same name again: conflict.
        let mut req = Request::new();
        assert!(feed(&mut req, &raw, &store).unwrap());
        assert_eq!(req.path(), "/error.html");
    }
}
