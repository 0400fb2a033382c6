use std::io::{self, BufRead, Cursor, Read, Write};

use httparse::{Status, EMPTY_HEADER};

const MAX_HEAD_SIZE: usize = 64 * 1024;
const MAX_HEADERS: usize = 64;

/// An HTTP/1.x request with a replaceable body.
///
/// `content_length` is the single source of truth for the `Content-Length`
/// header: it is what gets written when the request is serialized.
pub struct HttpRequest {
    pub method: String,
    pub target: String,
    pub version: u8,
    pub content_length: Option<u64>,
    headers: Vec<(String, String)>,
    body: Box<dyn Read + Send>,
}

impl HttpRequest {
    /// Request whose body length is not known up front.
    pub fn new(
        method: impl Into<String>,
        target: impl Into<String>,
        body: impl Read + Send + 'static,
    ) -> Self {
        HttpRequest {
            method: method.into(),
            target: target.into(),
            version: 1,
            content_length: None,
            headers: Vec::new(),
            body: Box::new(body),
        }
    }

    pub fn from_bytes(
        method: impl Into<String>,
        target: impl Into<String>,
        body: impl Into<Vec<u8>>,
    ) -> Self {
        let body = body.into();
        let length = body.len() as u64;

        let mut request = HttpRequest::new(method, target, Cursor::new(body));
        request.content_length = Some(length);
        request
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.remove_header(name);
        self.headers.push((name.to_string(), value.into()));
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(key, _)| !key.eq_ignore_ascii_case(name));
    }

    /// Drain the body. The request is left with an empty body until one of
    /// `restore_body` or `replace_body` installs a new one.
    pub fn read_body(&mut self) -> io::Result<Vec<u8>> {
        let mut body = Vec::new();
        let mut stream = std::mem::replace(&mut self.body, Box::new(io::empty()));
        stream.read_to_end(&mut body)?;
        Ok(body)
    }

    /// Put a previously read body back, leaving `content_length` as it was.
    pub fn restore_body(&mut self, body: Vec<u8>) {
        self.body = Box::new(Cursor::new(body));
    }

    pub fn replace_body(&mut self, body: Vec<u8>) {
        self.content_length = Some(body.len() as u64);
        self.body = Box::new(Cursor::new(body));
    }

    /// Serialize the request head and body. Consumes the body stream.
    pub fn write_to<W: Write>(&mut self, writer: &mut W) -> io::Result<()> {
        let body = self.read_body()?;

        let length = match self.content_length {
            Some(length) => Some(length),
            None if !body.is_empty() => Some(body.len() as u64),
            None => None,
        };

        if let Some(length) = length {
            self.remove_header("Transfer-Encoding");
            self.set_header("Content-Length", length.to_string());
        }

        let mut head = format!("{} {} HTTP/1.{}\r\n", self.method, self.target, self.version);
        for (name, value) in &self.headers {
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        head.push_str("\r\n");

        writer.write_all(head.as_bytes())?;
        writer.write_all(&body)?;

        self.restore_body(body);
        Ok(())
    }
}

fn invalid_data(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// Read a line (until \n) as raw bytes, without requiring valid UTF-8.
fn read_line_bytes<R: BufRead>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut line = Vec::new();
    reader.read_until(b'\n', &mut line)?;
    Ok(line)
}

/// Read one request from the stream, buffering its whole body.
///
/// Returns `Ok(None)` when the peer closed the connection between requests.
/// Chunked bodies are decoded; the resulting request carries a plain
/// content length instead.
pub fn read_request<R: BufRead>(
    reader: &mut R,
    max_body_size: usize,
) -> io::Result<Option<HttpRequest>> {
    read_request_with_continue(reader, &mut io::sink(), max_body_size)
}

/// Like [`read_request`], but answers `Expect: 100-continue` on `interim`
/// before reading the body. The `Expect` header is dropped from the returned
/// request since it has been dealt with.
pub fn read_request_with_continue<R: BufRead, W: Write>(
    reader: &mut R,
    interim: &mut W,
    max_body_size: usize,
) -> io::Result<Option<HttpRequest>> {
    let mut head = Vec::new();

    loop {
        let line = read_line_bytes(reader)?;
        if line.is_empty() {
            if head.is_empty() {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "Connection closed in the middle of request headers",
            ));
        }

        // Tolerate stray empty lines between pipelined requests
        if head.is_empty() && (line == b"\r\n" || line == b"\n") {
            continue;
        }

        head.extend_from_slice(&line);

        if head.len() > MAX_HEAD_SIZE {
            return Err(invalid_data("Request headers too large"));
        }

        if line == b"\r\n" || line == b"\n" {
            break;
        }
    }

    let mut headers = [EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut headers);

    match parsed.parse(&head) {
        Ok(Status::Complete(_)) => {}
        Ok(Status::Partial) => return Err(invalid_data("Incomplete request head")),
        Err(e) => return Err(invalid_data(format!("Failed to parse request head: {}", e))),
    }

    let method = parsed
        .method
        .ok_or_else(|| invalid_data("Request has no method"))?
        .to_string();
    let target = parsed
        .path
        .ok_or_else(|| invalid_data("Request has no target"))?
        .to_string();
    let version = parsed.version.unwrap_or(1);

    let header_list: Vec<(String, String)> = parsed
        .headers
        .iter()
        .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
        .collect();

    let mut content_length: Option<usize> = None;
    let mut is_chunked = false;
    let mut expects_continue = false;

    for (name, value) in &header_list {
        if name.eq_ignore_ascii_case("content-length") {
            let length = value
                .trim()
                .parse()
                .map_err(|_| invalid_data(format!("Invalid Content-Length '{}'", value)))?;
            content_length = Some(length);
        }

        if name.eq_ignore_ascii_case("transfer-encoding")
            && value.to_lowercase().contains("chunked")
        {
            is_chunked = true;
        }

        if name.eq_ignore_ascii_case("expect") && value.trim().eq_ignore_ascii_case("100-continue") {
            expects_continue = true;
        }
    }

    if let Some(len) = content_length.filter(|_| !is_chunked) {
        if len > max_body_size {
            return Err(invalid_data(format!(
                "Request body of {} bytes exceeds maximum size of {} bytes",
                len, max_body_size
            )));
        }
    }

    let has_body = is_chunked || content_length.is_some_and(|len| len > 0);

    if expects_continue && has_body && version == 1 {
        interim.write_all(b"HTTP/1.1 100 Continue\r\n\r\n")?;
        interim.flush()?;
    }

    let mut request = if is_chunked {
        let body = read_chunked_body(reader, max_body_size)?;
        HttpRequest::from_bytes(method, target, body)
    } else if let Some(len) = content_length {
        let mut body = vec![0u8; len];
        reader.read_exact(&mut body)?;
        HttpRequest::from_bytes(method, target, body)
    } else {
        HttpRequest::new(method, target, io::empty())
    };

    request.version = version;
    request.headers = header_list;

    if is_chunked {
        request.remove_header("Transfer-Encoding");
    }

    if expects_continue {
        request.remove_header("Expect");
    }

    Ok(Some(request))
}

/// Parse a chunk size from raw bytes (ASCII hex digits)
fn parse_chunk_size(line: &[u8]) -> io::Result<usize> {
    // Find the end of the hex digits (ignore extensions after ';' and whitespace)
    let hex_end = line
        .iter()
        .position(|&b| b == b';' || b == b'\r' || b == b'\n' || b == b' ')
        .unwrap_or(line.len());

    let hex_str = std::str::from_utf8(&line[..hex_end])
        .map_err(|_| invalid_data("Invalid chunk size encoding"))?;

    usize::from_str_radix(hex_str.trim(), 16)
        .map_err(|e| invalid_data(format!("Invalid chunk size '{}': {}", hex_str, e)))
}

/// Read a chunked HTTP body
fn read_chunked_body<R: BufRead>(reader: &mut R, max_body_size: usize) -> io::Result<Vec<u8>> {
    let mut body = Vec::new();

    loop {
        let size_line = read_line_bytes(reader)?;
        if size_line.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "Connection closed in the middle of a chunked body",
            ));
        }

        let chunk_size = parse_chunk_size(&size_line)?;

        if chunk_size == 0 {
            // Skip trailers up to the final empty line
            loop {
                let trailer = read_line_bytes(reader)?;
                if trailer.is_empty() || trailer == b"\r\n" || trailer == b"\n" {
                    break;
                }
            }
            break;
        }

        if body.len() + chunk_size > max_body_size {
            return Err(invalid_data(format!(
                "Chunked request body exceeds maximum size of {} bytes",
                max_body_size
            )));
        }

        let mut chunk = vec![0u8; chunk_size];
        reader.read_exact(&mut chunk)?;
        body.extend_from_slice(&chunk);

        // Trailing CRLF after chunk
        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf)?;
    }

    Ok(body)
}

/// Whether the body is worth handing to the CWMP rewriter.
///
/// Some CPEs omit Content-Type on their Informs, so a missing header counts
/// as rewritable.
pub fn should_rewrite_content(request: &HttpRequest) -> bool {
    if request.content_length == Some(0) {
        return false;
    }

    match request.header("content-type") {
        Some(content_type) => {
            let content_type = content_type.trim().to_lowercase();
            content_type.starts_with("text/") || content_type.contains("xml")
        }
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufReader;

    const MAX: usize = 1024 * 1024;

    fn parse(raw: &[u8]) -> HttpRequest {
        let mut reader = BufReader::new(raw);
        read_request(&mut reader, MAX).unwrap().unwrap()
    }

    // ============================================
    // read_request() tests
    // ============================================

    #[test]
    fn test_read_request_with_content_length() {
        let mut request = parse(
            b"POST /acs HTTP/1.1\r\n\
              Host: acs.example.net\r\n\
              Content-Type: text/xml\r\n\
              Content-Length: 5\r\n\
              \r\n\
              hello",
        );

        assert_eq!(request.method, "POST");
        assert_eq!(request.target, "/acs");
        assert_eq!(request.version, 1);
        assert_eq!(request.header("host"), Some("acs.example.net"));
        assert_eq!(request.content_length, Some(5));
        assert_eq!(request.read_body().unwrap(), b"hello");
    }

    #[test]
    fn test_read_request_without_body() {
        let mut request = parse(b"POST /acs HTTP/1.1\r\nHost: acs\r\n\r\n");

        assert_eq!(request.content_length, None);
        assert!(request.read_body().unwrap().is_empty());
    }

    #[test]
    fn test_read_request_chunked() {
        let mut request = parse(
            b"POST /acs HTTP/1.1\r\n\
              Transfer-Encoding: chunked\r\n\
              \r\n\
              5\r\nhello\r\n\
              6;ext=1\r\n world\r\n\
              0\r\n\
              \r\n",
        );

        assert_eq!(request.content_length, Some(11));
        assert_eq!(request.header("Transfer-Encoding"), None);
        assert_eq!(request.read_body().unwrap(), b"hello world");
    }

    #[test]
    fn test_read_request_pipelined() {
        let raw = b"POST /a HTTP/1.1\r\nContent-Length: 1\r\n\r\nA\
                    POST /b HTTP/1.1\r\nContent-Length: 2\r\n\r\nBB";
        let mut reader = BufReader::new(&raw[..]);

        let mut first = read_request(&mut reader, MAX).unwrap().unwrap();
        let mut second = read_request(&mut reader, MAX).unwrap().unwrap();

        assert_eq!(first.target, "/a");
        assert_eq!(first.read_body().unwrap(), b"A");
        assert_eq!(second.target, "/b");
        assert_eq!(second.read_body().unwrap(), b"BB");
        assert!(read_request(&mut reader, MAX).unwrap().is_none());
    }

    #[test]
    fn test_read_request_eof() {
        let mut reader = BufReader::new(&b""[..]);
        assert!(read_request(&mut reader, MAX).unwrap().is_none());
    }

    #[test]
    fn test_read_request_truncated_head() {
        let mut reader = BufReader::new(&b"POST /acs HTTP/1.1\r\nHost: a"[..]);
        let err = read_request(&mut reader, MAX).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_read_request_body_too_large() {
        let mut reader = BufReader::new(&b"POST /acs HTTP/1.1\r\nContent-Length: 100\r\n\r\n"[..]);
        let err = read_request(&mut reader, 10).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_read_request_chunked_too_large() {
        let raw = b"POST /acs HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\nff\r\n";
        let mut reader = BufReader::new(&raw[..]);
        let err = read_request(&mut reader, 10).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_read_request_bad_content_length() {
        let mut reader = BufReader::new(&b"POST /acs HTTP/1.1\r\nContent-Length: abc\r\n\r\n"[..]);
        let err = read_request(&mut reader, MAX).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_read_request_garbage() {
        let mut reader = BufReader::new(&b"\x01\x02 nonsense\r\n\r\n"[..]);
        let err = read_request(&mut reader, MAX).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_read_request_answers_expect_continue() {
        let raw = b"POST /acs HTTP/1.1\r\n\
              Content-Length: 4\r\n\
              Expect: 100-continue\r\n\
              \r\n\
              <a/>";
        let mut reader = BufReader::new(&raw[..]);
        let mut interim = Vec::new();

        let mut request = read_request_with_continue(&mut reader, &mut interim, MAX)
            .unwrap()
            .unwrap();

        assert_eq!(interim, b"HTTP/1.1 100 Continue\r\n\r\n");
        assert_eq!(request.header("Expect"), None);
        assert_eq!(request.read_body().unwrap(), b"<a/>");
    }

    #[test]
    fn test_read_request_no_continue_without_expect() {
        let raw = b"POST /acs HTTP/1.1\r\nContent-Length: 4\r\n\r\n<a/>";
        let mut reader = BufReader::new(&raw[..]);
        let mut interim = Vec::new();

        read_request_with_continue(&mut reader, &mut interim, MAX)
            .unwrap()
            .unwrap();

        assert!(interim.is_empty());
    }

    #[test]
    fn test_read_request_no_continue_when_body_too_large() {
        let raw = b"POST /acs HTTP/1.1\r\nContent-Length: 100\r\nExpect: 100-continue\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);
        let mut interim = Vec::new();

        let err = read_request_with_continue(&mut reader, &mut interim, 10).err().unwrap();

        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(interim.is_empty());
    }

    // ============================================
    // parse_chunk_size() tests
    // ============================================

    #[test]
    fn test_parse_chunk_size() {
        assert_eq!(parse_chunk_size(b"1a\r\n").unwrap(), 26);
        assert_eq!(parse_chunk_size(b"0\r\n").unwrap(), 0);
        assert_eq!(parse_chunk_size(b"FF;name=value\r\n").unwrap(), 255);
        assert!(parse_chunk_size(b"zz\r\n").is_err());
    }

    // ============================================
    // HttpRequest tests
    // ============================================

    #[test]
    fn test_write_to_sets_content_length() {
        let mut request = HttpRequest::from_bytes("POST", "/acs", "<a/>");
        request.set_header("Host", "acs.example.net");
        request.set_header("content-length", "999");

        let mut out = Vec::new();
        request.write_to(&mut out).unwrap();

        assert_eq!(
            String::from_utf8(out).unwrap(),
            "POST /acs HTTP/1.1\r\nHost: acs.example.net\r\nContent-Length: 4\r\n\r\n<a/>"
        );
    }

    #[test]
    fn test_write_to_without_body() {
        let mut request = HttpRequest::new("POST", "/acs", io::empty());
        request.set_header("Host", "acs");

        let mut out = Vec::new();
        request.write_to(&mut out).unwrap();

        assert_eq!(String::from_utf8(out).unwrap(), "POST /acs HTTP/1.1\r\nHost: acs\r\n\r\n");
    }

    #[test]
    fn test_write_to_keeps_body_readable() {
        let mut request = HttpRequest::from_bytes("POST", "/acs", "body");

        let mut out = Vec::new();
        request.write_to(&mut out).unwrap();

        assert_eq!(request.read_body().unwrap(), b"body");
    }

    #[test]
    fn test_restore_body_keeps_length() {
        let mut request = HttpRequest::new("POST", "/acs", Cursor::new(b"abc".to_vec()));

        let body = request.read_body().unwrap();
        request.restore_body(body);

        assert_eq!(request.content_length, None);
        assert_eq!(request.read_body().unwrap(), b"abc");
    }

    #[test]
    fn test_replace_body_sets_length() {
        let mut request = HttpRequest::from_bytes("POST", "/acs", "abc");
        request.replace_body(b"abcdef".to_vec());

        assert_eq!(request.content_length, Some(6));
    }

    #[test]
    fn test_set_header_replaces_case_insensitively() {
        let mut request = HttpRequest::new("POST", "/", io::empty());
        request.set_header("host", "a");
        request.set_header("Host", "b");

        assert_eq!(request.headers().len(), 1);
        assert_eq!(request.header("HOST"), Some("b"));
    }

    // ============================================
    // should_rewrite_content() tests
    // ============================================

    #[test]
    fn test_should_rewrite_xml() {
        let mut request = HttpRequest::from_bytes("POST", "/", "<a/>");
        request.set_header("Content-Type", "text/xml; charset=\"utf-8\"");
        assert!(should_rewrite_content(&request));

        request.set_header("Content-Type", "application/soap+xml");
        assert!(should_rewrite_content(&request));
    }

    #[test]
    fn test_should_rewrite_without_content_type() {
        let request = HttpRequest::from_bytes("POST", "/", "<a/>");
        assert!(should_rewrite_content(&request));
    }

    #[test]
    fn test_should_not_rewrite_binary_or_empty() {
        let mut request = HttpRequest::from_bytes("POST", "/", vec![0u8; 4]);
        request.set_header("Content-Type", "application/octet-stream");
        assert!(!should_rewrite_content(&request));

        let empty = HttpRequest::from_bytes("POST", "/", "");
        assert!(!should_rewrite_content(&empty));
    }
}
