//! Minimal HTTP/1.1 JSON POST over a plain TCP socket.
//!
//! Enough for a request/response proxy on a trusted network: one request
//! per connection, `Connection: close`, `Content-Length` or chunked bodies.
//! TLS is not spoken; `https://` URLs are rejected.

use std::{
    io::{BufRead, BufReader, Read, Write},
    net::{TcpStream, ToSocketAddrs},
    time::Duration,
};

use serde_json::Value;

use crate::error::ClientError;

/// Largest response body accepted from the proxy.
pub const MAX_BODY_BYTES: usize = 64 * 1024;
/// Status line and headers together.
const MAX_HEAD_BYTES: u64 = 16 * 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpUrl {
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl HttpUrl {
    pub fn parse(url: &str) -> Result<Self, ClientError> {
        let rest = url.trim().strip_prefix("http://").ok_or_else(|| {
            ClientError::InvalidInput(format!("only http:// URLs are supported: {url}"))
        })?;
        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };
        if authority.is_empty() {
            return Err(ClientError::InvalidInput(format!("missing host in {url}")));
        }
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| ClientError::InvalidInput(format!("bad port in {url}")))?;
                (host, port)
            }
            None => (authority, 80),
        };
        Ok(Self {
            host: host.to_string(),
            port,
            path: path.to_string(),
        })
    }
}

#[derive(Clone, Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn json(&self) -> Result<Value, ClientError> {
        serde_json::from_slice(&self.body)
            .map_err(|e| ClientError::Remote(format!("response is not JSON: {e}")))
    }
}

fn io_err(context: &str, err: std::io::Error) -> ClientError {
    ClientError::Network(format!("{context}: {err}"))
}

/// POSTs `body` as JSON and returns the raw response. Connect, read and
/// write each give up after `timeout`.
pub fn post_json(url: &HttpUrl, body: &Value, timeout: Duration) -> Result<HttpResponse, ClientError> {
    let addr = (url.host.as_str(), url.port)
        .to_socket_addrs()
        .map_err(|e| io_err("resolve", e))?
        .next()
        .ok_or_else(|| ClientError::Network(format!("no address for {}", url.host)))?;
    let mut stream = TcpStream::connect_timeout(&addr, timeout).map_err(|e| io_err("connect", e))?;
    stream
        .set_read_timeout(Some(timeout))
        .map_err(|e| io_err("set timeout", e))?;
    stream
        .set_write_timeout(Some(timeout))
        .map_err(|e| io_err("set timeout", e))?;

    let payload = body.to_string();
    let head = format!(
        "POST {} HTTP/1.1\r\nHost: {}:{}\r\nContent-Type: application/json\r\nAccept: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        url.path,
        url.host,
        url.port,
        payload.len()
    );
    stream
        .write_all(head.as_bytes())
        .and_then(|_| stream.write_all(payload.as_bytes()))
        .and_then(|_| stream.flush())
        .map_err(|e| io_err("send", e))?;

    read_response(BufReader::new(stream))
}

fn too_large(what: &str) -> ClientError {
    ClientError::Network(format!("{what} exceeds {MAX_BODY_BYTES} bytes"))
}

fn read_response<R: BufRead>(reader: R) -> Result<HttpResponse, ClientError> {
    let mut reader = reader.take(MAX_HEAD_BYTES);
    let mut status_line = String::new();
    reader
        .read_line(&mut status_line)
        .map_err(|e| io_err("read status", e))?;
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| ClientError::Network(format!("bad status line {status_line:?}")))?;

    let mut content_length: Option<usize> = None;
    let mut chunked = false;
    loop {
        let mut line = String::new();
        let n = reader
            .read_line(&mut line)
            .map_err(|e| io_err("read header", e))?;
        let line = line.trim_end();
        if n == 0 || line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if name.eq_ignore_ascii_case("content-length") {
            content_length = value.parse().ok();
        } else if name.eq_ignore_ascii_case("transfer-encoding") {
            chunked = value.to_ascii_lowercase().contains("chunked");
        }
    }

    if reader.limit() == 0 {
        return Err(ClientError::Network(format!(
            "response head exceeds {MAX_HEAD_BYTES} bytes"
        )));
    }

    let mut reader = reader.into_inner();
    let body = if chunked {
        read_chunked(&mut reader)?
    } else if let Some(len) = content_length {
        if len > MAX_BODY_BYTES {
            return Err(too_large("content length"));
        }
        let mut body = vec![0u8; len];
        reader
            .read_exact(&mut body)
            .map_err(|e| io_err("read body", e))?;
        body
    } else {
        let mut body = Vec::new();
        reader
            .take(MAX_BODY_BYTES as u64 + 1)
            .read_to_end(&mut body)
            .map_err(|e| io_err("read body", e))?;
        if body.len() > MAX_BODY_BYTES {
            return Err(too_large("body"));
        }
        body
    };
    Ok(HttpResponse { status, body })
}

fn read_chunked<R: BufRead>(reader: &mut R) -> Result<Vec<u8>, ClientError> {
    let mut body = Vec::new();
    loop {
        let mut size_line = String::new();
        reader
            .by_ref()
            .take(64)
            .read_line(&mut size_line)
            .map_err(|e| io_err("read chunk size", e))?;
        let size_hex = size_line.trim().split(';').next().unwrap_or("");
        let size = usize::from_str_radix(size_hex, 16)
            .map_err(|_| ClientError::Network(format!("bad chunk size {size_hex:?}")))?;
        if size == 0 {
            break;
        }
        let start = body.len();
        let end = start
            .checked_add(size)
            .filter(|end| *end <= MAX_BODY_BYTES)
            .ok_or_else(|| too_large("chunked body"))?;
        body.resize(end, 0);
        reader
            .read_exact(&mut body[start..])
            .map_err(|e| io_err("read chunk", e))?;
        let mut crlf = [0u8; 2];
        reader
            .read_exact(&mut crlf)
            .map_err(|e| io_err("read chunk", e))?;
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::{io::Cursor, net::TcpListener, thread};

    #[test]
    fn parses_http_urls() {
        let url = HttpUrl::parse("http://127.0.0.1:8787/api/suggest").unwrap();
        assert_eq!(url.host, "127.0.0.1");
        assert_eq!(url.port, 8787);
        assert_eq!(url.path, "/api/suggest");
        let bare = HttpUrl::parse("http://proxy.local").unwrap();
        assert_eq!((bare.port, bare.path.as_str()), (80, "/"));
        assert!(HttpUrl::parse("https://secure.example").is_err());
        assert!(HttpUrl::parse("http://host:notaport/").is_err());
        assert!(HttpUrl::parse("http:///path").is_err());
    }

    #[test]
    fn decodes_chunked_bodies() {
        let raw = "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n7\r\n{\"a\":1,\r\n6\r\n\"b\":2}\r\n0\r\n\r\n";
        let response = read_response(Cursor::new(raw.as_bytes())).unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.json().unwrap(), json!({"a": 1, "b": 2}));
    }

    #[test]
    fn oversized_replies_are_network_errors() {
        let huge_length = "HTTP/1.1 200 OK\r\nContent-Length: 18446744073709551615\r\n\r\n{}";
        let huge_chunk = "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nffffffffffffffff\r\n{}\r\n0\r\n\r\n";
        let endless = format!(
            "HTTP/1.1 200 OK\r\n\r\n{}",
            "x".repeat(MAX_BODY_BYTES + 10)
        );
        let endless_head = format!("HTTP/1.1 200 OK\r\nX-Pad: {}\r\n\r\n{{}}", "y".repeat(20_000));
        for raw in [huge_length.to_string(), huge_chunk.to_string(), endless, endless_head] {
            let err = read_response(Cursor::new(raw.into_bytes())).unwrap_err();
            assert!(matches!(err, ClientError::Network(_)), "{err:?}");
        }
    }

    #[test]
    fn chunks_adding_up_past_the_cap_are_rejected() {
        let chunk = "x".repeat(40 * 1024);
        let raw = format!(
            "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n{len:x}\r\n{chunk}\r\n{len:x}\r\n{chunk}\r\n0\r\n\r\n",
            len = chunk.len()
        );
        let err = read_response(Cursor::new(raw.into_bytes())).unwrap_err();
        assert!(err.to_string().contains("exceeds"), "{err}");
    }

    #[test]
    fn posts_json_to_a_local_server() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream);
            let mut length = 0;
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                if line == "\r\n" {
                    break;
                }
                if let Some(v) = line.to_ascii_lowercase().strip_prefix("content-length:") {
                    length = v.trim().parse().unwrap();
                }
            }
            let mut body = vec![0u8; length];
            reader.read_exact(&mut body).unwrap();
            let echoed: Value = serde_json::from_slice(&body).unwrap();
            let reply = json!({"description": format!("About {}", echoed["title"].as_str().unwrap())})
                .to_string();
            let mut stream = reader.into_inner();
            write!(
                stream,
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
                reply.len(),
                reply
            )
            .unwrap();
        });

        let url = HttpUrl::parse(&format!("http://127.0.0.1:{port}/suggest")).unwrap();
        let response = post_json(&url, &json!({"title": "Trees", "goal": "5"}), Duration::from_secs(2)).unwrap();
        server.join().unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.json().unwrap()["description"], "About Trees");
    }

    #[test]
    fn unreachable_hosts_are_network_errors() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let url = HttpUrl::parse(&format!("http://127.0.0.1:{port}/")).unwrap();
        let err = post_json(&url, &json!({}), Duration::from_millis(500)).unwrap_err();
        assert!(err.is_transient());
    }
}
