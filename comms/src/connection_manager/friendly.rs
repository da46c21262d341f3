//   Copyright 2024 The Tether Project
//   SPDX-License-Identifier: BSD-3-Clause

//! The friendly HTTP page.
//!
//! A browser that completes TLS against an RPC listener and then speaks
//! HTTP/1.1 gets a small configurable page instead of a framing error. The
//! body and extra response headers can be changed at runtime; setting the
//! body to the empty string reverts to the default.

use std::{sync::RwLock, time::Duration};

use log::*;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time,
};

const LOG_TARGET: &str = "comms::connection_manager::friendly";

pub const DEFAULT_FRIENDLY_PAGE: &str = "<html><body><p>Hello!</p></body></html>";

/// Reading the request head is bounded in size and time; a misbehaving client
/// gets cut off rather than holding the accept path.
const MAX_REQUEST_HEAD: usize = 8 * 1024;
const REQUEST_READ_DEADLINE: Duration = Duration::from_secs(2);

#[derive(Debug, Default)]
struct PageState {
    /// `None` means the default body.
    body: Option<String>,
    headers: Vec<(String, String)>,
}

#[derive(Debug, Default)]
pub struct FriendlyPage {
    state: RwLock<PageState>,
}

impl FriendlyPage {
    pub fn new() -> Self {
        Default::default()
    }

    /// Replace the page body. An empty body reverts to the default.
    pub fn set_body(&self, body: &str) {
        let mut state = self.state.write().unwrap();
        state.body = if body.is_empty() {
            None
        } else {
            Some(body.to_string())
        };
    }

    /// Set a response header, replacing an existing header of the same name.
    /// Headers are emitted verbatim.
    pub fn set_header(&self, name: &str, value: &str) {
        let mut state = self.state.write().unwrap();
        match state.headers.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
            Some(entry) => entry.1 = value.to_string(),
            None => state.headers.push((name.to_string(), value.to_string())),
        }
    }

    pub fn body(&self) -> String {
        self.state
            .read()
            .unwrap()
            .body
            .clone()
            .unwrap_or_else(|| DEFAULT_FRIENDLY_PAGE.to_string())
    }

    fn render(&self) -> String {
        let state = self.state.read().unwrap();
        let body = state.body.as_deref().unwrap_or(DEFAULT_FRIENDLY_PAGE);
        let mut response = String::with_capacity(128 + body.len());
        response.push_str("HTTP/1.1 200 OK\r\n");
        response.push_str("Content-Type: text/html\r\n");
        response.push_str(&format!("Content-Length: {}\r\n", body.len()));
        response.push_str("Connection: close\r\n");
        for (name, value) in &state.headers {
            response.push_str(&format!("{}: {}\r\n", name, value));
        }
        response.push_str("\r\n");
        response.push_str(body);
        response
    }

    /// Serve one request on an established stream whose leading bytes have
    /// already been read, then close.
    pub(crate) async fn respond<S>(&self, mut stream: S, lead: &[u8]) -> std::io::Result<()>
    where S: AsyncRead + AsyncWrite + Unpin {
        // Read the rest of the request head; the response does not depend on
        // it, so a truncated or oversized head only shortens the wait.
        let mut head = lead.to_vec();
        let deadline = time::sleep(REQUEST_READ_DEADLINE);
        tokio::pin!(deadline);
        let mut buf = [0u8; 1024];
        while !head.windows(4).any(|w| w == b"\r\n\r\n") && head.len() < MAX_REQUEST_HEAD {
            tokio::select! {
                _ = &mut deadline => break,
                read = stream.read(&mut buf) => match read {
                    Ok(0) | Err(_) => break,
                    Ok(n) => head.extend_from_slice(&buf[..n]),
                },
            }
        }

        debug!(target: LOG_TARGET, "serving the friendly page");
        stream.write_all(self.render().as_bytes()).await?;
        stream.flush().await?;
        stream.shutdown().await?;
        Ok(())
    }
}

/// True if the leading bytes of a stream look like a plaintext HTTP request
/// line. Works on partial reads: a strict prefix of a method token matches.
pub(crate) fn looks_like_http(lead: &[u8]) -> bool {
    const METHODS: &[&[u8]] = &[
        b"GET ", b"POST", b"PUT ", b"HEAD", b"DELE", b"OPTI", b"PATC", b"TRAC", b"CONN",
    ];
    if lead.is_empty() {
        return false;
    }
    METHODS
        .iter()
        .any(|m| lead.starts_with(m) || (lead.len() < m.len() && m.starts_with(lead)))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_body_and_revert() {
        let page = FriendlyPage::new();
        assert_eq!(page.body(), DEFAULT_FRIENDLY_PAGE);

        page.set_body("Simple text works too!");
        assert_eq!(page.body(), "Simple text works too!");

        page.set_body("");
        assert_eq!(page.body(), DEFAULT_FRIENDLY_PAGE);
    }

    #[test]
    fn headers_render_verbatim() {
        let page = FriendlyPage::new();
        page.set_header("X-Content-Type-Options", "nosniff");
        page.set_header("X-Frame-Options", "DENY");
        page.set_header("X-Frame-Options", "SAMEORIGIN");
        let rendered = page.render();
        assert!(rendered.contains("X-Content-Type-Options: nosniff\r\n"));
        assert!(rendered.contains("X-Frame-Options: SAMEORIGIN\r\n"));
        assert!(!rendered.contains("DENY"));
    }

    #[test]
    fn http_sniffing() {
        assert!(looks_like_http(b"GET / HTTP/1.1"));
        assert!(looks_like_http(b"POST"));
        assert!(looks_like_http(b"PU"));
        assert!(looks_like_http(b"G"));
        assert!(!looks_like_http(b""));
        assert!(!looks_like_http(&[0x16, 0x03, 0x01, 0x02])); // TLS ClientHello
        assert!(!looks_like_http(&[0x2a, 0x00, 0x00, 0x00])); // frame length prefix
    }

    #[tokio::test]
    async fn respond_writes_page_and_closes() {
        let page = FriendlyPage::new();
        page.set_header("X-Content-Type-Options", "nosniff");
        let (client, server) = tokio::io::duplex(16 * 1024);

        let serve = page.respond(server, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        let read = async {
            let mut client = client;
            let mut out = Vec::new();
            client.read_to_end(&mut out).await.unwrap();
            String::from_utf8(out).unwrap()
        };
        let (served, response) = tokio::join!(serve, read);
        served.unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("X-Content-Type-Options: nosniff\r\n"));
        assert!(response.ends_with(DEFAULT_FRIENDLY_PAGE));
    }
}
