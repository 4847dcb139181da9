//! Session cookies and their uniqueness bookkeeping.

use crate::error::{Iperf3Error, Result};
use crate::protocol::COOKIE_SIZE;
use rand::Rng;
use std::collections::HashSet;
use std::fmt;

const COOKIE_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz234567";

/// Identifier correlating the control and data connections of a session
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Cookie(String);

impl Cookie {
    /// Draw a fresh random cookie
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let text = (0..COOKIE_SIZE - 1)
            .map(|_| COOKIE_ALPHABET[rng.gen_range(0..COOKIE_ALPHABET.len())] as char)
            .collect();
        Cookie(text)
    }

    /// Wire form: the characters followed by NUL padding
    pub fn to_bytes(&self) -> [u8; COOKIE_SIZE] {
        let mut buf = [0u8; COOKIE_SIZE];
        let text = self.0.as_bytes();
        let n = text.len().min(COOKIE_SIZE - 1);
        buf[..n].copy_from_slice(&text[..n]);
        buf
    }

    pub fn from_bytes(buf: &[u8; COOKIE_SIZE]) -> Result<Self> {
        let end = buf.iter().position(|b| *b == 0).unwrap_or(COOKIE_SIZE);
        let text = std::str::from_utf8(&buf[..end])
            .map_err(|_| Iperf3Error::Protocol("cookie is not valid UTF-8".to_string()))?;
        if text.is_empty() {
            return Err(Iperf3Error::Protocol("empty cookie".to_string()));
        }
        Ok(Cookie(text.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Cookies currently held by the sessions of one controller.
///
/// Scoped to a controller instance rather than the process; a deployment with
/// a single controller gets process-wide uniqueness from it.
#[derive(Debug, Default)]
pub struct CookieRegistry {
    live: HashSet<Cookie>,
}

impl CookieRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate a cookie no live session uses and register it
    pub fn issue(&mut self) -> Cookie {
        loop {
            let cookie = Cookie::generate();
            if self.live.insert(cookie.clone()) {
                return cookie;
            }
        }
    }

    /// Register a cookie received from a peer. Returns false if it was already live.
    pub fn register(&mut self, cookie: &Cookie) -> bool {
        self.live.insert(cookie.clone())
    }

    pub fn release(&mut self, cookie: &Cookie) {
        self.live.remove(cookie);
    }

    pub fn contains(&self, cookie: &Cookie) -> bool {
        self.live.contains(cookie)
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}
