//! Signed pagination cursors

use crate::error::{Error, Result};
use crate::key::Key;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Page size used when a pagination request leaves the limit at zero
pub const DEFAULT_PAGE_SIZE: u64 = 100;

static QUERY_SHAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)\bFROM\s(.+?)(?:\sLIMIT\s|;?\s*$)").expect("valid regex"));

/// Signature of a query's shape: its FROM through ORDER BY span, with the
/// limit excluded
pub fn sign(rendered: &str) -> String {
    let shape = QUERY_SHAPE
        .captures(rendered)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim())
        .unwrap_or("");
    STANDARD.encode(Sha256::digest(shape.as_bytes()))
}

/// Position in a paginated result, tied to the query it came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    #[serde(rename = "sig")]
    pub signature: String,
    pub key: Key,
}

impl Cursor {
    pub fn new(signature: impl Into<String>, key: Key) -> Self {
        Self {
            signature: signature.into(),
            key,
        }
    }

    /// Opaque URL-safe token
    pub fn encode(&self) -> String {
        // serializing a struct of strings cannot fail
        let json = serde_json::to_vec(self).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(json)
    }

    pub fn decode(token: &str) -> Result<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|_| Error::InvalidCursor)?;
        serde_json::from_slice(&bytes).map_err(|_| Error::InvalidCursor)
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for Cursor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::decode(s)
    }
}

/// Page request and the state it reports back
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pagination {
    /// Rows per page; zero uses [`DEFAULT_PAGE_SIZE`]
    pub limit: u64,
    /// Token of the page to continue from
    pub cursor: Option<String>,
    next_cursor: Option<Cursor>,
    count: usize,
}

impl Pagination {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            ..Default::default()
        }
    }

    pub fn with_cursor(mut self, cursor: impl Into<String>) -> Self {
        self.cursor = Some(cursor.into()).filter(|c: &String| !c.is_empty());
        self
    }

    pub fn page_size(&self) -> u64 {
        if self.limit == 0 {
            DEFAULT_PAGE_SIZE
        } else {
            self.limit
        }
    }

    /// Token for the following page, `None` on the last page
    pub fn next_cursor(&self) -> Option<String> {
        self.next_cursor.as_ref().map(Cursor::encode)
    }

    /// Rows returned in the current page
    pub fn count(&self) -> usize {
        self.count
    }

    /// Advance to the page after the one just fetched
    pub fn advance(&mut self) -> bool {
        match self.next_cursor() {
            Some(next) => {
                self.cursor = Some(next);
                true
            }
            None => false,
        }
    }

    pub(crate) fn set_page(&mut self, count: usize, next: Option<Cursor>) {
        self.count = count;
        self.next_cursor = next;
    }
}
