//! Directory listing rendering and the listing pipe source
//!
//! Listings flow through the same transfer machinery as files: the
//! resolver produces entries, this module renders them into LIST, NLST, or
//! MLSD lines and streams them into the data-connection pipe page by page.

use crate::pipeline::{Drive, DriveResult, LockingBuffer, Source};
use crate::tvfs::Entry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::SystemTime;

/// Listing dialects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingFormat {
    /// Unix `ls -l` style lines (LIST)
    Long,
    /// Bare names (NLST)
    NamesOnly,
    /// Machine-readable facts (MLSD, RFC 3659)
    Machine,
}

/// Render one entry in the given dialect
pub fn format_entry(entry: &Entry, format: ListingFormat, now: SystemTime) -> String {
    match format {
        ListingFormat::NamesOnly => entry.name.clone(),
        ListingFormat::Long => format_long(entry, now),
        ListingFormat::Machine => format_machine(entry),
    }
}

fn format_long(entry: &Entry, now: SystemTime) -> String {
    let kind = if entry.is_dir() { 'd' } else { '-' };
    let write = if entry.writable { 'w' } else { '-' };
    let mode = format!("{kind}r{write}xr-xr-x");
    let links = 1;
    let modified: DateTime<Utc> = entry.modified.unwrap_or(now).into();
    let now: DateTime<Utc> = now.into();

    // Recent entries show the clock time, older ones the year.
    let stamp = if now.signed_duration_since(modified).num_days().abs() < 180 {
        modified.format("%b %e %H:%M")
    } else {
        modified.format("%b %e  %Y")
    };

    format!(
        "{mode} {links:>3} ftp ftp {size:>12} {stamp} {name}",
        size = entry.size,
        name = entry.name
    )
}

fn format_machine(entry: &Entry) -> String {
    let kind = if entry.is_dir() { "dir" } else { "file" };
    let perms = if entry.is_dir() {
        if entry.writable { "flcdmpe" } else { "le" }
    } else if entry.writable {
        "adfrw"
    } else {
        "r"
    };
    let mut facts = format!("type={kind};perm={perms};");
    if !entry.is_dir() {
        facts.push_str(&format!("size={};", entry.size));
    }
    if let Some(modified) = entry.modified {
        let dt: DateTime<Utc> = modified.into();
        facts.push_str(&format!("modify={};", dt.format("%Y%m%d%H%M%S")));
    }
    format!("{facts} {}", entry.name)
}

/// Render a whole listing
pub fn render(entries: &[Entry], format: ListingFormat) -> Vec<String> {
    let now = SystemTime::now();
    entries
        .iter()
        .map(|e| format_entry(e, format, now))
        .collect()
}

/// Pipe source streaming rendered lines with CRLF terminators
pub struct ListingSource {
    lines: Vec<String>,
    next: usize,
}

const LINES_PER_FILL: usize = 64;

impl ListingSource {
    /// Stream the given rendered lines
    pub fn new(lines: Vec<String>) -> Self {
        Self { lines, next: 0 }
    }
}

#[async_trait]
impl Source for ListingSource {
    async fn fill(&mut self, buf: &LockingBuffer) -> DriveResult {
        if self.next >= self.lines.len() {
            return Ok(Drive::EndOfData);
        }
        let end = (self.next + LINES_PER_FILL).min(self.lines.len());
        let mut chunk = String::new();
        for line in &self.lines[self.next..end] {
            chunk.push_str(line);
            chunk.push_str("\r\n");
        }
        self.next = end;
        buf.lock().append(chunk.as_bytes());
        Ok(Drive::Progress)
    }
}

/// MDTM timestamp for one entry (RFC 3659 `YYYYMMDDHHMMSS`)
pub fn mdtm_timestamp(modified: SystemTime) -> String {
    let dt: DateTime<Utc> = modified.into();
    dt.format("%Y%m%d%H%M%S").to_string()
}
