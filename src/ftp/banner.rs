//! Welcome banner validation and rendering

use std::ops::Range;

/// Per-line byte cap
pub const MAX_LINE_BYTES: usize = 1024;

/// Whole-banner byte cap
pub const MAX_TOTAL_BYTES: usize = 8192;

/// Why a banner was rejected, pointing at the offending bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BannerViolation {
    /// Byte range of the problem within the banner
    pub range: Range<usize>,
    /// What is wrong with it
    pub reason: BannerViolationReason,
}

/// Rejection reasons
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BannerViolationReason {
    /// A line exceeds [`MAX_LINE_BYTES`]
    LineTooLong,
    /// The banner exceeds [`MAX_TOTAL_BYTES`]
    TotalTooLong,
    /// Not valid UTF-8
    InvalidUtf8,
}

impl std::fmt::Display for BannerViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let what = match self.reason {
            BannerViolationReason::LineTooLong => "line exceeds 1024 bytes",
            BannerViolationReason::TotalTooLong => "banner exceeds 8192 bytes",
            BannerViolationReason::InvalidUtf8 => "invalid UTF-8",
        };
        write!(f, "{what} at bytes {}..{}", self.range.start, self.range.end)
    }
}

/// Validate a banner's raw bytes
pub fn validate(banner: &[u8]) -> Result<(), BannerViolation> {
    if banner.len() > MAX_TOTAL_BYTES {
        return Err(BannerViolation {
            range: MAX_TOTAL_BYTES..banner.len(),
            reason: BannerViolationReason::TotalTooLong,
        });
    }

    if let Err(e) = std::str::from_utf8(banner) {
        let start = e.valid_up_to();
        let end = e
            .error_len()
            .map(|len| start + len)
            .unwrap_or(banner.len());
        return Err(BannerViolation {
            range: start..end,
            reason: BannerViolationReason::InvalidUtf8,
        });
    }

    let mut line_start = 0;
    for (i, &b) in banner.iter().enumerate() {
        if b == b'\n' {
            if i - line_start > MAX_LINE_BYTES {
                return Err(BannerViolation {
                    range: line_start..i,
                    reason: BannerViolationReason::LineTooLong,
                });
            }
            line_start = i + 1;
        }
    }
    if banner.len() - line_start > MAX_LINE_BYTES {
        return Err(BannerViolation {
            range: line_start..banner.len(),
            reason: BannerViolationReason::LineTooLong,
        });
    }

    Ok(())
}

/// Expand placeholders and split into reply lines
///
/// `%v` becomes the server version. Validation applies to the expanded
/// text, so a placeholder cannot smuggle an oversize line past the check.
pub fn render(banner: &str, version: &str) -> Result<Vec<String>, BannerViolation> {
    let expanded = banner.replace("%v", version);
    validate(expanded.as_bytes())?;
    Ok(expanded.split('\n').map(str::to_owned).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_banner_ok() {
        assert!(validate(b"Welcome.\nSecond line.").is_ok());
    }

    #[test]
    fn test_line_at_cap_is_ok() {
        let banner = vec![b'x'; MAX_LINE_BYTES];
        assert!(validate(&banner).is_ok());
    }

    #[test]
    fn test_line_over_cap_reports_range() {
        let mut banner = b"short\n".to_vec();
        banner.extend(vec![b'y'; MAX_LINE_BYTES + 1]);
        let violation = validate(&banner).expect_err("too long");
        assert_eq!(violation.reason, BannerViolationReason::LineTooLong);
        assert_eq!(violation.range.start, 6);
    }

    #[test]
    fn test_total_over_cap() {
        let line = vec![b'z'; 1000];
        let mut banner = Vec::new();
        for _ in 0..9 {
            banner.extend_from_slice(&line);
            banner.push(b'\n');
        }
        let violation = validate(&banner).expect_err("too big");
        assert_eq!(violation.reason, BannerViolationReason::TotalTooLong);
    }

    #[test]
    fn test_invalid_utf8_reports_offset() {
        let banner = b"ok so far \xff\xfe oops";
        let violation = validate(banner).expect_err("bad utf8");
        assert_eq!(violation.reason, BannerViolationReason::InvalidUtf8);
        assert_eq!(violation.range.start, 10);
    }

    #[test]
    fn test_render_expands_version() {
        let lines = render("Welcome to %v!\nEnjoy.", "ftpd-rs 0.2.0").expect("render");
        assert_eq!(lines[0], "Welcome to ftpd-rs 0.2.0!");
        assert_eq!(lines.len(), 2);
    }

    #[test]
    fn test_render_validates_expanded_text() {
        let huge_version = "v".repeat(MAX_LINE_BYTES + 10);
        assert!(render("%v", &huge_version).is_err());
    }
}
