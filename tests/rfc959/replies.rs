//! RFC 959 §4.2 - Reply format

use ftpd_rs::ftp::replies::{codes, Reply};

#[test]
fn test_single_line_terminates_with_crlf() {
    let wire = Reply::new(codes::READY, "Service ready.").to_wire();
    assert_eq!(wire, "220 Service ready.\r\n");
}

#[test]
fn test_multiline_uses_hyphen_and_close() {
    let wire = Reply::multiline(
        codes::SYSTEM_STATUS,
        "Features:",
        vec!["MDTM".to_owned(), "SIZE".to_owned()],
    )
    .to_wire();
    let lines: Vec<&str> = wire.split_terminator("\r\n").collect();
    assert_eq!(lines.first(), Some(&"211-Features:"));
    assert_eq!(lines.last(), Some(&"211 End"));
    // Continuation lines are indented so they cannot be mistaken for a
    // final reply line.
    assert!(lines[1].starts_with(' '));
}

#[test]
fn test_code_classes() {
    assert!(Reply::new(codes::TRANSFER_COMPLETE, "").is_success());
    assert!(Reply::new(codes::LOGGED_IN, "").is_success());
    assert!(!Reply::new(codes::NEED_PASSWORD, "").is_success());
    assert!(!Reply::new(codes::TRANSFER_ABORTED, "").is_success());
    assert!(!Reply::new(codes::NOT_LOGGED_IN, "").is_success());
}

#[test]
fn test_key_code_values() {
    // Values are protocol constants; a typo here is a wire break.
    assert_eq!(codes::OPENING_DATA, 150);
    assert_eq!(codes::PASSIVE_MODE, 227);
    assert_eq!(codes::EXTENDED_PASSIVE_MODE, 229);
    assert_eq!(codes::LOGGED_IN, 230);
    assert_eq!(codes::AUTH_OK, 234);
    assert_eq!(codes::NEED_PASSWORD, 331);
    assert_eq!(codes::TRANSFER_ABORTED, 426);
    assert_eq!(codes::POLICY_REQUIRES_TLS, 534);
    assert_eq!(codes::FILE_UNAVAILABLE, 550);
}
