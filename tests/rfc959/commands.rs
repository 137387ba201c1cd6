//! RFC 959 §4 - Command parsing
//!
//! Verb recognition is case-insensitive, arguments keep their spelling,
//! and verbs with a mandatory argument reject bare forms.

use ftpd_rs::ftp::commands::{parse, Command};

#[test]
fn test_access_control_commands() {
    assert_eq!(parse("USER anonymous"), Command::User("anonymous".to_owned()));
    assert_eq!(parse("pass secret word"), Command::Pass("secret word".to_owned()));
    assert_eq!(parse("QUIT"), Command::Quit);
    assert_eq!(parse("ACCT billing"), Command::Acct("billing".to_owned()));
}

#[test]
fn test_transfer_parameter_commands() {
    assert_eq!(parse("TYPE A"), Command::Type("A".to_owned()));
    assert_eq!(parse("STRU F"), Command::Stru("F".to_owned()));
    assert_eq!(parse("MODE S"), Command::Mode("S".to_owned()));
    assert_eq!(parse("PORT 127,0,0,1,10,10"), Command::Port("127,0,0,1,10,10".to_owned()));
    assert_eq!(parse("PASV"), Command::Pasv);
}

#[test]
fn test_service_commands() {
    assert_eq!(parse("RETR file.bin"), Command::Retr("file.bin".to_owned()));
    assert_eq!(parse("STOR file.bin"), Command::Stor("file.bin".to_owned()));
    assert_eq!(parse("APPE log.txt"), Command::Appe("log.txt".to_owned()));
    assert_eq!(parse("REST 1024"), Command::Rest("1024".to_owned()));
    assert_eq!(parse("RNFR a"), Command::Rnfr("a".to_owned()));
    assert_eq!(parse("RNTO b"), Command::Rnto("b".to_owned()));
    assert_eq!(parse("DELE junk"), Command::Dele("junk".to_owned()));
    assert_eq!(parse("ABOR"), Command::Abor);
}

#[test]
fn test_rfc2228_and_rfc2428_commands() {
    assert_eq!(parse("AUTH TLS"), Command::Auth("TLS".to_owned()));
    assert_eq!(parse("PBSZ 0"), Command::Pbsz("0".to_owned()));
    assert_eq!(parse("PROT P"), Command::Prot("P".to_owned()));
    assert_eq!(parse("EPRT |1|127.0.0.1|2000|"), Command::Eprt("|1|127.0.0.1|2000|".to_owned()));
    assert_eq!(parse("EPSV ALL"), Command::Epsv(Some("ALL".to_owned())));
}

#[test]
fn test_rfc3659_commands() {
    assert_eq!(parse("SIZE big.iso"), Command::Size("big.iso".to_owned()));
    assert_eq!(parse("MDTM big.iso"), Command::Mdtm("big.iso".to_owned()));
    assert_eq!(parse("MLSD /pub"), Command::Mlsd(Some("/pub".to_owned())));
}

#[test]
fn test_pathnames_with_spaces_survive() {
    assert_eq!(
        parse("RETR dir with spaces/file name.txt"),
        Command::Retr("dir with spaces/file name.txt".to_owned())
    );
}

#[test]
fn test_mandatory_argument_enforced() {
    for bare in ["RETR", "STOR", "DELE", "RNFR", "RNTO", "SIZE", "MDTM", "USER"] {
        assert_eq!(parse(bare), Command::Unknown(bare.to_owned()), "{bare}");
    }
}

#[test]
fn test_unknown_verbs_carry_spelling() {
    assert_eq!(parse("xyzzy arg"), Command::Unknown("xyzzy".to_owned()));
}
