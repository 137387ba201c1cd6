//! FTP command parsing

/// A parsed control-channel command
///
/// Verbs are matched case-insensitively; arguments keep their original
/// spelling. Anything unrecognized lands in `Unknown` so the session can
/// answer 500 with the offending verb.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// USER name
    User(String),
    /// PASS secret
    Pass(String),
    /// ACCT info
    Acct(String),
    /// AUTH mechanism (only "TLS" is supported)
    Auth(String),
    /// PBSZ size
    Pbsz(String),
    /// PROT level
    Prot(String),
    /// SYST
    Syst,
    /// FEAT
    Feat,
    /// HELP [topic]
    Help(Option<String>),
    /// NOOP
    Noop,
    /// QUIT
    Quit,
    /// TYPE code
    Type(String),
    /// STRU code
    Stru(String),
    /// MODE code
    Mode(String),
    /// PWD
    Pwd,
    /// CWD path
    Cwd(String),
    /// CDUP
    Cdup,
    /// MKD path
    Mkd(String),
    /// RMD path
    Rmd(String),
    /// DELE path
    Dele(String),
    /// RNFR path
    Rnfr(String),
    /// RNTO path
    Rnto(String),
    /// SIZE path
    Size(String),
    /// MDTM path
    Mdtm(String),
    /// STAT [path]
    Stat(Option<String>),
    /// PORT h1,h2,h3,h4,p1,p2
    Port(String),
    /// EPRT |proto|addr|port|
    Eprt(String),
    /// PASV
    Pasv,
    /// EPSV [proto|ALL]
    Epsv(Option<String>),
    /// LIST [path]
    List(Option<String>),
    /// NLST [path]
    Nlst(Option<String>),
    /// MLSD [path]
    Mlsd(Option<String>),
    /// RETR path
    Retr(String),
    /// STOR path
    Stor(String),
    /// APPE path
    Appe(String),
    /// REST offset
    Rest(String),
    /// ABOR
    Abor,
    /// Anything else; carries the verb
    Unknown(String),
}

impl Command {
    /// The verb as it appears in replies and logs
    pub fn verb(&self) -> &str {
        match self {
            Command::User(_) => "USER",
            Command::Pass(_) => "PASS",
            Command::Acct(_) => "ACCT",
            Command::Auth(_) => "AUTH",
            Command::Pbsz(_) => "PBSZ",
            Command::Prot(_) => "PROT",
            Command::Syst => "SYST",
            Command::Feat => "FEAT",
            Command::Help(_) => "HELP",
            Command::Noop => "NOOP",
            Command::Quit => "QUIT",
            Command::Type(_) => "TYPE",
            Command::Stru(_) => "STRU",
            Command::Mode(_) => "MODE",
            Command::Pwd => "PWD",
            Command::Cwd(_) => "CWD",
            Command::Cdup => "CDUP",
            Command::Mkd(_) => "MKD",
            Command::Rmd(_) => "RMD",
            Command::Dele(_) => "DELE",
            Command::Rnfr(_) => "RNFR",
            Command::Rnto(_) => "RNTO",
            Command::Size(_) => "SIZE",
            Command::Mdtm(_) => "MDTM",
            Command::Stat(_) => "STAT",
            Command::Port(_) => "PORT",
            Command::Eprt(_) => "EPRT",
            Command::Pasv => "PASV",
            Command::Epsv(_) => "EPSV",
            Command::List(_) => "LIST",
            Command::Nlst(_) => "NLST",
            Command::Mlsd(_) => "MLSD",
            Command::Retr(_) => "RETR",
            Command::Stor(_) => "STOR",
            Command::Appe(_) => "APPE",
            Command::Rest(_) => "REST",
            Command::Abor => "ABOR",
            Command::Unknown(v) => v,
        }
    }

    /// Whether this command never appears in logs with its argument
    /// (credentials)
    pub fn argument_is_secret(&self) -> bool {
        matches!(self, Command::Pass(_))
    }
}

/// Parse one control line (terminator already stripped)
pub fn parse(line: &str) -> Command {
    let line = line.trim_end_matches(['\r', '\n']);
    let (verb, arg) = match line.split_once(' ') {
        Some((v, a)) => (v, Some(a.to_owned())),
        None => (line, None),
    };

    let required = |f: fn(String) -> Command| match &arg {
        Some(a) if !a.is_empty() => f(a.clone()),
        _ => Command::Unknown(verb.to_owned()),
    };

    match verb.to_ascii_uppercase().as_str() {
        "USER" => required(Command::User),
        "PASS" => Command::Pass(arg.unwrap_or_default()),
        "ACCT" => required(Command::Acct),
        "AUTH" => required(Command::Auth),
        "PBSZ" => required(Command::Pbsz),
        "PROT" => required(Command::Prot),
        "SYST" => Command::Syst,
        "FEAT" => Command::Feat,
        "HELP" => Command::Help(arg),
        "NOOP" => Command::Noop,
        "QUIT" => Command::Quit,
        "TYPE" => required(Command::Type),
        "STRU" => required(Command::Stru),
        "MODE" => required(Command::Mode),
        "PWD" | "XPWD" => Command::Pwd,
        "CWD" | "XCWD" => required(Command::Cwd),
        "CDUP" | "XCUP" => Command::Cdup,
        "MKD" | "XMKD" => required(Command::Mkd),
        "RMD" | "XRMD" => required(Command::Rmd),
        "DELE" => required(Command::Dele),
        "RNFR" => required(Command::Rnfr),
        "RNTO" => required(Command::Rnto),
        "SIZE" => required(Command::Size),
        "MDTM" => required(Command::Mdtm),
        "STAT" => Command::Stat(arg),
        "PORT" => required(Command::Port),
        "EPRT" => required(Command::Eprt),
        "PASV" => Command::Pasv,
        "EPSV" => Command::Epsv(arg),
        "LIST" => Command::List(arg),
        "NLST" => Command::Nlst(arg),
        "MLSD" => Command::Mlsd(arg),
        "RETR" => required(Command::Retr),
        "STOR" => required(Command::Stor),
        "APPE" => required(Command::Appe),
        "REST" => required(Command::Rest),
        "ABOR" => Command::Abor,
        _ => Command::Unknown(verb.to_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verb_case_insensitive() {
        assert_eq!(parse("user alice"), Command::User("alice".to_owned()));
        assert_eq!(parse("UsEr alice"), Command::User("alice".to_owned()));
    }

    #[test]
    fn test_argument_keeps_case_and_spaces() {
        assert_eq!(
            parse("RETR Mixed Case Name.txt"),
            Command::Retr("Mixed Case Name.txt".to_owned())
        );
    }

    #[test]
    fn test_empty_password_allowed() {
        assert_eq!(parse("PASS"), Command::Pass(String::new()));
    }

    #[test]
    fn test_missing_required_argument() {
        assert_eq!(parse("RETR"), Command::Unknown("RETR".to_owned()));
        assert_eq!(parse("CWD"), Command::Unknown("CWD".to_owned()));
    }

    #[test]
    fn test_optional_arguments() {
        assert_eq!(parse("LIST"), Command::List(None));
        assert_eq!(parse("LIST -la"), Command::List(Some("-la".to_owned())));
        assert_eq!(parse("EPSV"), Command::Epsv(None));
        assert_eq!(parse("STAT /pub"), Command::Stat(Some("/pub".to_owned())));
    }

    #[test]
    fn test_legacy_x_verbs() {
        assert_eq!(parse("XPWD"), Command::Pwd);
        assert_eq!(parse("XMKD dir"), Command::Mkd("dir".to_owned()));
    }

    #[test]
    fn test_unknown_verb() {
        assert_eq!(parse("FROB it"), Command::Unknown("FROB".to_owned()));
    }

    #[test]
    fn test_password_is_secret() {
        assert!(parse("PASS hunter2").argument_is_secret());
        assert!(!parse("USER alice").argument_is_secret());
    }
}
