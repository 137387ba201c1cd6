//! XML persistence of the configuration documents
//!
//! Separate documents for settings, users, and groups. The root element
//! carries the serializer flavour and version; a mismatch is logged as a
//! warning and loading proceeds best-effort.

use crate::auth::{
    AuthMethod, Group, ImpersonationCredentials, PasswordHash, RateLimits, User,
};
use crate::config::model::{
    AdminSettings, AutobanConfig, ListenerConfig, ServerSettings, TlsMode,
};
use crate::error::{FtpdError, Result};
use crate::filter::{parse_net, AddressFilter};
use crate::tvfs::{MountAccess, MountPoint, MountTable, Recursion};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::time::Duration;
use tracing::warn;

/// Serializer flavour recorded in the root element
pub const FLAVOR: &str = "ftpd-rs";

/// Serializer version recorded in the root element
pub const VERSION: u32 = 2;

const ROOT: &str = "ftpd";

type XmlWriter = Writer<Vec<u8>>;

fn new_writer() -> XmlWriter {
    Writer::new_with_indent(Vec::new(), b' ', 2)
}

fn begin_doc(w: &mut XmlWriter) -> Result<()> {
    w.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(xml_err)?;
    let mut root = BytesStart::new(ROOT);
    root.push_attribute(("flavor", FLAVOR));
    root.push_attribute(("version", VERSION.to_string().as_str()));
    w.write_event(Event::Start(root)).map_err(xml_err)?;
    Ok(())
}

fn end_doc(mut w: XmlWriter) -> Result<String> {
    w.write_event(Event::End(BytesEnd::new(ROOT)))
        .map_err(xml_err)?;
    String::from_utf8(w.into_inner()).map_err(|e| FtpdError::Config(e.to_string()))
}

fn xml_err(e: impl std::fmt::Display) -> FtpdError {
    FtpdError::Config(format!("XML error: {e}"))
}

fn check_root(e: &BytesStart<'_>) {
    let flavor = attr(e, "flavor");
    let version = attr(e, "version");
    let expected = VERSION.to_string();
    if flavor.as_deref() != Some(FLAVOR) || version.as_deref() != Some(expected.as_str()) {
        warn!(
            ?flavor,
            ?version,
            "configuration document flavour/version mismatch, loading best-effort"
        );
    }
}

fn attr(e: &BytesStart<'_>, name: &str) -> Option<String> {
    e.try_get_attribute(name)
        .ok()
        .flatten()
        .and_then(|a| a.unescape_value().ok())
        .map(|v| v.into_owned())
}

fn parse_attr<T: std::str::FromStr>(e: &BytesStart<'_>, name: &str) -> Option<T> {
    attr(e, name)?.parse().ok()
}

fn text_element(w: &mut XmlWriter, tag: &str, text: &str) -> Result<()> {
    w.write_event(Event::Start(BytesStart::new(tag)))
        .map_err(xml_err)?;
    w.write_event(Event::Text(BytesText::new(text)))
        .map_err(xml_err)?;
    w.write_event(Event::End(BytesEnd::new(tag)))
        .map_err(xml_err)?;
    Ok(())
}

// ---------------------------------------------------------------- settings

/// Serialize listeners, server settings, and the administration settings
pub fn settings_to_xml(
    listeners: &[ListenerConfig],
    settings: &ServerSettings,
    admin: &AdminSettings,
) -> Result<String> {
    let mut w = new_writer();
    begin_doc(&mut w)?;

    for l in listeners {
        let mut e = BytesStart::new("listener");
        e.push_attribute(("address", l.address.to_string().as_str()));
        e.push_attribute(("port", l.port.to_string().as_str()));
        let (tls, require) = match l.tls {
            TlsMode::Plain => ("plain", false),
            TlsMode::Explicit { require_tls } => ("explicit", require_tls),
            TlsMode::Implicit => ("implicit", false),
        };
        e.push_attribute(("tls", tls));
        e.push_attribute(("require-tls", bool_str(require)));
        w.write_event(Event::Empty(e)).map_err(xml_err)?;
    }

    text_element(&mut w, "banner", &settings.banner)?;

    let mut e = BytesStart::new("server");
    if let Some((lo, hi)) = settings.pasv_port_range {
        e.push_attribute(("pasv-min", lo.to_string().as_str()));
        e.push_attribute(("pasv-max", hi.to_string().as_str()));
    }
    if let Some(host) = &settings.host_override {
        e.push_attribute(("host-override", host.as_str()));
    }
    e.push_attribute((
        "no-override-when-local",
        bool_str(settings.do_not_override_host_if_peer_is_local),
    ));
    e.push_attribute((
        "login-timeout",
        settings.login_timeout.as_secs().to_string().as_str(),
    ));
    e.push_attribute((
        "activity-timeout",
        settings.activity_timeout.as_secs().to_string().as_str(),
    ));
    e.push_attribute(("max-sessions", settings.max_sessions.to_string().as_str()));
    w.write_event(Event::Empty(e)).map_err(xml_err)?;

    let mut e = BytesStart::new("autoban");
    e.push_attribute((
        "max-failures",
        settings.autoban.max_login_failures.to_string().as_str(),
    ));
    e.push_attribute((
        "window",
        settings
            .autoban
            .login_failures_time_window
            .as_secs()
            .to_string()
            .as_str(),
    ));
    e.push_attribute((
        "duration",
        settings.autoban.ban_duration.as_secs().to_string().as_str(),
    ));
    w.write_event(Event::Empty(e)).map_err(xml_err)?;

    write_filter(&mut w, &settings.filter)?;

    let mut e = BytesStart::new("admin");
    e.push_attribute(("address", admin.address.to_string().as_str()));
    e.push_attribute(("port", admin.port.to_string().as_str()));
    if let Some(password) = &admin.password {
        e.push_attribute(("password", password.encode().as_str()));
    }
    w.write_event(Event::Empty(e)).map_err(xml_err)?;

    end_doc(w)
}

/// Parse the settings document
pub fn settings_from_xml(
    xml: &str,
) -> Result<(Vec<ListenerConfig>, ServerSettings, AdminSettings)> {
    let mut reader = Reader::from_str(xml);
    let mut buf = Vec::new();

    let mut listeners = Vec::new();
    let mut settings = ServerSettings::default();
    let mut admin = AdminSettings::default();
    let mut in_banner = false;
    let mut filter_list: Option<&str> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                let own = e;
                match own.name().as_ref() {
                    b"ftpd" => check_root(&own),
                    b"listener" => {
                        let require = parse_attr(&own, "require-tls").unwrap_or(false);
                        let tls = match attr(&own, "tls").as_deref() {
                            Some("plain") => TlsMode::Plain,
                            Some("implicit") => TlsMode::Implicit,
                            _ => TlsMode::Explicit {
                                require_tls: require,
                            },
                        };
                        listeners.push(ListenerConfig {
                            address: parse_attr(&own, "address").ok_or_else(|| {
                                FtpdError::Config("listener without address".to_owned())
                            })?,
                            port: parse_attr(&own, "port").ok_or_else(|| {
                                FtpdError::Config("listener without port".to_owned())
                            })?,
                            tls,
                        });
                    }
                    b"banner" => {
                        in_banner = true;
                        settings.banner.clear();
                    }
                    b"server" => {
                        settings.pasv_port_range =
                            match (parse_attr(&own, "pasv-min"), parse_attr(&own, "pasv-max")) {
                                (Some(lo), Some(hi)) => Some((lo, hi)),
                                _ => None,
                            };
                        settings.host_override = attr(&own, "host-override");
                        if let Some(v) = parse_attr(&own, "no-override-when-local") {
                            settings.do_not_override_host_if_peer_is_local = v;
                        }
                        if let Some(v) = parse_attr(&own, "login-timeout") {
                            settings.login_timeout = Duration::from_secs(v);
                        }
                        if let Some(v) = parse_attr(&own, "activity-timeout") {
                            settings.activity_timeout = Duration::from_secs(v);
                        }
                        if let Some(v) = parse_attr(&own, "max-sessions") {
                            settings.max_sessions = v;
                        }
                    }
                    b"autoban" => {
                        let mut autoban = AutobanConfig::default();
                        if let Some(v) = parse_attr(&own, "max-failures") {
                            autoban.max_login_failures = v;
                        }
                        if let Some(v) = parse_attr(&own, "window") {
                            autoban.login_failures_time_window = Duration::from_secs(v);
                        }
                        if let Some(v) = parse_attr(&own, "duration") {
                            autoban.ban_duration = Duration::from_secs(v);
                        }
                        settings.autoban = autoban;
                    }
                    b"allow" => filter_list = Some("allow"),
                    b"deny" => filter_list = Some("deny"),
                    b"admin" => {
                        if let Some(v) = parse_attr(&own, "address") {
                            admin.address = v;
                        }
                        if let Some(v) = parse_attr(&own, "port") {
                            admin.port = v;
                        }
                        admin.password = attr(&own, "password")
                            .as_deref()
                            .and_then(PasswordHash::decode);
                    }
                    _ => {}
                }
            }
            Ok(Event::Text(t)) => {
                let text = t.unescape().map_err(xml_err)?.into_owned();
                if in_banner {
                    // Entities may split one logical text into several
                    // events; accumulate.
                    settings.banner.push_str(&text);
                } else if let Some(which) = filter_list {
                    if let Some(net) = parse_net(text.trim()) {
                        match which {
                            "allow" => settings.filter.allowed.push(net),
                            _ => settings.filter.disallowed.push(net),
                        }
                    }
                }
            }
            Ok(Event::End(e)) => match e.name().as_ref() {
                b"banner" => in_banner = false,
                b"allow" | b"deny" => filter_list = None,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(xml_err(e)),
            _ => {}
        }
        buf.clear();
    }

    Ok((listeners, settings, admin))
}

// ------------------------------------------------------------------- users

/// Serialize the users document
pub fn users_to_xml(users: &[User]) -> Result<String> {
    let mut w = new_writer();
    begin_doc(&mut w)?;

    for user in users {
        let mut e = BytesStart::new("user");
        e.push_attribute(("name", user.name.as_str()));
        e.push_attribute(("enabled", bool_str(user.enabled)));
        w.write_event(Event::Start(e)).map_err(xml_err)?;

        if let Some(password) = &user.password {
            text_element(&mut w, "password", &password.encode())?;
        }
        for method in &user.methods {
            text_element(&mut w, "method", method.token())?;
        }
        for group in &user.groups {
            text_element(&mut w, "member-of", group)?;
        }
        write_mounts(&mut w, &user.mount_table)?;
        write_limits(
            &mut w,
            user.rate_limits,
            user.session_inbound_limit,
            user.session_outbound_limit,
        )?;
        write_filter(&mut w, &user.filter)?;
        if let Some(creds) = &user.impersonation {
            let mut e = BytesStart::new("impersonation");
            match creds {
                ImpersonationCredentials::Windows { username, password } => {
                    e.push_attribute(("kind", "windows"));
                    e.push_attribute(("user", username.as_str()));
                    e.push_attribute(("password", password.as_str()));
                }
                ImpersonationCredentials::Posix { user, group } => {
                    e.push_attribute(("kind", "posix"));
                    e.push_attribute(("user", user.as_str()));
                    if let Some(group) = group {
                        e.push_attribute(("group", group.as_str()));
                    }
                }
            }
            w.write_event(Event::Empty(e)).map_err(xml_err)?;
        }

        w.write_event(Event::End(BytesEnd::new("user")))
            .map_err(xml_err)?;
    }

    end_doc(w)
}

/// Parse the users document
pub fn users_from_xml(xml: &str) -> Result<Vec<User>> {
    let mut reader = Reader::from_str(xml);
    let mut buf = Vec::new();

    let mut users = Vec::new();
    let mut current: Option<UserBuilder> = None;
    let mut text_target: Option<TextTarget> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                let own = e;
                match own.name().as_ref() {
                    b"ftpd" => check_root(&own),
                    b"user" => {
                        current = Some(UserBuilder::new(
                            attr(&own, "name").unwrap_or_default(),
                            parse_attr(&own, "enabled").unwrap_or(true),
                        ));
                    }
                    b"password" => text_target = Some(TextTarget::Password),
                    b"method" => text_target = Some(TextTarget::Method),
                    b"member-of" => text_target = Some(TextTarget::Group),
                    b"mount" => {
                        if let Some(user) = &mut current {
                            user.mounts.push(mount_from_attrs(&own)?);
                        }
                    }
                    b"limits" => {
                        if let Some(user) = &mut current {
                            user.rate_limits = RateLimits {
                                inbound: parse_attr(&own, "inbound"),
                                outbound: parse_attr(&own, "outbound"),
                            };
                            user.session_inbound = parse_attr(&own, "session-inbound");
                            user.session_outbound = parse_attr(&own, "session-outbound");
                        }
                    }
                    b"allow" => text_target = Some(TextTarget::Allow),
                    b"deny" => text_target = Some(TextTarget::Deny),
                    b"impersonation" => {
                        if let Some(user) = &mut current {
                            user.impersonation = match attr(&own, "kind").as_deref() {
                                Some("windows") => Some(ImpersonationCredentials::Windows {
                                    username: attr(&own, "user").unwrap_or_default(),
                                    password: attr(&own, "password").unwrap_or_default(),
                                }),
                                Some("posix") => Some(ImpersonationCredentials::Posix {
                                    user: attr(&own, "user").unwrap_or_default(),
                                    group: attr(&own, "group"),
                                }),
                                _ => None,
                            };
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Text(t)) => {
                let text = t.unescape().map_err(xml_err)?.into_owned();
                if let (Some(user), Some(target)) = (&mut current, text_target) {
                    user.take_text(target, text);
                }
            }
            Ok(Event::End(e)) => match e.name().as_ref() {
                b"user" => {
                    if let Some(builder) = current.take() {
                        users.push(builder.build()?);
                    }
                }
                b"password" | b"method" | b"member-of" | b"allow" | b"deny" => {
                    text_target = None;
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(xml_err(e)),
            _ => {}
        }
        buf.clear();
    }

    Ok(users)
}

// ------------------------------------------------------------------ groups

/// Serialize the groups document
pub fn groups_to_xml(groups: &[Group]) -> Result<String> {
    let mut w = new_writer();
    begin_doc(&mut w)?;

    for group in groups {
        let mut e = BytesStart::new("group");
        e.push_attribute(("name", group.name.as_str()));
        e.push_attribute(("description", group.description.as_str()));
        w.write_event(Event::Start(e)).map_err(xml_err)?;

        write_mounts(&mut w, &group.mount_table)?;
        write_limits(&mut w, group.rate_limits, None, None)?;
        write_filter(&mut w, &group.filter)?;

        w.write_event(Event::End(BytesEnd::new("group")))
            .map_err(xml_err)?;
    }

    end_doc(w)
}

/// Parse the groups document
pub fn groups_from_xml(xml: &str) -> Result<Vec<Group>> {
    let mut reader = Reader::from_str(xml);
    let mut buf = Vec::new();

    let mut groups: Vec<Group> = Vec::new();
    let mut mounts: Vec<MountPoint> = Vec::new();
    let mut text_target: Option<TextTarget> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                let own = e;
                match own.name().as_ref() {
                    b"ftpd" => check_root(&own),
                    b"group" => {
                        let mut group = Group::new(attr(&own, "name").unwrap_or_default());
                        group.description = attr(&own, "description").unwrap_or_default();
                        groups.push(group);
                        mounts.clear();
                    }
                    b"mount" => mounts.push(mount_from_attrs(&own)?),
                    b"limits" => {
                        if let Some(group) = groups.last_mut() {
                            group.rate_limits = RateLimits {
                                inbound: parse_attr(&own, "inbound"),
                                outbound: parse_attr(&own, "outbound"),
                            };
                        }
                    }
                    b"allow" => text_target = Some(TextTarget::Allow),
                    b"deny" => text_target = Some(TextTarget::Deny),
                    _ => {}
                }
            }
            Ok(Event::Text(t)) => {
                let text = t.unescape().map_err(xml_err)?.into_owned();
                if let (Some(group), Some(target)) = (groups.last_mut(), text_target) {
                    if let Some(net) = parse_net(text.trim()) {
                        match target {
                            TextTarget::Allow => group.filter.allowed.push(net),
                            TextTarget::Deny => group.filter.disallowed.push(net),
                            _ => {}
                        }
                    }
                }
            }
            Ok(Event::End(e)) => match e.name().as_ref() {
                b"group" => {
                    if let Some(group) = groups.last_mut() {
                        group.mount_table = MountTable::new(std::mem::take(&mut mounts))?;
                    }
                }
                b"allow" | b"deny" => text_target = None,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(xml_err(e)),
            _ => {}
        }
        buf.clear();
    }

    Ok(groups)
}

// ----------------------------------------------------------------- helpers

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TextTarget {
    Password,
    Method,
    Group,
    Allow,
    Deny,
}

struct UserBuilder {
    name: String,
    enabled: bool,
    password: Option<PasswordHash>,
    methods: Vec<AuthMethod>,
    groups: Vec<String>,
    mounts: Vec<MountPoint>,
    rate_limits: RateLimits,
    session_inbound: Option<u64>,
    session_outbound: Option<u64>,
    filter: AddressFilter,
    impersonation: Option<ImpersonationCredentials>,
}

impl UserBuilder {
    fn new(name: String, enabled: bool) -> Self {
        Self {
            name,
            enabled,
            password: None,
            methods: Vec::new(),
            groups: Vec::new(),
            mounts: Vec::new(),
            rate_limits: RateLimits::default(),
            session_inbound: None,
            session_outbound: None,
            filter: AddressFilter::allow_all(),
            impersonation: None,
        }
    }

    fn take_text(&mut self, target: TextTarget, text: String) {
        match target {
            TextTarget::Password => self.password = PasswordHash::decode(&text),
            TextTarget::Method => match text.as_str() {
                "none" => self.methods.push(AuthMethod::None),
                "password" => self.methods.push(AuthMethod::Password),
                other => warn!(method = other, "unknown authentication method, skipping"),
            },
            TextTarget::Group => self.groups.push(text),
            TextTarget::Allow => {
                if let Some(net) = parse_net(text.trim()) {
                    self.filter.allowed.push(net);
                }
            }
            TextTarget::Deny => {
                if let Some(net) = parse_net(text.trim()) {
                    self.filter.disallowed.push(net);
                }
            }
        }
    }

    fn build(self) -> Result<User> {
        let mut user = User::new(self.name);
        user.enabled = self.enabled;
        user.password = self.password;
        if !self.methods.is_empty() {
            user.methods = self.methods;
        }
        user.groups = self.groups;
        user.mount_table = MountTable::new(self.mounts)?;
        user.rate_limits = self.rate_limits;
        user.session_inbound_limit = self.session_inbound;
        user.session_outbound_limit = self.session_outbound;
        user.filter = self.filter;
        user.impersonation = self.impersonation;
        Ok(user)
    }
}

fn bool_str(v: bool) -> &'static str {
    if v {
        "true"
    } else {
        "false"
    }
}

fn write_mounts(w: &mut XmlWriter, table: &MountTable) -> Result<()> {
    for mount in table.mounts() {
        let mut e = BytesStart::new("mount");
        e.push_attribute(("virtual", mount.virtual_path.as_str()));
        e.push_attribute(("native", mount.native_path.as_str()));
        e.push_attribute((
            "access",
            match mount.access {
                MountAccess::Disabled => "disabled",
                MountAccess::ReadOnly => "read-only",
                MountAccess::ReadWrite => "read-write",
            },
        ));
        e.push_attribute((
            "recursion",
            match mount.recursion {
                Recursion::None => "none",
                Recursion::ApplyPermissions => "apply",
                Recursion::ApplyPermissionsAndAllowStructureModification => "apply-structure",
            },
        ));
        e.push_attribute(("autocreate", bool_str(mount.autocreate)));
        w.write_event(Event::Empty(e)).map_err(xml_err)?;
    }
    Ok(())
}

fn mount_from_attrs(e: &BytesStart<'_>) -> Result<MountPoint> {
    Ok(MountPoint {
        virtual_path: attr(e, "virtual")
            .ok_or_else(|| FtpdError::Config("mount without virtual path".to_owned()))?,
        native_path: attr(e, "native").unwrap_or_default(),
        access: match attr(e, "access").as_deref() {
            Some("read-only") => MountAccess::ReadOnly,
            Some("read-write") => MountAccess::ReadWrite,
            _ => MountAccess::Disabled,
        },
        recursion: match attr(e, "recursion").as_deref() {
            Some("apply") => Recursion::ApplyPermissions,
            Some("apply-structure") => Recursion::ApplyPermissionsAndAllowStructureModification,
            _ => Recursion::None,
        },
        autocreate: parse_attr(e, "autocreate").unwrap_or(false),
    })
}

fn write_limits(
    w: &mut XmlWriter,
    limits: RateLimits,
    session_inbound: Option<u64>,
    session_outbound: Option<u64>,
) -> Result<()> {
    if limits == RateLimits::default() && session_inbound.is_none() && session_outbound.is_none() {
        return Ok(());
    }
    let mut e = BytesStart::new("limits");
    if let Some(v) = limits.inbound {
        e.push_attribute(("inbound", v.to_string().as_str()));
    }
    if let Some(v) = limits.outbound {
        e.push_attribute(("outbound", v.to_string().as_str()));
    }
    if let Some(v) = session_inbound {
        e.push_attribute(("session-inbound", v.to_string().as_str()));
    }
    if let Some(v) = session_outbound {
        e.push_attribute(("session-outbound", v.to_string().as_str()));
    }
    w.write_event(Event::Empty(e)).map_err(xml_err)?;
    Ok(())
}

fn write_filter(w: &mut XmlWriter, filter: &AddressFilter) -> Result<()> {
    for net in &filter.allowed {
        text_element(w, "allow", &net.to_string())?;
    }
    for net in &filter.disallowed {
        text_element(w, "deny", &net.to_string())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tvfs::PathFormat;
    use std::net::IpAddr;

    fn sample_users() -> Vec<User> {
        let mut alice = User::new("alice");
        alice.password = Some(PasswordHash::create("pw"));
        alice.groups = vec!["staff".to_owned()];
        alice.mount_table = MountTable::with_format(
            vec![MountPoint {
                virtual_path: "/".to_owned(),
                native_path: "/srv/ftp/:u".to_owned(),
                access: MountAccess::ReadWrite,
                recursion: Recursion::ApplyPermissionsAndAllowStructureModification,
                autocreate: true,
            }],
            PathFormat::Unix,
        )
        .expect("table");
        alice.rate_limits = RateLimits {
            inbound: Some(1_000_000),
            outbound: None,
        };
        alice.session_outbound_limit = Some(250_000);
        alice.filter.disallowed.push("198.51.100.0/24".parse().expect("net"));
        alice.impersonation = Some(ImpersonationCredentials::Posix {
            user: "alice".to_owned(),
            group: Some("ftp".to_owned()),
        });

        let mut anon = User::new("anon");
        anon.methods = vec![AuthMethod::None];
        vec![alice, anon]
    }

    #[test]
    fn test_users_round_trip() {
        let users = sample_users();
        let xml = users_to_xml(&users).expect("serialize");
        let loaded = users_from_xml(&xml).expect("parse");
        assert_eq!(loaded, users);
    }

    #[test]
    fn test_groups_round_trip() {
        let mut staff = Group::new("staff");
        staff.description = "people with shells".to_owned();
        staff.mount_table = MountTable::with_format(
            vec![MountPoint {
                virtual_path: "/shared".to_owned(),
                native_path: "/srv/shared".to_owned(),
                access: MountAccess::ReadOnly,
                recursion: Recursion::ApplyPermissions,
                autocreate: false,
            }],
            PathFormat::Unix,
        )
        .expect("table");
        staff.rate_limits = RateLimits {
            inbound: None,
            outbound: Some(2_000_000),
        };
        staff.filter.allowed.push("10.0.0.0/8".parse().expect("net"));

        let groups = vec![staff, Group::new("empty")];
        let xml = groups_to_xml(&groups).expect("serialize");
        let loaded = groups_from_xml(&xml).expect("parse");
        assert_eq!(loaded, groups);
    }

    #[test]
    fn test_settings_round_trip() {
        let listeners = vec![
            ListenerConfig {
                address: "0.0.0.0".parse::<IpAddr>().expect("addr"),
                port: 21,
                tls: TlsMode::Explicit { require_tls: true },
            },
            ListenerConfig {
                address: "::".parse::<IpAddr>().expect("addr"),
                port: 990,
                tls: TlsMode::Implicit,
            },
        ];
        let mut settings = ServerSettings::default();
        settings.banner = "Welcome to %v\nSecond line".to_owned();
        settings.host_override = Some("ftp.example.com".to_owned());
        settings
            .filter
            .disallowed
            .push("192.0.2.0/24".parse().expect("net"));
        let mut admin = AdminSettings::default();
        admin.password = Some(PasswordHash::create("admin-pw"));

        let xml = settings_to_xml(&listeners, &settings, &admin).expect("serialize");
        let (l2, s2, a2) = settings_from_xml(&xml).expect("parse");
        assert_eq!(l2, listeners);
        assert_eq!(s2, settings);
        assert_eq!(a2, admin);
    }

    #[test]
    fn test_version_mismatch_still_loads() {
        let xml = r#"<?xml version="1.0"?>
<ftpd flavor="somebody-else" version="99">
  <listener address="127.0.0.1" port="2121" tls="plain" require-tls="false"/>
</ftpd>"#;
        let (listeners, _, _) = settings_from_xml(xml).expect("best-effort parse");
        assert_eq!(listeners.len(), 1);
        assert_eq!(listeners[0].port, 2121);
    }

    #[test]
    fn test_invalid_mount_rejected() {
        let xml = r#"<?xml version="1.0"?>
<ftpd flavor="ftpd-rs" version="2">
  <user name="broken" enabled="true">
    <mount virtual="/a" native="relative/path" access="read-write" recursion="apply" autocreate="false"/>
  </user>
</ftpd>"#;
        // Native path validity is host-format dependent; on Unix hosts the
        // relative path must be rejected.
        if cfg!(unix) {
            assert!(users_from_xml(xml).is_err());
        }
    }
}
