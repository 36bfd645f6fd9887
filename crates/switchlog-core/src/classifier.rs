//! Domain classification: mapping an event to the tenant it belongs to.
//!
//! Classification is an ordered fallback chain and the first hit wins:
//!
//! 1. well-known attributes, direct domain fields first, then session
//!    variables, then SIP `user@domain` style fields;
//! 2. regular expressions over the rendered log line;
//! 3. the [`PartitionKey::unknown`] sentinel.
//!
//! Nothing here can fail. Absent attributes and malformed values just move
//! the chain along.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::event::AttributeSource;

/// Sentinel key for events whose domain could not be determined.
pub const UNKNOWN_PARTITION: &str = "unknown";

/// Maximum length of a domain candidate (RFC 1035).
const MAX_DOMAIN_LENGTH: usize = 253;

/// Maximum length of a single label.
const MAX_LABEL_LENGTH: usize = 63;

/// Characters that may never appear in a partition key.
const ILLEGAL_PATH_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// How an attribute's value carries the domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldKind {
    /// The value is the domain itself.
    Direct,
    /// The value is a host taken from session variables.
    Session,
    /// The value is an address that must contain `user@domain` or a `sip:` URI.
    SipAddress,
}

/// Attributes probed for a tenant identity, in priority order.
const DOMAIN_ATTRIBUTES: &[(&str, FieldKind)] = &[
    ("variable_domain_name", FieldKind::Direct),
    ("domain_name", FieldKind::Direct),
    ("Domain-Name", FieldKind::Direct),
    ("domain", FieldKind::Direct),
    ("variable_sip_req_host", FieldKind::Session),
    ("variable_sip_to_host", FieldKind::Session),
    ("variable_sip_from_host", FieldKind::Session),
    ("variable_dialed_domain", FieldKind::Session),
    ("variable_presence_id", FieldKind::SipAddress),
    ("Channel-Presence-ID", FieldKind::SipAddress),
    ("variable_sip_req_uri", FieldKind::SipAddress),
    ("variable_sip_to_uri", FieldKind::SipAddress),
    ("variable_sip_from_uri", FieldKind::SipAddress),
    ("Caller-Channel-Name", FieldKind::SipAddress),
    ("Channel-Name", FieldKind::SipAddress),
];

/// Line patterns tried after the attributes; the last capture group is the host.
static LINE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"sofia/[\w-]+/([\w.+-]+@)?([a-zA-Z0-9][-a-zA-Z0-9]*\.[a-zA-Z0-9][-a-zA-Z0-9.]*)",
        r"\[([\w-]+\.[\w.-]+)\]",
        r"domain[=:]\s*([\w-]+\.[\w.-]+)",
        r"@([a-zA-Z0-9][-a-zA-Z0-9]*\.[a-zA-Z0-9][-a-zA-Z0-9.]*)",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap_or_else(|_| unreachable!()))
    .collect()
});

/// Regex for a dot-separated sequence of labels.
static LABELS_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9_-]{1,63}(\.[A-Za-z0-9_-]{1,63})*$").unwrap_or_else(|_| unreachable!())
});

/// Regex for a single bare token.
static TOKEN_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").unwrap_or_else(|_| unreachable!()));

/// A normalized tenant identifier usable as a file name stem.
///
/// Always lower-case, non-empty and free of path separators and other
/// characters that are illegal in a path component.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionKey(String);

impl PartitionKey {
    /// Normalizes an arbitrary string into a key.
    ///
    /// Falls back to [`PartitionKey::unknown`] when nothing usable remains.
    #[must_use]
    pub fn normalize(raw: &str) -> Self {
        let cleaned: String = raw
            .chars()
            .filter(|c| !ILLEGAL_PATH_CHARS.contains(c) && !c.is_whitespace() && !c.is_control())
            .flat_map(char::to_lowercase)
            .collect();

        if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
            Self::unknown()
        } else {
            Self(cleaned)
        }
    }

    /// Returns the sentinel key for unclassifiable events.
    #[must_use]
    pub fn unknown() -> Self {
        Self(UNKNOWN_PARTITION.to_string())
    }

    /// Returns true for the sentinel key.
    #[must_use]
    pub fn is_unknown(&self) -> bool {
        self.0 == UNKNOWN_PARTITION
    }

    /// Returns the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PartitionKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Returns true if `candidate` looks like a domain, hostname or IPv4 address.
///
/// Accepts `localhost`, a single alphanumeric/`-`/`_` token, or a dotted
/// sequence of such labels of at most 63 characters each, up to 253
/// characters overall.
#[must_use]
pub fn is_valid_domain(candidate: &str) -> bool {
    if candidate.is_empty() || candidate.len() > MAX_DOMAIN_LENGTH {
        return false;
    }
    if candidate.eq_ignore_ascii_case("localhost") {
        return true;
    }
    if TOKEN_REGEX.is_match(candidate) {
        return true;
    }
    LABELS_REGEX.is_match(candidate)
        && candidate
            .split('.')
            .all(|label| !label.is_empty() && label.len() <= MAX_LABEL_LENGTH)
}

/// Maps events to partition keys.
///
/// Stateless; one instance can be shared freely.
#[derive(Debug, Clone, Copy, Default)]
pub struct DomainClassifier;

impl DomainClassifier {
    /// Creates a classifier.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Classifies an event, falling back to the rendered line and finally
    /// to [`PartitionKey::unknown`].
    #[must_use]
    pub fn classify<A: AttributeSource + ?Sized>(&self, event: &A, line: &str) -> PartitionKey {
        self.from_attributes(event)
            .or_else(|| self.from_line(line))
            .unwrap_or_else(PartitionKey::unknown)
    }

    /// Tries the well-known attributes in priority order.
    #[must_use]
    pub fn from_attributes<A: AttributeSource + ?Sized>(&self, event: &A) -> Option<PartitionKey> {
        DOMAIN_ATTRIBUTES.iter().find_map(|(name, kind)| {
            let value = event.get(name)?;
            extract_candidate(value, *kind)
        })
    }

    /// Tries the line patterns in order.
    #[must_use]
    pub fn from_line(&self, line: &str) -> Option<PartitionKey> {
        LINE_PATTERNS.iter().find_map(|pattern| {
            let caps = pattern.captures(line)?;
            let host = caps.iter().skip(1).flatten().last()?.as_str();
            accept(host)
        })
    }
}

/// Pulls a host out of one attribute value.
fn extract_candidate(value: &str, kind: FieldKind) -> Option<PartitionKey> {
    let value = value.trim();
    if value.is_empty() || value.eq_ignore_ascii_case("default") {
        return None;
    }

    let host = if let Some((_, after)) = value.rsplit_once('@') {
        after
    } else if let Some(rest) = strip_sip_marker(value) {
        rest
    } else if kind == FieldKind::SipAddress {
        return None;
    } else {
        value
    };

    let host = host
        .split([':', ';', '>', '/', ' ', '\t'])
        .next()
        .unwrap_or_default();

    accept(host)
}

fn strip_sip_marker(value: &str) -> Option<&str> {
    let start = value.find("sip:").or_else(|| value.find("sips:"))?;
    let rest = &value[start..];
    rest.split_once(':').map(|(_, host)| host)
}

fn accept(host: &str) -> Option<PartitionKey> {
    if host.eq_ignore_ascii_case("default") || !is_valid_domain(host) {
        return None;
    }
    let key = PartitionKey::normalize(host);
    (!key.is_unknown()).then_some(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use proptest::prelude::*;
    use test_case::test_case;

    fn classify(event: &Event, line: &str) -> String {
        DomainClassifier::new().classify(event, line).to_string()
    }

    #[test_case("localhost", true ; "localhost")]
    #[test_case("pbx", true ; "bare token")]
    #[test_case("tenant_01-a", true ; "token with separators")]
    #[test_case("shop.example.com", true ; "fqdn")]
    #[test_case("10.0.0.12", true ; "ipv4")]
    #[test_case("", false ; "empty")]
    #[test_case("a..b", false ; "empty label")]
    #[test_case(".example.com", false ; "leading dot")]
    #[test_case("bad host.com", false ; "whitespace")]
    #[test_case("user@host.com", false ; "at sign")]
    #[test_case("host:5060", false ; "port")]
    fn domain_validation(candidate: &str, expected: bool) {
        assert_eq!(is_valid_domain(candidate), expected);
    }

    #[test]
    fn domain_validation_length_limits() {
        let long_label = format!("{}.com", "a".repeat(64));
        assert!(!is_valid_domain(&long_label));

        let max_label = format!("{}.com", "a".repeat(63));
        assert!(is_valid_domain(&max_label));

        let too_long = vec!["abcdefghi"; 26].join(".");
        assert!(too_long.len() > 253);
        assert!(!is_valid_domain(&too_long));
    }

    #[test_case("Example.COM", "example.com" ; "lowercases")]
    #[test_case("a<b>c:d\"e", "abcde" ; "strips illegal chars")]
    #[test_case("a/b\\c|d?e*f", "abcdef" ; "strips separators")]
    #[test_case(" spaced name ", "spacedname" ; "strips whitespace")]
    #[test_case("", "unknown" ; "empty")]
    #[test_case("///", "unknown" ; "only illegal")]
    #[test_case("..", "unknown" ; "parent dir")]
    #[test_case(".", "unknown" ; "current dir")]
    fn normalization(raw: &str, expected: &str) {
        assert_eq!(PartitionKey::normalize(raw).as_str(), expected);
    }

    #[test]
    fn direct_attribute_wins() {
        let event = Event::named("CHANNEL_CREATE")
            .with_header("Channel-Name", "sofia/internal/1000@other.net")
            .with_header("variable_domain_name", "Tenant.Example.com");
        assert_eq!(classify(&event, ""), "tenant.example.com");
    }

    #[test]
    fn default_value_is_skipped() {
        let event = Event::named("CHANNEL_CREATE")
            .with_header("variable_domain_name", "default")
            .with_header("variable_sip_to_host", "b.example.org");
        assert_eq!(classify(&event, ""), "b.example.org");
    }

    #[test]
    fn session_host_strips_port() {
        let event = Event::new().with_header("variable_sip_req_host", "10.1.2.3:5080");
        assert_eq!(classify(&event, ""), "10.1.2.3");
    }

    #[test_case("1000@pbx.example.com", "pbx.example.com" ; "presence id")]
    #[test_case("<sip:1000@pbx.example.com:5060;transport=udp>", "pbx.example.com" ; "sip uri with params")]
    #[test_case("sip:gw.example.net", "gw.example.net" ; "sip uri without user")]
    fn sip_address_extraction(value: &str, expected: &str) {
        let event = Event::new().with_header("variable_sip_from_uri", value);
        assert_eq!(classify(&event, ""), expected);
    }

    #[test]
    fn bare_channel_name_is_not_a_domain() {
        let event = Event::named("CHANNEL_CREATE").with_header("Channel-Name", "sofia/internal/1000");
        assert_eq!(classify(&event, "no domain here"), UNKNOWN_PARTITION);
    }

    #[test]
    fn channel_name_with_domain() {
        let event = Event::named("CHANNEL_CREATE")
            .with_header("Channel-Name", "sofia/external/+15551234@Carrier.Example.com");
        assert_eq!(classify(&event, ""), "carrier.example.com");
    }

    #[test]
    fn line_fallback_user_at_domain() {
        let event = Event::named("LOG");
        assert_eq!(
            classify(&event, "Registered user@shop.example.com from 10.0.0.1"),
            "shop.example.com"
        );
    }

    #[test_case("New Channel sofia/internal/1000@voip.example.com [abc]", "voip.example.com" ; "sofia channel")]
    #[test_case("sofia/internal/sip.example.org answering", "sip.example.org" ; "sofia without user")]
    #[test_case("Processing [branch.example.io] request", "branch.example.io" ; "bracketed host")]
    #[test_case("auth ok domain=corp.example.com user=1001", "corp.example.com" ; "domain tag")]
    #[test_case("expire domain: sub.example.com", "sub.example.com" ; "domain colon tag")]
    fn line_patterns(line: &str, expected: &str) {
        assert_eq!(classify(&Event::new(), line), expected);
    }

    #[test]
    fn nothing_matches_yields_unknown() {
        let event = Event::named("CUSTOM").with_header("Foo", "bar");
        assert_eq!(classify(&event, "[CUSTOM] Foo=bar"), UNKNOWN_PARTITION);
        assert!(DomainClassifier::new().classify(&event, "").is_unknown());
    }

    #[test]
    fn attributes_beat_line() {
        let event = Event::new().with_header("domain", "first.example.com");
        assert_eq!(
            classify(&event, "call from x@second.example.com"),
            "first.example.com"
        );
    }

    proptest! {
        #[test]
        fn valid_primary_domain_round_trips(
            labels in prop::collection::vec("[A-Za-z0-9][A-Za-z0-9_-]{0,20}", 1..5)
        ) {
            let domain = labels.join(".");
            prop_assume!(!domain.eq_ignore_ascii_case("default"));
            let event = Event::new().with_header("variable_domain_name", domain.clone());
            let key = DomainClassifier::new().classify(&event, "");
            prop_assert_eq!(key.as_str(), domain.to_lowercase());
        }

        #[test]
        fn classify_is_total(line in ".{0,200}", value in ".{0,80}") {
            let event = Event::new().with_header("Channel-Name", value);
            let key = DomainClassifier::new().classify(&event, &line);
            prop_assert!(!key.as_str().is_empty());
            prop_assert!(!key.as_str().contains(ILLEGAL_PATH_CHARS));
            prop_assert!(!key.as_str().chars().any(char::is_whitespace));
        }

        #[test]
        fn normalize_never_yields_illegal_chars(raw in ".{0,64}") {
            let key = PartitionKey::normalize(&raw);
            prop_assert!(!key.as_str().is_empty());
            prop_assert!(!key.as_str().contains(ILLEGAL_PATH_CHARS));
            prop_assert!(key.as_str() != "." && key.as_str() != "..");
        }
    }
}
