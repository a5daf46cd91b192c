//! Typed entity keys.
//!
//! Every long-lived entity is addressed by a key with the textual form
//! `<kind>-<payload>-<suffix>`, where the suffix is a fixed number of random
//! bytes rendered in base36. The kind is carried in the type, so a
//! `DeploymentKey` can never be confused with a `RunnerKey` at compile time:
//!
//! ```text
//! dpl-echo-2jk4p0aqm8d1xyz0
//! rnr-worker-1.local-8893-1bq5z0c8k3w
//! req-ingress-POST_todo_create-3f9d8k2m1p0q7r5s
//! ```

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::str::FromStr;

use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Errors produced while parsing a textual key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("bad prefix {found:?}, expected {expected:?}")]
    BadPrefix { expected: &'static str, found: String },

    #[error("bad payload {payload:?} for {kind} key")]
    BadPayload { kind: &'static str, payload: String },

    #[error("bad suffix {suffix:?}: {reason}")]
    BadSuffix { suffix: String, reason: &'static str },
}

/// The structured middle part of a key.
pub trait KeyPayload: Clone + Eq + Ord + Hash + fmt::Debug + Send + Sync + 'static {
    /// Parse the payload text. Returns `None` when the component count or
    /// shape is wrong.
    fn parse(text: &str) -> Option<Self>;

    /// Render the payload text. Must round-trip through [`KeyPayload::parse`].
    fn render(&self) -> String;
}

/// Marker describing one kind of key.
pub trait KeyKind: Send + Sync + 'static {
    const PREFIX: &'static str;
    const SUFFIX_LEN: usize = 10;
    type Payload: KeyPayload;
}

/// A typed key. Immutable after construction.
pub struct Key<K: KeyKind> {
    payload: K::Payload,
    suffix: Vec<u8>,
    _kind: PhantomData<K>,
}

impl<K: KeyKind> Key<K> {
    /// Create a key with a suffix drawn from the thread-local RNG.
    pub fn from_payload(payload: K::Payload) -> Self {
        Self::from_payload_with_rng(payload, &mut rand::thread_rng())
    }

    /// Create a key with a suffix drawn from the given source of randomness.
    pub fn from_payload_with_rng(payload: K::Payload, rng: &mut impl RngCore) -> Self {
        let mut suffix = vec![0u8; K::SUFFIX_LEN];
        rng.fill_bytes(&mut suffix);
        Self {
            payload,
            suffix,
            _kind: PhantomData,
        }
    }

    /// Parse a key of this kind from its textual form.
    pub fn parse(text: &str) -> Result<Self, KeyError> {
        let rest = text
            .strip_prefix(K::PREFIX)
            .and_then(|rest| rest.strip_prefix('-'))
            .ok_or_else(|| KeyError::BadPrefix {
                expected: K::PREFIX,
                found: text.split('-').next().unwrap_or_default().to_string(),
            })?;
        let (payload_text, suffix_text) =
            rest.rsplit_once('-').ok_or_else(|| KeyError::BadPayload {
                kind: K::PREFIX,
                payload: rest.to_string(),
            })?;
        let payload = K::Payload::parse(payload_text).ok_or_else(|| KeyError::BadPayload {
            kind: K::PREFIX,
            payload: payload_text.to_string(),
        })?;
        let suffix = decode_base36(suffix_text, K::SUFFIX_LEN)?;
        Ok(Self {
            payload,
            suffix,
            _kind: PhantomData,
        })
    }

    pub fn payload(&self) -> &K::Payload {
        &self.payload
    }

    pub fn suffix(&self) -> &[u8] {
        &self.suffix
    }
}

impl<K: KeyKind> Clone for Key<K> {
    fn clone(&self) -> Self {
        Self {
            payload: self.payload.clone(),
            suffix: self.suffix.clone(),
            _kind: PhantomData,
        }
    }
}

impl<K: KeyKind> PartialEq for Key<K> {
    fn eq(&self, other: &Self) -> bool {
        self.payload == other.payload && self.suffix == other.suffix
    }
}

impl<K: KeyKind> Eq for Key<K> {}

impl<K: KeyKind> Hash for Key<K> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.payload.hash(state);
        self.suffix.hash(state);
    }
}

impl<K: KeyKind> PartialOrd for Key<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K: KeyKind> Ord for Key<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.payload
            .cmp(&other.payload)
            .then_with(|| self.suffix.cmp(&other.suffix))
    }
}

impl<K: KeyKind> fmt::Display for Key<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}",
            K::PREFIX,
            self.payload.render(),
            encode_base36(&self.suffix)
        )
    }
}

impl<K: KeyKind> fmt::Debug for Key<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl<K: KeyKind> FromStr for Key<K> {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl<K: KeyKind> Serialize for Key<K> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de, K: KeyKind> Deserialize<'de> for Key<K> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::parse(&text).map_err(serde::de::Error::custom)
    }
}

// ── Base36 suffix codec ────────────────────────────────────────────

/// Encode big-endian bytes as a base36 number.
fn encode_base36(bytes: &[u8]) -> String {
    let mut number = bytes.to_vec();
    let mut digits = Vec::new();
    while number.iter().any(|b| *b != 0) {
        let mut remainder = 0u32;
        for byte in number.iter_mut() {
            let acc = (remainder << 8) | u32::from(*byte);
            *byte = (acc / 36) as u8;
            remainder = acc % 36;
        }
        digits.push(BASE36[remainder as usize]);
    }
    if digits.is_empty() {
        digits.push(b'0');
    }
    digits.reverse();
    String::from_utf8(digits).unwrap_or_default()
}

/// Decode a base36 number into exactly `len` big-endian bytes.
fn decode_base36(text: &str, len: usize) -> Result<Vec<u8>, KeyError> {
    let bad = |reason| KeyError::BadSuffix {
        suffix: text.to_string(),
        reason,
    };
    if text.is_empty() {
        return Err(bad("empty"));
    }
    let mut number = vec![0u8; len];
    for ch in text.bytes() {
        let digit = match ch {
            b'0'..=b'9' => ch - b'0',
            b'a'..=b'z' => ch - b'a' + 10,
            _ => return Err(bad("not base36")),
        };
        let mut carry = u32::from(digit);
        for byte in number.iter_mut().rev() {
            let acc = u32::from(*byte) * 36 + carry;
            *byte = (acc & 0xff) as u8;
            carry = acc >> 8;
        }
        if carry != 0 {
            return Err(bad("too long"));
        }
    }
    Ok(number)
}

// ── Payloads ───────────────────────────────────────────────────────

fn is_component(text: &str) -> bool {
    !text.is_empty() && !text.contains('-')
}

/// Single module-name payload.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModulePayload {
    pub module: String,
}

impl KeyPayload for ModulePayload {
    fn parse(text: &str) -> Option<Self> {
        is_component(text).then(|| Self {
            module: text.to_string(),
        })
    }

    fn render(&self) -> String {
        self.module.clone()
    }
}

/// Hostname and port. The hostname may itself contain hyphens.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HostPortPayload {
    pub hostname: String,
    pub port: String,
}

impl KeyPayload for HostPortPayload {
    fn parse(text: &str) -> Option<Self> {
        let (hostname, port) = text.rsplit_once('-')?;
        (!hostname.is_empty() && is_component(port)).then(|| Self {
            hostname: hostname.to_string(),
            port: port.to_string(),
        })
    }

    fn render(&self) -> String {
        format!("{}-{}", self.hostname, self.port)
    }
}

/// Module plus a declaration name (topic, subscription, verb).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModuleNamePayload {
    pub module: String,
    pub name: String,
}

impl KeyPayload for ModuleNamePayload {
    fn parse(text: &str) -> Option<Self> {
        let (module, name) = text.split_once('-')?;
        (is_component(module) && is_component(name)).then(|| Self {
            module: module.to_string(),
            name: name.to_string(),
        })
    }

    fn render(&self) -> String {
        format!("{}-{}", self.module, self.name)
    }
}

/// Where a request entered the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Origin {
    Ingress,
    Cron,
    PubSub,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::Ingress => "ingress",
            Origin::Cron => "cron",
            Origin::PubSub => "pubsub",
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Origin {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ingress" => Ok(Origin::Ingress),
            "cron" => Ok(Origin::Cron),
            "pubsub" => Ok(Origin::PubSub),
            other => Err(KeyError::BadPayload {
                kind: RequestKind::PREFIX,
                payload: other.to_string(),
            }),
        }
    }
}

/// Request origin plus a sanitised slug describing the entry point.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestPayload {
    pub origin: Origin,
    pub key: String,
}

impl KeyPayload for RequestPayload {
    fn parse(text: &str) -> Option<Self> {
        let (origin, key) = text.split_once('-')?;
        let origin = origin.parse().ok()?;
        is_component(key).then(|| Self {
            origin,
            key: key.to_string(),
        })
    }

    fn render(&self) -> String {
        format!("{}-{}", self.origin, self.key)
    }
}

/// Replace everything outside `[A-Za-z0-9_]` with `_`.
fn sanitise_slug(slug: &str) -> String {
    let cleaned: String = slug
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() { "_".to_string() } else { cleaned }
}

// ── Kinds ──────────────────────────────────────────────────────────

macro_rules! key_kind {
    ($(#[$meta:meta])* $kind:ident, $alias:ident, $prefix:literal, $payload:ty, $len:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $kind;

        impl KeyKind for $kind {
            const PREFIX: &'static str = $prefix;
            const SUFFIX_LEN: usize = $len;
            type Payload = $payload;
        }

        pub type $alias = Key<$kind>;
    };
}

key_kind!(
    /// A deployment of a module.
    DeploymentKind, DeploymentKey, "dpl", ModulePayload, 10
);
key_kind!(
    /// A runner process.
    RunnerKind, RunnerKey, "rnr", HostPortPayload, 10
);
key_kind!(
    /// A control plane process.
    ControllerKind, ControllerKey, "ctr", HostPortPayload, 10
);
key_kind!(
    /// A request entering the system.
    RequestKind, RequestKey, "req", RequestPayload, 12
);
key_kind!(TopicKind, TopicKey, "top", ModuleNamePayload, 10);
key_kind!(SubscriptionKind, SubscriptionKey, "sub", ModuleNamePayload, 10);
key_kind!(SubscriberKind, SubscriberKey, "subr", ModuleNamePayload, 10);
key_kind!(TopicEventKind, TopicEventKey, "evt", ModuleNamePayload, 10);
key_kind!(
    /// A cron job bound to a verb.
    CronJobKind, CronJobKey, "crn", ModuleNamePayload, 10
);

impl DeploymentKey {
    pub fn new(module: &str) -> Self {
        Self::from_payload(ModulePayload {
            module: module.to_string(),
        })
    }

    pub fn module(&self) -> &str {
        &self.payload().module
    }
}

fn host_port(hostname: &str, port: impl fmt::Display) -> HostPortPayload {
    HostPortPayload {
        hostname: hostname.to_string(),
        port: port.to_string(),
    }
}

impl RunnerKey {
    pub fn new(hostname: &str, port: impl fmt::Display) -> Self {
        Self::from_payload(host_port(hostname, port))
    }
}

impl ControllerKey {
    pub fn new(hostname: &str, port: impl fmt::Display) -> Self {
        Self::from_payload(host_port(hostname, port))
    }
}

impl RequestKey {
    /// Mint a request key for the given origin. The slug is sanitised.
    pub fn new(origin: Origin, slug: &str) -> Self {
        Self::from_payload(RequestPayload {
            origin,
            key: sanitise_slug(slug),
        })
    }

    pub fn origin(&self) -> Origin {
        self.payload().origin
    }
}

macro_rules! module_name_key {
    ($alias:ident, $name:ident) => {
        impl $alias {
            pub fn new(module: &str, $name: &str) -> Self {
                Self::from_payload(ModuleNamePayload {
                    module: module.to_string(),
                    name: $name.to_string(),
                })
            }

            pub fn module(&self) -> &str {
                &self.payload().module
            }

            pub fn $name(&self) -> &str {
                &self.payload().name
            }
        }
    };
}

module_name_key!(TopicKey, topic);
module_name_key!(SubscriptionKey, subscription);
module_name_key!(SubscriberKey, subscription);
module_name_key!(TopicEventKey, topic);
module_name_key!(CronJobKey, verb);

// ── Declaration references ─────────────────────────────────────────

/// A `module.name` reference to a declaration, used on the wire and as a
/// map key. Type parameters are not part of a `RefKey`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RefKey {
    pub module: String,
    pub name: String,
}

impl RefKey {
    pub fn new(module: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for RefKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.module, self.name)
    }
}

impl FromStr for RefKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((module, name)) if !module.is_empty() && !name.is_empty() => {
                Ok(RefKey::new(module, name))
            }
            _ => Err(format!("invalid reference {s:?}, expected <module>.<name>")),
        }
    }
}

impl Serialize for RefKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct Wire<'a> {
            module: &'a str,
            name: &'a str,
        }
        Wire {
            module: &self.module,
            name: &self.name,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for RefKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Wire {
            module: String,
            name: String,
        }
        let wire = Wire::deserialize(deserializer)?;
        Ok(RefKey::new(wire.module, wire.name))
    }
}
