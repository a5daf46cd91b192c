//! The schema model: modules, declarations, types and metadata.
//!
//! Every sum in the model is a closed Rust enum, so adding a variant is a
//! compile error at every `match` that consumes it.

use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use ftl_core::RefKey;
use serde::{Deserialize, Serialize};

// ── Positions ──────────────────────────────────────────────────────

/// Source position of a schema element.
///
/// Positions never participate in equality or hashing: two schemas that
/// differ only in where things were written compare equal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Position {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub filename: String,
    #[serde(default)]
    pub line: usize,
    #[serde(default)]
    pub column: usize,
}

impl Position {
    pub fn new(line: usize, column: usize) -> Self {
        Self {
            filename: String::new(),
            line,
            column,
        }
    }

    pub fn is_set(&self) -> bool {
        self.line > 0
    }
}

impl PartialEq for Position {
    fn eq(&self, _: &Self) -> bool {
        true
    }
}

impl Eq for Position {}

impl Hash for Position {
    fn hash<H: Hasher>(&self, _: &mut H) {}
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.filename.is_empty() {
            write!(f, "{}:{}", self.line, self.column)
        } else {
            write!(f, "{}:{}:{}", self.filename, self.line, self.column)
        }
    }
}

// ── Types ──────────────────────────────────────────────────────────

/// Names reserved for primitive types.
pub const PRIMITIVES: &[&str] = &[
    "Int", "Float", "String", "Bytes", "Bool", "Time", "Unit", "Any",
];

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Type {
    Int,
    Float,
    String,
    Bytes,
    Bool,
    Time,
    Unit,
    Any,
    Array { element: Box<Type> },
    Map { key: Box<Type>, value: Box<Type> },
    Optional { inner: Box<Type> },
    Ref(Ref),
}

impl Type {
    pub fn array(element: Type) -> Self {
        Type::Array {
            element: Box::new(element),
        }
    }

    pub fn map(key: Type, value: Type) -> Self {
        Type::Map {
            key: Box::new(key),
            value: Box::new(value),
        }
    }

    pub fn optional(inner: Type) -> Self {
        Type::Optional {
            inner: Box::new(inner),
        }
    }

    pub fn primitive(name: &str) -> Option<Self> {
        Some(match name {
            "Int" => Type::Int,
            "Float" => Type::Float,
            "String" => Type::String,
            "Bytes" => Type::Bytes,
            "Bool" => Type::Bool,
            "Time" => Type::Time,
            "Unit" => Type::Unit,
            "Any" => Type::Any,
            _ => return None,
        })
    }

    pub fn is_unit(&self) -> bool {
        matches!(self, Type::Unit)
    }

    pub fn as_ref(&self) -> Option<&Ref> {
        match self {
            Type::Ref(r) => Some(r),
            _ => None,
        }
    }

    /// Visit every reference in this type, including nested type arguments.
    pub fn for_each_ref<'a>(&'a self, f: &mut dyn FnMut(&'a Ref)) {
        match self {
            Type::Array { element } => element.for_each_ref(f),
            Type::Map { key, value } => {
                key.for_each_ref(f);
                value.for_each_ref(f);
            }
            Type::Optional { inner } => inner.for_each_ref(f),
            Type::Ref(r) => {
                f(r);
                for arg in &r.type_parameters {
                    arg.for_each_ref(f);
                }
            }
            _ => {}
        }
    }

    pub fn for_each_ref_mut(&mut self, f: &mut dyn FnMut(&mut Ref)) {
        match self {
            Type::Array { element } => element.for_each_ref_mut(f),
            Type::Map { key, value } => {
                key.for_each_ref_mut(f);
                value.for_each_ref_mut(f);
            }
            Type::Optional { inner } => inner.for_each_ref_mut(f),
            Type::Ref(r) => {
                for arg in &mut r.type_parameters {
                    arg.for_each_ref_mut(f);
                }
                f(r);
            }
            _ => {}
        }
    }
}

/// A reference to a declaration, optionally with type arguments.
/// An empty `module` means the reference is unqualified.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ref {
    #[serde(default)]
    pub pos: Position,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub module: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub type_parameters: Vec<Type>,
}

impl Ref {
    pub fn new(module: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            pos: Position::default(),
            module: module.into(),
            name: name.into(),
            type_parameters: Vec::new(),
        }
    }

    pub fn key(&self) -> RefKey {
        RefKey::new(self.module.clone(), self.name.clone())
    }

    /// Same module and name, ignoring type arguments.
    pub fn same_decl(&self, other: &Ref) -> bool {
        self.module == other.module && self.name == other.name
    }
}

impl From<&RefKey> for Ref {
    fn from(key: &RefKey) -> Self {
        Ref::new(key.module.clone(), key.name.clone())
    }
}

// ── Values ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Value {
    String(String),
    Int(i64),
    Type(Type),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::String(_) => "String",
            Value::Int(_) => "Int",
            Value::Type(_) => "Type",
        }
    }
}

// ── Metadata ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum IngressPathComponent {
    Literal(String),
    Parameter(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FromOffset {
    #[default]
    Beginning,
    Latest,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetadataIngress {
    #[serde(default)]
    pub pos: Position,
    pub typ: String,
    pub method: String,
    pub path: Vec<IngressPathComponent>,
}

impl MetadataIngress {
    pub fn path_parameters(&self) -> impl Iterator<Item = &str> {
        self.path.iter().filter_map(|c| match c {
            IngressPathComponent::Parameter(name) => Some(name.as_str()),
            IngressPathComponent::Literal(_) => None,
        })
    }

    /// `METHOD /a/{}` with parameters blanked, used to detect clashes.
    pub fn route_key(&self) -> String {
        let mut key = self.method.clone();
        key.push(' ');
        if self.path.is_empty() {
            key.push('/');
        }
        for component in &self.path {
            match component {
                IngressPathComponent::Literal(lit) => {
                    key.push('/');
                    key.push_str(lit);
                }
                IngressPathComponent::Parameter(_) => key.push_str("/{}"),
            }
        }
        key
    }

    pub fn path_string(&self) -> String {
        if self.path.is_empty() {
            return "/".to_string();
        }
        self.path
            .iter()
            .map(|c| match c {
                IngressPathComponent::Literal(lit) => format!("/{lit}"),
                IngressPathComponent::Parameter(p) => format!("/{{{p}}}"),
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetadataAlias {
    #[serde(default)]
    pub pos: Position,
    pub kind: String,
    pub alias: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetadataEncoding {
    #[serde(default)]
    pub pos: Position,
    pub typ: String,
    pub lenient: bool,
}

/// A list of references: `+calls`, `+database calls`, `+secrets`,
/// `+config` and `+publish`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetadataRefs {
    #[serde(default)]
    pub pos: Position,
    pub refs: Vec<Ref>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetadataCronJob {
    #[serde(default)]
    pub pos: Position,
    pub cron: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetadataSubscriber {
    #[serde(default)]
    pub pos: Position,
    pub name: String,
    #[serde(default)]
    pub from: FromOffset,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetadataRetry {
    #[serde(default)]
    pub pos: Position,
    pub count: Option<i64>,
    #[serde(default)]
    pub min_backoff: String,
    #[serde(default)]
    pub max_backoff: String,
    pub catch: Option<Ref>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetadataTypeMap {
    #[serde(default)]
    pub pos: Position,
    pub runtime: String,
    pub native_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetadataSqlMigration {
    #[serde(default)]
    pub pos: Position,
    pub digest: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Metadata {
    Ingress(MetadataIngress),
    Alias(MetadataAlias),
    Encoding(MetadataEncoding),
    Calls(MetadataRefs),
    Databases(MetadataRefs),
    Secrets(MetadataRefs),
    Config(MetadataRefs),
    CronJob(MetadataCronJob),
    Publisher(MetadataRefs),
    Subscriber(MetadataSubscriber),
    Retry(MetadataRetry),
    TypeMap(MetadataTypeMap),
    SqlMigration(MetadataSqlMigration),
}

impl Metadata {
    pub fn pos(&self) -> &Position {
        match self {
            Metadata::Ingress(m) => &m.pos,
            Metadata::Alias(m) => &m.pos,
            Metadata::Encoding(m) => &m.pos,
            Metadata::Calls(m)
            | Metadata::Databases(m)
            | Metadata::Secrets(m)
            | Metadata::Config(m)
            | Metadata::Publisher(m) => &m.pos,
            Metadata::CronJob(m) => &m.pos,
            Metadata::Subscriber(m) => &m.pos,
            Metadata::Retry(m) => &m.pos,
            Metadata::TypeMap(m) => &m.pos,
            Metadata::SqlMigration(m) => &m.pos,
        }
    }

    /// Keyword written after `+` in the text form.
    pub fn keyword(&self) -> &'static str {
        match self {
            Metadata::Ingress(_) => "ingress",
            Metadata::Alias(_) => "alias",
            Metadata::Encoding(_) => "encoding",
            Metadata::Calls(_) => "calls",
            Metadata::Databases(_) => "database",
            Metadata::Secrets(_) => "secrets",
            Metadata::Config(_) => "config",
            Metadata::CronJob(_) => "cron",
            Metadata::Publisher(_) => "publish",
            Metadata::Subscriber(_) => "subscribe",
            Metadata::Retry(_) => "retry",
            Metadata::TypeMap(_) => "typemap",
            Metadata::SqlMigration(_) => "migration",
        }
    }

    /// Lowercase kind name used in validation messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Metadata::Ingress(_) => "ingress",
            Metadata::Alias(_) => "alias",
            Metadata::Encoding(_) => "encoding",
            Metadata::Calls(_) => "calls",
            Metadata::Databases(_) => "databases",
            Metadata::Secrets(_) => "secrets",
            Metadata::Config(_) => "config",
            Metadata::CronJob(_) => "cronjob",
            Metadata::Publisher(_) => "publisher",
            Metadata::Subscriber(_) => "subscriber",
            Metadata::Retry(_) => "retry",
            Metadata::TypeMap(_) => "typemap",
            Metadata::SqlMigration(_) => "sqlmigration",
        }
    }

    /// Canonical ordering of metadata on a declaration.
    pub fn priority(&self) -> u8 {
        match self {
            Metadata::Ingress(_) => 1,
            Metadata::Alias(_) => 2,
            Metadata::Encoding(_) => 3,
            Metadata::Calls(_) => 4,
            Metadata::Databases(_) => 5,
            Metadata::Secrets(_) => 6,
            Metadata::Config(_) => 7,
            Metadata::CronJob(_) => 8,
            Metadata::Publisher(_) => 9,
            Metadata::Subscriber(_) => 10,
            Metadata::Retry(_) => 11,
            Metadata::TypeMap(_) => 12,
            Metadata::SqlMigration(_) => 13,
        }
    }

    pub fn for_each_ref<'a>(&'a self, f: &mut dyn FnMut(&'a Ref)) {
        match self {
            Metadata::Calls(m)
            | Metadata::Databases(m)
            | Metadata::Secrets(m)
            | Metadata::Config(m)
            | Metadata::Publisher(m) => m.refs.iter().for_each(|r| f(r)),
            Metadata::Retry(m) => {
                if let Some(catch) = &m.catch {
                    f(catch);
                }
            }
            _ => {}
        }
    }

    pub fn for_each_ref_mut(&mut self, f: &mut dyn FnMut(&mut Ref)) {
        match self {
            Metadata::Calls(m)
            | Metadata::Databases(m)
            | Metadata::Secrets(m)
            | Metadata::Config(m)
            | Metadata::Publisher(m) => m.refs.iter_mut().for_each(|r| f(r)),
            Metadata::Retry(m) => {
                if let Some(catch) = &mut m.catch {
                    f(catch);
                }
            }
            _ => {}
        }
    }
}

// ── Declarations ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Field {
    #[serde(default)]
    pub pos: Position,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub comments: Vec<String>,
    pub name: String,
    pub typ: Type,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metadata: Vec<Metadata>,
}

impl Field {
    /// The JSON name of this field, honouring `+alias json`.
    pub fn json_alias(&self) -> Option<&str> {
        self.metadata.iter().find_map(|m| match m {
            Metadata::Alias(alias) if alias.kind == "json" => Some(alias.alias.as_str()),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Data {
    #[serde(default)]
    pub pos: Position,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub comments: Vec<String>,
    pub export: bool,
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub type_parameters: Vec<String>,
    pub fields: Vec<Field>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metadata: Vec<Metadata>,
}

impl Data {
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Verb {
    #[serde(default)]
    pub pos: Position,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub comments: Vec<String>,
    pub export: bool,
    pub name: String,
    pub request: Type,
    pub response: Type,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metadata: Vec<Metadata>,
}

impl Verb {
    pub fn ingress(&self) -> Option<&MetadataIngress> {
        self.metadata.iter().find_map(|m| match m {
            Metadata::Ingress(i) => Some(i),
            _ => None,
        })
    }

    pub fn cron(&self) -> Option<&MetadataCronJob> {
        self.metadata.iter().find_map(|m| match m {
            Metadata::CronJob(c) => Some(c),
            _ => None,
        })
    }

    pub fn retry(&self) -> Option<&MetadataRetry> {
        self.metadata.iter().find_map(|m| match m {
            Metadata::Retry(r) => Some(r),
            _ => None,
        })
    }

    pub fn subscribers(&self) -> impl Iterator<Item = &MetadataSubscriber> {
        self.metadata.iter().filter_map(|m| match m {
            Metadata::Subscriber(s) => Some(s),
            _ => None,
        })
    }

    pub fn calls(&self) -> impl Iterator<Item = &Ref> {
        self.metadata.iter().flat_map(|m| match m {
            Metadata::Calls(c) => c.refs.as_slice(),
            _ => &[],
        })
    }

    /// Whether JSON bodies may carry fields the request type does not declare.
    pub fn lenient_encoding(&self) -> bool {
        self.metadata
            .iter()
            .any(|m| matches!(m, Metadata::Encoding(e) if e.lenient))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnumVariant {
    #[serde(default)]
    pub pos: Position,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub comments: Vec<String>,
    pub name: String,
    pub value: Value,
}

/// A value enum when `typ` is set, a type enum otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Enum {
    #[serde(default)]
    pub pos: Position,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub comments: Vec<String>,
    pub export: bool,
    pub name: String,
    pub typ: Option<Type>,
    pub variants: Vec<EnumVariant>,
}

impl Enum {
    pub fn is_value_enum(&self) -> bool {
        self.typ.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeAlias {
    #[serde(default)]
    pub pos: Position,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub comments: Vec<String>,
    pub export: bool,
    pub name: String,
    pub typ: Type,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metadata: Vec<Metadata>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Database {
    #[serde(default)]
    pub pos: Position,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub comments: Vec<String>,
    pub typ: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metadata: Vec<Metadata>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Topic {
    #[serde(default)]
    pub pos: Position,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub comments: Vec<String>,
    pub export: bool,
    pub name: String,
    pub event: Type,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subscription {
    #[serde(default)]
    pub pos: Position,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub comments: Vec<String>,
    pub name: String,
    pub topic: Ref,
}

/// A named `config` or `secret` value declaration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValueDecl {
    #[serde(default)]
    pub pos: Position,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub comments: Vec<String>,
    pub name: String,
    pub typ: Type,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "decl", rename_all = "snake_case")]
pub enum Decl {
    Config(ValueDecl),
    Secret(ValueDecl),
    Database(Database),
    Topic(Topic),
    Subscription(Subscription),
    TypeAlias(TypeAlias),
    Enum(Enum),
    Data(Data),
    Verb(Verb),
}

impl Decl {
    pub fn name(&self) -> &str {
        match self {
            Decl::Config(d) | Decl::Secret(d) => &d.name,
            Decl::Database(d) => &d.name,
            Decl::Topic(d) => &d.name,
            Decl::Subscription(d) => &d.name,
            Decl::TypeAlias(d) => &d.name,
            Decl::Enum(d) => &d.name,
            Decl::Data(d) => &d.name,
            Decl::Verb(d) => &d.name,
        }
    }

    pub fn pos(&self) -> &Position {
        match self {
            Decl::Config(d) | Decl::Secret(d) => &d.pos,
            Decl::Database(d) => &d.pos,
            Decl::Topic(d) => &d.pos,
            Decl::Subscription(d) => &d.pos,
            Decl::TypeAlias(d) => &d.pos,
            Decl::Enum(d) => &d.pos,
            Decl::Data(d) => &d.pos,
            Decl::Verb(d) => &d.pos,
        }
    }

    pub fn is_exported(&self) -> bool {
        match self {
            Decl::Topic(d) => d.export,
            Decl::TypeAlias(d) => d.export,
            Decl::Enum(d) => d.export,
            Decl::Data(d) => d.export,
            Decl::Verb(d) => d.export,
            Decl::Config(_) | Decl::Secret(_) | Decl::Database(_) | Decl::Subscription(_) => false,
        }
    }

    /// Lowercase kind name used in validation messages and duplicate keys.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Decl::Config(_) => "config",
            Decl::Secret(_) => "secret",
            Decl::Database(_) => "database",
            Decl::Topic(_) => "topic",
            Decl::Subscription(_) => "subscription",
            Decl::TypeAlias(_) => "typealias",
            Decl::Enum(_) => "enum",
            Decl::Data(_) => "data",
            Decl::Verb(_) => "verb",
        }
    }

    /// Canonical ordering of declarations within a module.
    pub fn priority(&self) -> u8 {
        match self {
            Decl::Config(_) => 1,
            Decl::Secret(_) => 2,
            Decl::Database(_) => 3,
            Decl::Topic(_) => 4,
            Decl::Subscription(_) => 5,
            Decl::TypeAlias(_) => 6,
            Decl::Enum(_) => 7,
            Decl::Data(_) => 8,
            Decl::Verb(_) => 9,
        }
    }

    pub fn type_parameters(&self) -> &[String] {
        match self {
            Decl::Data(d) => &d.type_parameters,
            _ => &[],
        }
    }

    pub fn metadata(&self) -> &[Metadata] {
        match self {
            Decl::Database(d) => &d.metadata,
            Decl::TypeAlias(d) => &d.metadata,
            Decl::Data(d) => &d.metadata,
            Decl::Verb(d) => &d.metadata,
            _ => &[],
        }
    }

    /// Visit every reference in the declaration: types, fields, variants
    /// and metadata.
    pub fn for_each_ref<'a>(&'a self, f: &mut dyn FnMut(&'a Ref)) {
        match self {
            Decl::Config(d) | Decl::Secret(d) => d.typ.for_each_ref(f),
            Decl::Database(d) => d.metadata.iter().for_each(|m| m.for_each_ref(f)),
            Decl::Topic(d) => d.event.for_each_ref(f),
            Decl::Subscription(d) => f(&d.topic),
            Decl::TypeAlias(d) => {
                d.typ.for_each_ref(f);
                d.metadata.iter().for_each(|m| m.for_each_ref(f));
            }
            Decl::Enum(d) => {
                if let Some(typ) = &d.typ {
                    typ.for_each_ref(f);
                }
                for variant in &d.variants {
                    if let Value::Type(typ) = &variant.value {
                        typ.for_each_ref(f);
                    }
                }
            }
            Decl::Data(d) => {
                for field in &d.fields {
                    field.typ.for_each_ref(f);
                }
                d.metadata.iter().for_each(|m| m.for_each_ref(f));
            }
            Decl::Verb(d) => {
                d.request.for_each_ref(f);
                d.response.for_each_ref(f);
                d.metadata.iter().for_each(|m| m.for_each_ref(f));
            }
        }
    }

    pub fn for_each_ref_mut(&mut self, f: &mut dyn FnMut(&mut Ref)) {
        match self {
            Decl::Config(d) | Decl::Secret(d) => d.typ.for_each_ref_mut(f),
            Decl::Database(d) => d.metadata.iter_mut().for_each(|m| m.for_each_ref_mut(f)),
            Decl::Topic(d) => d.event.for_each_ref_mut(f),
            Decl::Subscription(d) => f(&mut d.topic),
            Decl::TypeAlias(d) => {
                d.typ.for_each_ref_mut(f);
                d.metadata.iter_mut().for_each(|m| m.for_each_ref_mut(f));
            }
            Decl::Enum(d) => {
                if let Some(typ) = &mut d.typ {
                    typ.for_each_ref_mut(f);
                }
                for variant in &mut d.variants {
                    if let Value::Type(typ) = &mut variant.value {
                        typ.for_each_ref_mut(f);
                    }
                }
            }
            Decl::Data(d) => {
                for field in &mut d.fields {
                    field.typ.for_each_ref_mut(f);
                }
                d.metadata.iter_mut().for_each(|m| m.for_each_ref_mut(f));
            }
            Decl::Verb(d) => {
                d.request.for_each_ref_mut(f);
                d.response.for_each_ref_mut(f);
                d.metadata.iter_mut().for_each(|m| m.for_each_ref_mut(f));
            }
        }
    }
}

// ── Modules ────────────────────────────────────────────────────────

/// Deployment-time facts attached to a module.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModuleRuntime {
    pub create_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub min_replicas: u32,
    pub endpoint: Option<String>,
    pub deployment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Module {
    #[serde(default)]
    pub pos: Position,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub comments: Vec<String>,
    #[serde(default)]
    pub builtin: bool,
    pub name: String,
    pub decls: Vec<Decl>,
    #[serde(default)]
    pub runtime: Option<ModuleRuntime>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            pos: Position::default(),
            comments: Vec::new(),
            builtin: false,
            name: name.into(),
            decls: Vec::new(),
            runtime: None,
        }
    }

    pub fn decl(&self, name: &str) -> Option<&Decl> {
        self.decls.iter().find(|d| d.name() == name)
    }

    pub fn verb(&self, name: &str) -> Option<&Verb> {
        self.decls.iter().find_map(|d| match d {
            Decl::Verb(v) if v.name == name => Some(v),
            _ => None,
        })
    }

    pub fn verbs(&self) -> impl Iterator<Item = &Verb> {
        self.decls.iter().filter_map(|d| match d {
            Decl::Verb(v) => Some(v),
            _ => None,
        })
    }

    pub fn topics(&self) -> impl Iterator<Item = &Topic> {
        self.decls.iter().filter_map(|d| match d {
            Decl::Topic(t) => Some(t),
            _ => None,
        })
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = &Subscription> {
        self.decls.iter().filter_map(|d| match d {
            Decl::Subscription(s) => Some(s),
            _ => None,
        })
    }

    pub fn databases(&self) -> impl Iterator<Item = &Database> {
        self.decls.iter().filter_map(|d| match d {
            Decl::Database(db) => Some(db),
            _ => None,
        })
    }

    /// Other modules this one references, sorted.
    pub fn imports(&self) -> Vec<String> {
        let mut imports = BTreeSet::new();
        for decl in &self.decls {
            decl.for_each_ref(&mut |r| {
                if !r.module.is_empty() && r.module != self.name {
                    imports.insert(r.module.clone());
                }
            });
        }
        imports.into_iter().collect()
    }

    /// Modules whose verbs this module declares it calls.
    pub fn callable_modules(&self) -> BTreeSet<String> {
        self.verbs()
            .flat_map(|v| v.calls())
            .map(|r| {
                if r.module.is_empty() {
                    self.name.clone()
                } else {
                    r.module.clone()
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Schema {
    #[serde(default)]
    pub pos: Position,
    pub modules: Vec<Module>,
}

impl Schema {
    pub fn new(modules: Vec<Module>) -> Self {
        Self {
            pos: Position::default(),
            modules,
        }
    }

    pub fn module(&self, name: &str) -> Option<&Module> {
        self.modules.iter().find(|m| m.name == name)
    }

    /// Resolve a qualified reference to its declaration.
    pub fn resolve(&self, r: &Ref) -> Option<&Decl> {
        self.module(&r.module)?.decl(&r.name)
    }

    pub fn resolve_verb(&self, key: &RefKey) -> Option<&Verb> {
        self.module(&key.module)?.verb(&key.name)
    }
}
