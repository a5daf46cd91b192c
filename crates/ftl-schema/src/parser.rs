//! Text format parser.
//!
//! ```text
//! module echo {
//!   // An echo request.
//!   export data EchoRequest {
//!     name String? +alias json "n"
//!   }
//!
//!   export verb echo(echo.EchoRequest) String
//!     +ingress http POST /echo/{name}
//!     +calls time.time
//! }
//! ```
//!
//! A hand-written lexer feeds a recursive-descent parser. Metadata whose
//! payload is free-form (cron expressions, ingress paths, retry arguments)
//! is read straight from the source line.

use crate::error::SchemaError;
use crate::model::*;

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Str(String),
    Number(String),
    Punct(char),
    Comment(String),
    Eof,
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    pos: Position,
    start: usize,
    end: usize,
}

impl Token {
    fn text(&self) -> String {
        match &self.tok {
            Tok::Ident(s) | Tok::Number(s) | Tok::Comment(s) => s.clone(),
            Tok::Str(s) => format!("{s:?}"),
            Tok::Punct(c) => c.to_string(),
            Tok::Eof => "<EOF>".to_string(),
        }
    }
}

// ── Lexer ──────────────────────────────────────────────────────────

struct Lexer<'a> {
    filename: &'a str,
    src: &'a str,
    chars: Vec<(usize, char)>,
    idx: usize,
    line: usize,
    column: usize,
}

impl<'a> Lexer<'a> {
    fn new(filename: &'a str, src: &'a str) -> Self {
        Self {
            filename,
            src,
            chars: src.char_indices().collect(),
            idx: 0,
            line: 1,
            column: 1,
        }
    }

    fn peek(&self, ahead: usize) -> Option<char> {
        self.chars.get(self.idx + ahead).map(|(_, c)| *c)
    }

    fn offset(&self) -> usize {
        self.chars.get(self.idx).map_or(self.src.len(), |(o, _)| *o)
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek(0)?;
        self.idx += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn pos(&self) -> Position {
        Position {
            filename: self.filename.to_string(),
            line: self.line,
            column: self.column,
        }
    }

    fn tokens(mut self) -> Result<Vec<Token>, SchemaError> {
        let mut tokens = Vec::new();
        loop {
            while self.peek(0).is_some_and(char::is_whitespace) {
                self.bump();
            }
            let pos = self.pos();
            let start = self.offset();
            let Some(c) = self.peek(0) else {
                tokens.push(Token {
                    tok: Tok::Eof,
                    pos,
                    start,
                    end: start,
                });
                return Ok(tokens);
            };
            let tok = if c == '/' && self.peek(1) == Some('/') {
                self.bump();
                self.bump();
                let mut text = String::new();
                while let Some(c) = self.peek(0).filter(|c| *c != '\n') {
                    text.push(c);
                    self.bump();
                }
                Tok::Comment(text.strip_prefix(' ').unwrap_or(&text).to_string())
            } else if c == '"' {
                self.bump();
                Tok::Str(self.string(&pos)?)
            } else if c.is_ascii_digit() {
                let mut text = String::new();
                while let Some(c) = self.peek(0).filter(char::is_ascii_digit) {
                    text.push(c);
                    self.bump();
                }
                Tok::Number(text)
            } else if c.is_alphabetic() || c == '_' {
                let mut text = String::new();
                while let Some(c) = self.peek(0).filter(|c| c.is_alphanumeric() || *c == '_') {
                    text.push(c);
                    self.bump();
                }
                Tok::Ident(text)
            } else {
                self.bump();
                Tok::Punct(c)
            };
            tokens.push(Token {
                tok,
                pos,
                start,
                end: self.offset(),
            });
        }
    }

    fn string(&mut self, pos: &Position) -> Result<String, SchemaError> {
        let mut text = String::new();
        loop {
            match self.bump() {
                None | Some('\n') => return Err(SchemaError::new(pos, "unterminated string")),
                Some('"') => return Ok(text),
                Some('\\') => match self.bump() {
                    Some('n') => text.push('\n'),
                    Some('t') => text.push('\t'),
                    Some(c) => text.push(c),
                    None => return Err(SchemaError::new(pos, "unterminated string")),
                },
                Some(c) => text.push(c),
            }
        }
    }
}

// ── Parser ─────────────────────────────────────────────────────────

struct Parser<'a> {
    filename: &'a str,
    src: &'a str,
    tokens: Vec<Token>,
    idx: usize,
}

type PResult<T> = Result<T, SchemaError>;

impl<'a> Parser<'a> {
    fn new(filename: &'a str, src: &'a str) -> PResult<Self> {
        Ok(Self {
            filename,
            src,
            tokens: Lexer::new(filename, src).tokens()?,
            idx: 0,
        })
    }

    fn peek_index(&self) -> usize {
        let mut idx = self.idx;
        while matches!(self.tokens[idx].tok, Tok::Comment(_)) {
            idx += 1;
        }
        idx
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.peek_index()]
    }

    fn next(&mut self) -> Token {
        let idx = self.peek_index();
        let token = self.tokens[idx].clone();
        if !matches!(token.tok, Tok::Eof) {
            self.idx = idx + 1;
        } else {
            self.idx = idx;
        }
        token
    }

    fn take_comments(&mut self) -> Vec<String> {
        let mut comments = Vec::new();
        while let Tok::Comment(text) = &self.tokens[self.idx].tok {
            comments.push(text.clone());
            self.idx += 1;
        }
        comments
    }

    fn unexpected(token: &Token) -> SchemaError {
        SchemaError::new(&token.pos, format!("unexpected token {:?}", token.text()))
    }

    fn is_punct(&self, c: char) -> bool {
        self.peek().tok == Tok::Punct(c)
    }

    fn is_ident(&self, word: &str) -> bool {
        matches!(&self.peek().tok, Tok::Ident(s) if s == word)
    }

    fn expect_punct(&mut self, c: char) -> PResult<Token> {
        let token = self.next();
        if token.tok == Tok::Punct(c) {
            Ok(token)
        } else {
            Err(Self::unexpected(&token))
        }
    }

    fn expect_ident(&mut self) -> PResult<(String, Position)> {
        let token = self.next();
        match token.tok {
            Tok::Ident(name) => Ok((name, token.pos)),
            _ => Err(Self::unexpected(&token)),
        }
    }

    fn expect_keyword(&mut self, word: &str) -> PResult<Position> {
        let token = self.next();
        match &token.tok {
            Tok::Ident(s) if s == word => Ok(token.pos),
            _ => Err(Self::unexpected(&token)),
        }
    }

    fn position_at(&self, offset: usize) -> Position {
        let before = &self.src[..offset];
        let line = before.matches('\n').count() + 1;
        let line_start = before.rfind('\n').map_or(0, |i| i + 1);
        Position {
            filename: self.filename.to_string(),
            line,
            column: self.src[line_start..offset].chars().count() + 1,
        }
    }

    /// Skip any tokens that start before `offset`.
    fn skip_to(&mut self, offset: usize) {
        while self.tokens[self.idx].start < offset && !matches!(self.tokens[self.idx].tok, Tok::Eof)
        {
            self.idx += 1;
        }
    }

    /// Whitespace-separated words from `from` to the end of the line,
    /// consuming the tokens they cover.
    fn rest_of_line(&mut self, from: usize) -> Vec<(String, Position)> {
        let end = self.src[from..]
            .find('\n')
            .map_or(self.src.len(), |i| from + i);
        let line = &self.src[from..end];
        let line = line.find("//").map_or(line, |i| &line[..i]);
        let mut words = Vec::new();
        let mut cursor = 0;
        for word in line.split_whitespace() {
            let at = cursor + line[cursor..].find(word).unwrap_or(0);
            words.push((word.to_string(), self.position_at(from + at)));
            cursor = at + word.len();
        }
        self.skip_to(end);
        words
    }

    // ── Grammar ────────────────────────────────────────────────────

    fn schema(&mut self) -> PResult<Schema> {
        let mut modules = Vec::new();
        loop {
            let comments = self.take_comments();
            if matches!(self.peek().tok, Tok::Eof) {
                break;
            }
            modules.push(self.module(comments)?);
        }
        Ok(Schema::new(modules))
    }

    fn module(&mut self, comments: Vec<String>) -> PResult<Module> {
        let pos = self.peek().pos.clone();
        let builtin = if self.is_ident("builtin") {
            self.next();
            true
        } else {
            false
        };
        self.expect_keyword("module")?;
        let (name, _) = self.expect_ident()?;
        self.expect_punct('{')?;
        let mut decls = Vec::new();
        loop {
            let comments = self.take_comments();
            if self.is_punct('}') {
                self.next();
                break;
            }
            decls.push(self.decl(comments)?);
        }
        Ok(Module {
            pos,
            comments,
            builtin,
            name,
            decls,
            runtime: None,
        })
    }

    fn decl(&mut self, comments: Vec<String>) -> PResult<Decl> {
        let pos = self.peek().pos.clone();
        let export = if self.is_ident("export") {
            self.next();
            true
        } else {
            false
        };
        let keyword = self.next();
        let Tok::Ident(kind) = &keyword.tok else {
            return Err(Self::unexpected(&keyword));
        };
        let decl = match kind.as_str() {
            "data" => Decl::Data(self.data(pos, comments, export)?),
            "verb" => Decl::Verb(self.verb(pos, comments, export)?),
            "enum" => Decl::Enum(self.enumeration(pos, comments, export)?),
            "typealias" => {
                let (name, _) = self.expect_ident()?;
                let typ = self.typ()?;
                Decl::TypeAlias(TypeAlias {
                    pos,
                    comments,
                    export,
                    name,
                    typ,
                    metadata: self.metadata_list()?,
                })
            }
            "database" => {
                let (typ, _) = self.expect_ident()?;
                let (name, _) = self.expect_ident()?;
                Decl::Database(Database {
                    pos,
                    comments,
                    typ,
                    name,
                    metadata: self.metadata_list()?,
                })
            }
            "topic" => {
                let (name, _) = self.expect_ident()?;
                Decl::Topic(Topic {
                    pos,
                    comments,
                    export,
                    name,
                    event: self.typ()?,
                })
            }
            "subscription" => {
                let (name, _) = self.expect_ident()?;
                Decl::Subscription(Subscription {
                    pos,
                    comments,
                    name,
                    topic: self.reference()?,
                })
            }
            "config" | "secret" => {
                let is_config = kind == "config";
                let (name, _) = self.expect_ident()?;
                let value = ValueDecl {
                    pos,
                    comments,
                    name,
                    typ: self.typ()?,
                };
                if is_config {
                    Decl::Config(value)
                } else {
                    Decl::Secret(value)
                }
            }
            _ => return Err(Self::unexpected(&keyword)),
        };
        Ok(decl)
    }

    fn data(&mut self, pos: Position, comments: Vec<String>, export: bool) -> PResult<Data> {
        let (name, _) = self.expect_ident()?;
        let mut type_parameters = Vec::new();
        if self.is_punct('<') {
            self.next();
            loop {
                type_parameters.push(self.expect_ident()?.0);
                if self.is_punct(',') {
                    self.next();
                } else {
                    break;
                }
            }
            self.expect_punct('>')?;
        }
        self.expect_punct('{')?;
        let mut fields = Vec::new();
        loop {
            let comments = self.take_comments();
            if self.is_punct('}') {
                self.next();
                break;
            }
            let (field_name, field_pos) = self.expect_ident()?;
            let typ = self.typ()?;
            fields.push(Field {
                pos: field_pos,
                comments,
                name: field_name,
                typ,
                metadata: self.metadata_list()?,
            });
        }
        Ok(Data {
            pos,
            comments,
            export,
            name,
            type_parameters,
            fields,
            metadata: self.metadata_list()?,
        })
    }

    fn verb(&mut self, pos: Position, comments: Vec<String>, export: bool) -> PResult<Verb> {
        let (name, _) = self.expect_ident()?;
        self.expect_punct('(')?;
        let request = self.typ()?;
        self.expect_punct(')')?;
        let response = self.typ()?;
        Ok(Verb {
            pos,
            comments,
            export,
            name,
            request,
            response,
            metadata: self.metadata_list()?,
        })
    }

    fn enumeration(&mut self, pos: Position, comments: Vec<String>, export: bool) -> PResult<Enum> {
        let (name, _) = self.expect_ident()?;
        let typ = if self.is_punct(':') {
            self.next();
            Some(self.typ()?)
        } else {
            None
        };
        self.expect_punct('{')?;
        let mut variants = Vec::new();
        loop {
            let comments = self.take_comments();
            if self.is_punct('}') {
                self.next();
                break;
            }
            let (variant_name, variant_pos) = self.expect_ident()?;
            let value = if typ.is_some() {
                self.expect_punct('=')?;
                self.value()?
            } else {
                Value::Type(self.typ()?)
            };
            variants.push(EnumVariant {
                pos: variant_pos,
                comments,
                name: variant_name,
                value,
            });
        }
        Ok(Enum {
            pos,
            comments,
            export,
            name,
            typ,
            variants,
        })
    }

    fn value(&mut self) -> PResult<Value> {
        let negative = if self.is_punct('-') {
            self.next();
            true
        } else {
            false
        };
        let token = self.next();
        match &token.tok {
            Tok::Str(s) if !negative => Ok(Value::String(s.clone())),
            Tok::Number(n) => {
                let n: i64 = n.parse().map_err(|_| Self::unexpected(&token))?;
                Ok(Value::Int(if negative { -n } else { n }))
            }
            _ => Err(Self::unexpected(&token)),
        }
    }

    fn typ(&mut self) -> PResult<Type> {
        let token = self.next();
        let base = match &token.tok {
            Tok::Punct('[') => {
                let element = self.typ()?;
                self.expect_punct(']')?;
                Type::array(element)
            }
            Tok::Punct('{') => {
                let key = self.typ()?;
                self.expect_punct(':')?;
                let value = self.typ()?;
                self.expect_punct('}')?;
                Type::map(key, value)
            }
            Tok::Ident(name) => match Type::primitive(name) {
                Some(primitive) if !self.is_punct('.') => primitive,
                _ => Type::Ref(self.reference_from(token.clone())?),
            },
            _ => return Err(Self::unexpected(&token)),
        };
        if self.is_punct('?') {
            self.next();
            return Ok(Type::optional(base));
        }
        Ok(base)
    }

    fn reference(&mut self) -> PResult<Ref> {
        let token = self.next();
        self.reference_from(token)
    }

    fn reference_from(&mut self, first: Token) -> PResult<Ref> {
        let Tok::Ident(first_name) = &first.tok else {
            return Err(Self::unexpected(&first));
        };
        let (module, name) = if self.is_punct('.') {
            self.next();
            (first_name.clone(), self.expect_ident()?.0)
        } else {
            (String::new(), first_name.clone())
        };
        let mut type_parameters = Vec::new();
        if self.is_punct('<') {
            self.next();
            loop {
                type_parameters.push(self.typ()?);
                if self.is_punct(',') {
                    self.next();
                } else {
                    break;
                }
            }
            self.expect_punct('>')?;
        }
        Ok(Ref {
            pos: first.pos,
            module,
            name,
            type_parameters,
        })
    }

    fn reference_list(&mut self) -> PResult<Vec<Ref>> {
        let mut refs = vec![self.reference()?];
        while self.is_punct(',') {
            self.next();
            refs.push(self.reference()?);
        }
        Ok(refs)
    }

    fn metadata_refs(&mut self, pos: Position) -> PResult<MetadataRefs> {
        Ok(MetadataRefs {
            pos,
            refs: self.reference_list()?,
        })
    }

    fn metadata_list(&mut self) -> PResult<Vec<Metadata>> {
        let mut metadata = Vec::new();
        while self.is_punct('+') {
            metadata.push(self.metadata()?);
        }
        Ok(metadata)
    }

    fn metadata(&mut self) -> PResult<Metadata> {
        let plus = self.expect_punct('+')?;
        let pos = plus.pos.clone();
        let keyword = self.next();
        let Tok::Ident(kind) = &keyword.tok else {
            return Err(Self::unexpected(&keyword));
        };
        Ok(match kind.as_str() {
            "ingress" => self.ingress(pos, keyword.end)?,
            "cron" => {
                let words = self.rest_of_line(keyword.end);
                if words.is_empty() {
                    return Err(SchemaError::new(&pos, "cron metadata requires an expression"));
                }
                let cron = words
                    .into_iter()
                    .map(|(w, _)| w)
                    .collect::<Vec<_>>()
                    .join(" ");
                Metadata::CronJob(MetadataCronJob { pos, cron })
            }
            "calls" => Metadata::Calls(self.metadata_refs(pos)?),
            "secrets" => Metadata::Secrets(self.metadata_refs(pos)?),
            "config" => Metadata::Config(self.metadata_refs(pos)?),
            "publish" => Metadata::Publisher(self.metadata_refs(pos)?),
            "database" => {
                self.expect_keyword("calls")?;
                Metadata::Databases(self.metadata_refs(pos)?)
            }
            "subscribe" => {
                let (name, _) = self.expect_ident()?;
                let mut from = FromOffset::Beginning;
                if self.is_ident("from") {
                    self.next();
                    self.expect_punct('=')?;
                    let token = self.next();
                    from = match &token.tok {
                        Tok::Ident(s) if s == "beginning" => FromOffset::Beginning,
                        Tok::Ident(s) if s == "latest" => FromOffset::Latest,
                        _ => return Err(Self::unexpected(&token)),
                    };
                }
                Metadata::Subscriber(MetadataSubscriber { pos, name, from })
            }
            "retry" => self.retry(pos, keyword.end)?,
            "encoding" => {
                let (typ, _) = self.expect_ident()?;
                let lenient = if self.is_ident("lenient") {
                    self.next();
                    true
                } else {
                    false
                };
                Metadata::Encoding(MetadataEncoding { pos, typ, lenient })
            }
            "alias" => {
                let (kind, _) = self.expect_ident()?;
                Metadata::Alias(MetadataAlias {
                    pos,
                    kind,
                    alias: self.string()?,
                })
            }
            "typemap" => {
                let (runtime, _) = self.expect_ident()?;
                Metadata::TypeMap(MetadataTypeMap {
                    pos,
                    runtime,
                    native_name: self.string()?,
                })
            }
            "migration" => {
                let mut words = self.rest_of_line(keyword.end).into_iter();
                let (digest, _) = words
                    .next()
                    .ok_or_else(|| SchemaError::new(&pos, "migration metadata requires a digest"))?;
                if let Some((extra, extra_pos)) = words.next() {
                    return Err(SchemaError::new(
                        &extra_pos,
                        format!("unexpected token {extra:?}"),
                    ));
                }
                Metadata::SqlMigration(MetadataSqlMigration { pos, digest })
            }
            _ => return Err(Self::unexpected(&keyword)),
        })
    }

    fn string(&mut self) -> PResult<String> {
        let token = self.next();
        match token.tok {
            Tok::Str(s) => Ok(s),
            _ => Err(Self::unexpected(&token)),
        }
    }

    fn ingress(&mut self, pos: Position, from: usize) -> PResult<Metadata> {
        let mut words = self.rest_of_line(from).into_iter().peekable();
        let typ = match words.peek() {
            Some((w, _)) if w == "http" => {
                words.next();
                "http".to_string()
            }
            _ => "http".to_string(),
        };
        let (method, method_pos) = words
            .next()
            .ok_or_else(|| SchemaError::new(&pos, "ingress metadata requires a method"))?;
        if !method.chars().all(|c| c.is_ascii_uppercase()) {
            return Err(SchemaError::new(
                &method_pos,
                format!("unexpected token {method:?}"),
            ));
        }
        let (path, path_pos) = words
            .next()
            .ok_or_else(|| SchemaError::new(&pos, "ingress metadata requires a path"))?;
        if let Some((extra, extra_pos)) = words.next() {
            return Err(SchemaError::new(
                &extra_pos,
                format!("unexpected token {extra:?}"),
            ));
        }
        Ok(Metadata::Ingress(MetadataIngress {
            pos,
            typ,
            method,
            path: parse_ingress_path(&path, &path_pos)?,
        }))
    }

    fn retry(&mut self, pos: Position, from: usize) -> PResult<Metadata> {
        let words = self.rest_of_line(from);
        let mut retry = MetadataRetry {
            pos,
            count: None,
            min_backoff: String::new(),
            max_backoff: String::new(),
            catch: None,
        };
        let mut i = 0;
        if let Some((word, word_pos)) = words.first() {
            if let Some(count) = parse_count(word) {
                retry.count = Some(count);
                i += 1;
            } else if word.starts_with('-') {
                return Err(SchemaError::new(word_pos, format!("unexpected token {word:?}")));
            }
        }
        let mut durations = 0;
        while let Some((word, _)) = words.get(i) {
            if word == "catch" {
                break;
            }
            if durations == 2 || !is_duration_literal(word) {
                // A bare number in duration position means the unit was split off.
                let culprit = if parse_count(word).is_some() {
                    words.get(i + 1).unwrap_or(&words[i])
                } else {
                    &words[i]
                };
                return Err(SchemaError::new(
                    &culprit.1,
                    format!("unexpected token {:?}", culprit.0),
                ));
            }
            if durations == 0 {
                retry.min_backoff = word.clone();
            } else {
                retry.max_backoff = word.clone();
            }
            durations += 1;
            i += 1;
        }
        if let Some((_, catch_pos)) = words.get(i) {
            let (target, target_pos) = words
                .get(i + 1)
                .ok_or_else(|| SchemaError::new(catch_pos, "catch requires a verb reference"))?;
            let (module, name) = match target.split_once('.') {
                Some((m, n)) => (m.to_string(), n.to_string()),
                None => (String::new(), target.clone()),
            };
            if let Some((extra, extra_pos)) = words.get(i + 2) {
                return Err(SchemaError::new(
                    extra_pos,
                    format!("unexpected token {extra:?}"),
                ));
            }
            retry.catch = Some(Ref {
                pos: target_pos.clone(),
                module,
                name,
                type_parameters: Vec::new(),
            });
        }
        Ok(Metadata::Retry(retry))
    }
}

fn parse_count(word: &str) -> Option<i64> {
    let digits = word.strip_prefix('-').unwrap_or(word);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    word.parse().ok()
}

/// `\d+[A-Za-z]+` repeated, e.g. `1m30s`. Units are checked later.
fn is_duration_literal(word: &str) -> bool {
    let mut chars = word.chars().peekable();
    let mut groups = 0;
    while chars.peek().is_some() {
        let mut digits = 0;
        while chars.next_if(char::is_ascii_digit).is_some() {
            digits += 1;
        }
        let mut letters = 0;
        while chars.next_if(char::is_ascii_alphabetic).is_some() {
            letters += 1;
        }
        if digits == 0 || letters == 0 {
            return false;
        }
        groups += 1;
    }
    groups > 0
}

fn parse_ingress_path(path: &str, pos: &Position) -> Result<Vec<IngressPathComponent>, SchemaError> {
    if !path.starts_with('/') {
        return Err(SchemaError::new(pos, format!("ingress path {path:?} must start with /")));
    }
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            match segment.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
                Some(param) if !param.is_empty() => {
                    Ok(IngressPathComponent::Parameter(param.to_string()))
                }
                Some(_) => Err(SchemaError::new(pos, "empty ingress path parameter")),
                None if segment.contains(['{', '}']) => Err(SchemaError::new(
                    pos,
                    format!("invalid ingress path segment {segment:?}"),
                )),
                None => Ok(IngressPathComponent::Literal(segment.to_string())),
            }
        })
        .collect()
}

/// Parse a schema from text without validating it.
pub fn parse_schema(filename: &str, src: &str) -> Result<Schema, SchemaError> {
    let mut parser = Parser::new(filename, src)?;
    let schema = parser.schema()?;
    Ok(schema)
}

/// Parse exactly one module from text without validating it.
pub fn parse_module(filename: &str, src: &str) -> Result<Module, SchemaError> {
    let mut schema = parse_schema(filename, src)?;
    match schema.modules.len() {
        1 => Ok(schema.modules.remove(0)),
        n => Err(SchemaError::new(
            &Position::new(1, 1),
            format!("expected exactly one module, found {n}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_verb_with_metadata() {
        let module = parse_module(
            "",
            r#"
module echo {
  // Echo back.
  export verb echo(HttpRequest<Unit, echo.Params, Unit>) HttpResponse<String, String>
    +ingress http GET /echo/{name}
    +calls time.time, echo.other
    +encoding json lenient
}
"#,
        )
        .unwrap();
        let verb = module.verb("echo").unwrap();
        assert!(verb.export);
        assert_eq!(verb.comments, vec!["Echo back."]);
        assert_eq!(verb.pos.line, 4);
        assert_eq!(verb.pos.column, 3);
        let ingress = verb.ingress().unwrap();
        assert_eq!(ingress.method, "GET");
        assert_eq!(ingress.route_key(), "GET /echo/{}");
        assert_eq!(ingress.path_parameters().collect::<Vec<_>>(), vec!["name"]);
        assert_eq!(verb.calls().count(), 2);
        assert!(verb.lenient_encoding());
    }

    #[test]
    fn parses_cron_to_end_of_line() {
        let module = parse_module(
            "",
            "module m {\n  verb tick(Unit) Unit\n    +cron */10 * * 1-10,11-31 * * *\n}\n",
        )
        .unwrap();
        assert_eq!(
            module.verb("tick").unwrap().cron().unwrap().cron,
            "*/10 * * 1-10,11-31 * * *"
        );
    }

    #[test]
    fn parses_retry_arguments() {
        let module = parse_module(
            "",
            "module m {\n  verb a(Unit) Unit\n    +retry 10 5s 20m catch m.c\n}\n",
        )
        .unwrap();
        let retry = module.verb("a").unwrap().retry().unwrap().clone();
        assert_eq!(retry.count, Some(10));
        assert_eq!(retry.min_backoff, "5s");
        assert_eq!(retry.max_backoff, "20m");
        assert_eq!(retry.catch.unwrap().name, "c");
    }

    #[test]
    fn split_retry_unit_is_a_syntax_error() {
        let err = parse_module("", "module one {\n  verb A(Empty) Unit\n    +retry 10 5 s\n}\n")
            .unwrap_err();
        assert_eq!(err.to_string(), "3:17: unexpected token \"s\"");
    }

    #[test]
    fn parses_enum_values() {
        let module = parse_module(
            "",
            "module m {\n  enum Level: Int {\n    Low = -1\n    High = 2\n  }\n  enum Tag: String {\n    A = \"a\"\n  }\n}\n",
        )
        .unwrap();
        let Some(Decl::Enum(level)) = module.decl("Level") else {
            panic!("expected enum");
        };
        let values: Vec<_> = level.variants.iter().map(|v| v.value.clone()).collect();
        assert_eq!(values, vec![Value::Int(-1), Value::Int(2)]);
        let Some(Decl::Enum(tag)) = module.decl("Tag") else {
            panic!("expected enum");
        };
        assert_eq!(tag.variants[0].value, Value::String("a".into()));

        let err = parse_module("", "module m {\n  enum E: String {\n    A = -\"a\"\n  }\n}\n").unwrap_err();
        assert_eq!(err.to_string(), "3:10: unexpected token \"\\\"a\\\"\"");
    }

    #[test]
    fn parses_data_enum_and_pubsub() {
        let module = parse_module(
            "",
            r#"
module shop {
  export data Box<T> {
    item T
    tags [String]
    attrs {String: Int}?
    id String +alias json "ID"
  }
  enum Colour: String {
    Red = "r"
    Green = "g"
  }
  enum Shape {
    Circle Float
    Named shop.Box<String>
  }
  export topic orders shop.Box<Int>
  subscription audit shop.orders
  config limit Int
  secret token String
  database postgres main
  verb sink(shop.Box<Int>) Unit
    +subscribe audit from=latest
}
"#,
        )
        .unwrap();
        assert_eq!(module.decls.len(), 9);
        let Some(Decl::Data(data)) = module.decl("Box") else {
            panic!("expected data");
        };
        assert_eq!(data.type_parameters, vec!["T"]);
        assert_eq!(data.field("id").unwrap().json_alias(), Some("ID"));
        assert_eq!(
            data.field("attrs").unwrap().typ,
            Type::optional(Type::map(Type::String, Type::Int))
        );
        let Some(Decl::Enum(shape)) = module.decl("Shape") else {
            panic!("expected enum");
        };
        assert!(!shape.is_value_enum());
        let sub = module.verb("sink").unwrap().subscribers().next().unwrap();
        assert_eq!(sub.from, FromOffset::Latest);
    }

    #[test]
    fn unexpected_declaration_keyword() {
        let err = parse_module("", "module m {\n  fsm F {}\n}\n").unwrap_err();
        assert_eq!(err.to_string(), "2:3: unexpected token \"fsm\"");
    }
}
