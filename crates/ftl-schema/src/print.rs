//! Text rendering. The output parses back to an equal schema.

use std::fmt::{self, Display, Formatter, Write};

use crate::model::*;

impl Display for Type {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Type::Int => f.write_str("Int"),
            Type::Float => f.write_str("Float"),
            Type::String => f.write_str("String"),
            Type::Bytes => f.write_str("Bytes"),
            Type::Bool => f.write_str("Bool"),
            Type::Time => f.write_str("Time"),
            Type::Unit => f.write_str("Unit"),
            Type::Any => f.write_str("Any"),
            Type::Array { element } => write!(f, "[{element}]"),
            Type::Map { key, value } => write!(f, "{{{key}: {value}}}"),
            Type::Optional { inner } => write!(f, "{inner}?"),
            Type::Ref(r) => write!(f, "{r}"),
        }
    }
}

impl Display for Ref {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if !self.module.is_empty() {
            write!(f, "{}.", self.module)?;
        }
        f.write_str(&self.name)?;
        if !self.type_parameters.is_empty() {
            f.write_char('<')?;
            for (i, param) in self.type_parameters.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{param}")?;
            }
            f.write_char('>')?;
        }
        Ok(())
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => write_quoted(f, s),
            Value::Int(n) => write!(f, "{n}"),
            Value::Type(t) => write!(f, "{t}"),
        }
    }
}

fn write_quoted(f: &mut impl Write, s: &str) -> fmt::Result {
    f.write_char('"')?;
    for c in s.chars() {
        match c {
            '"' => f.write_str("\\\"")?,
            '\\' => f.write_str("\\\\")?,
            '\n' => f.write_str("\\n")?,
            '\t' => f.write_str("\\t")?,
            c => f.write_char(c)?,
        }
    }
    f.write_char('"')
}

fn write_refs(f: &mut Formatter<'_>, refs: &[Ref]) -> fmt::Result {
    for (i, r) in refs.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{r}")?;
    }
    Ok(())
}

impl Display for Metadata {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Metadata::Ingress(m) => {
                write!(f, "+ingress {} {} {}", m.typ, m.method, m.path_string())
            }
            Metadata::Alias(m) => {
                write!(f, "+alias {} ", m.kind)?;
                write_quoted(f, &m.alias)
            }
            Metadata::Encoding(m) => {
                write!(f, "+encoding {}", m.typ)?;
                if m.lenient {
                    f.write_str(" lenient")?;
                }
                Ok(())
            }
            Metadata::Calls(m) => {
                f.write_str("+calls ")?;
                write_refs(f, &m.refs)
            }
            Metadata::Databases(m) => {
                f.write_str("+database calls ")?;
                write_refs(f, &m.refs)
            }
            Metadata::Secrets(m) => {
                f.write_str("+secrets ")?;
                write_refs(f, &m.refs)
            }
            Metadata::Config(m) => {
                f.write_str("+config ")?;
                write_refs(f, &m.refs)
            }
            Metadata::Publisher(m) => {
                f.write_str("+publish ")?;
                write_refs(f, &m.refs)
            }
            Metadata::CronJob(m) => write!(f, "+cron {}", m.cron),
            Metadata::Subscriber(m) => {
                write!(f, "+subscribe {}", m.name)?;
                if m.from == FromOffset::Latest {
                    f.write_str(" from=latest")?;
                }
                Ok(())
            }
            Metadata::Retry(m) => {
                f.write_str("+retry")?;
                if let Some(count) = m.count {
                    write!(f, " {count}")?;
                }
                if !m.min_backoff.is_empty() {
                    write!(f, " {}", m.min_backoff)?;
                }
                if !m.max_backoff.is_empty() {
                    write!(f, " {}", m.max_backoff)?;
                }
                if let Some(catch) = &m.catch {
                    write!(f, " catch {catch}")?;
                }
                Ok(())
            }
            Metadata::TypeMap(m) => {
                write!(f, "+typemap {} ", m.runtime)?;
                write_quoted(f, &m.native_name)
            }
            Metadata::SqlMigration(m) => write!(f, "+migration {}", m.digest),
        }
    }
}

fn write_comments(f: &mut Formatter<'_>, indent: &str, comments: &[String]) -> fmt::Result {
    for comment in comments {
        if comment.is_empty() {
            writeln!(f, "{indent}//")?;
        } else {
            writeln!(f, "{indent}// {comment}")?;
        }
    }
    Ok(())
}

fn write_metadata_lines(f: &mut Formatter<'_>, indent: &str, metadata: &[Metadata]) -> fmt::Result {
    for m in metadata {
        write!(f, "\n{indent}{m}")?;
    }
    Ok(())
}

fn export_prefix(export: bool) -> &'static str {
    if export { "export " } else { "" }
}

/// Renders a declaration at the given indentation, without a trailing newline.
struct Indented<'a>(&'a Decl, &'a str);

impl Display for Indented<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let (decl, indent) = (self.0, self.1);
        let inner = format!("{indent}  ");
        match decl {
            Decl::Config(d) => {
                write_comments(f, indent, &d.comments)?;
                write!(f, "{indent}config {} {}", d.name, d.typ)
            }
            Decl::Secret(d) => {
                write_comments(f, indent, &d.comments)?;
                write!(f, "{indent}secret {} {}", d.name, d.typ)
            }
            Decl::Database(d) => {
                write_comments(f, indent, &d.comments)?;
                write!(f, "{indent}database {} {}", d.typ, d.name)?;
                write_metadata_lines(f, &inner, &d.metadata)
            }
            Decl::Topic(d) => {
                write_comments(f, indent, &d.comments)?;
                write!(f, "{indent}{}topic {} {}", export_prefix(d.export), d.name, d.event)
            }
            Decl::Subscription(d) => {
                write_comments(f, indent, &d.comments)?;
                write!(f, "{indent}subscription {} {}", d.name, d.topic)
            }
            Decl::TypeAlias(d) => {
                write_comments(f, indent, &d.comments)?;
                write!(f, "{indent}{}typealias {} {}", export_prefix(d.export), d.name, d.typ)?;
                write_metadata_lines(f, &inner, &d.metadata)
            }
            Decl::Enum(d) => {
                write_comments(f, indent, &d.comments)?;
                write!(f, "{indent}{}enum {}", export_prefix(d.export), d.name)?;
                if let Some(typ) = &d.typ {
                    write!(f, ": {typ}")?;
                }
                f.write_str(" {\n")?;
                for variant in &d.variants {
                    write_comments(f, &inner, &variant.comments)?;
                    match &variant.value {
                        Value::Type(t) => writeln!(f, "{inner}{} {t}", variant.name)?,
                        value => writeln!(f, "{inner}{} = {value}", variant.name)?,
                    }
                }
                write!(f, "{indent}}}")
            }
            Decl::Data(d) => {
                write_comments(f, indent, &d.comments)?;
                write!(f, "{indent}{}data {}", export_prefix(d.export), d.name)?;
                if !d.type_parameters.is_empty() {
                    write!(f, "<{}>", d.type_parameters.join(", "))?;
                }
                f.write_str(" {\n")?;
                for field in &d.fields {
                    write_comments(f, &inner, &field.comments)?;
                    write!(f, "{inner}{} {}", field.name, field.typ)?;
                    for m in &field.metadata {
                        write!(f, " {m}")?;
                    }
                    f.write_char('\n')?;
                }
                write!(f, "{indent}}}")?;
                write_metadata_lines(f, &inner, &d.metadata)
            }
            Decl::Verb(d) => {
                write_comments(f, indent, &d.comments)?;
                write!(
                    f,
                    "{indent}{}verb {}({}) {}",
                    export_prefix(d.export),
                    d.name,
                    d.request,
                    d.response
                )?;
                write_metadata_lines(f, &inner, &d.metadata)
            }
        }
    }
}

impl Display for Decl {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Indented(self, ""))
    }
}

fn is_multiline(decl: &Decl) -> bool {
    !decl.metadata().is_empty() || matches!(decl, Decl::Data(_) | Decl::Enum(_))
}

impl Display for Module {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write_comments(f, "", &self.comments)?;
        if self.builtin {
            f.write_str("builtin ")?;
        }
        writeln!(f, "module {} {{", self.name)?;
        let mut previous: Option<&Decl> = None;
        for decl in &self.decls {
            if let Some(prev) = previous {
                if is_multiline(prev) || is_multiline(decl) || prev.priority() != decl.priority() {
                    f.write_char('\n')?;
                }
            }
            writeln!(f, "{}", Indented(decl, "  "))?;
            previous = Some(decl);
        }
        f.write_char('}')
    }
}

impl Display for Schema {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for (i, module) in self.modules.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            writeln!(f, "{module}")?;
        }
        Ok(())
    }
}
