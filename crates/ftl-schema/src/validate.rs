//! Schema validation and normalisation.
//!
//! Validation always works on a whole schema with the builtin module
//! injected. It checks names, resolves references (setting the module on
//! every unqualified reference it resolves), checks verb metadata and
//! returns a normalised copy with declarations and metadata in canonical
//! order. Validating a normalised schema returns it unchanged.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::LazyLock;

use chrono::{TimeZone, Utc};
use regex::Regex;
use tracing::debug;

use crate::builtins::{BUILTIN_MODULE, builtins};
use crate::cron;
use crate::error::{SchemaError, SchemaErrors, SchemaResult};
use crate::model::*;

static MODULE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("module name regex"));
static DECL_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("decl name regex"));
static TOPIC_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][A-Za-z0-9_]*$").expect("topic name regex"));
static SUBSCRIPTION_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]*$").expect("subscription name regex"));

const BODY_TYPES: &str = "bytes, string, data structure, unit, float, int, bool, map, or array";

/// Validate every module of a schema.
pub fn validate_schema(schema: &Schema) -> SchemaResult<Schema> {
    let modules = schema.modules.iter().filter(|m| !m.builtin).cloned().collect();
    validate(Schema::new(modules), None)
}

/// Validate `module` against the other modules of `schema`, replacing any
/// module of the same name. Returns the normalised module.
pub fn validate_module_in_schema(schema: &Schema, module: &Module) -> SchemaResult<Module> {
    let mut modules: Vec<Module> = schema
        .modules
        .iter()
        .filter(|m| !m.builtin && m.name != module.name)
        .cloned()
        .collect();
    modules.push(module.clone());
    let validated = validate(Schema::new(modules), Some(&module.name))?;
    validated
        .module(&module.name)
        .filter(|m| !m.builtin)
        .cloned()
        .ok_or_else(|| SchemaError::global(format!("module {:?} not found", module.name)).into())
}

/// Validate a module on its own, with only the builtins in scope.
pub fn validate_module(module: &Module) -> SchemaResult<Module> {
    validate_module_in_schema(&Schema::default(), module)
}

fn validate(mut schema: Schema, target: Option<&str>) -> SchemaResult<Schema> {
    schema.modules.insert(0, builtins().clone());
    let in_scope = |m: &Module| !m.builtin && target.is_none_or(|t| t == m.name);
    let mut errs = Vec::new();

    let mut seen = HashSet::new();
    for module in &schema.modules {
        if !seen.insert(module.name.as_str()) {
            errs.push(SchemaError::new(
                &module.pos,
                format!("duplicate module {:?}", module.name),
            ));
        }
    }
    if let Some(cycle) = dependency_cycle(&schema) {
        errs.push(SchemaError::global(format!(
            "found cycle in dependencies: {}",
            cycle.join(" -> ")
        )));
    }

    for module in schema.modules.iter_mut().filter(|m| in_scope(m)) {
        normalise_module(module, &mut errs);
    }

    let snapshot = schema.clone();
    for module in schema.modules.iter_mut().filter(|m| in_scope(m)) {
        resolve_module_refs(&snapshot, module, &mut errs);
        sort_metadata_refs(module);
    }

    for module in schema.modules.iter().filter(|m| in_scope(m)) {
        check_module(&schema, module, &mut errs);
    }
    check_ingress_routes(&schema, &mut errs);

    if errs.is_empty() {
        Ok(schema)
    } else {
        let errors = SchemaErrors::new(errs);
        debug!(count = errors.errors().len(), "schema validation failed");
        Err(errors)
    }
}

fn ref_name(r: &Ref) -> String {
    if r.module.is_empty() {
        r.name.clone()
    } else {
        format!("{}.{}", r.module, r.name)
    }
}

fn find_decl<'s>(
    schema: &'s Schema,
    module: &str,
    name: &str,
    pred: impl Fn(&Decl) -> bool,
) -> Option<&'s Decl> {
    schema
        .module(module)?
        .decls
        .iter()
        .find(|d| d.name() == name && pred(d))
}

fn find_verb<'s>(schema: &'s Schema, r: &Ref) -> Option<&'s Verb> {
    match find_decl(schema, &r.module, &r.name, |d| matches!(d, Decl::Verb(_)))? {
        Decl::Verb(v) => Some(v),
        _ => None,
    }
}

fn find_type_decl<'s>(schema: &'s Schema, r: &Ref) -> Option<&'s Decl> {
    find_decl(schema, &r.module, &r.name, |d| {
        matches!(d, Decl::Data(_) | Decl::Enum(_) | Decl::TypeAlias(_))
    })
}

// ── Dependencies ───────────────────────────────────────────────────

#[derive(Clone, Copy, PartialEq, Eq)]
enum Visit {
    Exploring,
    Done,
}

fn dependency_cycle(schema: &Schema) -> Option<Vec<String>> {
    let graph: BTreeMap<&str, Vec<String>> = schema
        .modules
        .iter()
        .map(|m| (m.name.as_str(), m.imports()))
        .collect();
    let mut state = HashMap::new();
    let mut stack = Vec::new();
    for vertex in graph.keys() {
        if !state.contains_key(vertex) {
            if let Some(cycle) = visit(&graph, vertex, &mut state, &mut stack) {
                return Some(cycle);
            }
        }
    }
    None
}

fn visit<'g>(
    graph: &'g BTreeMap<&str, Vec<String>>,
    vertex: &'g str,
    state: &mut HashMap<&'g str, Visit>,
    stack: &mut Vec<&'g str>,
) -> Option<Vec<String>> {
    state.insert(vertex, Visit::Exploring);
    stack.push(vertex);
    for next in graph.get(vertex).into_iter().flatten() {
        let Some((&next, _)) = graph.get_key_value(next.as_str()) else {
            continue;
        };
        match state.get(next) {
            Some(Visit::Exploring) => {
                let start = stack.iter().position(|v| *v == next).unwrap_or(0);
                let mut cycle: Vec<String> = stack[start..].iter().map(|v| v.to_string()).collect();
                cycle.push(next.to_string());
                return Some(cycle);
            }
            Some(Visit::Done) => {}
            None => {
                if let Some(cycle) = visit(graph, next, state, stack) {
                    return Some(cycle);
                }
            }
        }
    }
    stack.pop();
    state.insert(vertex, Visit::Done);
    None
}

// ── Module-local checks and ordering ───────────────────────────────

fn normalise_module(module: &mut Module, errs: &mut Vec<SchemaError>) {
    if !MODULE_NAME.is_match(&module.name) || PRIMITIVES.contains(&module.name.as_str()) {
        errs.push(SchemaError::new(
            &module.pos,
            format!("module name {:?} is invalid", module.name),
        ));
    }
    if module.name == BUILTIN_MODULE {
        errs.push(SchemaError::new(
            &module.pos,
            format!("the {BUILTIN_MODULE:?} module is reserved"),
        ));
    }

    let mut seen: HashMap<(&'static str, String), Position> = HashMap::new();
    for decl in &module.decls {
        let key = (decl.kind_name(), decl.name().to_string());
        if let Some(first) = seen.get(&key) {
            errs.push(SchemaError::new(
                decl.pos(),
                format!(
                    "duplicate {} {:?}, first defined at {first}",
                    decl.kind_name(),
                    decl.name()
                ),
            ));
        } else {
            seen.insert(key, decl.pos().clone());
        }
        check_decl_name(decl, errs);
    }

    let module_name = module.name.clone();
    for decl in &mut module.decls {
        check_local_metadata(decl, errs);
        match decl {
            Decl::Data(d) => d.metadata.sort_by_key(Metadata::priority),
            Decl::Verb(v) => {
                v.metadata.sort_by_key(Metadata::priority);
                for md in &mut v.metadata {
                    if let Metadata::Retry(retry) = md {
                        if let Some(catch) = &mut retry.catch {
                            if catch.module.is_empty() {
                                catch.module = module_name.clone();
                            }
                        }
                    }
                }
            }
            Decl::Database(d) => d.metadata.sort_by_key(Metadata::priority),
            Decl::TypeAlias(d) => d.metadata.sort_by_key(Metadata::priority),
            _ => {}
        }
    }
    module
        .decls
        .sort_by(|a, b| (a.priority(), a.name()).cmp(&(b.priority(), b.name())));
}

fn check_decl_name(decl: &Decl, errs: &mut Vec<SchemaError>) {
    let name = decl.name();
    let kind = decl.kind_name();
    if !DECL_NAME.is_match(name) {
        errs.push(SchemaError::new(decl.pos(), format!("{kind} name {name:?} is invalid")));
        return;
    }
    if PRIMITIVES.contains(&name) {
        errs.push(SchemaError::new(
            decl.pos(),
            format!("{kind} name {name:?} is a reserved word"),
        ));
    }
    match decl {
        Decl::Topic(t) if !TOPIC_NAME.is_match(&t.name) => errs.push(SchemaError::new(
            &t.pos,
            "invalid name: must consist of only letters, numbers and underscores, and start with a lowercase letter.",
        )),
        Decl::Subscription(s) if !SUBSCRIPTION_NAME.is_match(&s.name) => {
            errs.push(SchemaError::new(
                &s.pos,
                "invalid name: must consist of only letters, numbers and underscores, and start with a letter.",
            ))
        }
        _ => {}
    }
}

fn invalid_metadata(md: &Metadata, on: &str) -> SchemaError {
    SchemaError::new(
        md.pos(),
        format!("metadata {:?} is not valid on {on}", md.to_string()),
    )
}

fn check_local_metadata(decl: &Decl, errs: &mut Vec<SchemaError>) {
    match decl {
        Decl::Data(d) => {
            for md in &d.metadata {
                if !matches!(md, Metadata::TypeMap(_)) {
                    errs.push(invalid_metadata(md, "data structures"));
                }
            }
            let mut fields = HashSet::new();
            for field in &d.fields {
                if !fields.insert(field.name.as_str()) {
                    errs.push(SchemaError::new(
                        &field.pos,
                        format!("duplicate field {:?}", field.name),
                    ));
                }
                for md in &field.metadata {
                    if !matches!(md, Metadata::Alias(_)) {
                        errs.push(invalid_metadata(md, "fields"));
                    }
                }
            }
        }
        Decl::TypeAlias(d) => {
            for md in &d.metadata {
                if !matches!(md, Metadata::TypeMap(_)) {
                    errs.push(invalid_metadata(md, "type aliases"));
                }
            }
        }
        Decl::Database(d) => {
            let mut migrations = 0;
            for md in &d.metadata {
                match md {
                    Metadata::SqlMigration(_) => migrations += 1,
                    md => errs.push(invalid_metadata(md, "databases")),
                }
            }
            if migrations > 1 {
                errs.push(SchemaError::new(
                    &d.pos,
                    format!("database {:?} has multiple migration metadata", d.name),
                ));
            }
        }
        Decl::Verb(v) => {
            let mut seen = HashSet::new();
            for md in &v.metadata {
                match md {
                    Metadata::Alias(_) | Metadata::TypeMap(_) | Metadata::SqlMigration(_) => {
                        errs.push(invalid_metadata(md, "verbs"));
                    }
                    Metadata::Ingress(_)
                    | Metadata::CronJob(_)
                    | Metadata::Retry(_)
                    | Metadata::Subscriber(_)
                    | Metadata::Encoding(_) => {
                        if !seen.insert(md.kind_name()) {
                            errs.push(SchemaError::new(
                                md.pos(),
                                format!(
                                    "verb can not have multiple instances of {}",
                                    md.kind_name()
                                ),
                            ));
                        }
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }
}

// ── Reference resolution ───────────────────────────────────────────

fn resolve_module_refs(snapshot: &Schema, module: &mut Module, errs: &mut Vec<SchemaError>) {
    let current = module.name.clone();
    for decl in &mut module.decls {
        let params = decl.type_parameters().to_vec();
        let mut resolve = |r: &mut Ref| resolve_ref(snapshot, &current, &params, r, errs);
        match decl {
            // Catch targets are resolved with the retry policy.
            Decl::Verb(verb) => {
                verb.request.for_each_ref_mut(&mut resolve);
                verb.response.for_each_ref_mut(&mut resolve);
                for md in &mut verb.metadata {
                    if !matches!(md, Metadata::Retry(_)) {
                        md.for_each_ref_mut(&mut resolve);
                    }
                }
            }
            other => other.for_each_ref_mut(&mut resolve),
        }
    }
}

fn resolve_ref(
    schema: &Schema,
    current: &str,
    params: &[String],
    r: &mut Ref,
    errs: &mut Vec<SchemaError>,
) {
    if r.module.is_empty() {
        if params.contains(&r.name) {
            return;
        }
        let local = schema.module(current).is_some_and(|m| m.decl(&r.name).is_some());
        if local {
            r.module = current.to_string();
        } else if builtins().decl(&r.name).is_some() {
            r.module = BUILTIN_MODULE.to_string();
        } else {
            errs.push(unknown_reference(r));
            return;
        }
    }
    let candidates: Vec<&Decl> = schema
        .module(&r.module)
        .map(|m| m.decls.iter().filter(|d| d.name() == r.name).collect())
        .unwrap_or_default();
    let Some(first) = candidates.first() else {
        errs.push(unknown_reference(r));
        return;
    };
    if r.module != current && !candidates.iter().any(|d| d.is_exported()) {
        errs.push(SchemaError::new(
            &r.pos,
            format!("{} {:?} must be exported", first.kind_name(), ref_name(r)),
        ));
    }
    let data = candidates.iter().find_map(|d| match d {
        Decl::Data(data) => Some(data),
        _ => None,
    });
    match data {
        Some(data) if data.type_parameters.len() != r.type_parameters.len() => {
            errs.push(SchemaError::new(
                &r.pos,
                format!(
                    "reference to data structure {} has {} type parameters, but {} were expected",
                    ref_name(r),
                    r.type_parameters.len(),
                    data.type_parameters.len()
                ),
            ));
        }
        None if !r.type_parameters.is_empty() => errs.push(SchemaError::new(
            &r.pos,
            format!(
                "reference to {} {:?} can not have type parameters",
                first.kind_name(),
                ref_name(r)
            ),
        )),
        _ => {}
    }
}

fn unknown_reference(r: &Ref) -> SchemaError {
    SchemaError::new(
        &r.pos,
        format!(
            "unknown reference {:?}, is the type annotated and exported?",
            ref_name(r)
        ),
    )
}

fn sort_metadata_refs(module: &mut Module) {
    for decl in &mut module.decls {
        if let Decl::Verb(verb) = decl {
            for md in &mut verb.metadata {
                if let Metadata::Calls(m)
                | Metadata::Databases(m)
                | Metadata::Secrets(m)
                | Metadata::Config(m)
                | Metadata::Publisher(m) = md
                {
                    m.refs.sort_by(|a, b| (&a.module, &a.name).cmp(&(&b.module, &b.name)));
                }
            }
        }
    }
}

// ── Semantic checks on the resolved schema ─────────────────────────

fn check_module(schema: &Schema, module: &Module, errs: &mut Vec<SchemaError>) {
    for decl in &module.decls {
        match decl {
            Decl::Enum(e) => check_enum(e, errs),
            Decl::Subscription(s) => {
                let is_topic = find_decl(schema, &s.topic.module, &s.topic.name, |d| {
                    matches!(d, Decl::Topic(_))
                })
                .is_some();
                let other = find_decl(schema, &s.topic.module, &s.topic.name, |_| true);
                if let (false, Some(other)) = (is_topic, other) {
                    errs.push(SchemaError::new(
                        &s.pos,
                        format!(
                            "subscription {}: expected topic but found {} {:?}",
                            s.name,
                            other.kind_name(),
                            ref_name(&s.topic)
                        ),
                    ));
                }
            }
            Decl::Verb(v) => check_verb(schema, module, v, errs),
            _ => {}
        }
    }
}

fn check_enum(e: &Enum, errs: &mut Vec<SchemaError>) {
    let mut names = HashSet::new();
    for variant in &e.variants {
        if !names.insert(variant.name.as_str()) {
            errs.push(SchemaError::new(
                &variant.pos,
                format!("duplicate enum variant {:?}", variant.name),
            ));
        }
        match (&e.typ, &variant.value) {
            (Some(Type::Int), Value::Int(_)) | (Some(Type::String), Value::String(_)) => {}
            (Some(typ), value) => errs.push(SchemaError::new(
                &variant.pos,
                format!(
                    "enum variant {:?} of type {typ} cannot have a value of type {:?}",
                    variant.name,
                    value.type_name()
                ),
            )),
            (None, Value::Type(_)) => {}
            (None, value) => errs.push(SchemaError::new(
                &variant.pos,
                format!(
                    "type enum variant {:?} value must be a type, was {}",
                    variant.name,
                    value.type_name()
                ),
            )),
        }
    }
}

fn check_verb(schema: &Schema, module: &Module, verb: &Verb, errs: &mut Vec<SchemaError>) {
    for md in &verb.metadata {
        match md {
            Metadata::Ingress(ingress) => check_ingress(schema, verb, ingress, errs),
            Metadata::CronJob(cron) => check_cron(verb, cron, errs),
            Metadata::Subscriber(sub) => check_subscriber(schema, module, verb, sub, errs),
            Metadata::Retry(retry) => {
                if verb.subscribers().next().is_none() {
                    errs.push(SchemaError::new(
                        &retry.pos,
                        "retries can only be added to subscribers",
                    ));
                } else {
                    check_retry(schema, module, verb, retry, errs);
                }
            }
            Metadata::Encoding(encoding) if encoding.typ != "json" => {
                errs.push(SchemaError::new(
                    &encoding.pos,
                    format!("verb {}: unsupported encoding {:?}", verb.name, encoding.typ),
                ));
            }
            Metadata::Calls(m) => check_ref_kinds(schema, verb, m, "calls", "verb", errs),
            Metadata::Databases(m) => {
                check_ref_kinds(schema, verb, m, "database calls", "database", errs)
            }
            Metadata::Secrets(m) => check_ref_kinds(schema, verb, m, "secrets", "secret", errs),
            Metadata::Config(m) => check_ref_kinds(schema, verb, m, "config", "config", errs),
            Metadata::Publisher(m) => check_ref_kinds(schema, verb, m, "publish", "topic", errs),
            _ => {}
        }
    }
}

fn check_ref_kinds(
    schema: &Schema,
    verb: &Verb,
    md: &MetadataRefs,
    keyword: &str,
    expected: &str,
    errs: &mut Vec<SchemaError>,
) {
    for r in &md.refs {
        let Some(module) = schema.module(&r.module) else {
            continue;
        };
        let named: Vec<&Decl> = module.decls.iter().filter(|d| d.name() == r.name).collect();
        if !named.is_empty() && !named.iter().any(|d| d.kind_name() == expected) {
            errs.push(SchemaError::new(
                &r.pos,
                format!(
                    "verb {}: +{keyword} {} must reference a {expected}, not a {}",
                    verb.name,
                    ref_name(r),
                    named[0].kind_name()
                ),
            ));
        }
    }
}

fn check_cron(verb: &Verb, md: &MetadataCronJob, errs: &mut Vec<SchemaError>) {
    let origin = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).single();
    if let Some(origin) = origin {
        if let Err(e) = cron::validate(&md.cron, origin) {
            errs.push(SchemaError::new(
                &md.pos,
                format!("verb {}: invalid cron expression {:?}: {e}", verb.name, md.cron),
            ));
        }
    }
    if !verb.request.is_unit() {
        errs.push(SchemaError::new(
            &md.pos,
            format!("verb {}: cron job can not have a request type", verb.name),
        ));
    }
    if !verb.response.is_unit() {
        errs.push(SchemaError::new(
            &md.pos,
            format!("verb {}: cron job can not have a response type", verb.name),
        ));
    }
}

fn check_subscriber(
    schema: &Schema,
    module: &Module,
    verb: &Verb,
    md: &MetadataSubscriber,
    errs: &mut Vec<SchemaError>,
) {
    let Some(subscription) = module.subscriptions().find(|s| s.name == md.name) else {
        errs.push(SchemaError::new(
            &md.pos,
            format!("verb {}: could not find subscription {:?}", verb.name, md.name),
        ));
        return;
    };
    let topic = find_decl(schema, &subscription.topic.module, &subscription.topic.name, |d| {
        matches!(d, Decl::Topic(_))
    });
    if let Some(Decl::Topic(topic)) = topic {
        if verb.request != topic.event {
            errs.push(SchemaError::new(
                &md.pos,
                format!(
                    "verb {}: request type {} differs from subscription's event type {}",
                    verb.name, verb.request, topic.event
                ),
            ));
        }
    }
    if !verb.response.is_unit() {
        errs.push(SchemaError::new(
            &md.pos,
            format!(
                "verb {}: must be a sink to subscribe but found response type {}",
                verb.name, verb.response
            ),
        ));
    }
}

fn check_retry(
    schema: &Schema,
    module: &Module,
    verb: &Verb,
    md: &MetadataRetry,
    errs: &mut Vec<SchemaError>,
) {
    let params = match md.retry_params() {
        Ok(params) => params,
        Err(e) => {
            errs.push(SchemaError::new(&md.pos, e));
            return;
        }
    };
    if !md.max_backoff.is_empty() && params.max_backoff < params.min_backoff {
        errs.push(SchemaError::new(
            &md.pos,
            format!(
                "max backoff duration ({}) needs to be at least as long as initial backoff ({})",
                md.max_backoff, md.min_backoff
            ),
        ));
    }
    let Some(catch) = &md.catch else {
        if params.count == 0 && !md.min_backoff.is_empty() {
            errs.push(SchemaError::new(
                &md.pos,
                "can not define a backoff duration when retry count is 0 and no catch is declared",
            ));
        }
        return;
    };
    let Some(catch_verb) = find_verb(schema, catch) else {
        if find_decl(schema, &catch.module, &catch.name, |_| true).is_some() {
            errs.push(SchemaError::new(&catch.pos, "expected catch to be a verb"));
        } else {
            errs.push(SchemaError::new(
                &catch.pos,
                format!("could not resolve catch verb {:?}", ref_name(catch)),
            ));
        }
        return;
    };
    if catch.module != module.name && !catch_verb.export {
        errs.push(SchemaError::new(
            &catch.pos,
            format!("verb {:?} must be exported", ref_name(catch)),
        ));
    }
    let accepted = match &catch_verb.request {
        Type::Ref(r) if r.module == BUILTIN_MODULE && r.name == "CatchRequest" => {
            matches!(r.type_parameters.as_slice(), [t] if *t == verb.request || *t == Type::Any)
        }
        _ => false,
    };
    if !accepted {
        errs.push(SchemaError::new(
            &catch.pos,
            format!(
                "catch verb must have a request type of builtin.CatchRequest<{}> or builtin.CatchRequest<Any>, but found {}",
                verb.request, catch_verb.request
            ),
        ));
    }
    if !catch_verb.response.is_unit() {
        errs.push(SchemaError::new(
            &catch.pos,
            format!(
                "catch verb must not have a response type but found {}",
                catch_verb.response
            ),
        ));
    }
}

// ── Ingress ────────────────────────────────────────────────────────

fn builtin_args<'t>(typ: &'t Type, name: &str) -> Option<&'t [Type]> {
    match typ {
        Type::Ref(r) if r.module == BUILTIN_MODULE && r.name == name => {
            Some(r.type_parameters.as_slice())
        }
        _ => None,
    }
}

fn check_ingress(schema: &Schema, verb: &Verb, md: &MetadataIngress, errs: &mut Vec<SchemaError>) {
    let name = &verb.name;
    let mut err = |message: String| errs.push(SchemaError::new(&md.pos, message));

    match builtin_args(&verb.request, "HttpRequest") {
        Some([body, path, query]) => {
            if md.method == "GET" && !body.is_unit() {
                err(format!(
                    "ingress verb {name}: GET request type {} must have a body of unit not {body}",
                    verb.request
                ));
            } else if !is_body_type(schema, body) {
                err(format!(
                    "ingress verb {name}: request type {} must have a body of {BODY_TYPES} not {body}",
                    verb.request
                ));
            }
            check_path_parameters(schema, name, md, path, &mut err);
            if !is_query_type(schema, query) {
                err(format!(
                    "ingress verb {name}: query type {query} must be a data structure, unit, or map of string to string or [string]"
                ));
            }
        }
        Some(_) => {}
        None => err(format!(
            "ingress verb {name}: request type {} must be builtin.HttpRequest",
            verb.request
        )),
    }
    match builtin_args(&verb.response, "HttpResponse") {
        Some([body, _]) => {
            if !is_body_type(schema, body) {
                err(format!(
                    "ingress verb {name}: response type {} must have a body of {BODY_TYPES} not {body}",
                    verb.response
                ));
            }
        }
        Some(_) => {}
        None => err(format!(
            "ingress verb {name}: response type {} must be builtin.HttpResponse",
            verb.response
        )),
    }
}

fn is_body_type(schema: &Schema, typ: &Type) -> bool {
    match typ {
        Type::Bytes
        | Type::String
        | Type::Unit
        | Type::Float
        | Type::Int
        | Type::Bool
        | Type::Map { .. }
        | Type::Array { .. } => true,
        Type::Optional { inner } => is_body_type(schema, inner),
        Type::Ref(r) => match find_type_decl(schema, r) {
            Some(Decl::Data(_) | Decl::Enum(_)) => true,
            Some(Decl::TypeAlias(alias)) => {
                alias.metadata.iter().any(|m| matches!(m, Metadata::TypeMap(_)))
                    || is_body_type(schema, &alias.typ)
            }
            _ => false,
        },
        Type::Any | Type::Time => false,
    }
}

fn is_query_type(schema: &Schema, typ: &Type) -> bool {
    match typ {
        Type::Unit => true,
        Type::Map { key, value } => {
            **key == Type::String
                && match &**value {
                    Type::String => true,
                    Type::Array { element } => **element == Type::String,
                    _ => false,
                }
        }
        Type::Ref(r) => matches!(find_type_decl(schema, r), Some(Decl::Data(_))),
        _ => false,
    }
}

fn check_path_parameters(
    schema: &Schema,
    verb: &str,
    md: &MetadataIngress,
    typ: &Type,
    err: &mut impl FnMut(String),
) {
    let params: Vec<&str> = md.path_parameters().collect();
    if params.is_empty() {
        if !matches!(typ, Type::Unit | Type::Map { .. }) {
            err(format!(
                "ingress verb {verb}: cannot use path parameter type {typ}, expected Unit or Map as ingress has no path parameters"
            ));
        }
        return;
    }
    match typ {
        Type::Map { key, .. } => {
            if **key != Type::String {
                err(format!(
                    "ingress verb {verb}: path parameter type {typ} must have String keys"
                ));
            }
        }
        Type::String | Type::Int | Type::Float | Type::Bool => {
            if params.len() > 1 {
                for param in &params {
                    err(format!(
                        "ingress verb {verb}: cannot use path parameter {param:?} with request type {typ} as it has multiple path parameters, expected Data or Map type"
                    ));
                }
            }
        }
        Type::Ref(r) => match schema.resolve_data(r) {
            Some(Ok(data)) => {
                for param in &params {
                    if data.field(param).is_none() {
                        err(format!(
                            "ingress verb {verb}: request pathParameter type {typ} does not contain a field corresponding to the parameter {param:?}"
                        ));
                    }
                }
            }
            Some(Err(_)) => {}
            None => err(format!(
                "ingress verb {verb}: path parameter type {typ} must be a data structure, map or scalar"
            )),
        },
        _ => {
            for param in &params {
                err(format!(
                    "ingress verb {verb}: cannot use path parameter {param:?} with request type {typ}, expected String, Int, Float, Bool, Data or Map type"
                ));
            }
        }
    }
}

fn check_ingress_routes(schema: &Schema, errs: &mut Vec<SchemaError>) {
    let mut routes: HashMap<String, (Position, &str)> = HashMap::new();
    for module in schema.modules.iter().filter(|m| !m.builtin) {
        for verb in module.verbs() {
            let Some(ingress) = verb.ingress() else {
                continue;
            };
            let key = format!("{} {}", ingress.typ, ingress.route_key());
            match routes.get(&key) {
                Some((pos, other)) => errs.push(SchemaError::new(
                    &ingress.pos,
                    format!(
                        "duplicate {} ingress {} for {}:{:?} and {}:{:?}",
                        ingress.typ,
                        ingress.route_key(),
                        ingress.pos,
                        verb.name,
                        pos,
                        other
                    ),
                )),
                None => {
                    routes.insert(key, (ingress.pos.clone(), verb.name.as_str()));
                }
            }
        }
    }
}
