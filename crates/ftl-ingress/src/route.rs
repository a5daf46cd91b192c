//! Matching HTTP requests to ingress verbs.

use std::collections::BTreeMap;

use ftl_core::RefKey;
use ftl_schema::{IngressPathComponent, Schema};
use percent_encoding::percent_decode_str;

/// An ingress verb of an active deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressRoute {
    pub verb: RefKey,
    pub method: String,
    pub path: Vec<IngressPathComponent>,
}

impl IngressRoute {
    /// Match `path` segment by segment. `{name}` components match any one
    /// segment and are returned, decoded, as path parameters.
    pub fn matches(&self, path: &str) -> Option<BTreeMap<String, String>> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        if segments.len() != self.path.len() {
            return None;
        }
        let mut parameters = BTreeMap::new();
        for (component, segment) in self.path.iter().zip(segments) {
            let segment = percent_decode_str(segment).decode_utf8_lossy();
            match component {
                IngressPathComponent::Literal(literal) if *literal == segment => {}
                IngressPathComponent::Literal(_) => return None,
                IngressPathComponent::Parameter(name) => {
                    parameters.insert(name.clone(), segment.into_owned());
                }
            }
        }
        Some(parameters)
    }

    fn literals(&self) -> usize {
        self.path
            .iter()
            .filter(|c| matches!(c, IngressPathComponent::Literal(_)))
            .count()
    }
}

/// The ingress routes of a schema.
#[derive(Debug, Clone, Default)]
pub struct IngressTable {
    routes: Vec<IngressRoute>,
}

impl IngressTable {
    pub fn from_schema(schema: &Schema) -> Self {
        let routes = schema
            .modules
            .iter()
            .filter(|module| !module.builtin)
            .flat_map(|module| {
                module.verbs().filter_map(|verb| {
                    let ingress = verb.ingress().filter(|i| i.typ == "http")?;
                    Some(IngressRoute {
                        verb: RefKey::new(&module.name, &verb.name),
                        method: ingress.method.clone(),
                        path: ingress.path.clone(),
                    })
                })
            })
            .collect();
        Self { routes }
    }

    /// The route for a request and its path parameters. When several
    /// templates match, the one with the most literal segments wins.
    pub fn lookup(&self, method: &str, path: &str) -> Option<(&IngressRoute, BTreeMap<String, String>)> {
        self.routes
            .iter()
            .filter(|route| route.method == method)
            .filter_map(|route| route.matches(path).map(|params| (route, params)))
            .max_by_key(|(route, _)| route.literals())
    }

    pub fn routes(&self) -> &[IngressRoute] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
