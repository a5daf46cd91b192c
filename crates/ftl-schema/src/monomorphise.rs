//! Substitution of type arguments into generic data structures.

use crate::model::{Data, Decl, Ref, Schema, Type};

impl Data {
    /// Substitute `args` for this structure's type parameters.
    pub fn monomorphise(&self, args: &[Type]) -> Result<Data, String> {
        if args.len() != self.type_parameters.len() {
            return Err(format!(
                "expected {} type arguments, got {}",
                self.type_parameters.len(),
                args.len()
            ));
        }
        let mut data = self.clone();
        data.type_parameters.clear();
        for field in &mut data.fields {
            field.typ = substitute(&field.typ, &self.type_parameters, args);
        }
        Ok(data)
    }
}

impl Schema {
    /// Resolve a reference to a data structure with its type arguments applied.
    /// Returns `None` when the reference does not name a data structure.
    pub fn resolve_data(&self, r: &Ref) -> Option<Result<Data, String>> {
        let module = self.module(&r.module)?;
        module.decls.iter().find_map(|d| match d {
            Decl::Data(data) if data.name == r.name => Some(data.monomorphise(&r.type_parameters)),
            _ => None,
        })
    }
}

fn substitute(typ: &Type, params: &[String], args: &[Type]) -> Type {
    match typ {
        Type::Ref(r) if r.module.is_empty() && r.type_parameters.is_empty() => params
            .iter()
            .position(|p| *p == r.name)
            .map_or_else(|| typ.clone(), |i| args[i].clone()),
        Type::Ref(r) => Type::Ref(Ref {
            type_parameters: r
                .type_parameters
                .iter()
                .map(|t| substitute(t, params, args))
                .collect(),
            ..r.clone()
        }),
        Type::Array { element } => Type::array(substitute(element, params, args)),
        Type::Map { key, value } => {
            Type::map(substitute(key, params, args), substitute(value, params, args))
        }
        Type::Optional { inner } => Type::optional(substitute(inner, params, args)),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtins::builtins_schema;

    #[test]
    fn http_request_takes_body_path_and_query() {
        let schema = builtins_schema();
        let mut r = Ref::new("builtin", "HttpRequest");
        r.type_parameters = vec![Type::String, Type::Unit, Type::map(Type::String, Type::String)];
        let data = schema.resolve_data(&r).unwrap().unwrap();
        assert!(data.type_parameters.is_empty());
        assert_eq!(data.field("body").unwrap().typ, Type::String);
        assert_eq!(data.field("pathParameters").unwrap().typ, Type::Unit);
        assert_eq!(
            data.field("query").unwrap().typ,
            Type::map(Type::String, Type::String)
        );
    }

    #[test]
    fn optional_fields_keep_their_wrapper() {
        let schema = builtins_schema();
        let mut r = Ref::new("builtin", "HttpResponse");
        r.type_parameters = vec![Type::Int, Type::String];
        let data = schema.resolve_data(&r).unwrap().unwrap();
        assert_eq!(data.field("body").unwrap().typ, Type::optional(Type::Int));
    }

    #[test]
    fn argument_count_must_match() {
        let schema = builtins_schema();
        let r = Ref::new("builtin", "FailedEvent");
        assert_eq!(
            schema.resolve_data(&r).unwrap().unwrap_err(),
            "expected 1 type arguments, got 0"
        );
        assert!(schema.resolve_data(&Ref::new("builtin", "Missing")).is_none());
    }
}
