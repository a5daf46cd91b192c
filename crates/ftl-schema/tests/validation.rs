//! Validation across modules, as a deployment sees it.

use ftl_schema::*;

const TIME: &str = r#"
module time {
  export data TimeResponse {
    time Time
  }

  export verb time(Unit) time.TimeResponse
}
"#;

fn current_schema() -> Schema {
    parse_string("time.ftl", TIME).unwrap()
}

#[test]
fn new_module_resolves_against_current_schema() {
    let module = parse_module(
        "echo.ftl",
        r#"
module echo {
  export data EchoResponse {
    message String
  }

  export verb echo(Unit) echo.EchoResponse
    +calls time.time
}
"#,
    )
    .unwrap();
    let validated = validate_module_in_schema(&current_schema(), &module).unwrap();
    assert_eq!(validated.name, "echo");
    assert_eq!(validated.imports(), ["time"]);
    assert_eq!(
        validated.callable_modules().into_iter().collect::<Vec<_>>(),
        ["time"]
    );
}

#[test]
fn unknown_module_reference_is_refused() {
    let module = parse_module(
        "echo.ftl",
        r#"
module echo {
  export verb echo(Unit) String
    +calls missing.ref
}
"#,
    )
    .unwrap();
    let err = validate_module_in_schema(&current_schema(), &module).unwrap_err();
    assert!(
        err.to_string()
            .contains("unknown reference \"missing.ref\", is the type annotated and exported?"),
        "{err}"
    );
}

#[test]
fn errors_are_collected_and_sorted() {
    let schema = parse_schema(
        "",
        r#"
module one {
  verb b(Unit) Unit
    +calls nope.x

  verb a(Unit) Unit
    +calls zip.y
    +cron 1d
}
"#,
    )
    .unwrap();
    let messages = validate_schema(&schema).unwrap_err().messages();
    assert_eq!(messages.len(), 3);
    assert!(messages[0].starts_with("4:12: unknown reference \"nope.x\""));
    assert!(messages[1].starts_with("7:12: unknown reference \"zip.y\""));
    assert!(messages[2].starts_with("8:5: verb a: invalid cron expression \"1d\""));
}

#[test]
fn duplicate_ingress_routes_across_modules() {
    let schema = parse_schema(
        "",
        r#"
module a {
  export verb get(HttpRequest<Unit, Unit, Unit>) HttpResponse<String, Unit>
    +ingress http GET /items
}

module b {
  export verb list(HttpRequest<Unit, Unit, Unit>) HttpResponse<String, Unit>
    +ingress http GET /items
}
"#,
    )
    .unwrap();
    let messages = validate_schema(&schema).unwrap_err().messages();
    assert_eq!(messages.len(), 1);
    assert!(
        messages[0].starts_with("9:5: duplicate http ingress GET /items for 9:5:\"list\" and 4:5:\"get\""),
        "{}",
        messages[0]
    );
}

#[test]
fn normalised_schema_survives_a_text_round_trip() {
    let schema = parse_string(
        "",
        r#"
module shop {
  export verb place(HttpRequest<shop.Order, Unit, Unit>) HttpResponse<shop.Order, String>
    +ingress http POST /orders
    +publish orders

  export topic orders shop.Order

  export data Order {
    id Int
  }

  subscription audit shop.orders

  verb audit(shop.Order) Unit
    +retry 3 1s 1m
    +subscribe audit from=latest
}
"#,
    )
    .unwrap();
    let text = schema.to_string();
    let reparsed = parse_string("", &text).unwrap();
    assert_eq!(reparsed, schema);

    let shop = schema.module("shop").unwrap();
    let kinds: Vec<_> = shop.decls.iter().map(Decl::kind_name).collect();
    assert_eq!(kinds, ["topic", "subscription", "data", "verb", "verb"]);
    let audit = shop.verb("audit").unwrap();
    assert!(matches!(audit.metadata[0], Metadata::Subscriber(_)));
    let params = audit.retry().unwrap().retry_params().unwrap();
    assert_eq!(params.count, 3);
}
