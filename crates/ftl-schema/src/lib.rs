//! FTL schema: the model, its text format, validation, cron and retry
//! policies, and JSON payload checking.
//!
//! ```text
//! module echo {
//!   export data EchoRequest {
//!     name String?
//!   }
//!
//!   export verb echo(echo.EchoRequest) Unit
//!     +calls time.time
//! }
//! ```

pub mod builtins;
pub mod cron;
pub mod error;
pub mod jsonvalidate;
pub mod model;
mod monomorphise;
pub mod parser;
mod print;
pub mod retry;
pub mod validate;

pub use builtins::{BUILTIN_MODULE, builtins, builtins_schema};
pub use cron::{CronError, CronPattern};
pub use error::{SchemaError, SchemaErrors, SchemaResult};
pub use jsonvalidate::{PayloadError, validate_json_value, validate_request_body};
pub use model::*;
pub use parser::{parse_module, parse_schema};
pub use retry::RetryParams;
pub use validate::{validate_module, validate_module_in_schema, validate_schema};

/// Parse and validate a schema.
pub fn parse_string(filename: &str, src: &str) -> SchemaResult<Schema> {
    validate_schema(&parse_schema(filename, src)?)
}

/// Parse and validate a single module, with only the builtins in scope.
pub fn parse_module_string(filename: &str, src: &str) -> SchemaResult<Module> {
    validate_module(&parse_module(filename, src)?)
}
