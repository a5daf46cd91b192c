//! ftl-core: shared building blocks for the FTL control plane.
//!
//! Every other crate in the workspace depends on this one for:
//! - typed, textually stable entity keys ([`keys`])
//! - content addresses for artefacts ([`digest`])
//! - the wall-clock seam used by reapers and schedulers ([`clock`])
//! - boundary error codes ([`code`])
//! - daemon configuration loaded from TOML and the environment ([`config`])

pub mod clock;
pub mod code;
pub mod config;
pub mod digest;
pub mod keys;

pub use clock::{Clock, ManualClock, SystemClock};
pub use code::{Code, ErrorCode};
pub use config::{ConfigError, ControllerConfig, StoreLocation};
pub use digest::{Digest, DigestError};
pub use keys::*;
