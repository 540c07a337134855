//! KluctlDeployment CRD Definitions
//!
//! The `KluctlDeployment` custom resource, its status conditions and the
//! manual request protocol operators use to trigger commands.

pub mod conditions;
pub mod duration;
pub mod kluctl_deployment;
pub mod manual_request;
pub mod references;

pub use conditions::*;
pub use duration::{format_duration, parse_duration, parse_optional_duration, DurationParseError, NEVER};
pub use kluctl_deployment::*;
pub use manual_request::*;
pub use references::*;
