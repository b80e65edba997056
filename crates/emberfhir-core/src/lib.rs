//! Core building blocks shared by every EmberFHIR crate: the opaque
//! resource tree, timestamps, identifiers, references, operation
//! outcomes, wire-codec traits and the path-expression engine.

pub mod codec;
pub mod context;
pub mod error;
pub mod fhir;
pub mod id;
pub mod outcome;
pub mod path;
pub mod reference;
pub mod resource;
pub mod time;

pub use codec::{WireCodec, WireFormat};
pub use context::{ElementResolver, EvalContext, TerminologyService};
pub use error::{CoreError, Result};
pub use fhir::{FhirVersion, Interaction};
pub use outcome::{IssueSeverity, OperationOutcome, OperationResponse, StoreStatus, weak_etag};
pub use path::PathExpression;
pub use reference::ResourceReference;
pub use resource::Resource;
pub use time::{FhirInstant, now_utc};
