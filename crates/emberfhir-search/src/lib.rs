//! Query parsing and search testing.
//!
//! [`query::ParsedQuery`] turns a raw query string into typed parameters,
//! [`tester`] decides whether a resource tree matches them, and
//! [`registry::SearchParamRegistry`] holds the per-type parameter
//! definitions the two share.

pub mod cache;
pub mod error;
pub mod include;
pub mod parameters;
pub mod query;
pub mod registry;
pub mod terminology;
pub mod tester;

pub use cache::PathCache;
pub use error::SearchError;
pub use include::IncludeDirective;
pub use parameters::{
    CompositeComponent, ParsedSearchParameter, ParsedValue, SearchComparator, SearchModifier,
    SearchParamDef, SearchParamType,
};
pub use query::{ParsedQuery, ResultParameters, SortKey, SummaryMode, TotalMode};
pub use registry::SearchParamRegistry;
pub use terminology::ValueSetIndex;
pub use tester::{SearchContext, matches};
