//! Declarative routing engine exposing named backend actions over REST and GraphQL.
//!
//! Actions are addressed by dotted names (`iam.user.get`) and annotated with mapping
//! configuration: REST aliases, GraphQL resolvers, guards and event subscriptions. The
//! [`Gateway`] interprets those mappings at request time to compute call parameters,
//! authorize the call, coalesce batched resolutions and shape the response. The backend
//! transport itself is supplied by the embedder through [`ActionInvoker`].

#![warn(unreachable_pub)]

pub mod batching;
pub mod configuration;
pub mod context;
pub mod error;
pub mod gateway;
pub mod glob;
pub mod graphql;
pub mod guard;
pub mod invoke;
pub mod json_ext;
pub mod params;
pub mod registry;
pub mod response;
pub mod subscription;

pub use configuration::Configuration;
pub use context::RequestContext;
pub use error::GatewayError;
pub use gateway::FieldRequest;
pub use gateway::Gateway;
pub use invoke::ActionInvoker;
pub use invoke::ActionResponse;
pub use registry::Callbacks;
pub use registry::MappingRegistry;

#[cfg(test)]
pub(crate) mod test_utils;
