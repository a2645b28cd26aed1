// ABOUTME: Library entry point for table-cloner
// ABOUTME: Exposes the cloner, endpoints, DDL translation and job configuration

pub mod catalog;
pub mod cloner;
pub mod config;
pub mod ddl;
pub mod endpoint;
pub mod error;
pub mod object;
pub mod transfer;
pub mod utils;
pub mod value;

pub use cloner::Cloner;
pub use endpoint::{open_endpoint, Endpoint, EndpointKind};
pub use error::CloneError;
pub use object::{ObjectDescriptor, ObjectOptions, ObjectType};
pub use transfer::{BatchTransfer, TransferStats};
