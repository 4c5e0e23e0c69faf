use std::borrow::Cow;

use fabedge_core::cert::CertError;
use fabedge_core::resources::ResourceGenerationError;
use thiserror::Error;

use crate::allocator::AllocatorError;

pub mod agent;
pub mod community;
pub mod connector;
pub mod context;
pub mod ipam_block;
pub mod node;

pub const OPERATOR_FIELD_MANAGER: &str = "fabedge-operator";

#[derive(Debug, Error)]
pub enum ReconcilerError {
    #[error("Object is missing metadata!")]
    MissingObjectMetadata,
    #[error("'{}' resource is missing required data!", .0)]
    MissingObjectData(Cow<'static, str>),
    #[error("Couldn't reach the cluster API! Reason: {}", .0)]
    KubeApiError(#[from] kube::Error),
    #[error("Couldn't generate a resource! Reason: {}", .0)]
    ResourceGenerationError(#[from] ResourceGenerationError),
    #[error("Certificate handling failed! Reason: {}", .0)]
    CertError(#[from] CertError),
    #[error("Pod CIDR allocation failed! Reason: {}", .0)]
    AllocatorError(#[from] AllocatorError),
}
