use std::borrow::Cow;

use thiserror::Error;

pub mod agent;
pub mod connector;
pub mod labels;
pub mod secret;

#[derive(Debug, Error)]
pub enum ResourceGenerationError {
    #[error("Provided dependent resource is missing a name!")]
    DependentMissingMetadataName,
    #[error("Provided dependent resource is missing required data ({})!", .0)]
    DependentMissingData(Cow<'static, str>),
    #[error("Provided dependent resource contains an invalid value ({})!", .0)]
    DependentInvalidData(Cow<'static, str>),
    #[error("Couldn't encode resource payload! Reason: {}", .0)]
    PayloadEncoding(String),
}
