mod request;
mod result;

pub use request::{
    GenerationKind, GenerationRequest, ReferenceMedia, PARAM_ASPECT_RATIO, PARAM_DURATION,
    PARAM_IMAGE_SIZE,
};
pub use result::{Failure, FailureKind, GenerationOutput, ImageBytes, JobResult, VideoArtifact};
