//! Ambient HTTP middleware: request tracking, header propagation, masking.
//!
//! Authentication-specific middleware (token verification, revocation) lives
//! at the crate root next to the components they front ([`crate::token`],
//! [`crate::revocation`]) rather than here, since they are core domain
//! components rather than generic HTTP plumbing.

pub mod request_tracking;

pub use request_tracking::{
    request_id_layer, request_id_propagation_layer, sensitive_headers_layer,
    RequestTrackingConfig, PROPAGATE_HEADERS, SENSITIVE_HEADERS,
};
