//! Typed ID definitions.

use crate::define_id;

define_id!(
    /// Identifies a registered gateway route.
    RouteId,
    "rt"
);

define_id!(
    /// Identifies a single inbound request, echoed in `x-request-id`.
    RequestId,
    "req"
);
