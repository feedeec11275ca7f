use crate::model::{HOUR_MS, Ms};

pub const MAX_NAME_LEN: usize = 255;
pub const MAX_CONTACT_LEN: usize = 255;
pub const MAX_REMARKS_LEN: usize = 4096;
pub const MAX_CREDENTIAL_LEN: usize = 128;

pub const MAX_RESOURCES_PER_TENANT: usize = 10_000;
pub const MAX_RESERVATIONS_PER_RESOURCE: usize = 100_000;

pub const MAX_TENANTS: usize = 64;
pub const MAX_TENANT_NAME_LEN: usize = 64;

/// Default ceiling on a single reservation, also the collision pruning window.
pub const DEFAULT_MAX_SPAN_MS: Ms = 24 * HOUR_MS;

/// 1970-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 9999-12-31T23:59:59.999Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_999;
