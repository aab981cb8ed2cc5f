//! Stream and consumer naming.

use pirepsync_core::TenantId;

const STREAM_PREFIX: &str = "pirep:sync:";

/// Fixed consumer group shared by every tenant stream.
pub const CONSUMER_GROUP: &str = "pirep-processors";

/// `pirep:sync:{tenant}`
pub fn stream_name(tenant_id: TenantId) -> String {
    format!("{STREAM_PREFIX}{tenant_id}")
}

/// Inverse of [`stream_name`].
pub fn tenant_from_stream(stream: &str) -> Option<TenantId> {
    stream.strip_prefix(STREAM_PREFIX)?.parse().ok()
}

/// `{worker_prefix}-va-{tenant_prefix}-worker-{index}`
pub fn worker_consumer_name(worker_prefix: &str, tenant_id: TenantId, index: usize) -> String {
    format!("{worker_prefix}-va-{}-worker-{index}", tenant_id.prefix())
}

/// `{worker_prefix}-claimer`
pub fn claimer_consumer_name(worker_prefix: &str) -> String {
    format!("{worker_prefix}-claimer")
}
