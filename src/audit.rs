use crate::model::Entry;

/// Sink for permission-decision audit events.
///
/// The granting strategy hands every non-administrative decision here; the
/// sink emits only when the deciding ACE opted in through its audit flags.
pub trait AuditLogger: Send + Sync {
    fn log_if_needed(&self, granting: bool, ace: &Entry);
}

/// Default sink emitting structured tracing events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditLogger;

impl AuditLogger for TracingAuditLogger {
    fn log_if_needed(&self, granting: bool, ace: &Entry) {
        if granting && !ace.is_audit_success() {
            return;
        }
        if !granting && !ace.is_audit_failure() {
            return;
        }
        tracing::info!(
            ace_id = ?ace.id(),
            sid = %ace.security_identity(),
            mask = ace.mask(),
            granting,
            "acl decision"
        );
    }
}
