//! Error types for the ESXi core.

use std::fmt;

use thiserror::Error;

use crate::types::{OperationKind, VmId};

/// Classification of a failure reported by a [`crate::HostTransport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Host unreachable or connection dropped.
    Connection,
    /// Login refused or session expired.
    Authentication,
    /// The host does not know the referenced resource.
    NotFound,
    /// The host answered and refused the request.
    Rejected(u16),
    /// No answer within the transport's deadline.
    Timeout,
    /// The call was cancelled before it completed.
    Cancelled,
    /// The host answered with something that could not be parsed.
    Protocol,
    /// The call was accepted but its effect could not be observed.
    Unconfirmed,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportErrorKind::Connection => f.write_str("connection"),
            TransportErrorKind::Authentication => f.write_str("authentication"),
            TransportErrorKind::NotFound => f.write_str("not found"),
            TransportErrorKind::Rejected(status) => write!(f, "rejected ({status})"),
            TransportErrorKind::Timeout => f.write_str("timeout"),
            TransportErrorKind::Cancelled => f.write_str("cancelled"),
            TransportErrorKind::Protocol => f.write_str("protocol"),
            TransportErrorKind::Unconfirmed => f.write_str("unconfirmed"),
        }
    }
}

/// Failure returned by a host transport call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Connection, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Authentication, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::NotFound, message)
    }

    pub fn rejected(status: u16, message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Rejected(status), message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Timeout, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Cancelled, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Protocol, message)
    }

    pub fn unconfirmed(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Unconfirmed, message)
    }

    /// The host received the request and definitively refused it.
    ///
    /// An unparseable answer is not a refusal: the host may have acted on
    /// the request before replying.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self.kind,
            TransportErrorKind::Rejected(_) | TransportErrorKind::NotFound
        )
    }
}

/// Errors surfaced by [`crate::EsxiAccount`] and the components behind it.
#[derive(Debug, Error)]
pub enum EsxiError {
    /// Caller input malformed; the host was not contacted.
    #[error("invalid VM spec: {0}")]
    InvalidSpec(String),

    #[error("VM not found: {0}")]
    NotFound(VmId),

    /// A conflicting operation holds the lock for this resource.
    #[error("{kind} already in progress for {key}")]
    AlreadyInProgress { key: String, kind: OperationKind },

    #[error("failed to create VM '{name}': {source}")]
    CreateFailed {
        name: String,
        #[source]
        source: TransportError,
    },

    #[error("failed to destroy VM {vm_id}: {source}")]
    DestroyFailed {
        vm_id: VmId,
        #[source]
        source: TransportError,
    },

    #[error("{operation} failed for VM {vm_id}: {source}")]
    PowerFailed {
        vm_id: VmId,
        operation: OperationKind,
        #[source]
        source: TransportError,
    },

    #[error("failed to reconfigure VM {vm_id}: {source}")]
    ReconfigureFailed {
        vm_id: VmId,
        #[source]
        source: TransportError,
    },

    #[error("{operation} failed for VM {vm_id}: {source}")]
    SnapshotFailed {
        vm_id: VmId,
        operation: OperationKind,
        #[source]
        source: TransportError,
    },

    #[error("snapshot '{name}' not found on VM {vm_id}")]
    SnapshotNotFound { vm_id: VmId, name: String },

    /// Connectivity, authentication or ambiguous outcome; reconcile to learn
    /// the real host state.
    #[error("transport error during {operation}{}: {source}", fmt_target(.vm_id))]
    Transport {
        operation: OperationKind,
        vm_id: Option<VmId>,
        #[source]
        source: TransportError,
    },

    #[error("{operation}{} cancelled", fmt_target(.vm_id))]
    Cancelled {
        operation: OperationKind,
        vm_id: Option<VmId>,
    },

    /// Read before the first successful reconciliation.
    #[error("inventory not initialized, reconcile first")]
    NotInitialized,
}

fn fmt_target(vm_id: &Option<VmId>) -> String {
    vm_id
        .as_ref()
        .map(|id| format!(" of VM {id}"))
        .unwrap_or_default()
}

impl EsxiError {
    /// Map a transport failure of a mutating call onto the caller-facing
    /// taxonomy. `rejected` builds the operation-specific variant used when
    /// the host definitively refused the request.
    pub(crate) fn from_transport(
        operation: OperationKind,
        vm_id: Option<VmId>,
        source: TransportError,
        rejected: impl FnOnce(TransportError) -> EsxiError,
    ) -> Self {
        if source.kind == TransportErrorKind::Cancelled {
            EsxiError::Cancelled { operation, vm_id }
        } else if source.is_rejection() {
            rejected(source)
        } else {
            EsxiError::Transport {
                operation,
                vm_id,
                source,
            }
        }
    }

    /// The VM this error refers to, when there is one.
    pub fn vm_id(&self) -> Option<&VmId> {
        match self {
            EsxiError::NotFound(id)
            | EsxiError::DestroyFailed { vm_id: id, .. }
            | EsxiError::PowerFailed { vm_id: id, .. }
            | EsxiError::ReconfigureFailed { vm_id: id, .. }
            | EsxiError::SnapshotFailed { vm_id: id, .. }
            | EsxiError::SnapshotNotFound { vm_id: id, .. } => Some(id),
            EsxiError::Transport { vm_id, .. } | EsxiError::Cancelled { vm_id, .. } => {
                vm_id.as_ref()
            }
            _ => None,
        }
    }
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, EsxiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_classification() {
        assert!(TransportError::rejected(409, "exists").is_rejection());
        assert!(TransportError::not_found("vm-1").is_rejection());
        assert!(!TransportError::timeout("slow").is_rejection());
        assert!(!TransportError::auth("expired").is_rejection());
        assert!(!TransportError::unconfirmed("lag").is_rejection());
        assert!(!TransportError::protocol("bad body").is_rejection());
    }

    #[test]
    fn test_from_transport_mapping() {
        let id = VmId::from("vm-7");

        let err = EsxiError::from_transport(
            OperationKind::Destroy,
            Some(id.clone()),
            TransportError::rejected(500, "locked"),
            |source| EsxiError::DestroyFailed {
                vm_id: id.clone(),
                source,
            },
        );
        assert!(matches!(err, EsxiError::DestroyFailed { .. }));

        let err = EsxiError::from_transport(
            OperationKind::Destroy,
            Some(id.clone()),
            TransportError::connection("reset"),
            |_| unreachable!(),
        );
        assert!(matches!(err, EsxiError::Transport { .. }));
        assert_eq!(err.vm_id(), Some(&id));

        let err = EsxiError::from_transport(
            OperationKind::Create,
            None,
            TransportError::cancelled("dropped"),
            |_| unreachable!(),
        );
        assert!(matches!(err, EsxiError::Cancelled { vm_id: None, .. }));

        let err = EsxiError::from_transport(
            OperationKind::Create,
            None,
            TransportError::protocol("expected a VM id"),
            |_| unreachable!(),
        );
        assert!(matches!(err, EsxiError::Transport { .. }));
    }

    #[test]
    fn test_display_includes_context() {
        let err = EsxiError::Transport {
            operation: OperationKind::Destroy,
            vm_id: Some(VmId::from("vm-3")),
            source: TransportError::timeout("no answer"),
        };
        assert_eq!(
            err.to_string(),
            "transport error during destroy of VM vm-3: timeout: no answer"
        );

        let err = EsxiError::Cancelled {
            operation: OperationKind::Reconcile,
            vm_id: None,
        };
        assert_eq!(err.to_string(), "reconcile cancelled");
    }
}
