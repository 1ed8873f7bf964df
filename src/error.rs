use crate::types::QueueId;

pub type Result<T> = std::result::Result<T, WeftError>;

/// External failures surfaced to callers of the orchestrator's entry points.
///
/// These originate in collaborators (transport, driver) and leave the
/// hazard/credit/graph state untouched: detection happens before
/// `finalize_iteration` commits any bookkeeping. Internal inconsistencies
/// are never represented here; those are contract violations and go
/// through [`contract_violation`] instead.
#[derive(Debug, thiserror::Error)]
pub enum WeftError {
    #[error("remote peer {rank} unreachable via {transport}")]
    PeerUnreachable { rank: u32, transport: &'static str },

    #[error("transport resource exhausted on queue {queue}: {resource}")]
    TransportExhausted { queue: QueueId, resource: String },

    #[error("network port {port} is down")]
    PortDown { port: u8 },

    #[error("engine {engine} rejected batch submission: {reason}")]
    SubmitRejected { engine: &'static str, reason: String },

    #[error("no usable {fabric} ports discovered")]
    NoUsablePorts { fabric: &'static str },

    #[error("completion ring full: {capacity} records outstanding")]
    CompletionRingFull { capacity: usize },

    #[error("queue {queue} is shutting down")]
    QueueShutdown { queue: QueueId },
}

/// Report an unrecoverable contract violation and abort.
///
/// Per the fail-fast policy, an internal inconsistency (counter
/// monotonicity broken, credit pool exhausted beyond planned capacity,
/// graph finalized with dangling waits) means hardware engines may
/// already be mid-flight on wrong assumptions; there is no safe retry.
/// The caller supplies a diagnostic dump of its bookkeeping so a stuck
/// queue can be debugged post-mortem.
#[cold]
pub(crate) fn contract_violation(component: &str, detail: &str, dump: &str) -> ! {
    tracing::error!(
        component,
        detail,
        dump,
        "fatal scheduling contract violation"
    );
    panic!("weft contract violation in {component}: {detail}");
}

/// Diagnostic state snapshot attached to contract-violation dumps.
///
/// Implemented by every stateful core component so the orchestrator can
/// assemble a full picture (live counter vs. every recorded target) when
/// any one of them trips.
pub(crate) trait Diagnostics {
    fn diagnostics(&self, out: &mut String);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = WeftError::PeerUnreachable {
            rank: 7,
            transport: "scaleout",
        };
        assert_eq!(e.to_string(), "remote peer 7 unreachable via scaleout");
    }

    #[test]
    fn test_submit_rejected_display() {
        let e = WeftError::SubmitRejected {
            engine: "scaleup",
            reason: "queue full".into(),
        };
        assert!(e.to_string().contains("queue full"));
    }

    #[test]
    fn test_all_variants_display() {
        let errors: Vec<WeftError> = vec![
            WeftError::PeerUnreachable {
                rank: 0,
                transport: "scaleout",
            },
            WeftError::TransportExhausted {
                queue: 1,
                resource: "wqe".into(),
            },
            WeftError::PortDown { port: 3 },
            WeftError::SubmitRejected {
                engine: "reduction",
                reason: "x".into(),
            },
            WeftError::NoUsablePorts { fabric: "scaleup" },
            WeftError::CompletionRingFull { capacity: 64 },
            WeftError::QueueShutdown { queue: 2 },
        ];
        for e in &errors {
            assert!(!e.to_string().is_empty(), "empty display for {e:?}");
        }
    }

    #[test]
    #[should_panic(expected = "weft contract violation")]
    fn test_contract_violation_panics() {
        contract_violation("test", "induced", "state: none");
    }
}
