//! Sequence manager interface (external collaborator, out of scope per
//! spec.md §1). Cleanup (§4.3.5) dispatches into this trait; the GTM core
//! only needs to hand it opaque references and call the right method for
//! the transaction's outcome.

/// An opaque reference to a sequence, as handed to the GTM by whatever
/// layer tracks `created_seqs`/`dropped_seqs`/`altered_seqs`. The GTM core
/// never interprets this value, only threads it through to the sequence
/// manager.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SeqRef(pub String);

impl From<&str> for SeqRef {
    fn from(value: &str) -> Self {
        SeqRef(value.to_string())
    }
}

impl From<String> for SeqRef {
    fn from(value: String) -> Self {
        SeqRef(value)
    }
}

/// Invoked from cleanup after the table lock has already been released
/// (see DESIGN.md for why). Implementations must be safe to call from
/// any worker thread.
pub trait SequenceManager: Send + Sync {
    /// Abort cleanup: permanently drop sequences created by the aborting
    /// transaction.
    fn drop_sequences(&self, seqs: &[SeqRef]);

    /// Abort cleanup: undo a DROP SEQUENCE performed by the aborting
    /// transaction.
    fn restore_dropped_sequences(&self, seqs: &[SeqRef]);

    /// Abort cleanup: undo an ALTER SEQUENCE performed by the aborting
    /// transaction (restore the pre-alter copy).
    fn restore_altered_sequences(&self, seqs: &[SeqRef]);

    /// Commit cleanup: permanently remove sequences dropped by the
    /// committing transaction.
    fn commit_dropped_sequences(&self, seqs: &[SeqRef]);

    /// Commit cleanup: permanently remove the pre-alter copy of sequences
    /// altered by the committing transaction (the altered copy stays).
    fn commit_altered_sequences(&self, seqs: &[SeqRef]);
}

/// Default sequence manager for standalone operation and tests: the GTM
/// core runs without a real sequence layer attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSequenceManager;

impl SequenceManager for NoopSequenceManager {
    fn drop_sequences(&self, seqs: &[SeqRef]) {
        for seq in seqs {
            tracing::debug!(sequence = %seq.0, "drop_sequences (noop)");
        }
    }

    fn restore_dropped_sequences(&self, seqs: &[SeqRef]) {
        for seq in seqs {
            tracing::debug!(sequence = %seq.0, "restore_dropped_sequences (noop)");
        }
    }

    fn restore_altered_sequences(&self, seqs: &[SeqRef]) {
        for seq in seqs {
            tracing::debug!(sequence = %seq.0, "restore_altered_sequences (noop)");
        }
    }

    fn commit_dropped_sequences(&self, seqs: &[SeqRef]) {
        for seq in seqs {
            tracing::debug!(sequence = %seq.0, "commit_dropped_sequences (noop)");
        }
    }

    fn commit_altered_sequences(&self, seqs: &[SeqRef]) {
        for seq in seqs {
            tracing::debug!(sequence = %seq.0, "commit_altered_sequences (noop)");
        }
    }
}
