//! Milestone tables, one step enum per operation kind.

use std::fmt;

use serde::Serialize;

/// Long-running operation a client may watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Download,
    Approval,
    SubmitRequest,
}

/// A named, weighted milestone of one operation kind.
///
/// `ALL` is the declared order; weights are relative and need not sum to 100.
pub trait Step: Copy + Eq + fmt::Debug + Send + Sync + 'static {
    const KIND: OperationKind;
    const ALL: &'static [Self];

    fn weight(self) -> u32;
    fn name(self) -> &'static str;

    fn index(self) -> usize {
        Self::ALL
            .iter()
            .position(|step| *step == self)
            .unwrap_or_default()
    }
}

macro_rules! step_table {
    (
        $(#[$meta:meta])*
        $name:ident: $kind:expr => {
            $($variant:ident = ($label:literal, $weight:literal)),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl Step for $name {
            const KIND: OperationKind = $kind;
            const ALL: &'static [Self] = &[$($name::$variant),+];

            fn weight(self) -> u32 {
                match self {
                    $($name::$variant => $weight),+
                }
            }

            fn name(self) -> &'static str {
                match self {
                    $($name::$variant => $label),+
                }
            }
        }
    };
}

step_table! {
    /// Milestones of submitting a new requisition.
    SubmitStep: OperationKind::SubmitRequest => {
        FormReceived = ("form_received", 2),
        RequesterResolved = ("requester_resolved", 3),
        HeaderValidated = ("header_validated", 4),
        LineItemsValidated = ("line_items_validated", 6),
        FundCodesChecked = ("fund_codes_checked", 4),
        VendorChecked = ("vendor_checked", 3),
        TotalsComputed = ("totals_computed", 3),
        HeaderPersisted = ("header_persisted", 6),
        LineItemsPersisted = ("line_items_persisted", 8),
        AttachmentsStored = ("attachments_stored", 5),
        PdfLayoutPrepared = ("pdf_layout_prepared", 6),
        PdfRendered = ("pdf_rendered", 12),
        PdfStored = ("pdf_stored", 4),
        SearchIndexed = ("search_indexed", 4),
        ReviewersResolved = ("reviewers_resolved", 4),
        ReviewerNotified = ("reviewer_notified", 6),
        RequesterNotified = ("requester_notified", 4),
        StatusFlagsUpdated = ("status_flags_updated", 2),
        AuditLogged = ("audit_logged", 2),
        Finished = ("finished", 2),
    }
}

step_table! {
    /// Milestones of one routing call through the review chain.
    ApprovalStep: OperationKind::Approval => {
        RequestReceived = ("request_received", 3),
        IntegrityChecked = ("integrity_checked", 3),
        ActorResolved = ("actor_resolved", 5),
        FirstLineEvaluated = ("first_line_evaluated", 5),
        FirstLineRecorded = ("first_line_recorded", 8),
        FirstLineNotified = ("first_line_notified", 4),
        SecondLineEvaluated = ("second_line_evaluated", 5),
        SecondLineRecorded = ("second_line_recorded", 8),
        SecondLineNotified = ("second_line_notified", 4),
        FinalLookedUp = ("final_looked_up", 5),
        FinalEvaluated = ("final_evaluated", 5),
        FinalRecorded = ("final_recorded", 8),
        FinalNotified = ("final_notified", 4),
        StatusCommitted = ("status_committed", 8),
        StatusFlagsUpdated = ("status_flags_updated", 4),
        OutboxQueued = ("outbox_queued", 3),
        NotificationsDispatched = ("notifications_dispatched", 6),
        AuditLogged = ("audit_logged", 2),
        Finished = ("finished", 2),
    }
}

step_table! {
    /// Milestones of producing a requisition PDF for download.
    DownloadStep: OperationKind::Download => {
        RequestReceived = ("request_received", 4),
        AccessChecked = ("access_checked", 6),
        HeaderLoaded = ("header_loaded", 8),
        LineItemsLoaded = ("line_items_loaded", 10),
        ApprovalsLoaded = ("approvals_loaded", 8),
        TemplatePrepared = ("template_prepared", 6),
        HeaderRendered = ("header_rendered", 10),
        LineItemsRendered = ("line_items_rendered", 18),
        SignaturesRendered = ("signatures_rendered", 10),
        DocumentAssembled = ("document_assembled", 10),
        DocumentStored = ("document_stored", 6),
        LinkIssued = ("link_issued", 4),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn check_table<S: Step>(expected_len: usize) {
        assert_eq!(S::ALL.len(), expected_len, "{:?}", S::KIND);
        assert!(S::ALL.iter().all(|step| step.weight() > 0));
        let names: HashSet<_> = S::ALL.iter().map(|step| step.name()).collect();
        assert_eq!(names.len(), S::ALL.len(), "duplicate step names");
        for (idx, step) in S::ALL.iter().enumerate() {
            assert_eq!(step.index(), idx);
        }
    }

    #[test]
    fn tables_have_declared_sizes() {
        check_table::<SubmitStep>(20);
        check_table::<ApprovalStep>(19);
        check_table::<DownloadStep>(12);
    }

    #[test]
    fn kinds_match_tables() {
        assert_eq!(SubmitStep::KIND, OperationKind::SubmitRequest);
        assert_eq!(ApprovalStep::KIND, OperationKind::Approval);
        assert_eq!(DownloadStep::KIND, OperationKind::Download);
    }
}
