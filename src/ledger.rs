use crate::feedback::JobStatus;
use nostr::{Event, EventId, Timestamp};
use std::collections::HashMap;

/// An unpaid job is dropped 24h after the request was created.
pub const JOB_EXPIRY_SECS: u64 = 60 * 60 * 24;
/// A job waiting on another job's result is dropped after 20 minutes.
pub const HOLD_EXPIRY_SECS: u64 = 60 * 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedInvoice {
    pub bolt11: String,
    pub payment_hash: String,
}

#[derive(Debug, Clone)]
pub struct PendingJob {
    pub request: Event,
    /// Quoted price in sats.
    pub amount: u64,
    pub is_paid: bool,
    pub is_processed: bool,
    pub status: JobStatus,
    /// Post-processed result, cached when work finishes before payment.
    pub result: Option<String>,
    pub invoice: Option<IssuedInvoice>,
    pub expires_at: u64,
}

impl PendingJob {
    pub fn new(request: Event, amount: u64, is_paid: bool, status: JobStatus) -> Self {
        let expires_at = request.created_at.as_u64() + JOB_EXPIRY_SECS;
        PendingJob {
            request,
            amount,
            is_paid,
            is_processed: false,
            status,
            result: None,
            invoice: None,
            expires_at,
        }
    }

    pub fn with_invoice(mut self, invoice: Option<IssuedInvoice>) -> Self {
        self.invoice = invoice;
        self
    }
}

/// In-memory registry of jobs between first contact and reply publication,
/// keyed by request event id. Owned and mutated only by the orchestrator.
#[derive(Default)]
pub struct JobLedger {
    jobs: HashMap<EventId, PendingJob>,
}

impl JobLedger {
    pub fn find_by_event(&self, id: &EventId) -> Option<&PendingJob> {
        self.jobs.get(id)
    }

    /// Idempotent on request id: an existing entry is left in place.
    pub fn upsert(&mut self, job: PendingJob) {
        self.jobs.entry(job.request.id).or_insert(job);
    }

    pub fn mark_paid(&mut self, id: &EventId) -> bool {
        match self.jobs.get_mut(id) {
            Some(job) => {
                job.is_paid = true;
                true
            }
            None => false,
        }
    }

    pub fn mark_processed(&mut self, id: &EventId, result: String) -> bool {
        match self.jobs.get_mut(id) {
            Some(job) => {
                job.result = Some(result);
                job.is_processed = true;
                job.status = JobStatus::Success;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: &EventId) -> Option<PendingJob> {
        self.jobs.remove(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingJob> {
        self.jobs.values()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Jobs that still await settlement of an issued invoice.
    pub fn unpaid_invoices(&self) -> Vec<(EventId, IssuedInvoice)> {
        self.iter()
            .filter(|job| !job.is_paid)
            .filter_map(|job| job.invoice.clone().map(|inv| (job.request.id, inv)))
            .collect()
    }

    /// Remove and return every job whose 24h window has passed.
    pub fn expire(&mut self, now: Timestamp) -> Vec<PendingJob> {
        let expired: Vec<EventId> = self
            .jobs
            .iter()
            .filter(|(_, job)| now.as_u64() > job.expires_at)
            .map(|(id, _)| *id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.jobs.remove(&id))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct HeldJob {
    pub request: Event,
    pub queued_at: u64,
}

/// Wait-list for requests whose `job` input has not been produced yet.
#[derive(Default)]
pub struct HoldList {
    jobs: HashMap<EventId, HeldJob>,
}

impl HoldList {
    /// Idempotent on request id.
    pub fn hold(&mut self, request: Event, now: Timestamp) {
        self.jobs.entry(request.id).or_insert(HeldJob {
            request,
            queued_at: now.as_u64(),
        });
    }

    pub fn contains(&self, id: &EventId) -> bool {
        self.jobs.contains_key(id)
    }

    pub fn remove(&mut self, id: &EventId) -> Option<HeldJob> {
        self.jobs.remove(id)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Snapshot of held requests, so the caller can re-enter them without
    /// borrowing the list across the mutation.
    pub fn requests(&self) -> Vec<Event> {
        self.jobs.values().map(|j| j.request.clone()).collect()
    }

    /// Silently drop entries older than 20 minutes.
    pub fn expire(&mut self, now: Timestamp) -> usize {
        let before = self.jobs.len();
        self.jobs
            .retain(|_, job| now.as_u64() <= job.queued_at + HOLD_EXPIRY_SECS);
        before - self.jobs.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use nostr::{EventBuilder, Keys, Kind};

    fn request() -> Event {
        let keys = Keys::generate();
        EventBuilder::new(Kind::JobRequest(5000), "", vec![])
            .to_event(&keys)
            .unwrap()
    }

    #[test]
    fn upsert_is_idempotent_on_event_id() {
        let mut ledger = JobLedger::default();
        let event = request();

        ledger.upsert(PendingJob::new(event.clone(), 50, false, JobStatus::PaymentRequired));
        ledger.upsert(PendingJob::new(event.clone(), 999, true, JobStatus::Processing));

        assert_eq!(ledger.len(), 1);
        let job = ledger.find_by_event(&event.id).unwrap();
        assert_eq!(job.amount, 50);
        assert!(!job.is_paid);
    }

    #[test]
    fn marks_paid_and_processed() {
        let mut ledger = JobLedger::default();
        let event = request();
        ledger.upsert(PendingJob::new(event.clone(), 50, false, JobStatus::PaymentRequired));

        assert!(ledger.mark_paid(&event.id));
        assert!(ledger.mark_processed(&event.id, "result".to_string()));

        let job = ledger.find_by_event(&event.id).unwrap();
        assert!(job.is_paid);
        assert!(job.is_processed);
        assert_eq!(job.result.as_deref(), Some("result"));

        assert!(ledger.remove(&event.id).is_some());
        assert!(ledger.is_empty());
        assert!(!ledger.mark_paid(&event.id));
    }

    #[test]
    fn lists_unpaid_invoices_only() {
        let mut ledger = JobLedger::default();
        let invoice = IssuedInvoice {
            bolt11: "lnbc1...".to_string(),
            payment_hash: "00".repeat(32),
        };

        let unpaid = request();
        ledger.upsert(
            PendingJob::new(unpaid.clone(), 50, false, JobStatus::PaymentRequired)
                .with_invoice(Some(invoice.clone())),
        );
        let paid = request();
        let mut paid_job = PendingJob::new(paid.clone(), 50, true, JobStatus::Processing)
            .with_invoice(Some(invoice.clone()));
        paid_job.is_paid = true;
        ledger.upsert(paid_job);
        ledger.upsert(PendingJob::new(request(), 50, false, JobStatus::PaymentRequired));

        let open = ledger.unpaid_invoices();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].0, unpaid.id);
    }

    #[test]
    fn expires_jobs_after_24h() {
        let mut ledger = JobLedger::default();
        let event = request();
        let created = event.created_at.as_u64();
        ledger.upsert(PendingJob::new(event.clone(), 50, false, JobStatus::PaymentRequired));

        assert!(ledger.expire(Timestamp::from(created + JOB_EXPIRY_SECS)).is_empty());
        let expired = ledger.expire(Timestamp::from(created + JOB_EXPIRY_SECS + 1));
        assert_eq!(expired.len(), 1);
        assert!(ledger.is_empty());
    }

    #[test]
    fn hold_list_expires_after_20_minutes() {
        let mut held = HoldList::default();
        let event = request();
        let now = Timestamp::now();
        held.hold(event.clone(), now);
        held.hold(event.clone(), now);
        assert_eq!(held.len(), 1);
        assert!(held.contains(&event.id));

        assert_eq!(held.expire(Timestamp::from(now.as_u64() + HOLD_EXPIRY_SECS)), 0);
        assert_eq!(held.expire(Timestamp::from(now.as_u64() + HOLD_EXPIRY_SECS + 1)), 1);
        assert!(held.is_empty());
    }
}
