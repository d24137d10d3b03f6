use crate::config::Config;
use crate::feedback::{self, JobStatus, Quote};
use crate::ledger::{HoldList, IssuedInvoice, JobLedger, PendingJob};
use crate::models::user::User;
use crate::tags::{self, InputKind};
use crate::wallet::{InvoiceState, LnBitsWallet, WalletError};
use crate::worker::{self, JobOutcome, WorkerRegistry};
use crate::zaps;
use anyhow::anyhow;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel::PgConnection;
use log::{debug, error, info, warn};
use nostr::{Event, EventId, Filter, Keys, Kind, PublicKey, Timestamp};
use nostr_sdk::{Client, Options, RelayPoolNotification};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;

const REFUND_MEMO: &str = "Couldn't finish job, returning sats";
const GENERIC_WORKER_ERROR: &str = "An error occurred";
const FETCH_TIMEOUT_SECS: u64 = 10;

/// Connect, subscribe and run the orchestrator until the relay stream dies.
pub async fn run_dvm(
    config: &Config,
    keys: Keys,
    registry: WorkerRegistry,
    wallet: LnBitsWallet,
    db_pool: Pool<ConnectionManager<PgConnection>>,
) -> anyhow::Result<()> {
    let opts = Options::new()
        .wait_for_send(true)
        .send_timeout(Some(Duration::from_secs(config.relay_timeout)))
        .skip_disconnected_relays(true);
    let client = Client::with_opts(&keys, opts);
    client.add_relays(config.relay.clone()).await?;
    client.connect().await;

    let mut kinds = registry.kinds();
    let generic = Kind::JobRequest(tags::KIND_GENERIC_REQUEST as u16);
    if !kinds.contains(&generic) {
        kinds.push(generic);
    }
    if !kinds.contains(&Kind::EncryptedDirectMessage) {
        kinds.push(Kind::EncryptedDirectMessage);
    }
    let job_filter = Filter::new().kinds(kinds).since(Timestamp::now());
    let zap_filter = Filter::new()
        .pubkey(keys.public_key())
        .kind(Kind::ZapReceipt)
        .since(Timestamp::now());
    client.subscribe(vec![job_filter, zap_filter]).await;

    let orchestrator = Orchestrator::new(config, keys, client, registry, wallet, db_pool);
    orchestrator.run().await
}

/// Drives every job through its lifecycle. Owns the ledger and the hold list
/// exclusively; the three input streams (network notifications, worker
/// completions, the reaper tick) are serialized onto one loop, so job state
/// is only ever mutated from here.
pub struct Orchestrator {
    name: String,
    show_result_before_payment: bool,
    relays: Vec<String>,
    keys: Keys,
    client: Client,
    registry: WorkerRegistry,
    wallet: LnBitsWallet,
    db_pool: Pool<ConnectionManager<PgConnection>>,
    ledger: JobLedger,
    held: HoldList,
    outcome_tx: mpsc::UnboundedSender<JobOutcome>,
    outcome_rx: mpsc::UnboundedReceiver<JobOutcome>,
}

impl Orchestrator {
    pub fn new(
        config: &Config,
        keys: Keys,
        client: Client,
        registry: WorkerRegistry,
        wallet: LnBitsWallet,
        db_pool: Pool<ConnectionManager<PgConnection>>,
    ) -> Self {
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        Orchestrator {
            name: config.name.clone(),
            show_result_before_payment: config.show_result_before_payment,
            relays: config.relay.clone(),
            keys,
            client,
            registry,
            wallet,
            db_pool,
            ledger: JobLedger::default(),
            held: HoldList::default(),
            outcome_tx,
            outcome_rx,
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut notifications = self.client.notifications();
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                notification = notifications.recv() => {
                    match notification {
                        Ok(RelayPoolNotification::Event { event, .. }) => {
                            if let Err(e) = self.handle_network_event(event).await {
                                error!("[{}] Error handling event: {e}", self.name);
                            }
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(n)) => {
                            warn!("[{}] Notification stream lagged, {n} events skipped", self.name);
                        }
                        Err(RecvError::Closed) => {
                            return Err(anyhow!("notification stream closed"));
                        }
                    }
                }
                Some(outcome) = self.outcome_rx.recv() => {
                    if let Err(e) = self.handle_worker_outcome(outcome).await {
                        error!("[{}] Error handling worker outcome: {e}", self.name);
                    }
                }
                _ = tick.tick() => {
                    if let Err(e) = self.tick().await {
                        error!("[{}] Error in reaper tick: {e}", self.name);
                    }
                }
            }
        }
    }

    async fn handle_network_event(&mut self, event: Event) -> anyhow::Result<()> {
        if tags::is_job_request_kind(event.kind) || event.kind.as_u64() == tags::KIND_DM {
            self.handle_job_request(event).await
        } else if event.kind == Kind::ZapReceipt {
            self.handle_zap(event).await
        } else {
            Ok(())
        }
    }

    /// Entry A: an inbound job request.
    async fn handle_job_request(&mut self, event: Event) -> anyhow::Result<()> {
        let event = match tags::decrypt_request_tags(event, &self.keys) {
            Ok(event) => event,
            // we cannot respond to a sender we cannot address
            Err(e) => {
                debug!("[{}] Dropping undecryptable request: {e}", self.name);
                return Ok(());
            }
        };

        let user = {
            let mut conn = self.db_pool.get()?;
            User::get_or_create(&mut conn, &event.pubkey)?
        };

        let worker = self.registry.resolve(&event);
        if user.isblacklisted {
            let task = worker
                .as_ref()
                .map(|w| w.task().to_string())
                .unwrap_or_else(|| "unknown".to_string());
            self.send_status(&event, &task, JobStatus::Error, None, None).await?;
            info!("[{}] Request by blacklisted user, skipped", self.name);
            return Ok(());
        }

        let Some(worker) = worker else {
            debug!("[{}] Unsupported task, skipping: {}", self.name, event.id);
            return Ok(());
        };
        let task = worker.task().to_string();

        let inputs = match tags::job_inputs(&event) {
            Ok(inputs) => inputs,
            Err(e) => {
                warn!("[{}] {e} in request {}, skipping", self.name, event.id);
                return Ok(());
            }
        };

        // a `job` input that is not on the network yet defers the request
        for input in &inputs {
            if input.kind == InputKind::Job && !self.job_result_available(&input.value).await {
                info!(
                    "[{}] Request {} waits for job input {}",
                    self.name, event.id, input.value
                );
                self.held.hold(event.clone(), Timestamp::now());
                self.send_status(&event, &task, JobStatus::ChainScheduled, None, None)
                    .await?;
                return Ok(());
            }
        }

        info!(
            "[{}] Received new request: {task} from {}",
            self.name,
            user.display_name()
        );

        let Some(amount) = worker::price_sats(worker.as_ref(), &event) else {
            debug!("[{}] Could not price request {}, skipping", self.name, event.id);
            return Ok(());
        };

        let cashu_redeemed = match tags::cashu_token(&event) {
            Some(token) => match self.wallet.redeem_cashu(&token, amount).await {
                Ok(redeemed) => {
                    info!(
                        "[{}] Redeemed cashu token: {} sats ({} sats fees)",
                        self.name, redeemed.amount_sats, redeemed.fees_sats
                    );
                    true
                }
                Err(e) => {
                    self.send_status(&event, &task, JobStatus::Error, None, Some(e.to_string()))
                        .await?;
                    return Ok(());
                }
            },
            None => false,
        };

        let route = payment_route(
            user.iswhitelisted,
            worker::is_free_task(worker.as_ref()),
            cashu_redeemed,
            tags::p_tag(&event),
            self.keys.public_key(),
            user.balance(),
            amount,
        );

        match route {
            Route::Free { waive_amount } => {
                // a cashu payment has been collected, whitelist/free has not
                let amount = if waive_amount { 0 } else { amount };
                info!("[{}] Free task or whitelisted for {task}, starting processing", self.name);
                self.send_status(&event, &task, JobStatus::Processing, None, None).await?;
                self.ledger
                    .upsert(PendingJob::new(event.clone(), amount, true, JobStatus::Processing));
                worker::dispatch(worker, event, self.outcome_tx.clone());
            }
            Route::Balance => {
                let balance = {
                    let mut conn = self.db_pool.get()?;
                    user.debit(&mut conn, amount)?.balance()
                };
                info!(
                    "[{}] Using balance for {task}, new balance is {balance} sats",
                    self.name
                );
                self.send_status(&event, &task, JobStatus::Processing, None, None).await?;
                self.ledger
                    .upsert(PendingJob::new(event.clone(), amount, true, JobStatus::Processing));
                worker::dispatch(worker, event, self.outcome_tx.clone());
            }
            Route::Invoice => {
                // a bid is informational, the server rate is always quoted
                if let Some(bid) = tags::bid_msats(&event) {
                    debug!(
                        "[{}] Bid of {bid} msats on {}, quoting {amount} sats",
                        self.name, event.id
                    );
                }
                let invoice = if self.wallet.can_issue_invoices() {
                    match self
                        .wallet
                        .create_invoice(amount, &format!("NIP90 DVM task {task}"))
                        .await
                    {
                        Ok((bolt11, payment_hash)) => Some(IssuedInvoice { bolt11, payment_hash }),
                        Err(e) => {
                            warn!("[{}] Invoice creation failed: {e}", self.name);
                            None
                        }
                    }
                } else {
                    None
                };
                info!("[{}] Requesting payment of {amount} sats for {}", self.name, event.id);
                let quote = Quote {
                    amount_sats: amount,
                    bolt11: invoice.as_ref().map(|i| i.bolt11.clone()),
                };
                self.send_status(&event, &task, JobStatus::PaymentRequired, Some(&quote), None)
                    .await?;
                self.ledger.upsert(
                    PendingJob::new(event, amount, false, JobStatus::PaymentRequired)
                        .with_invoice(invoice),
                );
            }
            Route::NotAddressed => {
                info!("[{}] Job addressed to someone else, skipping", self.name);
            }
        }

        Ok(())
    }

    /// Entry B: an inbound zap receipt.
    async fn handle_zap(&mut self, event: Event) -> anyhow::Result<()> {
        let zap = match zaps::parse_zap_receipt(&event) {
            Ok(zap) => zap,
            Err(e) => {
                debug!("[{}] Undecodable zap receipt: {e}", self.name);
                return Ok(());
            }
        };

        {
            let mut conn = self.db_pool.get()?;
            User::get_or_create(&mut conn, &zap.sender)?;
        }
        if !zap.message.is_empty() {
            debug!("[{}] Zap message: {}", self.name, zap.message);
        }

        let zapped = match zap.zapped_event_id {
            Some(id) => self.fetch_event(id).await,
            None => None,
        };

        match zapped {
            Some(zapped) if zapped.kind == Kind::JobFeedback => {
                self.settle_feedback_zap(&zapped, &zap).await
            }
            Some(zapped) if tags::is_job_result_kind(zapped.kind) => {
                info!("[{}] Someone zapped the result of an existing task", self.name);
                if !zap.anon {
                    self.credit_balance(&zap.sender, zap.amount_sats).await?;
                }
                Ok(())
            }
            _ => {
                if !zap.anon {
                    self.credit_balance(&zap.sender, zap.amount_sats).await?;
                }
                Ok(())
            }
        }
    }

    /// A zap on one of our feedback events settles the referenced job.
    async fn settle_feedback_zap(
        &mut self,
        zapped: &Event,
        zap: &zaps::ZapReceipt,
    ) -> anyhow::Result<()> {
        let quoted = feedback::quoted_amount_sats(zapped);
        let Some(request_id) = feedback::referenced_request_id(zapped) else {
            return Ok(());
        };
        let Some(request) = self.fetch_event(request_id).await else {
            debug!("[{}] Zapped feedback references unknown request {request_id}", self.name);
            return Ok(());
        };
        let request = match tags::decrypt_request_tags(request, &self.keys) {
            Ok(request) => request,
            Err(_) => return Ok(()),
        };
        let Some(worker) = self.registry.resolve(&request) else {
            return Ok(());
        };
        let task = worker.task().to_string();

        info!(
            "[{}] Zap of {} sats received for task {task}",
            self.name, zap.amount_sats
        );

        if zap.amount_sats < quoted {
            info!("[{}] Invoice was not paid sufficiently", self.name);
            let quote = Quote {
                amount_sats: zap.amount_sats,
                bolt11: None,
            };
            return self
                .send_status(&request, &task, JobStatus::PaymentRejected, Some(&quote), None)
                .await;
        }

        self.send_status(&request, &task, JobStatus::Processing, None, None).await?;

        let slot = self
            .ledger
            .find_by_event(&request.id)
            .map(|job| (job.is_processed, job.result.clone()));
        match slot {
            Some((true, result)) => {
                self.ledger.mark_paid(&request.id);
                // under SHOW_RESULT_BEFORE_PAYMENT the reply is already out
                if !self.show_result_before_payment {
                    self.publish_reply(&request, result.unwrap_or_default()).await?;
                }
                self.ledger.remove(&request.id);
            }
            Some((false, _)) => {
                // payment before processing: restart from a clean paid slot
                self.ledger.remove(&request.id);
                self.ledger.upsert(PendingJob::new(
                    request.clone(),
                    zap.amount_sats,
                    true,
                    JobStatus::Processing,
                ));
                info!("[{}] Starting work", self.name);
                worker::dispatch(worker, request, self.outcome_tx.clone());
            }
            None => {
                info!("[{}] Job not in ledger, starting work anyway", self.name);
                self.ledger.upsert(PendingJob::new(
                    request.clone(),
                    zap.amount_sats,
                    true,
                    JobStatus::Processing,
                ));
                worker::dispatch(worker, request, self.outcome_tx.clone());
            }
        }

        Ok(())
    }

    /// Entry C: a worker finished (or failed).
    async fn handle_worker_outcome(&mut self, outcome: JobOutcome) -> anyhow::Result<()> {
        let request = outcome.request;
        let Some(worker) = self.registry.resolve(&request) else {
            return Ok(());
        };
        let task = worker.task().to_string();

        match outcome.result {
            Ok(raw) => match worker.post_process(raw, &request) {
                Ok(result) => self.complete_job(&request, &task, result).await,
                Err(e) => {
                    // post-processing is presentation-layer, its message is safe
                    self.send_status(
                        &request,
                        &task,
                        JobStatus::Error,
                        None,
                        Some(format!("Error in post-processing: {e}")),
                    )
                    .await?;
                    self.refund_if_paid(&request).await?;
                    self.ledger.remove(&request.id);
                    Ok(())
                }
            },
            Err(e) => {
                error!("[{}] Worker failed for {}: {e}", self.name, request.id);
                self.send_status(
                    &request,
                    &task,
                    JobStatus::Error,
                    None,
                    Some(GENERIC_WORKER_ERROR.to_string()),
                )
                .await?;
                self.refund_if_paid(&request).await?;
                self.ledger.remove(&request.id);
                Ok(())
            }
        }
    }

    async fn complete_job(
        &mut self,
        request: &Event,
        task: &str,
        result: String,
    ) -> anyhow::Result<()> {
        // tolerate a lost slot, e.g. after a ledger wipe between dispatch and
        // completion
        if self.ledger.find_by_event(&request.id).is_none() {
            self.ledger.upsert(PendingJob::new(
                request.clone(),
                0,
                false,
                JobStatus::Processing,
            ));
        }
        self.ledger.mark_processed(&request.id, result.clone());

        let job = self
            .ledger
            .find_by_event(&request.id)
            .ok_or(anyhow!("job vanished from ledger"))?;
        let is_paid = job.is_paid;
        let quote = (!is_paid).then(|| Quote {
            amount_sats: job.amount,
            bolt11: job.invoice.as_ref().map(|i| i.bolt11.clone()),
        });

        if self.show_result_before_payment {
            self.publish_reply(request, result).await?;
            self.send_status(request, task, JobStatus::Success, quote.as_ref(), None).await?;
            if is_paid {
                self.ledger.remove(&request.id);
            }
        } else if is_paid {
            self.publish_reply(request, result).await?;
            self.send_status(request, task, JobStatus::Success, None, None).await?;
            self.ledger.remove(&request.id);
        } else {
            // reply withheld until the payment arrives
            self.send_status(request, task, JobStatus::Success, quote.as_ref(), None).await?;
        }

        Ok(())
    }

    /// Entry C preconditions plus the 1 Hz housekeeping: poll open invoices,
    /// expire stale jobs, re-check held dependencies.
    async fn tick(&mut self) -> anyhow::Result<()> {
        let now = Timestamp::now();

        for (id, invoice) in self.ledger.unpaid_invoices() {
            match self.wallet.poll(&invoice.payment_hash).await {
                InvoiceState::Paid => {
                    info!("[{}] Invoice paid, doing work from ledger", self.name);
                    self.ledger.mark_paid(&id);
                    let Some(job) = self.ledger.find_by_event(&id) else {
                        continue;
                    };
                    let request = job.request.clone();
                    let cached = job.is_processed.then(|| job.result.clone().unwrap_or_default());
                    let Some(worker) = self.registry.resolve(&request) else {
                        continue;
                    };
                    let task = worker.task().to_string();
                    self.send_status(&request, &task, JobStatus::Processing, None, None).await?;
                    match cached {
                        Some(result) => {
                            if !self.show_result_before_payment {
                                self.publish_reply(&request, result).await?;
                            }
                            self.ledger.remove(&request.id);
                        }
                        None => worker::dispatch(worker, request, self.outcome_tx.clone()),
                    }
                }
                InvoiceState::Expired => {
                    debug!("[{}] Invoice for {id} expired, dropping job", self.name);
                    self.ledger.remove(&id);
                }
                InvoiceState::Unpaid => {}
            }
        }

        let expired = self.ledger.expire(now);
        if !expired.is_empty() {
            debug!(
                "[{}] Dropped {} expired jobs, {} still pending",
                self.name,
                expired.len(),
                self.ledger.len()
            );
        }

        for request in self.held.requests() {
            if self.held_dependencies_ready(&request).await {
                self.held.remove(&request.id);
                self.handle_job_request(request).await?;
            }
        }
        let dropped = self.held.expire(now);
        if dropped > 0 {
            debug!("[{}] Dropped {dropped} held jobs after timeout", self.name);
        }

        Ok(())
    }

    /// Availability re-check for a held request, without re-queueing.
    async fn held_dependencies_ready(&self, request: &Event) -> bool {
        let Ok(inputs) = tags::job_inputs(request) else {
            return false;
        };
        for input in inputs {
            if input.kind == InputKind::Job && !self.job_result_available(&input.value).await {
                return false;
            }
        }
        true
    }

    /// Whether a referenced job result is visible on the network.
    async fn job_result_available(&self, value: &str) -> bool {
        let Ok(id) = EventId::from_hex(value) else {
            return false;
        };
        let filter = Filter::new().id(id);
        match self
            .client
            .get_events_of(vec![filter], Some(Duration::from_secs(FETCH_TIMEOUT_SECS)))
            .await
        {
            Ok(events) => events.iter().any(|e| tags::is_job_result_kind(e.kind)),
            Err(e) => {
                debug!("[{}] Lookup of job input {value} failed: {e}", self.name);
                false
            }
        }
    }

    async fn fetch_event(&self, id: EventId) -> Option<Event> {
        let filter = Filter::new().id(id);
        match self
            .client
            .get_events_of(vec![filter], Some(Duration::from_secs(FETCH_TIMEOUT_SECS)))
            .await
        {
            Ok(events) => events.into_iter().next(),
            Err(e) => {
                debug!("[{}] Event lookup failed for {id}: {e}", self.name);
                None
            }
        }
    }

    async fn credit_balance(&self, sender: &PublicKey, amount_sats: u64) -> anyhow::Result<()> {
        let mut conn = self.db_pool.get()?;
        let user = User::get_or_create(&mut conn, sender)?;
        let user = user.credit(&mut conn, amount_sats)?;
        info!(
            "[{}] Zap received for balance: {amount_sats} sats from {}, new balance {}",
            self.name,
            user.display_name(),
            user.balance()
        );
        Ok(())
    }

    /// One refund attempt for a paid job that errored; failures are logged
    /// and swallowed.
    async fn refund_if_paid(&mut self, request: &Event) -> anyhow::Result<()> {
        let Some(job) = self.ledger.find_by_event(&request.id) else {
            return Ok(());
        };
        if !job.is_paid || job.amount == 0 || !self.wallet.can_refund() {
            return Ok(());
        }
        let amount = job.amount;

        let user = {
            let mut conn = self.db_pool.get()?;
            User::get_or_create(&mut conn, &request.pubkey)?
        };
        match self
            .wallet
            .refund(
                &self.keys,
                &self.relays,
                user.lud16.as_deref(),
                amount,
                REFUND_MEMO,
                request,
            )
            .await
        {
            Ok(payment_hash) => {
                info!(
                    "[{}] Refunded {amount} sats to {}: {payment_hash}",
                    self.name,
                    user.display_name()
                );
            }
            Err(WalletError::NoLightningAddress) => {
                info!("[{}] Receiver has no lightning address, can't zap back", self.name);
            }
            Err(e) => warn!("[{}] Refund failed: {e}", self.name),
        }
        Ok(())
    }

    async fn send_status(
        &self,
        request: &Event,
        task: &str,
        status: JobStatus,
        quote: Option<&Quote>,
        content: Option<String>,
    ) -> anyhow::Result<()> {
        let event = feedback::status_event(&self.keys, request, task, status, quote, content)?;
        self.client.send_event(event).await?;
        info!("[{}] Sent {status} reaction for {}", self.name, request.id);
        Ok(())
    }

    async fn publish_reply(&self, request: &Event, result: String) -> anyhow::Result<()> {
        let reply = feedback::reply_event(&self.keys, request, result)?;
        let id = self.client.send_event(reply).await?;
        info!(
            "[{}] Kind {} job response sent: {id}",
            self.name,
            request.kind.as_u64() + 1000
        );
        Ok(())
    }
}

/// How a priced request gets settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Route {
    /// Run right away; `waive_amount` zeroes the ledger amount when the job
    /// is free by whitelist or task pricing (a collected cashu keeps it).
    Free { waive_amount: bool },
    /// Debit the requester's stored balance and run.
    Balance,
    /// Quote the server rate and wait for payment.
    Invoice,
    /// Addressed to a different DVM.
    NotAddressed,
}

pub(crate) fn payment_route(
    whitelisted: bool,
    task_free: bool,
    cashu_redeemed: bool,
    addressee: Option<PublicKey>,
    our_key: PublicKey,
    balance_sats: u64,
    amount_sats: u64,
) -> Route {
    let addressed_to_us = addressee.map_or(true, |p| p == our_key);
    if (whitelisted || task_free || cashu_redeemed) && addressed_to_us {
        return Route::Free {
            waive_amount: whitelisted || task_free,
        };
    }
    if addressee == Some(our_key) && balance_sats >= amount_sats {
        return Route::Balance;
    }
    if addressed_to_us {
        Route::Invoice
    } else {
        Route::NotAddressed
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn pk() -> PublicKey {
        Keys::generate().public_key()
    }

    #[test]
    fn whitelisted_requests_run_free_with_waived_amount() {
        let ours = pk();
        assert_eq!(
            payment_route(true, false, false, None, ours, 0, 50),
            Route::Free { waive_amount: true }
        );
        assert_eq!(
            payment_route(false, true, false, Some(ours), ours, 0, 0),
            Route::Free { waive_amount: true }
        );
    }

    #[test]
    fn cashu_settled_requests_run_free_but_keep_amount() {
        let ours = pk();
        assert_eq!(
            payment_route(false, false, true, None, ours, 0, 50),
            Route::Free {
                waive_amount: false
            }
        );
    }

    #[test]
    fn addressed_requests_can_spend_balance() {
        let ours = pk();
        assert_eq!(
            payment_route(false, false, false, Some(ours), ours, 50, 50),
            Route::Balance
        );
        // balance spending needs an explicit address to us
        assert_eq!(
            payment_route(false, false, false, None, ours, 500, 50),
            Route::Invoice
        );
        // underfunded balance falls back to an invoice
        assert_eq!(
            payment_route(false, false, false, Some(ours), ours, 49, 50),
            Route::Invoice
        );
    }

    #[test]
    fn unpriviledged_requests_get_an_invoice() {
        let ours = pk();
        assert_eq!(
            payment_route(false, false, false, None, ours, 0, 50),
            Route::Invoice
        );
    }

    #[test]
    fn requests_for_other_dvms_are_skipped() {
        let ours = pk();
        let other = pk();
        assert_eq!(
            payment_route(false, false, false, Some(other), ours, 1000, 50),
            Route::NotAddressed
        );
        // free path does not apply either when addressed elsewhere
        assert_eq!(
            payment_route(true, true, false, Some(other), ours, 1000, 50),
            Route::NotAddressed
        );
    }
}
