use anyhow::anyhow;
use base64::engine::general_purpose::{STANDARD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use lnurl::lightning_address::LightningAddress;
use lnurl::pay::PayResponse;
use log::{debug, warn};
use nostr::{Event, EventBuilder, JsonUtil, Keys, Kind, Tag, TagKind};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum WalletError {
    /// The operation needs an LNBits key that is not configured.
    #[error("wallet unavailable")]
    WalletUnavailable,
    #[error("requester has no lightning address")]
    NoLightningAddress,
    #[error("{0}")]
    PaymentRejected(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvoiceState {
    Paid,
    Unpaid,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CashuRedemption {
    /// Sats credited to our wallet.
    pub amount_sats: u64,
    pub fees_sats: u64,
}

/// Lightning wallet backed by the LNBits REST API. Invoice issuance needs the
/// invoice key, outbound payments (refunds) the admin key; either may be
/// absent and the corresponding operations fail with `WalletUnavailable`.
#[derive(Clone)]
pub struct LnBitsWallet {
    url: String,
    invoice_key: Option<String>,
    admin_key: Option<String>,
    http: reqwest::Client,
}

const INVOICE_EXPIRY_SECS: u64 = 86_400; // one day

#[derive(Serialize)]
struct CreateInvoiceRequest<'a> {
    out: bool,
    amount: u64,
    memo: &'a str,
    expiry: u64,
}

#[derive(Deserialize)]
struct CreateInvoiceResponse {
    payment_request: String,
    payment_hash: String,
}

#[derive(Deserialize)]
struct PaymentStatusResponse {
    paid: bool,
}

#[derive(Serialize)]
struct PayInvoiceRequest<'a> {
    out: bool,
    bolt11: &'a str,
}

#[derive(Deserialize)]
struct PayInvoiceResponse {
    payment_hash: String,
}

#[derive(Deserialize)]
struct LnurlCallbackResponse {
    pr: String,
}

impl LnBitsWallet {
    pub fn new(url: String, invoice_key: Option<String>, admin_key: Option<String>) -> Self {
        LnBitsWallet {
            url: url.trim_end_matches('/').to_string(),
            invoice_key: invoice_key.filter(|k| !k.is_empty()),
            admin_key: admin_key.filter(|k| !k.is_empty()),
            http: reqwest::Client::new(),
        }
    }

    pub fn can_issue_invoices(&self) -> bool {
        self.invoice_key.is_some()
    }

    pub fn can_refund(&self) -> bool {
        self.admin_key.is_some()
    }

    /// Create a bolt11 invoice for `amount_sats`, returning `(bolt11,
    /// payment_hash)`.
    pub async fn create_invoice(
        &self,
        amount_sats: u64,
        memo: &str,
    ) -> Result<(String, String), WalletError> {
        let key = self.invoice_key.as_ref().ok_or(WalletError::WalletUnavailable)?;
        let resp: CreateInvoiceResponse = self
            .http
            .post(format!("{}/api/v1/payments", self.url))
            .header("X-Api-Key", key)
            .json(&CreateInvoiceRequest {
                out: false,
                amount: amount_sats,
                memo,
                expiry: INVOICE_EXPIRY_SECS,
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        debug!("Created invoice: {}", resp.payment_request);
        Ok((resp.payment_request, resp.payment_hash))
    }

    /// Poll an issued invoice. A wallet error reads as `Expired`, which makes
    /// the orchestrator drop the job; the payer never paid.
    pub async fn poll(&self, payment_hash: &str) -> InvoiceState {
        match self.check_invoice(payment_hash).await {
            Ok(true) => InvoiceState::Paid,
            Ok(false) => InvoiceState::Unpaid,
            Err(e) => {
                debug!("Invoice {payment_hash} no longer checkable: {e}");
                InvoiceState::Expired
            }
        }
    }

    async fn check_invoice(&self, payment_hash: &str) -> Result<bool, WalletError> {
        let key = self.invoice_key.as_ref().ok_or(WalletError::WalletUnavailable)?;
        let resp: PaymentStatusResponse = self
            .http
            .get(format!("{}/api/v1/payments/{payment_hash}", self.url))
            .header("X-Api-Key", key)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(resp.paid)
    }

    /// Pay a bolt11 invoice with the admin key, returning the payment hash.
    pub async fn pay_bolt11(&self, bolt11: &str) -> Result<String, WalletError> {
        let key = self.admin_key.as_ref().ok_or(WalletError::WalletUnavailable)?;
        let resp: PayInvoiceResponse = self
            .http
            .post(format!("{}/api/v1/payments", self.url))
            .header("X-Api-Key", key)
            .json(&PayInvoiceRequest { out: true, bolt11 })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(resp.payment_hash)
    }

    /// Zap sats back to a requester's lightning address: resolve the LUD-16
    /// address, fetch a bolt11 from its lnurl-pay callback with a signed zap
    /// request referencing the original job event, and pay it.
    pub async fn refund(
        &self,
        keys: &Keys,
        relays: &[String],
        lud16: Option<&str>,
        amount_sats: u64,
        memo: &str,
        request: &Event,
    ) -> Result<String, WalletError> {
        if !self.can_refund() {
            return Err(WalletError::WalletUnavailable);
        }
        let lud16 = lud16
            .filter(|s| !s.is_empty())
            .ok_or(WalletError::NoLightningAddress)?;

        let address =
            LightningAddress::new(lud16).map_err(|_| WalletError::NoLightningAddress)?;
        let pay: PayResponse = self
            .http
            .get(address.lnurlp_url())
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let msats = amount_sats * 1000;
        if msats < pay.min_sendable || msats > pay.max_sendable {
            return Err(WalletError::PaymentRejected(format!(
                "{lud16} does not accept {amount_sats} sats"
            )));
        }

        let zap_request = zap_request_event(keys, relays, request, msats, memo)
            .map_err(WalletError::Other)?;
        let invoice: LnurlCallbackResponse = self
            .http
            .get(&pay.callback)
            .query(&[
                ("amount", msats.to_string()),
                ("nostr", zap_request.as_json()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        self.pay_bolt11(&invoice.pr).await
    }

    /// Redeem a cashu bearer token by melting it at the embedded mint against
    /// one of our own invoices. Fails with `PaymentRejected` when the token
    /// does not cover `required_sats` or the mint refuses the melt.
    pub async fn redeem_cashu(
        &self,
        token: &str,
        required_sats: u64,
    ) -> Result<CashuRedemption, WalletError> {
        let token = decode_cashu_token(token)?;
        let entry = token
            .token
            .into_iter()
            .next()
            .ok_or_else(|| WalletError::PaymentRejected("empty cashu token".to_string()))?;

        let total: u64 = entry.proofs.iter().map(|p| p.amount).sum();
        if total < required_sats {
            return Err(WalletError::PaymentRejected(format!(
                "cashu token carries {total} sats, {required_sats} required"
            )));
        }
        let fees = cashu_fee_reserve(total);
        let redeemable = total.checked_sub(fees).filter(|a| *a > 0).ok_or_else(|| {
            WalletError::PaymentRejected("cashu token too small to cover melt fees".to_string())
        })?;

        let (bolt11, _) = self.create_invoice(redeemable, "cashu token redemption").await?;

        #[derive(Serialize)]
        struct MeltRequest<'a> {
            proofs: &'a [CashuProof],
            pr: &'a str,
        }
        #[derive(Deserialize)]
        struct MeltResponse {
            #[serde(default)]
            paid: bool,
            #[serde(default)]
            detail: Option<String>,
        }

        let resp: MeltResponse = self
            .http
            .post(format!("{}/melt", entry.mint.trim_end_matches('/')))
            .json(&MeltRequest {
                proofs: &entry.proofs,
                pr: &bolt11,
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if resp.paid {
            Ok(CashuRedemption {
                amount_sats: redeemable,
                fees_sats: fees,
            })
        } else {
            let detail = resp
                .detail
                .unwrap_or_else(|| "mint refused to melt the token".to_string());
            warn!("Cashu melt failed: {detail}");
            Err(WalletError::PaymentRejected(detail))
        }
    }
}

/// Build a signed kind-9734 zap request referencing the job event, used to
/// make the refund show up as a zap on the requester's side.
fn zap_request_event(
    keys: &Keys,
    relays: &[String],
    request: &Event,
    msats: u64,
    memo: &str,
) -> anyhow::Result<Event> {
    let tags = vec![
        Tag::Generic(TagKind::Custom("relays".to_string()), relays.to_vec()),
        Tag::Generic(
            TagKind::Custom("amount".to_string()),
            vec![msats.to_string()],
        ),
        Tag::public_key(request.pubkey),
        Tag::event(request.id),
    ];
    Ok(EventBuilder::new(Kind::ZapRequest, memo, tags).to_event(keys)?)
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct CashuProof {
    #[serde(default)]
    id: Option<String>,
    amount: u64,
    secret: String,
    #[serde(rename = "C")]
    c: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct CashuTokenEntry {
    mint: String,
    proofs: Vec<CashuProof>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct CashuToken {
    token: Vec<CashuTokenEntry>,
    #[serde(default)]
    memo: Option<String>,
    #[serde(default)]
    unit: Option<String>,
}

/// Serialized form is `cashuA<base64(json)>`; wallets differ on the base64
/// alphabet and padding, so all common variants are accepted.
pub(crate) fn decode_cashu_token(token: &str) -> Result<CashuToken, WalletError> {
    let encoded = token
        .strip_prefix("cashuA")
        .ok_or_else(|| WalletError::PaymentRejected("unsupported cashu token format".to_string()))?;

    let bytes = URL_SAFE_NO_PAD
        .decode(encoded)
        .or_else(|_| URL_SAFE.decode(encoded))
        .or_else(|_| STANDARD.decode(encoded))
        .map_err(|e| WalletError::Other(anyhow!("invalid cashu token encoding: {e}")))?;

    serde_json::from_slice(&bytes)
        .map_err(|e| WalletError::Other(anyhow!("invalid cashu token payload: {e}")))
}

/// 2% melt fee reserve with a 3 sat floor, matching common mint policy.
fn cashu_fee_reserve(total_sats: u64) -> u64 {
    (total_sats * 2 / 100).max(3)
}
