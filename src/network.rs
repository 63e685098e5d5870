//! Settlement network collaborator
//!
//! The orchestrator is the only component that talks to the external
//! payment network, and it does so through the `PaymentNetwork` trait.
//! `RestPaymentNetwork` speaks an LNbits-style REST API; the network
//! itself is an opaque collaborator, so nothing here inspects invoices
//! beyond passing them through.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::{error::EscrowError, EscrowResult};

/// Opaque reference to an in-progress network operation, used to poll
/// or await settlement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationHandle(pub String);

impl std::fmt::Display for OperationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An invoice issued by the network, with the handle to await its payment.
#[derive(Debug, Clone)]
pub struct InvoiceHandle {
    pub invoice: String,
    pub operation: OperationHandle,
}

/// Outcome of an outbound payout.
#[derive(Debug, Clone)]
pub struct PayoutResult {
    pub success: bool,
    pub preimage: Option<String>,
}

/// Wallet liveness information for the health probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletInfo {
    pub available: bool,
    pub balance_msat: u64,
    pub network_id: String,
}

/// External payment network boundary.
#[async_trait]
pub trait PaymentNetwork: Send + Sync {
    /// Request an invoice for the given amount; returns the invoice
    /// string and the handle to await its settlement.
    async fn create_invoice(&self, amount_msat: u64, memo: &str) -> EscrowResult<InvoiceHandle>;

    /// Await definitive settlement of an inbound invoice.
    async fn await_settlement(&self, operation: &OperationHandle) -> EscrowResult<bool>;

    /// Dispatch payment of an invoice supplied by a counterparty.
    async fn pay(&self, invoice: &str) -> EscrowResult<OperationHandle>;

    /// Await the final outcome of an outbound payment.
    async fn await_payout(&self, operation: &OperationHandle) -> EscrowResult<PayoutResult>;

    /// Wallet liveness probe.
    async fn wallet_info(&self) -> EscrowResult<WalletInfo>;
}

/// Configuration for the REST network client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestNetworkConfig {
    /// Base URL of the network node's REST API
    pub base_url: String,
    /// API key sent with every request
    pub api_key: String,
    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,
    /// Polling interval while awaiting settlement, in seconds
    pub poll_interval_secs: u64,
    /// Give up awaiting settlement after this many seconds
    pub settlement_timeout_secs: u64,
}

impl Default for RestNetworkConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:5000".to_string(),
            api_key: String::new(),
            request_timeout_secs: 30,
            poll_interval_secs: 5,
            settlement_timeout_secs: 600,
        }
    }
}

#[derive(Debug, Serialize)]
struct CreateInvoiceRequest<'a> {
    out: bool,
    amount: u64,
    memo: &'a str,
    unit: &'a str,
}

#[derive(Debug, Deserialize)]
struct CreateInvoiceResponse {
    payment_hash: String,
    payment_request: String,
}

#[derive(Debug, Serialize)]
struct PayInvoiceRequest<'a> {
    out: bool,
    bolt11: &'a str,
}

#[derive(Debug, Deserialize)]
struct PayInvoiceResponse {
    payment_hash: String,
}

#[derive(Debug, Deserialize)]
struct PaymentStatusResponse {
    paid: bool,
    #[serde(default)]
    preimage: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WalletResponse {
    #[serde(default)]
    name: String,
    balance: u64,
}

/// REST client for an LNbits-style network node.
pub struct RestPaymentNetwork {
    config: RestNetworkConfig,
    client: reqwest::Client,
}

impl RestPaymentNetwork {
    pub fn new(config: RestNetworkConfig) -> EscrowResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| EscrowError::config(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self { config, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn payment_status(
        &self,
        operation: &OperationHandle,
    ) -> EscrowResult<PaymentStatusResponse> {
        let response = self
            .client
            .get(self.url(&format!("/api/v1/payments/{}", operation.0)))
            .header("X-Api-Key", &self.config.api_key)
            .send()
            .await
            .map_err(|e| EscrowError::external(format!("status query failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(EscrowError::external(format!(
                "status query returned {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| EscrowError::external(format!("malformed status response: {}", e)))
    }

    /// Poll the status endpoint until settled or the settlement window closes.
    async fn poll_until_paid(&self, operation: &OperationHandle) -> EscrowResult<PaymentStatusResponse> {
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.config.settlement_timeout_secs);
        loop {
            let status = self.payment_status(operation).await?;
            if status.paid {
                return Ok(status);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(status);
            }
            debug!(operation = %operation, "settlement pending, polling again");
            tokio::time::sleep(Duration::from_secs(self.config.poll_interval_secs)).await;
        }
    }
}

#[async_trait]
impl PaymentNetwork for RestPaymentNetwork {
    async fn create_invoice(&self, amount_msat: u64, memo: &str) -> EscrowResult<InvoiceHandle> {
        let body = CreateInvoiceRequest {
            out: false,
            amount: amount_msat,
            memo,
            unit: "msat",
        };

        let response = self
            .client
            .post(self.url("/api/v1/payments"))
            .header("X-Api-Key", &self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| EscrowError::external(format!("invoice creation failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(EscrowError::external(format!(
                "invoice creation returned {}",
                response.status()
            )));
        }

        let created: CreateInvoiceResponse = response
            .json()
            .await
            .map_err(|e| EscrowError::external(format!("malformed invoice response: {}", e)))?;

        Ok(InvoiceHandle {
            invoice: created.payment_request,
            operation: OperationHandle(created.payment_hash),
        })
    }

    async fn await_settlement(&self, operation: &OperationHandle) -> EscrowResult<bool> {
        Ok(self.poll_until_paid(operation).await?.paid)
    }

    async fn pay(&self, invoice: &str) -> EscrowResult<OperationHandle> {
        let body = PayInvoiceRequest {
            out: true,
            bolt11: invoice,
        };

        let response = self
            .client
            .post(self.url("/api/v1/payments"))
            .header("X-Api-Key", &self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| EscrowError::external(format!("payment dispatch failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(EscrowError::external(format!(
                "payment dispatch returned {}",
                response.status()
            )));
        }

        let paid: PayInvoiceResponse = response
            .json()
            .await
            .map_err(|e| EscrowError::external(format!("malformed payment response: {}", e)))?;

        Ok(OperationHandle(paid.payment_hash))
    }

    async fn await_payout(&self, operation: &OperationHandle) -> EscrowResult<PayoutResult> {
        let status = self.poll_until_paid(operation).await?;
        Ok(PayoutResult {
            success: status.paid,
            preimage: status.preimage,
        })
    }

    async fn wallet_info(&self) -> EscrowResult<WalletInfo> {
        let response = self
            .client
            .get(self.url("/api/v1/wallet"))
            .header("X-Api-Key", &self.config.api_key)
            .send()
            .await
            .map_err(|e| EscrowError::external(format!("wallet query failed: {}", e)))?;

        if !response.status().is_success() {
            return Ok(WalletInfo {
                available: false,
                balance_msat: 0,
                network_id: String::new(),
            });
        }

        let wallet: WalletResponse = response
            .json()
            .await
            .map_err(|e| EscrowError::external(format!("malformed wallet response: {}", e)))?;

        Ok(WalletInfo {
            available: true,
            balance_msat: wallet.balance,
            network_id: wallet.name,
        })
    }
}

/// Scripted in-process network for tests and demos.
///
/// Invoices settle (or not) according to `settle_inbound`; payouts
/// succeed according to `payout_succeeds`. Dispatched payments are
/// recorded so tests can assert the network was hit exactly once.
pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use uuid::Uuid;

    pub struct MockPaymentNetwork {
        pub settle_inbound: AtomicBool,
        pub payout_succeeds: AtomicBool,
        pub pay_fails: AtomicBool,
        pub paid_invoices: Mutex<Vec<String>>,
    }

    impl Default for MockPaymentNetwork {
        fn default() -> Self {
            Self {
                settle_inbound: AtomicBool::new(true),
                payout_succeeds: AtomicBool::new(true),
                pay_fails: AtomicBool::new(false),
                paid_invoices: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PaymentNetwork for MockPaymentNetwork {
        async fn create_invoice(
            &self,
            amount_msat: u64,
            _memo: &str,
        ) -> EscrowResult<InvoiceHandle> {
            let hash = Uuid::new_v4().simple().to_string();
            Ok(InvoiceHandle {
                invoice: format!("lnmock{}x{}", amount_msat, hash),
                operation: OperationHandle(hash),
            })
        }

        async fn await_settlement(&self, _operation: &OperationHandle) -> EscrowResult<bool> {
            Ok(self.settle_inbound.load(Ordering::SeqCst))
        }

        async fn pay(&self, invoice: &str) -> EscrowResult<OperationHandle> {
            if self.pay_fails.load(Ordering::SeqCst) {
                return Err(EscrowError::external("mock network refused payment"));
            }
            self.paid_invoices
                .lock()
                .expect("mock lock poisoned")
                .push(invoice.to_string());
            Ok(OperationHandle(Uuid::new_v4().simple().to_string()))
        }

        async fn await_payout(&self, _operation: &OperationHandle) -> EscrowResult<PayoutResult> {
            let success = self.payout_succeeds.load(Ordering::SeqCst);
            Ok(PayoutResult {
                success,
                preimage: success.then(|| "00".repeat(32)),
            })
        }

        async fn wallet_info(&self) -> EscrowResult<WalletInfo> {
            Ok(WalletInfo {
                available: true,
                balance_msat: 10_000_000_000,
                network_id: "mock".to_string(),
            })
        }
    }
}
