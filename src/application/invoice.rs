use crate::application::sequence::SequenceAllocator;
use crate::config::{InvoicePolicy, SequenceSettings};
use crate::domain::invoice::{
    IdempotencyKey, Invoice, InvoicePair, InvoicePairStatus, InvoiceType, LineItem, Transaction,
};
use crate::domain::money::Money;
use crate::domain::payment::{PaymentLinkage, PaymentRecord};
use crate::domain::ports::{CounterStoreArc, InvoiceStoreArc, PaymentStoreArc};
use crate::domain::registration::Registration;
use crate::error::{ReconcileError, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Issues the customer/supplier invoice pair for a confirmed match.
///
/// Ledger rows are written before the pair, and inserting the pair under its
/// idempotency key is the commit point. A pair visible through `find_active`
/// therefore always has every row behind it. Rows of an issuance that never
/// commits are deleted again. The payment linkage follows the commit and is
/// repaired by any later `issue` for the same key.
pub struct InvoiceOrchestrator {
    invoices: InvoiceStoreArc,
    payments: PaymentStoreArc,
    counters: CounterStoreArc,
    transactions: SequenceAllocator,
    policy: InvoicePolicy,
    sequence: SequenceSettings,
}

impl InvoiceOrchestrator {
    pub fn new(
        invoices: InvoiceStoreArc,
        payments: PaymentStoreArc,
        counters: CounterStoreArc,
        policy: InvoicePolicy,
        sequence: SequenceSettings,
    ) -> Self {
        let transactions = SequenceAllocator::new(counters.clone(), sequence.clone());
        Self {
            invoices,
            payments,
            counters,
            transactions,
            policy,
            sequence,
        }
    }

    pub async fn active_pair(
        &self,
        payment_id: &str,
        registration_id: &str,
    ) -> Result<Option<InvoicePair>> {
        self.invoices
            .find_active(&IdempotencyKey::new(payment_id, registration_id))
            .await
    }

    /// Issues (or returns the already issued) invoice pair for the pairing.
    ///
    /// With `regenerate` a fresh pair is issued that supersedes the active one.
    pub async fn issue(
        &self,
        payment: &PaymentRecord,
        registration: &Registration,
        confidence: f64,
        regenerate: bool,
    ) -> Result<InvoicePair> {
        let key = IdempotencyKey::new(&payment.payment_id, &registration.registration_id);
        let prior = self.invoices.find_active(&key).await?;
        if let Some(existing) = prior.as_ref()
            && !regenerate
        {
            info!(
                payment_id = %payment.payment_id,
                registration_id = %registration.registration_id,
                invoice = %existing.customer.invoice_number,
                "Invoice pair already issued"
            );
            self.link(existing, confidence).await?;
            return Ok(existing.clone());
        }
        if !self.payments.exists(&payment.payment_id).await? {
            return Err(ReconcileError::not_found("payment", &payment.payment_id));
        }

        let issued_at = Utc::now();
        let suffix = self.next_number_suffix(payment.paid_at).await?;
        let customer = self.customer_invoice(payment, registration, &suffix, issued_at);
        let supplier = self.supplier_invoice(&customer, &suffix, issued_at);

        let pair_id = Uuid::new_v4();
        let mut transactions = Vec::new();
        for invoice in [&customer, &supplier] {
            for item in &invoice.items {
                transactions.push(Transaction {
                    transaction_id: self.transactions.next().await?,
                    pair_id,
                    invoice_number: invoice.invoice_number.clone(),
                    invoice_type: invoice.invoice_type,
                    payment_id: payment.payment_id.clone(),
                    registration_id: registration.registration_id.clone(),
                    description: item.description.clone(),
                    quantity: item.quantity,
                    unit_price: item.unit_price,
                    amount: item.amount(),
                    created_at: issued_at,
                });
            }
        }

        let pair = InvoicePair {
            pair_id,
            payment_id: payment.payment_id.clone(),
            registration_id: registration.registration_id.clone(),
            customer,
            supplier,
            transaction_ids: transactions.iter().map(|t| t.transaction_id).collect(),
            status: InvoicePairStatus::Active,
            supersedes: prior.as_ref().map(|p| p.pair_id),
            created_at: issued_at,
        };

        let mut written = Vec::with_capacity(transactions.len());
        for transaction in transactions {
            let id = transaction.transaction_id;
            if let Err(e) = self.invoices.insert_transaction(transaction).await {
                return Err(self.roll_back(&pair, &written, e).await);
            }
            written.push(id);
        }

        match self.invoices.insert_pair(pair.clone()).await {
            Ok(()) => {}
            Err(ReconcileError::DuplicateInvoice { .. }) => {
                // A concurrent writer committed first; its pair is complete.
                let Some(winner) = self.invoices.find_active(&key).await? else {
                    let cause = ReconcileError::InvoiceGeneration {
                        reason: format!("active pair for {} vanished during issuance", key.encode()),
                        retryable: true,
                    };
                    return Err(self.roll_back(&pair, &written, cause).await);
                };
                if let Err(e) = self.invoices.delete_transactions(&written).await {
                    warn!(pair_id = %pair.pair_id, error = %e, "Could not delete rows of losing issuance");
                }
                info!(
                    payment_id = %payment.payment_id,
                    invoice = %winner.customer.invoice_number,
                    "Concurrent issuance won elsewhere, reusing pair"
                );
                self.link(&winner, confidence).await?;
                return Ok(winner);
            }
            Err(e) => return Err(self.roll_back(&pair, &written, e).await),
        }

        if let Err(e) = self.link(&pair, confidence).await {
            warn!(pair_id = %pair.pair_id, error = %e, "Invoice pair committed without payment linkage");
            if e.is_fatal() {
                return Err(e);
            }
            return Err(ReconcileError::InvoiceGeneration {
                reason: format!(
                    "pair {} for payment {} committed but linkage failed: {}",
                    pair.customer.invoice_number, pair.payment_id, e
                ),
                retryable: true,
            });
        }

        info!(
            payment_id = %pair.payment_id,
            registration_id = %pair.registration_id,
            customer = %pair.customer.invoice_number,
            supplier = %pair.supplier.invoice_number,
            total = %pair.customer.total,
            regenerated = pair.supersedes.is_some(),
            "Invoice pair issued"
        );
        Ok(pair)
    }

    /// Points the stored payment at `pair`, unless it already does.
    async fn link(&self, pair: &InvoicePair, confidence: f64) -> Result<()> {
        let Some(stored) = self.payments.get(&pair.payment_id).await? else {
            return Ok(());
        };
        let current = stored.linkage.as_ref().is_some_and(|l| {
            l.registration_id == pair.registration_id
                && l.customer_invoice_number == pair.customer.invoice_number
        });
        if current {
            return Ok(());
        }
        let linkage = PaymentLinkage {
            registration_id: pair.registration_id.clone(),
            confidence,
            customer_invoice_number: pair.customer.invoice_number.clone(),
            supplier_invoice_number: pair.supplier.invoice_number.clone(),
        };
        self.payments.attach_linkage(&pair.payment_id, linkage).await
    }

    /// Deletes the rows written for an uncommitted `pair` and converts `cause`
    /// into an `InvoiceGeneration` error. Retryable only when the delete
    /// succeeded. Fatal causes are returned unchanged.
    async fn roll_back(
        &self,
        pair: &InvoicePair,
        written: &[u64],
        cause: ReconcileError,
    ) -> ReconcileError {
        warn!(pair_id = %pair.pair_id, error = %cause, rows = written.len(), "Rolling back partial invoice write");
        match self.invoices.delete_transactions(written).await {
            Ok(()) if cause.is_fatal() => cause,
            Ok(()) => ReconcileError::InvoiceGeneration {
                reason: format!(
                    "partial write for payment {} rolled back: {}",
                    pair.payment_id, cause
                ),
                retryable: true,
            },
            Err(e) => {
                error!(pair_id = %pair.pair_id, error = %e, "Compensating delete failed");
                if e.is_fatal() {
                    return e;
                }
                ReconcileError::InvoiceGeneration {
                    reason: format!(
                        "partial write for payment {} could not be rolled back: {} (after {})",
                        pair.payment_id, e, cause
                    ),
                    retryable: false,
                }
            }
        }
    }

    /// `YYMMNNNN` from the month counter of the payment date.
    async fn next_number_suffix(&self, paid_at: DateTime<Utc>) -> Result<String> {
        let yymm = paid_at.format("%y%m").to_string();
        let counter = SequenceAllocator::named(
            self.counters.clone(),
            format!("invoice_{yymm}"),
            self.sequence.clone(),
        );
        let seq = counter.next().await?;
        Ok(format!("{yymm}{seq:04}"))
    }

    fn customer_invoice(
        &self,
        payment: &PaymentRecord,
        registration: &Registration,
        suffix: &str,
        issued_at: DateTime<Utc>,
    ) -> Invoice {
        let known_fees = registration.processing_fees.map(Money::round2);
        let items: Vec<LineItem> = if registration.items.is_empty() {
            let price = payment.amount - known_fees.unwrap_or(Money::ZERO);
            vec![LineItem {
                description: format!(
                    "Registration for {} - Confirmation: {}",
                    registration.event_name.as_deref().unwrap_or("Event"),
                    registration.confirmation_number
                ),
                quantity: 1,
                unit_price: price.max(Money::ZERO).round2(),
            }]
        } else {
            registration
                .items
                .iter()
                .map(|item| LineItem {
                    description: item.description.clone(),
                    quantity: item.quantity,
                    unit_price: item.unit_price.round2(),
                })
                .collect()
        };

        let subtotal: Money = items.iter().map(LineItem::amount).sum();
        let fees = known_fees
            .unwrap_or_else(|| (payment.amount - subtotal).max(Money::ZERO))
            .round2();
        let total = (subtotal + fees).round2();
        Invoice {
            invoice_number: format!("{}{}", self.policy.customer_prefix, suffix),
            invoice_type: InvoiceType::Customer,
            issued_at,
            bill_to: registration.bill_to(),
            supplier: self.policy.organiser.clone(),
            items,
            subtotal,
            processing_fees: fees,
            total,
            gst_included: self.gst_component(total),
            payment_id: payment.payment_id.clone(),
            registration_id: registration.registration_id.clone(),
        }
    }

    fn supplier_invoice(&self, customer: &Invoice, suffix: &str, issued_at: DateTime<Utc>) -> Invoice {
        let mut items = Vec::new();
        if customer.processing_fees.is_positive() {
            items.push(LineItem {
                description: "Processing Fees Reimbursement".to_string(),
                quantity: 1,
                unit_price: customer.processing_fees,
            });
        }
        items.push(LineItem {
            description: "Software Utilization Fee".to_string(),
            quantity: 1,
            unit_price: (customer.total * self.policy.software_fee_rate).round2(),
        });

        let subtotal: Money = items.iter().map(LineItem::amount).sum();
        Invoice {
            invoice_number: format!("{}{}", self.policy.supplier_prefix, suffix),
            invoice_type: InvoiceType::Supplier,
            issued_at,
            bill_to: self.policy.organiser.clone(),
            supplier: self.policy.agent.clone(),
            items,
            subtotal,
            processing_fees: Money::ZERO,
            total: subtotal,
            gst_included: self.gst_component(subtotal),
            payment_id: customer.payment_id.clone(),
            registration_id: customer.registration_id.clone(),
        }
    }

    fn gst_component(&self, total: Money) -> Money {
        let rate = self.policy.gst_rate;
        Money::new(total.value() * rate / (Decimal::ONE + rate)).round2()
    }
}
