use crate::domain::invoice::InvoicePair;
use crate::domain::ports::{Attachment, DocumentRendererArc, EmailClientArc, ObjectStorageArc};
use crate::error::Result;
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

/// What happened to one pair after commit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DistributionReport {
    pub document_url: Option<String>,
    pub emailed_to: Option<String>,
    pub failures: Vec<String>,
}

impl DistributionReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Hands an issued invoice pair to the render, storage and email collaborators.
///
/// Runs strictly after the financial write. Each step is retried on its own
/// and a failure is reported, never propagated.
#[derive(Clone)]
pub struct Distributor {
    renderer: DocumentRendererArc,
    storage: ObjectStorageArc,
    email: EmailClientArc,
    retries: u32,
    backoff: Duration,
}

impl Distributor {
    pub fn new(
        renderer: DocumentRendererArc,
        storage: ObjectStorageArc,
        email: EmailClientArc,
        retries: u32,
        backoff: Duration,
    ) -> Self {
        Self {
            renderer,
            storage,
            email,
            retries,
            backoff,
        }
    }

    pub async fn distribute(&self, pair: &InvoicePair, recipient: Option<&str>) -> DistributionReport {
        let mut report = DistributionReport::default();

        let document = match self
            .with_retries("render", || self.renderer.render(pair))
            .await
        {
            Ok(bytes) => bytes,
            Err(e) => {
                report.failures.push(format!("render: {e}"));
                return report;
            }
        };

        let file_name = format!(
            "{}.{}",
            pair.customer.invoice_number,
            self.renderer.file_extension()
        );
        let path = format!("invoices/{}/{}", pair.payment_id, file_name);
        match self
            .with_retries("upload", || self.storage.upload(&document, &path))
            .await
        {
            Ok(url) => report.document_url = Some(url),
            Err(e) => report.failures.push(format!("upload: {e}")),
        }

        if let (Some(to), Some(url)) = (recipient, report.document_url.clone()) {
            let subject = format!("Your invoice {}", pair.customer.invoice_number);
            let attachments = [Attachment { file_name, url }];
            match self
                .with_retries("email", || self.email.send(to, &subject, &attachments))
                .await
            {
                Ok(()) => report.emailed_to = Some(to.to_string()),
                Err(e) => report.failures.push(format!("email: {e}")),
            }
        }

        if report.is_complete() {
            info!(payment_id = %pair.payment_id, url = ?report.document_url, "Invoice distributed");
        } else {
            warn!(payment_id = %pair.payment_id, failures = ?report.failures, "Invoice distribution incomplete");
        }
        report
    }

    async fn with_retries<T, F, Fut>(&self, step: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.retries => {
                    attempt += 1;
                    warn!(step, attempt, error = %e, "Distribution step failed, retrying");
                    tokio::time::sleep(self.backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
