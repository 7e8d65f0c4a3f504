use crate::application::pipeline::DryRunLine;
use crate::domain::batch::ImportBatch;
use crate::domain::review::PendingImportRecord;
use crate::error::Result;
use serde::Serialize;
use std::io::Write;

#[derive(Serialize)]
struct BatchRow<'a> {
    batch_id: String,
    source: &'a str,
    status: &'a str,
    total: u64,
    imported: u64,
    skipped: u64,
    failed: u64,
    auto_matched: u64,
    ambiguous: u64,
    unmatched: u64,
    error: &'a str,
}

#[derive(Serialize)]
struct DryRunRow<'a> {
    payment_id: &'a str,
    amount: String,
    duplicate: bool,
    disposition: &'a str,
    best_registration: &'a str,
    confidence: String,
}

#[derive(Serialize)]
struct PendingRow<'a> {
    payment_id: &'a str,
    pending_since: String,
    amount: String,
    disposition: &'a str,
    candidates: usize,
    best_registration: &'a str,
    confidence: String,
    attempts: u32,
    check_count: u32,
}

/// Writes pipeline reports as CSV.
pub struct ReportWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> ReportWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    pub fn write_batch(&mut self, batch: &ImportBatch) -> Result<()> {
        self.writer.serialize(BatchRow {
            batch_id: batch.batch_id.to_string(),
            source: &batch.source,
            status: batch.status.as_str(),
            total: batch.counters.total,
            imported: batch.counters.imported,
            skipped: batch.counters.skipped,
            failed: batch.counters.failed,
            auto_matched: batch.dispositions.auto_matched,
            ambiguous: batch.dispositions.ambiguous,
            unmatched: batch.dispositions.unmatched,
            error: batch.error.as_deref().unwrap_or(""),
        })?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn write_dry_run(&mut self, lines: &[DryRunLine]) -> Result<()> {
        for line in lines {
            self.writer.serialize(DryRunRow {
                payment_id: &line.payment_id,
                amount: line.amount.to_string(),
                duplicate: line.duplicate,
                disposition: line.disposition.map(|d| d.as_str()).unwrap_or("skip"),
                best_registration: line.best_registration.as_deref().unwrap_or(""),
                confidence: line
                    .confidence
                    .map(|c| format!("{c:.4}"))
                    .unwrap_or_default(),
            })?;
        }
        self.writer.flush()?;
        Ok(())
    }

    pub fn write_pending(&mut self, records: &[PendingImportRecord]) -> Result<()> {
        if records.is_empty() {
            self.writer.write_record([
                "payment_id",
                "pending_since",
                "amount",
                "disposition",
                "candidates",
                "best_registration",
                "confidence",
                "attempts",
                "check_count",
            ])?;
        }
        for record in records {
            let best = record.candidates.first();
            self.writer.serialize(PendingRow {
                payment_id: record.id(),
                pending_since: record.pending_since.to_rfc3339(),
                amount: record.payment.amount.to_string(),
                disposition: record.disposition.as_str(),
                candidates: record.candidates.len(),
                best_registration: best.map(|c| c.registration_id.as_str()).unwrap_or(""),
                confidence: best.map(|c| format!("{:.4}", c.confidence)).unwrap_or_default(),
                attempts: record.attempts,
                check_count: record.check_count,
            })?;
        }
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::batch::{BatchStatus, ItemOutcome};
    use crate::domain::matching::Disposition;
    use crate::domain::money::Money;
    use crate::domain::payment::DateRange;
    use rust_decimal_macros::dec;

    #[test]
    fn test_batch_summary_row() {
        let mut batch = ImportBatch::start("payments.csv", DateRange::unbounded());
        batch.counters.record(ItemOutcome::Imported);
        batch.counters.record(ItemOutcome::Skipped);
        batch.close(BatchStatus::Completed, None);

        let mut out = Vec::new();
        ReportWriter::new(&mut out).write_batch(&batch).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.starts_with(
            "batch_id,source,status,total,imported,skipped,failed,auto_matched,ambiguous,unmatched,error\n"
        ));
        assert!(text.contains(",payments.csv,completed,2,1,1,0,0,0,0,\n"));
    }

    #[test]
    fn test_dry_run_rows() {
        let lines = vec![
            DryRunLine {
                payment_id: "sq_1".into(),
                amount: Money::new(dec!(150)),
                duplicate: false,
                disposition: Some(Disposition::AutoMatch),
                best_registration: Some("reg-1".into()),
                confidence: Some(0.85),
            },
            DryRunLine {
                payment_id: "sq_2".into(),
                amount: Money::new(dec!(20.5)),
                duplicate: true,
                disposition: None,
                best_registration: None,
                confidence: None,
            },
        ];
        let mut out = Vec::new();
        ReportWriter::new(&mut out).write_dry_run(&lines).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.contains("sq_1,150.00,false,auto_match,reg-1,0.8500\n"));
        assert!(text.contains("sq_2,20.50,true,skip,,\n"));
    }

    #[test]
    fn test_empty_pending_list_still_has_header() {
        let mut out = Vec::new();
        ReportWriter::new(&mut out).write_pending(&[]).unwrap();
        assert!(String::from_utf8(out).unwrap().starts_with("payment_id,pending_since"));
    }
}
