//! Token and page accounting for one run.
//!
//! A single [`UsageAggregator`] is created at batch start and passed by
//! `&mut` into every document extraction. Each model call is recorded into
//! two scopes at once: the current document (reset by
//! [`UsageAggregator::flush_document`]) and the whole run (never reset). The
//! run scope is therefore always the sum of every flushed document plus the
//! one in flight.

use serde::{Deserialize, Serialize};
use std::ops::AddAssign;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Token counts reported by one model call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl CallUsage {
    /// Build from prompt/completion counts; total is their sum.
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }
}

/// Accumulated counters for one scope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageCounters {
    pub calls: u64,
    pub pages: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl AddAssign<CallUsage> for UsageCounters {
    fn add_assign(&mut self, call: CallUsage) {
        self.calls += 1;
        self.pages += 1;
        self.input_tokens += call.input_tokens;
        self.output_tokens += call.output_tokens;
        self.total_tokens += call.total_tokens;
    }
}

impl AddAssign for UsageCounters {
    fn add_assign(&mut self, other: UsageCounters) {
        self.calls += other.calls;
        self.pages += other.pages;
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Run-level statistics written to the `stats` section of the report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStats {
    pub documents: u64,
    pub pages: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    /// Wall-clock duration of the run in milliseconds.
    pub duration: u64,
}

/// Per-document and process-wide usage bookkeeping.
#[derive(Debug)]
pub struct UsageAggregator {
    document: UsageCounters,
    overall: UsageCounters,
    documents: u64,
    started: Instant,
}

impl Default for UsageAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl UsageAggregator {
    pub fn new() -> Self {
        Self {
            document: UsageCounters::default(),
            overall: UsageCounters::default(),
            documents: 0,
            started: Instant::now(),
        }
    }

    /// Record one model call (one page) into both scopes.
    pub fn record_call(&mut self, call: CallUsage) {
        self.document += call;
        self.overall += call;
        debug!(
            "Single page - input tokens: {}, output tokens: {}, total tokens: {}",
            call.input_tokens, call.output_tokens, call.total_tokens
        );
    }

    /// Record pages processed without token accounting (document analysis).
    pub fn record_pages(&mut self, pages: u64) {
        self.document.pages += pages;
        self.overall.pages += pages;
    }

    /// Counters for the document currently in flight.
    pub fn document_totals(&self) -> UsageCounters {
        self.document
    }

    /// Counters for the whole run so far.
    pub fn overall_totals(&self) -> UsageCounters {
        self.overall
    }

    /// Number of documents flushed so far.
    pub fn documents(&self) -> u64 {
        self.documents
    }

    /// Close the current document: log its totals, return them, and reset
    /// the document scope. Called once per document, failed ones included,
    /// since tokens spent before a failure were still billed.
    pub fn flush_document(&mut self, name: &str) -> UsageCounters {
        let doc = std::mem::take(&mut self.document);
        self.documents += 1;
        info!(
            "Total document {} - pages: {}, input tokens: {}, output tokens: {}, total tokens: {}",
            name, doc.pages, doc.input_tokens, doc.output_tokens, doc.total_tokens
        );
        doc
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Finish the run and report process-wide totals.
    pub fn finish(self) -> RunStats {
        let stats = RunStats {
            documents: self.documents,
            pages: self.overall.pages,
            input_tokens: self.overall.input_tokens,
            output_tokens: self.overall.output_tokens,
            total_tokens: self.overall.total_tokens,
            duration: self.started.elapsed().as_millis() as u64,
        };
        info!(
            "Run complete - documents: {}, pages: {}, input tokens: {}, output tokens: {}, total tokens: {}, {}ms",
            stats.documents,
            stats.pages,
            stats.input_tokens,
            stats.output_tokens,
            stats.total_tokens,
            stats.duration
        );
        stats
    }
}
