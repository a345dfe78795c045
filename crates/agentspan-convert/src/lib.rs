//! Agent trace to span tree conversion.
//!
//! [`convert`] turns one [`TraceBatch`] into a [`SpanTree`]: a synthetic root
//! span for the invocation, one span per orchestration step, processing step,
//! guardrail check and failure, with tool calls, retrievals and reasoning
//! nested under the orchestration step that produced them.
//!
//! Conversion is pure. The same batch and options always give the same tree,
//! and a batch either converts completely or not at all.
//!
//! ```
//! use agentspan_convert::{convert, ConvertOptions};
//! use agentspan_core::TraceBatch;
//!
//! let batch = TraceBatch::new("A1", "AL1", "s1").with_io("hi", "hello");
//! let tree = convert(&batch, &ConvertOptions::new(chrono::Utc::now())).unwrap();
//! assert_eq!(tree.len(), 1);
//! ```

mod builder;
pub mod payload;
mod time;

pub use time::parse_event_time;

use agentspan_core::{SpanTree, TraceBatch, TreeError};
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::debug;

use builder::TreeBuilder;

/// Where guardrail spans attach.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum GuardrailParent {
    /// Under the open orchestration step, or the root when none is open.
    #[default]
    OpenOrchestration,
    /// Always under the root.
    Root,
}

impl GuardrailParent {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "orchestration" | "open_orchestration" => Some(GuardrailParent::OpenOrchestration),
            "root" => Some(GuardrailParent::Root),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GuardrailParent::OpenOrchestration => "orchestration",
            GuardrailParent::Root => "root",
        }
    }
}

/// Per-job conversion inputs that do not come from the batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertOptions {
    /// Anchors the root span of a batch with no events.
    pub submitted_at: DateTime<Utc>,
    pub guardrail_parent: GuardrailParent,
}

impl ConvertOptions {
    pub fn new(submitted_at: DateTime<Utc>) -> Self {
        Self {
            submitted_at,
            guardrail_parent: GuardrailParent::default(),
        }
    }

    pub fn with_guardrail_parent(mut self, policy: GuardrailParent) -> Self {
        self.guardrail_parent = policy;
        self
    }
}

#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("none of the {total} trace events carries a usable eventTime ({invalid} unparsable)")]
    NoTimingAnchor { total: usize, invalid: usize },

    #[error("duration_ms {0} puts the end of the invocation out of range")]
    DurationOutOfRange(f64),

    #[error("invalid span tree: {0}")]
    Tree(#[from] TreeError),
}

/// Converts a trace batch into a span tree.
pub fn convert(batch: &TraceBatch, options: &ConvertOptions) -> Result<SpanTree, ConversionError> {
    let times = time::resolve(&batch.traces)?;

    let mut order: Vec<usize> = (0..batch.traces.len()).collect();
    order.sort_by_key(|&i| times[i]);

    let (start, end) = match (order.first(), order.last()) {
        (Some(&first), Some(&last)) => (times[first], times[last]),
        _ => {
            let start = options.submitted_at;
            let ms = batch.duration_ms.unwrap_or(0.0);
            let end = start
                .checked_add_signed(millis(ms))
                .ok_or(ConversionError::DurationOutOfRange(ms))?;
            (start, end)
        }
    };

    let mut builder = TreeBuilder::new(batch, options, start, end);
    for i in order {
        builder.handle(&batch.traces[i], times[i]);
    }
    let tree = builder.finish(end)?;

    debug!(
        agent_id = %batch.agent_id,
        events = batch.traces.len(),
        spans = tree.len(),
        errored = tree.root().errored,
        "Converted trace batch"
    );
    Ok(tree)
}

fn millis(ms: f64) -> Duration {
    if ms.is_finite() && ms > 0.0 {
        Duration::microseconds((ms * 1000.0) as i64)
    } else {
        Duration::zero()
    }
}
