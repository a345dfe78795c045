//! Single-pass span tree construction.

use agentspan_core::{
    AttributeValue, Attributes, Span, SpanId, SpanKind, SpanTree, TraceBatch, TraceEvent,
    TraceKind, TreeError,
};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeSet;
use tracing::warn;

use crate::payload::{
    FailurePayload, GuardrailPayload, ModelInvocationOutput, OrchestrationPayload,
    ProcessingPayload, Usage,
};
use crate::{ConvertOptions, GuardrailParent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Orchestration,
    PreProcessing,
    PostProcessing,
}

/// The step span events may still attach to.
#[derive(Debug)]
struct OpenStep {
    span: SpanId,
    phase: Phase,
    step_id: Option<String>,
    /// LLM-call span receiving model input and output.
    llm: SpanId,
    /// Tool or retrieval span waiting for its observation.
    pending: Option<SpanId>,
}

impl OpenStep {
    fn continues(&self, phase: Phase, step_id: Option<&str>) -> bool {
        self.phase == phase && step_id.is_some() && self.step_id.as_deref() == step_id
    }
}

pub(crate) struct TreeBuilder<'a> {
    spans: Vec<Span>,
    open: Option<OpenStep>,
    options: &'a ConvertOptions,
    model_id: Option<String>,
    event_time: String,
}

impl<'a> TreeBuilder<'a> {
    pub(crate) fn new(
        batch: &TraceBatch,
        options: &'a ConvertOptions,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Self {
        let mut attributes = Attributes::new();
        attributes.insert("agent.id".into(), batch.agent_id.as_str().into());
        attributes.insert("agent.alias_id".into(), batch.agent_alias_id.as_str().into());
        attributes.insert("session.id".into(), batch.session_id.as_str().into());
        attributes.insert("agent.input_text".into(), batch.input_text.as_str().into());
        attributes.insert("agent.output_text".into(), batch.output_text.as_str().into());
        attributes.insert("agent.trace_count".into(), (batch.traces.len() as i64).into());
        attributes.insert("agent.streaming".into(), batch.streaming.into());
        if !batch.tags.is_empty() {
            let tags: Vec<&str> = batch.tags.iter().map(String::as_str).collect();
            attributes.insert("agent.tags".into(), tags.join(",").into());
        }
        if let Some(user) = &batch.user_id {
            attributes.insert("user.id".into(), user.as_str().into());
        }
        if let Some(model) = &batch.model_id {
            attributes.insert("gen_ai.request.model".into(), model.as_str().into());
        }
        if let Some(ms) = batch.duration_ms {
            attributes.insert("agent.duration_ms".into(), ms.into());
        }
        if let Some(trace_id) = &batch.trace_id {
            attributes.insert("agent.trace_id".into(), trace_id.as_str().into());
        }

        let root = Span {
            id: SpanId::ROOT,
            parent: None,
            name: format!("invoke_agent {}", batch.agent_id),
            kind: SpanKind::Root,
            start_time: start,
            end_time: end,
            attributes,
            errored: false,
        };

        Self {
            spans: vec![root],
            open: None,
            options,
            model_id: batch.model_id.clone(),
            event_time: String::new(),
        }
    }

    /// Applies one event. Events must arrive in resolved time order.
    pub(crate) fn handle(&mut self, event: &TraceEvent, at: DateTime<Utc>) {
        self.event_time = at.to_rfc3339_opts(SecondsFormat::AutoSi, true);

        match &event.kind {
            TraceKind::Orchestration => match decode::<OrchestrationPayload>(&event.payload) {
                Ok(payload) => self.orchestration(&payload, at),
                Err(e) => self.undecodable(event, &e, at),
            },
            TraceKind::PreProcessing => match decode::<ProcessingPayload>(&event.payload) {
                Ok(payload) => self.processing(Phase::PreProcessing, &payload, at),
                Err(e) => self.undecodable(event, &e, at),
            },
            TraceKind::PostProcessing => match decode::<ProcessingPayload>(&event.payload) {
                Ok(payload) => self.processing(Phase::PostProcessing, &payload, at),
                Err(e) => self.undecodable(event, &e, at),
            },
            TraceKind::Guardrail => match decode::<GuardrailPayload>(&event.payload) {
                Ok(payload) => self.guardrail(&payload, at),
                Err(e) => self.undecodable(event, &e, at),
            },
            TraceKind::Failure => match decode::<FailurePayload>(&event.payload) {
                Ok(payload) => self.failure(&payload, at),
                Err(e) => self.undecodable(event, &e, at),
            },
            TraceKind::Unknown(key) => self.unknown(key, &event.payload, at),
        }
    }

    /// Closes whatever is still open and seals the tree.
    pub(crate) fn finish(mut self, end: DateTime<Utc>) -> Result<SpanTree, TreeError> {
        self.close_open(end);
        SpanTree::new(self.spans)
    }

    fn orchestration(&mut self, payload: &OrchestrationPayload, at: DateTime<Utc>) {
        let step_id = payload.step_id();
        let continues = self
            .open
            .as_ref()
            .is_some_and(|o| o.continues(Phase::Orchestration, step_id));

        if !continues {
            self.close_open(at);
            let span = self.attach(SpanId::ROOT, "orchestration", SpanKind::LlmCall, at);
            self.set_opt(span, "trace.step_id", step_id);
            self.set_opt(span, "gen_ai.request.model", self.model_id.clone());
            self.open = Some(OpenStep {
                span,
                phase: Phase::Orchestration,
                step_id: step_id.map(str::to_string),
                llm: span,
                pending: None,
            });
        }

        let Some((step, mut llm, mut pending)) =
            self.open.as_ref().map(|o| (o.span, o.llm, o.pending))
        else {
            return;
        };

        if let Some(input) = &payload.model_invocation_input {
            if self.has_attr(llm, "gen_ai.prompt") {
                llm = self.attach(step, "llm_call", SpanKind::LlmCall, at);
                self.set_opt(llm, "gen_ai.request.model", self.model_id.clone());
            }
            self.set_opt(llm, "gen_ai.prompt", input.text.as_deref());
            self.set_opt(llm, "gen_ai.request.model", input.foundation_model.as_deref());
            self.set_opt(llm, "llm.invocation_type", input.invocation_type.as_deref());
            self.touch(llm, at);
        }

        if let Some(output) = &payload.model_invocation_output {
            if self.has_attr(llm, "gen_ai.completion") {
                llm = self.attach(step, "llm_call", SpanKind::LlmCall, at);
            }
            self.model_output(llm, output);
            if let Some(rationale) = output.parsed_response.as_ref().and_then(|p| p.rationale.as_deref()) {
                self.set(llm, "gen_ai.reasoning", rationale);
            }
            self.touch(llm, at);
        }

        if let Some(rationale) = &payload.rationale {
            let span = self.attach(step, "rationale", SpanKind::Reasoning, at);
            self.set_opt(span, "reasoning.text", rationale.text.as_deref());
        }

        if let Some(invocation) = &payload.invocation_input {
            let span = if let Some(action) = &invocation.action_group_invocation_input {
                let name = action.tool_name();
                let span = self.attach(step, format!("tool {name}"), SpanKind::Tool, at);
                self.set(span, "tool.name", name);
                self.set_opt(span, "tool.parameters", action.parameters.as_ref().map(Value::to_string));
                span
            } else if let Some(lookup) = &invocation.knowledge_base_lookup_input {
                let span = self.attach(step, "knowledge_base", SpanKind::Retrieval, at);
                self.set_opt(span, "retrieval.knowledge_base_id", lookup.knowledge_base_id.as_deref());
                self.set_opt(span, "retrieval.query", lookup.text.as_deref());
                span
            } else if let Some(code) = &invocation.code_interpreter_invocation_input {
                let span = self.attach(step, "code_interpreter", SpanKind::Tool, at);
                self.set(span, "tool.name", "code_interpreter");
                self.set_opt(span, "tool.code", code.code.as_deref());
                span
            } else {
                self.attach(step, "invocation", SpanKind::Tool, at)
            };
            self.set_opt(span, "tool.invocation_type", invocation.invocation_type.as_deref());
            pending = Some(span);
        }

        if let Some(observation) = &payload.observation {
            if let Some(output) = &observation.action_group_invocation_output {
                let span = self.claim_pending(&mut pending, step, SpanKind::Tool, at);
                self.set_opt(span, "tool.output", output.text.as_deref());
            }
            if let Some(output) = &observation.code_interpreter_invocation_output {
                let span = self.claim_pending(&mut pending, step, SpanKind::Tool, at);
                self.set_opt(span, "tool.output", output.execution_output.as_deref());
                self.set_opt(span, "tool.error", output.execution_error.as_deref());
            }
            if let Some(output) = &observation.knowledge_base_lookup_output {
                let span = self.claim_pending(&mut pending, step, SpanKind::Retrieval, at);
                self.set(span, "retrieval.result_count", output.retrieved_references.len() as i64);
            }
            if let Some(response) = &observation.final_response {
                let span = self.attach(step, "final_response", SpanKind::Reasoning, at);
                self.set_opt(span, "gen_ai.completion", response.text.as_deref());
            }
            if let Some(response) = &observation.reprompt_response {
                let span = self.attach(step, "reprompt", SpanKind::Reasoning, at);
                self.set_opt(span, "reasoning.text", response.text.as_deref());
            }
        }

        if let Some(open) = self.open.as_mut() {
            open.llm = llm;
            open.pending = pending;
        }
    }

    fn processing(&mut self, phase: Phase, payload: &ProcessingPayload, at: DateTime<Utc>) {
        let step_id = payload.step_id();
        let open_span = self
            .open
            .as_ref()
            .filter(|o| o.continues(phase, step_id))
            .map(|o| o.span);

        let span = match open_span {
            Some(span) => span,
            None => {
                self.close_open(at);
                let (name, kind) = match phase {
                    Phase::PreProcessing => ("pre_processing", SpanKind::PreProcessing),
                    _ => ("post_processing", SpanKind::PostProcessing),
                };
                let span = self.attach(SpanId::ROOT, name, kind, at);
                self.set_opt(span, "trace.step_id", step_id);
                self.open = Some(OpenStep {
                    span,
                    phase,
                    step_id: step_id.map(str::to_string),
                    llm: span,
                    pending: None,
                });
                span
            }
        };

        if let Some(input) = &payload.model_invocation_input {
            self.set_opt(span, "gen_ai.prompt", input.text.as_deref());
            self.set_opt(span, "gen_ai.request.model", input.foundation_model.as_deref());
        }
        if let Some(output) = &payload.model_invocation_output {
            self.model_output(span, output);
            if let Some(parsed) = &output.parsed_response {
                if phase == Phase::PreProcessing {
                    self.set_opt(span, "preprocessing.is_valid", parsed.is_valid);
                    self.set_opt(span, "preprocessing.rationale", parsed.rationale.as_deref());
                } else {
                    self.set_opt(span, "postprocessing.text", parsed.text.as_deref());
                }
            }
        }
        self.touch(span, at);
    }

    fn guardrail(&mut self, payload: &GuardrailPayload, at: DateTime<Utc>) {
        let parent = match self.options.guardrail_parent {
            GuardrailParent::OpenOrchestration => self.open_orchestration(),
            GuardrailParent::Root => SpanId::ROOT,
        };
        let span = self.attach(parent, "guardrail", SpanKind::Guardrail, at);

        if let Some(action) = &payload.action {
            let blocked = matches!(action.as_str(), "INTERVENED" | "BLOCKED");
            self.set(span, "guardrail.action", action.as_str());
            self.set(span, "guardrail.blocked", blocked);
        }
        if let Some(step_id) = &payload.trace_id {
            let direction = if step_id.contains("pre") { "input" } else { "output" };
            self.set(span, "guardrail.direction", direction);
            self.set(span, "trace.step_id", step_id.as_str());
        }

        let rules: BTreeSet<String> = payload
            .input_assessments
            .iter()
            .chain(&payload.output_assessments)
            .flat_map(|a| a.rule_ids())
            .collect();
        if !rules.is_empty() {
            let rules: Vec<String> = rules.into_iter().collect();
            self.set(span, "guardrail.triggered_rules", rules.join(","));
        }
    }

    fn failure(&mut self, payload: &FailurePayload, at: DateTime<Utc>) {
        let parent = self.open_orchestration();
        let span = self.attach(parent, "failure", SpanKind::Error, at);
        self.set(span, "error.kind", "agent_failure");
        self.set_opt(span, "error.message", payload.failure_reason.as_deref());
        self.set_opt(span, "error.code", payload.failure_code);
        self.set_opt(span, "trace.step_id", payload.trace_id.as_deref());
        self.mark_errored(span);
    }

    fn unknown(&mut self, key: &str, payload: &Value, at: DateTime<Utc>) {
        let name = if key.is_empty() {
            "unknown".to_string()
        } else {
            format!("unknown {key}")
        };
        let span = self.attach(SpanId::ROOT, name, SpanKind::Unknown, at);
        if !key.is_empty() {
            self.set(span, "trace.raw_kind", key);
        }
        self.set(span, "trace.raw_payload", payload.to_string());
    }

    /// A recognized kind whose payload does not have the expected shape.
    fn undecodable(&mut self, event: &TraceEvent, err: &serde_json::Error, at: DateTime<Utc>) {
        warn!(kind = event.kind.as_str(), error = %err, "Trace payload did not decode, keeping it raw");
        let span = self.attach(
            SpanId::ROOT,
            format!("unknown {}", event.kind.key()),
            SpanKind::Unknown,
            at,
        );
        self.set(span, "trace.raw_kind", event.kind.key());
        self.set(span, "trace.raw_payload", event.payload.to_string());
        self.set(span, "trace.decode_error", err.to_string());
    }

    fn model_output(&mut self, span: SpanId, output: &ModelInvocationOutput) {
        self.set_opt(span, "gen_ai.completion", output.completion());
        self.set_opt(span, "gen_ai.response.model", output.model_id());
        if let Some(usage) = output.usage() {
            self.usage(span, usage);
        }
    }

    fn usage(&mut self, span: SpanId, usage: &Usage) {
        self.set_opt(span, "gen_ai.usage.input_tokens", usage.input_tokens);
        self.set_opt(span, "gen_ai.usage.output_tokens", usage.output_tokens);
        if let (Some(input), Some(output)) = (usage.input_tokens, usage.output_tokens) {
            self.set(span, "gen_ai.usage.total_tokens", input + output);
        }
    }

    fn open_orchestration(&self) -> SpanId {
        self.open
            .as_ref()
            .filter(|o| o.phase == Phase::Orchestration)
            .map_or(SpanId::ROOT, |o| o.span)
    }

    /// Returns the pending span if it has the expected kind, else a new child.
    fn claim_pending(
        &mut self,
        pending: &mut Option<SpanId>,
        step: SpanId,
        kind: SpanKind,
        at: DateTime<Utc>,
    ) -> SpanId {
        match pending.take() {
            Some(span) if self.spans[span.index()].kind == kind => {
                self.touch(span, at);
                span
            }
            _ => {
                let name = if kind == SpanKind::Retrieval { "knowledge_base" } else { "tool" };
                self.attach(step, name, kind, at)
            }
        }
    }

    /// Ends the open step. A step nothing extended lasts until `at`.
    fn close_open(&mut self, at: DateTime<Utc>) {
        if let Some(open) = self.open.take() {
            let span = &mut self.spans[open.span.index()];
            if span.end_time == span.start_time && at > span.start_time {
                span.end_time = at;
            }
        }
    }

    fn attach(
        &mut self,
        parent: SpanId,
        name: impl Into<String>,
        kind: SpanKind,
        at: DateTime<Utc>,
    ) -> SpanId {
        let id = SpanId(self.spans.len());
        let mut attributes = Attributes::new();
        attributes.insert("trace.event_time".into(), self.event_time.as_str().into());
        self.spans.push(Span {
            id,
            parent: Some(parent),
            name: name.into(),
            kind,
            start_time: at,
            end_time: at,
            attributes,
            errored: false,
        });
        self.touch(parent, at);
        id
    }

    /// Extends `span` and its ancestors to cover `at`.
    fn touch(&mut self, span: SpanId, at: DateTime<Utc>) {
        let mut current = Some(span);
        while let Some(id) = current {
            let span = &mut self.spans[id.index()];
            if span.end_time < at {
                span.end_time = at;
            }
            current = span.parent;
        }
    }

    fn mark_errored(&mut self, span: SpanId) {
        let mut current = Some(span);
        while let Some(id) = current {
            let span = &mut self.spans[id.index()];
            span.errored = true;
            current = span.parent;
        }
    }

    fn has_attr(&self, span: SpanId, key: &str) -> bool {
        self.spans[span.index()].attributes.contains_key(key)
    }

    fn set(&mut self, span: SpanId, key: &str, value: impl Into<AttributeValue>) {
        self.spans[span.index()]
            .attributes
            .insert(key.to_string(), value.into());
    }

    fn set_opt<V: Into<AttributeValue>>(&mut self, span: SpanId, key: &str, value: Option<V>) {
        if let Some(value) = value {
            self.set(span, key, value);
        }
    }
}

fn decode<T: DeserializeOwned + Default>(payload: &Value) -> Result<T, serde_json::Error> {
    if payload.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(payload.clone())
}
