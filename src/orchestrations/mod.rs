//! Throttled fan-out/fan-in over an ordered input list, and the title-fetch
//! workflow built on it.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::providers::in_memory::DEFAULT_HISTORY_CAP;
use crate::runtime::registry::OrchestrationRegistry;
use crate::runtime::OrchestrationHandler;
use crate::{durable_error, durable_info, durable_warn, ConfigErrorKind, ErrorDetails, OrchestrationContext, Step};

/// Name the title-fetch workflow is registered under.
pub const ORCHESTRATION_NAME: &str = "FetchOrchestration";

/// Name of the activity the workflow fans out to.
pub const FETCH_ACTIVITY: &str = "FetchTitleAsync";

/// Batch size used when the request does not name one.
pub const DEFAULT_MAX_PARALLELISM: i64 = 3;

/// Largest URL list one instance accepts. Every page costs a schedule and a
/// resolution event, and the whole run must fit the provider's history cap
/// next to the start and terminal events.
pub const MAX_URLS: usize = (DEFAULT_HISTORY_CAP - 2) / 2;

/// Pages fetched when a start request carries no URL list.
pub const DEFAULT_URLS: &[&str] = &[
    "https://learn.microsoft.com/en-us/azure/azure-functions/durable/durable-task-scheduler/quickstart-durable-task-scheduler?pivots=csharp",
    "https://learn.microsoft.com/en-us/azure/azure-functions/durable/durable-functions-isolated-create-first-csharp?pivots=code-editor-vscode",
    "https://learn.microsoft.com/en-us/azure/azure-functions/durable/quickstart-js-vscode?pivots=nodejs-model-v4",
    "https://learn.microsoft.com/en-us/azure/azure-functions/durable/quickstart-python-vscode?tabs=windows",
    "https://learn.microsoft.com/en-us/azure/azure-functions/durable/quickstart-powershell-vscode",
    "https://learn.microsoft.com/en-us/samples/browse/?term=durable%20functions&terms=durable%20functions",
    "https://learn.microsoft.com/en-us/samples/azure-samples/durable-functions-order-processing/durable-func-order-processing/",
    "https://learn.microsoft.com/en-us/samples/azure-samples/durable-functions-order-processing-python/durable-func-order-processing-py/",
    "https://learn.microsoft.com/en-us/samples/azure-samples/durablefunctions-apiscraping-dotnet/retrieve-opened-issue-count-on-github-with-azure-durable-functions/",
    "https://learn.microsoft.com/en-us/samples/azure/ai-document-processing-pipeline/azure-ai-document-processing-pipeline-python/",
    "https://learn.microsoft.com/en-us/samples/azure-samples/durablefunctions-apiscraping-nodejs/retrieve-opened-issue-count-on-github-with-azure-durable-functions/",
    "https://learn.microsoft.com/en-us/samples/azure-samples/durable-functions-quickstart-dotnet-azd/starter-durable-fan-out-fan-in-csharp/",
    "https://learn.microsoft.com/en-us/samples/azure-samples/indexadillo/template/",
    "https://learn.microsoft.com/en-us/samples/azure-samples/intelligent-pdf-summarizer-dotnet/durable-func-pdf-summarizer-csharp/",
    "https://learn.microsoft.com/en-us/samples/azure-samples/intelligent-pdf-summarizer/durable-func-pdf-summarizer/",
    "https://learn.microsoft.com/en-us/azure/azure-functions/durable/durable-functions-types-features-overview",
    "https://learn.microsoft.com/en-us/azure/azure-functions/durable/durable-functions-orchestrations?tabs=csharp-inproc",
    "https://learn.microsoft.com/en-us/azure/azure-functions/durable/durable-functions-code-constraints?tabs=csharp",
    "https://learn.microsoft.com/en-us/azure/azure-functions/durable/durable-functions-sub-orchestrations?tabs=csharp-inproc",
    "https://learn.microsoft.com/en-us/azure/azure-functions/durable/durable-functions-custom-orchestration-status?tabs=csharp",
    "https://learn.microsoft.com/en-us/azure/azure-functions/durable/durable-functions-timers?tabs=csharp",
    "https://learn.microsoft.com/azure/azure-functions/durable/durable-functions-overview",
    "https://learn.microsoft.com/azure/azure-functions/durable/durable-task-scheduler/durable-task-scheduler",
    "https://learn.microsoft.com/azure/azure-functions/functions-scenarios",
    "https://learn.microsoft.com/azure/azure-functions/functions-create-ai-enabled-apps",
];

/// Consecutive batches of at most `max_concurrency` inputs, in input order.
///
/// Recomputed on every replay pass; it depends on nothing but its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPlan {
    batches: Vec<Vec<String>>,
}

impl BatchPlan {
    /// Partition `inputs`. A non-positive `max_concurrency` is a configuration error.
    pub fn new(inputs: Vec<String>, max_concurrency: i64) -> Result<Self, ErrorDetails> {
        if max_concurrency < 1 {
            return Err(ErrorDetails::configuration(
                ConfigErrorKind::InvalidConcurrency,
                "max_parallelism",
                format!("must be >= 1, got {max_concurrency}"),
            ));
        }
        let size = usize::try_from(max_concurrency).unwrap_or(usize::MAX);
        let batches = inputs.chunks(size).map(<[String]>::to_vec).collect();
        Ok(Self { batches })
    }

    pub fn batches(&self) -> &[Vec<String>] {
        &self.batches
    }

    /// Number of batches.
    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}

/// Outcome of one fanned-out call, tagged with the position of its input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityResult {
    pub index: usize,
    pub input: String,
    pub outcome: Result<String, ErrorDetails>,
}

impl ActivityResult {
    /// The success value, or a description of the failure.
    pub fn render(&self) -> String {
        match &self.outcome {
            Ok(value) => value.clone(),
            Err(details) => format!("Activity failed for {}: {}", self.input, details.display_message()),
        }
    }
}

/// Run `activity_name` once per input, at most `max_concurrency` at a time.
///
/// Each batch is scheduled in full before the pass waits on it, and the next
/// batch is only scheduled once every call of the current one has resolved.
/// Application failures are kept in place; a fatal failure (configuration or
/// infrastructure) fails the orchestration.
pub fn fan_out_fan_in(
    ctx: &mut OrchestrationContext,
    activity_name: &str,
    inputs: &[String],
    max_concurrency: i64,
) -> Step<Vec<ActivityResult>> {
    let plan = BatchPlan::new(inputs.to_vec(), max_concurrency)?;
    let mut results = Vec::with_capacity(inputs.len());

    for (batch_no, batch) in plan.batches().iter().enumerate() {
        let handles = batch
            .iter()
            .map(|input| ctx.schedule_activity(activity_name, input.as_str()))
            .collect::<Step<Vec<_>>>()?;
        let outcomes = ctx.join(&handles)?;

        let mut failed = 0usize;
        for (input, outcome) in batch.iter().zip(outcomes) {
            if let Err(details) = &outcome {
                if details.is_fatal() {
                    durable_error!(
                        ctx,
                        batch = batch_no + 1,
                        input = %input,
                        error = %details,
                        "batch aborted by fatal activity failure"
                    );
                    return Err(details.clone().into());
                }
                failed += 1;
            }
            results.push(ActivityResult {
                index: results.len(),
                input: input.clone(),
                outcome,
            });
        }
        if failed > 0 {
            durable_warn!(
                ctx,
                batch = batch_no + 1,
                of = plan.len(),
                size = batch.len(),
                failed,
                "batch resolved with failures"
            );
        } else {
            durable_info!(ctx, batch = batch_no + 1, of = plan.len(), size = batch.len(), "batch resolved");
        }
    }
    Ok(results)
}

/// Start request of the title-fetch workflow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    /// Pages to fetch. Missing means [`DEFAULT_URLS`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urls: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parallelism: Option<i64>,
}

impl FetchRequest {
    /// Parse an orchestration input. Blank input is the default request.
    pub fn parse(input: &str) -> Result<Self, ErrorDetails> {
        if input.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(input).map_err(|e| {
            ErrorDetails::configuration(ConfigErrorKind::InvalidInput, "input", format!("malformed request: {e}"))
        })
    }
}

fn validate_url(raw: &str) -> Result<(), ErrorDetails> {
    let invalid = |reason: String| ErrorDetails::configuration(ConfigErrorKind::InvalidInput, "urls", reason);
    let url = reqwest::Url::parse(raw).map_err(|e| invalid(format!("{raw:?}: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(invalid(format!("{raw:?}: unsupported scheme {other}"))),
    }
}

/// Fetch the title of every requested page, `max_parallelism` pages at a
/// time, and return them comma-separated in request order.
#[derive(Debug, Clone)]
pub struct FetchTitlesOrchestration {
    default_max_parallelism: i64,
}

impl Default for FetchTitlesOrchestration {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PARALLELISM)
    }
}

impl FetchTitlesOrchestration {
    pub fn new(default_max_parallelism: i64) -> Self {
        Self {
            default_max_parallelism,
        }
    }

    fn run(&self, ctx: &mut OrchestrationContext, input: &str) -> Step<String> {
        durable_info!(ctx, "Fetching data.");
        let request = FetchRequest::parse(input)?;
        let urls: Vec<String> = match request.urls {
            Some(urls) => urls,
            None => DEFAULT_URLS.iter().map(|u| u.to_string()).collect(),
        };
        if urls.len() > MAX_URLS {
            return Err(ErrorDetails::configuration(
                ConfigErrorKind::InvalidInput,
                "urls",
                format!("{} urls requested, at most {MAX_URLS} allowed", urls.len()),
            )
            .into());
        }
        for url in &urls {
            validate_url(url)?;
        }
        let k = request.max_parallelism.unwrap_or(self.default_max_parallelism);

        let results = fan_out_fan_in(ctx, FETCH_ACTIVITY, &urls, k)?;
        let rendered: Vec<String> = results.iter().map(ActivityResult::render).collect();
        durable_info!(ctx, pages = rendered.len(), "all batches resolved");
        Ok(rendered.join(", "))
    }
}

impl OrchestrationHandler for FetchTitlesOrchestration {
    fn invoke(&self, ctx: &mut OrchestrationContext, input: &str) -> Step<String> {
        self.run(ctx, input)
    }
}

/// Registry holding the title-fetch workflow.
pub fn orchestration_registry(default_max_parallelism: i64) -> OrchestrationRegistry {
    OrchestrationRegistry::builder()
        .register_handler(ORCHESTRATION_NAME, Arc::new(FetchTitlesOrchestration::new(default_max_parallelism)))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Event, Interrupt};
    use proptest::prelude::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn scheduled(seq: u64, input: &str) -> Event {
        Event::ActivityScheduled {
            sequence_id: seq,
            name: FETCH_ACTIVITY.to_string(),
            input: input.to_string(),
        }
    }

    fn completed(seq: u64, result: &str) -> Event {
        Event::ActivityCompleted {
            sequence_id: seq,
            result: result.to_string(),
        }
    }

    #[test]
    fn five_inputs_with_k3_split_into_two_batches() {
        let plan = BatchPlan::new(strings(&["A", "B", "C", "D", "E"]), 3).unwrap();
        assert_eq!(plan.batches(), &[strings(&["A", "B", "C"]), strings(&["D", "E"])]);
        assert_eq!(plan.len(), 2);
    }

    #[test]
    fn non_positive_concurrency_is_rejected() {
        for k in [0, -1, i64::MIN] {
            let err = BatchPlan::new(strings(&["A"]), k).unwrap_err();
            assert!(matches!(
                err,
                ErrorDetails::Configuration {
                    kind: ConfigErrorKind::InvalidConcurrency,
                    ..
                }
            ));
        }
    }

    #[test]
    fn empty_input_completes_without_dispatch() {
        let mut ctx = OrchestrationContext::from_history("i", &[]).unwrap();
        let results = fan_out_fan_in(&mut ctx, FETCH_ACTIVITY, &[], 3).unwrap();
        assert!(results.is_empty());
        assert!(ctx.pending_actions().is_empty());
    }

    #[test]
    fn zero_concurrency_fails_before_dispatch() {
        let mut ctx = OrchestrationContext::from_history("i", &[]).unwrap();
        let err = fan_out_fan_in(&mut ctx, FETCH_ACTIVITY, &strings(&["A"]), 0).unwrap_err();
        assert!(matches!(err, Interrupt::Failed(ErrorDetails::Configuration { .. })));
        assert!(ctx.pending_actions().is_empty());
    }

    #[test]
    fn second_batch_waits_for_first() {
        let inputs = strings(&["A", "B", "C", "D", "E"]);
        // B and C resolved, A still in flight: nothing new may be scheduled.
        let history = vec![
            scheduled(1, "A"),
            scheduled(2, "B"),
            scheduled(3, "C"),
            completed(3, "c"),
            completed(2, "b"),
        ];
        let mut ctx = OrchestrationContext::from_history("i", &history).unwrap();
        assert_eq!(fan_out_fan_in(&mut ctx, FETCH_ACTIVITY, &inputs, 3), Err(Interrupt::Suspended));
        assert!(ctx.pending_actions().is_empty());

        let mut history = history;
        history.push(completed(1, "a"));
        let mut ctx = OrchestrationContext::from_history("i", &history).unwrap();
        assert_eq!(fan_out_fan_in(&mut ctx, FETCH_ACTIVITY, &inputs, 3), Err(Interrupt::Suspended));
        let dispatched: Vec<u64> = ctx
            .pending_actions()
            .iter()
            .map(|crate::Action::CallActivity { sequence_id, .. }| *sequence_id)
            .collect();
        assert_eq!(dispatched, vec![4, 5]);
    }

    #[test]
    fn failure_stays_in_its_position() {
        let inputs = strings(&["A", "B", "C"]);
        let history = vec![
            scheduled(1, "A"),
            scheduled(2, "B"),
            scheduled(3, "C"),
            completed(3, "c"),
            Event::ActivityFailed {
                sequence_id: 2,
                details: ErrorDetails::activity_failed("boom"),
            },
            completed(1, "a"),
        ];
        let mut ctx = OrchestrationContext::from_history("i", &history).unwrap();
        let rendered: Vec<String> = fan_out_fan_in(&mut ctx, FETCH_ACTIVITY, &inputs, 3)
            .unwrap()
            .iter()
            .map(ActivityResult::render)
            .collect();
        assert_eq!(rendered, strings(&["a", "Activity failed for B: boom", "c"]));
    }

    #[test]
    fn fatal_activity_failure_fails_the_orchestration() {
        let history = vec![
            scheduled(1, "A"),
            Event::ActivityFailed {
                sequence_id: 1,
                details: ErrorDetails::configuration(
                    ConfigErrorKind::UnregisteredActivity,
                    FETCH_ACTIVITY,
                    "not registered",
                ),
            },
        ];
        let mut ctx = OrchestrationContext::from_history("i", &history).unwrap();
        let err = fan_out_fan_in(&mut ctx, FETCH_ACTIVITY, &strings(&["A"]), 3).unwrap_err();
        assert!(matches!(err, Interrupt::Failed(ErrorDetails::Configuration { .. })));
    }

    #[test]
    fn request_parsing() {
        assert_eq!(FetchRequest::parse("  ").unwrap(), FetchRequest::default());
        let req = FetchRequest::parse(r#"{"urls":["http://a"],"max_parallelism":2}"#).unwrap();
        assert_eq!(req.urls, Some(strings(&["http://a"])));
        assert_eq!(req.max_parallelism, Some(2));
        assert!(FetchRequest::parse("{not json").is_err());
    }

    #[test]
    fn default_request_fans_out_the_builtin_list_three_at_a_time() {
        let orchestration = FetchTitlesOrchestration::default();
        let mut ctx = OrchestrationContext::from_history("i", &[]).unwrap();
        assert_eq!(orchestration.invoke(&mut ctx, ""), Err(Interrupt::Suspended));
        assert_eq!(ctx.pending_actions().len(), 3);
        assert!(matches!(
            &ctx.pending_actions()[0],
            crate::Action::CallActivity { input, name, .. } if input == DEFAULT_URLS[0] && name == FETCH_ACTIVITY
        ));
    }

    #[test]
    fn malformed_url_is_rejected_before_dispatch() {
        let orchestration = FetchTitlesOrchestration::default();
        let mut ctx = OrchestrationContext::from_history("i", &[]).unwrap();
        let input = r#"{"urls":["https://ok.example","not a url"]}"#;
        match orchestration.invoke(&mut ctx, input) {
            Err(Interrupt::Failed(ErrorDetails::Configuration { kind, .. })) => {
                assert_eq!(kind, ConfigErrorKind::InvalidInput)
            }
            other => panic!("expected invalid input, got {other:?}"),
        }
        assert!(ctx.pending_actions().is_empty());
        assert!(validate_url("ftp://host/file").is_err());
    }

    #[test]
    fn url_list_over_the_limit_is_rejected_before_dispatch() {
        let orchestration = FetchTitlesOrchestration::default();
        let urls: Vec<String> = (0..=MAX_URLS).map(|i| format!("http://p.test/{i}")).collect();
        let input = serde_json::json!({ "urls": urls, "max_parallelism": 50 }).to_string();
        let mut ctx = OrchestrationContext::from_history("i", &[]).unwrap();
        match orchestration.invoke(&mut ctx, &input) {
            Err(Interrupt::Failed(ErrorDetails::Configuration { kind, resource, .. })) => {
                assert_eq!(kind, ConfigErrorKind::InvalidInput);
                assert_eq!(resource, "urls");
            }
            other => panic!("expected invalid input, got {other:?}"),
        }
        assert!(ctx.pending_actions().is_empty());

        // A full run at the limit still fits the history cap.
        let full_run_events = 1 + 2 * MAX_URLS;
        assert!(full_run_events <= DEFAULT_HISTORY_CAP);
    }

    #[test]
    fn completed_request_joins_titles_in_order() {
        let orchestration = FetchTitlesOrchestration::default();
        let input = r#"{"urls":["http://a.test/","http://b.test/"],"max_parallelism":1}"#;
        let history = vec![
            scheduled(1, "http://a.test/"),
            completed(1, "Title A"),
            scheduled(2, "http://b.test/"),
            completed(2, "Title B"),
        ];
        let mut ctx = OrchestrationContext::from_history("i", &history).unwrap();
        assert_eq!(orchestration.invoke(&mut ctx, input).unwrap(), "Title A, Title B");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn plan_preserves_inputs_and_bounds_batches(
            inputs in proptest::collection::vec("[a-z]{1,4}", 0..40),
            k in 1i64..8,
        ) {
            let plan = BatchPlan::new(inputs.clone(), k).unwrap();
            let flattened: Vec<String> = plan.batches().iter().flatten().cloned().collect();
            prop_assert_eq!(&flattened, &inputs);
            prop_assert!(plan.batches().iter().all(|b| !b.is_empty() && b.len() as i64 <= k));
            let expected_batches = (inputs.len() + k as usize - 1) / k as usize;
            prop_assert_eq!(plan.len(), expected_batches);
        }

        #[test]
        fn results_follow_input_order_for_any_completion_order(
            n in 1usize..12,
            k in 1i64..5,
            seed in any::<u64>(),
        ) {
            let inputs: Vec<String> = (0..n).map(|i| format!("u{i}")).collect();
            let mut history = Vec::new();
            let mut in_flight_max = 0usize;
            let mut rng = seed;
            loop {
                let mut ctx = OrchestrationContext::from_history("p", &history).unwrap();
                match fan_out_fan_in(&mut ctx, FETCH_ACTIVITY, &inputs, k) {
                    Ok(results) => {
                        let rendered: Vec<String> = results.iter().map(ActivityResult::render).collect();
                        let expected: Vec<String> = inputs.iter().map(|u| format!("title-{u}")).collect();
                        prop_assert_eq!(rendered, expected);
                        break;
                    }
                    Err(Interrupt::Suspended) => {
                        let (events, _) = ctx.into_delta();
                        history.extend(events);
                        let scheduled: Vec<(u64, String)> = history.iter().filter_map(|e| match e {
                            Event::ActivityScheduled { sequence_id, input, .. } => Some((*sequence_id, input.clone())),
                            _ => None,
                        }).collect();
                        let resolved = |seq: u64| {
                            history.iter().any(|e| e.is_activity_resolution() && e.sequence_id() == Some(seq))
                        };
                        let mut pending: Vec<(u64, String)> = scheduled.into_iter()
                            .filter(|(seq, _)| !resolved(*seq))
                            .collect();
                        in_flight_max = in_flight_max.max(pending.len());
                        // Resolve one pending call, picked pseudo-randomly.
                        rng = rng.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                        let (seq, input) = pending.remove((rng >> 33) as usize % pending.len());
                        history.push(Event::ActivityCompleted { sequence_id: seq, result: format!("title-{input}") });
                    }
                    Err(Interrupt::Failed(details)) => prop_assert!(false, "unexpected failure: {details}"),
                }
            }
            prop_assert!(in_flight_max as i64 <= k);
        }
    }
}
