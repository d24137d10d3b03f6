use crate::tags::{self, KIND_GENERIC_REQUEST};
use anyhow::anyhow;
use async_trait::async_trait;
use log::{error, info};
use nostr::{Event, Kind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// The worker reported failure; the detail stays in the logs, requesters
    /// get a generic message.
    #[error("worker failed: {0}")]
    Failed(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Flattened job request handed to a worker, serializable for the
/// subprocess contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestForm {
    pub task: String,
    pub inputs: Vec<FormInput>,
    pub params: Vec<(String, String)>,
    pub output: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormInput {
    pub value: String,
    pub kind: String,
}

/// Request form built straight from the request tags; enough for most
/// workers.
pub fn default_request_form(task: &str, request: &Event) -> anyhow::Result<RequestForm> {
    let inputs = tags::job_inputs(request)?
        .into_iter()
        .map(|i| FormInput {
            value: i.value,
            kind: i.kind.to_string(),
        })
        .collect();

    let params = request
        .tags
        .iter()
        .filter_map(|t| {
            let vec = t.as_vec();
            if vec.first().map(|s| s.as_str()) == Some("param") && vec.len() >= 3 {
                Some((vec[1].clone(), vec[2].clone()))
            } else {
                None
            }
        })
        .collect();

    Ok(RequestForm {
        task: task.to_string(),
        inputs,
        params,
        output: tags::output_mime(request),
    })
}

/// A task implementation. The dispatcher treats workers as opaque
/// implementors of this contract; adding a task is a registry insertion.
#[async_trait]
pub trait Worker: Send + Sync {
    fn task(&self) -> &str;
    fn kind(&self) -> Kind;

    fn fix_cost(&self) -> u64 {
        0
    }

    fn per_unit_cost(&self) -> u64 {
        0
    }

    /// Billable units in the request, e.g. media length in seconds. `None`
    /// means the inputs cannot be priced (an unreadable media file, say) and
    /// the request is not serviceable.
    fn input_duration(&self, _request: &Event) -> Option<u64> {
        Some(0)
    }

    fn build_request(&self, request: &Event) -> anyhow::Result<RequestForm> {
        default_request_form(self.task(), request)
    }

    async fn run(&self, form: RequestForm) -> Result<String, WorkerError>;

    /// Runs in the orchestrator after `run`, before the result is published.
    fn post_process(&self, output: String, _request: &Event) -> anyhow::Result<String> {
        Ok(output)
    }
}

/// Price of a request in sats, `None` when its duration cannot be computed.
pub fn price_sats(worker: &dyn Worker, request: &Event) -> Option<u64> {
    let duration = worker.input_duration(request)?;
    Some(worker.fix_cost() + worker.per_unit_cost() * duration)
}

pub fn is_free_task(worker: &dyn Worker) -> bool {
    worker.fix_cost() == 0 && worker.per_unit_cost() == 0
}

/// Workers keyed by task identifier.
#[derive(Default, Clone)]
pub struct WorkerRegistry {
    workers: HashMap<String, Arc<dyn Worker>>,
}

impl WorkerRegistry {
    pub fn register(&mut self, worker: Arc<dyn Worker>) {
        self.workers.insert(worker.task().to_string(), worker);
    }

    pub fn by_task(&self, task: &str) -> Option<Arc<dyn Worker>> {
        self.workers.get(task).cloned()
    }

    /// Resolve the worker for a request: non-generic kinds match the worker
    /// registered for that kind, the generic kind resolves through a
    /// `["param", "task", <task>]` tag.
    pub fn resolve(&self, request: &Event) -> Option<Arc<dyn Worker>> {
        if request.kind.as_u64() == KIND_GENERIC_REQUEST {
            let task = tags::param(request, "task")?;
            return self.by_task(&task);
        }
        self.workers
            .values()
            .find(|w| w.kind() == request.kind)
            .cloned()
    }

    /// Distinct request kinds served, for the relay subscription.
    pub fn kinds(&self) -> Vec<Kind> {
        let mut kinds: Vec<Kind> = self.workers.values().map(|w| w.kind()).collect();
        kinds.sort_by_key(|k| k.as_u64());
        kinds.dedup();
        kinds
    }

    pub fn tasks(&self) -> Vec<String> {
        let mut tasks: Vec<String> = self.workers.keys().cloned().collect();
        tasks.sort();
        tasks
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

/// Completed worker invocation, reported back to the orchestrator.
#[derive(Debug)]
pub struct JobOutcome {
    pub request: Event,
    pub result: Result<String, WorkerError>,
}

/// Run a worker off the orchestrator loop and report the outcome through the
/// completion channel.
pub fn dispatch(
    worker: Arc<dyn Worker>,
    request: Event,
    outcomes: mpsc::UnboundedSender<JobOutcome>,
) {
    tokio::spawn(async move {
        info!("Running {} for event: {}", worker.task(), request.id);
        let result = match worker.build_request(&request) {
            Ok(form) => worker.run(form).await,
            Err(e) => Err(WorkerError::Other(e)),
        };
        if outcomes.send(JobOutcome { request, result }).is_err() {
            error!("Orchestrator is gone, dropping job outcome");
        }
    });
}

/// Worker isolated in a subprocess with its own interpreter environment.
/// The child is invoked as `<interpreter> <script> --request <json>
/// --identifier <id> --output <file>`; the exit code is ignored and a result
/// whose first line starts with `Error:` signals failure.
pub struct ScriptWorker {
    task: String,
    kind: Kind,
    fix_cost: u64,
    per_unit_cost: u64,
    script: PathBuf,
    identifier: String,
    interpreter: Option<PathBuf>,
}

impl ScriptWorker {
    pub fn new(
        task: String,
        kind: Kind,
        fix_cost: u64,
        per_unit_cost: u64,
        script: PathBuf,
        identifier: String,
    ) -> Self {
        ScriptWorker {
            task,
            kind,
            fix_cost,
            per_unit_cost,
            script,
            identifier,
            interpreter: None,
        }
    }

    /// Bypass the venv layout, mainly for tests.
    pub fn with_interpreter(mut self, interpreter: PathBuf) -> Self {
        self.interpreter = Some(interpreter);
        self
    }

    fn interpreter(&self) -> PathBuf {
        self.interpreter
            .clone()
            .unwrap_or_else(|| venv_interpreter(&self.script))
    }
}

/// Interpreter inside the per-script virtualenv: `cache/venvs/<stem>/bin/python`,
/// `Scripts\python` on Windows.
fn venv_interpreter(script: &Path) -> PathBuf {
    let stem = script.file_stem().map(|s| s.to_os_string()).unwrap_or_default();
    let mut path = PathBuf::from("cache");
    path.push("venvs");
    path.push(stem);
    if cfg!(windows) {
        path.push("Scripts");
    } else {
        path.push("bin");
    }
    path.push("python");
    path
}

#[async_trait]
impl Worker for ScriptWorker {
    fn task(&self) -> &str {
        &self.task
    }

    fn kind(&self) -> Kind {
        self.kind
    }

    fn fix_cost(&self) -> u64 {
        self.fix_cost
    }

    fn per_unit_cost(&self) -> u64 {
        self.per_unit_cost
    }

    async fn run(&self, form: RequestForm) -> Result<String, WorkerError> {
        let scratch = tempfile::tempdir().map_err(|e| anyhow!("no scratch dir: {e}"))?;
        let output_path = scratch.path().join("output.txt");
        let request_json =
            serde_json::to_string(&form).map_err(|e| anyhow!("unserializable request: {e}"))?;

        let status = tokio::process::Command::new(self.interpreter())
            .arg(&self.script)
            .arg("--request")
            .arg(&request_json)
            .arg("--identifier")
            .arg(&self.identifier)
            .arg("--output")
            .arg(&output_path)
            .status()
            .await
            .map_err(|e| anyhow!("failed to spawn {}: {e}", self.script.display()))?;
        // the exit code carries no signal, the output file does
        let _ = status;

        let raw = tokio::fs::read_to_string(&output_path)
            .await
            .map_err(|e| anyhow!("worker wrote no output: {e}"))?;
        tokio::fs::remove_file(&output_path).await.ok();

        let result = raw
            .lines()
            .filter(|line| !line.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n");

        if result.starts_with("Error:") {
            return Err(WorkerError::Failed(result));
        }
        Ok(result)
    }
}

const MAX_FETCH_SIZE: u64 = 10_000_000; // 10mb

/// Built-in in-process worker: returns the text behind a `url` input (or a
/// `text` input verbatim).
pub struct TextExtractor {
    fix_cost: u64,
    per_unit_cost: u64,
    http: reqwest::Client,
}

impl TextExtractor {
    pub fn new(fix_cost: u64, per_unit_cost: u64) -> Self {
        TextExtractor {
            fix_cost,
            per_unit_cost,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Worker for TextExtractor {
    fn task(&self) -> &str {
        "extract-text"
    }

    fn kind(&self) -> Kind {
        Kind::JobRequest(5000)
    }

    fn fix_cost(&self) -> u64 {
        self.fix_cost
    }

    fn per_unit_cost(&self) -> u64 {
        self.per_unit_cost
    }

    async fn run(&self, form: RequestForm) -> Result<String, WorkerError> {
        let input = form
            .inputs
            .iter()
            .find(|i| i.kind == "url" || i.kind == "text")
            .ok_or_else(|| WorkerError::Failed("no url or text input".to_string()))?;

        if input.kind == "text" {
            return Ok(input.value.clone());
        }

        let url = reqwest::Url::parse(&input.value)
            .map_err(|e| WorkerError::Failed(format!("invalid input url: {e}")))?;
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| WorkerError::Failed(format!("fetch failed: {e}")))?;

        if !response.status().is_success() {
            return Err(WorkerError::Failed(format!(
                "fetch failed: HTTP {}",
                response.status()
            )));
        }
        if response.content_length().unwrap_or(0) > MAX_FETCH_SIZE {
            return Err(WorkerError::Failed("input too large".to_string()));
        }

        let body = response
            .text()
            .await
            .map_err(|e| WorkerError::Failed(format!("fetch failed: {e}")))?;
        if body.len() as u64 > MAX_FETCH_SIZE {
            return Err(WorkerError::Failed("input too large".to_string()));
        }
        Ok(body)
    }

    fn post_process(&self, output: String, _request: &Event) -> anyhow::Result<String> {
        Ok(output.trim().to_string())
    }
}
