//! On-cluster pipeline orchestration.
//!
//! Provisions the function's resource bundle (PVC, registry secret,
//! pipeline, pipeline run), uploads sources when no Git URL is set,
//! discovers the newest run, watches it to completion, and extracts the
//! failing step's log when the run fails. Removal fans out one deleter
//! per resource class.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context as _;
use backon::{ConstantBuilder, Retryable};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Secret};
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use tokio_util::sync::CancellationToken;

use crate::cluster::{
    dynamic_api, function_selector, knative, pac_repository_gvk, resources, tekton_gvk, templates,
    upload,
};
use crate::config::model::Function;
use crate::config::FunctionError;
use crate::docker::creds::Credentials;

const FIELD_MANAGER: &str = "fnforge";
const WATCH_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("function namespace required")]
    NamespaceRequired,
    #[error("no pipeline run found for the function")]
    NoRunFound,
    #[error("pipeline run failed:\n{0}")]
    RunFailed(String),
    #[error("problem creating pipeline resources; missing tekton?")]
    MissingTekton,
    #[error("pipeline run cancelled")]
    Cancelled,
    #[error("removing pipeline resources: {0}")]
    RemoveFailed(String),
}

#[derive(Debug, Default)]
pub struct PipelineRunner {
    pub verbose: bool,
}

impl PipelineRunner {
    /// Deploy a function through an on-cluster pipeline. Returns the
    /// resulting service URL and the updated function.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        f: &Function,
        creds: &Credentials,
    ) -> anyhow::Result<(String, Function)> {
        templates::validate(f)?;
        let namespace = f
            .target_namespace()
            .ok_or(PipelineError::NamespaceRequired)?
            .to_string();
        let image = f.image_ref().ok_or(FunctionError::NoImage)?;

        let client = kube::Client::try_default()
            .await
            .context("connecting to the cluster")?;

        let pvcs = Api::<PersistentVolumeClaim>::namespaced(client.clone(), &namespace);
        resources::ensure_pvc(&pvcs, f)
            .await
            .context("creating the pipeline volume")?;

        if f.build.git.url.is_empty() {
            upload::upload_sources(cancel, client.clone(), &namespace, f).await?;
        }

        let pipelines = dynamic_api(client.clone(), &namespace, &tekton_gvk("Pipeline"));
        let pipeline = templates::pipeline(f)?;
        apply_pipeline(&pipelines, &resources::pipeline_name(f), &pipeline).await?;

        let secrets = Api::<Secret>::namespaced(client.clone(), &namespace);
        resources::ensure_registry_secret(&secrets, f, &image, creds)
            .await
            .context("creating the registry secret")?;

        let runs = dynamic_api(client.clone(), &namespace, &tekton_gvk("PipelineRun"));
        let run = templates::pipeline_run(f, &image)?;
        runs.create(&PostParams::default(), &run)
            .await
            .map_err(map_missing_tekton)?;

        tokio::time::sleep(Duration::from_secs(1)).await;
        let run_name = find_newest_run(&runs, &f.name).await?;
        tracing::info!(run = %run_name, namespace = %namespace, "pipeline run started");

        let watch = self
            .watch_run(cancel, &runs, client.clone(), &namespace, &run_name)
            .await;
        if cancel.is_cancelled() {
            eprintln!("pipeline run cancelled");
            let _ = runs.delete(&run_name, &DeleteParams::default()).await;
            return Err(PipelineError::Cancelled.into());
        }
        watch?;

        let (url, observed_namespace) = knative::service_url(client, &namespace, &f.name).await?;
        if observed_namespace != namespace {
            tracing::warn!(
                expected = %namespace,
                observed = %observed_namespace,
                "function deployed into an unexpected namespace"
            );
        }

        let mut updated = f.clone();
        updated.deploy.image = image;
        updated.deploy.namespace = namespace;
        Ok((url, updated))
    }

    /// Watch the run until it completes. Each poll formats the task runs
    /// in short-lived tasks, joined before the next batch.
    async fn watch_run(
        &self,
        cancel: &CancellationToken,
        runs: &Api<DynamicObject>,
        client: kube::Client,
        namespace: &str,
        run_name: &str,
    ) -> anyhow::Result<()> {
        let task_runs = dynamic_api(client.clone(), namespace, &tekton_gvk("TaskRun"));
        let mut reported: BTreeMap<String, String> = BTreeMap::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(PipelineError::Cancelled.into()),
                _ = tokio::time::sleep(WATCH_INTERVAL) => {}
            }

            let run = runs.get(run_name).await.context("reading pipeline run")?;

            let mut formatters = tokio::task::JoinSet::new();
            for child in child_task_runs(&run.data) {
                let task_runs = task_runs.clone();
                formatters.spawn(async move {
                    let state = match task_runs.get(&child.name).await {
                        Ok(tr) => format_task_state(&tr.data),
                        Err(_) => "Pending".to_string(),
                    };
                    (child.task, state)
                });
            }
            while let Some(result) = formatters.join_next().await {
                if let Ok((task, state)) = result {
                    if reported.get(&task) != Some(&state) {
                        tracing::info!(task = %task, state = %state, "pipeline progress");
                        reported.insert(task, state);
                    }
                }
            }

            match succeeded_condition(&run.data) {
                Some(true) => return Ok(()),
                Some(false) => {
                    let message = self
                        .failure_message(&run, &task_runs, client.clone(), namespace)
                        .await;
                    return Err(PipelineError::RunFailed(message).into());
                }
                None => continue,
            }
        }
    }

    /// The most useful failure text available: the log of the first step
    /// that exited non-zero, else the run's condition message.
    async fn failure_message(
        &self,
        run: &DynamicObject,
        task_runs: &Api<DynamicObject>,
        client: kube::Client,
        namespace: &str,
    ) -> String {
        let fallback = || {
            condition_message(&run.data)
                .unwrap_or_else(|| "pipeline run failed without a message".to_string())
        };

        for child in child_task_runs(&run.data) {
            let Ok(tr) = task_runs.get(&child.name).await else {
                continue;
            };
            if succeeded_condition(&tr.data) != Some(false) {
                continue;
            }
            let Some((pod, container)) = first_failed_step(&tr.data) else {
                continue;
            };
            let pods = Api::<Pod>::namespaced(client.clone(), namespace);
            let params = kube::api::LogParams {
                container: Some(container),
                ..Default::default()
            };
            match pods.logs(&pod, &params).await {
                Ok(log) if !log.is_empty() => return log,
                _ => return fallback(),
            }
        }
        fallback()
    }

    /// Delete everything belonging to the function in its namespace.
    /// One deleter per resource class; NotFound and Forbidden are
    /// ignored, anything else is aggregated.
    pub async fn remove(&self, f: &Function) -> anyhow::Result<()> {
        let namespace = f
            .target_namespace()
            .ok_or(PipelineError::NamespaceRequired)?
            .to_string();
        let client = kube::Client::try_default()
            .await
            .context("connecting to the cluster")?;
        let selector = function_selector(&f.name);

        // One slot per deleter keeps producers from blocking on a
        // cancelled consumer.
        let (tx, mut rx) = tokio::sync::mpsc::channel::<String>(5);
        let mut deleters = tokio::task::JoinSet::new();

        {
            let api = dynamic_api(client.clone(), &namespace, &tekton_gvk("Pipeline"));
            spawn_deleter(&mut deleters, "pipelines", api, selector.clone(), tx.clone());
        }
        {
            let api = dynamic_api(client.clone(), &namespace, &tekton_gvk("PipelineRun"));
            spawn_deleter(
                &mut deleters,
                "pipeline runs",
                api,
                selector.clone(),
                tx.clone(),
            );
        }
        {
            let api = dynamic_api(client.clone(), &namespace, &pac_repository_gvk());
            spawn_deleter(
                &mut deleters,
                "repositories",
                api,
                selector.clone(),
                tx.clone(),
            );
        }
        {
            let api = Api::<Secret>::namespaced(client.clone(), &namespace);
            spawn_deleter(&mut deleters, "secrets", api, selector.clone(), tx.clone());
        }
        {
            let api = Api::<PersistentVolumeClaim>::namespaced(client.clone(), &namespace);
            spawn_deleter(&mut deleters, "volumes", api, selector.clone(), tx.clone());
        }
        drop(tx);

        while deleters.join_next().await.is_some() {}
        let mut errors = Vec::new();
        while let Some(message) = rx.recv().await {
            errors.push(message);
        }
        match aggregate_errors(errors) {
            Some(joined) => Err(PipelineError::RemoveFailed(joined).into()),
            None => Ok(()),
        }
    }
}

fn spawn_deleter<K>(
    set: &mut tokio::task::JoinSet<()>,
    what: &'static str,
    api: Api<K>,
    selector: String,
    tx: tokio::sync::mpsc::Sender<String>,
) where
    K: kube::Resource + Clone + std::fmt::Debug + serde::de::DeserializeOwned + Send + 'static,
{
    set.spawn(async move {
        let result = api
            .delete_collection(
                &DeleteParams::default(),
                &ListParams::default().labels(&selector),
            )
            .await;
        match result {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 404 || ae.code == 403 => {}
            Err(e) => {
                let _ = tx.send(format!("deleting {what}: {e}")).await;
            }
        }
    });
}

/// Join deleter errors into a single message, or nothing on success.
pub(crate) fn aggregate_errors(mut errors: Vec<String>) -> Option<String> {
    if errors.is_empty() {
        return None;
    }
    errors.sort();
    Some(errors.join("; "))
}

async fn apply_pipeline(
    api: &Api<DynamicObject>,
    name: &str,
    pipeline: &DynamicObject,
) -> anyhow::Result<()> {
    let params = PatchParams::apply(FIELD_MANAGER).force();
    api.patch(name, &params, &Patch::Apply(pipeline))
        .await
        .map_err(map_missing_tekton)?;
    Ok(())
}

fn map_missing_tekton(e: kube::Error) -> anyhow::Error {
    match &e {
        kube::Error::Api(ae) if ae.code == 404 => PipelineError::MissingTekton.into(),
        kube::Error::Api(ae) if ae.code == 409 => {
            // AlreadyExists from a concurrent apply is fine.
            anyhow::Error::new(e).context("pipeline resource already exists")
        }
        _ => anyhow::Error::new(e).context("applying pipeline resources"),
    }
}

/// Find the newest pipeline run for the function. A run without a start
/// time disqualifies the scan (it restarts); three empty or incomplete
/// rounds give up.
async fn find_newest_run(runs: &Api<DynamicObject>, name: &str) -> anyhow::Result<String> {
    let selector = function_selector(name);
    let scan = || async {
        let list = runs
            .list(&ListParams::default().labels(&selector))
            .await
            .context("listing pipeline runs")?;
        let entries: Vec<(String, Option<DateTime<Utc>>)> = list
            .items
            .iter()
            .map(|run| {
                (
                    run.metadata.name.clone().unwrap_or_default(),
                    start_time(&run.data),
                )
            })
            .collect();
        match scan_newest(&entries) {
            RunScan::Found(name) => Ok(name),
            RunScan::Incomplete => anyhow::bail!("a pipeline run has no start time yet"),
            RunScan::Empty => anyhow::bail!("no pipeline runs for the function yet"),
        }
    };
    scan.retry(
        ConstantBuilder::default()
            .with_delay(Duration::from_secs(1))
            .with_max_times(2),
    )
    .await
    .map_err(|_| PipelineError::NoRunFound.into())
}

#[derive(Debug, PartialEq)]
pub(crate) enum RunScan {
    Found(String),
    Incomplete,
    Empty,
}

pub(crate) fn scan_newest(runs: &[(String, Option<DateTime<Utc>>)]) -> RunScan {
    if runs.is_empty() {
        return RunScan::Empty;
    }
    let mut newest: Option<(&str, DateTime<Utc>)> = None;
    for (name, start) in runs {
        let Some(start) = start else {
            return RunScan::Incomplete;
        };
        if newest.map_or(true, |(_, best)| *start > best) {
            newest = Some((name, *start));
        }
    }
    match newest {
        Some((name, _)) => RunScan::Found(name.to_string()),
        None => RunScan::Empty,
    }
}

fn start_time(data: &serde_json::Value) -> Option<DateTime<Utc>> {
    data["status"]["startTime"]
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// The run's `Succeeded` condition: Some(true/false) once decided.
pub(crate) fn succeeded_condition(data: &serde_json::Value) -> Option<bool> {
    let conditions = data["status"]["conditions"].as_array()?;
    for condition in conditions {
        if condition["type"] == "Succeeded" {
            return match condition["status"].as_str() {
                Some("True") => Some(true),
                Some("False") => Some(false),
                _ => None,
            };
        }
    }
    None
}

pub(crate) fn condition_message(data: &serde_json::Value) -> Option<String> {
    let conditions = data["status"]["conditions"].as_array()?;
    for condition in conditions {
        if condition["type"] == "Succeeded" {
            return condition["message"].as_str().map(str::to_string);
        }
    }
    None
}

#[derive(Debug, PartialEq)]
pub(crate) struct ChildTaskRun {
    pub name: String,
    pub task: String,
}

pub(crate) fn child_task_runs(data: &serde_json::Value) -> Vec<ChildTaskRun> {
    let Some(children) = data["status"]["childReferences"].as_array() else {
        return Vec::new();
    };
    children
        .iter()
        .filter(|c| c["kind"] == "TaskRun")
        .filter_map(|c| {
            Some(ChildTaskRun {
                name: c["name"].as_str()?.to_string(),
                task: c["pipelineTaskName"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string(),
            })
        })
        .collect()
}

/// `(pod, container)` of the first step that terminated non-zero.
pub(crate) fn first_failed_step(data: &serde_json::Value) -> Option<(String, String)> {
    let pod = data["status"]["podName"].as_str()?.to_string();
    let steps = data["status"]["steps"].as_array()?;
    for step in steps {
        let exit_code = step["terminated"]["exitCode"].as_i64().unwrap_or(0);
        if exit_code != 0 {
            let container = step["container"]
                .as_str()
                .map(str::to_string)
                .or_else(|| step["name"].as_str().map(|n| format!("step-{n}")))?;
            return Some((pod, container));
        }
    }
    None
}

pub(crate) fn format_task_state(data: &serde_json::Value) -> String {
    match succeeded_condition(data) {
        Some(true) => "Succeeded".to_string(),
        Some(false) => "Failed".to_string(),
        None => {
            if data["status"]["startTime"].is_string() {
                "Running".to_string()
            } else {
                "Pending".to_string()
            }
        }
    }
}
