use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::SinkExt;
use futures::channel::mpsc::Sender;
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvVar, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, Pod, PodSpec,
    ResourceRequirements, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Status};
use kube::Client;
use kube::api::{Api, AttachParams, DeleteParams, PostParams, TerminalSize};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::errors::{BackendError, ProvisionError};
use crate::sessions::models::BackendKind;

use super::{BackendDriver, ExecOutput, SandboxHandle, SandboxSpec, SandboxStream, with_timeout};

const CONTAINER: &str = "agent";
const WORKSPACE_VOLUME: &str = "workspace";
const WORKSPACE_SIZE: &str = "10Gi";
const POLL_INTERVAL: Duration = Duration::from_secs(2);
const STOP_GRACE_SECS: i64 = 10;

/// Cluster pod backend. One pod per session, plus a workspace claim when a
/// storage class is requested.
pub struct KubernetesDriver {
    client: Client,
    namespace: String,
    terminals: Mutex<HashMap<String, Sender<TerminalSize>>>,
}

impl KubernetesDriver {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            terminals: Mutex::new(HashMap::new()),
        }
    }

    /// Connect with the ambient kubeconfig or in-cluster service account.
    pub async fn connect(namespace: &str) -> Result<Self> {
        let client = Client::try_default()
            .await
            .context("Failed to create Kubernetes client")?;
        Ok(Self::new(client, namespace))
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn claims(&self) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn terminal(&self, name: &str) -> Option<Sender<TerminalSize>> {
        self.terminals
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .cloned()
    }

    fn set_terminal(&self, name: &str, sender: Option<Sender<TerminalSize>>) {
        let mut terminals = self
            .terminals
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match sender {
            Some(s) => {
                terminals.insert(name.to_string(), s);
            }
            None => {
                terminals.remove(name);
            }
        }
    }

    /// Delete a pod and wait until the API no longer returns it, so the name
    /// can be reused.
    async fn delete_pod_and_wait(&self, name: &str, timeout: Duration) -> Result<(), ProvisionError> {
        let params = DeleteParams {
            grace_period_seconds: Some(0),
            ..Default::default()
        };
        match self.pods().delete(name, &params).await {
            Ok(_) => {}
            Err(kube::Error::Api(err)) if err.code == 404 => return Ok(()),
            Err(e) => return Err(provision_error(e)),
        }
        tokio::time::timeout(timeout, async {
            loop {
                match self.pods().get_opt(name).await {
                    Ok(None) => return Ok(()),
                    Ok(Some(_)) => tokio::time::sleep(POLL_INTERVAL).await,
                    Err(e) => return Err(provision_error(e)),
                }
            }
        })
        .await
        .map_err(|_| ProvisionError::Timeout {
            attempts: 1,
            timeout,
        })?
    }

    async fn ensure_claim(&self, spec: &SandboxSpec, class: &str) -> Result<(), ProvisionError> {
        match self
            .claims()
            .create(&PostParams::default(), &claim_manifest(spec, class))
            .await
        {
            Ok(_) => Ok(()),
            // The workspace survives pod recreation.
            Err(kube::Error::Api(err)) if err.code == 409 => Ok(()),
            Err(e) => Err(provision_error(e)),
        }
    }

    async fn wait_for_running(&self, spec: &SandboxSpec) -> Result<(), ProvisionError> {
        let result = tokio::time::timeout(spec.timeout, async {
            loop {
                let pod = self.pods().get(&spec.name).await.map_err(provision_error)?;
                match pod_readiness(&pod) {
                    Readiness::Running => return Ok(()),
                    Readiness::ImagePullFailed(reason) => {
                        return Err(ProvisionError::ImagePullFailed {
                            image: spec.image.clone(),
                            reason,
                        });
                    }
                    Readiness::Failed(phase) => {
                        return Err(ProvisionError::Unavailable(format!(
                            "pod {} entered phase {}",
                            spec.name, phase
                        )));
                    }
                    Readiness::Pending => tokio::time::sleep(POLL_INTERVAL).await,
                }
            }
        })
        .await;

        match result {
            Ok(r) => r,
            Err(_) => Err(ProvisionError::Timeout {
                attempts: 1,
                timeout: spec.timeout,
            }),
        }
    }

    async fn delete_ignoring_missing(&self, name: &str, grace: i64) -> Result<(), BackendError> {
        let params = DeleteParams {
            grace_period_seconds: Some(grace as u32),
            ..Default::default()
        };
        match self.pods().delete(name, &params).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(err)) if err.code == 404 => Ok(()),
            Err(e) => Err(backend_error(name, e)),
        }
    }
}

#[async_trait]
impl BackendDriver for KubernetesDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::ClusterPod
    }

    async fn create(&self, spec: &SandboxSpec) -> Result<SandboxHandle, ProvisionError> {
        self.delete_pod_and_wait(&spec.name, spec.timeout).await?;
        if let Some(class) = &spec.storage_class {
            self.ensure_claim(spec, class).await?;
        }

        self.pods()
            .create(&PostParams::default(), &pod_manifest(spec))
            .await
            .map_err(provision_error)?;
        tracing::info!(pod = %spec.name, namespace = %self.namespace, "pod created, waiting for readiness");

        self.wait_for_running(spec).await?;
        tracing::info!(pod = %spec.name, "pod running");
        Ok(spec.handle())
    }

    async fn attach_stream(&self, handle: &SandboxHandle) -> Result<SandboxStream, BackendError> {
        let params = AttachParams::interactive_tty().container(CONTAINER);
        let mut process = self
            .pods()
            .attach(&handle.name, &params)
            .await
            .map_err(|e| backend_error(&handle.name, e))?;

        let writer = process
            .stdin()
            .ok_or_else(|| BackendError::Engine("attach returned no stdin".to_string()))?;
        let reader = process
            .stdout()
            .ok_or_else(|| BackendError::Engine("attach returned no stdout".to_string()))?;
        self.set_terminal(&handle.name, process.terminal_size());

        let name = handle.name.clone();
        tokio::spawn(async move {
            if let Err(e) = process.join().await {
                tracing::debug!(pod = %name, error = %e, "attach session ended with error");
            }
        });

        Ok(SandboxStream {
            reader: Box::pin(reader),
            writer: Box::pin(writer),
        })
    }

    async fn exec(
        &self,
        handle: &SandboxHandle,
        argv: &[String],
        timeout: Duration,
    ) -> Result<ExecOutput, BackendError> {
        let params = AttachParams::default().container(CONTAINER);
        with_timeout(timeout, async {
            let mut process = self
                .pods()
                .exec(&handle.name, argv.to_vec(), &params)
                .await
                .map_err(|e| backend_error(&handle.name, e))?;

            let status = process.take_status();
            let (stdout, stderr) = tokio::join!(read_all(process.stdout()), read_all(process.stderr()));
            let status = match status {
                Some(status) => status.await,
                None => None,
            };

            Ok(ExecOutput {
                stdout: stdout?,
                stderr: stderr?,
                exit_code: exit_code_from_status(status.as_ref()),
            })
        })
        .await
    }

    async fn resize(&self, handle: &SandboxHandle, rows: u16, cols: u16) -> Result<(), BackendError> {
        let mut sender = self
            .terminal(&handle.name)
            .ok_or_else(|| BackendError::Engine(format!("{} has no open terminal", handle)))?;
        sender
            .send(TerminalSize {
                width: cols,
                height: rows,
            })
            .await
            .map_err(|e| BackendError::Engine(e.to_string()))
    }

    async fn stop(&self, handle: &SandboxHandle) -> Result<(), BackendError> {
        self.set_terminal(&handle.name, None);
        self.delete_ignoring_missing(&handle.name, STOP_GRACE_SECS).await
    }

    async fn remove(&self, handle: &SandboxHandle) -> Result<(), BackendError> {
        self.set_terminal(&handle.name, None);
        self.delete_ignoring_missing(&handle.name, 0).await?;
        let claim = claim_name(&handle.name);
        match self.claims().delete(&claim, &DeleteParams::default()).await {
            Ok(_) => {}
            Err(kube::Error::Api(err)) if err.code == 404 => {}
            Err(e) => return Err(backend_error(&claim, e)),
        }
        tracing::info!(pod = %handle, "pod removed");
        Ok(())
    }

    async fn exists(&self, handle: &SandboxHandle) -> Result<bool, BackendError> {
        self.pods()
            .get_opt(&handle.name)
            .await
            .map(|pod| pod.is_some())
            .map_err(|e| backend_error(&handle.name, e))
    }

    async fn exit_status(&self, handle: &SandboxHandle) -> Result<Option<i64>, BackendError> {
        let pod = self
            .pods()
            .get(&handle.name)
            .await
            .map_err(|e| backend_error(&handle.name, e))?;
        Ok(pod
            .status
            .and_then(|s| s.container_statuses)
            .unwrap_or_default()
            .into_iter()
            .find(|cs| cs.name == CONTAINER)
            .and_then(|cs| cs.state)
            .and_then(|state| state.terminated)
            .map(|t| i64::from(t.exit_code)))
    }
}

/// Drain an exec output stream. Commands may print bytes that are not UTF-8
/// (git quoting raw file names, for one), so decoding is lossy.
async fn read_all<R: AsyncRead + Unpin>(reader: Option<R>) -> Result<String, BackendError> {
    let mut out = Vec::new();
    if let Some(mut reader) = reader {
        reader.read_to_end(&mut out).await?;
    }
    Ok(String::from_utf8_lossy(&out).into_owned())
}

// ── Manifests ─────────────────────────────────────────────────────────

fn claim_name(pod: &str) -> String {
    format!("{}-workspace", pod)
}

fn pod_manifest(spec: &SandboxSpec) -> Pod {
    let mut limits = BTreeMap::new();
    limits.insert("cpu".to_string(), Quantity(spec.resources.cpus.to_string()));
    limits.insert("memory".to_string(), Quantity(spec.resources.k8s_memory()));

    let env = spec
        .env
        .iter()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            ..Default::default()
        })
        .collect();

    let volume = match &spec.storage_class {
        Some(_) => Volume {
            name: WORKSPACE_VOLUME.to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: claim_name(&spec.name),
                read_only: None,
            }),
            ..Default::default()
        },
        None => Volume {
            name: WORKSPACE_VOLUME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
    };

    Pod {
        metadata: ObjectMeta {
            name: Some(spec.name.clone()),
            labels: Some(spec.labels.clone()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            restart_policy: Some("Never".to_string()),
            containers: vec![Container {
                name: CONTAINER.to_string(),
                image: Some(spec.image.clone()),
                image_pull_policy: Some(spec.pull_policy.as_k8s().to_string()),
                command: spec.command.clone(),
                working_dir: Some(spec.workdir.clone()),
                env: Some(env),
                stdin: Some(true),
                tty: Some(true),
                resources: Some(ResourceRequirements {
                    limits: Some(limits.clone()),
                    requests: Some(limits),
                    ..Default::default()
                }),
                volume_mounts: Some(vec![VolumeMount {
                    name: WORKSPACE_VOLUME.to_string(),
                    mount_path: spec.workdir.clone(),
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            volumes: Some(vec![volume]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn claim_manifest(spec: &SandboxSpec, class: &str) -> PersistentVolumeClaim {
    let mut requests = BTreeMap::new();
    requests.insert("storage".to_string(), Quantity(WORKSPACE_SIZE.to_string()));
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(claim_name(&spec.name)),
            labels: Some(spec.labels.clone()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: Some(class.to_string()),
            resources: Some(VolumeResourceRequirements {
                requests: Some(requests),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

// ── Status interpretation ─────────────────────────────────────────────

#[derive(Debug, PartialEq)]
enum Readiness {
    Pending,
    Running,
    ImagePullFailed(String),
    Failed(String),
}

fn pod_readiness(pod: &Pod) -> Readiness {
    let Some(status) = &pod.status else {
        return Readiness::Pending;
    };

    for cs in status.container_statuses.iter().flatten() {
        if let Some(waiting) = cs.state.as_ref().and_then(|s| s.waiting.as_ref()) {
            let reason = waiting.reason.as_deref().unwrap_or_default();
            if matches!(reason, "ErrImagePull" | "ImagePullBackOff" | "InvalidImageName") {
                let detail = waiting.message.clone().unwrap_or_else(|| reason.to_string());
                return Readiness::ImagePullFailed(detail);
            }
        }
    }

    match status.phase.as_deref() {
        Some("Running") => Readiness::Running,
        Some(phase @ ("Failed" | "Succeeded" | "Unknown")) => Readiness::Failed(phase.to_string()),
        _ => Readiness::Pending,
    }
}

/// Exit code from the status frame the exec websocket ends with.
fn exit_code_from_status(status: Option<&Status>) -> i64 {
    let Some(status) = status else {
        return -1;
    };
    if status.status.as_deref() == Some("Success") {
        return 0;
    }
    status
        .details
        .as_ref()
        .and_then(|d| d.causes.as_ref())
        .and_then(|causes| {
            causes
                .iter()
                .find(|c| c.reason.as_deref() == Some("ExitCode"))
        })
        .and_then(|c| c.message.as_deref())
        .and_then(|m| m.parse().ok())
        .unwrap_or(1)
}

fn is_quota_error(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 403 && resp.message.contains("exceeded quota"))
}

fn provision_error(e: kube::Error) -> ProvisionError {
    if is_quota_error(&e) {
        return ProvisionError::ResourceQuotaExceeded(e.to_string());
    }
    ProvisionError::Unavailable(e.to_string())
}

fn backend_error(name: &str, e: kube::Error) -> BackendError {
    match e {
        kube::Error::Api(resp) if resp.code == 404 => BackendError::NotFound(name.to_string()),
        other => BackendError::Engine(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::models::{PullPolicy, ResourceLimits};
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateWaiting, ContainerStatus, PodStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{StatusCause, StatusDetails};

    fn spec(storage_class: Option<&str>) -> SandboxSpec {
        SandboxSpec {
            name: "harbor-abc".into(),
            image: "ghcr.io/acme/agent:1".into(),
            resources: ResourceLimits {
                cpus: 2.0,
                memory: "4g".into(),
            },
            pull_policy: PullPolicy::Always,
            storage_class: storage_class.map(String::from),
            workdir: "/workspace".into(),
            env: vec![("GH_TOKEN".into(), "t0k".into())],
            labels: BTreeMap::new(),
            command: None,
            timeout: Duration::from_secs(60),
        }
    }

    #[test]
    fn test_pod_manifest_limits_and_tty() {
        let pod = pod_manifest(&spec(None));
        let container = &pod.spec.as_ref().unwrap().containers[0];
        assert_eq!(container.name, "agent");
        assert_eq!(container.tty, Some(true));
        assert_eq!(container.stdin, Some(true));
        assert_eq!(container.image_pull_policy.as_deref(), Some("Always"));
        let limits = container.resources.as_ref().unwrap().limits.as_ref().unwrap();
        assert_eq!(limits["memory"], Quantity("4Gi".into()));
        assert_eq!(limits["cpu"], Quantity("2".into()));
        let volumes = pod.spec.unwrap().volumes.unwrap();
        assert!(volumes[0].empty_dir.is_some());
    }

    #[test]
    fn test_storage_class_uses_claim() {
        let pod = pod_manifest(&spec(Some("fast-ssd")));
        let volumes = pod.spec.unwrap().volumes.unwrap();
        assert_eq!(
            volumes[0].persistent_volume_claim.as_ref().unwrap().claim_name,
            "harbor-abc-workspace"
        );
        let claim = claim_manifest(&spec(Some("fast-ssd")), "fast-ssd");
        assert_eq!(
            claim.spec.unwrap().storage_class_name.as_deref(),
            Some("fast-ssd")
        );
    }

    fn pod_with(phase: &str, waiting_reason: Option<&str>) -> Pod {
        Pod {
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                container_statuses: Some(vec![ContainerStatus {
                    name: "agent".into(),
                    state: waiting_reason.map(|r| ContainerState {
                        waiting: Some(ContainerStateWaiting {
                            reason: Some(r.to_string()),
                            message: None,
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_readiness_classification() {
        assert_eq!(pod_readiness(&pod_with("Running", None)), Readiness::Running);
        assert_eq!(pod_readiness(&pod_with("Pending", None)), Readiness::Pending);
        assert_eq!(
            pod_readiness(&pod_with("Pending", Some("ImagePullBackOff"))),
            Readiness::ImagePullFailed("ImagePullBackOff".into())
        );
        assert_eq!(
            pod_readiness(&pod_with("Failed", None)),
            Readiness::Failed("Failed".into())
        );
        assert_eq!(pod_readiness(&Pod::default()), Readiness::Pending);
    }

    #[test]
    fn test_exit_code_from_status() {
        let ok = Status {
            status: Some("Success".into()),
            ..Default::default()
        };
        assert_eq!(exit_code_from_status(Some(&ok)), 0);

        let failed = Status {
            status: Some("Failure".into()),
            details: Some(StatusDetails {
                causes: Some(vec![StatusCause {
                    reason: Some("ExitCode".into()),
                    message: Some("128".into()),
                    field: None,
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(exit_code_from_status(Some(&failed)), 128);
        assert_eq!(exit_code_from_status(None), -1);
    }

    #[tokio::test]
    async fn test_exec_output_tolerates_invalid_utf8() {
        let raw: &[u8] = b"?? \"caf\xe9.txt\"\n";
        let text = read_all(Some(raw)).await.unwrap();
        assert_eq!(text, "?? \"caf\u{fffd}.txt\"\n");
        assert_eq!(read_all(None::<&[u8]>).await.unwrap(), "");
    }
}
