use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;

/// Name given to the single container of every Job
pub const CONTAINER_NAME: &str = "code-runner";

/// Scratch volume mounted into the container; also its working directory
pub const WORK_DIR: &str = "/code";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceQuantities {
    pub cpu: String,
    pub memory: String,
}

impl ResourceQuantities {
    pub fn new(cpu: impl Into<String>, memory: impl Into<String>) -> Self {
        Self {
            cpu: cpu.into(),
            memory: memory.into(),
        }
    }
}

/// Resource request/limit pair for the Job's container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResources {
    pub requests: ResourceQuantities,
    pub limits: ResourceQuantities,
}

impl Default for JobResources {
    fn default() -> Self {
        Self {
            requests: ResourceQuantities::new("100m", "128Mi"),
            limits: ResourceQuantities::new("500m", "256Mi"),
        }
    }
}

/// Everything needed to create one ephemeral Job
#[derive(Debug, Clone)]
pub struct JobManifest {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: Vec<(String, String)>,
    pub resources: JobResources,
    pub labels: BTreeMap<String, String>,
    /// Upper bound enforced by the cluster itself
    pub active_deadline: Option<Duration>,
}

impl JobManifest {
    pub fn new(image: impl Into<String>, command: Vec<String>) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), "code-execution".to_string());

        Self {
            name: format!("code-job-{}", uuid::Uuid::new_v4().simple()),
            image: image.into(),
            command,
            env: Vec::new(),
            resources: JobResources::default(),
            labels,
            active_deadline: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_resources(mut self, resources: JobResources) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_active_deadline(mut self, deadline: Duration) -> Self {
        self.active_deadline = Some(deadline);
        self
    }

    /// Render the manifest as a `batch/v1` Job object.
    pub fn to_json(&self) -> Value {
        let env: Vec<Value> = self
            .env
            .iter()
            .map(|(name, value)| json!({ "name": name, "value": value }))
            .collect();

        let mut spec = json!({
            "backoffLimit": 0,
            "template": {
                "metadata": { "labels": self.labels },
                "spec": {
                    "restartPolicy": "Never",
                    "automountServiceAccountToken": false,
                    "containers": [{
                        "name": CONTAINER_NAME,
                        "image": self.image,
                        "command": self.command,
                        "workingDir": WORK_DIR,
                        "env": env,
                        "resources": {
                            "requests": self.resources.requests,
                            "limits": self.resources.limits,
                        },
                        "volumeMounts": [{ "name": "code-volume", "mountPath": WORK_DIR }],
                    }],
                    "volumes": [{ "name": "code-volume", "emptyDir": {} }],
                },
            },
        });

        if let Some(deadline) = self.active_deadline {
            // Kubernetes rejects a zero deadline
            spec["activeDeadlineSeconds"] = json!(deadline.as_secs().max(1));
        }

        json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {
                "name": self.name,
                "labels": self.labels,
            },
            "spec": spec,
        })
    }
}

/// Pod counters reported in a Job's status
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct JobStatus {
    #[serde(default)]
    pub active: u32,
    #[serde(default)]
    pub succeeded: u32,
    #[serde(default)]
    pub failed: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Pending,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn phase(&self) -> JobPhase {
        if self.succeeded > 0 {
            JobPhase::Succeeded
        } else if self.failed > 0 {
            JobPhase::Failed
        } else {
            JobPhase::Pending
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct JobObject {
    #[serde(default)]
    pub status: JobStatus,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ObjectMeta {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PodObject {
    pub metadata: ObjectMeta,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PodList {
    #[serde(default)]
    pub items: Vec<PodObject>,
}
