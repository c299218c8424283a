use reqwest::{Client, RequestBuilder, Response};
use tracing::debug;

use crate::{
    config::ClusterConfig,
    error::Error,
    types::{JobManifest, JobObject, JobStatus, PodList, CONTAINER_NAME},
};

/// Client for the subset of the Kubernetes API used to run one-shot Jobs
pub struct JobClient {
    client: Client,
    config: ClusterConfig,
}

impl JobClient {
    /// Create a new JobClient with the given configuration
    pub fn new(config: ClusterConfig) -> Result<Self, Error> {
        let mut builder = Client::builder().timeout(config.request_timeout);

        if let Some(pem) = &config.ca_cert {
            let certificate = reqwest::Certificate::from_pem(pem)
                .map_err(|e| Error::Configuration(format!("Invalid CA certificate: {}", e)))?;
            builder = builder.add_root_certificate(certificate);
        }

        let client = builder.build().map_err(Error::HttpClient)?;

        Ok(Self { client, config })
    }

    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    /// Create a Job and return its name
    pub async fn create_job(&self, manifest: &JobManifest) -> Result<String, Error> {
        let response = self
            .authorized(self.client.post(self.jobs_url()))
            .json(&manifest.to_json())
            .send()
            .await?;
        check(response).await?;

        debug!("Created job {} in {}", manifest.name, self.config.namespace);
        Ok(manifest.name.clone())
    }

    /// Fetch the pod counters of a Job
    pub async fn job_status(&self, name: &str) -> Result<JobStatus, Error> {
        let response = self
            .authorized(self.client.get(format!("{}/{}", self.jobs_url(), name)))
            .send()
            .await?;
        let job: JobObject = check(response).await?.json().await?;
        Ok(job.status)
    }

    /// Names of the pods spawned by a Job
    pub async fn job_pods(&self, name: &str) -> Result<Vec<String>, Error> {
        let response = self
            .authorized(self.client.get(self.pods_url()))
            .query(&[("labelSelector", format!("job-name={}", name))])
            .send()
            .await?;
        let pods: PodList = check(response).await?.json().await?;
        Ok(pods.items.into_iter().map(|pod| pod.metadata.name).collect())
    }

    /// Read the log of a single pod
    pub async fn pod_logs(&self, pod: &str) -> Result<String, Error> {
        let response = self
            .authorized(self.client.get(format!("{}/{}/log", self.pods_url(), pod)))
            .query(&[("container", CONTAINER_NAME)])
            .send()
            .await?;
        Ok(check(response).await?.text().await?)
    }

    /// Read the log of the first pod spawned by a Job
    pub async fn job_logs(&self, name: &str) -> Result<String, Error> {
        let pods = self.job_pods(name).await?;
        let pod = pods
            .first()
            .ok_or_else(|| Error::NoPods(name.to_string()))?;
        self.pod_logs(pod).await
    }

    /// Delete a Job and its pods. Returns `false` when the Job did not exist.
    pub async fn delete_job(&self, name: &str) -> Result<bool, Error> {
        let response = self
            .authorized(self.client.delete(format!("{}/{}", self.jobs_url(), name)))
            .query(&[("propagationPolicy", "Foreground")])
            .send()
            .await?;

        match check(response).await {
            Ok(_) => {
                debug!("Deleted job {}", name);
                Ok(true)
            }
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn jobs_url(&self) -> String {
        format!(
            "{}/apis/batch/v1/namespaces/{}/jobs",
            self.config.api_url, self.config.namespace
        )
    }

    fn pods_url(&self) -> String {
        format!(
            "{}/api/v1/namespaces/{}/pods",
            self.config.api_url, self.config.namespace
        )
    }
}

async fn check(response: Response) -> Result<Response, Error> {
    if !response.status().is_success() {
        return Err(Error::Api {
            status_code: response.status().as_u16(),
            message: response.text().await?,
        });
    }
    Ok(response)
}
