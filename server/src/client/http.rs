/// HTTP client over the KServe-flavored REST routes
use async_trait::async_trait;

use crate::api::{self, ErrorBody, InferenceResponseWire, LoadResponseWire, ModelListWire};
use crate::client::{Client, InferenceResponseFuture};
use crate::error::Error;
use crate::parameters::ParameterMap;
use crate::request::InferenceRequest;
use crate::tensor::{ModelMetadata, ServerMetadata};

#[derive(Clone)]
pub struct HttpClient {
    base: String,
    client: reqwest::Client,
}

impl HttpClient {
    /// `address` is the server root, e.g. `http://127.0.0.1:8998`.
    pub fn new(address: &str) -> Self {
        Self {
            base: address.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }
}

/// Turn a non-2xx reply into the structured error it carries.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, Error> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let message = match response.json::<ErrorBody>().await {
        Ok(body) => body.error,
        Err(_) => status.to_string(),
    };
    Err(Error::BadStatus(message))
}

#[async_trait]
impl Client for HttpClient {
    async fn server_live(&self) -> Result<bool, Error> {
        let response = self.client.get(self.url("/v2/health/live")).send().await?;
        Ok(response.status().is_success())
    }

    async fn server_ready(&self) -> Result<bool, Error> {
        let response = self.client.get(self.url("/v2/health/ready")).send().await?;
        Ok(response.status().is_success())
    }

    async fn server_metadata(&self) -> Result<ServerMetadata, Error> {
        let response = self.client.get(self.url("/v2")).send().await?;
        Ok(check_status(response).await?.json().await?)
    }

    async fn model_ready(&self, endpoint: &str) -> Result<bool, Error> {
        let response = self
            .client
            .get(self.url(&format!("/v2/models/{endpoint}/ready")))
            .send()
            .await?;
        Ok(response.status().is_success())
    }

    async fn model_metadata(&self, endpoint: &str) -> Result<ModelMetadata, Error> {
        let response = self
            .client
            .get(self.url(&format!("/v2/models/{endpoint}")))
            .send()
            .await?;
        Ok(check_status(response).await?.json().await?)
    }

    async fn model_list(&self) -> Result<Vec<String>, Error> {
        let response = self.client.get(self.url("/v2/models")).send().await?;
        let list: ModelListWire = check_status(response).await?.json().await?;
        Ok(list.models)
    }

    async fn worker_load(&self, worker: &str, parameters: &ParameterMap) -> Result<String, Error> {
        let response = self
            .client
            .post(self.url(&format!("/v2/workers/{worker}/load")))
            .json(parameters)
            .send()
            .await?;
        let load: LoadResponseWire = check_status(response).await?.json().await?;
        Ok(load.endpoint)
    }

    async fn worker_unload(&self, endpoint: &str) -> Result<(), Error> {
        let response = self
            .client
            .post(self.url(&format!("/v2/workers/{endpoint}/unload")))
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    async fn model_load(&self, model: &str, parameters: &ParameterMap) -> Result<String, Error> {
        let response = self
            .client
            .post(self.url(&format!("/v2/repository/models/{model}/load")))
            .json(parameters)
            .send()
            .await?;
        let load: LoadResponseWire = check_status(response).await?.json().await?;
        Ok(load.endpoint)
    }

    async fn model_unload(&self, model: &str) -> Result<(), Error> {
        let response = self
            .client
            .post(self.url(&format!("/v2/repository/models/{model}/unload")))
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    async fn model_infer_async(
        &self,
        endpoint: &str,
        request: InferenceRequest,
    ) -> Result<InferenceResponseFuture, Error> {
        // serialization failures surface before anything leaves the process
        let wire = api::request_to_wire(&request)?;
        let client = self.client.clone();
        let url = self.url(&format!("/v2/models/{endpoint}/infer"));

        Ok(Box::pin(async move {
            let response = client.post(url).json(&wire).send().await?;
            let wire: InferenceResponseWire = check_status(response).await?.json().await?;
            api::response_from_wire(wire)
        }))
    }
}
