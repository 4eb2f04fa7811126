/// In-process client: talks straight to the endpoint manager
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::client::{Client, InferenceResponseFuture};
use crate::endpoints::EndpointManager;
use crate::error::Error;
use crate::parameters::ParameterMap;
use crate::request::InferenceRequest;
use crate::server::Server;
use crate::tensor::{ModelMetadata, ServerMetadata};

#[derive(Clone)]
pub struct NativeClient {
    manager: Arc<EndpointManager>,
}

impl NativeClient {
    pub fn new(server: &Server) -> Self {
        Self {
            manager: server.manager(),
        }
    }
}

#[async_trait]
impl Client for NativeClient {
    async fn server_live(&self) -> Result<bool, Error> {
        Ok(true)
    }

    async fn server_ready(&self) -> Result<bool, Error> {
        Ok(true)
    }

    async fn server_metadata(&self) -> Result<ServerMetadata, Error> {
        Ok(self.manager.server_metadata())
    }

    async fn model_ready(&self, endpoint: &str) -> Result<bool, Error> {
        Ok(self.manager.model_ready(endpoint))
    }

    async fn model_metadata(&self, endpoint: &str) -> Result<ModelMetadata, Error> {
        self.manager.model_metadata(endpoint)
    }

    async fn model_list(&self) -> Result<Vec<String>, Error> {
        Ok(self.manager.model_list())
    }

    async fn worker_load(&self, worker: &str, parameters: &ParameterMap) -> Result<String, Error> {
        self.manager.worker_load(worker, parameters)
    }

    async fn worker_unload(&self, endpoint: &str) -> Result<(), Error> {
        self.manager.worker_unload(endpoint);
        Ok(())
    }

    async fn model_load(&self, model: &str, parameters: &ParameterMap) -> Result<String, Error> {
        self.manager.model_load(model, parameters)
    }

    async fn model_unload(&self, model: &str) -> Result<(), Error> {
        self.manager.model_unload(model);
        Ok(())
    }

    async fn model_infer_async(
        &self,
        endpoint: &str,
        mut request: InferenceRequest,
    ) -> Result<InferenceResponseFuture, Error> {
        let (response_tx, response_rx) = oneshot::channel();
        request.set_callback(Box::new(move |response| {
            let _ = response_tx.send(response);
        }));
        self.manager.infer(endpoint, request)?;

        Ok(Box::pin(async move {
            response_rx.await.map_err(|_| {
                Error::Runtime("the worker dropped the request without responding".to_string())
            })
        }))
    }
}
