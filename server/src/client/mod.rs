/// Client façade and dispatch helpers
///
/// One interface over the in-process endpoint manager and the HTTP
/// transport. The ordered-dispatch helpers reimpose submission order on
/// responses regardless of server-side completion order.
use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::error::Error;
use crate::parameters::ParameterMap;
use crate::request::{InferenceRequest, InferenceResponse};
use crate::tensor::{ModelMetadata, ServerMetadata};

mod http;
mod native;

pub use http::HttpClient;
pub use native::NativeClient;

/// Resolves to the response once the server-side callback fires.
pub type InferenceResponseFuture = BoxFuture<'static, Result<InferenceResponse, Error>>;

#[async_trait]
pub trait Client: Send + Sync {
    async fn server_live(&self) -> Result<bool, Error>;
    async fn server_ready(&self) -> Result<bool, Error>;
    async fn server_metadata(&self) -> Result<ServerMetadata, Error>;

    async fn model_ready(&self, endpoint: &str) -> Result<bool, Error>;
    async fn model_metadata(&self, endpoint: &str) -> Result<ModelMetadata, Error>;
    async fn model_list(&self) -> Result<Vec<String>, Error>;

    async fn worker_load(&self, worker: &str, parameters: &ParameterMap) -> Result<String, Error>;
    async fn worker_unload(&self, endpoint: &str) -> Result<(), Error>;
    async fn model_load(&self, model: &str, parameters: &ParameterMap) -> Result<String, Error>;
    async fn model_unload(&self, model: &str) -> Result<(), Error>;

    /// Submit a request and get a future for its response.
    async fn model_infer_async(
        &self,
        endpoint: &str,
        request: InferenceRequest,
    ) -> Result<InferenceResponseFuture, Error>;

    /// Submit a request and wait for its response.
    async fn model_infer(
        &self,
        endpoint: &str,
        request: InferenceRequest,
    ) -> Result<InferenceResponse, Error> {
        let future = self.model_infer_async(endpoint, request).await?;
        future.await
    }
}

/// Whether the server advertises `extension` in its metadata.
pub async fn server_has_extension<C: Client + ?Sized>(
    client: &C,
    extension: &str,
) -> Result<bool, Error> {
    let metadata = client.server_metadata().await?;
    Ok(metadata.extensions.iter().any(|name| name == extension))
}

/// Block until the server answers its readiness probe. Connection errors
/// are the only class retried, one second apart.
pub async fn wait_until_server_ready<C: Client + ?Sized>(client: &C) -> Result<(), Error> {
    loop {
        match client.server_ready().await {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(Error::Connection(_)) => tokio::time::sleep(Duration::from_secs(1)).await,
            Err(err) => return Err(err),
        }
    }
}

pub async fn wait_until_model_ready<C: Client + ?Sized>(
    client: &C,
    model: &str,
) -> Result<(), Error> {
    while !client.model_ready(model).await? {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    Ok(())
}

pub async fn wait_until_model_not_ready<C: Client + ?Sized>(
    client: &C,
    model: &str,
) -> Result<(), Error> {
    while client.model_ready(model).await? {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    Ok(())
}

/// Submit all requests in order and collect the responses in the same
/// order: `responses[i]` answers `requests[i]` no matter how the server
/// interleaves completion.
pub async fn infer_async_ordered<C: Client + ?Sized>(
    client: &C,
    model: &str,
    requests: Vec<InferenceRequest>,
) -> Result<Vec<InferenceResponse>, Error> {
    let mut queue = VecDeque::with_capacity(requests.len());
    for request in requests {
        queue.push_back(client.model_infer_async(model, request).await?);
    }

    let mut responses = Vec::with_capacity(queue.len());
    while let Some(future) = queue.pop_front() {
        responses.push(future.await?);
    }
    Ok(responses)
}

/// Ordered dispatch in windows of `batch_size`: issue a window, collect
/// it, move on. Keeps many-thousand-request runs from holding every
/// response future at once.
pub async fn infer_async_ordered_batched<C: Client + ?Sized>(
    client: &C,
    model: &str,
    requests: Vec<InferenceRequest>,
    batch_size: usize,
) -> Result<Vec<InferenceResponse>, Error> {
    if batch_size == 0 {
        return Err(Error::InvalidArgument(
            "batch_size must be positive".to_string(),
        ));
    }

    let mut responses = Vec::with_capacity(requests.len());
    let mut window = VecDeque::with_capacity(batch_size);
    let mut requests = requests.into_iter();
    loop {
        for request in requests.by_ref().take(batch_size) {
            window.push_back(client.model_infer_async(model, request).await?);
        }
        if window.is_empty() {
            break;
        }
        while let Some(future) = window.pop_front() {
            responses.push(future.await?);
        }
    }
    Ok(responses)
}

/// Load a chain of workers right-to-left, wiring each stage's `next` to
/// the one loaded before it. Returns the endpoints in chain order; submit
/// to the first.
pub async fn load_ensemble<C: Client + ?Sized>(
    client: &C,
    workers: &[&str],
    parameters: Vec<ParameterMap>,
) -> Result<Vec<String>, Error> {
    if workers.len() != parameters.len() {
        return Err(Error::InvalidArgument(
            "the number of workers and parameters must match".to_string(),
        ));
    }

    let mut endpoints = vec![String::new(); workers.len()];
    let mut next = String::new();
    for (i, (worker, mut parameter)) in workers.iter().zip(parameters).enumerate().rev() {
        if !next.is_empty() {
            parameter.put("next", next.as_str());
        }
        let endpoint = client.worker_load(worker, &parameter).await?;
        wait_until_model_ready(client, &endpoint).await?;
        next = endpoint.clone();
        endpoints[i] = endpoint;
    }
    Ok(endpoints)
}

pub async fn unload_models<C: Client + ?Sized>(client: &C, models: &[String]) -> Result<(), Error> {
    for model in models {
        client.model_unload(model).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A client whose responses complete in reverse submission order.
    struct ScrambledClient;

    #[async_trait]
    impl Client for ScrambledClient {
        async fn server_live(&self) -> Result<bool, Error> {
            Ok(true)
        }
        async fn server_ready(&self) -> Result<bool, Error> {
            Ok(true)
        }
        async fn server_metadata(&self) -> Result<ServerMetadata, Error> {
            Err(Error::Runtime("not implemented".into()))
        }
        async fn model_ready(&self, _endpoint: &str) -> Result<bool, Error> {
            Ok(true)
        }
        async fn model_metadata(&self, _endpoint: &str) -> Result<ModelMetadata, Error> {
            Err(Error::Runtime("not implemented".into()))
        }
        async fn model_list(&self) -> Result<Vec<String>, Error> {
            Ok(vec![])
        }
        async fn worker_load(
            &self,
            worker: &str,
            _parameters: &ParameterMap,
        ) -> Result<String, Error> {
            Ok(worker.to_string())
        }
        async fn worker_unload(&self, _endpoint: &str) -> Result<(), Error> {
            Ok(())
        }
        async fn model_load(&self, model: &str, _parameters: &ParameterMap) -> Result<String, Error> {
            Ok(model.to_string())
        }
        async fn model_unload(&self, _model: &str) -> Result<(), Error> {
            Ok(())
        }

        async fn model_infer_async(
            &self,
            _endpoint: &str,
            request: InferenceRequest,
        ) -> Result<InferenceResponseFuture, Error> {
            let index: u64 = request.id().parse().unwrap();
            Ok(Box::pin(async move {
                // later submissions resolve sooner
                tokio::time::sleep(Duration::from_millis(40u64.saturating_sub(index * 10))).await;
                let mut response = InferenceResponse::new();
                response.set_id(index.to_string());
                Ok(response)
            }))
        }
    }

    fn numbered_requests(count: usize) -> Vec<InferenceRequest> {
        (0..count)
            .map(|i| {
                let mut request = InferenceRequest::new();
                request.set_id(i.to_string());
                request
            })
            .collect()
    }

    #[tokio::test]
    async fn ordered_dispatch_realigns_responses() {
        let client = ScrambledClient;
        let responses = infer_async_ordered(&client, "echo", numbered_requests(4))
            .await
            .unwrap();
        let ids: Vec<&str> = responses.iter().map(|response| response.id()).collect();
        assert_eq!(ids, ["0", "1", "2", "3"]);
    }

    #[tokio::test]
    async fn ordered_batched_dispatch_covers_the_tail_window() {
        let client = ScrambledClient;
        // 5 requests in windows of 2: the last window is partial
        let responses = infer_async_ordered_batched(&client, "echo", numbered_requests(5), 2)
            .await
            .unwrap();
        let ids: Vec<&str> = responses.iter().map(|response| response.id()).collect();
        assert_eq!(ids, ["0", "1", "2", "3", "4"]);

        let result = infer_async_ordered_batched(&client, "echo", numbered_requests(1), 0).await;
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn load_ensemble_requires_matching_lengths() {
        let client = ScrambledClient;
        let result = load_ensemble(&client, &["a", "b"], vec![ParameterMap::new()]).await;
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }
}
