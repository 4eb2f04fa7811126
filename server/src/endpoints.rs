/// Endpoint registry: worker load/unload, sharing and ensembles
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use metrics::gauge;
use parking_lot::Mutex;
use tracing::info;

use crate::error::Error;
use crate::memory_pool::MemoryPool;
use crate::observation;
use crate::parameters::ParameterMap;
use crate::request::InferenceRequest;
use crate::tensor::{ModelMetadata, ServerMetadata};
use crate::worker_info::WorkerInfo;

/// Maps endpoint names to their supervisors. Endpoint names are unique,
/// ASCII and case-sensitive; collisions are resolved by appending `-N`.
pub struct EndpointManager {
    registry: Mutex<BTreeMap<String, Arc<WorkerInfo>>>,
    pool: Arc<MemoryPool>,
}

impl Default for EndpointManager {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointManager {
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(BTreeMap::new()),
            pool: Arc::new(MemoryPool::new()),
        }
    }

    pub fn server_metadata(&self) -> ServerMetadata {
        ServerMetadata {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            extensions: vec!["workers".to_string()],
        }
    }

    /// Load a worker and return the endpoint it serves under.
    ///
    /// With `share` (the default), a live endpoint of the same worker and
    /// equivalent parameters is reused by bumping its refcount. Otherwise a
    /// fresh supervisor starts under a `name-N` endpoint.
    pub fn worker_load(&self, worker_name: &str, parameters: &ParameterMap) -> Result<String, Error> {
        if worker_name.is_empty() || !worker_name.is_ascii() {
            return Err(Error::InvalidArgument(format!(
                "worker name must be non-empty ASCII, got '{worker_name}'"
            )));
        }
        let share = parameters.get_bool("share").unwrap_or(true);

        let mut registry = self.registry.lock();

        if share {
            if let Some(info) = registry
                .values()
                .find(|info| info.shares_with(worker_name, parameters))
            {
                info.increment();
                info!(endpoint = info.endpoint(), "sharing existing endpoint");
                return Ok(info.endpoint().to_string());
            }
        }

        let next = match parameters.get_string("next") {
            Some(next_endpoint) => {
                let info = registry.get(next_endpoint).ok_or_else(|| {
                    Error::InvalidArgument(format!(
                        "next endpoint '{next_endpoint}' is not loaded"
                    ))
                })?;
                if !chain_terminates(info) {
                    return Err(Error::InvalidArgument(format!(
                        "next endpoint '{next_endpoint}' is part of a cycle"
                    )));
                }
                Some(info.clone())
            }
            None => None,
        };

        let endpoint = unique_endpoint(&registry, worker_name, share);
        let info = WorkerInfo::load(
            endpoint.clone(),
            worker_name.to_string(),
            parameters,
            self.pool.clone(),
            next,
        )?;
        registry.insert(endpoint.clone(), info);
        gauge!(observation::ACTIVE_ENDPOINTS).set(registry.len() as f64);
        Ok(endpoint)
    }

    /// Drop one reference to an endpoint. The last reference joins the
    /// threads and releases the workers. Unknown endpoints are a no-op.
    pub fn worker_unload(&self, endpoint: &str) {
        let last = {
            let mut registry = self.registry.lock();
            let was_last = registry
                .get(endpoint)
                .map(|info| info.decrement())
                .unwrap_or(false);
            if was_last {
                let info = registry.remove(endpoint);
                gauge!(observation::ACTIVE_ENDPOINTS).set(registry.len() as f64);
                info
            } else {
                None
            }
        };
        // joining happens outside the registry lock
        if let Some(info) = last {
            info.shutdown();
        }
    }

    /// Load a worker under its model name. The worker implementation comes
    /// from the `worker` parameter when present.
    pub fn model_load(&self, model: &str, parameters: &ParameterMap) -> Result<String, Error> {
        let worker_name = parameters.get_string("worker").unwrap_or(model).to_string();
        self.worker_load(&worker_name, parameters)
    }

    pub fn model_unload(&self, model: &str) {
        self.worker_unload(model);
    }

    /// True once the endpoint's workers finished `acquire`. Unknown
    /// endpoints report false instead of erroring.
    pub fn model_ready(&self, endpoint: &str) -> bool {
        self.registry
            .lock()
            .get(endpoint)
            .is_some_and(|info| info.ready())
    }

    pub fn model_list(&self) -> Vec<String> {
        self.registry.lock().keys().cloned().collect()
    }

    pub fn model_metadata(&self, endpoint: &str) -> Result<ModelMetadata, Error> {
        self.registry
            .lock()
            .get(endpoint)
            .map(|info| info.metadata().clone())
            .ok_or_else(|| Error::InvalidArgument(format!("endpoint '{endpoint}' is not loaded")))
    }

    /// Put a request (with its callback attached) on the ingress queue of
    /// the chain head registered under `endpoint`.
    pub fn infer(&self, endpoint: &str, request: InferenceRequest) -> Result<(), Error> {
        let info = self
            .registry
            .lock()
            .get(endpoint)
            .cloned()
            .ok_or_else(|| Error::InvalidArgument(format!("endpoint '{endpoint}' is not loaded")))?;
        info.enqueue_request(request)
    }

    /// Unload everything. Used by server shutdown.
    pub fn unload_all(&self) {
        let drained: Vec<_> = {
            let mut registry = self.registry.lock();
            let drained = registry.values().cloned().collect();
            registry.clear();
            gauge!(observation::ACTIVE_ENDPOINTS).set(0.0);
            drained
        };
        for info in drained {
            info.shutdown();
        }
    }
}

/// Pick the endpoint string a fresh load registers under.
fn unique_endpoint(
    registry: &BTreeMap<String, Arc<WorkerInfo>>,
    worker_name: &str,
    share: bool,
) -> String {
    if share && !registry.contains_key(worker_name) {
        return worker_name.to_string();
    }
    let mut n = 0;
    loop {
        let candidate = format!("{worker_name}-{n}");
        if !registry.contains_key(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

/// Walk the `next` chain and confirm it reaches an end.
fn chain_terminates(start: &Arc<WorkerInfo>) -> bool {
    let mut seen = HashSet::new();
    let mut cursor = Some(start.clone());
    while let Some(info) = cursor {
        if !seen.insert(info.endpoint().to_string()) {
            return false;
        }
        cursor = info.next().cloned();
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_loads_reuse_the_endpoint() {
        let manager = EndpointManager::new();
        let params = ParameterMap::new();

        let endpoint = manager.worker_load("echo", &params).unwrap();
        assert_eq!(endpoint, "echo");
        let endpoint = manager.worker_load("echo", &params).unwrap();
        assert_eq!(endpoint, "echo");
        assert_eq!(manager.model_list(), vec!["echo"]);

        // two references: the first unload keeps the endpoint alive
        manager.worker_unload("echo");
        assert!(manager.model_ready("echo"));
        manager.worker_unload("echo");
        assert!(!manager.model_ready("echo"));
        assert!(manager.model_list().is_empty());

        // further unloads are no-ops
        manager.worker_unload("echo");
    }

    #[test]
    fn non_shared_loads_get_numbered_endpoints() {
        let manager = EndpointManager::new();
        let mut params = ParameterMap::new();
        params.put("share", false);

        let first = manager.worker_load("echo", &params).unwrap();
        let second = manager.worker_load("echo", &params).unwrap();
        assert_eq!(first, "echo-0");
        assert_eq!(second, "echo-1");
        assert!(manager.model_ready("echo-0"));
        assert!(manager.model_ready("echo-1"));

        // the two endpoints are independent
        manager.worker_unload("echo-0");
        assert!(!manager.model_ready("echo-0"));
        assert!(manager.model_ready("echo-1"));
        manager.worker_unload("echo-1");
    }

    #[test]
    fn different_parameters_do_not_share() {
        let manager = EndpointManager::new();
        let params = ParameterMap::new();
        let endpoint = manager.worker_load("echo", &params).unwrap();
        assert_eq!(endpoint, "echo");

        let mut other = ParameterMap::new();
        other.put("batch_size", 4);
        let endpoint = manager.worker_load("echo", &other).unwrap();
        assert_eq!(endpoint, "echo-0");

        manager.unload_all();
        assert!(manager.model_list().is_empty());
    }

    #[test]
    fn unknown_worker_fails_the_load() {
        let manager = EndpointManager::new();
        let result = manager.worker_load("warp_drive", &ParameterMap::new());
        assert!(matches!(result, Err(Error::FileNotFound(_))));
        assert!(manager.model_list().is_empty());
    }

    #[test]
    fn next_must_already_be_loaded() {
        let manager = EndpointManager::new();
        let mut params = ParameterMap::new();
        params.put("next", "missing");
        let result = manager.worker_load("echo", &params);
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn next_wires_an_ensemble_chain() {
        use std::sync::mpsc;
        use std::time::Duration;

        use crate::data_types::DataType;
        use crate::request::InferenceRequestInput;
        use crate::tensor::Tensor;

        let manager = EndpointManager::new();
        let tail = manager.worker_load("responder", &ParameterMap::new()).unwrap();
        let mut params = ParameterMap::new();
        params.put("next", tail.as_str());
        let head = manager.worker_load("invert_image", &params).unwrap();

        let (tx, rx) = mpsc::channel();
        let mut request = InferenceRequest::new();
        request.add_input_tensor(InferenceRequestInput::from_owned(
            Tensor::new("image", vec![1, 1, 3], DataType::Uint8),
            vec![1, 2, 3],
        ));
        request.set_callback(Box::new(move |response| {
            let _ = tx.send(response);
        }));
        manager.infer(&head, request).unwrap();

        let response = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(!response.is_error());
        assert_eq!(response.outputs()[0].data, vec![254, 253, 252]);

        manager.worker_unload(&head);
        manager.worker_unload(&tail);
        assert!(manager.model_list().is_empty());
    }

    #[test]
    fn model_load_is_keyed_by_model_name() {
        let manager = EndpointManager::new();
        let mut params = ParameterMap::new();
        params.put("worker", "echo");
        let endpoint = manager.model_load("my_model", &params).unwrap();
        assert_eq!(endpoint, "echo");
        manager.model_unload(&endpoint);
    }
}
