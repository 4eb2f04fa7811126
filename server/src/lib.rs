//! Batching tensor inference server.
//!
//! Requests enter through a transport (HTTP or the in-process client),
//! land on an endpoint's ingress queue, are grouped into [`Batch`]es by
//! batcher threads, and flow through one or more [`Worker`] stages that
//! either complete them or forward them down an ensemble chain. Buffers
//! backing the batches come from a [`MemoryPool`] keyed by memory kind.

pub mod api;
pub mod batch;
pub mod batcher;
pub mod client;
pub mod data_types;
pub mod endpoints;
pub mod error;
pub mod memory_pool;
pub mod models;
pub mod observation;
pub mod parameters;
pub mod request;
pub mod server;
pub mod tensor;
pub mod worker;
pub mod worker_info;
pub mod workers;

pub use batch::Batch;
pub use batcher::{BatcherConfig, BatcherKind};
pub use client::{
    infer_async_ordered, infer_async_ordered_batched, load_ensemble, server_has_extension,
    unload_models, wait_until_model_not_ready, wait_until_model_ready, wait_until_server_ready,
    Client, HttpClient, InferenceResponseFuture, NativeClient,
};
pub use data_types::DataType;
pub use endpoints::EndpointManager;
pub use error::Error;
pub use memory_pool::{Allocator, Buffer, MemoryKind, MemoryPool};
pub use models::{make_model, Model};
pub use parameters::{Parameter, ParameterMap};
pub use request::{
    Callback, InferenceRequest, InferenceRequestInput, InferenceRequestOutput, InferenceResponse,
    InferenceResponseOutput, TensorData, TraceContext,
};
pub use server::Server;
pub use tensor::{ModelMetadata, ServerMetadata, Tensor};
pub use worker::{make_worker, Worker, WorkerContext};
pub use worker_info::WorkerInfo;
