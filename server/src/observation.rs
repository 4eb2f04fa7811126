/// Metric names and registration
///
/// The pipeline stages record through the `metrics` facade; the server
/// binary decides whether an exporter is installed.
use metrics::{describe_counter, describe_gauge, describe_histogram};

pub const INGRESS_REQUESTS: &str = "tss_pipeline_ingress_requests_total";
pub const EGRESS_REQUESTS: &str = "tss_pipeline_egress_requests_total";
pub const REQUEST_ERRORS: &str = "tss_pipeline_request_errors_total";
pub const BATCHES_EMITTED: &str = "tss_batches_emitted_total";
pub const BATCH_SIZE: &str = "tss_batch_size";
pub const REQUEST_LATENCY: &str = "tss_request_latency_seconds";
pub const ACTIVE_ENDPOINTS: &str = "tss_active_endpoints";

pub fn describe() {
    describe_counter!(INGRESS_REQUESTS, "Requests accepted into the pipeline");
    describe_counter!(EGRESS_REQUESTS, "Requests completed by a terminal stage");
    describe_counter!(REQUEST_ERRORS, "Requests completed with an error response");
    describe_counter!(BATCHES_EMITTED, "Batches handed from a batcher to a worker");
    describe_histogram!(BATCH_SIZE, "Requests per emitted batch");
    describe_histogram!(REQUEST_LATENCY, "Seconds from batch admission to completion");
    describe_gauge!(ACTIVE_ENDPOINTS, "Endpoints currently registered");
}
