mod common;

use common::{native_pair, output_values, uint32_request};
use tensor_serving_server::{wait_until_model_not_ready, Client, Error, ParameterMap};

#[tokio::test]
async fn shared_worker_load_reuses_the_endpoint() {
    let (_server, client) = native_pair();

    assert!(client.model_list().await.unwrap().is_empty());

    let endpoint = client.worker_load("echo", &ParameterMap::new()).await.unwrap();
    assert_eq!(endpoint, "echo");
    // a redundant load lands on the same endpoint
    let endpoint = client.worker_load("echo", &ParameterMap::new()).await.unwrap();
    assert_eq!(endpoint, "echo");

    // a different configuration gets its own endpoint
    let mut parameters = ParameterMap::new();
    parameters.put("workers", 2);
    let endpoint_1 = client.worker_load("echo", &parameters).await.unwrap();
    assert_eq!(endpoint_1, "echo-0");

    assert!(client.model_ready(&endpoint).await.unwrap());
    assert!(client.model_ready(&endpoint_1).await.unwrap());

    client.worker_unload(&endpoint).await.unwrap(); // first reference
    client.worker_unload(&endpoint).await.unwrap(); // second reference
    client.worker_unload(&endpoint).await.unwrap(); // no-op
    client.worker_unload(&endpoint_1).await.unwrap();

    assert!(client.model_list().await.unwrap().is_empty());
}

#[tokio::test]
async fn non_shared_loads_are_independent() {
    let (_server, client) = native_pair();

    let mut parameters = ParameterMap::new();
    parameters.put("share", false);
    let first = client.worker_load("echo", &parameters).await.unwrap();
    let second = client.worker_load("echo", &parameters).await.unwrap();
    assert_eq!(first, "echo-0");
    assert_eq!(second, "echo-1");
    assert!(client.model_ready(&first).await.unwrap());
    assert!(client.model_ready(&second).await.unwrap());

    // unloading one leaves the other serving
    client.worker_unload(&first).await.unwrap();
    wait_until_model_not_ready(&client, &first).await.unwrap();
    assert!(!client.model_ready(&first).await.unwrap());
    assert!(client.model_ready(&second).await.unwrap());

    let response = client
        .model_infer(&second, uint32_request(&[3]))
        .await
        .unwrap();
    assert_eq!(output_values(&response, 0), vec![4]);

    client.worker_unload(&second).await.unwrap();
}

#[tokio::test]
async fn model_list_tracks_the_lifecycle() {
    let (_server, client) = native_pair();

    assert!(client.model_list().await.unwrap().is_empty());

    let echo = client.worker_load("echo", &ParameterMap::new()).await.unwrap();
    let multi = client
        .worker_load("echo_multi", &ParameterMap::new())
        .await
        .unwrap();

    let mut models = client.model_list().await.unwrap();
    models.sort();
    assert_eq!(models, vec!["echo".to_string(), "echo_multi".to_string()]);

    client.worker_unload(&echo).await.unwrap();
    client.worker_unload(&multi).await.unwrap();
    assert!(client.model_list().await.unwrap().is_empty());
}

#[tokio::test]
async fn unknown_worker_load_fails() {
    let (_server, client) = native_pair();
    let result = client.worker_load("warp_drive", &ParameterMap::new()).await;
    assert!(matches!(result, Err(Error::FileNotFound(_))));
}

#[tokio::test]
async fn model_metadata_describes_the_worker() {
    let (_server, client) = native_pair();
    let endpoint = client.worker_load("echo", &ParameterMap::new()).await.unwrap();

    let metadata = client.model_metadata(&endpoint).await.unwrap();
    assert_eq!(metadata.name, "echo");
    assert_eq!(metadata.inputs.len(), 1);
    assert_eq!(metadata.outputs.len(), 1);

    let missing = client.model_metadata("missing").await;
    assert!(matches!(missing, Err(Error::InvalidArgument(_))));

    client.worker_unload(&endpoint).await.unwrap();
}
