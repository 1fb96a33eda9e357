//! The HTTP invoker: one outbound request per delivery attempt.

use std::time::Duration;

use courier_common::record::DeliveryRecord;
use http::Method;
use reqwest::header;

use crate::error::DispatchError;

/// Build the client shared by every dispatch of a worker: a default
/// JSON content type, a service User-Agent and the fixed per-call
/// timeout.
pub fn build_client(request_timeout: Duration) -> reqwest::Client {
    let mut headers = header::HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );

    reqwest::Client::builder()
        .default_headers(headers)
        .user_agent("courier-worker")
        .timeout(request_timeout)
        .build()
        .expect("failed to construct reqwest client for delivery worker")
}

/// Whether the verb can carry a request body at all. Payloads on these
/// verbs are dropped rather than sent.
fn carries_body(method: &Method) -> bool {
    !matches!(*method, Method::GET | Method::HEAD)
}

/// Perform a single delivery of `record` and classify the outcome.
///
/// A 2xx or 3xx response is a successful delivery. A response of 400
/// and above is a failed delivery ([`DispatchError::FailedStatus`]),
/// distinct from connection-level failures and timeouts
/// ([`DispatchError::TransportError`]). Method and URL parse failures
/// mean the record can never be delivered.
pub async fn invoke(
    client: &reqwest::Client,
    record: &DeliveryRecord,
) -> Result<reqwest::Response, DispatchError> {
    let method = Method::from_bytes(record.method.as_bytes())
        .map_err(|_| DispatchError::ParseMethodError(record.method.clone()))?;
    let url: reqwest::Url = record
        .url
        .parse()
        .map_err(DispatchError::ParseUrlError)?;

    let mut request = client.request(method.clone(), url);

    if carries_body(&method) && record.has_payload() {
        request = request.body(record.payload.clone());
    }

    let response = request.send().await.map_err(DispatchError::TransportError)?;

    let status = response.status();
    if status.is_success() || status.is_redirection() {
        Ok(response)
    } else {
        Err(DispatchError::FailedStatus(status))
    }
}
