use super::orchestrator::{ApiRequest, RequestOrchestrator};
use super::resources::ResourceType;
use super::urls::{ListOptions, RetrieveOptions};
use crate::remote::error_code::{RemoteError, RemoteErrorCode};
use crate::stores::Priority;
use crate::{Error, ErrorContext, Result};
use futures::stream::{self, Stream};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The envelope every Comic Vine response is wrapped in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub error: String,
    pub limit: u32,
    pub offset: u32,
    pub number_of_page_results: u32,
    pub number_of_total_results: u32,
    pub status_code: i64,
    pub results: T,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl<T> ApiResponse<T> {
    /// More results exist past this page.
    pub fn has_more(&self) -> bool {
        self.offset + self.number_of_page_results < self.number_of_total_results
    }
}

/// Turn a non-OK envelope into an error so it is neither cached nor shared with
/// dedupe waiters.
pub fn check_status(body: &Value) -> Result<()> {
    let Some(status) = body.get("status_code").and_then(Value::as_i64) else {
        return Err(Error::validation_with_context(
            "response has no status_code",
            ErrorContext::new().with_source("comic_vine"),
        ));
    };
    match RemoteErrorCode::from_api_status(status) {
        None => Ok(()),
        Some(code) => {
            let message = body
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            Err(RemoteError::new(code, format!("status {status}: {message}")).into())
        }
    }
}

fn decode<T: DeserializeOwned>(body: Value) -> Result<ApiResponse<T>> {
    Ok(serde_json::from_value(body)?)
}

/// Typed Comic Vine client.
///
/// Every call goes through the orchestrator with the resource's list name as
/// the rate-limit key.
pub struct ComicVineClient {
    orchestrator: RequestOrchestrator,
    priority: Priority,
}

impl ComicVineClient {
    pub fn new(mut orchestrator: RequestOrchestrator) -> Self {
        orchestrator.set_validator(check_status);
        Self {
            orchestrator,
            priority: Priority::User,
        }
    }

    /// Priority for subsequent requests, e.g. `Background` for prefetching.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn orchestrator(&self) -> &RequestOrchestrator {
        &self.orchestrator
    }

    /// Untyped access to an already-built request.
    pub async fn execute(&self, request: &ApiRequest) -> Result<Value> {
        self.orchestrator.execute(request).await
    }

    pub async fn retrieve<T: DeserializeOwned>(
        &self,
        resource: ResourceType,
        id: u64,
        options: &RetrieveOptions,
    ) -> Result<ApiResponse<T>> {
        let request = ApiRequest::new(resource.detail_path(id), resource.list_name())
            .with_params(options.to_params())
            .with_priority(self.priority);
        decode(self.orchestrator.execute(&request).await?)
    }

    pub async fn list<T: DeserializeOwned>(
        &self,
        resource: ResourceType,
        options: &ListOptions,
    ) -> Result<ApiResponse<Vec<T>>> {
        let request = ApiRequest::new(resource.list_path(), resource.list_name())
            .with_params(options.to_params())
            .with_priority(self.priority);
        decode(self.orchestrator.execute(&request).await?)
    }

    /// Page through a list endpoint, starting at `options.offset`.
    ///
    /// The stream ends after the last page or the first error.
    pub fn pages<'a, T: DeserializeOwned + 'a>(
        &'a self,
        resource: ResourceType,
        options: ListOptions,
    ) -> impl Stream<Item = Result<ApiResponse<Vec<T>>>> + 'a {
        stream::try_unfold(Some(options), move |next| async move {
            let Some(options) = next else {
                return Ok::<_, Error>(None);
            };
            let page: ApiResponse<Vec<T>> = self.list(resource, &options).await?;
            let following = (page.has_more() && page.number_of_page_results > 0)
                .then(|| options.clone().with_offset(page.offset + page.number_of_page_results));
            Ok(Some((page, following)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_check_status() {
        assert!(check_status(&json!({"status_code": 1, "error": "OK"})).is_ok());

        let err = check_status(&json!({"status_code": 100, "error": "Invalid API Key"})).unwrap_err();
        assert_eq!(err.remote_code(), Some(RemoteErrorCode::Validation));
        assert!(err.to_string().contains("Invalid API Key"));

        let err = check_status(&json!({"status_code": 107, "error": "Rate limit"})).unwrap_err();
        assert!(err.is_throttling());

        assert!(check_status(&json!({"results": []})).is_err());
    }

    #[test]
    fn test_envelope_decoding() {
        let body = json!({
            "error": "OK",
            "limit": 2,
            "offset": 0,
            "number_of_page_results": 2,
            "number_of_total_results": 5,
            "status_code": 1,
            "results": [{"id": 1}, {"id": 2}],
            "version": "1.0"
        });
        let page: ApiResponse<Vec<Value>> = decode(body).unwrap();
        assert_eq!(page.results.len(), 2);
        assert!(page.has_more());
    }
}
