use std::future::Future;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::error::DetectionError;
use super::types::DetectionResult;

pub const DETECT_URL: &str = "https://detect.roboflow.com";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Anything that can turn an image URL into detections.
///
/// The dispatcher is generic over this so tests can script outcomes.
pub trait Detect {
    fn detect(
        &self,
        cancel: &CancellationToken,
        image_url: &str,
    ) -> impl Future<Output = Result<DetectionResult, DetectionError>>;
}

/// Two-step client: download the image, then post it base64-encoded to the
/// detection service. Holds only static configuration between calls.
#[derive(Debug, Clone)]
pub struct DetectionClient {
    api_key: String,
    model: String,
    base_url: String,
    timeout: Duration,
    client: Client,
}

impl DetectionClient {
    /// `base_url` is normally [`DETECT_URL`]; tests point it at a mock server.
    pub fn with_base_url(
        api_key: String,
        model: String,
        base_url: String,
        timeout: Duration,
    ) -> reqwest::Result<Self> {
        // The transport timeout bounds a download abandoned by a lost race.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            api_key,
            model,
            base_url,
            timeout,
            client,
        })
    }

    /// Detection endpoint without credentials; safe to log.
    pub fn endpoint(&self) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), self.model)
    }

    /// Downloads `image_url` and runs it through the detection model.
    ///
    /// One deadline covers both steps. Everything spawned for this call hangs
    /// off a child of `cancel` that is cancelled when the call returns.
    pub async fn detect(
        &self,
        cancel: &CancellationToken,
        image_url: &str,
    ) -> Result<DetectionResult, DetectionError> {
        let scope = cancel.child_token();
        let _scope_guard = scope.clone().drop_guard();

        match tokio::time::timeout(self.timeout, self.download_and_infer(&scope, image_url)).await
        {
            Ok(result) => result,
            Err(_) => Err(DetectionError::Timeout(self.timeout)),
        }
    }

    async fn download_and_infer(
        &self,
        scope: &CancellationToken,
        image_url: &str,
    ) -> Result<DetectionResult, DetectionError> {
        info!(image_url, "downloading image");
        let image = self.download_image(scope, image_url).await?;
        info!(bytes = image.len(), "image downloaded, sending to detection service");

        let result = tokio::select! {
            biased;
            _ = scope.cancelled() => Err(DetectionError::Cancelled),
            result = self.infer(&image) => result,
        }?;

        info!(predictions = result.len(), "inference completed");
        Ok(result)
    }

    /// Races the download against cancellation.
    ///
    /// The download runs in a detached task that reports through a oneshot
    /// channel. If cancellation wins, the task is abandoned rather than
    /// joined; it stops at its next poll of `scope` or when the transport
    /// timeout expires, and its result is dropped.
    async fn download_image(
        &self,
        scope: &CancellationToken,
        image_url: &str,
    ) -> Result<Vec<u8>, DetectionError> {
        let (tx, rx) = oneshot::channel();
        let client = self.client.clone();
        let url = image_url.to_owned();
        let task_scope = scope.clone();

        tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;
                _ = task_scope.cancelled() => return,
                outcome = fetch_image(&client, &url) => outcome,
            };
            let _ = tx.send(outcome);
        });

        tokio::select! {
            biased;
            _ = scope.cancelled() => Err(DetectionError::Cancelled),
            outcome = rx => outcome.unwrap_or(Err(DetectionError::DownloadInterrupted)),
        }
    }

    async fn infer(&self, image: &[u8]) -> Result<DetectionResult, DetectionError> {
        let encoded = STANDARD.encode(image);

        // The whole body is the base64 text, not a key=value form.
        let response = self
            .client
            .post(self.endpoint())
            .query(&[("api_key", self.api_key.as_str())])
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(encoded)
            .send()
            .await
            .map_err(DetectionError::Transport)?;

        let status = response.status();
        let body = response.bytes().await.map_err(DetectionError::Transport)?;

        if !status.is_success() {
            return Err(DetectionError::Rejected {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        debug!(bytes = body.len(), "detection response received");
        Ok(serde_json::from_slice(&body)?)
    }
}

impl Detect for DetectionClient {
    fn detect(
        &self,
        cancel: &CancellationToken,
        image_url: &str,
    ) -> impl Future<Output = Result<DetectionResult, DetectionError>> {
        DetectionClient::detect(self, cancel, image_url)
    }
}

async fn fetch_image(client: &Client, url: &str) -> Result<Vec<u8>, DetectionError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(DetectionError::Download)?;

    let status = response.status();
    if !status.is_success() {
        return Err(DetectionError::DownloadStatus {
            status: status.as_u16(),
        });
    }

    let bytes = response.bytes().await.map_err(DetectionError::Download)?;
    Ok(bytes.to_vec())
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::error::ErrorClass;
    use wiremock::matchers::{body_string, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const MODEL: &str = "pets/3";

    fn client_for(server: &MockServer, timeout: Duration) -> DetectionClient {
        DetectionClient::with_base_url("secret".into(), MODEL.into(), server.uri(), timeout)
            .unwrap()
    }

    async fn serve_image(server: &MockServer, bytes: Vec<u8>) -> String {
        Mock::given(method("GET"))
            .and(path("/a.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(bytes))
            .mount(server)
            .await;
        format!("{}/a.png", server.uri())
    }

    fn cancel_after(token: &CancellationToken, delay: Duration) {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            token.cancel();
        });
    }

    #[tokio::test]
    async fn detect_downloads_then_posts_base64_body() {
        let server = MockServer::start().await;
        let image = vec![7u8; 1024];
        let image_url = serve_image(&server, image.clone()).await;

        Mock::given(method("POST"))
            .and(path("/pets/3"))
            .and(query_param("api_key", "secret"))
            .and(header("content-type", "application/x-www-form-urlencoded"))
            .and(body_string(STANDARD.encode(&image)))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"predictions":[{"class":"cat","confidence":0.91}]}"#,
            ))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, DEFAULT_TIMEOUT);
        let result = client
            .detect(&CancellationToken::new(), &image_url)
            .await
            .unwrap();

        assert_eq!(result.len(), 1);
        assert_eq!(result.predictions[0].class(), Some("cat"));
        assert_eq!(result.predictions[0].confidence(), Some(0.91));
    }

    #[tokio::test]
    async fn download_not_found_is_transient_and_skips_inference() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing.png"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let client = client_for(&server, DEFAULT_TIMEOUT);
        let url = format!("{}/missing.png", server.uri());
        let err = client
            .detect(&CancellationToken::new(), &url)
            .await
            .unwrap_err();

        assert!(matches!(err, DetectionError::DownloadStatus { status: 404 }));
        assert_eq!(err.class(), ErrorClass::Transient);
    }

    #[tokio::test]
    async fn service_error_is_permanent_with_status_and_body() {
        let server = MockServer::start().await;
        let image_url = serve_image(&server, vec![1, 2, 3]).await;
        Mock::given(method("POST"))
            .and(path("/pets/3"))
            .respond_with(ResponseTemplate::new(500).set_body_string("internal error"))
            .mount(&server)
            .await;

        let client = client_for(&server, DEFAULT_TIMEOUT);
        let err = client
            .detect(&CancellationToken::new(), &image_url)
            .await
            .unwrap_err();

        match &err {
            DetectionError::Rejected { status, body } => {
                assert_eq!(*status, 500);
                assert_eq!(body, "internal error");
            }
            other => panic!("expected Rejected, got {other:?}"),
        }
        assert_eq!(err.class(), ErrorClass::Permanent);
    }

    #[tokio::test]
    async fn malformed_success_body_is_permanent() {
        let server = MockServer::start().await;
        let image_url = serve_image(&server, vec![1, 2, 3]).await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"detections":[]}"#))
            .mount(&server)
            .await;

        let client = client_for(&server, DEFAULT_TIMEOUT);
        let err = client
            .detect(&CancellationToken::new(), &image_url)
            .await
            .unwrap_err();

        assert!(matches!(err, DetectionError::MalformedResponse(_)));
        assert_eq!(err.class(), ErrorClass::Permanent);
    }

    #[tokio::test]
    async fn unreachable_service_is_transient() {
        let server = MockServer::start().await;
        let image_url = serve_image(&server, vec![1, 2, 3]).await;

        let client = DetectionClient::with_base_url(
            "secret".into(),
            MODEL.into(),
            "http://127.0.0.1:1".into(),
            DEFAULT_TIMEOUT,
        )
        .unwrap();
        let err = client
            .detect(&CancellationToken::new(), &image_url)
            .await
            .unwrap_err();

        assert!(matches!(err, DetectionError::Transport(_)));
        assert_eq!(err.class(), ErrorClass::Transient);
    }

    #[tokio::test]
    async fn cancellation_beats_slow_download() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/slow.png"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(vec![0u8; 16])
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let client = client_for(&server, DEFAULT_TIMEOUT);
        let cancel = CancellationToken::new();
        cancel_after(&cancel, Duration::from_millis(100));

        let started = Instant::now();
        let err = client
            .detect(&cancel, &format!("{}/slow.png", server.uri()))
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn cancellation_during_inference_returns_promptly() {
        let server = MockServer::start().await;
        let image_url = serve_image(&server, vec![1, 2, 3]).await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"{"predictions":[]}"#)
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let client = client_for(&server, DEFAULT_TIMEOUT);
        let cancel = CancellationToken::new();
        cancel_after(&cancel, Duration::from_millis(300));

        let started = Instant::now();
        let err = client.detect(&cancel, &image_url).await.unwrap_err();

        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn already_cancelled_token_sends_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let client = client_for(&server, DEFAULT_TIMEOUT);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = client
            .detect(&cancel, &format!("{}/a.png", server.uri()))
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn slow_inference_hits_deadline() {
        let server = MockServer::start().await;
        let image_url = serve_image(&server, vec![1, 2, 3]).await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"{"predictions":[]}"#)
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;

        let client = client_for(&server, Duration::from_millis(300));
        let err = client
            .detect(&CancellationToken::new(), &image_url)
            .await
            .unwrap_err();

        assert!(matches!(err, DetectionError::Timeout(d) if d == Duration::from_millis(300)));
        assert_eq!(err.class(), ErrorClass::Transient);
    }

    #[tokio::test]
    async fn deadline_is_shared_by_download_and_inference() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a.png"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(vec![1, 2, 3])
                    .set_delay(Duration::from_millis(250)),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"{"predictions":[]}"#)
                    .set_delay(Duration::from_millis(250)),
            )
            .mount(&server)
            .await;

        // Each step fits in the deadline on its own; together they do not.
        let client = client_for(&server, Duration::from_millis(400));
        let err = client
            .detect(&CancellationToken::new(), &format!("{}/a.png", server.uri()))
            .await
            .unwrap_err();

        assert!(matches!(err, DetectionError::Timeout(d) if d == Duration::from_millis(400)));
    }

    #[test]
    fn endpoint_hides_api_key() {
        let client = DetectionClient::with_base_url(
            "secret".into(),
            MODEL.into(),
            "https://detect.example/".into(),
            DEFAULT_TIMEOUT,
        )
        .unwrap();
        assert_eq!(client.endpoint(), "https://detect.example/pets/3");
        assert!(!client.endpoint().contains("secret"));
    }
}
