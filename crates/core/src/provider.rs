//! Recognition Providers
//!
//! The sign-recognition model is an external collaborator. This module defines
//! the capability the dispatcher depends on, [`RecognitionProvider`], and the
//! stock implementations the service can be configured with.

use crate::{
    frame::{ChannelOrder, PixelBuffer},
    types::Prediction,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tokio::sync::Semaphore;

/// Classifies a single frame into a sign label.
///
/// Implementations must not block the calling task. CPU-bound models should
/// be wrapped in a [`BlockingProvider`] so that they run on the blocking pool.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecognitionProvider: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &'static str;

    /// Runs recognition on `pixels`, which are always 3-channel BGR.
    async fn predict(&self, pixels: PixelBuffer) -> Result<Prediction>;
}

/// Always answers with the same label at full confidence.
///
/// Used until a real model is wired in, and in tests.
#[derive(Debug, Clone)]
pub struct ConstantProvider {
    label: String,
}

impl ConstantProvider {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

impl Default for ConstantProvider {
    fn default() -> Self {
        Self::new("hello")
    }
}

#[async_trait]
impl RecognitionProvider for ConstantProvider {
    fn name(&self) -> &'static str {
        "constant"
    }

    async fn predict(&self, _pixels: PixelBuffer) -> Result<Prediction> {
        Ok(Prediction::new(self.label.clone(), 1.0))
    }
}

/// A synchronous, CPU-bound recognizer such as an in-process model.
pub trait Recognizer: Send + Sync + 'static {
    fn recognize(&self, pixels: &PixelBuffer) -> Result<Prediction>;
}

/// Runs a [`Recognizer`] on tokio's blocking pool.
///
/// A blocking call cannot be cancelled once started, so dropping the future
/// returned by `predict` leaves the recognizer running. At most
/// `max_concurrent` recognizer calls run at once; the permit travels with the
/// blocking closure and is only returned when the recognizer does. Size it to
/// the dispatcher's global in-flight cap.
pub struct BlockingProvider<R> {
    recognizer: Arc<R>,
    permits: Arc<Semaphore>,
}

impl<R: Recognizer> BlockingProvider<R> {
    pub fn new(recognizer: R, max_concurrent: usize) -> Self {
        Self {
            recognizer: Arc::new(recognizer),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }
}

#[async_trait]
impl<R: Recognizer> RecognitionProvider for BlockingProvider<R> {
    fn name(&self) -> &'static str {
        "blocking"
    }

    async fn predict(&self, pixels: PixelBuffer) -> Result<Prediction> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .context("recognizer pool is closed")?;
        let recognizer = Arc::clone(&self.recognizer);
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            recognizer.recognize(&pixels)
        })
        .await
        .context("recognizer task panicked")?
    }
}

#[derive(Serialize)]
struct InferenceRequest {
    width: u32,
    height: u32,
    channels: u8,
    channel_order: ChannelOrder,
    data: String,
}

/// Sends frames to a remote inference endpoint as JSON.
///
/// The request body is `{width, height, channels, channel_order, data}` with
/// `data` holding the base64 pixel bytes; the endpoint must answer with
/// `{label, confidence}`.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpProvider {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build inference HTTP client")?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl RecognitionProvider for HttpProvider {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn predict(&self, pixels: PixelBuffer) -> Result<Prediction> {
        let request = InferenceRequest {
            width: pixels.width(),
            height: pixels.height(),
            channels: pixels.channels(),
            channel_order: pixels.channel_order(),
            data: base64::engine::general_purpose::STANDARD.encode(pixels.as_bytes()),
        };
        drop(pixels);

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .context("inference request failed")?
            .error_for_status()
            .context("inference endpoint returned an error status")?;

        response
            .json::<Prediction>()
            .await
            .context("inference endpoint returned an invalid body")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use axum::{Json, Router, http::StatusCode, routing::post};
    use serde_json::{Value, json};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pixels(width: u32, height: u32) -> PixelBuffer {
        PixelBuffer::from_bgr(width, height, vec![1; (width * height * 3) as usize]).unwrap()
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}/predict")
    }

    #[tokio::test]
    async fn test_constant_provider() {
        let prediction = ConstantProvider::default().predict(pixels(1, 1)).await.unwrap();
        assert_eq!(prediction, Prediction::new("hello", 1.0));

        let prediction = ConstantProvider::new("thanks")
            .predict(pixels(2, 2))
            .await
            .unwrap();
        assert_eq!(prediction.label, "thanks");
    }

    struct WidthRecognizer;

    impl Recognizer for WidthRecognizer {
        fn recognize(&self, pixels: &PixelBuffer) -> Result<Prediction> {
            if pixels.width() == 0 {
                return Err(anyhow!("empty frame"));
            }
            Ok(Prediction::new(format!("w{}", pixels.width()), 0.5))
        }
    }

    #[tokio::test]
    async fn test_blocking_provider_runs_recognizer() {
        let provider = BlockingProvider::new(WidthRecognizer, 2);
        let prediction = provider.predict(pixels(3, 1)).await.unwrap();
        assert_eq!(prediction.label, "w3");

        let err = provider.predict(pixels(0, 0)).await.unwrap_err();
        assert!(err.to_string().contains("empty frame"));
    }

    /// Sleeps and records the peak number of overlapping calls.
    struct CountingRecognizer {
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl Recognizer for CountingRecognizer {
        fn recognize(&self, _pixels: &PixelBuffer) -> Result<Prediction> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(100));
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(Prediction::new("done", 1.0))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocking_provider_bounds_running_recognizers() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let provider = Arc::new(BlockingProvider::new(
            CountingRecognizer {
                running: Arc::clone(&running),
                peak: Arc::clone(&peak),
            },
            2,
        ));

        // Abandoned calls keep running in the background and keep their permit.
        for _ in 0..4 {
            let abandoned =
                tokio::time::timeout(Duration::from_millis(5), provider.predict(pixels(1, 1)))
                    .await;
            assert!(abandoned.is_err());
        }
        let calls: Vec<_> = (0..4)
            .map(|_| {
                let provider = Arc::clone(&provider);
                tokio::spawn(async move { provider.predict(pixels(1, 1)).await })
            })
            .collect();
        for call in calls {
            assert_eq!(call.await.unwrap().unwrap().label, "done");
        }

        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(running.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_provider_names() {
        assert_eq!(ConstantProvider::default().name(), "constant");
        assert_eq!(BlockingProvider::new(WidthRecognizer, 1).name(), "blocking");
        let http = HttpProvider::new("http://127.0.0.1:9/predict", Duration::from_secs(1)).unwrap();
        assert_eq!(http.name(), "http");
    }

    #[tokio::test]
    async fn test_http_provider_round_trip() {
        let router = Router::new().route(
            "/predict",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["width"], 2);
                assert_eq!(body["height"], 1);
                assert_eq!(body["channels"], 3);
                assert_eq!(body["channel_order"], "bgr");
                assert_eq!(body["data"], "AQEBAQEB");
                Json(json!({ "label": "thanks", "confidence": 0.75 }))
            }),
        );
        let endpoint = serve(router).await;

        let provider = HttpProvider::new(endpoint, Duration::from_secs(5)).unwrap();
        let prediction = provider.predict(pixels(2, 1)).await.unwrap();
        assert_eq!(prediction, Prediction::new("thanks", 0.75));
    }

    #[tokio::test]
    async fn test_http_provider_error_status() {
        let router = Router::new().route(
            "/predict",
            post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "model crashed") }),
        );
        let endpoint = serve(router).await;

        let provider = HttpProvider::new(endpoint, Duration::from_secs(5)).unwrap();
        let err = provider.predict(pixels(1, 1)).await.unwrap_err();
        assert!(err.to_string().contains("error status"));
    }
}
