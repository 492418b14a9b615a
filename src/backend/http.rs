use super::*;
use std::time::Instant;

/// Shipping service reached over its REST API
pub struct HttpBackend {
    base_url: String,
    client: reqwest::Client,
}

impl HttpBackend {
    /// Create a client for the API rooted at `base_url` (e.g. `http://host/api`).
    ///
    /// No client-level timeout is set; the caller bounds every call.
    pub fn new(base_url: String) -> BackendResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| BackendError::Connection(e.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn post_json<Req, Resp>(&self, path: &str, body: &Req) -> BackendResult<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: for<'de> Deserialize<'de>,
    {
        let url = format!("{}/{}", self.base_url, path);
        let start = Instant::now();

        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        tracing::debug!(
            "POST {} -> {} in {}ms",
            url,
            status,
            start.elapsed().as_millis()
        );

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                status: status.as_u16(),
                body: truncate(&body, 200),
            });
        }

        response
            .json::<Resp>()
            .await
            .map_err(|e| BackendError::InvalidResponse(e.to_string()))
    }
}

fn map_reqwest_error(e: reqwest::Error) -> BackendError {
    if e.is_timeout() {
        BackendError::Timeout
    } else {
        BackendError::Connection(e.to_string())
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let mut out: String = text.chars().take(max_chars).collect();
        out.push('…');
        out
    }
}

#[async_trait]
impl ShippingBackend for HttpBackend {
    async fn get_rates(&self, request: &RateRequest) -> BackendResult<RateResponse> {
        self.post_json("get-rates", request).await
    }

    async fn create_label(&self, request: &LabelRequest) -> BackendResult<LabelResponse> {
        self.post_json("labels", request).await
    }

    fn name(&self) -> &str {
        "http"
    }
}
