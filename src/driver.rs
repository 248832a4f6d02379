use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::error::CdpError;
use chromiumoxide::Page;
use futures::StreamExt;
use log::{debug, warn};
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT_LANGUAGE, USER_AGENT};
use reqwest::Client;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::delay_manager;
use crate::error::FetchError;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

const USER_AGENTS: [&str; 4] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36 Edg/142.0.0.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Empty,
    Form(Vec<(String, String)>),
    Json(serde_json::Value),
}

/// Everything a driver needs to perform one fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestDescriptor {
    pub url: String,
    pub method: Method,
    pub body: RequestBody,
    pub headers: Vec<(String, String)>,
    pub timeout: Duration,
    /// Extra wait after the response arrives, for pages that finish rendering late.
    pub settle: Duration,
}

impl RequestDescriptor {
    pub fn get(url: impl Into<String>) -> Self {
        RequestDescriptor {
            url: url.into(),
            method: Method::Get,
            body: RequestBody::Empty,
            headers: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            settle: Duration::ZERO,
        }
    }

    pub fn post_form(url: impl Into<String>, fields: Vec<(String, String)>) -> Self {
        RequestDescriptor {
            method: Method::Post,
            body: RequestBody::Form(fields),
            ..RequestDescriptor::get(url)
        }
    }

    pub fn post_json(url: impl Into<String>, body: serde_json::Value) -> Self {
        RequestDescriptor {
            method: Method::Post,
            body: RequestBody::Json(body),
            ..RequestDescriptor::get(url)
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchedContent {
    pub status: u16,
    pub body: String,
}

impl FetchedContent {
    pub fn ok(body: impl Into<String>) -> Self {
        FetchedContent {
            status: 200,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// The body of a 2xx response, a `Status` error otherwise.
    pub fn into_success(self, url: &str) -> Result<String, FetchError> {
        if self.is_success() {
            Ok(self.body)
        } else {
            Err(FetchError::Status {
                status: self.status,
                url: url.to_string(),
            })
        }
    }
}

/// Something done to the driver's long-lived session page, for listings that
/// only page forward through script.
#[derive(Debug, Clone, PartialEq)]
pub enum PageAction {
    /// Load a URL into the session page.
    Open(RequestDescriptor),
    /// Click the first element matching one of `selectors`, in order, then wait `settle`.
    Click { selectors: Vec<String>, settle: Duration },
}

/// Fetches a request and hands back the raw content.
#[async_trait]
pub trait PageDriver: Send + Sync {
    async fn fetch(&self, request: &RequestDescriptor) -> Result<FetchedContent, FetchError>;

    /// Runs `action` on the session page and returns what the page shows afterwards.
    async fn perform(&self, action: &PageAction) -> Result<FetchedContent, FetchError> {
        match action {
            PageAction::Open(request) => self.fetch(request).await,
            PageAction::Click { selectors, .. } => Err(FetchError::Unsupported(format!(
                "click {} without a browser",
                selectors.join(" / ")
            ))),
        }
    }
}

/// Plain HTTP driver. The bureau hosts serve broken certificate chains, so
/// certificate validation is off.
pub struct HttpDriver {
    client: Client,
}

impl HttpDriver {
    pub fn new() -> Result<Self, FetchError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT_LANGUAGE,
            HeaderValue::from_static("zh-CN,zh;q=0.9,en;q=0.8"),
        );

        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .default_headers(headers)
            .cookie_store(true)
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| FetchError::Connection(format!("failed to build HTTP client: {}", e)))?;

        Ok(HttpDriver { client })
    }

    fn random_user_agent() -> &'static str {
        let mut rng = rand::thread_rng();
        USER_AGENTS[rng.gen_range(0..USER_AGENTS.len())]
    }
}

#[async_trait]
impl PageDriver for HttpDriver {
    async fn fetch(&self, request: &RequestDescriptor) -> Result<FetchedContent, FetchError> {
        debug!("Fetching {}", request.url);
        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url),
        };
        builder = builder
            .timeout(request.timeout)
            .header(USER_AGENT, Self::random_user_agent());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Form(fields) => builder.form(fields),
            RequestBody::Json(value) => builder.json(value),
        };

        let resp = builder.send().await.map_err(|e| classify(e, request.timeout))?;
        let status = resp.status().as_u16();
        let body = resp.text().await.map_err(|e| classify(e, request.timeout))?;

        delay_manager::settle(request.settle).await;
        Ok(FetchedContent { status, body })
    }
}

/// Headless Chromium, for pages that only render or paginate through script.
/// Details open in their own tab; listing actions share one session tab.
pub struct BrowserDriver {
    browser: Browser,
    session: Mutex<Option<Page>>,
    handler: JoinHandle<()>,
}

impl BrowserDriver {
    pub async fn launch() -> Result<Self, FetchError> {
        let config = BrowserConfig::builder()
            .arg(format!("--user-agent={}", USER_AGENTS[0]))
            .arg("--blink-settings=imagesEnabled=false")
            .arg("--mute-audio")
            .arg("--ignore-certificate-errors")
            .build()
            .map_err(|e| FetchError::Connection(format!("failed to configure browser: {}", e)))?;
        let (browser, mut events) = Browser::launch(config).await.map_err(cdp)?;
        let handler = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let Err(e) = event {
                    debug!("Browser event error: {}", e);
                }
            }
        });
        Ok(BrowserDriver {
            browser,
            session: Mutex::new(None),
            handler,
        })
    }

    async fn settled_content(page: &Page, request_timeout: Duration, settle: Duration) -> Result<String, FetchError> {
        match tokio::time::timeout(request_timeout, page.wait_for_navigation()).await {
            Ok(result) => {
                result.map_err(cdp)?;
            }
            Err(_) => return Err(FetchError::Timeout(request_timeout)),
        }
        delay_manager::settle(settle).await;
        page.content().await.map_err(cdp)
    }
}

impl Drop for BrowserDriver {
    fn drop(&mut self) {
        self.handler.abort();
    }
}

#[async_trait]
impl PageDriver for BrowserDriver {
    async fn fetch(&self, request: &RequestDescriptor) -> Result<FetchedContent, FetchError> {
        if request.method != Method::Get {
            return Err(FetchError::Unsupported(format!("post to {} from a browser tab", request.url)));
        }
        debug!("Rendering {}", request.url);
        let page = self.browser.new_page(request.url.as_str()).await.map_err(cdp)?;
        let content = Self::settled_content(&page, request.timeout, request.settle).await;
        if let Err(e) = page.close().await {
            warn!("Could not close tab for {}: {}", request.url, e);
        }
        Ok(FetchedContent::ok(content?))
    }

    async fn perform(&self, action: &PageAction) -> Result<FetchedContent, FetchError> {
        let mut session = self.session.lock().await;
        match action {
            PageAction::Open(request) => {
                debug!("Opening {} in the session tab", request.url);
                let page = match session.as_ref() {
                    Some(page) => {
                        page.goto(request.url.as_str()).await.map_err(cdp)?;
                        page.clone()
                    }
                    None => {
                        let page = self.browser.new_page(request.url.as_str()).await.map_err(cdp)?;
                        *session = Some(page.clone());
                        page
                    }
                };
                let body = Self::settled_content(&page, request.timeout, request.settle).await?;
                Ok(FetchedContent::ok(body))
            }
            PageAction::Click { selectors, settle } => {
                let page = session
                    .as_ref()
                    .ok_or_else(|| FetchError::Unsupported("click before any page is open".into()))?;
                let targets = serde_json::to_string(selectors).map_err(|e| FetchError::Decode(e.to_string()))?;
                let script = format!(
                    "(() => {{ for (const s of {}) {{ const el = document.querySelector(s); \
                     if (el) {{ el.click(); return true; }} }} return false; }})()",
                    targets
                );
                let clicked: bool = page
                    .evaluate(script)
                    .await
                    .map_err(cdp)?
                    .into_value()
                    .map_err(|e| FetchError::Decode(e.to_string()))?;
                if !clicked {
                    return Err(FetchError::Decode(format!("nothing to click for {}", selectors.join(" / "))));
                }
                delay_manager::settle(*settle).await;
                let body = page.content().await.map_err(cdp)?;
                Ok(FetchedContent::ok(body))
            }
        }
    }
}

fn cdp(e: CdpError) -> FetchError {
    match e {
        CdpError::Timeout => FetchError::Timeout(DEFAULT_TIMEOUT),
        other => FetchError::Connection(other.to_string()),
    }
}

fn classify(e: reqwest::Error, timeout: Duration) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout(timeout)
    } else {
        FetchError::from(e)
    }
}
