// 📡 Paginated Fetcher - offset pagination over the open-data catalog API
// Fail-soft: any failing request ends the dataset with what was collected.

use crate::config::ApiConfig;
use crate::error::FetchError;
use crate::normalizer::RawRow;
use anyhow::Context;
use serde::Deserialize;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

// ============================================================================
// TRANSPORT
// ============================================================================

/// One GET request; the response body on success
pub trait Transport {
    fn get(&self, url: &str, query: &[(String, String)]) -> Result<Vec<u8>, FetchError>;
}

/// Blocking reqwest client with a per-request timeout
pub struct HttpTransport {
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    pub fn new(api: &ApiConfig) -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(api.timeout())
            .user_agent(api.user_agent.clone())
            .build()
            .context("Failed to build HTTP client")?;
        Ok(HttpTransport { client })
    }
}

impl Transport for HttpTransport {
    fn get(&self, url: &str, query: &[(String, String)]) -> Result<Vec<u8>, FetchError> {
        let classify = |e: reqwest::Error| {
            if e.is_timeout() {
                FetchError::Timeout { url: url.to_string() }
            } else {
                FetchError::Transport {
                    url: url.to_string(),
                    message: e.to_string(),
                }
            }
        };

        let response = self.client.get(url).query(query).send().map_err(classify)?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response.bytes().map_err(classify)?;
        Ok(body.to_vec())
    }
}

// ============================================================================
// THROTTLE
// ============================================================================

/// Minimum spacing between consecutive requests
#[derive(Debug)]
pub struct Throttle {
    delay: Duration,
    last: Option<Instant>,
}

impl Throttle {
    pub fn new(delay: Duration) -> Self {
        Throttle { delay, last: None }
    }

    pub fn wait(&mut self) {
        if let Some(last) = self.last {
            let elapsed = last.elapsed();
            if elapsed < self.delay {
                thread::sleep(self.delay - elapsed);
            }
        }
        self.last = Some(Instant::now());
    }
}

// ============================================================================
// OUTCOMES
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct FetchOutcome {
    pub rows: Vec<RawRow>,

    /// `total_count` announced by the first page
    pub reported_total: Option<u64>,

    /// False when a request failed or the offset cap was hit
    pub complete: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DownloadOutcome {
    pub bytes: Option<Vec<u8>>,
}

impl DownloadOutcome {
    pub fn is_complete(&self) -> bool {
        self.bytes.is_some()
    }
}

#[derive(Debug, Deserialize)]
struct Page {
    total_count: Option<u64>,

    #[serde(default, alias = "results")]
    records: Vec<RawRow>,
}

// ============================================================================
// FETCHER
// ============================================================================

pub struct PaginatedFetcher<'t, T: Transport + ?Sized> {
    transport: &'t T,
    base_url: String,
    page_size: usize,
    max_offset: usize,
    throttle: Throttle,
}

impl<'t, T: Transport + ?Sized> PaginatedFetcher<'t, T> {
    pub fn new(transport: &'t T, api: &ApiConfig) -> Self {
        PaginatedFetcher {
            transport,
            base_url: api.base_url.trim_end_matches('/').to_string(),
            page_size: api.page_size.max(1),
            max_offset: api.max_offset,
            throttle: Throttle::new(api.delay()),
        }
    }

    fn records_url(&self, dataset_id: &str) -> String {
        format!("{}/{}/records", self.base_url, dataset_id)
    }

    fn request_page(&mut self, url: &str, offset: usize, filter: Option<&str>) -> Result<Page, FetchError> {
        let mut query = vec![
            ("limit".to_string(), self.page_size.to_string()),
            ("offset".to_string(), offset.to_string()),
        ];
        if let Some(filter) = filter {
            query.push(("where".to_string(), filter.to_string()));
        }

        self.throttle.wait();
        let body = self.transport.get(url, &query)?;
        serde_json::from_slice(&body).map_err(|e| FetchError::Decode {
            url: url.to_string(),
            message: e.to_string(),
        })
    }

    /// Every page of a dataset, in upstream order
    pub fn fetch(&mut self, dataset_id: &str, filter: Option<&str>) -> FetchOutcome {
        let url = self.records_url(dataset_id);
        let mut rows: Vec<RawRow> = Vec::new();
        let mut reported_total: Option<u64> = None;
        let mut offset = 0;

        loop {
            if offset + self.page_size > self.max_offset {
                warn!(
                    dataset = dataset_id,
                    offset,
                    max_offset = self.max_offset,
                    rows = rows.len(),
                    "offset cap reached, dataset truncated"
                );
                return FetchOutcome {
                    rows,
                    reported_total,
                    complete: false,
                };
            }

            let page = match self.request_page(&url, offset, filter) {
                Ok(page) => page,
                Err(e) => {
                    warn!(dataset = dataset_id, offset, rows = rows.len(), error = %e, "fetch aborted, keeping partial rows");
                    return FetchOutcome {
                        rows,
                        reported_total,
                        complete: false,
                    };
                }
            };

            if reported_total.is_none() {
                reported_total = page.total_count;
            }

            let received = page.records.len();
            rows.extend(page.records);
            debug!(dataset = dataset_id, offset, received, total = rows.len(), "page fetched");

            if received == 0 {
                break;
            }
            match reported_total {
                Some(total) if rows.len() as u64 >= total => break,
                None if received < self.page_size => break,
                _ => {}
            }

            offset += self.page_size;
        }

        let complete = reported_total.map_or(true, |total| rows.len() as u64 >= total);
        info!(dataset = dataset_id, rows = rows.len(), ?reported_total, complete, "dataset fetched");

        FetchOutcome {
            rows,
            reported_total,
            complete,
        }
    }

    /// One-shot CSV export
    pub fn download(&mut self, url: &str) -> DownloadOutcome {
        self.throttle.wait();
        match self.transport.get(url, &[]) {
            Ok(bytes) => {
                info!(url, bytes = bytes.len(), "export downloaded");
                DownloadOutcome { bytes: Some(bytes) }
            }
            Err(e) => {
                warn!(url, error = %e, "download failed");
                DownloadOutcome { bytes: None }
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
