//! REST API source with cursor pagination.
//!
//! Each dataset maps to a path template such as
//! `/vX/reference/financials?ticker={ticker}&filing_date.gte={start}&filing_date.lte={end}`.
//! Placeholders are filled from the unit parameters (plus `date` and `year`).
//! Responses carry a `results` array and an optional `next_url` cursor; the
//! fetcher follows cursors until exhausted, re-attaching the API key.
//!
//! Status mapping: 404 → `NotFound`; 429/5xx → `Transient` (retried, counts
//! toward the circuit breaker); 401/403 → `Fatal` and the breaker trips.

use super::circuit_breaker::CircuitBreaker;
use super::retry::RetryPolicy;
use super::{FetchError, SourceFetcher, SourcePayload, SourceUnit};
use chrono::Datelike;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSourceConfig {
    pub base_url: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    pub request_timeout_secs: u64,
    /// Upper bound on followed `next_url` cursors per unit.
    pub max_pages: usize,
    /// Dataset name → path template.
    pub endpoints: BTreeMap<String, String>,
}

impl Default for HttpSourceConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.polygon.io".to_string(),
            api_key_env: "POLYGON_API_KEY".to_string(),
            request_timeout_secs: 30,
            max_pages: 500,
            endpoints: BTreeMap::new(),
        }
    }
}

/// One decoded response page.
#[derive(Debug, PartialEq)]
struct Page {
    results: Vec<Value>,
    next_url: Option<String>,
}

pub struct HttpFetcher {
    client: reqwest::blocking::Client,
    config: HttpSourceConfig,
    api_key: Option<String>,
    retry: RetryPolicy,
    circuit_breaker: Arc<CircuitBreaker>,
}

impl HttpFetcher {
    pub fn new(
        config: HttpSourceConfig,
        api_key: Option<String>,
        retry: RetryPolicy,
        circuit_breaker: Arc<CircuitBreaker>,
    ) -> Result<Self, FetchError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(concat!("quantlake/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::Fatal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            config,
            api_key,
            retry,
            circuit_breaker,
        })
    }

    /// First-page URL for a unit.
    fn unit_url(&self, unit: &SourceUnit) -> Result<String, FetchError> {
        let template = self.config.endpoints.get(unit.dataset()).ok_or_else(|| {
            FetchError::Fatal(format!("no HTTP endpoint configured for '{}'", unit.dataset()))
        })?;
        let path = render_template(template, unit)?;
        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), path);
        Ok(self.with_api_key(url))
    }

    fn with_api_key(&self, url: String) -> String {
        match &self.api_key {
            Some(key) if !url.contains("apiKey=") => {
                let sep = if url.contains('?') { '&' } else { '?' };
                format!("{url}{sep}apiKey={key}")
            }
            _ => url,
        }
    }

    fn get_page(&self, url: &str) -> Result<Page, FetchError> {
        self.retry.run(|_| {
            if !self.circuit_breaker.is_allowed() {
                return Err(FetchError::Fatal(format!(
                    "circuit breaker open ({}s remaining)",
                    self.circuit_breaker.remaining_cooldown().as_secs()
                )));
            }

            let resp = self.client.get(url).send().map_err(|e| {
                if e.is_timeout() {
                    FetchError::Timeout(Duration::from_secs(self.config.request_timeout_secs))
                } else {
                    FetchError::Transient(format!("request failed: {e}"))
                }
            })?;

            let status = resp.status();
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                self.circuit_breaker.trip();
                return Err(FetchError::Fatal(format!("HTTP {status}: credentials rejected")));
            }
            if status == StatusCode::NOT_FOUND {
                return Err(FetchError::NotFound(format!("HTTP 404 for {}", redact(url))));
            }
            if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                self.circuit_breaker.record_failure();
                return Err(FetchError::Transient(format!("HTTP {status}")));
            }
            if !status.is_success() {
                return Err(FetchError::Fatal(format!("HTTP {status} for {}", redact(url))));
            }

            let body: Value = resp
                .json()
                .map_err(|e| FetchError::Transient(format!("unreadable response body: {e}")))?;
            self.circuit_breaker.record_success();
            parse_page(body)
        })
    }
}

impl SourceFetcher for HttpFetcher {
    fn name(&self) -> &str {
        "http"
    }

    fn fetch(&self, unit: &SourceUnit) -> Result<SourcePayload, FetchError> {
        let url = self.unit_url(unit)?;
        let (records, pages) = follow_cursors(
            url,
            self.config.max_pages,
            |url| self.get_page(url),
            |next| self.with_api_key(next),
        )
        .inspect_err(|e| tracing::warn!(unit = %unit.key, error = %e, "pagination failed"))?;
        tracing::debug!(unit = %unit.key, pages, records = records.len(), "fetched API records");
        Ok(SourcePayload::Records(records))
    }

    fn is_available(&self) -> bool {
        self.circuit_breaker.is_allowed()
    }
}

/// Replace `{name}` placeholders from unit params, `date` and `year`.
fn render_template(template: &str, unit: &SourceUnit) -> Result<String, FetchError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let close = after
            .find('}')
            .ok_or_else(|| FetchError::Fatal(format!("unclosed placeholder in '{template}'")))?;
        let name = &after[..close];
        let value = match name {
            "date" => unit.date.format("%Y-%m-%d").to_string(),
            "year" => unit.date.year().to_string(),
            _ => unit
                .param(name)
                .map(str::to_string)
                .or_else(|| unit.key.get(name).map(str::to_string))
                .ok_or_else(|| {
                    FetchError::Fatal(format!("no value for placeholder '{{{name}}}' in {}", unit.key))
                })?,
        };
        out.push_str(&value);
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Follow `next_url` cursors from `url` for at most `max_pages` pages.
/// A cursor still pending after the last allowed page is `Fatal`, never a
/// truncated result.
fn follow_cursors(
    mut url: String,
    max_pages: usize,
    mut get_page: impl FnMut(&str) -> Result<Page, FetchError>,
    rekey: impl Fn(String) -> String,
) -> Result<(Vec<Value>, usize), FetchError> {
    let max_pages = max_pages.max(1);
    let mut records = Vec::new();
    for page_no in 1..=max_pages {
        let page = get_page(url.as_str())?;
        records.extend(page.results);
        match page.next_url {
            Some(next) => url = rekey(next),
            None => return Ok((records, page_no)),
        }
    }
    Err(FetchError::Fatal(format!(
        "page limit of {max_pages} reached with more results pending"
    )))
}

fn parse_page(body: Value) -> Result<Page, FetchError> {
    let Value::Object(mut obj) = body else {
        return Err(FetchError::Fatal("response is not a JSON object".into()));
    };
    if obj.get("status").and_then(Value::as_str) == Some("ERROR") {
        let msg = obj
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        return Err(FetchError::Fatal(format!("API error: {msg}")));
    }

    let results = match obj.remove("results") {
        Some(Value::Array(items)) => items,
        Some(Value::Null) | None => Vec::new(),
        Some(single @ Value::Object(_)) => vec![single],
        Some(other) => {
            return Err(FetchError::Fatal(format!(
                "unexpected 'results' type: {other}"
            )))
        }
    };
    let next_url = obj
        .remove("next_url")
        .and_then(|v| v.as_str().map(str::to_string))
        .filter(|s| !s.is_empty());

    Ok(Page { results, next_url })
}

/// Strip the API key from a URL before it reaches logs or the ledger.
fn redact(url: &str) -> String {
    match url.find("apiKey=") {
        Some(pos) => {
            let end = url[pos..].find('&').map_or(url.len(), |i| pos + i);
            format!("{}apiKey=***{}", &url[..pos], &url[end..])
        }
        None => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::PartitionScheme;
    use chrono::NaiveDate;
    use serde_json::json;

    fn unit() -> SourceUnit {
        let scheme = PartitionScheme::new("fundamentals", &["ticker", "year"]);
        SourceUnit::new(
            scheme.key(&["AAPL", "2024"]).unwrap(),
            NaiveDate::from_ymd_opt(2024, 12, 31).unwrap(),
        )
        .with_scope("AAPL")
        .with_param("start", "2024-01-01")
        .with_param("end", "2024-12-31")
    }

    fn fetcher(api_key: Option<&str>) -> HttpFetcher {
        let mut config = HttpSourceConfig::default();
        config.endpoints.insert(
            "fundamentals".into(),
            "/vX/reference/financials?ticker={ticker}&filing_date.gte={start}&filing_date.lte={end}"
                .into(),
        );
        HttpFetcher::new(
            config,
            api_key.map(str::to_string),
            RetryPolicy::none(),
            Arc::new(CircuitBreaker::default_api()),
        )
        .unwrap()
    }

    #[test]
    fn template_fills_params_and_key_dimensions() {
        let url = render_template("/x/{ticker}/{year}?d={date}&s={start}", &unit()).unwrap();
        assert_eq!(url, "/x/AAPL/2024?d=2024-12-31&s=2024-01-01");
    }

    #[test]
    fn unknown_placeholder_is_fatal() {
        let err = render_template("/x/{nope}", &unit()).unwrap_err();
        assert!(matches!(err, FetchError::Fatal(_)));
    }

    #[test]
    fn unit_url_appends_api_key() {
        let url = fetcher(Some("secret")).unit_url(&unit()).unwrap();
        assert_eq!(
            url,
            "https://api.polygon.io/vX/reference/financials?ticker=AAPL\
             &filing_date.gte=2024-01-01&filing_date.lte=2024-12-31&apiKey=secret"
        );
        assert!(!redact(&url).contains("secret"));
    }

    #[test]
    fn cursor_gets_api_key_once() {
        let f = fetcher(Some("k"));
        assert_eq!(
            f.with_api_key("https://h/next?cursor=abc".into()),
            "https://h/next?cursor=abc&apiKey=k"
        );
        assert_eq!(
            f.with_api_key("https://h/next?cursor=abc&apiKey=k".into()),
            "https://h/next?cursor=abc&apiKey=k"
        );
    }

    #[test]
    fn page_parsing_handles_cursor_and_shapes() {
        let page = parse_page(json!({
            "results": [{"a": 1}, {"a": 2}],
            "next_url": "https://h/next?cursor=x",
            "status": "OK"
        }))
        .unwrap();
        assert_eq!(page.results.len(), 2);
        assert_eq!(page.next_url.as_deref(), Some("https://h/next?cursor=x"));

        let single = parse_page(json!({"results": {"ticker": "AAPL"}})).unwrap();
        assert_eq!(single.results.len(), 1);
        assert_eq!(single.next_url, None);

        let empty = parse_page(json!({"status": "OK"})).unwrap();
        assert!(empty.results.is_empty());

        assert!(parse_page(json!({"status": "ERROR", "error": "bad"})).is_err());
    }

    fn cursor_page(n: usize, next: bool) -> Page {
        Page {
            results: vec![json!({"page": n})],
            next_url: next.then(|| format!("https://h/next?cursor={n}")),
        }
    }

    #[test]
    fn cursors_are_followed_to_the_end() {
        let mut served = 0;
        let (records, pages) = follow_cursors(
            "https://h/first".into(),
            5,
            |_| {
                served += 1;
                Ok(cursor_page(served, served < 3))
            },
            |next| next,
        )
        .unwrap();
        assert_eq!(pages, 3);
        assert_eq!(records.len(), 3);
    }

    #[test]
    fn page_limit_with_pending_cursor_is_fatal() {
        let mut urls = Vec::new();
        let err = follow_cursors(
            "https://h/first".into(),
            2,
            |url| {
                urls.push(url.to_string());
                Ok(cursor_page(urls.len(), true))
            },
            |next| format!("{next}&apiKey=k"),
        )
        .unwrap_err();
        assert!(matches!(err, FetchError::Fatal(ref m) if m.contains("page limit of 2")));
        assert_eq!(urls, vec!["https://h/first", "https://h/next?cursor=1&apiKey=k"]);
    }

    #[test]
    fn last_allowed_page_without_cursor_is_complete() {
        let (records, pages) =
            follow_cursors("https://h/first".into(), 1, |_| Ok(cursor_page(1, false)), |n| n).unwrap();
        assert_eq!((records.len(), pages), (1, 1));
    }

    #[test]
    fn missing_endpoint_is_fatal() {
        let f = fetcher(None);
        let scheme = PartitionScheme::daily("stocks_daily");
        let date = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let u = SourceUnit::new(scheme.date_key(date).unwrap(), date);
        assert!(matches!(f.fetch(&u), Err(FetchError::Fatal(_))));
    }

    #[test]
    fn open_breaker_refuses_requests() {
        let f = fetcher(None);
        f.circuit_breaker.trip();
        assert!(!f.is_available());
        assert!(matches!(f.fetch(&unit()), Err(FetchError::Fatal(_))));
    }
}
