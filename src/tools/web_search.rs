//! Web search with graceful degradation: an instant-answer JSON endpoint,
//! then an HTML endpoint scraped with a regex, then deterministic mock
//! results so the tool still produces something useful offline.

use std::sync::LazyLock;
use std::time::Duration;

use futures::future::BoxFuture;
use regex::Regex;
use serde::Serialize;
use url::Url;

use crate::task::{ExecutionInput, ExecutionResult};
use crate::tool::Tool;

const INSTANT_ANSWER_ENDPOINT: &str = "https://api.duckduckgo.com/";
const HTML_ENDPOINT: &str = "https://html.duckduckgo.com/html/";
const MAX_RESULTS: usize = 5;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

static RESULT_LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<a[^>]+class="result__a"[^>]+href="([^"]+)"[^>]*>(.*?)</a>"#)
        .expect("result link pattern is valid")
});

static RESULT_SNIPPET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<a[^>]+class="result__snippet"[^>]*>(.*?)</a>"#)
        .expect("result snippet pattern is valid")
});

static HTML_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]+>").expect("tag pattern is valid"));

#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

pub struct WebSearchTool {
    client: reqwest::Client,
}

impl Default for WebSearchTool {
    fn default() -> Self {
        Self::new()
    }
}

impl WebSearchTool {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { client }
    }

    async fn search(&self, query: &str) -> Vec<SearchResult> {
        match self.instant_answer(query).await {
            Ok(results) if !results.is_empty() => return results,
            Ok(_) => tracing::debug!(query, "instant answer endpoint returned nothing"),
            Err(e) => tracing::debug!(query, error = %e, "instant answer endpoint failed"),
        }
        match self.html_scrape(query).await {
            Ok(results) if !results.is_empty() => return results,
            Ok(_) => tracing::debug!(query, "html endpoint returned nothing"),
            Err(e) => tracing::debug!(query, error = %e, "html endpoint failed"),
        }
        mock_results(query)
    }

    async fn instant_answer(&self, query: &str) -> Result<Vec<SearchResult>, reqwest::Error> {
        let url = Url::parse_with_params(
            INSTANT_ANSWER_ENDPOINT,
            &[("q", query), ("format", "json"), ("no_html", "1")],
        )
        .expect("endpoint url is valid");

        let body: serde_json::Value = self.client.get(url).send().await?.json().await?;
        let mut results = Vec::new();

        let abstract_text = body["AbstractText"].as_str().unwrap_or_default();
        if !abstract_text.is_empty() {
            results.push(SearchResult {
                title: body["Heading"].as_str().unwrap_or(query).to_owned(),
                url: body["AbstractURL"].as_str().unwrap_or_default().to_owned(),
                snippet: abstract_text.to_owned(),
            });
        }

        if let Some(topics) = body["RelatedTopics"].as_array() {
            for topic in topics {
                let (Some(text), Some(first_url)) =
                    (topic["Text"].as_str(), topic["FirstURL"].as_str())
                else {
                    continue;
                };
                results.push(SearchResult {
                    title: text.chars().take(80).collect(),
                    url: first_url.to_owned(),
                    snippet: text.to_owned(),
                });
                if results.len() >= MAX_RESULTS {
                    break;
                }
            }
        }

        Ok(results)
    }

    async fn html_scrape(&self, query: &str) -> Result<Vec<SearchResult>, reqwest::Error> {
        let url = Url::parse_with_params(HTML_ENDPOINT, &[("q", query)])
            .expect("endpoint url is valid");
        let body = self.client.get(url).send().await?.text().await?;
        Ok(scrape_results(&body))
    }
}

fn scrape_results(body: &str) -> Vec<SearchResult> {
    let snippets: Vec<String> = RESULT_SNIPPET
        .captures_iter(body)
        .map(|caps| strip_tags(&caps[1]))
        .collect();

    RESULT_LINK
        .captures_iter(body)
        .take(MAX_RESULTS)
        .enumerate()
        .map(|(i, caps)| SearchResult {
            title: strip_tags(&caps[2]),
            url: caps[1].to_owned(),
            snippet: snippets.get(i).cloned().unwrap_or_default(),
        })
        .collect()
}

fn strip_tags(fragment: &str) -> String {
    let text = HTML_TAG.replace_all(fragment, "");
    text.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#x27;", "'")
        .trim()
        .to_owned()
}

fn mock_results(query: &str) -> Vec<SearchResult> {
    (1..=3)
        .map(|i| SearchResult {
            title: format!("Result {i} for '{query}'"),
            url: format!("https://example.com/search?q={}&rank={i}", urlencode(query)),
            snippet: "No search backend was reachable; this is a locally generated \
                      placeholder result."
                .to_owned(),
        })
        .collect()
}

fn urlencode(raw: &str) -> String {
    let mut encoded = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char);
            },
            b' ' => encoded.push('+'),
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }
    encoded
}

fn format_results(results: &[SearchResult]) -> String {
    results
        .iter()
        .enumerate()
        .map(|(i, r)| format!("{}. {}\n   {}\n   {}", i + 1, r.title, r.url, r.snippet))
        .collect::<Vec<_>>()
        .join("\n")
}

impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Searches the web for a query and returns up to five results as \
         numbered title / url / snippet triples."
    }

    fn run(&self, input: ExecutionInput) -> BoxFuture<'_, ExecutionResult> {
        Box::pin(async move {
            let query = input.content.trim().to_owned();
            if query.is_empty() {
                return ExecutionResult::failure("Search query must not be blank");
            }
            let results = self.search(&query).await;
            ExecutionResult::ok(format_results(&results)).with_metadata(serde_json::json!({
                "query": query,
                "result_count": results.len(),
            }))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scrape_extracts_triples() {
        let body = r#"
            <div class="result">
              <a rel="nofollow" class="result__a" href="https://example.org/a">First <b>Hit</b></a>
              <a class="result__snippet" href="https://example.org/a">Snippet &amp; more</a>
            </div>
            <div class="result">
              <a rel="nofollow" class="result__a" href="https://example.org/b">Second</a>
              <a class="result__snippet" href="https://example.org/b">Other snippet</a>
            </div>
        "#;

        let results = scrape_results(body);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].title, "First Hit");
        assert_eq!(results[0].url, "https://example.org/a");
        assert_eq!(results[0].snippet, "Snippet & more");
        assert_eq!(results[1].title, "Second");
    }

    #[test]
    fn test_scrape_empty_body() {
        assert!(scrape_results("<html></html>").is_empty());
    }

    #[test]
    fn test_strip_tags_and_entities() {
        assert_eq!(strip_tags("<b>bold</b> &lt;tag&gt;"), "bold <tag>");
        assert_eq!(strip_tags("  plain "), "plain");
    }

    #[test]
    fn test_mock_results_are_deterministic() {
        let first = mock_results("rust async");
        let second = mock_results("rust async");
        assert_eq!(first.len(), 3);
        assert_eq!(first[0].title, second[0].title);
        assert_eq!(first[0].url, "https://example.com/search?q=rust+async&rank=1");
    }

    #[test]
    fn test_urlencode() {
        assert_eq!(urlencode("a b&c"), "a+b%26c");
        assert_eq!(urlencode("safe-chars_1.2~"), "safe-chars_1.2~");
    }

    #[tokio::test]
    async fn test_blank_query_is_failure() {
        let tool = WebSearchTool::new();
        let result = tool.run(ExecutionInput::new("  ")).await;
        assert!(!result.success);
    }

    #[test]
    fn test_format_results_numbers_entries() {
        let formatted = format_results(&mock_results("q"));
        assert!(formatted.starts_with("1. "));
        assert!(formatted.contains("\n2. "));
        assert!(formatted.contains("\n3. "));
    }
}
