//! Bootstrap: resolve a live id, fetch the watch page, and extract the
//! embedded program data the connection engine starts from.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const WATCH_PAGE_BASE: &str = "https://live.nicovideo.jp/watch/";

#[derive(Debug, Error)]
pub enum PageError {
    #[error("no live id found in {0:?} (expected lv/ch/user-form id)")]
    LiveIdParse(String),
    #[error("watch page for {live_id} returned status {status}")]
    NotFound { status: u16, live_id: String },
    #[error("watch page parse error: {0}")]
    Parse(String),
    #[error("program is private or viewing is not permitted")]
    AccessDenied,
    #[error("network error: {0}")]
    Network(String),
}

/// Bootstrap data scraped from the watch page. Opaque input to the
/// connection engine.
#[derive(Debug, Clone, PartialEq)]
pub struct NicolivePageData {
    pub websocket_url: String,
    /// Anti-CSRF token doubling as the broadcaster comment API token.
    pub broadcaster_comment_token: Option<String>,
    pub live_id: String,
    pub title: String,
    /// UNIX seconds.
    pub begin_time: i64,
    /// UNIX seconds.
    pub end_time: i64,
    pub status: ProgramStatus,
    pub provider_type: String,
    pub supplier: Option<Supplier>,
    pub social_group: SocialGroup,
    pub login_user: Option<LoginUser>,
    pub is_supportable: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProgramStatus {
    Released,
    BeforeRelease,
    OnAir,
    Ended,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Supplier {
    pub name: String,
    #[serde(default)]
    pub program_provider_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SocialGroup {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub company_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginUser {
    pub is_logged_in: bool,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub account_type: Option<String>,
    #[serde(default)]
    pub is_broadcaster: bool,
    #[serde(default)]
    pub is_operator: bool,
}

/// Extracts a live id (`lv<digits>`, `ch<digits>`, or `user/<digits>`) from
/// an id or a watch-page URL.
pub fn parse_live_id(input: &str) -> Result<String, PageError> {
    let bytes = input.as_bytes();
    for (index, _) in input.char_indices() {
        let rest = &input[index..];
        for prefix in ["lv", "ch", "user/"] {
            if let Some(tail) = rest.strip_prefix(prefix) {
                let digits: String = tail.chars().take_while(|c| c.is_ascii_digit()).collect();
                // A preceding alphanumeric byte means this is the middle of
                // another token (e.g. "solve123").
                let mid_token = index > 0 && bytes[index - 1].is_ascii_alphanumeric();
                if !digits.is_empty() && !mid_token {
                    return Ok(format!("{prefix}{digits}"));
                }
            }
        }
    }
    Err(PageError::LiveIdParse(input.to_string()))
}

/// HTTP access behind the page fetch; tests substitute scripted pages.
#[async_trait]
pub trait PageBackend: Send + Sync {
    /// Returns `(status, body)` for the watch page of `live_id`.
    async fn fetch_watch_page(&self, live_id: &str) -> Result<(u16, String), PageError>;
}

pub struct ReqwestPageBackend {
    client: reqwest::Client,
}

impl ReqwestPageBackend {
    pub fn new() -> Result<Self, PageError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|err| PageError::Network(err.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PageBackend for ReqwestPageBackend {
    async fn fetch_watch_page(&self, live_id: &str) -> Result<(u16, String), PageError> {
        let url = format!("{WATCH_PAGE_BASE}{live_id}");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|err| PageError::Network(err.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|err| PageError::Network(err.to_string()))?;
        Ok((status, body))
    }
}

pub struct PageClient {
    backend: Arc<dyn PageBackend>,
}

impl PageClient {
    pub fn new() -> Result<Self, PageError> {
        Ok(Self {
            backend: Arc::new(ReqwestPageBackend::new()?),
        })
    }

    pub fn with_backend(backend: Arc<dyn PageBackend>) -> Self {
        Self { backend }
    }

    /// Fetches and parses the watch page for an id or watch URL.
    pub async fn fetch_page_data(&self, input: &str) -> Result<NicolivePageData, PageError> {
        let live_id = parse_live_id(input)?;
        let (status, body) = self.backend.fetch_watch_page(&live_id).await?;
        if !(200..300).contains(&status) {
            return Err(PageError::NotFound { status, live_id });
        }
        parse_page_data(&live_id, &body)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EmbeddedProps {
    site: SiteProps,
    program: ProgramProps,
    social_group: SocialGroup,
    #[serde(default)]
    user: Option<LoginUser>,
    #[serde(default)]
    creator_creator_support_summary: Option<SupportSummary>,
}

#[derive(Debug, Deserialize)]
struct SiteProps {
    relive: ReliveProps,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReliveProps {
    #[serde(default)]
    web_socket_url: Option<String>,
    #[serde(default)]
    csrf_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProgramProps {
    nicolive_program_id: String,
    title: String,
    begin_time: i64,
    end_time: i64,
    status: ProgramStatus,
    provider_type: String,
    #[serde(default)]
    supplier: Option<Supplier>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SupportSummary {
    #[serde(default)]
    is_supportable: Option<bool>,
}

fn parse_page_data(live_id: &str, body: &str) -> Result<NicolivePageData, PageError> {
    let raw = extract_embedded_props(body)?;
    let props: EmbeddedProps = serde_json::from_str(&raw)
        .map_err(|err| PageError::Parse(format!("embedded data: {err}")))?;

    let websocket_url = props.site.relive.web_socket_url.unwrap_or_default();
    if websocket_url.is_empty() {
        return Err(PageError::AccessDenied);
    }

    let mut data = NicolivePageData {
        websocket_url,
        broadcaster_comment_token: props.site.relive.csrf_token,
        live_id: props.program.nicolive_program_id,
        title: props.program.title,
        begin_time: props.program.begin_time,
        end_time: props.program.end_time,
        status: props.program.status,
        provider_type: props.program.provider_type,
        supplier: props.program.supplier,
        social_group: props.social_group,
        login_user: props.user,
        is_supportable: props
            .creator_creator_support_summary
            .and_then(|summary| summary.is_supportable),
    };
    if data.live_id.is_empty() {
        data.live_id = live_id.to_string();
    }
    Ok(data)
}

/// Pulls the `data-props` JSON blob out of the `#embedded-data` element.
fn extract_embedded_props(body: &str) -> Result<String, PageError> {
    let anchor = body
        .find("id=\"embedded-data\"")
        .ok_or_else(|| PageError::Parse("missing #embedded-data element".into()))?;
    let rest = &body[anchor..];
    let attr = rest
        .find("data-props=\"")
        .map(|at| &rest[at + "data-props=\"".len()..])
        .ok_or_else(|| PageError::Parse("missing data-props attribute".into()))?;
    let end = attr
        .find('"')
        .ok_or_else(|| PageError::Parse("unterminated data-props attribute".into()))?;
    Ok(unescape_html(&attr[..end]))
}

fn unescape_html(raw: &str) -> String {
    raw.replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_live_id_form() {
        assert_eq!(parse_live_id("lv123456").unwrap(), "lv123456");
        assert_eq!(parse_live_id("ch2525").unwrap(), "ch2525");
        assert_eq!(parse_live_id("user/123").unwrap(), "user/123");
        assert_eq!(
            parse_live_id("https://live.nicovideo.jp/watch/lv345678224").unwrap(),
            "lv345678224"
        );
        assert_eq!(
            parse_live_id("https://live.nicovideo.jp/watch/user/44").unwrap(),
            "user/44"
        );
    }

    #[test]
    fn rejects_inputs_without_a_live_id() {
        assert!(matches!(
            parse_live_id("https://example.com/"),
            Err(PageError::LiveIdParse(_))
        ));
        assert!(matches!(parse_live_id("lv"), Err(PageError::LiveIdParse(_))));
        assert!(matches!(
            parse_live_id("solve123"),
            Err(PageError::LiveIdParse(_))
        ));
    }

    fn page_body(props: &serde_json::Value) -> String {
        let escaped = props
            .to_string()
            .replace('&', "&amp;")
            .replace('"', "&quot;");
        format!(
            "<!doctype html><html><body><script id=\"embedded-data\" data-props=\"{escaped}\"></script></body></html>"
        )
    }

    fn props(websocket_url: &str) -> serde_json::Value {
        serde_json::json!({
            "site": {"relive": {"webSocketUrl": websocket_url, "csrfToken": "token-1"}},
            "program": {
                "nicoliveProgramId": "lv345678224",
                "title": "test program",
                "beginTime": 1_700_000_000,
                "endTime": 1_700_003_600,
                "status": "ON_AIR",
                "providerType": "community",
                "supplier": {"name": "broadcaster", "programProviderId": "user-9"}
            },
            "socialGroup": {"id": "co1", "name": "community", "companyName": null},
            "user": {"isLoggedIn": true, "id": "1", "nickname": "n", "accountType": "premium",
                     "isBroadcaster": false, "isOperator": false},
            "creatorCreatorSupportSummary": {"isSupportable": true}
        })
    }

    struct StaticBackend {
        status: u16,
        body: String,
    }

    #[async_trait]
    impl PageBackend for StaticBackend {
        async fn fetch_watch_page(&self, _live_id: &str) -> Result<(u16, String), PageError> {
            Ok((self.status, self.body.clone()))
        }
    }

    #[tokio::test]
    async fn maps_the_embedded_blob_into_page_data() {
        let client = PageClient::with_backend(Arc::new(StaticBackend {
            status: 200,
            body: page_body(&props("wss://host/ws?audience_token=A")),
        }));
        let data = client.fetch_page_data("lv345678224").await.unwrap();

        assert_eq!(data.websocket_url, "wss://host/ws?audience_token=A");
        assert_eq!(data.broadcaster_comment_token.as_deref(), Some("token-1"));
        assert_eq!(data.live_id, "lv345678224");
        assert_eq!(data.begin_time, 1_700_000_000);
        assert_eq!(data.status, ProgramStatus::OnAir);
        assert_eq!(data.supplier.as_ref().unwrap().name, "broadcaster");
        assert!(data.login_user.as_ref().unwrap().is_logged_in);
        assert_eq!(data.is_supportable, Some(true));
    }

    #[tokio::test]
    async fn empty_websocket_url_is_access_denied() {
        let client = PageClient::with_backend(Arc::new(StaticBackend {
            status: 200,
            body: page_body(&props("")),
        }));
        assert!(matches!(
            client.fetch_page_data("lv1").await,
            Err(PageError::AccessDenied)
        ));
    }

    #[tokio::test]
    async fn http_failure_carries_status_and_live_id() {
        let client = PageClient::with_backend(Arc::new(StaticBackend {
            status: 404,
            body: String::new(),
        }));
        match client.fetch_page_data("lv404").await {
            Err(PageError::NotFound { status, live_id }) => {
                assert_eq!(status, 404);
                assert_eq!(live_id, "lv404");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn page_without_embedded_data_is_a_parse_error() {
        let client = PageClient::with_backend(Arc::new(StaticBackend {
            status: 200,
            body: "<html><body>maintenance</body></html>".into(),
        }));
        assert!(matches!(
            client.fetch_page_data("lv1").await,
            Err(PageError::Parse(_))
        ));
    }
}
