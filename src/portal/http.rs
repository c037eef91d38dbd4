use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use tracing::debug;

use crate::config::PortalConfig;
use crate::portal::parse::{extract_csrf_token, parse_dashboard};
use crate::portal::{FetchError, PortalClient};
use crate::snapshot::Snapshot;
use crate::subscription::Credential;

const USER_AGENT: &str = concat!("portal-watch/", env!("CARGO_PKG_VERSION"));

/// Logs in through the portal's HTML form and scrapes the dashboard. Every fetch
/// runs in a fresh cookie session.
pub struct HttpPortalClient {
    config: PortalConfig,
}

impl HttpPortalClient {
    pub fn new(config: PortalConfig) -> Self {
        Self { config }
    }

    fn session(&self) -> Result<Client, FetchError> {
        Client::builder()
            .user_agent(USER_AGENT)
            .cookie_store(true)
            .timeout(self.config.request_timeout())
            .connect_timeout(self.config.connect_timeout())
            .build()
            .map_err(|e| FetchError::Unreachable(format!("failed to build HTTP client: {e}")))
    }
}

#[async_trait]
impl PortalClient for HttpPortalClient {
    async fn fetch(&self, credential: &Credential) -> Result<Snapshot, FetchError> {
        let session = self.session()?;
        let login_url = self.config.login_url.as_str();

        let login_page = read_body(
            session
                .get(login_url)
                .send()
                .await
                .map_err(|e| transport_error("GET", login_url, e))?,
        )
        .await?;
        let csrf_token = extract_csrf_token(&login_page.body, &self.config.csrf_field);

        let mut form = vec![
            (self.config.username_field.as_str(), credential.username.as_str()),
            (self.config.password_field.as_str(), credential.secret.expose()),
        ];
        if let Some(token) = csrf_token.as_deref() {
            form.push((self.config.csrf_field.as_str(), token));
        }

        let login = read_body(
            session
                .post(login_url)
                .form(&form)
                .send()
                .await
                .map_err(|e| transport_error("POST", login_url, e))?,
        )
        .await?;
        if !login.final_url.contains(&self.config.success_marker) {
            debug!(
                subscriber = %credential.subscriber_id,
                landed_on = %login.final_url,
                "login did not reach the dashboard"
            );
            return Err(FetchError::AuthFailed);
        }

        let dashboard_html = if self.config.dashboard_url.trim().is_empty() {
            login.body
        } else {
            let dashboard_url = self.config.dashboard_url.as_str();
            read_body(
                session
                    .get(dashboard_url)
                    .send()
                    .await
                    .map_err(|e| transport_error("GET", dashboard_url, e))?,
            )
            .await?
            .body
        };

        parse_dashboard(&dashboard_html, |field| self.config.element_id(field))
    }
}

struct PageBody {
    final_url: String,
    body: String,
}

async fn read_body(response: Response) -> Result<PageBody, FetchError> {
    let final_url = response.url().to_string();
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| FetchError::Unreachable(format!("failed reading {final_url}: {e}")))?;
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(FetchError::AuthFailed);
    }
    if !status.is_success() {
        let preview: String = body.chars().take(180).collect();
        return Err(FetchError::Unreachable(format!(
            "{final_url} returned {status}: {preview}"
        )));
    }
    Ok(PageBody { final_url, body })
}

fn transport_error(method: &str, url: &str, error: reqwest::Error) -> FetchError {
    FetchError::Unreachable(format!("failed {method} request: {url}: {error}"))
}
