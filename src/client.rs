use crate::config::ServerConfig;
use crate::error::{AppError, Result};
use crate::models::{Collection, EntityId, EntityKind, EntityStub};
use reqwest::header::{ACCEPT, LOCATION};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;
use url::{form_urlencoded, Url};

/// Thin SensorThings API client: URL building, status classification and
/// envelope decoding. Every call is awaited by the caller before the next.
pub struct StaClient {
    client: Client,
    base_url: String,
}

impl StaClient {
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Absolute URL for a resource path below the service root, with query
    /// options such as `$filter` encoded.
    pub fn url(&self, path: &str, query: &[(&str, &str)]) -> Result<Url> {
        let mut url = Url::parse(&format!("{}/{}", self.base_url, path.trim_start_matches('/')))
            .map_err(|e| AppError::Config(format!("Invalid request URL for '{}': {}", path, e)))?;

        if !query.is_empty() {
            let encoded = query
                .iter()
                .map(|(key, value)| format!("{}={}", encode_component(key), encode_component(value)))
                .collect::<Vec<_>>()
                .join("&");
            url.set_query(Some(&encoded));
        }

        Ok(url)
    }

    /// GET one page of a list resource
    pub async fn get_page<T: DeserializeOwned>(&self, url: &str) -> Result<Collection<T>> {
        debug!("GET {}", url);

        let response = self
            .client
            .get(url)
            .header(ACCEPT, "application/json")
            .send()
            .await?;
        let response = check_status(response, url).await?;
        let body = response.text().await?;

        serde_json::from_str(&body)
            .map_err(|e| AppError::ResponseParse(format!("invalid list response from {}: {}", url, e)))
    }

    /// GET the first page of `path` with the given query options
    pub async fn list<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Collection<T>> {
        let url = self.url(path, query)?;
        self.get_page(url.as_str()).await
    }

    /// GET every page of `path`, following `@iot.nextLink` until the server
    /// stops sending one. Pages are concatenated in the order received.
    pub async fn list_all<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Vec<T>> {
        let mut url = self.url(path, query)?;
        let mut items = Vec::new();
        let mut pages = 0;

        loop {
            let page: Collection<T> = self.get_page(url.as_str()).await?;
            pages += 1;
            items.extend(page.value);

            let Some(next_link) = page.next_link else {
                break;
            };
            let next = url.join(&next_link).map_err(|e| {
                AppError::ResponseParse(format!("invalid @iot.nextLink '{}': {}", next_link, e))
            })?;
            if next == url {
                return Err(AppError::ResponseParse(format!(
                    "@iot.nextLink points back at {}",
                    url
                )));
            }
            url = next;
        }

        debug!("Fetched {} item(s) in {} page(s) from {}", items.len(), pages, path);
        Ok(items)
    }

    /// POST a new entity and return its server-assigned id
    ///
    /// The id is read from the `@iot.id` of the returned representation, or
    /// from the `Location` header when the server answers without a body.
    pub async fn create<P: Serialize>(&self, collection: &str, payload: &P) -> Result<EntityId> {
        let url = self.url(collection, &[])?;
        debug!("POST {}", url);

        let response = self
            .client
            .post(url.as_str())
            .header(ACCEPT, "application/json")
            .json(payload)
            .send()
            .await?;
        let response = check_status(response, url.as_str()).await?;

        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response.text().await?;

        if !body.trim().is_empty() {
            match serde_json::from_str::<EntityStub>(&body) {
                Ok(stub) => return Ok(stub.id),
                Err(e) if location.is_none() => {
                    return Err(AppError::ResponseParse(format!(
                        "created entity response from {} has no usable @iot.id: {}",
                        url, e
                    )))
                }
                Err(_) => {}
            }
        }

        location
            .as_deref()
            .and_then(EntityId::from_entity_url)
            .ok_or_else(|| {
                AppError::ResponseParse(format!(
                    "created entity at {} returned neither @iot.id nor a Location header",
                    url
                ))
            })
    }
}

/// Path of a navigation property below a single entity, e.g. `Things(1)/Datastreams`.
pub fn entity_path(kind: EntityKind, id: &EntityId, navigation: &str) -> String {
    format!("{}({})/{}", kind.collection(), id.path_key(), navigation)
}

/// Quote a string literal for an OData `$filter` expression.
pub fn odata_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

async fn check_status(response: Response, url: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(AppError::HttpStatus {
        status: status.as_u16(),
        url: url.to_string(),
        body,
    })
}

/// Percent-encode a query component, spelling spaces as `%20`.
fn encode_component(value: &str) -> String {
    form_urlencoded::byte_serialize(value.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}
