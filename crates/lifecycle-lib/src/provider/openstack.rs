//! OpenStack provider (Keystone v3 + Nova)
//!
//! Each tenant is reached with a project-scoped token. Tokens are cached per
//! project and refreshed shortly before they expire. Logins for different
//! projects run concurrently.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Response};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use super::{CloudProvider, ProviderError};
use crate::models::{ActionRecord, ServerRecord};
use crate::observability::LifecycleMetrics;

/// Tokens closer than this to expiry are renewed
const TOKEN_EXPIRY_MARGIN_SECS: i64 = 60;

const SUBJECT_TOKEN_HEADER: &str = "X-Subject-Token";
const AUTH_TOKEN_HEADER: &str = "X-Auth-Token";

/// Connection settings for an OpenStack cloud
#[derive(Clone)]
pub struct OpenStackConfig {
    /// Identity v3 root, e.g. `https://keystone.example.com:5000/v3`
    pub auth_url: String,
    pub username: String,
    pub password: String,
    pub user_domain: String,
    pub project_domain: String,
    /// Project used to list the tenants the account belongs to
    pub main_project: String,
    pub region: Option<String>,
    pub request_timeout: Duration,
}

impl fmt::Debug for OpenStackConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenStackConfig")
            .field("auth_url", &self.auth_url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("user_domain", &self.user_domain)
            .field("project_domain", &self.project_domain)
            .field("main_project", &self.main_project)
            .field("region", &self.region)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

#[derive(Debug, Clone)]
struct ScopedToken {
    token: String,
    user_id: String,
    compute_url: String,
    expires_at: DateTime<Utc>,
}

impl ScopedToken {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at - chrono::Duration::seconds(TOKEN_EXPIRY_MARGIN_SECS) > now
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: TokenBody,
}

#[derive(Debug, Deserialize)]
struct TokenBody {
    expires_at: DateTime<Utc>,
    user: TokenUser,
    #[serde(default)]
    catalog: Vec<CatalogEntry>,
}

#[derive(Debug, Deserialize)]
struct TokenUser {
    id: String,
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    #[serde(rename = "type")]
    service_type: String,
    #[serde(default)]
    endpoints: Vec<CatalogEndpoint>,
}

#[derive(Debug, Deserialize)]
struct CatalogEndpoint {
    interface: String,
    #[serde(default)]
    region: Option<String>,
    url: String,
}

#[derive(Debug, Deserialize)]
struct ProjectList {
    projects: Vec<Project>,
}

#[derive(Debug, Deserialize)]
struct Project {
    name: String,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct ServerList {
    servers: Vec<Server>,
    #[serde(default)]
    servers_links: Vec<Link>,
}

#[derive(Debug, Deserialize)]
struct Link {
    rel: String,
    href: String,
}

impl ServerList {
    /// Marker of the next page, when Nova truncated the listing
    fn next_marker(&self) -> Option<String> {
        let link = self.servers_links.iter().find(|link| link.rel == "next")?;
        let url = Url::parse(&link.href).ok()?;
        let marker = url
            .query_pairs()
            .find(|(key, _)| key == "marker")
            .map(|(_, value)| value.into_owned());
        marker
    }
}

#[derive(Debug, Deserialize)]
struct Server {
    id: String,
    name: String,
    #[serde(rename = "OS-EXT-STS:vm_state", default)]
    vm_state: String,
}

#[derive(Debug, Deserialize)]
struct InstanceActionList {
    #[serde(rename = "instanceActions", default)]
    instance_actions: Vec<InstanceActionEntry>,
}

#[derive(Debug, Deserialize)]
struct InstanceActionEntry {
    action: String,
    #[serde(default)]
    start_time: String,
}

/// Cached token of one project; its lock is held while logging in
type TokenSlot = Arc<Mutex<Option<ScopedToken>>>;

/// [`CloudProvider`] speaking to Keystone and Nova
pub struct OpenStackProvider {
    client: Client,
    config: OpenStackConfig,
    tokens: Mutex<HashMap<String, TokenSlot>>,
    metrics: LifecycleMetrics,
}

impl OpenStackProvider {
    pub fn new(config: OpenStackConfig) -> Result<Self, ProviderError> {
        let client = Client::builder().timeout(config.request_timeout).build()?;

        Ok(Self {
            client,
            config,
            tokens: Mutex::new(HashMap::new()),
            metrics: LifecycleMetrics::new(),
        })
    }

    fn identity_url(&self, path: &str) -> Result<Url, ProviderError> {
        Ok(Url::parse(&format!(
            "{}/{}",
            self.config.auth_url.trim_end_matches('/'),
            path
        ))?)
    }

    fn compute_url(token: &ScopedToken, path: &str) -> Result<Url, ProviderError> {
        Ok(Url::parse(&format!(
            "{}/{}",
            token.compute_url.trim_end_matches('/'),
            path
        ))?)
    }

    async fn token_slot(&self, project: &str) -> TokenSlot {
        let mut tokens = self.tokens.lock().await;
        Arc::clone(tokens.entry(project.to_string()).or_default())
    }

    /// Project-scoped token, from cache when still fresh
    ///
    /// Only callers for the same project wait on each other's login.
    async fn token(&self, project: &str) -> Result<ScopedToken, ProviderError> {
        let slot = self.token_slot(project).await;
        let mut cached = slot.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.is_fresh(Utc::now()) {
                return Ok(token.clone());
            }
        }

        let token = self.authenticate(project).await?;
        *cached = Some(token.clone());
        Ok(token)
    }

    async fn authenticate(&self, project: &str) -> Result<ScopedToken, ProviderError> {
        let body = json!({
            "auth": {
                "identity": {
                    "methods": ["password"],
                    "password": {
                        "user": {
                            "name": self.config.username,
                            "domain": {"name": self.config.user_domain},
                            "password": self.config.password,
                        }
                    }
                },
                "scope": {
                    "project": {
                        "name": project,
                        "domain": {"name": self.config.project_domain},
                    }
                }
            }
        });

        let response = self
            .client
            .post(self.identity_url("auth/tokens")?)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let reason = response.text().await.unwrap_or_default();
            return Err(ProviderError::Auth {
                project: project.to_string(),
                reason: format!("{status}: {reason}"),
            });
        }

        let token = response
            .headers()
            .get(SUBJECT_TOKEN_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| ProviderError::Auth {
                project: project.to_string(),
                reason: format!("response has no {SUBJECT_TOKEN_HEADER} header"),
            })?;

        let body: TokenResponse = response.json().await?;
        let compute_url = self
            .find_endpoint(&body.token.catalog, "compute")
            .ok_or_else(|| ProviderError::MissingEndpoint {
                service: "compute".to_string(),
                project: project.to_string(),
            })?;

        debug!(
            project = %project,
            expires_at = %body.token.expires_at,
            "Obtained project-scoped token"
        );

        Ok(ScopedToken {
            token,
            user_id: body.token.user.id,
            compute_url,
            expires_at: body.token.expires_at,
        })
    }

    fn find_endpoint(&self, catalog: &[CatalogEntry], service: &str) -> Option<String> {
        catalog
            .iter()
            .filter(|entry| entry.service_type == service)
            .flat_map(|entry| entry.endpoints.iter())
            .find(|endpoint| {
                endpoint.interface == "public"
                    && match &self.config.region {
                        Some(region) => endpoint.region.as_deref() == Some(region.as_str()),
                        None => true,
                    }
            })
            .map(|endpoint| endpoint.url.clone())
    }

    async fn server_page(
        &self,
        token: &ScopedToken,
        marker: Option<&str>,
    ) -> Result<ServerList, ProviderError> {
        let mut url = Self::compute_url(token, "servers/detail")?;
        if let Some(marker) = marker {
            url.query_pairs_mut().append_pair("marker", marker);
        }

        let response = self
            .client
            .get(url)
            .header(AUTH_TOKEN_HEADER, &token.token)
            .send()
            .await?;
        Ok(check_status(response).await?.json().await?)
    }

    /// Every server of the project, following Nova's pagination
    async fn servers(&self, token: &ScopedToken) -> Result<Vec<Server>, ProviderError> {
        let mut servers = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let page = self.server_page(token, marker.as_deref()).await?;
            let next = page.next_marker();
            let empty = page.servers.is_empty();
            servers.extend(page.servers);

            match next {
                Some(next) if !empty && marker.as_deref() != Some(next.as_str()) => {
                    marker = Some(next)
                }
                _ => return Ok(servers),
            }
        }
    }

    async fn instance_actions(
        &self,
        token: &ScopedToken,
        instance_id: &str,
    ) -> Result<Vec<ActionRecord>, ProviderError> {
        let url = Self::compute_url(token, &format!("servers/{instance_id}/os-instance-actions"))?;
        let response = self
            .client
            .get(url)
            .header(AUTH_TOKEN_HEADER, &token.token)
            .send()
            .await?;
        let list: InstanceActionList = check_status(response).await?.json().await?;

        Ok(list
            .instance_actions
            .into_iter()
            .map(|entry| ActionRecord::new(entry.action, entry.start_time))
            .collect())
    }
}

/// Turn a non-success response into [`ProviderError::Status`]
async fn check_status(response: Response) -> Result<Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let url = response.url().to_string();
    let body = response.text().await.unwrap_or_default();
    Err(ProviderError::Status {
        url,
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl CloudProvider for OpenStackProvider {
    async fn list_tenants(&self) -> Result<Vec<String>, ProviderError> {
        let token = self.token(&self.config.main_project).await?;
        let url = self.identity_url(&format!("users/{}/projects", token.user_id))?;

        let response = self
            .client
            .get(url)
            .header(AUTH_TOKEN_HEADER, &token.token)
            .send()
            .await?;
        let list: ProjectList = check_status(response).await?.json().await?;

        let tenants: Vec<String> = list
            .projects
            .into_iter()
            .filter(|project| project.enabled)
            .map(|project| project.name)
            .collect();

        info!(tenants = tenants.len(), "Listed tenants");
        Ok(tenants)
    }

    /// Servers whose action log cannot be read are kept with an empty log,
    /// which classifies them as `DoNothing`. Servers deleted since the listing
    /// (404 on the action log) are skipped.
    async fn list_instances(&self, tenant: &str) -> Result<Vec<ServerRecord>, ProviderError> {
        let token = self.token(tenant).await?;
        let servers = self.servers(&token).await?;

        let mut records = Vec::with_capacity(servers.len());
        for server in servers {
            let actions = match self.instance_actions(&token, &server.id).await {
                Ok(actions) => actions,
                Err(e) => {
                    self.metrics.inc_provider_errors(e.kind());
                    if matches!(e, ProviderError::Status { status: 404, .. }) {
                        warn!(
                            tenant = %tenant,
                            instance_id = %server.id,
                            "Instance disappeared during listing, skipped"
                        );
                        continue;
                    }
                    warn!(
                        tenant = %tenant,
                        instance_id = %server.id,
                        error = %e,
                        "Failed to read action log, instance left untouched"
                    );
                    Vec::new()
                }
            };
            records.push(ServerRecord {
                id: server.id,
                name: server.name,
                vm_state: server.vm_state,
                actions,
            });
        }

        debug!(tenant = %tenant, instances = records.len(), "Listed instances");
        Ok(records)
    }

    async fn shelve(&self, tenant: &str, instance_id: &str) -> Result<(), ProviderError> {
        let token = self.token(tenant).await?;
        let url = Self::compute_url(&token, &format!("servers/{instance_id}/action"))?;

        let response = self
            .client
            .post(url)
            .header(AUTH_TOKEN_HEADER, &token.token)
            .json(&json!({ "shelve": null }))
            .send()
            .await?;
        not_found_as(response, tenant, instance_id).await
    }

    async fn delete(&self, tenant: &str, instance_id: &str) -> Result<(), ProviderError> {
        let token = self.token(tenant).await?;
        let url = Self::compute_url(&token, &format!("servers/{instance_id}"))?;

        let response = self
            .client
            .delete(url)
            .header(AUTH_TOKEN_HEADER, &token.token)
            .send()
            .await?;
        not_found_as(response, tenant, instance_id).await
    }
}

async fn not_found_as(
    response: Response,
    tenant: &str,
    instance_id: &str,
) -> Result<(), ProviderError> {
    if response.status() == reqwest::StatusCode::NOT_FOUND {
        return Err(ProviderError::NotFound {
            tenant: tenant.to_string(),
            instance_id: instance_id.to_string(),
        });
    }
    check_status(response).await.map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server, ServerGuard};

    fn config(server: &ServerGuard) -> OpenStackConfig {
        OpenStackConfig {
            auth_url: format!("{}/v3", server.url()),
            username: "automation".to_string(),
            password: "secret".to_string(),
            user_domain: "Default".to_string(),
            project_domain: "Default".to_string(),
            main_project: "admin".to_string(),
            region: None,
            request_timeout: Duration::from_secs(5),
        }
    }

    fn token_body(server: &ServerGuard) -> String {
        json!({
            "token": {
                "expires_at": "2999-01-01T00:00:00.000000Z",
                "user": {"id": "u-1"},
                "catalog": [
                    {"type": "identity", "endpoints": [
                        {"interface": "public", "region": "RegionOne", "url": "http://unused"}
                    ]},
                    {"type": "compute", "endpoints": [
                        {"interface": "internal", "region": "RegionOne", "url": "http://unused"},
                        {"interface": "public", "region": "RegionOne", "url": format!("{}/compute", server.url())}
                    ]}
                ]
            }
        })
        .to_string()
    }

    async fn mock_auth(server: &mut ServerGuard, project: &str, hits: usize) -> mockito::Mock {
        let body = token_body(server);
        server
            .mock("POST", "/v3/auth/tokens")
            .match_body(Matcher::PartialJson(json!({
                "auth": {"scope": {"project": {"name": project}}}
            })))
            .with_status(201)
            .with_header(SUBJECT_TOKEN_HEADER, &format!("token-{project}"))
            .with_header("content-type", "application/json")
            .with_body(body)
            .expect(hits)
            .create_async()
            .await
    }

    #[tokio::test]
    async fn test_list_tenants() {
        let mut server = Server::new_async().await;
        let auth = mock_auth(&mut server, "admin", 1).await;
        let projects = server
            .mock("GET", "/v3/users/u-1/projects")
            .match_header(AUTH_TOKEN_HEADER, "token-admin")
            .with_status(200)
            .with_body(
                json!({"projects": [
                    {"name": "research", "enabled": true},
                    {"name": "retired", "enabled": false},
                    {"name": "teaching"}
                ]})
                .to_string(),
            )
            .create_async()
            .await;

        let provider = OpenStackProvider::new(config(&server)).unwrap();
        let tenants = provider.list_tenants().await.unwrap();

        assert_eq!(tenants, vec!["research", "teaching"]);
        auth.assert_async().await;
        projects.assert_async().await;
    }

    #[tokio::test]
    async fn test_list_instances_with_actions() {
        let mut server = Server::new_async().await;
        let auth = mock_auth(&mut server, "research", 1).await;
        server
            .mock("GET", "/compute/servers/detail")
            .match_header(AUTH_TOKEN_HEADER, "token-research")
            .with_status(200)
            .with_body(
                json!({"servers": [
                    {"id": "i-1", "name": "web", "OS-EXT-STS:vm_state": "active"}
                ]})
                .to_string(),
            )
            .create_async()
            .await;
        server
            .mock("GET", "/compute/servers/i-1/os-instance-actions")
            .with_status(200)
            .with_body(
                json!({"instanceActions": [
                    {"action": "create", "start_time": "2020-01-01T10:00:00.000000"},
                    {"action": "stop", "start_time": "2020-02-01T10:00:00.000000"}
                ]})
                .to_string(),
            )
            .create_async()
            .await;

        let provider = OpenStackProvider::new(config(&server)).unwrap();
        let records = provider.list_instances("research").await.unwrap();
        // Second call reuses the cached token
        provider.list_instances("research").await.unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].vm_state, "active");
        assert_eq!(records[0].actions.len(), 2);
        assert_eq!(records[0].actions[1].action, "stop");
        auth.assert_async().await;
    }

    async fn mock_actions(server: &mut ServerGuard, instance_id: &str) -> mockito::Mock {
        server
            .mock("GET", format!("/compute/servers/{instance_id}/os-instance-actions").as_str())
            .with_status(200)
            .with_body(
                json!({"instanceActions": [
                    {"action": "create", "start_time": "2020-01-01T10:00:00.000000"}
                ]})
                .to_string(),
            )
            .create_async()
            .await
    }

    #[tokio::test]
    async fn test_unreadable_action_log_keeps_tenant() {
        let mut server = Server::new_async().await;
        mock_auth(&mut server, "research", 1).await;
        server
            .mock("GET", "/compute/servers/detail")
            .with_status(200)
            .with_body(
                json!({"servers": [
                    {"id": "i-1", "name": "web", "OS-EXT-STS:vm_state": "active"},
                    {"id": "i-2", "name": "gone", "OS-EXT-STS:vm_state": "active"},
                    {"id": "i-3", "name": "flaky", "OS-EXT-STS:vm_state": "stopped"}
                ]})
                .to_string(),
            )
            .create_async()
            .await;
        mock_actions(&mut server, "i-1").await;
        server
            .mock("GET", "/compute/servers/i-2/os-instance-actions")
            .with_status(404)
            .with_body("not found")
            .create_async()
            .await;
        server
            .mock("GET", "/compute/servers/i-3/os-instance-actions")
            .with_status(500)
            .with_body("oops")
            .create_async()
            .await;

        let provider = OpenStackProvider::new(config(&server)).unwrap();
        let records = provider.list_instances("research").await.unwrap();

        let ids: Vec<_> = records.iter().map(|record| record.id.as_str()).collect();
        assert_eq!(ids, vec!["i-1", "i-3"]);
        assert_eq!(records[0].actions.len(), 1);
        assert!(records[1].actions.is_empty());
    }

    #[tokio::test]
    async fn test_list_instances_follows_pages() {
        let mut server = Server::new_async().await;
        mock_auth(&mut server, "research", 1).await;
        let next = format!("{}/compute/servers/detail?limit=1&marker=i-1", server.url());
        let first = server
            .mock("GET", "/compute/servers/detail")
            .with_status(200)
            .with_body(
                json!({
                    "servers": [{"id": "i-1", "name": "a", "OS-EXT-STS:vm_state": "active"}],
                    "servers_links": [{"rel": "next", "href": next}]
                })
                .to_string(),
            )
            .create_async()
            .await;
        let second = server
            .mock("GET", "/compute/servers/detail")
            .match_query(Matcher::UrlEncoded("marker".into(), "i-1".into()))
            .with_status(200)
            .with_body(
                json!({"servers": [{"id": "i-2", "name": "b", "OS-EXT-STS:vm_state": "active"}]})
                    .to_string(),
            )
            .create_async()
            .await;
        mock_actions(&mut server, "i-1").await;
        mock_actions(&mut server, "i-2").await;

        let provider = OpenStackProvider::new(config(&server)).unwrap();
        let records = provider.list_instances("research").await.unwrap();

        let ids: Vec<_> = records.iter().map(|record| record.id.as_str()).collect();
        assert_eq!(ids, vec!["i-1", "i-2"]);
        first.assert_async().await;
        second.assert_async().await;
    }

    #[tokio::test]
    async fn test_logins_for_different_projects_do_not_wait() {
        let mut server = Server::new_async().await;
        let research = mock_auth(&mut server, "research", 1).await;
        let teaching = mock_auth(&mut server, "teaching", 1).await;

        let provider = OpenStackProvider::new(config(&server)).unwrap();

        // A login for research is in flight while teaching logs in
        let slot = provider.token_slot("research").await;
        let in_flight = slot.lock().await;
        let token = tokio::time::timeout(Duration::from_secs(5), provider.token("teaching"))
            .await
            .expect("teaching login waited on research")
            .unwrap();
        assert_eq!(token.token, "token-teaching");
        drop(in_flight);

        // Concurrent callers for one project share a single login
        let (a, b, c) = tokio::join!(
            provider.token("research"),
            provider.token("research"),
            provider.token("teaching"),
        );
        assert_eq!(a.unwrap().token, "token-research");
        assert_eq!(b.unwrap().token, "token-research");
        assert_eq!(c.unwrap().token, "token-teaching");

        research.assert_async().await;
        teaching.assert_async().await;
    }

    #[tokio::test]
    async fn test_auth_failure() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/v3/auth/tokens")
            .with_status(401)
            .with_body("bad credentials")
            .create_async()
            .await;

        let provider = OpenStackProvider::new(config(&server)).unwrap();
        match provider.list_instances("research").await {
            Err(ProviderError::Auth { project, reason }) => {
                assert_eq!(project, "research");
                assert!(reason.contains("bad credentials"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_compute_endpoint() {
        let mut server = Server::new_async().await;
        let mut config = config(&server);
        config.region = Some("Elsewhere".to_string());
        mock_auth(&mut server, "research", 1).await;

        let provider = OpenStackProvider::new(config).unwrap();
        assert!(matches!(
            provider.list_instances("research").await,
            Err(ProviderError::MissingEndpoint { .. })
        ));
    }

    #[tokio::test]
    async fn test_shelve_and_delete() {
        let mut server = Server::new_async().await;
        mock_auth(&mut server, "research", 1).await;
        let shelve = server
            .mock("POST", "/compute/servers/i-1/action")
            .match_body(Matcher::Json(json!({"shelve": null})))
            .with_status(202)
            .create_async()
            .await;
        let delete = server
            .mock("DELETE", "/compute/servers/i-1")
            .with_status(204)
            .create_async()
            .await;
        server
            .mock("DELETE", "/compute/servers/gone")
            .with_status(404)
            .create_async()
            .await;

        let provider = OpenStackProvider::new(config(&server)).unwrap();
        provider.shelve("research", "i-1").await.unwrap();
        provider.delete("research", "i-1").await.unwrap();
        assert!(matches!(
            provider.delete("research", "gone").await,
            Err(ProviderError::NotFound { .. })
        ));

        shelve.assert_async().await;
        delete.assert_async().await;
    }

    #[tokio::test]
    async fn test_server_error_is_reported() {
        let mut server = Server::new_async().await;
        mock_auth(&mut server, "research", 1).await;
        server
            .mock("GET", "/compute/servers/detail")
            .with_status(503)
            .with_body("maintenance")
            .create_async()
            .await;

        let provider = OpenStackProvider::new(config(&server)).unwrap();
        match provider.list_instances("research").await {
            Err(ProviderError::Status { status, body, .. }) => {
                assert_eq!(status, 503);
                assert_eq!(body, "maintenance");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_debug_redacts_password() {
        let config = OpenStackConfig {
            auth_url: "http://keystone/v3".to_string(),
            username: "automation".to_string(),
            password: "hunter2".to_string(),
            user_domain: "Default".to_string(),
            project_domain: "Default".to_string(),
            main_project: "admin".to_string(),
            region: None,
            request_timeout: Duration::from_secs(5),
        };
        assert!(!format!("{config:?}").contains("hunter2"));
    }
}
