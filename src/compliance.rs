//! Per-host compliance gate for scheduled collection.
//!
//! Caches robots.txt policy per host and answers allowed/required-delay
//! decisions. Policy fetch failures default to permissive. Rate-limit
//! floors are enforced per source class on top of any crawl-delay the host
//! requests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::debug;
use url::Url;

/// Polite default delay between requests to one host.
pub const DEFAULT_DELAY: Duration = Duration::from_secs(1);

/// Floor for academic APIs without a stricter published limit.
pub const ACADEMIC_DELAY: Duration = Duration::from_secs(2);

/// arXiv asks for at most one request every three seconds.
pub const ARXIV_DELAY: Duration = Duration::from_secs(3);

/// Outcome of a compliance check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    /// The caller must sleep this long before issuing the fetch.
    pub required_delay: Duration,
}

/// Cached per-host policy.
#[derive(Debug, Clone, Default)]
struct HostPolicy {
    disallow: Vec<String>,
    crawl_delay: Option<Duration>,
}

impl HostPolicy {
    fn permits(&self, path: &str) -> bool {
        !self
            .disallow
            .iter()
            .any(|prefix| !prefix.is_empty() && path.starts_with(prefix))
    }
}

/// Robots/policy gate with a per-host cache.
#[derive(Clone)]
pub struct ComplianceGate {
    client: reqwest::Client,
    agent_token: String,
    policies: Arc<RwLock<HashMap<String, HostPolicy>>>,
}

impl ComplianceGate {
    /// Create a gate identifying as the given agent token.
    pub fn new(user_agent: &str, agent_token: &str) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self {
            client,
            agent_token: agent_token.to_lowercase(),
            policies: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Check whether a URL may be fetched and how long to wait first,
    /// applying the general polite floor.
    pub async fn check(&self, url: &str) -> Decision {
        self.check_with_floor(url, DEFAULT_DELAY).await
    }

    /// Check with the floor appropriate for a named source class.
    pub async fn check_for_source(&self, url: &str, source_name: &str) -> Decision {
        self.check_with_floor(url, floor_for_source(source_name)).await
    }

    async fn check_with_floor(&self, url: &str, floor: Duration) -> Decision {
        let parsed = match Url::parse(url) {
            Ok(parsed) => parsed,
            // Unparseable URLs are rejected later by the fetch activity;
            // the gate stays permissive.
            Err(_) => {
                return Decision {
                    allowed: true,
                    required_delay: floor,
                }
            }
        };
        let host_key = match host_key(&parsed) {
            Some(key) => key,
            None => {
                return Decision {
                    allowed: true,
                    required_delay: floor,
                }
            }
        };

        let policy = {
            let policies = self.policies.read().await;
            policies.get(&host_key).cloned()
        };
        let policy = match policy {
            Some(policy) => policy,
            None => {
                let fetched = self.fetch_policy(&parsed).await;
                let mut policies = self.policies.write().await;
                policies.entry(host_key).or_insert_with(|| fetched).clone()
            }
        };

        let allowed = policy.permits(parsed.path());
        let required_delay = policy.crawl_delay.unwrap_or(Duration::ZERO).max(floor);
        Decision {
            allowed,
            required_delay,
        }
    }

    /// Fetch and parse robots.txt for a host. Any failure yields the
    /// permissive default.
    async fn fetch_policy(&self, url: &Url) -> HostPolicy {
        let host = match url.host_str() {
            Some(host) => host,
            None => return HostPolicy::default(),
        };
        let robots_url = match url.port() {
            Some(port) => format!("{}://{}:{}/robots.txt", url.scheme(), host, port),
            None => format!("{}://{}/robots.txt", url.scheme(), host),
        };

        let body = match self.client.get(&robots_url).send().await {
            Ok(response) if response.status().is_success() => match response.text().await {
                Ok(body) => body,
                Err(e) => {
                    debug!("robots.txt body read failed for {}: {}", robots_url, e);
                    return HostPolicy::default();
                }
            },
            Ok(response) => {
                debug!("robots.txt {} for {}", response.status(), robots_url);
                return HostPolicy::default();
            }
            Err(e) => {
                debug!("robots.txt fetch failed for {}: {}", robots_url, e);
                return HostPolicy::default();
            }
        };

        parse_robots(&body, &self.agent_token)
    }
}

/// Delay floor for a source class.
pub fn floor_for_source(source_name: &str) -> Duration {
    match source_name.to_lowercase().as_str() {
        "arxiv" => ARXIV_DELAY,
        "pubmed" | "doaj" | "plos" | "semantic_scholar" | "core" => ACADEMIC_DELAY,
        _ => DEFAULT_DELAY,
    }
}

fn host_key(url: &Url) -> Option<String> {
    url.host_str().map(|host| match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

/// Parse robots.txt rules for the given agent token, falling back to the
/// wildcard group.
fn parse_robots(body: &str, agent_token: &str) -> HostPolicy {
    let mut wildcard = HostPolicy::default();
    let mut specific: Option<HostPolicy> = None;

    let mut current_agents: Vec<String> = Vec::new();
    let mut current = HostPolicy::default();
    let mut in_group = false;

    let mut flush = |agents: &[String], policy: HostPolicy| {
        for agent in agents {
            if agent == "*" {
                wildcard = policy.clone();
            } else if agent_token.contains(agent.as_str()) {
                specific = Some(policy.clone());
            }
        }
    };

    for line in body.lines() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let Some((field, value)) = line.split_once(':') else {
            continue;
        };
        let field = field.trim().to_lowercase();
        let value = value.trim();

        match field.as_str() {
            "user-agent" => {
                if in_group {
                    flush(&current_agents, std::mem::take(&mut current));
                    current_agents.clear();
                    in_group = false;
                }
                current_agents.push(value.to_lowercase());
            }
            "disallow" => {
                in_group = true;
                if !value.is_empty() {
                    current.disallow.push(value.to_string());
                }
            }
            "crawl-delay" => {
                in_group = true;
                if let Ok(seconds) = value.parse::<f64>() {
                    current.crawl_delay = Some(Duration::from_secs_f64(seconds.max(0.0)));
                }
            }
            _ => {}
        }
    }
    flush(&current_agents, current);

    specific.unwrap_or(wildcard)
}
