use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::redirect::Policy;
use reqwest::Client;

use skyforge_common::AppConfig;
use skyforge_deploy::Deployer;
use skyforge_stacks::load_balancer::{EDGE_ALB_DNS, EDGE_URL};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    Forbidden,
    Reachable,
}

impl Expect {
    pub fn accepts(self, status: u16) -> bool {
        match self {
            Self::Forbidden => status == 403,
            Self::Reachable => (200..400).contains(&status),
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Forbidden => "403",
            Self::Reachable => "2xx/3xx",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub name: String,
    pub url: String,
    pub expected: &'static str,
    /// Status code, or the transport error.
    pub observed: Result<u16, String>,
    pub ok: bool,
}

struct Probe {
    name: &'static str,
    url: String,
    header: Option<(String, String)>,
    expect: Expect,
}

/// Probes the public endpoints recorded for the load-balancer stack.
pub async fn verify(cfg: &AppConfig, deployer: &Deployer, timeout: Duration) -> Result<Vec<ProbeResult>> {
    let stack = cfg.load_balancer_stack();
    let outputs = deployer.outputs(&stack).await?;
    let alb = outputs
        .get(EDGE_ALB_DNS)
        .with_context(|| format!("{stack} is not deployed or has no {EDGE_ALB_DNS} output"))?;
    let edge = outputs
        .get(EDGE_URL)
        .with_context(|| format!("{stack} has no {EDGE_URL} output"))?;

    let guard = &cfg.load_balancer.header_guard;
    let probes = [
        Probe {
            name: "public ALB without origin header",
            url: format!("http://{alb}/"),
            header: None,
            expect: Expect::Forbidden,
        },
        Probe {
            name: "public ALB with wrong origin header",
            url: format!("http://{alb}/"),
            header: Some((guard.header_name.clone(), "skyforge-verify".to_string())),
            expect: Expect::Forbidden,
        },
        Probe {
            name: "edge distribution",
            url: format!("{}/health", edge.trim_end_matches('/')),
            header: None,
            expect: Expect::Reachable,
        },
    ];

    let client = Client::builder()
        .connect_timeout(Duration::from_secs(3))
        .timeout(timeout)
        .redirect(Policy::none())
        .build()?;

    let mut results = Vec::with_capacity(probes.len());
    for probe in probes {
        let mut req = client.get(&probe.url);
        if let Some((name, value)) = &probe.header {
            req = req.header(name.as_str(), value.as_str());
        }
        let observed = match req.send().await {
            Ok(resp) => Ok(resp.status().as_u16()),
            Err(e) => Err(e.to_string()),
        };
        let ok = observed.as_ref().is_ok_and(|s| probe.expect.accepts(*s));
        tracing::debug!(probe = probe.name, url = %probe.url, ?observed, ok, "probe finished");
        results.push(ProbeResult {
            name: probe.name.to_string(),
            url: probe.url,
            expected: probe.expect.label(),
            observed,
            ok,
        });
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expectations() {
        assert!(Expect::Forbidden.accepts(403));
        assert!(!Expect::Forbidden.accepts(200));
        assert!(!Expect::Forbidden.accepts(502));
        assert!(Expect::Reachable.accepts(200));
        assert!(Expect::Reachable.accepts(302));
        assert!(!Expect::Reachable.accepts(403));
        assert!(!Expect::Reachable.accepts(504));
    }
}
