//! Health probe strategies run against a supervised process.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use kestrel_process::{HealthCheckSpec, ProcessRecord};

use crate::platform::ProcessControl;

/// What a probe needs to know about the process it is checking.
#[derive(Debug, Clone, Copy)]
pub struct ProbeTarget {
    pub pid: u32,
    pub port: u16,
}

impl From<&ProcessRecord> for ProbeTarget {
    fn from(record: &ProcessRecord) -> Self {
        Self {
            pid: record.pid,
            port: record.port,
        }
    }
}

#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self, target: ProbeTarget) -> bool;
}

/// Healthy when `method url` answers `200 OK` within the client's timeout.
pub struct HttpProbe {
    pub client: reqwest::Client,
    pub method: reqwest::Method,
    pub url: String,
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn check(&self, _target: ProbeTarget) -> bool {
        match self
            .client
            .request(self.method.clone(), &self.url)
            .send()
            .await
        {
            Ok(resp) => resp.status() == reqwest::StatusCode::OK,
            Err(e) => {
                tracing::debug!(url = %self.url, error = %e, "http health probe failed");
                false
            }
        }
    }
}

/// Healthy when a TCP connection to the process port on loopback succeeds.
pub struct TcpProbe {
    pub ipv4: bool,
    pub timeout: Duration,
}

#[async_trait]
impl HealthProbe for TcpProbe {
    async fn check(&self, target: ProbeTarget) -> bool {
        if target.port == 0 {
            return false;
        }
        let host = if self.ipv4 { "127.0.0.1" } else { "::1" };
        matches!(
            tokio::time::timeout(
                self.timeout,
                tokio::net::TcpStream::connect((host, target.port))
            )
            .await,
            Ok(Ok(_))
        )
    }
}

/// Healthy while the PID answers a liveness signal.
pub struct PidProbe {
    pub platform: Arc<dyn ProcessControl>,
}

#[async_trait]
impl HealthProbe for PidProbe {
    async fn check(&self, target: ProbeTarget) -> bool {
        self.platform.is_alive(target.pid)
    }
}

/// Builds the probe for a persisted spec.
pub(crate) fn probe_for(
    spec: &HealthCheckSpec,
    client: &reqwest::Client,
    platform: &Arc<dyn ProcessControl>,
    timeout: Duration,
) -> Box<dyn HealthProbe> {
    match spec {
        HealthCheckSpec::Http { method, url } => Box::new(HttpProbe {
            client: client.clone(),
            method: reqwest::Method::from_bytes(method.to_ascii_uppercase().as_bytes())
                .unwrap_or(reqwest::Method::GET),
            url: url.clone(),
        }),
        HealthCheckSpec::Tcp { ipv4 } => Box::new(TcpProbe {
            ipv4: *ipv4,
            timeout,
        }),
        HealthCheckSpec::Process => Box::new(PidProbe {
            platform: platform.clone(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(port: u16) -> ProbeTarget {
        ProbeTarget {
            pid: std::process::id(),
            port,
        }
    }

    #[tokio::test]
    async fn tcp_probe_sees_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let probe = TcpProbe {
            ipv4: true,
            timeout: Duration::from_secs(1),
        };
        assert!(probe.check(target(port)).await);

        drop(listener);
        assert!(!probe.check(target(port)).await);
        assert!(!probe.check(target(0)).await);
    }

    #[tokio::test]
    async fn http_probe_requires_200() {
        use axum::{Router, http::StatusCode, routing::get};

        let app = Router::new()
            .route("/ok", get(|| async { "ok" }))
            .route("/bad", get(|| async { StatusCode::SERVICE_UNAVAILABLE }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .unwrap();
        let ok = HttpProbe {
            client: client.clone(),
            method: reqwest::Method::GET,
            url: format!("http://{addr}/ok"),
        };
        let bad = HttpProbe {
            client,
            method: reqwest::Method::GET,
            url: format!("http://{addr}/bad"),
        };
        assert!(ok.check(target(0)).await);
        assert!(!bad.check(target(0)).await);
    }

    #[tokio::test]
    async fn pid_probe_follows_platform() {
        let probe = PidProbe {
            platform: crate::platform::native(),
        };
        assert!(probe.check(target(0)).await);
    }
}
