//! Configuration for operator and worker processes.
//!
//! Plain structs with builder methods; binaries fill them from CLI flags and
//! validate once at boot. Invalid mandatory configuration is fatal.

use std::time::Duration;

use crate::error::{CgridError, CgridResult};
use crate::types::PostId;

/// Timing knobs for the route planner.
#[derive(Debug, Clone)]
pub struct PlannerConfig {
    /// Travel time between two consecutive cities on a route.
    pub travel_time: Duration,
    /// Length of one charging stop, i.e. of each reservation window.
    pub charging_duration: Duration,
    /// Lead time between "now" and the first window offered.
    pub preparation_buffer: Duration,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            travel_time: Duration::from_secs(60 * 60),
            charging_duration: Duration::from_secs(30 * 60),
            preparation_buffer: Duration::from_secs(10 * 60),
        }
    }
}

/// Complete configuration of one operator instance.
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Operator identity; also its route-request topic.
    pub operator_name: String,
    /// The one city whose posts this operator owns.
    pub owned_city: String,
    /// City capacity: number of posts usable at any instant.
    pub posts_quantity: usize,
    /// Ids of the post workers of this city, tried in this order.
    pub worker_ids: Vec<PostId>,
    /// Port of the participant HTTP API.
    pub http_port: u16,
    pub mqtt_broker_url: String,
    pub registry_url: String,
    /// Externally reachable base URL of the HTTP API. Derived from
    /// `operator_name` and `http_port` when not set.
    pub api_advertise_url: Option<String>,
    pub planner: PlannerConfig,
    /// PREPARED entries older than this are auto-aborted.
    pub prepared_ttl: Duration,
    /// Tick of the expiry sweeper.
    pub sweep_interval: Duration,
    /// Per-worker deadline during the local prepare vote.
    pub worker_reply_timeout: Duration,
    /// Per-call deadline for remote participant HTTP requests.
    pub remote_call_timeout: Duration,
    /// Overall 2PC deadline; on expiry the prepared set is aborted.
    pub transaction_deadline: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            operator_name: "Op1".to_string(),
            owned_city: "Salvador".to_string(),
            posts_quantity: 2,
            worker_ids: vec!["CP001".to_string(), "CP002".to_string()],
            http_port: 8080,
            mqtt_broker_url: "tcp://localhost:1883".to_string(),
            registry_url: "http://localhost:9000".to_string(),
            api_advertise_url: None,
            planner: PlannerConfig::default(),
            prepared_ttl: Duration::from_secs(5 * 60),
            sweep_interval: Duration::from_secs(10),
            worker_reply_timeout: Duration::from_secs(5),
            remote_call_timeout: Duration::from_secs(10),
            transaction_deadline: Duration::from_secs(60),
        }
    }
}

impl OperatorConfig {
    pub fn new(
        operator_name: impl Into<String>,
        owned_city: impl Into<String>,
        worker_ids: Vec<PostId>,
    ) -> Self {
        let posts_quantity = worker_ids.len().max(1);
        Self {
            operator_name: operator_name.into(),
            owned_city: owned_city.into(),
            posts_quantity,
            worker_ids,
            ..Default::default()
        }
    }

    pub fn with_http_port(mut self, port: u16) -> Self {
        self.http_port = port;
        self
    }

    pub fn with_mqtt_broker(mut self, url: impl Into<String>) -> Self {
        self.mqtt_broker_url = url.into();
        self
    }

    pub fn with_registry(mut self, url: impl Into<String>) -> Self {
        self.registry_url = url.into();
        self
    }

    pub fn with_posts_quantity(mut self, quantity: usize) -> Self {
        self.posts_quantity = quantity;
        self
    }

    pub fn with_advertise_url(mut self, url: impl Into<String>) -> Self {
        self.api_advertise_url = Some(url.into());
        self
    }

    /// The coordinator URL broadcast in every PREPARE.
    pub fn api_url(&self) -> String {
        match &self.api_advertise_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("http://{}:{}", self.operator_name, self.http_port),
        }
    }

    pub fn validate(&self) -> CgridResult<()> {
        if self.operator_name.trim().is_empty() {
            return Err(CgridError::InvalidConfig("operator_name is empty".into()));
        }
        if self.owned_city.trim().is_empty() {
            return Err(CgridError::InvalidConfig("owned_city is empty".into()));
        }
        if self.posts_quantity == 0 {
            return Err(CgridError::InvalidConfig(
                "posts_quantity must be at least 1".into(),
            ));
        }
        if self.worker_ids.is_empty() {
            return Err(CgridError::InvalidConfig("worker_ids is empty".into()));
        }
        if self.http_port == 0 {
            return Err(CgridError::InvalidConfig("http_port must be non-zero".into()));
        }
        if self.mqtt_broker_url.trim().is_empty() {
            return Err(CgridError::InvalidConfig("mqtt_broker_url is empty".into()));
        }
        if self.registry_url.trim().is_empty() {
            return Err(CgridError::InvalidConfig("registry_url is empty".into()));
        }
        Ok(())
    }
}

/// Configuration of one charging-post worker process.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: PostId,
    /// Operator owning this post; part of the topic scheme.
    pub operator_name: String,
    pub mqtt_broker_url: String,
    /// Tick of the time-passage sweep.
    pub sweep_interval: Duration,
    /// PREPARED entries older than this are auto-aborted.
    pub prepared_ttl: Duration,
    /// Flat cost reported in charged notices.
    pub charge_cost: f64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: "CP001".to_string(),
            operator_name: "Op1".to_string(),
            mqtt_broker_url: "tcp://localhost:1883".to_string(),
            sweep_interval: Duration::from_secs(10),
            prepared_ttl: Duration::from_secs(5 * 60),
            charge_cost: 20.0,
        }
    }
}

impl WorkerConfig {
    pub fn new(worker_id: impl Into<String>, operator_name: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            operator_name: operator_name.into(),
            ..Default::default()
        }
    }

    pub fn with_mqtt_broker(mut self, url: impl Into<String>) -> Self {
        self.mqtt_broker_url = url.into();
        self
    }

    pub fn validate(&self) -> CgridResult<()> {
        if self.worker_id.trim().is_empty() {
            return Err(CgridError::InvalidConfig("worker_id is empty".into()));
        }
        if self.operator_name.trim().is_empty() {
            return Err(CgridError::InvalidConfig("operator_name is empty".into()));
        }
        if self.mqtt_broker_url.trim().is_empty() {
            return Err(CgridError::InvalidConfig("mqtt_broker_url is empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operator_config_builder() {
        let config = OperatorConfig::new(
            "SolAtlantico",
            "Salvador",
            vec!["CP001".to_string(), "CP002".to_string()],
        )
        .with_http_port(8081)
        .with_mqtt_broker("tcp://broker:1883")
        .with_registry("http://registry:9000");

        assert_eq!(config.operator_name, "SolAtlantico");
        assert_eq!(config.posts_quantity, 2);
        assert_eq!(config.api_url(), "http://SolAtlantico:8081");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn advertise_url_overrides_derived() {
        let config = OperatorConfig::default().with_advertise_url("http://10.0.0.5:8080/");
        assert_eq!(config.api_url(), "http://10.0.0.5:8080");
    }

    #[test]
    fn validation_rejects_missing_mandatory_fields() {
        let mut config = OperatorConfig::default();
        config.worker_ids.clear();
        assert!(config.validate().is_err());

        let mut config = OperatorConfig::default();
        config.posts_quantity = 0;
        assert!(config.validate().is_err());

        let mut config = WorkerConfig::default();
        config.worker_id = String::new();
        assert!(config.validate().is_err());
    }
}
