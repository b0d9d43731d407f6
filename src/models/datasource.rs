use serde::{Deserialize, Serialize};

/// The closed set of backend families the gateway can speak to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DsType {
    Prometheus,
    VictoriaMetrics,
    Loki,
    VictoriaLogs,
    Tempo,
    VictoriaTraces,
    Clickhouse,
    Cloudwatch,
    Elasticsearch,
}

impl DsType {
    pub const ALL: [DsType; 9] = [
        DsType::Prometheus,
        DsType::VictoriaMetrics,
        DsType::Loki,
        DsType::VictoriaLogs,
        DsType::Tempo,
        DsType::VictoriaTraces,
        DsType::Clickhouse,
        DsType::Cloudwatch,
        DsType::Elasticsearch,
    ];

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "prometheus" => Some(Self::Prometheus),
            "victoriametrics" => Some(Self::VictoriaMetrics),
            "loki" => Some(Self::Loki),
            "victorialogs" => Some(Self::VictoriaLogs),
            "tempo" => Some(Self::Tempo),
            "victoriatraces" => Some(Self::VictoriaTraces),
            "clickhouse" => Some(Self::Clickhouse),
            "cloudwatch" => Some(Self::Cloudwatch),
            "elasticsearch" => Some(Self::Elasticsearch),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prometheus => "prometheus",
            Self::VictoriaMetrics => "victoriametrics",
            Self::Loki => "loki",
            Self::VictoriaLogs => "victorialogs",
            Self::Tempo => "tempo",
            Self::VictoriaTraces => "victoriatraces",
            Self::Clickhouse => "clickhouse",
            Self::Cloudwatch => "cloudwatch",
            Self::Elasticsearch => "elasticsearch",
        }
    }

    /// Primary capability class. Exactly one of the three predicates holds
    /// for every type; multi-signal backends (clickhouse, cloudwatch,
    /// elasticsearch) can still serve other signals via the query `signal`
    /// field, but handler admission for labels/traces endpoints is gated on
    /// the primary capability.
    pub fn is_metrics(&self) -> bool {
        matches!(
            self,
            Self::Prometheus | Self::VictoriaMetrics | Self::Clickhouse | Self::Cloudwatch
        )
    }

    pub fn is_logs(&self) -> bool {
        matches!(self, Self::Loki | Self::VictoriaLogs | Self::Elasticsearch)
    }

    pub fn is_traces(&self) -> bool {
        matches!(self, Self::Tempo | Self::VictoriaTraces)
    }
}

/// Credential scheme applied to outbound requests for a datasource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    None,
    Basic,
    Bearer,
    ApiKey,
    Cloud,
}

impl AuthType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Some(Self::None),
            "basic" => Some(Self::Basic),
            "bearer" => Some(Self::Bearer),
            "api_key" => Some(Self::ApiKey),
            "cloud" => Some(Self::Cloud),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Basic => "basic",
            Self::Bearer => "bearer",
            Self::ApiKey => "api_key",
            Self::Cloud => "cloud",
        }
    }
}

/// A tenant-scoped datasource record.
///
/// `auth_config` is opaque credential material: it is only interpreted by
/// the auth injector and never serialised into API responses or logs.
#[derive(Debug, Clone, Serialize)]
pub struct DataSource {
    pub id: String,
    pub organization_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub ds_type: DsType,
    pub url: String,
    pub auth_type: AuthType,
    #[serde(skip_serializing)]
    pub auth_config: serde_json::Map<String, serde_json::Value>,
    pub config: serde_json::Map<String, serde_json::Value>,
    pub is_default: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl DataSource {
    /// String-valued key from the per-backend `config` blob.
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(|v| v.as_str()).filter(|s| !s.is_empty())
    }

    /// String-valued key from the opaque `auth_config` blob. Only the auth
    /// injector and the cloudwatch adapter (region/log groups) read this.
    pub fn auth_config_str(&self, key: &str) -> Option<&str> {
        self.auth_config
            .get(key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_type_has_exactly_one_capability() {
        for t in DsType::ALL {
            let count = [t.is_metrics(), t.is_logs(), t.is_traces()]
                .iter()
                .filter(|b| **b)
                .count();
            assert_eq!(count, 1, "{} must have exactly one capability", t.as_str());
        }
    }

    #[test]
    fn type_strings_round_trip() {
        for t in DsType::ALL {
            assert_eq!(DsType::parse(t.as_str()), Some(t));
        }
        assert_eq!(DsType::parse("graphite"), None);
    }

    #[test]
    fn auth_type_empty_is_none() {
        assert_eq!(AuthType::parse(""), Some(AuthType::None));
        assert_eq!(AuthType::parse("BASIC"), Some(AuthType::Basic));
        assert_eq!(AuthType::parse("kerberos"), None);
    }

    #[test]
    fn auth_config_is_never_serialised() {
        let ds = DataSource {
            id: "d1".into(),
            organization_id: "o1".into(),
            name: "prod loki".into(),
            ds_type: DsType::Loki,
            url: "http://loki:3100".into(),
            auth_type: AuthType::Bearer,
            auth_config: serde_json::json!({"token": "s3cret"}).as_object().unwrap().clone(),
            config: serde_json::Map::new(),
            is_default: false,
            created_at: "2024-01-01T00:00:00Z".into(),
            updated_at: "2024-01-01T00:00:00Z".into(),
        };
        let body = serde_json::to_string(&ds).unwrap();
        assert!(!body.contains("s3cret"));
        assert!(!body.contains("auth_config"));
    }
}
