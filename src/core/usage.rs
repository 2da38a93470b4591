use serde::Serialize;
use url::Url;

/// One "a download happened" record for the usage log.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UsageEntry {
    pub user_id: String,
    pub format: String,
    pub file_size: usize,
    pub filename: String,
}

/// Posts usage entries without making the export wait on them.
#[derive(Clone)]
pub struct UsageLogger {
    client: reqwest::Client,
    endpoint: Option<Url>,
}

impl UsageLogger {
    pub fn new(endpoint: Option<Url>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
        }
    }

    pub fn disabled() -> Self {
        Self::new(None)
    }

    pub fn is_enabled(&self) -> bool {
        self.endpoint.is_some()
    }

    /// Fire and forget. Failures are logged and otherwise ignored.
    pub fn record(&self, entry: UsageEntry) {
        let Some(endpoint) = self.endpoint.clone() else {
            return;
        };
        let client = self.client.clone();

        tokio::spawn(async move {
            match client.post(endpoint).json(&entry).send().await {
                Ok(response) if response.status().is_success() => {
                    tracing::debug!(user = %entry.user_id, "Usage entry recorded");
                }
                Ok(response) => {
                    tracing::warn!(
                        user = %entry.user_id,
                        "Usage log rejected entry with status {}",
                        response.status()
                    );
                }
                Err(e) => {
                    tracing::warn!(user = %entry.user_id, "Usage log unreachable: {}", e);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_serializes_in_camel_case() {
        let entry = UsageEntry {
            user_id: "u-1".into(),
            format: "png".into(),
            file_size: 1234,
            filename: "Jordan-Lee-card.png".into(),
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["userId"], "u-1");
        assert_eq!(json["fileSize"], 1234);
    }

    #[test]
    fn disabled_logger_is_a_no_op() {
        let logger = UsageLogger::disabled();
        assert!(!logger.is_enabled());
        // no runtime needed: nothing is spawned
        logger.record(UsageEntry {
            user_id: "u-1".into(),
            format: "png".into(),
            file_size: 1,
            filename: "x.png".into(),
        });
    }
}
