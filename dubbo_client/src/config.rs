use std::time::Duration;

use dubbo_protocol::SerializeType;

use crate::selector::SelectMode;

/// client-wide options, fixed at construction time.
#[derive(Debug, Clone)]
pub struct Opt {
    /// default per-call timeout; a per-service timeout overrides it.
    pub invoke_timeout: Duration,
    pub connect_timeout: Duration,
    /// connection-fault budget: how many faulted dispatch attempts one
    /// request is allowed before it resolves with "retry budget exhausted".
    pub retry: u8,
    pub heartbeat_interval: Duration,
    pub heartbeat_miss_threshold: u8,
    /// base delay of the exponential reconnect backoff.
    pub reconnect_delay: Duration,
    pub reconnect_delay_cap: Duration,
    pub select_mode: SelectMode,
    pub serialize_type: SerializeType,
}

impl Default for Opt {
    fn default() -> Self {
        Opt {
            invoke_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(3),
            retry: 3,
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_miss_threshold: 3,
            reconnect_delay: Duration::from_millis(100),
            reconnect_delay_cap: Duration::from_secs(10),
            select_mode: SelectMode::RandomSelect,
            serialize_type: SerializeType::JSON,
        }
    }
}

/// identity of the consuming application, propagated into call metadata and
/// the registered consumer urls.
#[derive(Debug, Clone)]
pub struct Application {
    pub name: String,
    pub host: String,
}

impl Default for Application {
    fn default() -> Self {
        Application {
            name: "dubbo-consumer".to_owned(),
            host: "127.0.0.1".to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_opt() {
        let opt = Opt::default();
        assert_eq!(3, opt.retry);
        assert_eq!(Duration::from_secs(5), opt.invoke_timeout);
        assert_eq!(SelectMode::RandomSelect, opt.select_mode);
    }
}
