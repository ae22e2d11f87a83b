use std::time::Duration;

use qstring::QString;

use crate::config::Application;
use crate::proxy::ServiceDescriptor;

/// the externally visible descriptor of one declared consumer, handed to the
/// registry once per service at bootstrap.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerDescriptor {
    pub service_path: String,
    pub url: String,
}

/// build the consumer url for one declared service. field order is fixed so
/// repeated builds produce the same string. `check=false` tells the registry
/// not to fail startup when no provider is live yet.
pub fn build_consumer(
    app: &Application,
    service: &ServiceDescriptor,
    default_timeout: Duration,
) -> ConsumerDescriptor {
    let timeout = service.timeout.unwrap_or(default_timeout);
    let timeout = format!("{}", timeout.as_millis());
    let qs = QString::new(vec![
        ("interface", service.service_path.as_str()),
        ("application", app.name.as_str()),
        ("category", "consumers"),
        ("method", ""),
        ("revision", ""),
        ("group", service.group.as_str()),
        ("version", service.version.as_str()),
        ("timeout", timeout.as_str()),
        ("side", "consumer"),
        ("check", "false"),
    ]);
    let query = qs.to_string();
    let url = format!(
        "consumer://{}/{}?{}",
        app.host,
        service.service_path,
        query.trim_start_matches('?')
    );
    ConsumerDescriptor {
        service_path: service.service_path.clone(),
        url,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app() -> Application {
        Application {
            name: "order-app".to_owned(),
            host: "10.0.0.7".to_owned(),
        }
    }

    fn service() -> ServiceDescriptor {
        ServiceDescriptor::new("echo", "com.demo.EchoService")
            .method("say")
            .group("g1")
            .version("1.0.0")
    }

    #[test]
    fn url_is_deterministic() {
        let a = build_consumer(&app(), &service(), Duration::from_secs(5));
        let b = build_consumer(&app(), &service(), Duration::from_secs(5));
        assert_eq!(a, b);
    }

    #[test]
    fn url_carries_consumer_markers() {
        let descriptor = build_consumer(&app(), &service(), Duration::from_secs(5));
        assert!(descriptor
            .url
            .starts_with("consumer://10.0.0.7/com.demo.EchoService?"));
        assert!(descriptor.url.contains("interface=com.demo.EchoService"));
        assert!(descriptor.url.contains("application=order-app"));
        assert!(descriptor.url.contains("group=g1"));
        assert!(descriptor.url.contains("version=1.0.0"));
        assert!(descriptor.url.contains("timeout=5000"));
        assert!(descriptor.url.contains("side=consumer"));
        assert!(descriptor.url.contains("check=false"));
    }

    #[test]
    fn per_service_timeout_wins() {
        let service = service().timeout(Duration::from_millis(800));
        let descriptor = build_consumer(&app(), &service, Duration::from_secs(5));
        assert!(descriptor.url.contains("timeout=800"));
    }
}
