use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

use dubbo::*;

/// how the in-process provider treats data requests. heartbeats are always
/// acknowledged except in `Deaf` mode.
#[derive(Clone, Copy)]
enum Behavior {
    /// reply with the first argument.
    Echo,
    /// reply with a well-formed error response.
    AppError,
    /// read one data request, then sever the link without replying.
    DropConnection,
    /// read data requests and never reply, but keep the link alive.
    Ignore,
    /// reply after the given number of millis.
    DelayReply(u64),
    /// no heartbeat acks and no data replies.
    Deaf,
}

async fn spawn_provider(behavior: Behavior) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            tokio::spawn(serve_conn(stream, behavior));
        }
    });
    addr
}

async fn serve_conn(mut stream: TcpStream, behavior: Behavior) {
    loop {
        let msg = match Message::read_from(&mut stream).await {
            Ok(msg) => msg,
            Err(_) => return,
        };

        if msg.is_heartbeat() {
            if let Behavior::Deaf = behavior {
                continue;
            }
            let mut ack = Message::new();
            ack.set_message_type(MessageType::Response);
            ack.set_heartbeat(true);
            ack.set_seq(msg.get_seq());
            if stream.write_all(&ack.encode()).await.is_err() {
                return;
            }
            continue;
        }

        match behavior {
            Behavior::DropConnection => return,
            Behavior::Ignore | Behavior::Deaf => continue,
            Behavior::DelayReply(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
            _ => {}
        }

        let mut reply = Message::new();
        reply.set_message_type(MessageType::Response);
        reply.set_serialize_type(SerializeType::JSON);
        reply.set_seq(msg.get_seq());
        match behavior {
            Behavior::AppError => reply.set_error("boom"),
            _ => {
                let args: Vec<Value> = serde_json::from_slice(&msg.payload).unwrap_or_default();
                let body = args.into_iter().next().unwrap_or(Value::Null);
                reply
                    .payload
                    .extend_from_slice(&serde_json::to_vec(&body).unwrap());
            }
        }
        if stream.write_all(&reply.encode()).await.is_err() {
            return;
        }
    }
}

fn echo_descriptor() -> ServiceDescriptor {
    ServiceDescriptor::new("echo", "com.test.EchoService").method("say")
}

fn provider(addr: SocketAddr, key: &ServiceKey) -> ProviderAddress {
    ProviderAddress {
        host: addr.ip().to_string(),
        port: addr.port(),
        service_path: key.service_path.clone(),
        group: key.group.clone(),
        version: key.version.clone(),
        weight: 1,
    }
}

fn build_dubbo(registry: Arc<StaticRegistry>, opt: Opt, descriptor: ServiceDescriptor) -> Dubbo {
    let _ = env_logger::builder().is_test(true).try_init();
    Dubbo::builder()
        .application(Application {
            name: "test-app".to_owned(),
            host: "127.0.0.1".to_owned(),
        })
        .opt(opt)
        .registry(registry)
        .service(proxy_service(descriptor))
        .build()
        .unwrap()
}

#[tokio::test]
async fn echo_end_to_end() {
    let addr = spawn_provider(Behavior::Echo).await;
    let registry = Arc::new(StaticRegistry::new());
    let descriptor = echo_descriptor();
    let key = descriptor.key();
    registry.update_providers(key.clone(), vec![provider(addr, &key)]);

    let dubbo = build_dubbo(registry.clone(), Opt::default(), descriptor);
    dubbo.ready().await.unwrap();

    let echo = dubbo.service("echo").unwrap();
    let reply = echo.invoke("say", vec![json!("hi")]).await.unwrap();
    assert_eq!(json!("hi"), reply);

    // the consumer descriptor was registered exactly once, at bootstrap
    tokio::time::sleep(Duration::from_millis(200)).await;
    let consumers = registry.registered_consumers();
    assert_eq!(1, consumers.len());
    assert!(consumers[0].url.contains("side=consumer"));
    assert!(consumers[0].url.contains("check=false"));

    let reply = echo.invoke("say", vec![json!("again")]).await.unwrap();
    assert_eq!(json!("again"), reply);
    assert_eq!(1, registry.registered_consumers().len());
}

#[tokio::test]
async fn zero_providers_resolves_with_timeout() {
    let registry = Arc::new(StaticRegistry::new());
    let mut opt = Opt::default();
    opt.invoke_timeout = Duration::from_millis(200);

    let dubbo = build_dubbo(registry, opt, echo_descriptor());
    let started = Instant::now();
    let err = dubbo
        .service("echo")
        .unwrap()
        .invoke("say", vec![json!("hi")])
        .await
        .unwrap_err();

    assert_eq!(ErrorKind::Timeout, err.kind());
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn application_error_surfaces_verbatim() {
    let addr = spawn_provider(Behavior::AppError).await;
    let registry = Arc::new(StaticRegistry::new());
    let descriptor = echo_descriptor();
    let key = descriptor.key();
    registry.update_providers(key.clone(), vec![provider(addr, &key)]);

    let dubbo = build_dubbo(registry, Opt::default(), descriptor);
    let err = dubbo
        .service("echo")
        .unwrap()
        .invoke("say", vec![json!("hi")])
        .await
        .unwrap_err();

    assert_eq!(ErrorKind::Application, err.kind());
    assert!(err.to_string().contains("boom"));
}

#[tokio::test]
async fn retry_budget_exhausted_on_connection_faults() {
    let addr = spawn_provider(Behavior::DropConnection).await;
    let registry = Arc::new(StaticRegistry::new());
    let descriptor = echo_descriptor();
    let key = descriptor.key();
    registry.update_providers(key.clone(), vec![provider(addr, &key)]);

    let mut opt = Opt::default();
    opt.retry = 2;
    opt.reconnect_delay = Duration::from_millis(50);

    let dubbo = build_dubbo(registry, opt, descriptor);
    let err = dubbo
        .service("echo")
        .unwrap()
        .invoke("say", vec![json!("hi")])
        .await
        .unwrap_err();

    assert_eq!(ErrorKind::Connection, err.kind());
    assert!(err.to_string().contains("retry budget exhausted"));
}

#[tokio::test]
async fn failover_reaches_a_healthy_provider() {
    let flaky = spawn_provider(Behavior::DropConnection).await;
    let healthy = spawn_provider(Behavior::Echo).await;
    let registry = Arc::new(StaticRegistry::new());
    let descriptor = echo_descriptor();
    let key = descriptor.key();
    registry.update_providers(
        key.clone(),
        vec![provider(flaky, &key), provider(healthy, &key)],
    );

    let mut opt = Opt::default();
    opt.select_mode = SelectMode::RoundRobin;
    opt.reconnect_delay = Duration::from_millis(50);

    let dubbo = build_dubbo(registry, opt, descriptor);
    let echo = dubbo.service("echo").unwrap();
    for i in 0..4 {
        let reply = echo.invoke("say", vec![json!(i)]).await.unwrap();
        assert_eq!(json!(i), reply);
    }
}

#[tokio::test]
async fn address_removal_drains_pending_requests() {
    let addr = spawn_provider(Behavior::Ignore).await;
    let registry = Arc::new(StaticRegistry::new());
    let descriptor = echo_descriptor();
    let key = descriptor.key();
    registry.update_providers(key.clone(), vec![provider(addr, &key)]);

    let mut opt = Opt::default();
    opt.retry = 1;
    opt.invoke_timeout = Duration::from_secs(5);

    let dubbo = Arc::new(build_dubbo(registry.clone(), opt, descriptor));

    let mut calls = Vec::new();
    for i in 0..3 {
        let dubbo = dubbo.clone();
        calls.push(tokio::spawn(async move {
            dubbo
                .service("echo")
                .unwrap()
                .invoke("say", vec![json!(i)])
                .await
        }));
    }

    // let all three reach the provider's pending map, then drop the address
    tokio::time::sleep(Duration::from_millis(300)).await;
    registry.update_providers(key.clone(), vec![]);

    let started = Instant::now();
    for call in calls {
        let result = call.await.unwrap();
        let err = result.unwrap_err();
        assert_eq!(ErrorKind::Connection, err.kind());
    }
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn late_response_keeps_the_timeout_outcome() {
    let addr = spawn_provider(Behavior::DelayReply(400)).await;
    let registry = Arc::new(StaticRegistry::new());
    let descriptor = echo_descriptor();
    let key = descriptor.key();
    registry.update_providers(key.clone(), vec![provider(addr, &key)]);

    let mut opt = Opt::default();
    opt.invoke_timeout = Duration::from_millis(100);

    let dubbo = build_dubbo(registry, opt, descriptor);
    let err = dubbo
        .service("echo")
        .unwrap()
        .invoke("say", vec![json!("hi")])
        .await
        .unwrap_err();
    assert_eq!(ErrorKind::Timeout, err.kind());

    // the delayed reply arrives after the timeout and must be discarded
    // without disturbing anything
    tokio::time::sleep(Duration::from_millis(500)).await;
}

#[tokio::test]
async fn heartbeat_misses_fail_the_connection() {
    let addr = spawn_provider(Behavior::Deaf).await;
    let registry = Arc::new(StaticRegistry::new());
    let descriptor = echo_descriptor();
    let key = descriptor.key();
    registry.update_providers(key.clone(), vec![provider(addr, &key)]);

    let mut opt = Opt::default();
    opt.retry = 1;
    opt.invoke_timeout = Duration::from_secs(5);
    opt.heartbeat_interval = Duration::from_millis(50);
    opt.heartbeat_miss_threshold = 2;

    let dubbo = build_dubbo(registry, opt, descriptor);
    let started = Instant::now();
    let err = dubbo
        .service("echo")
        .unwrap()
        .invoke("say", vec![json!("hi")])
        .await
        .unwrap_err();

    assert_eq!(ErrorKind::Connection, err.kind());
    assert!(started.elapsed() < Duration::from_secs(3));
}

struct Tag {
    name: &'static str,
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Middleware for Tag {
    async fn invoke(&self, ctx: &mut Context, next: Next<'_>) -> dubbo::Result<()> {
        self.log
            .lock()
            .unwrap()
            .push(format!("{}-before", self.name));
        let rt = next.run(ctx).await;
        self.log
            .lock()
            .unwrap()
            .push(format!("{}-after", self.name));
        rt
    }
}

#[tokio::test]
async fn middleware_wraps_a_live_call_in_order() {
    let addr = spawn_provider(Behavior::Echo).await;
    let registry = Arc::new(StaticRegistry::new());
    let descriptor = echo_descriptor();
    let key = descriptor.key();
    registry.update_providers(key.clone(), vec![provider(addr, &key)]);

    let dubbo = build_dubbo(registry, Opt::default(), descriptor);
    let log = Arc::new(Mutex::new(Vec::new()));
    dubbo.use_middleware(Tag {
        name: "A",
        log: log.clone(),
    });
    dubbo.use_middleware(Tag {
        name: "B",
        log: log.clone(),
    });

    let reply = dubbo
        .service("echo")
        .unwrap()
        .invoke("say", vec![json!("hi")])
        .await
        .unwrap();
    assert_eq!(json!("hi"), reply);
    assert_eq!(
        vec!["A-before", "B-before", "B-after", "A-after"],
        *log.lock().unwrap()
    );
}
