//! Full stack: TCP transport, application layer and RPC dispatch.

use async_trait::async_trait;
use bytes::Bytes;
use mq_rpc::{RemoteError, RpcError, RpcSession, Service};
use mq_session::{
    AppConfig, AppListener, AppTransport, Connector, Listener, Security, Session, SessionRef,
    TcpTransport,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

struct Arith;

#[async_trait]
impl Service for Arith {
    async fn call(&self, method_id: u32, args: Bytes) -> Result<Bytes, RemoteError> {
        let value = u64::from_be_bytes(
            args[..]
                .try_into()
                .map_err(|_| RemoteError::failure("expected 8 bytes"))?,
        );
        let result = match method_id {
            1 => value * 2,
            2 => {
                // Slow path so concurrent calls complete out of order
                tokio::time::sleep(Duration::from_millis(value % 20)).await;
                value + 1
            }
            3 => return Err(RemoteError::failure(format!("refusing {}", value))),
            other => return Err(RemoteError::unknown_method(other)),
        };
        Ok(Bytes::copy_from_slice(&result.to_be_bytes()))
    }
}

fn decode(bytes: &Bytes) -> u64 {
    u64::from_be_bytes(bytes[..].try_into().unwrap())
}

fn config(address: &str) -> AppConfig {
    AppConfig {
        address: address.to_string(),
        buffer_size: 4096,
        send_timeout_ms: 5000,
        ..AppConfig::default()
    }
}

async fn start_server(security: Security) -> Arc<AppListener> {
    let config = config("127.0.0.1:0");
    let tcp = TcpTransport::new(config.clone()).unwrap();
    let transport = AppTransport::new(Arc::new(tcp), config.clone(), security);

    let listener = transport.listener(Arc::new(move |session: SessionRef| {
        let rpc = RpcSession::attach(session, &config);
        rpc.serve("arith", Arc::new(Arith));
    }));
    listener.start().await.unwrap();
    listener
}

async fn connect(listener: &AppListener, security: Security) -> (RpcSession, SessionRef) {
    let addr = listener.local_addr().unwrap();
    let config = config(&addr.to_string());
    let tcp = TcpTransport::new(config.clone()).unwrap();
    let connector = AppTransport::new(Arc::new(tcp), config.clone(), security)
        .connector(Arc::new(|_| {}));
    let session = timeout(Duration::from_secs(5), connector.connect())
        .await
        .unwrap()
        .unwrap();
    (RpcSession::attach(session.clone(), &config), session)
}

#[tokio::test]
async fn test_concurrent_calls_do_not_cross_deliver() {
    let listener = start_server(Security::Transparent).await;
    let (rpc, _session) = connect(&listener, Security::Transparent).await;
    let proxy = rpc.register_proxy("arith").unwrap();

    let calls = (0..64u64).map(|i| {
        let proxy = proxy.clone();
        tokio::spawn(async move {
            let reply = proxy
                .call(2, Bytes::copy_from_slice(&i.to_be_bytes()))
                .await
                .unwrap();
            (i, decode(&reply))
        })
    });
    let results = futures::future::join_all(calls).await;

    for result in results {
        let (sent, got) = result.unwrap();
        assert_eq!(got, sent + 1);
    }
    assert_eq!(rpc.pending_calls(), 0);
}

#[tokio::test]
async fn test_remote_errors_propagate() {
    let listener = start_server(Security::Transparent).await;
    let (rpc, _session) = connect(&listener, Security::Transparent).await;
    let proxy = rpc.register_proxy("arith").unwrap();

    let reply = proxy
        .call(1, Bytes::copy_from_slice(&21u64.to_be_bytes()))
        .await
        .unwrap();
    assert_eq!(decode(&reply), 42);

    match proxy.call(3, Bytes::copy_from_slice(&7u64.to_be_bytes())).await {
        Err(RpcError::Remote(remote)) => {
            assert_eq!(remote.code, RemoteError::SERVICE_FAILURE);
            assert_eq!(remote.message, "refusing 7");
        }
        other => panic!("expected remote error, got {:?}", other),
    }

    match proxy.call(99, Bytes::copy_from_slice(&0u64.to_be_bytes())).await {
        Err(RpcError::Remote(remote)) => assert_eq!(remote.code, RemoteError::UNKNOWN_METHOD),
        other => panic!("expected remote error, got {:?}", other),
    }

    let missing = rpc.register_proxy("geometry").unwrap();
    match missing.call(1, Bytes::new()).await {
        Err(RpcError::Remote(remote)) => assert_eq!(remote.code, RemoteError::UNKNOWN_SERVICE),
        other => panic!("expected remote error, got {:?}", other),
    }

    // The session survives remote failures
    let reply = proxy
        .call(1, Bytes::copy_from_slice(&5u64.to_be_bytes()))
        .await
        .unwrap();
    assert_eq!(decode(&reply), 10);
}

#[tokio::test]
async fn test_server_side_disconnect_fails_client_calls() {
    let listener = start_server(Security::Transparent).await;
    let (rpc, session) = connect(&listener, Security::Transparent).await;
    let proxy = rpc.register_proxy("arith").unwrap();
    proxy
        .call(1, Bytes::copy_from_slice(&1u64.to_be_bytes()))
        .await
        .unwrap();

    for server_session in listener.sessions() {
        server_session.disconnect();
    }

    timeout(Duration::from_secs(5), async {
        while session.is_connected() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    assert!(matches!(
        proxy.call(1, Bytes::copy_from_slice(&1u64.to_be_bytes())).await,
        Err(RpcError::Disconnected)
    ));
    assert!(matches!(rpc.register_proxy("arith"), Err(RpcError::Disconnected)));
}

#[tokio::test]
async fn test_stopping_listener_keeps_sessions() {
    let listener = start_server(Security::Transparent).await;
    let (rpc, _session) = connect(&listener, Security::Transparent).await;
    let proxy = rpc.register_proxy("arith").unwrap();

    listener.stop().await;
    assert!(!listener.is_listening());

    let reply = proxy
        .call(1, Bytes::copy_from_slice(&4u64.to_be_bytes()))
        .await
        .unwrap();
    assert_eq!(decode(&reply), 8);
}

#[cfg(feature = "tls")]
#[tokio::test]
async fn test_rpc_over_mutual_tls() -> anyhow::Result<()> {
    use mq_session::{make_client_config, make_server_config, TlsSettings};

    const CA: &str = include_str!("../../session/tests/fixtures/ca.pem");
    const SERVER_CERT: &str = include_str!("../../session/tests/fixtures/server.pem");
    const SERVER_KEY: &str = include_str!("../../session/tests/fixtures/server.key");
    const CLIENT_CERT: &str = include_str!("../../session/tests/fixtures/client.pem");
    const CLIENT_KEY: &str = include_str!("../../session/tests/fixtures/client.key");

    let server_security = Security::Tls(TlsSettings::server(make_server_config(
        SERVER_CERT,
        SERVER_KEY,
        Some(CA),
    )?));
    let listener = start_server(server_security).await;

    let client_security = Security::Tls(TlsSettings::client(
        make_client_config(CA, Some((CLIENT_CERT, CLIENT_KEY)))?,
        "localhost",
    )?);
    let (rpc, _session) = connect(&listener, client_security).await;
    let proxy = rpc.register_proxy("arith")?;

    // Larger than one buffer so the frame spans several TLS records
    let big = Bytes::from(vec![7u8; 10_000]);
    match proxy.call(1, big).await {
        Err(RpcError::Remote(remote)) => assert_eq!(remote.code, RemoteError::SERVICE_FAILURE),
        other => panic!("expected remote error, got {:?}", other),
    }

    let reply = proxy.call(1, Bytes::copy_from_slice(&50u64.to_be_bytes())).await?;
    assert_eq!(decode(&reply), 100);
    Ok(())
}
