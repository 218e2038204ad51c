//! Direct and HTTP CONNECT dialing

use crate::retry::{with_retry, RetryPolicy};
use base64::Engine;
use pipetun_proto::Endpoint;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

/// How long the proxy may take to answer a CONNECT request
const PROXY_RESPONSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Upper bound on the CONNECT response header
const MAX_PROXY_RESPONSE: usize = 8 * 1024;

/// Pause between two dial attempts
const DIAL_BACKOFF: Duration = Duration::from_millis(500);

/// Errors that can occur while dialing a target
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Failed to connect to {address}: {source}")]
    ConnectionFailed {
        address: String,
        source: std::io::Error,
    },

    #[error("Connection to {address} timed out after {timeout:?}")]
    Timeout { address: String, timeout: Duration },

    #[error("Proxy {proxy} refused to tunnel to {target}: {response}")]
    Proxy {
        proxy: String,
        target: String,
        response: String,
    },

    #[error("IO error while talking to proxy: {0}")]
    Io(#[from] std::io::Error),
}

impl ConnectError {
    pub fn is_proxy_error(&self) -> bool {
        matches!(self, ConnectError::Proxy { .. })
    }
}

/// Basic credentials presented to the edge proxy
#[derive(Clone, PartialEq, Eq)]
pub struct ProxyCredentials {
    pub user: String,
    pub token: String,
}

impl ProxyCredentials {
    pub fn new(user: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            token: token.into(),
        }
    }

    /// Value of the `Proxy-Authorization` header
    pub fn header_value(&self) -> String {
        let encoded = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", self.user, self.token));
        format!("Basic {}", encoded)
    }
}

impl std::fmt::Debug for ProxyCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyCredentials")
            .field("user", &self.user)
            .field("token", &"***")
            .finish()
    }
}

async fn dial(address: &Endpoint, connect_timeout: Duration) -> Result<TcpStream, ConnectError> {
    let target = address.to_string();
    match timeout(
        connect_timeout,
        TcpStream::connect((address.host.as_str(), address.port)),
    )
    .await
    {
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            Ok(stream)
        }
        Ok(Err(source)) => Err(ConnectError::ConnectionFailed {
            address: target,
            source,
        }),
        Err(_) => Err(ConnectError::Timeout {
            address: target,
            timeout: connect_timeout,
        }),
    }
}

/// Open a raw socket to `target`
pub async fn direct_connect(
    target: &Endpoint,
    connect_timeout: Duration,
    retries: usize,
) -> Result<TcpStream, ConnectError> {
    with_retry(RetryPolicy::retries(retries, DIAL_BACKOFF), |attempt| async move {
        trace!(target = %target, attempt, "Dialing directly");
        dial(target, connect_timeout).await
    })
    .await
}

/// Open a socket to `target` through an HTTP CONNECT tunnel on `proxy`
///
/// The whole exchange, dial included, is retried on failure.
pub async fn proxy_connect(
    proxy: &Endpoint,
    target: &Endpoint,
    credentials: &ProxyCredentials,
    connect_timeout: Duration,
    retries: usize,
) -> Result<TcpStream, ConnectError> {
    with_retry(RetryPolicy::retries(retries, DIAL_BACKOFF), |attempt| async move {
        trace!(proxy = %proxy, target = %target, attempt, "Dialing through proxy");
        let mut stream = dial(proxy, connect_timeout).await?;
        establish_tunnel(&mut stream, proxy, target, credentials).await?;
        Ok::<_, ConnectError>(stream)
    })
    .await
}

/// Issue the CONNECT request on an open proxy socket
///
/// On failure the caller drops the socket, which closes it.
async fn establish_tunnel(
    stream: &mut TcpStream,
    proxy: &Endpoint,
    target: &Endpoint,
    credentials: &ProxyCredentials,
) -> Result<(), ConnectError> {
    let request = format!(
        "CONNECT {target} HTTP/1.0\r\nProxy-Authorization: {}\r\n\r\n",
        credentials.header_value()
    );
    stream.write_all(request.as_bytes()).await?;

    let response = read_response_head(stream).await?;
    if !response
        .to_ascii_lowercase()
        .contains("200 connection established")
    {
        return Err(ConnectError::Proxy {
            proxy: proxy.to_string(),
            target: target.to_string(),
            response: response.lines().next().unwrap_or_default().to_string(),
        });
    }

    debug!(proxy = %proxy, target = %target, "Proxy tunnel established");
    Ok(())
}

/// Read the proxy response head byte by byte so no payload is consumed
///
/// Stops at `\r\n\r\n`, at EOF, or when the proxy goes quiet for longer than
/// the response timeout.
async fn read_response_head(stream: &mut TcpStream) -> Result<String, ConnectError> {
    let mut head = Vec::with_capacity(128);
    let mut byte = [0u8; 1];

    while !head.ends_with(b"\r\n\r\n") && head.len() < MAX_PROXY_RESPONSE {
        match timeout(PROXY_RESPONSE_TIMEOUT, stream.read(&mut byte)).await {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(_)) => head.push(byte[0]),
            Ok(Err(e)) => return Err(ConnectError::Io(e)),
        }
    }

    Ok(String::from_utf8_lossy(&head).into_owned())
}

/// How relays reach their remote side
#[derive(Debug, Clone)]
pub enum Route {
    Direct,
    Proxy {
        proxy: Endpoint,
        credentials: ProxyCredentials,
    },
}

/// Dialing configuration shared by every pairing of a relay
#[derive(Debug, Clone)]
pub struct Dialer {
    route: Route,
    connect_timeout: Duration,
    retries: usize,
}

impl Dialer {
    pub fn direct(connect_timeout: Duration, retries: usize) -> Self {
        Self {
            route: Route::Direct,
            connect_timeout,
            retries,
        }
    }

    pub fn via_proxy(
        proxy: Endpoint,
        credentials: ProxyCredentials,
        connect_timeout: Duration,
        retries: usize,
    ) -> Self {
        Self {
            route: Route::Proxy { proxy, credentials },
            connect_timeout,
            retries,
        }
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    pub async fn connect(&self, target: &Endpoint) -> Result<TcpStream, ConnectError> {
        match &self.route {
            Route::Direct => direct_connect(target, self.connect_timeout, self.retries).await,
            Route::Proxy { proxy, credentials } => {
                proxy_connect(
                    proxy,
                    target,
                    credentials,
                    self.connect_timeout,
                    self.retries,
                )
                .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_header_value() {
        let creds = ProxyCredentials::new("alice", "token");
        // base64("alice:token")
        assert_eq!(creds.header_value(), "Basic YWxpY2U6dG9rZW4=");
    }

    #[test]
    fn test_credentials_debug_hides_token() {
        let creds = ProxyCredentials::new("alice", "super-secret");
        let debug = format!("{:?}", creds);
        assert!(debug.contains("alice"));
        assert!(!debug.contains("super-secret"));
    }

    #[test]
    fn test_proxy_error_display() {
        let err = ConnectError::Proxy {
            proxy: "edge:8080".to_string(),
            target: "10.0.0.1:22".to_string(),
            response: "HTTP/1.0 403 Forbidden".to_string(),
        };
        assert!(err.is_proxy_error());
        assert!(err.to_string().contains("403"));
    }
}
