//! Loopback port utilities.

use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};

/// Ask the OS for a free loopback port.
///
/// The listener is dropped before returning, so a race with another
/// allocator is possible but harmless at desktop scale: the subsequent
/// bind simply fails and the caller retries the whole operation.
pub async fn alloc_free_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    Ok(listener.local_addr()?.port())
}

/// Poll until something accepts TCP connections on `port`.
pub async fn wait_for_port(port: u16, timeout: Duration, interval: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(interval).await;
    }
}

/// One-shot probe: is anything listening on `port` right now?
pub async fn port_open(port: u16) -> bool {
    TcpStream::connect(("127.0.0.1", port)).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_alloc_free_port_is_connectable_when_bound() {
        let port = alloc_free_port().await.unwrap();
        assert!(port > 0);
        // Nothing is listening after allocation.
        assert!(!port_open(port).await);

        let _listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        assert!(port_open(port).await);
    }

    #[tokio::test]
    async fn test_wait_for_port_success() {
        let port = alloc_free_port().await.unwrap();
        let _listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        assert!(
            wait_for_port(port, Duration::from_secs(1), Duration::from_millis(10)).await
        );
    }

    #[tokio::test]
    async fn test_wait_for_port_timeout() {
        let port = alloc_free_port().await.unwrap();
        let start = std::time::Instant::now();
        assert!(
            !wait_for_port(port, Duration::from_millis(100), Duration::from_millis(20)).await
        );
        assert!(start.elapsed() >= Duration::from_millis(100));
    }
}
