//! WebSocket transport behind two small traits so sessions can be driven by
//! any text-frame duplex.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMsg;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// Write half. Implementations need not tolerate concurrent writers; the
/// session serializes access.
#[async_trait]
pub trait FrameSink: Send {
    async fn send_text(&mut self, text: String) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// Read half yielding text frames.
#[async_trait]
pub trait FrameSource: Send {
    /// `None` once the remote end has closed the connection.
    async fn next_text(&mut self) -> Option<Result<String>>;
}

/// Everything needed to open the gateway connection.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub url: String,
    pub cookie: String,
    pub user_agent: String,
    pub origin: String,
    pub host: String,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        request: &TransportRequest,
    ) -> Result<(Box<dyn FrameSink>, Box<dyn FrameSource>)>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Production connector built on `tokio-tungstenite`.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(
        &self,
        request: &TransportRequest,
    ) -> Result<(Box<dyn FrameSink>, Box<dyn FrameSource>)> {
        let mut ws_request = request
            .url
            .as_str()
            .into_client_request()
            .with_context(|| format!("invalid WebSocket url {}", request.url))?;
        let headers = ws_request.headers_mut();
        headers.insert(
            "Cookie",
            HeaderValue::from_str(&request.cookie).context("cookie is not a valid header value")?,
        );
        headers.insert("User-Agent", HeaderValue::from_str(&request.user_agent)?);
        headers.insert("Origin", HeaderValue::from_str(&request.origin)?);
        headers.insert("Host", HeaderValue::from_str(&request.host)?);
        headers.insert("Accept-Language", HeaderValue::from_static("zh-CN,zh;q=0.9"));
        headers.insert("Cache-Control", HeaderValue::from_static("no-cache"));
        headers.insert("Pragma", HeaderValue::from_static("no-cache"));

        let (ws_stream, _) = tokio_tungstenite::connect_async(ws_request).await?;
        let (write, read) = ws_stream.split();
        Ok((Box::new(WsSink { write }), Box::new(WsSource { read })))
    }
}

struct WsSink {
    write: SplitSink<WsStream, WsMsg>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.write.send(WsMsg::Text(text.into())).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.write.close().await?;
        Ok(())
    }
}

struct WsSource {
    read: SplitStream<WsStream>,
}

#[async_trait]
impl FrameSource for WsSource {
    async fn next_text(&mut self) -> Option<Result<String>> {
        loop {
            match self.read.next().await? {
                Ok(WsMsg::Text(text)) => return Some(Ok(text.as_str().to_string())),
                Ok(WsMsg::Binary(bytes)) => {
                    return Some(Ok(String::from_utf8_lossy(&bytes).into_owned()))
                }
                Ok(WsMsg::Close(_)) => return None,
                // Pings are answered by tungstenite on the next write
                Ok(_) => continue,
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    #[tokio::test]
    async fn ws_connector_sends_identity_headers_and_text_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (seen_tx, seen_rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut seen = None;
            let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                seen = Some((
                    req.headers()["cookie"].to_str().unwrap().to_string(),
                    req.headers()["origin"].to_str().unwrap().to_string(),
                ));
                Ok(resp)
            };
            let mut ws = tokio_tungstenite::accept_hdr_async(stream, callback)
                .await
                .unwrap();
            let _ = seen_tx.send(seen);
            if let Some(Ok(msg)) = ws.next().await {
                ws.send(msg).await.unwrap();
            }
            ws.close(None).await.ok();
        });

        let request = TransportRequest {
            url: format!("ws://{addr}/"),
            cookie: "unb=1001; _m_h5_tk=abc_1".into(),
            user_agent: "test-agent".into(),
            origin: "https://www.goofish.com".into(),
            host: addr.to_string(),
        };
        let (mut sink, mut source) = WsConnector.connect(&request).await.unwrap();
        sink.send_text("{\"lwp\":\"/!\"}".into()).await.unwrap();
        let echoed = source.next_text().await.unwrap().unwrap();
        assert_eq!(echoed, "{\"lwp\":\"/!\"}");
        assert!(source.next_text().await.is_none());

        let (cookie, origin) = seen_rx.await.unwrap().unwrap();
        assert_eq!(cookie, "unb=1001; _m_h5_tk=abc_1");
        assert_eq!(origin, "https://www.goofish.com");
    }
}
