use std::pin::Pin;

use anyhow::{Context, Error, Result};
use futures::{
    future::{self, BoxFuture},
    stream::BoxStream,
    FutureExt, Sink, SinkExt, StreamExt,
};
use tokio_tungstenite::tungstenite::Message;

pub type OutboundSink = Pin<Box<dyn Sink<String, Error = Error> + Send>>;
pub type InboundStream = BoxStream<'static, Result<String>>;

/// An established text channel: JSON goes out through `sink`, service
/// messages arrive on `stream` in receipt order.
pub struct Connection {
    pub sink: OutboundSink,
    pub stream: InboundStream,
}

/// Opens connections to the detection service.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Connection>>;
}

/// WebSocket transport backed by `tokio-tungstenite`.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

impl Connector for WebSocketConnector {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Connection>> {
        let url = url.to_string();
        async move {
            let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str())
                .await
                .with_context(|| format!("failed to connect to {url}"))?;
            let (write, read) = ws_stream.split();

            let sink = write
                .sink_map_err(Error::from)
                .with(|text: String| future::ready(Ok::<_, Error>(Message::Text(text))));

            // Only text frames carry protocol messages; pings and binary
            // frames are dropped here.
            let stream = read.filter_map(|frame| {
                future::ready(match frame {
                    Ok(Message::Text(text)) => Some(Ok(text)),
                    Ok(_) => None,
                    Err(err) => Some(Err(Error::from(err))),
                })
            });

            Ok(Connection {
                sink: Box::pin(sink),
                stream: stream.boxed(),
            })
        }
        .boxed()
    }
}
