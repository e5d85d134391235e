use anyhow::Error;
use bytes::Bytes;
use http::{header, uri::Authority, HeaderValue, Request, StatusCode};
use http_body_util::{BodyExt, Empty};
use hyper::client::conn::http1::{self, SendRequest};
use tokio::{net::TcpStream, task::JoinHandle};

use super::io::TokioIo;
use crate::cfg::Target;

/// What is left of a response once its body has been drained.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: StatusCode,
    pub location: Option<HeaderValue>,
    /// The server is going to close the connection.
    pub close: bool,
}

/// Keep-alive HTTP/1.1 connection to a single authority.
///
/// The connection is driven by a task on the current runtime, which is
/// aborted when this handle is dropped.
#[derive(Debug)]
pub struct Connection {
    authority: Authority,
    sender: SendRequest<Empty<Bytes>>,
    driver: JoinHandle<()>,
}

impl Connection {
    pub async fn open(target: &Target) -> Result<Self, Error> {
        let stream = TcpStream::connect((target.host(), target.port())).await?;
        stream.set_nodelay(true)?;

        let io = TokioIo::new(stream);
        let (sender, conn) = http1::handshake(io).await?;
        let driver = tokio::spawn(async move {
            if let Err(err) = conn.await {
                log::debug!("connection failed: {err}");
            }
        });

        let m = Self {
            authority: target.authority().clone(),
            sender,
            driver,
        };

        Ok(m)
    }

    /// Returns `true` if requests to the given target may reuse this
    /// connection.
    #[inline]
    pub fn serves(&self, target: &Target) -> bool {
        &self.authority == target.authority()
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Waits until the connection is able to send a request.
    pub async fn ready(&mut self) -> Result<(), Error> {
        self.sender.ready().await?;
        Ok(())
    }

    /// Sends the request and reads the whole response.
    pub async fn exchange(&mut self, request: Request<Empty<Bytes>>) -> Result<Response, Error> {
        let mut resp = self.sender.send_request(request).await?;

        let status = resp.status();
        let location = resp.headers().get(header::LOCATION).cloned();
        let close = resp
            .headers()
            .get_all(header::CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|v| v.trim().eq_ignore_ascii_case("close"));

        while let Some(next) = resp.frame().await {
            next?;
        }

        Ok(Response { status, location, close })
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.driver.abort();
    }
}
