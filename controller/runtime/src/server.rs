use anyhow::Result;
use hyper::{body::Incoming, Request, Response};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
    service::TowerToHyperService,
};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{debug, debug_span, info, instrument, warn, Instrument};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Serves `svc` on `addr` until the drain signal fires.
///
/// Open connections are shut down gracefully and hold the drain until their
/// in-flight requests complete.
#[instrument(skip_all, fields(%name, port = %addr.port()))]
pub async fn serve<S, B>(
    name: &'static str,
    addr: SocketAddr,
    svc: S,
    drain: drain::Watch,
) -> Result<()>
where
    S: tower::Service<Request<Incoming>, Response = Response<B>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<BoxError>,
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<BoxError>,
{
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "{name} server listening");
    accept(listener, svc, drain).await;
    Ok(())
}

pub(crate) async fn accept<S, B>(listener: TcpListener, svc: S, drain: drain::Watch)
where
    S: tower::Service<Request<Incoming>, Response = Response<B>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<BoxError>,
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<BoxError>,
{
    let signaled = drain.clone().signaled();
    tokio::pin!(signaled);

    loop {
        let (io, client) = tokio::select! {
            res = listener.accept() => match res {
                Ok(conn) => conn,
                Err(error) => {
                    warn!(%error, "Failed to accept connection");
                    continue;
                }
            },
            handle = &mut signaled => {
                debug!("Stopped accepting connections");
                drop(handle);
                return;
            }
        };

        let svc = TowerToHyperService::new(svc.clone());
        let drain = drain.clone();
        tokio::spawn(
            async move {
                let builder = auto::Builder::new(TokioExecutor::new());
                let conn = builder.serve_connection(TokioIo::new(io), svc);
                tokio::pin!(conn);
                let res = tokio::select! {
                    res = conn.as_mut() => res,
                    handle = drain.signaled() => {
                        conn.as_mut().graceful_shutdown();
                        handle.release_after(conn).await
                    }
                };
                if let Err(error) = res {
                    debug!(%error, "Connection closed");
                }
            }
            .instrument(debug_span!("conn", %client)),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http_body_util::{BodyExt, Empty, Full};
    use hyper_util::client::legacy::Client;
    use std::convert::Infallible;

    #[tokio::test]
    async fn serves_until_drained() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let svc = tower::service_fn(|req: Request<Incoming>| async move {
            let body = Full::new(Bytes::from(req.uri().path().to_string()));
            Ok::<_, Infallible>(Response::new(body))
        });

        let (signal, drain) = drain::channel();
        let server = tokio::spawn(accept(listener, svc, drain));

        let client = Client::builder(TokioExecutor::new()).build_http::<Empty<Bytes>>();
        let rsp = client
            .get(format!("http://{addr}/ping").parse().unwrap())
            .await
            .unwrap();
        let body = rsp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, "/ping");
        drop(client);

        signal.drain().await;
        server.await.unwrap();
    }
}
