use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{
    BodyExt,
    Full,
};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{
    Method,
    Request,
    Response,
    StatusCode,
};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{
    debug,
    info,
    warn,
};

use crate::rpc::handlers::{
    handle_json_rpc_request,
    RpcContext,
};
use crate::rpc::protocol::{
    error_codes,
    JsonRpcRequest,
    JsonRpcResponse,
};

/// Serves the JSON-RPC surface on a loopback address until cancelled.
///
/// `POST /rpc` carries JSON-RPC requests; `GET /health` answers liveness
/// probes.
pub async fn serve(
    addr: SocketAddr, ctx: Arc<RpcContext>, cancel: CancellationToken,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("RPC server listening on http://{addr}");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, remote_addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "failed to accept RPC connection");
                        continue;
                    }
                };
                let io = TokioIo::new(stream);
                let ctx = Arc::clone(&ctx);

                tokio::spawn(async move {
                    let service = service_fn(move |request| {
                        let ctx = Arc::clone(&ctx);
                        async move { handle_http_request(request, ctx).await }
                    });

                    if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                        debug!(%remote_addr, error = %err, "error serving RPC connection");
                    }
                });
            }
        }
    }

    info!("RPC server stopped");
    Ok(())
}

async fn handle_http_request(
    request: Request<Incoming>, ctx: Arc<RpcContext>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    match (request.method().clone(), request.uri().path()) {
        (Method::POST, "/rpc") => Ok(handle_rpc_post(request, &ctx).await),
        (Method::GET, "/health") => Ok(json_response(
            StatusCode::OK,
            &serde_json::json!({"status": "ok"}),
        )),
        _ => Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from_static(b"not found")))
            .unwrap()),
    }
}

async fn handle_rpc_post(request: Request<Incoming>, ctx: &RpcContext) -> Response<Full<Bytes>> {
    let body = match request.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return rpc_response(&JsonRpcResponse::error(
                None,
                error_codes::PARSE_ERROR,
                format!("failed to read body: {e}"),
            ));
        }
    };

    let rpc_request: JsonRpcRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return rpc_response(&JsonRpcResponse::error(
                None,
                error_codes::PARSE_ERROR,
                format!("invalid JSON: {e}"),
            ));
        }
    };

    let response = handle_json_rpc_request(rpc_request, ctx).await;
    rpc_response(&response)
}

fn rpc_response(response: &JsonRpcResponse) -> Response<Full<Bytes>> {
    let body = serde_json::to_vec(response).unwrap_or_default();
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}

fn json_response(status: StatusCode, value: &serde_json::Value) -> Response<Full<Bytes>> {
    let body = serde_json::to_vec(value).unwrap_or_default();
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}
